//! Learned captive portal patterns
//!
//! Remembers how each SSID's portal behaved so later sessions can skip page
//! analysis once an authentication method has actually worked there.

use crate::error::Result;
use crate::modules::captive_portal::{AuthMethod, PortalAnalysis, PortalType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One portal seen on an SSID, keyed by `(ssid, redirect_domain)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalPattern {
    pub ssid: String,
    pub redirect_domain: String,
    pub landing_url: Option<String>,
    pub portal_type: PortalType,
    pub auth_method: AuthMethod,
    pub success_count: u32,
    pub failure_count: u32,
    pub last_seen: DateTime<Utc>,
}

impl PortalPattern {
    pub fn from_analysis(ssid: &str, redirect_domain: &str, analysis: &PortalAnalysis) -> Self {
        Self {
            ssid: ssid.to_string(),
            redirect_domain: redirect_domain.to_string(),
            landing_url: analysis.redirect_url.clone(),
            portal_type: analysis.portal_type.clone(),
            auth_method: analysis.auth_method,
            success_count: 0,
            failure_count: 0,
            last_seen: Utc::now(),
        }
    }

    /// Automatable, and has opened more often than it has refused
    pub fn is_proven(&self) -> bool {
        self.auth_method != AuthMethod::ManualRequired && self.success_count > self.failure_count
    }
}

#[async_trait::async_trait]
pub trait PortalPatternStore: Send + Sync {
    /// Insert or refresh a pattern. Counters of an existing entry are kept.
    async fn store_pattern(&self, pattern: &PortalPattern) -> Result<()>;

    /// The pattern for `ssid` with the most successful authentications
    async fn get_pattern(&self, ssid: &str) -> Result<Option<PortalPattern>>;

    async fn record_auth_result(&self, ssid: &str, redirect_domain: &str, success: bool) -> Result<()>;
}

/// Volatile pattern store
#[derive(Default)]
pub struct MemoryPortalStore {
    patterns: RwLock<HashMap<(String, String), PortalPattern>>,
}

impl MemoryPortalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PortalPatternStore for MemoryPortalStore {
    async fn store_pattern(&self, pattern: &PortalPattern) -> Result<()> {
        let key = (pattern.ssid.clone(), pattern.redirect_domain.clone());
        let mut patterns = self.patterns.write().await;
        match patterns.get_mut(&key) {
            Some(existing) => {
                existing.landing_url = pattern.landing_url.clone();
                existing.portal_type = pattern.portal_type.clone();
                existing.auth_method = pattern.auth_method;
                existing.last_seen = pattern.last_seen;
            }
            None => {
                patterns.insert(key, pattern.clone());
            }
        }
        Ok(())
    }

    async fn get_pattern(&self, ssid: &str) -> Result<Option<PortalPattern>> {
        Ok(self
            .patterns
            .read()
            .await
            .values()
            .filter(|p| p.ssid == ssid)
            .max_by(|a, b| {
                a.success_count
                    .cmp(&b.success_count)
                    .then(a.last_seen.cmp(&b.last_seen))
            })
            .cloned())
    }

    async fn record_auth_result(&self, ssid: &str, redirect_domain: &str, success: bool) -> Result<()> {
        let key = (ssid.to_string(), redirect_domain.to_string());
        if let Some(pattern) = self.patterns.write().await.get_mut(&key) {
            if success {
                pattern.success_count += 1;
            } else {
                pattern.failure_count += 1;
            }
            pattern.last_seen = Utc::now();
        }
        Ok(())
    }
}

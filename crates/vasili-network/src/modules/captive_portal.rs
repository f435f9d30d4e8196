//! Captive portal detection and automatic acceptance
//!
//! A session moves through
//! `connected -> probing -> analyzed -> authenticating -> verified | failed`.
//! Only portals that want a page visit or a terms form are ever automated;
//! anything asking for credentials, payment, or that cannot be classified
//! with confidence stops at `failed`.
//!
//! With a [`PortalPatternStore`] attached, each portal is remembered per SSID
//! together with how often authenticating against it worked. A method that
//! has worked more often than not is reused without re-reading the page.

use super::{associate, EvaluationModule, SpeedtestModule};
use crate::backend::{ProbeRequest, ProbeResponse, WirelessBackend};
use crate::pool::RadioLease;
use crate::portal_store::{PortalPattern, PortalPatternStore};
use crate::types::{ConnectionAttempt, EncryptionClass, ModuleKind, NetworkObservation};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalState {
    Connected,
    Probing,
    Analyzed,
    Authenticating,
    Verified,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortalType {
    Generic,
    VendorSpecific(String),
}

impl fmt::Display for PortalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortalType::Generic => write!(f, "generic"),
            PortalType::VendorSpecific(vendor) => write!(f, "vendor:{}", vendor),
        }
    }
}

impl PortalType {
    /// Inverse of the `Display` form; anything unrecognised is generic
    pub fn from_label(label: &str) -> Self {
        match label.strip_prefix("vendor:") {
            Some(vendor) if !vendor.is_empty() => PortalType::VendorSpecific(vendor.to_string()),
            _ => PortalType::Generic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ClickThrough,
    TermsAccept,
    ManualRequired,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::ClickThrough => write!(f, "click-through"),
            AuthMethod::TermsAccept => write!(f, "terms-accept"),
            AuthMethod::ManualRequired => write!(f, "manual-required"),
        }
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "click-through" => Ok(AuthMethod::ClickThrough),
            "terms-accept" => Ok(AuthMethod::TermsAccept),
            "manual-required" => Ok(AuthMethod::ManualRequired),
            other => Err(format!("unknown auth method: {}", other)),
        }
    }
}

/// What analysis learned about an intercepting portal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalAnalysis {
    pub redirect_url: Option<String>,
    pub domain: Option<String>,
    pub portal_type: PortalType,
    pub auth_method: AuthMethod,
}

/// A well-known URL and the answer it gives on an open internet connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityCheck {
    pub url: String,
    pub expected_status: u16,
    /// Substring the body must contain, if any
    pub expected_body: Option<String>,
}

impl ConnectivityCheck {
    fn new(url: &str, expected_status: u16, expected_body: Option<&str>) -> Self {
        Self {
            url: url.to_string(),
            expected_status,
            expected_body: expected_body.map(str::to_string),
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                "http://captive.apple.com/hotspot-detect.html",
                200,
                Some("<HTML><HEAD><TITLE>Success</TITLE></HEAD><BODY>Success</BODY></HTML>"),
            ),
            Self::new("http://connectivitycheck.gstatic.com/generate_204", 204, None),
            Self::new("http://clients3.google.com/generate_204", 204, None),
            Self::new(
                "http://www.msftconnecttest.com/connecttest.txt",
                200,
                Some("Microsoft Connect Test"),
            ),
        ]
    }

    fn is_clean(&self, response: &ProbeResponse) -> bool {
        response.status == self.expected_status
            && self
                .expected_body
                .as_deref()
                .map_or(true, |expected| response.body.contains(expected))
    }
}

/// Result of running every connectivity check once
#[derive(Debug, Clone, PartialEq)]
enum ProbeVerdict {
    Clean,
    /// Redirected (with target) or answered with unexpected content
    Intercepted {
        redirect_url: Option<String>,
        body: String,
    },
    Unreachable(String),
}

/// Record of one captive portal evaluation
#[derive(Debug, Clone, Serialize)]
pub struct PortalSession {
    history: Vec<PortalState>,
    pub portal_detected: bool,
    pub analysis: Option<PortalAnalysis>,
    pub failure: Option<String>,
}

impl PortalSession {
    fn new() -> Self {
        Self {
            history: Vec::new(),
            portal_detected: false,
            analysis: None,
            failure: None,
        }
    }

    fn advance(&mut self, state: PortalState) {
        debug!("Portal session -> {:?}", state);
        self.history.push(state);
    }

    fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
        self.advance(PortalState::Failed);
    }

    /// Current state; `None` before association succeeded
    pub fn state(&self) -> Option<PortalState> {
        self.history.last().copied()
    }

    /// Every state the session passed through, in order
    pub fn history(&self) -> &[PortalState] {
        &self.history
    }

    pub fn reached(&self, state: PortalState) -> bool {
        self.history.contains(&state)
    }
}

const VENDOR_DOMAINS: &[(&str, &str)] = &[
    ("captive.apple", "apple"),
    ("gstatic", "google"),
    ("google", "google"),
    ("msftconnecttest", "microsoft"),
    ("microsoft", "microsoft"),
    ("wifi.id", "wifi.id"),
    ("fon.com", "fon"),
    ("hotspotsystem", "hotspotsystem"),
];

/// Markers that mean a human has to type something or pay
const MANUAL_MARKERS: &[&str] = &[
    "login",
    "log in",
    "sign in",
    "username",
    "password",
    "payment",
    "purchase",
    "credit card",
    "voucher",
    "access code",
    "room number",
];

fn redirect_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Classify a portal from its redirect target and page content.
///
/// Falls back to `manual-required` whenever the page is ambiguous or asks
/// for anything beyond a click or accepting terms.
pub fn analyze(redirect_url: Option<&str>, body: &str) -> PortalAnalysis {
    let domain = redirect_url.and_then(redirect_domain);

    let portal_type = domain
        .as_deref()
        .and_then(|d| {
            VENDOR_DOMAINS
                .iter()
                .find(|(pattern, _)| d.contains(pattern))
                .map(|(_, vendor)| PortalType::VendorSpecific(vendor.to_string()))
        })
        .unwrap_or(PortalType::Generic);

    let text = body.to_ascii_lowercase();
    let auth_method = if domain.is_none() || MANUAL_MARKERS.iter().any(|m| text.contains(m)) {
        AuthMethod::ManualRequired
    } else if text.contains("terms") && text.contains("accept") {
        AuthMethod::TermsAccept
    } else if text.contains("click") && (text.contains("continue") || text.contains("connect")) {
        AuthMethod::ClickThrough
    } else {
        AuthMethod::ManualRequired
    };

    PortalAnalysis {
        redirect_url: redirect_url.map(str::to_string),
        domain,
        portal_type,
        auth_method,
    }
}

/// First `<form ... action="...">` target, resolved against `base`
pub fn extract_form_action(body: &str, base: &str) -> Option<String> {
    let lower = body.to_ascii_lowercase();
    let form_start = lower.find("<form")?;
    let tag_end = form_start + lower[form_start..].find('>')?;
    let tag = &body[form_start..tag_end];
    let tag_lower = &lower[form_start..tag_end];

    let attr = tag_lower.find("action=")? + "action=".len();
    let rest = &tag[attr..];
    let quote = rest.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let value = &rest[1..];
    let action = &value[..value.find(quote)?];

    Url::parse(base).ok()?.join(action).ok().map(|u| u.to_string())
}

pub struct CaptivePortalModule {
    backend: Arc<dyn WirelessBackend>,
    speedtest: Arc<SpeedtestModule>,
    checks: Vec<ConnectivityCheck>,
    patterns: Option<Arc<dyn PortalPatternStore>>,
}

impl CaptivePortalModule {
    pub fn new(backend: Arc<dyn WirelessBackend>, speedtest: Arc<SpeedtestModule>) -> Self {
        Self::with_checks(backend, speedtest, ConnectivityCheck::defaults())
    }

    pub fn with_checks(
        backend: Arc<dyn WirelessBackend>,
        speedtest: Arc<SpeedtestModule>,
        checks: Vec<ConnectivityCheck>,
    ) -> Self {
        Self {
            backend,
            speedtest,
            checks,
            patterns: None,
        }
    }

    /// Remember portals per SSID and reuse methods that worked before
    pub fn with_pattern_store(mut self, patterns: Arc<dyn PortalPatternStore>) -> Self {
        self.patterns = Some(patterns);
        self
    }

    /// A previously successful method for this SSID's current portal
    async fn recall(&self, ssid: &str, redirect_url: Option<&str>) -> Option<PortalAnalysis> {
        let store = self.patterns.as_ref()?;
        let domain = redirect_domain(redirect_url?)?;

        let pattern = match store.get_pattern(ssid).await {
            Ok(pattern) => pattern?,
            Err(e) => {
                debug!("Portal pattern lookup for {} failed: {}", ssid, e);
                return None;
            }
        };
        if pattern.redirect_domain != domain || !pattern.is_proven() {
            return None;
        }

        Some(PortalAnalysis {
            redirect_url: redirect_url.map(str::to_string),
            domain: Some(domain),
            portal_type: pattern.portal_type,
            auth_method: pattern.auth_method,
        })
    }

    async fn remember(&self, ssid: &str, analysis: &PortalAnalysis) {
        let (Some(store), Some(domain)) = (&self.patterns, analysis.domain.as_deref()) else {
            return;
        };
        let pattern = PortalPattern::from_analysis(ssid, domain, analysis);
        if let Err(e) = store.store_pattern(&pattern).await {
            debug!("Could not store portal pattern for {}: {}", ssid, e);
        }
    }

    async fn record_auth(&self, ssid: &str, analysis: &PortalAnalysis, success: bool) {
        let (Some(store), Some(domain)) = (&self.patterns, analysis.domain.as_deref()) else {
            return;
        };
        if let Err(e) = store.record_auth_result(ssid, domain, success).await {
            debug!("Could not record portal result for {}: {}", ssid, e);
        }
    }

    async fn probe_connectivity(&self, interface: &str) -> ProbeVerdict {
        let mut clean = 0;
        let mut last_error = String::from("no connectivity checks configured");

        for check in &self.checks {
            match self.backend.probe(interface, &ProbeRequest::get(&check.url)).await {
                Ok(resp) if resp.is_redirect() => {
                    info!(
                        "Captive portal detected on {}: {} -> {}",
                        interface,
                        check.url,
                        resp.location.as_deref().unwrap_or("<no location>")
                    );
                    return ProbeVerdict::Intercepted {
                        redirect_url: resp.location,
                        body: resp.body,
                    };
                }
                Ok(resp) if check.is_clean(&resp) => clean += 1,
                Ok(resp) => {
                    info!(
                        "Unexpected answer from {} on {} (status {})",
                        check.url, interface, resp.status
                    );
                    return ProbeVerdict::Intercepted {
                        redirect_url: None,
                        body: resp.body,
                    };
                }
                Err(e) => {
                    debug!("Connectivity check {} failed: {}", check.url, e);
                    last_error = e.to_string();
                }
            }
        }

        if clean > 0 {
            ProbeVerdict::Clean
        } else {
            ProbeVerdict::Unreachable(last_error)
        }
    }

    async fn click_through(&self, interface: &str, landing: &str) -> Result<(), String> {
        let resp = self
            .backend
            .probe(interface, &ProbeRequest::get(landing))
            .await
            .map_err(|e| format!("landing page unreachable: {}", e))?;
        if resp.is_success() || resp.is_redirect() {
            Ok(())
        } else {
            Err(format!("landing page returned {}", resp.status))
        }
    }

    async fn accept_terms(&self, interface: &str, landing: &str) -> Result<(), String> {
        let page = self
            .backend
            .probe(interface, &ProbeRequest::get(landing))
            .await
            .map_err(|e| format!("landing page unreachable: {}", e))?;

        let action = extract_form_action(&page.body, landing)
            .ok_or_else(|| "no acceptance form on landing page".to_string())?;

        let form = vec![
            ("accept".to_string(), "1".to_string()),
            ("terms".to_string(), "accepted".to_string()),
            ("continue".to_string(), "1".to_string()),
        ];
        debug!("Posting terms acceptance to {}", action);
        let resp = self
            .backend
            .probe(interface, &ProbeRequest::post_form(&action, form))
            .await
            .map_err(|e| format!("terms submission failed: {}", e))?;

        if resp.is_success() || resp.is_redirect() {
            Ok(())
        } else {
            Err(format!("terms submission returned {}", resp.status))
        }
    }

    /// Measure and finish the session
    async fn verify(
        &self,
        session: &mut PortalSession,
        observation: &NetworkObservation,
        interface: &str,
        started_at: DateTime<Utc>,
    ) -> ConnectionAttempt {
        match self.speedtest.measure(interface).await {
            Ok(metrics) => {
                session.advance(PortalState::Verified);
                ConnectionAttempt::success(self.kind(), observation, interface, started_at, metrics)
            }
            Err(e) => {
                session.fail(format!("speed test failed: {}", e));
                ConnectionAttempt::failed(self.kind(), observation, interface, started_at, e.to_string())
            }
        }
    }

    /// Run the full state machine, returning the session record with the attempt
    pub async fn run_session(
        &self,
        observation: &NetworkObservation,
        lease: &RadioLease,
    ) -> (PortalSession, ConnectionAttempt) {
        let interface = lease.interface();
        let started_at = Utc::now();
        let failed = |reason: String| {
            ConnectionAttempt::failed(self.kind(), observation, interface, started_at, reason)
        };
        let mut session = PortalSession::new();

        if let Err(reason) = associate(self.backend.as_ref(), observation, lease, None).await {
            session.fail(reason.clone());
            return (session, failed(reason));
        }
        session.advance(PortalState::Connected);

        session.advance(PortalState::Probing);
        let (redirect_url, body) = match self.probe_connectivity(interface).await {
            ProbeVerdict::Unreachable(e) => {
                let reason = format!("no connectivity: {}", e);
                session.fail(reason.clone());
                return (session, failed(reason));
            }
            ProbeVerdict::Clean => {
                session.advance(PortalState::Analyzed);
                let attempt = self.verify(&mut session, observation, interface, started_at).await;
                return (session, attempt);
            }
            ProbeVerdict::Intercepted { redirect_url, body } => (redirect_url, body),
        };
        session.portal_detected = true;

        let analysis = match self.recall(&observation.ssid, redirect_url.as_deref()).await {
            Some(known) => {
                info!(
                    "Known portal on {} ({}), using {}",
                    observation.ssid,
                    known.domain.as_deref().unwrap_or("unknown domain"),
                    known.auth_method
                );
                known
            }
            None => {
                let body = self.landing_body(interface, redirect_url.as_deref(), body).await;
                let analysis = analyze(redirect_url.as_deref(), &body);
                info!(
                    "Portal on {} ({}): type {:?}, auth {}",
                    observation.ssid,
                    analysis.domain.as_deref().unwrap_or("unknown domain"),
                    analysis.portal_type,
                    analysis.auth_method
                );
                analysis
            }
        };
        self.remember(&observation.ssid, &analysis).await;
        session.analysis = Some(analysis.clone());
        session.advance(PortalState::Analyzed);

        let landing = match (analysis.auth_method, analysis.redirect_url.as_deref()) {
            (AuthMethod::ManualRequired, _) | (_, None) => {
                let reason = format!("portal on {} requires manual sign-in", observation.ssid);
                warn!("{}", reason);
                session.fail(reason.clone());
                return (session, failed(reason));
            }
            (_, Some(landing)) => landing.to_string(),
        };

        session.advance(PortalState::Authenticating);
        let auth = match analysis.auth_method {
            AuthMethod::ClickThrough => self.click_through(interface, &landing).await,
            AuthMethod::TermsAccept => self.accept_terms(interface, &landing).await,
            AuthMethod::ManualRequired => Err("manual sign-in required".to_string()),
        };
        if let Err(reason) = auth {
            self.record_auth(&observation.ssid, &analysis, false).await;
            session.fail(reason.clone());
            return (session, failed(reason));
        }

        if self.probe_connectivity(interface).await != ProbeVerdict::Clean {
            self.record_auth(&observation.ssid, &analysis, false).await;
            let reason = "portal still intercepting after authentication".to_string();
            session.fail(reason.clone());
            return (session, failed(reason));
        }
        self.record_auth(&observation.ssid, &analysis, true).await;

        let attempt = self.verify(&mut session, observation, interface, started_at).await;
        (session, attempt)
    }

    /// Redirects usually carry no body; read the landing page for analysis
    async fn landing_body(&self, interface: &str, redirect_url: Option<&str>, body: String) -> String {
        match redirect_url {
            Some(url) if body.trim().is_empty() => {
                match self.backend.probe(interface, &ProbeRequest::get(url)).await {
                    Ok(resp) => resp.body,
                    Err(e) => {
                        debug!("Could not fetch portal landing page {}: {}", url, e);
                        String::new()
                    }
                }
            }
            _ => body,
        }
    }
}

#[async_trait::async_trait]
impl EvaluationModule for CaptivePortalModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::CaptivePortal
    }

    fn accepts(&self, observation: &NetworkObservation) -> bool {
        observation.encryption == EncryptionClass::Open && !observation.is_hidden()
    }

    async fn attempt(&self, observation: &NetworkObservation, lease: &RadioLease) -> ConnectionAttempt {
        let (session, attempt) = self.run_session(observation, lease).await;
        debug!("Portal session for {}: {:?}", observation.ssid, session.history());
        attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SimulatedNetwork, SimulatedPortalAuth};
    use crate::modules::test_support::{observation, rig};
    use crate::pool::LeaseEnd;
    use crate::portal_store::MemoryPortalStore;
    use crate::types::AttemptOutcome;
    use std::time::Duration;

    fn module(backend: Arc<crate::backends::SimulatedBackend>) -> CaptivePortalModule {
        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        CaptivePortalModule::new(backend, speedtest)
    }

    fn lobby(body: &str) -> SimulatedNetwork {
        SimulatedNetwork::open("Lobby", "aa", 70)
            .with_speed(25.0, 5.0, 40.0)
            .with_portal(
                "http://portal.lobby.example/welcome",
                body,
                SimulatedPortalAuth::ClickThrough,
            )
    }

    #[test]
    fn test_analyze_click_through() {
        let a = analyze(
            Some("http://portal.example.net/welcome"),
            "<p>Click here to continue browsing</p>",
        );
        assert_eq!(a.auth_method, AuthMethod::ClickThrough);
        assert_eq!(a.portal_type, PortalType::Generic);
        assert_eq!(a.domain.as_deref(), Some("portal.example.net"));
    }

    #[test]
    fn test_analyze_terms_and_vendor() {
        let a = analyze(
            Some("https://login.fon.com/portal"),
            "Please accept the Terms of Service",
        );
        assert_eq!(a.auth_method, AuthMethod::TermsAccept);
        assert_eq!(a.portal_type, PortalType::VendorSpecific("fon".to_string()));
    }

    #[test]
    fn test_analyze_fails_closed() {
        // Credentials win over anything that looks automatable
        let a = analyze(
            Some("http://hotel.example/wifi"),
            "Accept the terms and enter your room number and password",
        );
        assert_eq!(a.auth_method, AuthMethod::ManualRequired);

        let a = analyze(Some("http://shop.example/"), "Purchase 1 hour of access");
        assert_eq!(a.auth_method, AuthMethod::ManualRequired);

        let a = analyze(Some("http://mystery.example/"), "Welcome!");
        assert_eq!(a.auth_method, AuthMethod::ManualRequired);

        // No redirect target means there is nowhere to click
        let a = analyze(None, "click to continue");
        assert_eq!(a.auth_method, AuthMethod::ManualRequired);
    }

    #[test]
    fn test_extract_form_action() {
        let body = r#"<html><FORM method="post" ACTION="/accept">terms</FORM></html>"#;
        assert_eq!(
            extract_form_action(body, "http://portal.example/welcome").as_deref(),
            Some("http://portal.example/accept")
        );
        let body = "<form action='https://other.example/go'>";
        assert_eq!(
            extract_form_action(body, "http://portal.example/").as_deref(),
            Some("https://other.example/go")
        );
        assert_eq!(extract_form_action("<p>no form</p>", "http://portal.example/"), None);
    }

    #[tokio::test]
    async fn test_clean_network_verified_without_auth() {
        let (backend, pool) = rig();
        backend.add_network(SimulatedNetwork::open("CafeWifi", "aa", 80).with_speed(60.0, 20.0, 15.0));
        let module = module(backend.clone());

        let lease = pool.lease(false).unwrap();
        let (session, attempt) = module
            .run_session(&observation("CafeWifi", "aa", 80, EncryptionClass::Open), &lease)
            .await;

        assert!(attempt.is_success());
        assert!(!session.portal_detected);
        assert_eq!(
            session.history(),
            &[
                PortalState::Connected,
                PortalState::Probing,
                PortalState::Analyzed,
                PortalState::Verified
            ]
        );
    }

    #[tokio::test]
    async fn test_click_through_reaches_verified() {
        let (backend, pool) = rig();
        backend.add_network(
            SimulatedNetwork::open("Lobby", "aa", 70)
                .with_speed(25.0, 5.0, 40.0)
                .with_portal(
                    "http://portal.lobby.example/welcome",
                    "<p>Welcome. Click below to continue.</p>",
                    SimulatedPortalAuth::ClickThrough,
                ),
        );
        let module = module(backend.clone());

        let lease = pool.lease(false).unwrap();
        let (session, attempt) = module
            .run_session(&observation("Lobby", "aa", 70, EncryptionClass::Open), &lease)
            .await;

        assert!(session.portal_detected);
        assert_eq!(session.analysis.as_ref().unwrap().auth_method, AuthMethod::ClickThrough);
        assert!(session.reached(PortalState::Authenticating));
        assert_eq!(session.state(), Some(PortalState::Verified));
        assert!(attempt.is_success());
    }

    #[tokio::test]
    async fn test_terms_accept_posts_form() {
        let (backend, pool) = rig();
        backend.add_network(SimulatedNetwork::open("Airport", "aa", 70).with_portal(
            "http://portal.airport.example/terms",
            r#"<form method="post" action="/accept">Accept the terms of use</form>"#,
            SimulatedPortalAuth::TermsAccept,
        ));
        let module = module(backend.clone());

        let lease = pool.lease(false).unwrap();
        let (session, attempt) = module
            .run_session(&observation("Airport", "aa", 70, EncryptionClass::Open), &lease)
            .await;

        assert_eq!(session.state(), Some(PortalState::Verified));
        assert!(attempt.is_success());
    }

    #[tokio::test]
    async fn test_manual_required_never_authenticates() {
        let (backend, pool) = rig();
        backend.add_network(SimulatedNetwork::open("Hotel", "aa", 70).with_portal(
            "http://portal.hotel.example/login",
            "<form>Enter your username and password</form>",
            SimulatedPortalAuth::Manual,
        ));
        let module = module(backend.clone());

        let lease = pool.lease(false).unwrap();
        let (session, attempt) = module
            .run_session(&observation("Hotel", "aa", 70, EncryptionClass::Open), &lease)
            .await;

        assert_eq!(session.analysis.as_ref().unwrap().auth_method, AuthMethod::ManualRequired);
        assert!(!session.reached(PortalState::Authenticating));
        assert_eq!(session.state(), Some(PortalState::Failed));
        assert!(matches!(attempt.outcome, AttemptOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_portal_that_stays_closed_fails() {
        let (backend, pool) = rig();
        // Looks like click-through but never opens
        backend.add_network(SimulatedNetwork::open("Liar", "aa", 70).with_portal(
            "http://portal.liar.example/",
            "Click to connect",
            SimulatedPortalAuth::Manual,
        ));
        let module = module(backend.clone());

        let lease = pool.lease(false).unwrap();
        let (session, attempt) = module
            .run_session(&observation("Liar", "aa", 70, EncryptionClass::Open), &lease)
            .await;

        assert!(session.reached(PortalState::Authenticating));
        assert_eq!(session.state(), Some(PortalState::Failed));
        assert!(!attempt.is_success());
    }

    #[tokio::test]
    async fn test_learned_pattern_reused_and_results_recorded() {
        let (backend, pool) = rig();
        backend.add_network(lobby("<p>Welcome. Click below to continue.</p>"));
        let store = Arc::new(MemoryPortalStore::new());
        let module = module(backend.clone()).with_pattern_store(store.clone());
        let obs = observation("Lobby", "aa", 70, EncryptionClass::Open);

        let lease = pool.lease(false).unwrap();
        let (_, attempt) = module.run_session(&obs, &lease).await;
        assert!(attempt.is_success());
        lease.release(LeaseEnd::Idle);

        let pattern = store.get_pattern("Lobby").await.unwrap().unwrap();
        assert_eq!(pattern.redirect_domain, "portal.lobby.example");
        assert_eq!(pattern.auth_method, AuthMethod::ClickThrough);
        assert_eq!((pattern.success_count, pattern.failure_count), (1, 0));

        // The page alone no longer classifies as automatable; the learned method carries it
        backend.add_network(lobby("<p>Welcome!</p>"));
        assert_eq!(
            analyze(Some("http://portal.lobby.example/welcome"), "<p>Welcome!</p>").auth_method,
            AuthMethod::ManualRequired
        );

        let lease = pool.lease(false).unwrap();
        let (session, attempt) = module.run_session(&obs, &lease).await;
        assert!(attempt.is_success());
        assert_eq!(session.analysis.unwrap().auth_method, AuthMethod::ClickThrough);
        assert_eq!(store.get_pattern("Lobby").await.unwrap().unwrap().success_count, 2);
    }

    #[tokio::test]
    async fn test_failed_authentication_recorded() {
        let (backend, pool) = rig();
        backend.add_network(SimulatedNetwork::open("Liar", "aa", 70).with_portal(
            "http://portal.liar.example/",
            "Click to connect",
            SimulatedPortalAuth::Manual,
        ));
        let store = Arc::new(MemoryPortalStore::new());
        let module = module(backend.clone()).with_pattern_store(store.clone());

        let lease = pool.lease(false).unwrap();
        let (_, attempt) = module
            .run_session(&observation("Liar", "aa", 70, EncryptionClass::Open), &lease)
            .await;
        assert!(!attempt.is_success());

        let pattern = store.get_pattern("Liar").await.unwrap().unwrap();
        assert_eq!((pattern.success_count, pattern.failure_count), (0, 1));
        assert!(!pattern.is_proven());
    }

    #[tokio::test]
    async fn test_manual_portal_stored_without_auth_result() {
        let (backend, pool) = rig();
        backend.add_network(SimulatedNetwork::open("Hotel", "aa", 70).with_portal(
            "http://portal.hotel.example/login",
            "<form>Enter your username and password</form>",
            SimulatedPortalAuth::Manual,
        ));
        let store = Arc::new(MemoryPortalStore::new());
        let module = module(backend.clone()).with_pattern_store(store.clone());

        let lease = pool.lease(false).unwrap();
        module
            .run_session(&observation("Hotel", "aa", 70, EncryptionClass::Open), &lease)
            .await;

        let pattern = store.get_pattern("Hotel").await.unwrap().unwrap();
        assert_eq!(pattern.auth_method, AuthMethod::ManualRequired);
        assert_eq!((pattern.success_count, pattern.failure_count), (0, 0));
    }

    #[test]
    fn test_labels_parse_back() {
        for method in [AuthMethod::ClickThrough, AuthMethod::TermsAccept, AuthMethod::ManualRequired] {
            assert_eq!(method.to_string().parse::<AuthMethod>().unwrap(), method);
        }
        let vendor = PortalType::VendorSpecific("fon".to_string());
        assert_eq!(PortalType::from_label(&vendor.to_string()), vendor);
        assert_eq!(PortalType::from_label("generic"), PortalType::Generic);
        assert!("telepathy".parse::<AuthMethod>().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_network_fails_while_probing() {
        let (backend, pool) = rig();
        backend.add_network(SimulatedNetwork::open("Dead", "aa", 70));
        backend.set_reachable("aa", false);
        let module = module(backend.clone());

        let lease = pool.lease(false).unwrap();
        let (session, attempt) = module
            .run_session(&observation("Dead", "aa", 70, EncryptionClass::Open), &lease)
            .await;

        assert_eq!(
            session.history(),
            &[PortalState::Connected, PortalState::Probing, PortalState::Failed]
        );
        assert!(!attempt.is_success());
    }
}

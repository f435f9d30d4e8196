//! Uplink bridge
//!
//! Shares the chosen network with the LAN side: verify the new uplink,
//! install forwarding/NAT, swap it in, then tear the previous one down.
//! The active bridge owns its radio lease for as long as it is up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use vasili_network::{
    ConnectionAttempt, EncryptionClass, LeaseEnd, ModuleKind, NetworkObservation, ProbeRequest,
    RadioLease, WirelessBackend,
};

use crate::scoring::NetworkScore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("uplink verification failed on {interface}: {reason}")]
    VerificationFailed { interface: String, reason: String },

    #[error("NAT setup failed for {uplink} -> {lan}: {reason}")]
    NatFailed {
        uplink: String,
        lan: String,
        reason: String,
    },
}

/// What the LAN is currently bridged to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSnapshot {
    pub ssid: String,
    pub bssid: String,
    pub uplink: String,
    pub lan_interfaces: Vec<String>,
    pub encryption: EncryptionClass,
    pub module: ModuleKind,
    pub attempt_id: u64,
    pub score: NetworkScore,
    pub activated_at: DateTime<Utc>,
}

struct ActiveBridge {
    snapshot: BridgeSnapshot,
    lease: RadioLease,
}

pub struct BridgeManager {
    backend: Arc<dyn WirelessBackend>,
    lan_interfaces: Vec<String>,
    verify_url: String,
    active: Mutex<Option<ActiveBridge>>,
    state_tx: watch::Sender<Option<BridgeSnapshot>>,
}

impl BridgeManager {
    pub fn new(backend: Arc<dyn WirelessBackend>, lan_interfaces: Vec<String>, verify_url: String) -> Self {
        let (state_tx, _) = watch::channel(None);
        Self {
            backend,
            lan_interfaces,
            verify_url,
            active: Mutex::new(None),
            state_tx,
        }
    }

    /// Make `attempt`'s network the shared uplink.
    ///
    /// On error the new radio is disassociated and released, and whatever
    /// bridge was active before stays exactly as it was.
    pub async fn activate(
        &self,
        attempt: &ConnectionAttempt,
        observation: &NetworkObservation,
        score: &NetworkScore,
        lease: RadioLease,
    ) -> Result<BridgeSnapshot, BridgeError> {
        self.install(None, attempt, observation, score, lease).await
    }

    /// Like [`activate`](Self::activate), but verification must finish by
    /// `deadline`. NAT changes are never interrupted once started.
    pub async fn activate_by(
        &self,
        deadline: Instant,
        attempt: &ConnectionAttempt,
        observation: &NetworkObservation,
        score: &NetworkScore,
        lease: RadioLease,
    ) -> Result<BridgeSnapshot, BridgeError> {
        self.install(Some(deadline), attempt, observation, score, lease).await
    }

    async fn install(
        &self,
        deadline: Option<Instant>,
        attempt: &ConnectionAttempt,
        observation: &NetworkObservation,
        score: &NetworkScore,
        lease: RadioLease,
    ) -> Result<BridgeSnapshot, BridgeError> {
        let uplink = lease.interface().to_string();
        let mut active = self.active.lock().await;

        if let Err(e) = self.verify(&uplink, deadline).await {
            self.discard(lease).await;
            return Err(e);
        }

        let mut applied: Vec<&str> = Vec::with_capacity(self.lan_interfaces.len());
        for lan in &self.lan_interfaces {
            if let Err(e) = self.backend.apply_nat(&uplink, lan).await {
                warn!("NAT {} -> {} failed, rolling back: {}", uplink, lan, e);
                for done in applied {
                    if let Err(e) = self.backend.remove_nat(&uplink, done).await {
                        warn!("Rollback of NAT {} -> {} failed: {}", uplink, done, e);
                    }
                }
                self.discard(lease).await;
                return Err(BridgeError::NatFailed {
                    uplink,
                    lan: lan.clone(),
                    reason: e.to_string(),
                });
            }
            applied.push(lan);
        }

        let snapshot = BridgeSnapshot {
            ssid: attempt.ssid.clone(),
            bssid: attempt.bssid.clone(),
            uplink: uplink.clone(),
            lan_interfaces: self.lan_interfaces.clone(),
            encryption: observation.encryption,
            module: attempt.module,
            attempt_id: attempt.id,
            score: score.clone(),
            activated_at: Utc::now(),
        };

        let previous = active.replace(ActiveBridge {
            snapshot: snapshot.clone(),
            lease,
        });
        self.state_tx.send_replace(Some(snapshot.clone()));

        info!(
            "Bridge active: {} ({}) via {} -> [{}], score {:.1}",
            snapshot.ssid,
            snapshot.bssid,
            uplink,
            self.lan_interfaces.join(", "),
            score.total
        );

        if let Some(old) = previous {
            info!("Tearing down previous bridge to {}", old.snapshot.ssid);
            self.teardown(old).await;
        }

        Ok(snapshot)
    }

    /// Revert forwarding and release the uplink radio
    pub async fn deactivate(&self) -> Option<BridgeSnapshot> {
        let old = self.active.lock().await.take()?;
        self.state_tx.send_replace(None);
        info!("Bridge to {} deactivated", old.snapshot.ssid);
        let snapshot = old.snapshot.clone();
        self.teardown(old).await;
        Some(snapshot)
    }

    pub async fn current(&self) -> Option<BridgeSnapshot> {
        self.active.lock().await.as_ref().map(|a| a.snapshot.clone())
    }

    /// Watch bridge changes; the value is `None` while nothing is bridged
    pub fn subscribe(&self) -> watch::Receiver<Option<BridgeSnapshot>> {
        self.state_tx.subscribe()
    }

    async fn verify(&self, uplink: &str, deadline: Option<Instant>) -> Result<(), BridgeError> {
        let fail = |reason: String| BridgeError::VerificationFailed {
            interface: uplink.to_string(),
            reason,
        };

        let request = ProbeRequest::get(self.verify_url.clone());
        let response = match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                return Err(fail("cycle deadline reached".to_string()));
            }
            Some(deadline) => timeout_at(deadline, self.backend.probe(uplink, &request))
                .await
                .map_err(|_| fail("cycle deadline reached".to_string()))?,
            None => self.backend.probe(uplink, &request).await,
        }
        .map_err(|e| fail(e.to_string()))?;

        if response.is_redirect() {
            return Err(fail(format!(
                "redirected to {}",
                response.location.unwrap_or_default()
            )));
        }
        if !response.is_success() {
            return Err(fail(format!("status {}", response.status)));
        }

        debug!("Uplink {} verified in {:.0}ms", uplink, response.latency_ms);
        Ok(())
    }

    async fn teardown(&self, bridge: ActiveBridge) {
        let uplink = bridge.lease.interface().to_string();
        for lan in &bridge.snapshot.lan_interfaces {
            if let Err(e) = self.backend.remove_nat(&uplink, lan).await {
                warn!("Failed to remove NAT {} -> {}: {}", uplink, lan, e);
            }
        }
        self.discard(bridge.lease).await;
    }

    async fn discard(&self, lease: RadioLease) {
        match self.backend.disassociate(lease.interface()).await {
            Ok(()) => lease.release(LeaseEnd::Idle),
            Err(e) => {
                let reason = format!("disassociate failed: {}", e);
                lease.release(LeaseEnd::Error(reason));
            }
        }
    }
}

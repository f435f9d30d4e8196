//! Evaluation modules
//!
//! Each module decides whether it can handle a network ([`EvaluationModule::accepts`])
//! and, given a leased connection radio, tries to bring the network up and
//! measure it ([`EvaluationModule::attempt`]). The same observation may be
//! accepted by several modules; every (module, observation) pair is an
//! independent attempt.

pub mod captive_portal;
pub mod open;
pub mod secured;
pub mod speedtest;

pub use captive_portal::{
    AuthMethod, CaptivePortalModule, ConnectivityCheck, PortalAnalysis, PortalSession, PortalState,
    PortalType,
};
pub use open::OpenNetworkModule;
pub use secured::SecuredNetworkModule;
pub use speedtest::SpeedtestModule;

use crate::backend::WirelessBackend;
use crate::error::NetworkError;
use crate::pool::RadioLease;
use crate::types::{ConnectionAttempt, Credentials, ModuleKind, NetworkObservation};
use chrono::Utc;
use tracing::debug;

/// A pluggable connection strategy
#[async_trait::async_trait]
pub trait EvaluationModule: Send + Sync {
    fn kind(&self) -> ModuleKind;

    /// Whether this module can handle the network at all
    fn accepts(&self, observation: &NetworkObservation) -> bool;

    /// Try to connect over the leased radio and measure the result.
    ///
    /// Never returns an error: failures are reported through the attempt's
    /// outcome. Hardware-level problems are also recorded on the lease.
    async fn attempt(&self, observation: &NetworkObservation, lease: &RadioLease) -> ConnectionAttempt;
}

/// Associate the leased radio with the observed access point.
///
/// Hardware errors are recorded on the lease so the radio is re-checked
/// before it is handed out again.
pub(crate) async fn associate(
    backend: &dyn WirelessBackend,
    observation: &NetworkObservation,
    lease: &RadioLease,
    credentials: Option<&Credentials>,
) -> std::result::Result<(), String> {
    let interface = lease.interface();
    debug!(
        "Associating {} with {} ({})",
        interface, observation.ssid, observation.bssid
    );

    match backend
        .associate(interface, &observation.ssid, &observation.bssid, credentials)
        .await
    {
        Ok(()) => {
            lease.mark_connected(&observation.ssid);
            Ok(())
        }
        Err(e) => {
            if let NetworkError::HardwareError { reason, .. } = &e {
                lease.record_fault(reason.clone());
            }
            Err(format!("association failed: {}", e))
        }
    }
}

/// Associate and run the speed test; shared by the open and secured modules
pub(crate) async fn connect_and_measure(
    kind: ModuleKind,
    backend: &dyn WirelessBackend,
    speedtest: &SpeedtestModule,
    observation: &NetworkObservation,
    lease: &RadioLease,
    credentials: Option<&Credentials>,
) -> ConnectionAttempt {
    let interface = lease.interface();
    let started_at = Utc::now();

    if let Err(reason) = associate(backend, observation, lease, credentials).await {
        return ConnectionAttempt::failed(kind, observation, interface, started_at, reason);
    }

    match speedtest.measure(interface).await {
        Ok(metrics) => ConnectionAttempt::success(kind, observation, interface, started_at, metrics),
        Err(e) => ConnectionAttempt::failed(kind, observation, interface, started_at, e.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::backends::SimulatedBackend;
    use crate::card_store::FallbackCardStore;
    use crate::pool::RadioPool;
    use crate::types::{EncryptionClass, NetworkObservation};
    use chrono::Utc;
    use std::sync::Arc;

    pub fn observation(ssid: &str, bssid: &str, signal: u8, encryption: EncryptionClass) -> NetworkObservation {
        NetworkObservation {
            bssid: bssid.to_string(),
            ssid: ssid.to_string(),
            signal,
            signal_dbm: None,
            channel: Some(6),
            frequency_mhz: None,
            encryption,
            last_seen: Utc::now(),
        }
    }

    /// Backend and pool with one scanning and one connection radio
    pub fn rig() -> (Arc<SimulatedBackend>, RadioPool) {
        let backend = Arc::new(SimulatedBackend::new());
        backend.add_interface("wlan0");
        backend.add_interface("wlan1");
        let pool = RadioPool::new(Arc::new(FallbackCardStore::memory_only()));
        pool.assign_roles(&["wlan0".to_string(), "wlan1".to_string()], None)
            .unwrap();
        (backend, pool)
    }
}

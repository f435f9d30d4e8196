//! WPA personal and enterprise networks with configured credentials

use super::{connect_and_measure, EvaluationModule, SpeedtestModule};
use crate::backend::WirelessBackend;
use crate::pool::RadioLease;
use crate::types::{ConnectionAttempt, Credentials, EncryptionClass, ModuleKind, NetworkObservation};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct SecuredNetworkModule {
    backend: Arc<dyn WirelessBackend>,
    speedtest: Arc<SpeedtestModule>,
    /// Credentials keyed by SSID
    credentials: HashMap<String, Credentials>,
}

impl SecuredNetworkModule {
    pub fn new(
        backend: Arc<dyn WirelessBackend>,
        speedtest: Arc<SpeedtestModule>,
        credentials: HashMap<String, Credentials>,
    ) -> Self {
        Self {
            backend,
            speedtest,
            credentials,
        }
    }

    fn credentials_for(&self, observation: &NetworkObservation) -> Option<&Credentials> {
        self.credentials
            .get(&observation.ssid)
            .filter(|c| c.supports(observation.encryption))
    }
}

#[async_trait::async_trait]
impl EvaluationModule for SecuredNetworkModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Secured
    }

    fn accepts(&self, observation: &NetworkObservation) -> bool {
        matches!(
            observation.encryption,
            EncryptionClass::WpaPersonal | EncryptionClass::WpaEnterprise
        ) && !observation.is_hidden()
    }

    async fn attempt(&self, observation: &NetworkObservation, lease: &RadioLease) -> ConnectionAttempt {
        let Some(credentials) = self.credentials_for(observation) else {
            debug!("No usable credentials for {}, skipping", observation.ssid);
            return ConnectionAttempt::rejected(self.kind(), observation, lease.interface(), Utc::now());
        };

        connect_and_measure(
            self.kind(),
            self.backend.as_ref(),
            &self.speedtest,
            observation,
            lease,
            Some(credentials),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedNetwork;
    use crate::modules::test_support::{observation, rig};
    use crate::types::AttemptOutcome;
    use std::time::Duration;

    fn psk(p: &str) -> Credentials {
        Credentials::Psk {
            passphrase: p.to_string(),
        }
    }

    #[tokio::test]
    async fn test_accepts_wpa_classes() {
        let (backend, _pool) = rig();
        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        let module = SecuredNetworkModule::new(backend, speedtest, HashMap::new());

        assert!(module.accepts(&observation("HomeNet", "bb", 60, EncryptionClass::WpaPersonal)));
        assert!(module.accepts(&observation("Corp", "cc", 60, EncryptionClass::WpaEnterprise)));
        assert!(!module.accepts(&observation("Cafe", "aa", 60, EncryptionClass::Open)));
        assert!(!module.accepts(&observation("Wep", "dd", 60, EncryptionClass::Unknown)));
    }

    #[tokio::test]
    async fn test_no_credentials_rejected_without_touching_radio() {
        let (backend, pool) = rig();
        backend.add_network(SimulatedNetwork::wpa_personal("HomeNet", "bb", 60, "pw"));
        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        let module = SecuredNetworkModule::new(backend.clone(), speedtest, HashMap::new());

        let lease = pool.lease(false).unwrap();
        let attempt = module
            .attempt(&observation("HomeNet", "bb", 60, EncryptionClass::WpaPersonal), &lease)
            .await;
        assert_eq!(attempt.outcome, AttemptOutcome::RejectedIncompatible);
        assert_eq!(backend.association("wlan1"), None);
    }

    #[tokio::test]
    async fn test_wrong_credential_kind_rejected() {
        let (backend, pool) = rig();
        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        let creds = HashMap::from([("Corp".to_string(), psk("pw"))]);
        let module = SecuredNetworkModule::new(backend, speedtest, creds);

        let lease = pool.lease(false).unwrap();
        let attempt = module
            .attempt(&observation("Corp", "cc", 60, EncryptionClass::WpaEnterprise), &lease)
            .await;
        assert_eq!(attempt.outcome, AttemptOutcome::RejectedIncompatible);
    }

    #[tokio::test]
    async fn test_configured_credentials_connect() {
        let (backend, pool) = rig();
        backend.add_network(
            SimulatedNetwork::wpa_personal("HomeNet", "bb", 60, "pw").with_speed(40.0, 10.0, 30.0),
        );
        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        let creds = HashMap::from([("HomeNet".to_string(), psk("pw"))]);
        let module = SecuredNetworkModule::new(backend, speedtest, creds);

        let lease = pool.lease(false).unwrap();
        let attempt = module
            .attempt(&observation("HomeNet", "bb", 60, EncryptionClass::WpaPersonal), &lease)
            .await;
        assert!(attempt.is_success());
        assert_eq!(attempt.metrics.unwrap().download_mbps, 40.0);
    }

    #[tokio::test]
    async fn test_bad_passphrase_fails() {
        let (backend, pool) = rig();
        backend.add_network(SimulatedNetwork::wpa_personal("HomeNet", "bb", 60, "pw"));
        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        let creds = HashMap::from([("HomeNet".to_string(), psk("nope"))]);
        let module = SecuredNetworkModule::new(backend, speedtest, creds);

        let lease = pool.lease(false).unwrap();
        let attempt = module
            .attempt(&observation("HomeNet", "bb", 60, EncryptionClass::WpaPersonal), &lease)
            .await;
        assert!(matches!(attempt.outcome, AttemptOutcome::Failed(_)));
    }
}

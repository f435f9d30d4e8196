//! Unauthenticated open networks

use super::{connect_and_measure, EvaluationModule, SpeedtestModule};
use crate::backend::WirelessBackend;
use crate::pool::RadioLease;
use crate::types::{ConnectionAttempt, EncryptionClass, ModuleKind, NetworkObservation};
use std::sync::Arc;

pub struct OpenNetworkModule {
    backend: Arc<dyn WirelessBackend>,
    speedtest: Arc<SpeedtestModule>,
}

impl OpenNetworkModule {
    pub fn new(backend: Arc<dyn WirelessBackend>, speedtest: Arc<SpeedtestModule>) -> Self {
        Self { backend, speedtest }
    }
}

#[async_trait::async_trait]
impl EvaluationModule for OpenNetworkModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Open
    }

    fn accepts(&self, observation: &NetworkObservation) -> bool {
        observation.encryption == EncryptionClass::Open && !observation.is_hidden()
    }

    async fn attempt(&self, observation: &NetworkObservation, lease: &RadioLease) -> ConnectionAttempt {
        connect_and_measure(
            self.kind(),
            self.backend.as_ref(),
            &self.speedtest,
            observation,
            lease,
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedNetwork;
    use crate::modules::test_support::{observation, rig};
    use crate::radio::RadioState;
    use crate::types::AttemptOutcome;
    use std::time::Duration;

    #[tokio::test]
    async fn test_accepts_only_open() {
        let (backend, _pool) = rig();
        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        let module = OpenNetworkModule::new(backend, speedtest);

        assert!(module.accepts(&observation("CafeWifi", "aa", 80, EncryptionClass::Open)));
        assert!(!module.accepts(&observation("HomeNet", "bb", 60, EncryptionClass::WpaPersonal)));
        assert!(!module.accepts(&observation("", "cc", 60, EncryptionClass::Open)));
    }

    #[tokio::test]
    async fn test_attempt_success() {
        let (backend, pool) = rig();
        backend.add_network(SimulatedNetwork::open("CafeWifi", "aa", 80).with_speed(60.0, 20.0, 15.0));
        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        let module = OpenNetworkModule::new(backend.clone(), speedtest);

        let lease = pool.lease(false).unwrap();
        let attempt = module
            .attempt(&observation("CafeWifi", "aa", 80, EncryptionClass::Open), &lease)
            .await;

        assert!(attempt.is_success());
        assert_eq!(attempt.interface, "wlan1");
        assert_eq!(attempt.metrics.unwrap().upload_mbps, 20.0);
        assert_eq!(pool.snapshot()[1].state, RadioState::Connected);
        assert_eq!(backend.association("wlan1").as_deref(), Some("aa"));
    }

    #[tokio::test]
    async fn test_attempt_association_refused() {
        let (backend, pool) = rig();
        backend.add_network(SimulatedNetwork::open("Flaky", "aa", 80).rejecting_association());
        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        let module = OpenNetworkModule::new(backend, speedtest);

        let lease = pool.lease(false).unwrap();
        let attempt = module
            .attempt(&observation("Flaky", "aa", 80, EncryptionClass::Open), &lease)
            .await;
        assert!(matches!(attempt.outcome, AttemptOutcome::Failed(_)));
        assert!(lease.fault().is_none());
    }

    #[tokio::test]
    async fn test_attempt_stamped_when_it_begins() {
        let (backend, pool) = rig();
        backend.add_network(
            SimulatedNetwork::open("Slow", "aa", 80)
                .with_speed(10.0, 5.0, 20.0)
                .with_association_delay(Duration::from_millis(200)),
        );
        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        let module = OpenNetworkModule::new(backend, speedtest);

        let before = chrono::Utc::now();
        let lease = pool.lease(false).unwrap();
        let attempt = module
            .attempt(&observation("Slow", "aa", 80, EncryptionClass::Open), &lease)
            .await;
        let after = chrono::Utc::now();

        assert!(attempt.is_success());
        assert!(attempt.started_at >= before);
        assert!(after - attempt.started_at >= chrono::Duration::milliseconds(200));
    }
}

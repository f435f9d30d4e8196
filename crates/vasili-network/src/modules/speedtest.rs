//! Speed test
//!
//! Not a network filter: it never accepts an observation on its own. The
//! other modules call [`SpeedtestModule::measure`] once they are connected.

use super::EvaluationModule;
use crate::backend::WirelessBackend;
use crate::error::{NetworkError, Result};
use crate::pool::RadioLease;
use crate::types::{ConnectionAttempt, ModuleKind, NetworkObservation, SpeedMeasurement};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct SpeedtestModule {
    backend: Arc<dyn WirelessBackend>,
    timeout: Duration,
}

impl SpeedtestModule {
    pub fn new(backend: Arc<dyn WirelessBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Measure throughput over an already-connected interface
    pub async fn measure(&self, interface: &str) -> Result<SpeedMeasurement> {
        let measurement = tokio::time::timeout(self.timeout, self.backend.measure_throughput(interface))
            .await
            .map_err(|_| {
                NetworkError::AttemptFailed(format!(
                    "speed test on {} exceeded {:?}",
                    interface, self.timeout
                ))
            })??;

        let values = [
            measurement.download_mbps,
            measurement.upload_mbps,
            measurement.ping_ms,
        ];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(NetworkError::AttemptFailed(format!(
                "implausible speed test result on {}: {:?}",
                interface, measurement
            )));
        }

        debug!(
            "Speed test on {}: down {:.1} Mbps, up {:.1} Mbps, ping {:.0} ms",
            interface, measurement.download_mbps, measurement.upload_mbps, measurement.ping_ms
        );
        Ok(measurement)
    }
}

#[async_trait::async_trait]
impl EvaluationModule for SpeedtestModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Speedtest
    }

    fn accepts(&self, _observation: &NetworkObservation) -> bool {
        false
    }

    async fn attempt(&self, observation: &NetworkObservation, lease: &RadioLease) -> ConnectionAttempt {
        let started_at = Utc::now();
        let interface = lease.interface();
        match self.measure(interface).await {
            Ok(m) => ConnectionAttempt::success(self.kind(), observation, interface, started_at, m),
            Err(e) => ConnectionAttempt::failed(self.kind(), observation, interface, started_at, e.to_string()),
        }
    }
}

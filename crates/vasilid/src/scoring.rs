use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;
use vasili_network::ConnectionAttempt;

/// Weights for the network scoring formula
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub download: f64,
    pub signal: f64,
    pub upload: f64,
    pub ping: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            download: 0.4,
            signal: 0.3,
            upload: 0.2,
            ping: 0.1,
        }
    }
}

/// Calculated score for one successful attempt. Every component is on a
/// 0-100 scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkScore {
    pub bssid: String,
    pub ssid: String,
    pub attempt_id: u64,
    pub total: f64,
    pub download_score: f64,
    pub signal_score: f64,
    pub upload_score: f64,
    pub ping_score: f64,
    /// Raw ping, kept for tie-breaking
    pub ping_ms: f64,
}

/// Network scoring calculator
#[derive(Debug, Clone)]
pub struct NetworkScorer {
    weights: ScoringWeights,
    // Reference values for normalization
    max_download_mbps: f64,
    max_upload_mbps: f64,
    max_ping_ms: f64,
}

impl NetworkScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self {
            weights,
            max_download_mbps: 100.0,
            max_upload_mbps: 50.0,
            max_ping_ms: 200.0,
        }
    }

    pub fn new_with_defaults() -> Self {
        Self::new(ScoringWeights::default())
    }

    /// Score a successful attempt. Attempts without metrics have no score.
    pub fn calculate_score(&self, attempt: &ConnectionAttempt) -> Option<NetworkScore> {
        if !attempt.is_success() {
            return None;
        }
        let metrics = attempt.metrics?;

        let download_score = Self::score_rate(metrics.download_mbps, self.max_download_mbps);
        let signal_score = f64::from(attempt.signal).clamp(0.0, 100.0);
        let upload_score = Self::score_rate(metrics.upload_mbps, self.max_upload_mbps);
        let ping_score = self.score_ping(metrics.ping_ms);

        let total = (download_score * self.weights.download
            + signal_score * self.weights.signal
            + upload_score * self.weights.upload
            + ping_score * self.weights.ping)
            .clamp(0.0, 100.0);

        debug!(
            "Network '{}' ({}) score: {:.2} (dl={:.1}, sig={:.1}, ul={:.1}, ping={:.1})",
            attempt.ssid, attempt.bssid, total, download_score, signal_score, upload_score, ping_score
        );

        Some(NetworkScore {
            bssid: attempt.bssid.clone(),
            ssid: attempt.ssid.clone(),
            attempt_id: attempt.id,
            total,
            download_score,
            signal_score,
            upload_score,
            ping_score,
            ping_ms: metrics.ping_ms,
        })
    }

    /// Score every successful attempt, best first
    pub fn rank(&self, attempts: &[ConnectionAttempt]) -> Vec<NetworkScore> {
        let mut scores: Vec<NetworkScore> = attempts
            .iter()
            .filter_map(|a| self.calculate_score(a))
            .collect();
        scores.sort_by(compare);
        scores
    }

    /// Throughput scaled against a reference rate (higher is better)
    fn score_rate(rate_mbps: f64, reference_mbps: f64) -> f64 {
        if !rate_mbps.is_finite() || rate_mbps <= 0.0 {
            return 0.0;
        }
        (rate_mbps / reference_mbps * 100.0).min(100.0)
    }

    /// Ping score (lower is better, so we invert)
    fn score_ping(&self, ping_ms: f64) -> f64 {
        if !ping_ms.is_finite() {
            return 0.0;
        }
        if ping_ms <= 0.0 {
            return 100.0;
        }
        (100.0 * (1.0 - ping_ms / self.max_ping_ms)).clamp(0.0, 100.0)
    }
}

/// Selection order, best first: higher score, then lower ping, then the
/// lexicographically first BSSID, then the earlier attempt.
pub fn compare(a: &NetworkScore, b: &NetworkScore) -> Ordering {
    b.total
        .partial_cmp(&a.total)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.ping_ms.partial_cmp(&b.ping_ms).unwrap_or(Ordering::Equal))
        .then_with(|| a.bssid.cmp(&b.bssid))
        .then_with(|| a.attempt_id.cmp(&b.attempt_id))
}

/// Whether `candidate` should displace `current`
pub fn beats(candidate: &NetworkScore, current: &NetworkScore) -> bool {
    compare(candidate, current) == Ordering::Less
}

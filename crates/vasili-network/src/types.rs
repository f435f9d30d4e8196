//! Network type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Encryption class advertised by an access point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionClass {
    Open,
    WpaPersonal,
    WpaEnterprise,
    Unknown,
}

impl fmt::Display for EncryptionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionClass::Open => write!(f, "open"),
            EncryptionClass::WpaPersonal => write!(f, "wpa-personal"),
            EncryptionClass::WpaEnterprise => write!(f, "wpa-enterprise"),
            EncryptionClass::Unknown => write!(f, "unknown"),
        }
    }
}

/// Unparsed access point entry as reported by a backend scan
#[derive(Debug, Clone, PartialEq)]
pub struct RawScanResult {
    pub bssid: String,
    pub ssid: String,
    /// Signal in dBm, if the driver reported one
    pub signal_dbm: Option<f64>,
    /// Signal already normalized to 0-100 (simulated hardware, some drivers)
    pub signal_quality: Option<u8>,
    pub channel: Option<u16>,
    pub frequency_mhz: Option<u32>,
    pub encryption: EncryptionClass,
}

/// Convert dBm into the 0-100 quality scale used throughout.
///
/// -100 dBm maps to 0 and -50 dBm or stronger maps to 100.
pub fn dbm_to_quality(dbm: f64) -> u8 {
    ((dbm + 100.0) * 2.0).clamp(0.0, 100.0).round() as u8
}

/// Channel number for a 2.4/5/6 GHz center frequency
pub fn frequency_to_channel(freq_mhz: u32) -> Option<u16> {
    match freq_mhz {
        2484 => Some(14),
        2412..=2472 => Some(((freq_mhz - 2407) / 5) as u16),
        5955..=7115 => Some(((freq_mhz - 5950) / 5) as u16),
        5000..=5900 => Some(((freq_mhz - 5000) / 5) as u16),
        _ => None,
    }
}

/// A discovered access point, keyed by BSSID in the inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkObservation {
    pub bssid: String,
    pub ssid: String,
    /// Normalized signal strength (0-100)
    pub signal: u8,
    pub signal_dbm: Option<f64>,
    pub channel: Option<u16>,
    pub frequency_mhz: Option<u32>,
    pub encryption: EncryptionClass,
    pub last_seen: DateTime<Utc>,
}

impl NetworkObservation {
    /// Normalize a raw scan entry. BSSIDs are lowercased so that repeated
    /// sightings from different tools land on the same key.
    pub fn from_raw(raw: RawScanResult, seen_at: DateTime<Utc>) -> Self {
        let signal = match (raw.signal_quality, raw.signal_dbm) {
            (Some(q), _) => q.min(100),
            (None, Some(dbm)) => dbm_to_quality(dbm),
            (None, None) => 0,
        };
        let channel = raw
            .channel
            .or_else(|| raw.frequency_mhz.and_then(frequency_to_channel));

        Self {
            bssid: raw.bssid.to_ascii_lowercase(),
            ssid: raw.ssid,
            signal,
            signal_dbm: raw.signal_dbm,
            channel,
            frequency_mhz: raw.frequency_mhz,
            encryption: raw.encryption,
            last_seen: seen_at,
        }
    }

    /// Hidden networks broadcast an empty SSID and cannot be joined by name
    pub fn is_hidden(&self) -> bool {
        self.ssid.is_empty()
    }
}

/// Credential material for a secured network
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    /// WPA/WPA2/WPA3 personal
    Psk { passphrase: String },
    /// WPA enterprise (PEAP/MSCHAPv2)
    Enterprise { identity: String, password: String },
}

impl Credentials {
    pub fn supports(&self, encryption: EncryptionClass) -> bool {
        matches!(
            (self, encryption),
            (Credentials::Psk { .. }, EncryptionClass::WpaPersonal)
                | (Credentials::Enterprise { .. }, EncryptionClass::WpaEnterprise)
        )
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Psk { .. } => f.debug_struct("Psk").field("passphrase", &"<redacted>").finish(),
            Credentials::Enterprise { identity, .. } => f
                .debug_struct("Enterprise")
                .field("identity", identity)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Which evaluation module produced an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Open,
    Secured,
    CaptivePortal,
    Speedtest,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKind::Open => write!(f, "open"),
            ModuleKind::Secured => write!(f, "secured"),
            ModuleKind::CaptivePortal => write!(f, "captive_portal"),
            ModuleKind::Speedtest => write!(f, "speedtest"),
        }
    }
}

/// Throughput and latency measured over an established connection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedMeasurement {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
}

/// Outcome of a single module attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RejectedIncompatible,
    Failed(String),
}

static NEXT_ATTEMPT_ID: AtomicU64 = AtomicU64::new(1);

/// Result of one module's effort against one observation. Never mutated
/// after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAttempt {
    /// Process-wide, strictly increasing sequence number
    pub id: u64,
    pub module: ModuleKind,
    pub bssid: String,
    pub ssid: String,
    pub signal: u8,
    pub interface: String,
    pub outcome: AttemptOutcome,
    pub metrics: Option<SpeedMeasurement>,
    pub started_at: DateTime<Utc>,
}

impl ConnectionAttempt {
    fn build(
        module: ModuleKind,
        observation: &NetworkObservation,
        interface: &str,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        metrics: Option<SpeedMeasurement>,
    ) -> Self {
        Self {
            id: NEXT_ATTEMPT_ID.fetch_add(1, Ordering::Relaxed),
            module,
            bssid: observation.bssid.clone(),
            ssid: observation.ssid.clone(),
            signal: observation.signal,
            interface: interface.to_string(),
            outcome,
            metrics,
            started_at,
        }
    }

    pub fn success(
        module: ModuleKind,
        observation: &NetworkObservation,
        interface: &str,
        started_at: DateTime<Utc>,
        metrics: SpeedMeasurement,
    ) -> Self {
        Self::build(
            module,
            observation,
            interface,
            started_at,
            AttemptOutcome::Success,
            Some(metrics),
        )
    }

    pub fn rejected(
        module: ModuleKind,
        observation: &NetworkObservation,
        interface: &str,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::build(
            module,
            observation,
            interface,
            started_at,
            AttemptOutcome::RejectedIncompatible,
            None,
        )
    }

    pub fn failed(
        module: ModuleKind,
        observation: &NetworkObservation,
        interface: &str,
        started_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self::build(
            module,
            observation,
            interface,
            started_at,
            AttemptOutcome::Failed(reason.into()),
            None,
        )
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success && self.metrics.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(dbm: Option<f64>) -> RawScanResult {
        RawScanResult {
            bssid: "AA:BB:CC:DD:EE:FF".to_string(),
            ssid: "CafeWifi".to_string(),
            signal_dbm: dbm,
            signal_quality: None,
            channel: None,
            frequency_mhz: Some(2437),
            encryption: EncryptionClass::Open,
        }
    }

    #[test]
    fn test_dbm_normalization() {
        assert_eq!(dbm_to_quality(-100.0), 0);
        assert_eq!(dbm_to_quality(-120.0), 0);
        assert_eq!(dbm_to_quality(-60.0), 80);
        assert_eq!(dbm_to_quality(-50.0), 100);
        assert_eq!(dbm_to_quality(-20.0), 100);
    }

    #[test]
    fn test_observation_from_raw() {
        let obs = NetworkObservation::from_raw(raw(Some(-60.0)), Utc::now());
        assert_eq!(obs.bssid, "aa:bb:cc:dd:ee:ff");
        assert_eq!(obs.signal, 80);
        assert_eq!(obs.channel, Some(6));

        let obs = NetworkObservation::from_raw(raw(None), Utc::now());
        assert_eq!(obs.signal, 0);
    }

    #[test]
    fn test_frequency_to_channel() {
        assert_eq!(frequency_to_channel(2412), Some(1));
        assert_eq!(frequency_to_channel(2484), Some(14));
        assert_eq!(frequency_to_channel(5180), Some(36));
        assert_eq!(frequency_to_channel(900), None);
    }

    #[test]
    fn test_credentials_match_encryption() {
        let psk = Credentials::Psk {
            passphrase: "hunter22".to_string(),
        };
        assert!(psk.supports(EncryptionClass::WpaPersonal));
        assert!(!psk.supports(EncryptionClass::WpaEnterprise));
        assert!(!psk.supports(EncryptionClass::Open));
        assert!(!format!("{:?}", psk).contains("hunter22"));
    }

    #[test]
    fn test_credentials_deserialize_untagged() {
        let psk: Credentials = serde_json::from_str(r#"{"passphrase":"secret"}"#).unwrap();
        assert!(matches!(psk, Credentials::Psk { .. }));

        let ent: Credentials =
            serde_json::from_str(r#"{"identity":"alice","password":"secret"}"#).unwrap();
        assert!(matches!(ent, Credentials::Enterprise { .. }));
    }

    #[test]
    fn test_attempt_ids_increase() {
        let obs = NetworkObservation::from_raw(raw(Some(-60.0)), Utc::now());
        let started = Utc::now() - chrono::Duration::seconds(30);
        let a = ConnectionAttempt::rejected(ModuleKind::Open, &obs, "wlan1", started);
        let b = ConnectionAttempt::failed(ModuleKind::Open, &obs, "wlan1", Utc::now(), "boom");
        assert!(b.id > a.id);
        assert_eq!(a.started_at, started);
        assert!(!a.is_success());
        assert!(!b.is_success());
    }
}

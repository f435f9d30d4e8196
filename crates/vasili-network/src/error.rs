//! Network error types

use thiserror::Error;

/// Radio, scan and attempt errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("No wireless radios available")]
    NoRadiosAvailable,

    #[error("No idle connection radio available")]
    NoIdleRadio,

    #[error("Hardware error on {interface}: {reason}")]
    HardwareError { interface: String, reason: String },

    #[error("Attempt timed out after {0} ms")]
    AttemptTimeout(u64),

    #[error("Attempt failed: {0}")]
    AttemptFailed(String),

    #[error("Probe timed out: {0}")]
    ProbeTimeout(String),

    #[error("Probe failed: {0}")]
    ProbeFailed(String),

    #[error("Card state store unavailable: {0}")]
    CardStoreUnavailable(String),

    #[error("Portal pattern store unavailable: {0}")]
    PatternStoreUnavailable(String),

    #[error("Invalid scan data: {0}")]
    InvalidScanData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    pub fn hardware(interface: impl Into<String>, reason: impl Into<String>) -> Self {
        NetworkError::HardwareError {
            interface: interface.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

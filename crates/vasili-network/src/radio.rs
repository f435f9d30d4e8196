//! Radio roles and operational states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role assigned to a radio at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioRole {
    Unassigned,
    Scanning,
    Connection,
}

impl fmt::Display for RadioRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioRole::Unassigned => write!(f, "unassigned"),
            RadioRole::Scanning => write!(f, "scanning"),
            RadioRole::Connection => write!(f, "connection"),
        }
    }
}

impl std::str::FromStr for RadioRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unassigned" => Ok(RadioRole::Unassigned),
            "scanning" => Ok(RadioRole::Scanning),
            "connection" => Ok(RadioRole::Connection),
            other => Err(format!("unknown radio role: {}", other)),
        }
    }
}

/// Operational state of a radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Idle => write!(f, "idle"),
            RadioState::Scanning => write!(f, "scanning"),
            RadioState::Connecting => write!(f, "connecting"),
            RadioState::Connected => write!(f, "connected"),
            RadioState::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for RadioState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(RadioState::Idle),
            "scanning" => Ok(RadioState::Scanning),
            "connecting" => Ok(RadioState::Connecting),
            "connected" => Ok(RadioState::Connected),
            "error" => Ok(RadioState::Error),
            other => Err(format!("unknown radio state: {}", other)),
        }
    }
}

/// A physical wireless adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Radio {
    pub interface: String,
    pub role: RadioRole,
    pub state: RadioState,
    pub connected_ssid: Option<String>,
    pub last_error: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl Radio {
    pub fn new(interface: impl Into<String>, role: RadioRole) -> Self {
        Self {
            interface: interface.into(),
            role,
            state: RadioState::Idle,
            connected_ssid: None,
            last_error: None,
            last_updated: Utc::now(),
        }
    }

    pub(crate) fn transition(&mut self, state: RadioState) {
        self.state = state;
        if state != RadioState::Connected {
            self.connected_ssid = None;
        }
        if state != RadioState::Error {
            self.last_error = None;
        }
        self.last_updated = Utc::now();
    }
}

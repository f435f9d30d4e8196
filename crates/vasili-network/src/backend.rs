//! Hardware/OS backend trait
//!
//! Every privileged or OS-specific operation (scanning, association, NAT,
//! interface-bound HTTP) goes through [`WirelessBackend`]. The rest of the
//! system never shells out directly.

use crate::error::Result;
use crate::types::{Credentials, RawScanResult, SpeedMeasurement};
use serde::{Deserialize, Serialize};

/// HTTP method used for a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeMethod {
    Get,
    Post,
}

/// A single HTTP request issued over a specific interface.
///
/// Redirects are never followed; callers inspect `location` themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRequest {
    pub url: String,
    pub method: ProbeMethod,
    /// Form fields sent url-encoded with a POST
    pub form: Vec<(String, String)>,
}

impl ProbeRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: ProbeMethod::Get,
            form: Vec::new(),
        }
    }

    pub fn post_form(url: impl Into<String>, form: Vec<(String, String)>) -> Self {
        Self {
            url: url.into(),
            method: ProbeMethod::Post,
            form,
        }
    }
}

/// Response to a probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResponse {
    pub status: u16,
    /// `Location` header of a redirect, resolved against the request URL
    pub location: Option<String>,
    pub body: String,
    pub latency_ms: f64,
}

impl ProbeResponse {
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Wireless hardware and host networking operations
#[async_trait::async_trait]
pub trait WirelessBackend: Send + Sync {
    /// Enumerate wireless interfaces present on the host
    async fn wireless_interfaces(&self) -> Result<Vec<String>>;

    /// Check that an interface exists and responds
    async fn check_interface(&self, interface: &str) -> Result<()>;

    /// Run a hardware scan
    async fn scan(&self, interface: &str) -> Result<Vec<RawScanResult>>;

    /// Associate with an access point and obtain an address
    async fn associate(
        &self,
        interface: &str,
        ssid: &str,
        bssid: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()>;

    /// Drop any association on the interface
    async fn disassociate(&self, interface: &str) -> Result<()>;

    /// Enable forwarding and masquerading from `lan` out through `uplink`
    async fn apply_nat(&self, uplink: &str, lan: &str) -> Result<()>;

    /// Remove rules previously installed by `apply_nat`
    async fn remove_nat(&self, uplink: &str, lan: &str) -> Result<()>;

    /// Issue an HTTP request bound to `interface`
    async fn probe(&self, interface: &str, request: &ProbeRequest) -> Result<ProbeResponse>;

    /// Measure download/upload throughput and ping over `interface`
    async fn measure_throughput(&self, interface: &str) -> Result<SpeedMeasurement>;
}

//! Wireless backend implementations

#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;

#[cfg(target_os = "linux")]
pub use linux::LinuxBackend;
pub use simulated::{SimulatedBackend, SimulatedNetwork, SimulatedPortalAuth};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings for the host backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostBackendConfig {
    /// DHCP client invocation; the interface name is appended
    #[serde(default = "default_dhcp_command")]
    pub dhcp_command: Vec<String>,
    /// Where generated wpa_supplicant configs and pid files live
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    /// Upper bound on any single external command
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Upper bound on a single HTTP probe
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default)]
    pub speedtest: SpeedtestEndpoints,
}

fn default_dhcp_command() -> Vec<String> {
    vec!["dhclient".to_string(), "-1".to_string()]
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/run/vasili")
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_probe_timeout_secs() -> u64 {
    5
}

impl Default for HostBackendConfig {
    fn default() -> Self {
        Self {
            dhcp_command: default_dhcp_command(),
            runtime_dir: default_runtime_dir(),
            command_timeout_secs: default_command_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            speedtest: SpeedtestEndpoints::default(),
        }
    }
}

/// Endpoints used to measure throughput and latency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedtestEndpoints {
    pub download_url: String,
    pub upload_url: String,
    pub ping_url: String,
    /// Stop reading the download after this many bytes
    pub max_download_bytes: u64,
    pub upload_bytes: usize,
    pub timeout_secs: u64,
}

impl Default for SpeedtestEndpoints {
    fn default() -> Self {
        Self {
            download_url: "https://speed.cloudflare.com/__down?bytes=25000000".to_string(),
            upload_url: "https://speed.cloudflare.com/__up".to_string(),
            ping_url: "https://speed.cloudflare.com/__down?bytes=0".to_string(),
            max_download_bytes: 25_000_000,
            upload_bytes: 5_000_000,
            timeout_secs: 20,
        }
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vasili_network::{Credentials, HostBackendConfig, ModuleKind, ScannerConfig, SpeedtestEndpoints};

use crate::monitor::MonitorConfig;
use crate::orchestrator::OrchestratorConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub interfaces: InterfaceConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
    /// Credentials for secured networks, keyed by SSID
    #[serde(default)]
    pub credentials: HashMap<String, Credentials>,
    #[serde(default)]
    pub scanner: ScannerSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub auto_selection: AutoSelectionConfig,
    #[serde(default)]
    pub speedtest: SpeedtestEndpoints,
    /// Host tooling (DHCP client, command timeouts)
    #[serde(default)]
    pub backend: HostBackendConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(skip)]
    config_file_path: PathBuf,
    #[serde(skip)]
    pub data_directory: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interfaces to use first, in order
    #[serde(default)]
    pub preferred: Vec<String>,
    /// Interfaces never to touch
    #[serde(default)]
    pub excluded: Vec<String>,
    /// Radio dedicated to scanning
    #[serde(default)]
    pub scan_interface: Option<String>,
    /// LAN-facing interfaces that receive the shared uplink
    #[serde(default = "default_lan_interfaces")]
    pub lan: Vec<String>,
}

fn default_lan_interfaces() -> Vec<String> {
    vec!["eth0".to_string()]
}

impl InterfaceConfig {
    /// Order and filter detected interfaces: preferred ones first, excluded ones dropped
    pub fn select(&self, detected: &[String]) -> Vec<String> {
        let mut selected: Vec<String> = self
            .preferred
            .iter()
            .filter(|p| detected.contains(p))
            .cloned()
            .collect();
        for iface in detected {
            if !selected.contains(iface) {
                selected.push(iface.clone());
            }
        }
        selected.retain(|i| !self.excluded.contains(i) && !self.lan.contains(i));
        selected
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    pub enabled: Vec<ModuleKind>,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            enabled: vec![ModuleKind::Open, ModuleKind::Secured, ModuleKind::CaptivePortal],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerSettings {
    #[serde(default = "default_scan_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_scan_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_scan_interval() -> u64 {
    5
}

fn default_stale_after() -> u64 {
    60
}

fn default_scan_max_backoff() -> u64 {
    60
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval(),
            stale_after_secs: default_stale_after(),
            max_backoff_secs: default_scan_max_backoff(),
        }
    }
}

impl ScannerSettings {
    pub fn to_scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            interval: Duration::from_secs(self.interval_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    pub cycle_deadline_secs: u64,
    pub attempt_timeout_secs: u64,
    /// Retry delay after a cycle that found nothing usable
    pub retry_initial_secs: u64,
    pub retry_max_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            cycle_deadline_secs: 120,
            attempt_timeout_secs: 60,
            retry_initial_secs: 10,
            retry_max_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Must answer 2xx over a new uplink before it is exposed
    pub verify_url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            verify_url: "http://connectivitycheck.gstatic.com/generate_204".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub probe_interval_secs: u64,
    pub probe_url: String,
    /// Absolute latency above which the link counts as degraded
    pub degraded_latency_ms: f64,
    /// Latency above baseline times this counts as degraded
    pub latency_threshold_multiplier: f32,
    /// Failed-probe ratio over the recent window that counts as degraded
    pub loss_threshold: f64,
    /// Consecutive failed probes before the link is lost
    pub lost_threshold: u32,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: 10,
            probe_url: "http://connectivitycheck.gstatic.com/generate_204".to_string(),
            degraded_latency_ms: 500.0,
            latency_threshold_multiplier: 5.0,
            loss_threshold: 0.25,
            lost_threshold: 3,
            backoff_initial_secs: 5,
            backoff_max_secs: 300,
        }
    }
}

impl MonitorSettings {
    pub fn to_monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            probe_url: self.probe_url.clone(),
            degraded_latency_ms: self.degraded_latency_ms,
            latency_threshold_multiplier: self.latency_threshold_multiplier,
            loss_threshold: self.loss_threshold,
            lost_threshold: self.lost_threshold,
            backoff_initial: Duration::from_secs(self.backoff_initial_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSelectionConfig {
    pub enabled: bool,
    /// Seconds between periodic re-evaluations
    pub evaluation_interval_secs: u64,
    /// A new network must beat the current one by this many points
    pub min_score_improvement: f64,
    /// Seconds to wait after startup before the first periodic evaluation
    pub initial_delay_secs: u64,
}

impl Default for AutoSelectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval_secs: 30,
            min_score_improvement: 10.0,
            initial_delay_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite connection string; empty disables persistence
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interfaces: InterfaceConfig {
                lan: default_lan_interfaces(),
                ..InterfaceConfig::default()
            },
            modules: ModulesConfig::default(),
            credentials: HashMap::new(),
            scanner: ScannerSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            bridge: BridgeConfig::default(),
            monitor: MonitorSettings::default(),
            auto_selection: AutoSelectionConfig::default(),
            speedtest: SpeedtestEndpoints::default(),
            backend: HostBackendConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            config_file_path: PathBuf::new(),
            data_directory: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file (chosen by extension)
    pub fn load(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;

        let mut config = Self::parse(&contents, &config_path)?;
        config.config_file_path = config_path;
        config.data_directory = data_dir;
        config.validate()?;

        Ok(config)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self> {
        if Self::is_json(path) {
            serde_json::from_str(contents).context("Failed to parse JSON configuration file")
        } else {
            serde_yaml::from_str(contents).context("Failed to parse configuration file")
        }
    }

    /// Create a new default configuration and write it to disk
    pub fn create_default(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);
        let data_dir = data_dir.unwrap_or_else(Self::default_data_dir);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&data_dir)?;

        let config = Config {
            storage: StorageConfig {
                url: format!("sqlite://{}?mode=rwc", data_dir.join("vasili.db").display()),
            },
            logging: LoggingConfig {
                file: Some(data_dir.join("logs").join("vasilid.log")),
                ..LoggingConfig::default()
            },
            config_file_path: config_path.clone(),
            data_directory: data_dir,
            ..Config::default()
        };

        let serialized = if Self::is_json(&config_path) {
            serde_json::to_string_pretty(&config)?
        } else {
            serde_yaml::to_string(&config)?
        };
        fs::write(&config_path, serialized)?;

        Ok(config)
    }

    fn is_json(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"))
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.modules.enabled.is_empty() {
            anyhow::bail!("modules.enabled must list at least one module");
        }
        if self.modules.enabled.contains(&ModuleKind::Speedtest) {
            anyhow::bail!("speedtest runs inside the other modules and cannot be enabled on its own");
        }
        if self.scanner.interval_secs == 0 {
            anyhow::bail!("scanner.interval_secs must be greater than zero");
        }
        if self.orchestrator.attempt_timeout_secs == 0 || self.orchestrator.cycle_deadline_secs == 0 {
            anyhow::bail!("orchestrator timeouts must be greater than zero");
        }
        if self.monitor.probe_interval_secs == 0 || self.monitor.lost_threshold == 0 {
            anyhow::bail!("monitor.probe_interval_secs and monitor.lost_threshold must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.monitor.loss_threshold) {
            anyhow::bail!("monitor.loss_threshold must be between 0 and 1");
        }
        if self.auto_selection.enabled && self.auto_selection.evaluation_interval_secs == 0 {
            anyhow::bail!("auto_selection.evaluation_interval_secs must be greater than zero");
        }
        if self.speedtest.timeout_secs == 0 {
            anyhow::bail!("speedtest.timeout_secs must be greater than zero");
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json', got '{}'", self.logging.format);
        }
        if let Some(scan) = &self.interfaces.scan_interface {
            if self.interfaces.excluded.contains(scan) {
                anyhow::bail!("scan interface {} is also excluded", scan);
            }
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            cycle_deadline: Duration::from_secs(self.orchestrator.cycle_deadline_secs),
            attempt_timeout: Duration::from_secs(self.orchestrator.attempt_timeout_secs),
            min_score_improvement: self.auto_selection.min_score_improvement,
        }
    }

    /// Backend settings with the top-level speed test endpoints folded in
    pub fn host_backend_config(&self) -> HostBackendConfig {
        HostBackendConfig {
            speedtest: self.speedtest.clone(),
            ..self.backend.clone()
        }
    }

    pub fn speedtest_timeout(&self) -> Duration {
        Duration::from_secs(self.speedtest.timeout_secs)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vasili")
            .join("config.yaml")
    }

    fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vasili")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.auto_selection.min_score_improvement, 10.0);
        assert_eq!(config.scanner.interval_secs, 5);
    }

    #[test]
    fn test_parse_yaml_with_credentials() {
        let yaml = r#"
interfaces:
  preferred: [wlan2]
  excluded: [wlan9]
  scan_interface: wlan0
  lan: [eth1]
modules:
  enabled: [open, secured]
credentials:
  HomeNet:
    passphrase: "correct horse"
  CorpNet:
    identity: alice
    password: s3cret
"#;
        let config = Config::parse(yaml, Path::new("config.yaml")).unwrap();
        assert_eq!(config.interfaces.scan_interface.as_deref(), Some("wlan0"));
        assert_eq!(config.modules.enabled, vec![ModuleKind::Open, ModuleKind::Secured]);
        assert!(matches!(config.credentials["HomeNet"], Credentials::Psk { .. }));
        assert!(matches!(config.credentials["CorpNet"], Credentials::Enterprise { .. }));
        // Unspecified sections fall back to defaults
        assert_eq!(config.monitor.lost_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{"modules": {"enabled": ["captive_portal"]}, "storage": {"url": ""}}"#;
        let config = Config::parse(json, Path::new("vasili.json")).unwrap();
        assert_eq!(config.modules.enabled, vec![ModuleKind::CaptivePortal]);
        assert!(config.storage.url.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.modules.enabled.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.modules.enabled.push(ModuleKind::Speedtest);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interface_selection() {
        let interfaces = InterfaceConfig {
            preferred: vec!["wlan2".to_string(), "wlan7".to_string()],
            excluded: vec!["wlan1".to_string()],
            scan_interface: None,
            lan: vec!["eth0".to_string()],
        };
        let detected: Vec<String> = ["wlan0", "wlan1", "wlan2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(interfaces.select(&detected), vec!["wlan2".to_string(), "wlan0".to_string()]);
    }

    #[test]
    fn test_create_default_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let data = dir.path().join("data");

        Config::create_default(Some(path.clone()), Some(data.clone())).unwrap();
        let loaded = Config::load(Some(path), Some(data)).unwrap();
        assert!(loaded.storage.url.starts_with("sqlite://"));
        assert_eq!(loaded.api.port, 5000);
    }
}

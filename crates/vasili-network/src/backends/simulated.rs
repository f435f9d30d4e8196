//! Simulated wireless backend
//!
//! A scriptable in-memory model of radios, access points, captive portals
//! and NAT rules. Used by tests and by `vasilid --simulate`.

use crate::backend::{ProbeMethod, ProbeRequest, ProbeResponse, WirelessBackend};
use crate::error::{NetworkError, Result};
use crate::types::{Credentials, EncryptionClass, RawScanResult, SpeedMeasurement};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// How a simulated portal lets clients through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedPortalAuth {
    /// Visiting the landing page is enough
    ClickThrough,
    /// The acceptance form must be posted
    TermsAccept,
    /// Never opens without a human
    Manual,
}

#[derive(Debug, Clone)]
pub struct SimulatedPortal {
    pub landing_url: String,
    pub body: String,
    pub auth: SimulatedPortalAuth,
}

/// A simulated access point
#[derive(Debug, Clone)]
pub struct SimulatedNetwork {
    pub ssid: String,
    pub bssid: String,
    pub signal: u8,
    pub channel: u16,
    pub encryption: EncryptionClass,
    pub required_credentials: Option<Credentials>,
    pub associate_ok: bool,
    pub reachable: bool,
    pub association_delay: Duration,
    pub speed: SpeedMeasurement,
    pub portal: Option<SimulatedPortal>,
}

impl SimulatedNetwork {
    pub fn open(ssid: &str, bssid: &str, signal: u8) -> Self {
        Self {
            ssid: ssid.to_string(),
            bssid: bssid.to_ascii_lowercase(),
            signal,
            channel: 6,
            encryption: EncryptionClass::Open,
            required_credentials: None,
            associate_ok: true,
            reachable: true,
            association_delay: Duration::ZERO,
            speed: SpeedMeasurement {
                download_mbps: 10.0,
                upload_mbps: 5.0,
                ping_ms: 50.0,
            },
            portal: None,
        }
    }

    pub fn wpa_personal(ssid: &str, bssid: &str, signal: u8, passphrase: &str) -> Self {
        Self {
            encryption: EncryptionClass::WpaPersonal,
            required_credentials: Some(Credentials::Psk {
                passphrase: passphrase.to_string(),
            }),
            ..Self::open(ssid, bssid, signal)
        }
    }

    pub fn wpa_enterprise(ssid: &str, bssid: &str, signal: u8, identity: &str, password: &str) -> Self {
        Self {
            encryption: EncryptionClass::WpaEnterprise,
            required_credentials: Some(Credentials::Enterprise {
                identity: identity.to_string(),
                password: password.to_string(),
            }),
            ..Self::open(ssid, bssid, signal)
        }
    }

    pub fn with_speed(mut self, download_mbps: f64, upload_mbps: f64, ping_ms: f64) -> Self {
        self.speed = SpeedMeasurement {
            download_mbps,
            upload_mbps,
            ping_ms,
        };
        self
    }

    pub fn with_portal(mut self, landing_url: &str, body: &str, auth: SimulatedPortalAuth) -> Self {
        self.portal = Some(SimulatedPortal {
            landing_url: landing_url.to_string(),
            body: body.to_string(),
            auth,
        });
        self
    }

    pub fn with_association_delay(mut self, delay: Duration) -> Self {
        self.association_delay = delay;
        self
    }

    pub fn rejecting_association(mut self) -> Self {
        self.associate_ok = false;
        self
    }
}

#[derive(Default)]
struct SimState {
    interfaces: BTreeSet<String>,
    networks: Vec<SimulatedNetwork>,
    /// interface -> bssid
    associations: HashMap<String, String>,
    /// interfaces that got through a captive portal on their current association
    authenticated: HashSet<String>,
    nat_rules: Vec<(String, String)>,
    scan_failures: u32,
    fail_nat: bool,
    probe_count: usize,
}

/// In-memory wireless backend
#[derive(Default)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Three radios and a handful of nearby networks for local runs
    pub fn demo() -> Self {
        let backend = Self::new();
        for iface in ["wlan0", "wlan1", "wlan2"] {
            backend.add_interface(iface);
        }
        backend.add_network(
            SimulatedNetwork::open("CafeWifi", "02:00:00:00:00:01", 80).with_speed(60.0, 20.0, 15.0),
        );
        backend.add_network(
            SimulatedNetwork::wpa_personal("HomeNet", "02:00:00:00:00:02", 60, "correct horse")
                .with_speed(40.0, 10.0, 30.0),
        );
        backend.add_network(
            SimulatedNetwork::open("AirportFree", "02:00:00:00:00:03", 70)
                .with_speed(25.0, 5.0, 40.0)
                .with_portal(
                    "http://portal.airport.example/welcome",
                    "<html><p>Welcome! Click to continue.</p><a href=\"/go\">Continue</a></html>",
                    SimulatedPortalAuth::ClickThrough,
                ),
        );
        backend
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_interface(&self, interface: &str) {
        self.lock().interfaces.insert(interface.to_string());
    }

    pub fn remove_interface(&self, interface: &str) {
        let mut state = self.lock();
        state.interfaces.remove(interface);
        state.associations.remove(interface);
    }

    pub fn add_network(&self, network: SimulatedNetwork) {
        let mut state = self.lock();
        state.networks.retain(|n| n.bssid != network.bssid);
        state.networks.push(network);
    }

    pub fn remove_network(&self, bssid: &str) {
        self.lock().networks.retain(|n| n.bssid != bssid);
    }

    pub fn set_reachable(&self, bssid: &str, reachable: bool) {
        if let Some(n) = self.lock().networks.iter_mut().find(|n| n.bssid == bssid) {
            n.reachable = reachable;
        }
    }

    pub fn set_speed(&self, bssid: &str, speed: SpeedMeasurement) {
        if let Some(n) = self.lock().networks.iter_mut().find(|n| n.bssid == bssid) {
            n.speed = speed;
        }
    }

    /// Make the next `count` scans fail
    pub fn fail_scans(&self, count: u32) {
        self.lock().scan_failures = count;
    }

    pub fn fail_nat(&self, fail: bool) {
        self.lock().fail_nat = fail;
    }

    pub fn nat_rules(&self) -> Vec<(String, String)> {
        self.lock().nat_rules.clone()
    }

    /// BSSID the interface is associated with
    pub fn association(&self, interface: &str) -> Option<String> {
        self.lock().associations.get(interface).cloned()
    }

    pub fn probe_count(&self) -> usize {
        self.lock().probe_count
    }

    fn connected_network(state: &SimState, interface: &str) -> Result<SimulatedNetwork> {
        let bssid = state
            .associations
            .get(interface)
            .ok_or_else(|| NetworkError::ProbeFailed(format!("{} is not associated", interface)))?;
        state
            .networks
            .iter()
            .find(|n| &n.bssid == bssid)
            .cloned()
            .ok_or_else(|| NetworkError::ProbeFailed(format!("{} lost its access point", interface)))
    }

    fn connectivity_response(url: &str, latency_ms: f64) -> ProbeResponse {
        let (status, body) = if url.contains("generate_204") {
            (204, String::new())
        } else if url.contains("hotspot-detect") {
            (
                200,
                "<HTML><HEAD><TITLE>Success</TITLE></HEAD><BODY>Success</BODY></HTML>".to_string(),
            )
        } else if url.contains("connecttest.txt") {
            (200, "Microsoft Connect Test".to_string())
        } else {
            (200, "OK".to_string())
        };
        ProbeResponse {
            status,
            location: None,
            body,
            latency_ms,
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

#[async_trait::async_trait]
impl WirelessBackend for SimulatedBackend {
    async fn wireless_interfaces(&self) -> Result<Vec<String>> {
        Ok(self.lock().interfaces.iter().cloned().collect())
    }

    async fn check_interface(&self, interface: &str) -> Result<()> {
        if self.lock().interfaces.contains(interface) {
            Ok(())
        } else {
            Err(NetworkError::hardware(interface, "no such device"))
        }
    }

    async fn scan(&self, interface: &str) -> Result<Vec<RawScanResult>> {
        let mut state = self.lock();
        if !state.interfaces.contains(interface) {
            return Err(NetworkError::hardware(interface, "no such device"));
        }
        if state.scan_failures > 0 {
            state.scan_failures -= 1;
            return Err(NetworkError::hardware(interface, "scan aborted (device busy)"));
        }

        Ok(state
            .networks
            .iter()
            .map(|n| RawScanResult {
                bssid: n.bssid.clone(),
                ssid: n.ssid.clone(),
                signal_dbm: Some(f64::from(n.signal) / 2.0 - 100.0),
                signal_quality: Some(n.signal),
                channel: Some(n.channel),
                frequency_mhz: None,
                encryption: n.encryption,
            })
            .collect())
    }

    async fn associate(
        &self,
        interface: &str,
        ssid: &str,
        bssid: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        let network = {
            let state = self.lock();
            if !state.interfaces.contains(interface) {
                return Err(NetworkError::hardware(interface, "no such device"));
            }
            state
                .networks
                .iter()
                .find(|n| n.bssid == bssid && n.ssid == ssid)
                .cloned()
                .ok_or_else(|| NetworkError::AttemptFailed(format!("{} ({}) not in range", ssid, bssid)))?
        };

        if !network.association_delay.is_zero() {
            tokio::time::sleep(network.association_delay).await;
        }

        if !network.associate_ok {
            return Err(NetworkError::AttemptFailed(format!("{} refused association", ssid)));
        }
        if let Some(required) = &network.required_credentials {
            if credentials != Some(required) {
                return Err(NetworkError::AttemptFailed(format!(
                    "authentication with {} rejected",
                    ssid
                )));
            }
        }

        let mut state = self.lock();
        state.authenticated.remove(interface);
        state
            .associations
            .insert(interface.to_string(), network.bssid.clone());
        debug!("[sim] {} associated with {} ({})", interface, ssid, bssid);
        Ok(())
    }

    async fn disassociate(&self, interface: &str) -> Result<()> {
        let mut state = self.lock();
        state.associations.remove(interface);
        state.authenticated.remove(interface);
        Ok(())
    }

    async fn apply_nat(&self, uplink: &str, lan: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_nat {
            return Err(NetworkError::hardware(uplink, "iptables: resource busy"));
        }
        let rule = (uplink.to_string(), lan.to_string());
        if !state.nat_rules.contains(&rule) {
            state.nat_rules.push(rule);
        }
        Ok(())
    }

    async fn remove_nat(&self, uplink: &str, lan: &str) -> Result<()> {
        self.lock()
            .nat_rules
            .retain(|(u, l)| !(u == uplink && l == lan));
        Ok(())
    }

    async fn probe(&self, interface: &str, request: &ProbeRequest) -> Result<ProbeResponse> {
        let mut state = self.lock();
        state.probe_count += 1;

        let network = Self::connected_network(&state, interface)?;
        if !network.reachable {
            return Err(NetworkError::ProbeTimeout(request.url.clone()));
        }
        let latency_ms = network.speed.ping_ms;

        let Some(portal) = network.portal.as_ref() else {
            return Ok(Self::connectivity_response(&request.url, latency_ms));
        };
        if state.authenticated.contains(interface) {
            return Ok(Self::connectivity_response(&request.url, latency_ms));
        }

        if host_of(&request.url) == host_of(&portal.landing_url) {
            let opens = match (portal.auth, request.method) {
                (SimulatedPortalAuth::ClickThrough, ProbeMethod::Get) => true,
                (SimulatedPortalAuth::TermsAccept, ProbeMethod::Post) => request
                    .form
                    .iter()
                    .any(|(k, v)| k == "accept" && v == "1"),
                _ => false,
            };
            if opens {
                state.authenticated.insert(interface.to_string());
            }
            return Ok(ProbeResponse {
                status: 200,
                location: None,
                body: portal.body.clone(),
                latency_ms,
            });
        }

        Ok(ProbeResponse {
            status: 302,
            location: Some(portal.landing_url.clone()),
            body: String::new(),
            latency_ms,
        })
    }

    async fn measure_throughput(&self, interface: &str) -> Result<SpeedMeasurement> {
        let state = self.lock();
        let network = Self::connected_network(&state, interface)
            .map_err(|e| NetworkError::AttemptFailed(e.to_string()))?;

        if !network.reachable {
            return Err(NetworkError::AttemptFailed(format!(
                "no route to speed test server via {}",
                interface
            )));
        }
        if network.portal.is_some() && !state.authenticated.contains(interface) {
            return Err(NetworkError::AttemptFailed(
                "speed test intercepted by captive portal".to_string(),
            ));
        }
        Ok(network.speed)
    }
}

//! Linux wireless backend
//!
//! Drives `iw`, `wpa_supplicant`, a DHCP client and `iptables`, and binds
//! HTTP clients to a specific interface with `SO_BINDTODEVICE`. Requires
//! CAP_NET_ADMIN (in practice, root).

use super::HostBackendConfig;
use crate::backend::{ProbeMethod, ProbeRequest, ProbeResponse, WirelessBackend};
use crate::error::{NetworkError, Result};
use crate::types::{Credentials, EncryptionClass, RawScanResult, SpeedMeasurement};
use reqwest::redirect::Policy;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const SYS_NET: &str = "/sys/class/net";

pub struct LinuxBackend {
    config: HostBackendConfig,
}

impl LinuxBackend {
    pub fn new(config: HostBackendConfig) -> Self {
        Self { config }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    /// Run a command and return stdout, mapping failures onto `interface`
    async fn run(&self, interface: &str, program: &str, args: &[&str]) -> Result<String> {
        debug!("exec: {} {}", program, args.join(" "));

        let output = tokio::time::timeout(
            self.command_timeout(),
            Command::new(program).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| NetworkError::hardware(interface, format!("{} timed out", program)))?
        .map_err(|e| NetworkError::hardware(interface, format!("failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::hardware(
                interface,
                format!("{} {} failed: {}", program, args.join(" "), stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn supplicant_paths(&self, interface: &str) -> (PathBuf, PathBuf) {
        let dir = &self.config.runtime_dir;
        (
            dir.join(format!("wpa_{}.conf", interface)),
            dir.join(format!("wpa_{}.pid", interface)),
        )
    }

    async fn start_supplicant(&self, interface: &str, ssid: &str, bssid: &str, creds: &Credentials) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.runtime_dir).await?;
        let (conf_path, pid_path) = self.supplicant_paths(interface);
        tokio::fs::write(&conf_path, supplicant_config(ssid, bssid, creds)).await?;
        restrict_permissions(&conf_path).await?;

        let conf = conf_path.to_string_lossy().into_owned();
        let pid = pid_path.to_string_lossy().into_owned();
        self.run(interface, "wpa_supplicant", &["-B", "-i", interface, "-c", &conf, "-P", &pid])
            .await?;

        self.wait_for_link(interface).await
    }

    async fn wait_for_link(&self, interface: &str) -> Result<()> {
        let deadline = Instant::now() + self.command_timeout();
        while Instant::now() < deadline {
            let link = self.run(interface, "iw", &["dev", interface, "link"]).await?;
            if link.trim_start().starts_with("Connected to") {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(NetworkError::AttemptFailed(format!(
            "{} did not associate before timeout",
            interface
        )))
    }

    async fn acquire_address(&self, interface: &str) -> Result<()> {
        let Some((program, args)) = self.config.dhcp_command.split_first() else {
            return Ok(());
        };
        let mut args: Vec<&str> = args.iter().map(String::as_str).collect();
        args.push(interface);
        self.run(interface, program, &args).await.map(|_| ())
    }

    fn http_client(&self, interface: &str, timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .interface(interface)
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| NetworkError::hardware(interface, format!("http client: {}", e)))
    }

    async fn iptables(&self, uplink: &str, action: &str, rule: &[&str]) -> Result<()> {
        let mut args = Vec::with_capacity(rule.len() + 1);
        let (table, rest) = if rule.first() == Some(&"-t") && rule.len() > 2 {
            (Some(&rule[..2]), &rule[2..])
        } else {
            (None, rule)
        };
        if let Some(table) = table {
            args.extend_from_slice(table);
        }
        args.push(action);
        args.extend_from_slice(rest);
        self.run(uplink, "iptables", &args).await.map(|_| ())
    }

    fn nat_rules<'a>(uplink: &'a str, lan: &'a str) -> [Vec<&'a str>; 3] {
        [
            vec!["-t", "nat", "POSTROUTING", "-o", uplink, "-j", "MASQUERADE"],
            vec![
                "FORWARD", "-i", uplink, "-o", lan, "-m", "state", "--state",
                "RELATED,ESTABLISHED", "-j", "ACCEPT",
            ],
            vec!["FORWARD", "-i", lan, "-o", uplink, "-j", "ACCEPT"],
        ]
    }
}

async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// wpa_supplicant network block for a single access point
pub fn supplicant_config(ssid: &str, bssid: &str, creds: &Credentials) -> String {
    let mut conf = String::from("ctrl_interface=/run/wpa_supplicant\nnetwork={\n");
    conf.push_str(&format!("    ssid={}\n    bssid={}\n", quote(ssid), bssid));
    match creds {
        Credentials::Psk { passphrase } => {
            conf.push_str("    key_mgmt=WPA-PSK SAE\n");
            conf.push_str(&format!("    psk={}\n", quote(passphrase)));
        }
        Credentials::Enterprise { identity, password } => {
            conf.push_str("    key_mgmt=WPA-EAP\n    eap=PEAP\n    phase2=\"auth=MSCHAPV2\"\n");
            conf.push_str(&format!("    identity={}\n", quote(identity)));
            conf.push_str(&format!("    password={}\n", quote(password)));
        }
    }
    conf.push_str("}\n");
    conf
}

/// Parse the output of `iw dev <if> scan`
pub fn parse_iw_scan(output: &str) -> Vec<RawScanResult> {
    struct Partial {
        bssid: String,
        ssid: String,
        signal_dbm: Option<f64>,
        channel: Option<u16>,
        frequency_mhz: Option<u32>,
        privacy: bool,
        auth_suites: Option<String>,
    }

    fn finish(p: Partial) -> RawScanResult {
        let encryption = match &p.auth_suites {
            Some(suites) if suites.contains("802.1X") => EncryptionClass::WpaEnterprise,
            Some(suites) if suites.contains("PSK") || suites.contains("SAE") => {
                EncryptionClass::WpaPersonal
            }
            Some(_) => EncryptionClass::Unknown,
            None if p.privacy => EncryptionClass::Unknown,
            None => EncryptionClass::Open,
        };
        RawScanResult {
            bssid: p.bssid,
            ssid: p.ssid,
            signal_dbm: p.signal_dbm,
            signal_quality: None,
            channel: p.channel,
            frequency_mhz: p.frequency_mhz,
            encryption,
        }
    }

    let mut results = Vec::new();
    let mut current: Option<Partial> = None;

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("BSS ") {
            if let Some(done) = current.take() {
                results.push(finish(done));
            }
            let bssid: String = rest.chars().take_while(|c| c.is_ascii_hexdigit() || *c == ':').collect();
            if bssid.len() == 17 {
                current = Some(Partial {
                    bssid,
                    ssid: String::new(),
                    signal_dbm: None,
                    channel: None,
                    frequency_mhz: None,
                    privacy: false,
                    auth_suites: None,
                });
            }
            continue;
        }

        let Some(entry) = current.as_mut() else { continue };
        let trimmed = line.trim();

        if let Some(v) = trimmed.strip_prefix("freq:") {
            entry.frequency_mhz = v.trim().parse::<f64>().ok().map(|f| f as u32);
        } else if let Some(v) = trimmed.strip_prefix("signal:") {
            entry.signal_dbm = v.trim().trim_end_matches("dBm").trim().parse().ok();
        } else if let Some(v) = trimmed.strip_prefix("SSID:") {
            entry.ssid = v.trim().to_string();
        } else if let Some(v) = trimmed.strip_prefix("DS Parameter set: channel") {
            entry.channel = v.trim().parse().ok();
        } else if let Some(v) = trimmed.strip_prefix("* primary channel:") {
            entry.channel = entry.channel.or_else(|| v.trim().parse().ok());
        } else if let Some(v) = trimmed.strip_prefix("capability:") {
            entry.privacy = v.contains("Privacy");
        } else if trimmed.starts_with("RSN:") || trimmed.starts_with("WPA:") {
            entry.auth_suites.get_or_insert_with(String::new);
        } else if let Some(v) = trimmed.strip_prefix("* Authentication suites:") {
            let suites = entry.auth_suites.get_or_insert_with(String::new);
            suites.push_str(v.trim());
            suites.push(' ');
        }
    }

    if let Some(done) = current.take() {
        results.push(finish(done));
    }
    results
}

#[async_trait::async_trait]
impl WirelessBackend for LinuxBackend {
    async fn wireless_interfaces(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(SYS_NET).await?;
        let mut interfaces = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if tokio::fs::metadata(path.join("wireless")).await.is_ok()
                || tokio::fs::metadata(path.join("phy80211")).await.is_ok()
            {
                interfaces.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        interfaces.sort();
        Ok(interfaces)
    }

    async fn check_interface(&self, interface: &str) -> Result<()> {
        if tokio::fs::metadata(Path::new(SYS_NET).join(interface)).await.is_err() {
            return Err(NetworkError::hardware(interface, "no such device"));
        }
        self.run(interface, "ip", &["link", "set", interface, "up"]).await?;
        Ok(())
    }

    async fn scan(&self, interface: &str) -> Result<Vec<RawScanResult>> {
        let output = self.run(interface, "iw", &["dev", interface, "scan"]).await?;
        let results = parse_iw_scan(&output);
        if results.is_empty() && output.contains("BSS ") {
            return Err(NetworkError::InvalidScanData(format!(
                "could not parse scan output from {}",
                interface
            )));
        }
        Ok(results)
    }

    async fn associate(
        &self,
        interface: &str,
        ssid: &str,
        bssid: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        let _ = self.disassociate(interface).await;

        match credentials {
            None => {
                self.run(interface, "iw", &["dev", interface, "connect", "-w", ssid, bssid])
                    .await?;
            }
            Some(creds) => self.start_supplicant(interface, ssid, bssid, creds).await?,
        }

        self.acquire_address(interface).await?;
        info!("{} associated with {} ({})", interface, ssid, bssid);
        Ok(())
    }

    async fn disassociate(&self, interface: &str) -> Result<()> {
        let (conf_path, pid_path) = self.supplicant_paths(interface);
        if let Ok(pid) = tokio::fs::read_to_string(&pid_path).await {
            if let Err(e) = self.run(interface, "kill", &[pid.trim()]).await {
                debug!("wpa_supplicant for {} already gone: {}", interface, e);
            }
            let _ = tokio::fs::remove_file(&pid_path).await;
        }
        let _ = tokio::fs::remove_file(&conf_path).await;

        if let Some(program) = self.config.dhcp_command.first() {
            if let Err(e) = self.run(interface, program, &["-r", interface]).await {
                debug!("DHCP release on {} failed: {}", interface, e);
            }
        }

        // Not connected is fine
        if let Err(e) = self.run(interface, "iw", &["dev", interface, "disconnect"]).await {
            debug!("{}", e);
        }
        Ok(())
    }

    async fn apply_nat(&self, uplink: &str, lan: &str) -> Result<()> {
        tokio::fs::write(IP_FORWARD, "1")
            .await
            .map_err(|e| NetworkError::hardware(uplink, format!("enable ip_forward: {}", e)))?;

        for rule in Self::nat_rules(uplink, lan) {
            if self.iptables(uplink, "-C", &rule).await.is_err() {
                self.iptables(uplink, "-A", &rule).await?;
            }
        }
        info!("NAT enabled: {} -> {}", lan, uplink);
        Ok(())
    }

    async fn remove_nat(&self, uplink: &str, lan: &str) -> Result<()> {
        for rule in Self::nat_rules(uplink, lan) {
            if let Err(e) = self.iptables(uplink, "-D", &rule).await {
                warn!("Could not remove NAT rule on {}: {}", uplink, e);
            }
        }
        Ok(())
    }

    async fn probe(&self, interface: &str, request: &ProbeRequest) -> Result<ProbeResponse> {
        let client = self.http_client(interface, Duration::from_secs(self.config.probe_timeout_secs))?;
        let builder = match request.method {
            ProbeMethod::Get => client.get(&request.url),
            ProbeMethod::Post => client.post(&request.url).form(&request.form),
        };

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetworkError::ProbeTimeout(request.url.clone())
            } else {
                NetworkError::ProbeFailed(format!("{}: {}", request.url, e))
            }
        })?;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| response.url().join(v).ok())
            .map(|u| u.to_string());
        let body = response
            .text()
            .await
            .map_err(|e| NetworkError::ProbeFailed(format!("{}: reading body: {}", request.url, e)))?;

        Ok(ProbeResponse {
            status,
            location,
            body,
            latency_ms,
        })
    }

    async fn measure_throughput(&self, interface: &str) -> Result<SpeedMeasurement> {
        let endpoints = &self.config.speedtest;
        let client = self.http_client(interface, Duration::from_secs(endpoints.timeout_secs))?;
        let failed = |stage: &str, e: reqwest::Error| {
            NetworkError::AttemptFailed(format!("speed test {} via {}: {}", stage, interface, e))
        };

        let mut pings = Vec::with_capacity(3);
        for _ in 0..3 {
            let started = Instant::now();
            let response = client
                .get(&endpoints.ping_url)
                .send()
                .await
                .map_err(|e| failed("ping", e))?;
            require_success(interface, "ping", &response)?;
            pings.push(started.elapsed().as_secs_f64() * 1000.0);
        }
        pings.sort_by(|a, b| a.total_cmp(b));
        let ping_ms = pings[pings.len() / 2];

        let started = Instant::now();
        let mut response = client
            .get(&endpoints.download_url)
            .send()
            .await
            .map_err(|e| failed("download", e))?;
        require_success(interface, "download", &response)?;
        let mut received: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(|e| failed("download", e))? {
            received += chunk.len() as u64;
            if received >= endpoints.max_download_bytes {
                break;
            }
        }
        let download_mbps = megabits_per_second(received, started.elapsed());

        let payload = vec![0u8; endpoints.upload_bytes];
        let started = Instant::now();
        let response = client
            .post(&endpoints.upload_url)
            .body(payload)
            .send()
            .await
            .map_err(|e| failed("upload", e))?;
        require_success(interface, "upload", &response)?;
        let upload_mbps = megabits_per_second(endpoints.upload_bytes as u64, started.elapsed());

        Ok(SpeedMeasurement {
            download_mbps,
            upload_mbps,
            ping_ms,
        })
    }
}

/// A redirect or error page means the request never reached the test server
fn require_success(interface: &str, stage: &str, response: &reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(NetworkError::AttemptFailed(format!(
        "speed test {} via {} returned {}",
        stage, interface, status
    )))
}

fn megabits_per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / secs / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCAN: &str = "\
BSS aa:bb:cc:00:00:01(on wlan0) -- associated
\tTSF: 1234 usec
\tfreq: 2437
\tcapability: ESS ShortSlotTime (0x0401)
\tsignal: -60.00 dBm
\tSSID: CafeWifi
\tDS Parameter set: channel 6
BSS aa:bb:cc:00:00:02(on wlan0)
\tfreq: 5180.0
\tcapability: ESS Privacy (0x0011)
\tsignal: -70.00 dBm
\tSSID: HomeNet
\tRSN:\t * Version: 1
\t\t * Group cipher: CCMP
\t\t * Pairwise ciphers: CCMP
\t\t * Authentication suites: PSK
BSS aa:bb:cc:00:00:03(on wlan0)
\tfreq: 2412
\tcapability: ESS Privacy (0x0011)
\tsignal: -80.00 dBm
\tSSID: CorpNet
\tRSN:\t * Version: 1
\t\t * Authentication suites: IEEE 802.1X
BSS aa:bb:cc:00:00:04(on wlan0)
\tfreq: 2462
\tcapability: ESS Privacy (0x0011)
\tsignal: -90.00 dBm
\tSSID: OldWep
";

    #[test]
    fn test_parse_iw_scan() {
        let results = parse_iw_scan(SCAN);
        assert_eq!(results.len(), 4);

        assert_eq!(results[0].bssid, "aa:bb:cc:00:00:01");
        assert_eq!(results[0].ssid, "CafeWifi");
        assert_eq!(results[0].signal_dbm, Some(-60.0));
        assert_eq!(results[0].channel, Some(6));
        assert_eq!(results[0].encryption, EncryptionClass::Open);

        assert_eq!(results[1].frequency_mhz, Some(5180));
        assert_eq!(results[1].encryption, EncryptionClass::WpaPersonal);
        assert_eq!(results[2].encryption, EncryptionClass::WpaEnterprise);
        assert_eq!(results[3].encryption, EncryptionClass::Unknown);
    }

    #[test]
    fn test_parse_empty_scan() {
        assert!(parse_iw_scan("").is_empty());
    }

    #[test]
    fn test_supplicant_config_escapes() {
        let conf = supplicant_config(
            "Cafe \"Wifi\"",
            "aa:bb:cc:00:00:02",
            &Credentials::Psk {
                passphrase: "p\"ss".to_string(),
            },
        );
        assert!(conf.contains("ssid=\"Cafe \\\"Wifi\\\"\""));
        assert!(conf.contains("psk=\"p\\\"ss\""));
        assert!(conf.contains("bssid=aa:bb:cc:00:00:02"));
    }

    /// Answers every request with the same raw HTTP reply
    async fn canned_server(reply: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(reply.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    /// Answers every request the way a captive portal does
    async fn portal_server() -> String {
        let body = "<html>login</html>";
        canned_server(format!(
            "HTTP/1.1 302 Found\r\nLocation: http://portal.example/login\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        ))
        .await
    }

    #[tokio::test]
    async fn test_truncated_body_is_a_failed_request() {
        let base = canned_server(
            "HTTP/1.1 200 OK\r\nContent-Length: 500\r\nConnection: close\r\n\r\n<html>".to_string(),
        )
        .await;
        let backend = LinuxBackend::new(HostBackendConfig::default());

        let err = backend
            .probe("lo", &ProbeRequest::get(format!("{}/generate_204", base)))
            .await
            .unwrap_err();
        match err {
            NetworkError::ProbeFailed(reason) => assert!(reason.contains("reading body"), "{}", reason),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_speed_test_behind_portal_fails() {
        let base = portal_server().await;
        let mut config = HostBackendConfig::default();
        config.speedtest.ping_url = format!("{}/ping", base);
        config.speedtest.download_url = format!("{}/down", base);
        config.speedtest.upload_url = format!("{}/up", base);
        config.speedtest.upload_bytes = 1024;
        config.speedtest.timeout_secs = 5;
        let backend = LinuxBackend::new(config);

        let err = backend.measure_throughput("lo").await.unwrap_err();
        match err {
            NetworkError::AttemptFailed(reason) => assert!(reason.contains("302"), "{}", reason),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_megabits_per_second() {
        let mbps = megabits_per_second(12_500_000, Duration::from_secs(1));
        assert!((mbps - 100.0).abs() < f64::EPSILON);
        assert_eq!(megabits_per_second(100, Duration::ZERO), 0.0);
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vasili_network::{ProbeRequest, WirelessBackend};

use crate::bridge::{BridgeManager, BridgeSnapshot};
use crate::orchestrator::CycleTrigger;

const LOSS_WINDOW: usize = 10;
const EVENT_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub probe_interval: Duration,
    pub probe_url: String,
    pub degraded_latency_ms: f64,
    pub latency_threshold_multiplier: f32,
    pub loss_threshold: f64,
    pub lost_threshold: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_url: "http://connectivitycheck.gstatic.com/generate_204".to_string(),
            degraded_latency_ms: 500.0,
            latency_threshold_multiplier: 5.0,
            loss_threshold: 0.25,
            lost_threshold: 3,
            backoff_initial: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Health of the active uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    Healthy,
    Degraded,
    Lost,
}

/// Monitor event types
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A different uplink (or none) is now being watched
    BridgeChanged { uplink: Option<String> },
    HealthChanged {
        uplink: String,
        from: LinkHealth,
        to: LinkHealth,
    },
    /// Latency crossed a degradation threshold
    ThresholdViolation {
        uplink: String,
        latency_ms: f64,
        threshold_ms: f64,
    },
    /// A re-evaluation was requested after the link was lost
    ReconnectTriggered {
        uplink: String,
        attempt: u32,
        next_delay_secs: f64,
    },
}

/// Tracks probe results for one uplink
#[derive(Debug, Clone)]
pub struct LinkTracker {
    health: LinkHealth,
    consecutive_failures: u32,
    baseline_latency: Option<f64>,
    last_latency: Option<f64>,
    window: VecDeque<bool>,
}

impl Default for LinkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkTracker {
    pub fn new() -> Self {
        Self {
            health: LinkHealth::Healthy,
            consecutive_failures: 0,
            baseline_latency: None,
            last_latency: None,
            window: VecDeque::with_capacity(LOSS_WINDOW),
        }
    }

    fn push(&mut self, ok: bool) {
        if self.window.len() == LOSS_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(ok);
    }

    /// Fraction of failed probes in the recent window
    pub fn loss_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failed = self.window.iter().filter(|ok| !**ok).count();
        failed as f64 / self.window.len() as f64
    }

    /// Latency limit above which the link counts as degraded
    pub fn latency_threshold(&self, config: &MonitorConfig) -> f64 {
        match self.baseline_latency {
            Some(baseline) => config
                .degraded_latency_ms
                .min(baseline * config.latency_threshold_multiplier as f64),
            None => config.degraded_latency_ms,
        }
    }

    pub fn record_success(&mut self, latency_ms: f64, config: &MonitorConfig) -> LinkHealth {
        self.consecutive_failures = 0;
        self.push(true);
        self.last_latency = Some(latency_ms);

        let slow = latency_ms > self.latency_threshold(config);
        let lossy = self.loss_ratio() > config.loss_threshold;

        // Update baseline latency (exponential moving average)
        self.baseline_latency = Some(match self.baseline_latency {
            Some(baseline) => baseline * 0.9 + latency_ms * 0.1,
            None => latency_ms,
        });

        self.health = if slow || lossy {
            LinkHealth::Degraded
        } else {
            LinkHealth::Healthy
        };
        self.health
    }

    pub fn record_failure(&mut self, config: &MonitorConfig) -> LinkHealth {
        self.consecutive_failures += 1;
        self.push(false);

        self.health = if self.consecutive_failures >= config.lost_threshold {
            LinkHealth::Lost
        } else {
            LinkHealth::Degraded
        };
        self.health
    }

    pub fn health(&self) -> LinkHealth {
        self.health
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Capped exponential delay between reconnection triggers
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    next: Duration,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            next: initial,
            attempts: 0,
        }
    }

    /// Delay to wait after the trigger being issued now
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        self.attempts += 1;
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
        self.attempts = 0;
    }
}

/// Point-in-time view for presentation
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub uplink: Option<String>,
    pub health: Option<LinkHealth>,
    pub consecutive_failures: u32,
    pub baseline_latency_ms: Option<f64>,
    pub last_latency_ms: Option<f64>,
    pub loss_ratio: f64,
}

struct MonitorState {
    uplink: Option<String>,
    tracker: LinkTracker,
    backoff: ReconnectBackoff,
    next_trigger_at: Option<Instant>,
}

impl MonitorState {
    fn new(config: &MonitorConfig) -> Self {
        Self {
            uplink: None,
            tracker: LinkTracker::new(),
            backoff: ReconnectBackoff::new(config.backoff_initial, config.backoff_max),
            next_trigger_at: None,
        }
    }

    fn reset(&mut self, config: &MonitorConfig, snapshot: Option<&BridgeSnapshot>) {
        *self = Self::new(config);
        self.uplink = snapshot.map(|s| s.uplink.clone());
    }
}

/// Watches the active uplink and requests re-evaluation when it is lost
pub struct ConnectionMonitor {
    config: MonitorConfig,
    backend: Arc<dyn WirelessBackend>,
    bridge: Arc<BridgeManager>,
    trigger_tx: mpsc::Sender<CycleTrigger>,
    state: Arc<RwLock<MonitorState>>,
    event_log: Arc<RwLock<Vec<MonitorEvent>>>,
    shutdown_tx: broadcast::Sender<()>,
    monitor_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl ConnectionMonitor {
    pub fn new(
        config: MonitorConfig,
        backend: Arc<dyn WirelessBackend>,
        bridge: Arc<BridgeManager>,
        trigger_tx: mpsc::Sender<CycleTrigger>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let state = MonitorState::new(&config);

        Self {
            config,
            backend,
            bridge,
            trigger_tx,
            state: Arc::new(RwLock::new(state)),
            event_log: Arc::new(RwLock::new(Vec::new())),
            shutdown_tx,
            monitor_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Start the monitoring loop
    pub async fn start(&self) -> Result<()> {
        info!(
            "Starting connection monitor (probe every {:?}, lost after {} failures)",
            self.config.probe_interval, self.config.lost_threshold
        );

        let ctx = MonitorContext {
            config: self.config.clone(),
            backend: Arc::clone(&self.backend),
            trigger_tx: self.trigger_tx.clone(),
            state: Arc::clone(&self.state),
            event_log: Arc::clone(&self.event_log),
        };
        let mut bridge_rx = self.bridge.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        {
            let current = bridge_rx.borrow_and_update().clone();
            ctx.state.write().await.reset(&ctx.config, current.as_ref());
        }

        let handle = tokio::spawn(async move {
            let mut ticker = interval(ctx.config.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Connection monitor shutting down");
                        break;
                    }
                    changed = bridge_rx.changed() => {
                        if changed.is_err() {
                            debug!("Bridge manager gone, stopping monitor");
                            break;
                        }
                        let current = bridge_rx.borrow_and_update().clone();
                        ctx.bridge_changed(current.as_ref()).await;
                    }
                    _ = ticker.tick() => {
                        ctx.check().await;
                    }
                }
            }
        });

        *self.monitor_task.write().await = Some(handle);
        Ok(())
    }

    /// Stop the monitor and wait for the task to complete
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.monitor_task.write().await.take() {
            let _ = handle.await;
        }
    }

    pub async fn status(&self) -> MonitorStatus {
        let state = self.state.read().await;
        MonitorStatus {
            uplink: state.uplink.clone(),
            health: state.uplink.as_ref().map(|_| state.tracker.health()),
            consecutive_failures: state.tracker.consecutive_failures(),
            baseline_latency_ms: state.tracker.baseline_latency,
            last_latency_ms: state.tracker.last_latency,
            loss_ratio: state.tracker.loss_ratio(),
        }
    }

    /// Health of the watched uplink, `None` when nothing is bridged
    pub async fn health(&self) -> Option<LinkHealth> {
        self.status().await.health
    }

    pub async fn get_recent_events(&self, count: usize) -> Vec<MonitorEvent> {
        let log = self.event_log.read().await;
        let start = log.len().saturating_sub(count);
        log[start..].to_vec()
    }
}

struct MonitorContext {
    config: MonitorConfig,
    backend: Arc<dyn WirelessBackend>,
    trigger_tx: mpsc::Sender<CycleTrigger>,
    state: Arc<RwLock<MonitorState>>,
    event_log: Arc<RwLock<Vec<MonitorEvent>>>,
}

impl MonitorContext {
    async fn log_event(&self, event: MonitorEvent) {
        debug!("Monitor event: {:?}", event);
        let mut log = self.event_log.write().await;
        log.push(event);

        let len = log.len();
        if len > EVENT_LOG_CAPACITY {
            log.drain(0..len - EVENT_LOG_CAPACITY);
        }
    }

    async fn bridge_changed(&self, snapshot: Option<&BridgeSnapshot>) {
        let uplink = snapshot.map(|s| s.uplink.clone());
        self.state.write().await.reset(&self.config, snapshot);
        self.log_event(MonitorEvent::BridgeChanged { uplink }).await;
    }

    async fn check(&self) {
        let Some(uplink) = self.state.read().await.uplink.clone() else {
            return;
        };

        let request = ProbeRequest::get(self.config.probe_url.clone());
        let latency = match self.backend.probe(&uplink, &request).await {
            Ok(response) if response.is_success() => Some(response.latency_ms),
            Ok(response) => {
                debug!("Probe on {} returned status {}", uplink, response.status);
                None
            }
            Err(e) => {
                debug!("Probe on {} failed: {}", uplink, e);
                None
            }
        };

        let mut events = Vec::new();
        let mut trigger = false;
        {
            let mut state = self.state.write().await;
            if state.uplink.as_deref() != Some(uplink.as_str()) {
                // Bridge changed while the probe was in flight
                return;
            }

            let before = state.tracker.health();
            let after = match latency {
                Some(ms) => {
                    let threshold = state.tracker.latency_threshold(&self.config);
                    if ms > threshold {
                        events.push(MonitorEvent::ThresholdViolation {
                            uplink: uplink.clone(),
                            latency_ms: ms,
                            threshold_ms: threshold,
                        });
                    }
                    state.tracker.record_success(ms, &self.config)
                }
                None => state.tracker.record_failure(&self.config),
            };

            if before != after {
                match after {
                    LinkHealth::Lost => warn!("Uplink {} lost", uplink),
                    LinkHealth::Degraded => info!("Uplink {} degraded", uplink),
                    LinkHealth::Healthy => info!("Uplink {} healthy", uplink),
                }
                events.push(MonitorEvent::HealthChanged {
                    uplink: uplink.clone(),
                    from: before,
                    to: after,
                });
            }

            match after {
                LinkHealth::Healthy => {
                    state.backoff.reset();
                    state.next_trigger_at = None;
                }
                LinkHealth::Lost => {
                    let now = Instant::now();
                    if state.next_trigger_at.map_or(true, |at| now >= at) {
                        let delay = state.backoff.next_delay();
                        state.next_trigger_at = Some(now + delay);
                        trigger = true;
                        events.push(MonitorEvent::ReconnectTriggered {
                            uplink: uplink.clone(),
                            attempt: state.backoff.attempts(),
                            next_delay_secs: delay.as_secs_f64(),
                        });
                    }
                }
                LinkHealth::Degraded => {}
            }
        }

        for event in events {
            self.log_event(event).await;
        }

        if trigger {
            info!("Requesting re-evaluation after losing {}", uplink);
            if self.trigger_tx.send(CycleTrigger::LinkLost).await.is_err() {
                debug!("Evaluation loop gone, dropping reconnect trigger");
            }
        }
    }
}

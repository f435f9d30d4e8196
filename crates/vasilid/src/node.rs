use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{error, info, warn};

use vasili_network::{
    CaptivePortalModule, CardStateStore, EvaluationModule, FallbackCardStore, MemoryPortalStore,
    ModuleKind, NetworkInventory, OpenNetworkModule, PortalPatternStore, RadioPool, RadioState,
    Scanner, SecuredNetworkModule, SpeedtestModule, WirelessBackend,
};

use crate::api::{ApiServer, ApiState};
use crate::bridge::BridgeManager;
use crate::config::Config;
use crate::monitor::{ConnectionMonitor, ReconnectBackoff};
use crate::orchestrator::{CycleTrigger, Orchestrator};
use crate::scoring::NetworkScorer;
use crate::selector::AutoSelector;
use crate::storage::{open_store, DisabledStore, MeasurementStore, SqliteStore};

/// Pending triggers beyond this are dropped; one queued cycle covers them
const TRIGGER_QUEUE: usize = 8;

/// Main service: owns every component and the evaluation loop
pub struct Node {
    config: Config,
    backend: Arc<dyn WirelessBackend>,
    store: Option<Arc<SqliteStore>>,
    pool: RadioPool,
    scanner: Scanner,
    bridge: Arc<BridgeManager>,
    orchestrator: Arc<Orchestrator>,
    monitor: Arc<ConnectionMonitor>,
    selector: Arc<AutoSelector>,
    api_server: Option<ApiServer>,
    api_task: Option<JoinHandle<Result<()>>>,
    trigger_rx: Option<mpsc::Receiver<CycleTrigger>>,
    evaluation: Option<JoinHandle<()>>,
    evaluation_shutdown: broadcast::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Node {
    pub async fn new(config: Config, backend: Arc<dyn WirelessBackend>) -> Result<Self> {
        info!("Initializing node components...");

        // Persistence is optional; everything below works without it
        let store = open_store(&config.storage.url).await;
        let measurements: Arc<dyn MeasurementStore> = match &store {
            Some(store) => store.clone(),
            None => Arc::new(DisabledStore),
        };
        let durable = store.clone().map(|s| s as Arc<dyn CardStateStore>);
        info!(
            "✓ Storage initialized ({})",
            if store.is_some() { "sqlite" } else { "in-memory only" }
        );

        let pool = RadioPool::new(Arc::new(FallbackCardStore::new(durable)));
        info!("✓ Radio pool initialized");

        let inventory = NetworkInventory::new();
        let scanner = Scanner::new(
            config.scanner.to_scanner_config(),
            pool.clone(),
            backend.clone(),
            inventory.clone(),
        );
        info!("✓ Scanner initialized");

        let patterns: Arc<dyn PortalPatternStore> = match &store {
            Some(store) => store.clone(),
            None => Arc::new(MemoryPortalStore::new()),
        };
        let modules = build_modules(&config, &backend, patterns);
        info!(
            "✓ Evaluation modules initialized ({})",
            modules
                .iter()
                .map(|m| m.kind().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let bridge = Arc::new(BridgeManager::new(
            backend.clone(),
            config.interfaces.lan.clone(),
            config.bridge.verify_url.clone(),
        ));
        info!("✓ Bridge manager initialized (LAN: {})", config.interfaces.lan.join(", "));

        let orchestrator = Arc::new(Orchestrator::new(
            config.orchestrator_config(),
            pool.clone(),
            backend.clone(),
            inventory.clone(),
            modules,
            NetworkScorer::new_with_defaults(),
            bridge.clone(),
            measurements.clone(),
        ));
        info!("✓ Orchestrator initialized");

        let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_QUEUE);

        let monitor = Arc::new(ConnectionMonitor::new(
            config.monitor.to_monitor_config(),
            backend.clone(),
            bridge.clone(),
            trigger_tx.clone(),
        ));
        info!("✓ Connection monitor initialized");

        let selector = Arc::new(AutoSelector::new(
            config.auto_selection.enabled,
            Duration::from_secs(config.auto_selection.initial_delay_secs),
            Duration::from_secs(config.auto_selection.evaluation_interval_secs),
            trigger_tx.clone(),
        ));
        info!("✓ Auto-selector initialized");

        let api_server = if config.api.enabled {
            let state = Arc::new(ApiState {
                pool: pool.clone(),
                inventory: inventory.clone(),
                bridge: bridge.clone(),
                orchestrator: orchestrator.clone(),
                monitor: monitor.clone(),
                selector: selector.clone(),
                store: measurements,
                triggers: trigger_tx.clone(),
                started_at: Instant::now(),
            });
            info!("✓ API server initialized on {}:{}", config.api.bind, config.api.port);
            Some(ApiServer::new(config.api.clone(), state))
        } else {
            info!("API server disabled");
            None
        };

        let (evaluation_shutdown, _) = broadcast::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        // The startup cycle runs as soon as the evaluation loop starts
        trigger_tx
            .try_send(CycleTrigger::Startup)
            .context("failed to queue startup cycle")?;

        Ok(Self {
            config,
            backend,
            store,
            pool,
            scanner,
            bridge,
            orchestrator,
            monitor,
            selector,
            api_server,
            api_task: None,
            trigger_rx: Some(trigger_rx),
            evaluation: None,
            evaluation_shutdown,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Vasili services...");

        self.start_radios().await?;

        // The startup cycle needs an inventory to work from
        match self.scanner.scan_once().await {
            Ok(summary) => info!("✓ Initial scan found {} network(s)", summary.found),
            Err(e) => warn!("Initial scan failed: {}", e),
        }

        self.scanner.start().await?;
        info!("✓ Scanner running on {}", self.pool.scanning_interface().unwrap_or_default());

        self.start_evaluation_loop()?;
        info!("✓ Evaluation loop running");

        self.monitor.start().await?;
        info!("✓ Connection monitor running");

        self.selector.start().await?;
        info!("✓ Auto-selector running");

        if let Some(api_server) = &self.api_server {
            self.api_task = Some(api_server.start().await?);
            info!("✓ API server running");
        }

        info!("═══════════════════════════════════════════════");
        info!("  Vasili is now running");
        info!("═══════════════════════════════════════════════");
        if self.config.api.enabled {
            info!("  API: http://{}:{}", self.config.api.bind, self.config.api.port);
        }
        info!(
            "  Radios: {} ({} for connections)",
            self.pool.snapshot().len(),
            self.pool.connection_radio_count()
        );
        info!("  LAN: {}", self.config.interfaces.lan.join(", "));
        info!("  Data Dir: {}", self.config.data_directory.display());
        info!("═══════════════════════════════════════════════");

        self.wait_for_shutdown().await;

        info!("Shutting down Vasili...");
        self.shutdown().await?;

        Ok(())
    }

    /// Detect radios and hand them to the pool; no usable radio is fatal
    async fn start_radios(&mut self) -> Result<()> {
        let detected = self
            .backend
            .wireless_interfaces()
            .await
            .context("failed to list wireless interfaces")?;
        let selected = self.config.interfaces.select(&detected);
        info!(
            "Detected {} wireless interface(s), using {:?}",
            detected.len(),
            selected
        );
        self.recover_card_state(&selected).await;

        self.pool
            .assign_roles(&selected, self.config.interfaces.scan_interface.as_deref())
            .context("no usable wireless radios")?;

        if self.pool.connection_radio_count() == 0 {
            warn!("Only one radio available: scanning only, no uplink will be established");
        }
        Ok(())
    }

    /// Drop associations a previous run left behind on radios we are about to use
    async fn recover_card_state(&self, selected: &[String]) {
        let Some(store) = &self.store else {
            return;
        };

        for interface in selected {
            let previous = match store.load(interface).await {
                Ok(Some(radio)) => radio,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Could not read previous state of {}: {}", interface, e);
                    return;
                }
            };
            if !matches!(previous.state, RadioState::Connecting | RadioState::Connected) {
                continue;
            }
            info!(
                "{} was left {} ({}) by the previous run, disassociating",
                interface,
                previous.state,
                previous.connected_ssid.as_deref().unwrap_or("unknown network")
            );
            if let Err(e) = self.backend.disassociate(interface).await {
                warn!("Failed to disassociate {}: {}", interface, e);
            }
        }

        match store.load_all().await {
            Ok(radios) => {
                for radio in radios.iter().filter(|r| !selected.contains(&r.interface)) {
                    info!("Radio {} from a previous run is no longer in use", radio.interface);
                }
            }
            Err(e) => warn!("Could not read previous card state: {}", e),
        }
    }

    fn start_evaluation_loop(&mut self) -> Result<()> {
        let trigger_rx = self
            .trigger_rx
            .take()
            .context("evaluation loop already started")?;

        let evaluation = EvaluationLoop {
            orchestrator: self.orchestrator.clone(),
            bridge: self.bridge.clone(),
            retry: ReconnectBackoff::new(
                Duration::from_secs(self.config.orchestrator.retry_initial_secs),
                Duration::from_secs(self.config.orchestrator.retry_max_secs),
            ),
        };
        let shutdown_rx = self.evaluation_shutdown.subscribe();
        self.evaluation = Some(tokio::spawn(evaluation.run(trigger_rx, shutdown_rx)));
        Ok(())
    }

    async fn wait_for_shutdown(&mut self) {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C signal");
            }
            _ = self.shutdown_rx.recv() => {
                info!("Received shutdown signal");
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(task) = self.api_task.take() {
            info!("Stopping API server...");
            task.abort();
        }

        info!("Stopping auto-selector...");
        self.selector.shutdown().await;

        info!("Stopping connection monitor...");
        self.monitor.shutdown().await;

        info!("Stopping evaluation loop...");
        let _ = self.evaluation_shutdown.send(());
        if let Some(handle) = self.evaluation.take() {
            if let Err(e) = handle.await {
                error!("Evaluation loop ended abnormally: {}", e);
            }
        }

        info!("Stopping scanner...");
        self.scanner.shutdown().await;

        if let Some(old) = self.bridge.deactivate().await {
            info!("Bridge to {} torn down", old.ssid);
        }

        self.pool.flush().await;

        if let Some(store) = &self.store {
            info!("Closing storage...");
            store.close().await;
        }

        info!("Shutdown complete");
        Ok(())
    }

    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn bridge(&self) -> Arc<BridgeManager> {
        self.bridge.clone()
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        self.orchestrator.clone()
    }

    pub fn pool(&self) -> RadioPool {
        self.pool.clone()
    }
}

fn build_modules(
    config: &Config,
    backend: &Arc<dyn WirelessBackend>,
    patterns: Arc<dyn PortalPatternStore>,
) -> Vec<Arc<dyn EvaluationModule>> {
    let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), config.speedtest_timeout()));

    config
        .modules
        .enabled
        .iter()
        .filter_map(|kind| -> Option<Arc<dyn EvaluationModule>> {
            match kind {
                ModuleKind::Open => Some(Arc::new(OpenNetworkModule::new(backend.clone(), speedtest.clone()))),
                ModuleKind::Secured => Some(Arc::new(SecuredNetworkModule::new(
                    backend.clone(),
                    speedtest.clone(),
                    config.credentials.clone(),
                ))),
                ModuleKind::CaptivePortal => Some(Arc::new(
                    CaptivePortalModule::new(backend.clone(), speedtest.clone())
                        .with_pattern_store(patterns.clone()),
                )),
                // Measurement runs inside every other module
                ModuleKind::Speedtest => None,
            }
        })
        .collect()
}

/// Single consumer of cycle triggers, so cycles never overlap
struct EvaluationLoop {
    orchestrator: Arc<Orchestrator>,
    bridge: Arc<BridgeManager>,
    /// Spacing of retries while no uplink could be established
    retry: ReconnectBackoff,
}

impl EvaluationLoop {
    async fn run(mut self, mut triggers: mpsc::Receiver<CycleTrigger>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut retry_at: Option<Instant> = None;

        loop {
            let trigger = tokio::select! {
                _ = shutdown_rx.recv() => break,
                received = triggers.recv() => match received {
                    Some(trigger) => trigger,
                    None => break,
                },
                _ = wait_until(retry_at) => CycleTrigger::Periodic,
            };

            let outcome = self.orchestrator.run_cycle(trigger).await;

            if self.bridge.current().await.is_some() {
                self.retry.reset();
                retry_at = None;
            } else if outcome.needs_retry() {
                let delay = self.retry.next_delay();
                warn!("No uplink established, retrying in {:?}", delay);
                retry_at = Some(Instant::now() + delay);
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

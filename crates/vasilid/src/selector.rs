use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::orchestrator::CycleTrigger;

/// Requests a periodic re-evaluation while enabled
pub struct AutoSelector {
    initial_delay: Duration,
    evaluation_interval: Duration,
    enabled: Arc<AtomicBool>,
    trigger_tx: mpsc::Sender<CycleTrigger>,
    shutdown_tx: broadcast::Sender<()>,
    task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl AutoSelector {
    pub fn new(
        enabled: bool,
        initial_delay: Duration,
        evaluation_interval: Duration,
        trigger_tx: mpsc::Sender<CycleTrigger>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        Self {
            initial_delay,
            evaluation_interval,
            enabled: Arc::new(AtomicBool::new(enabled)),
            trigger_tx,
            shutdown_tx,
            task: Arc::new(RwLock::new(None)),
        }
    }

    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::SeqCst) {
            info!("Automatic network selection enabled");
        }
    }

    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            info!("Automatic network selection disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<()> {
        info!(
            "Starting auto-selector (first run in {:?}, then every {:?})",
            self.initial_delay, self.evaluation_interval
        );

        let enabled = Arc::clone(&self.enabled);
        let trigger_tx = self.trigger_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval_at(Instant::now() + self.initial_delay, self.evaluation_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Auto-selector shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !enabled.load(Ordering::SeqCst) {
                            continue;
                        }
                        debug!("Periodic re-evaluation due");
                        // A full queue means a cycle is already pending
                        if let Err(mpsc::error::TrySendError::Closed(_)) =
                            trigger_tx.try_send(CycleTrigger::Periodic)
                        {
                            break;
                        }
                    }
                }
            }
        });

        *self.task.write().await = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        if let Some(handle) = self.task.write().await.take() {
            let _ = handle.await;
        }
    }
}

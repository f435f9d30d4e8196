//! Background scanner bound to the scanning radio

use crate::backend::WirelessBackend;
use crate::error::Result;
use crate::inventory::NetworkInventory;
use crate::pool::{LeaseEnd, RadioPool};
use crate::types::NetworkObservation;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub interval: Duration,
    /// Inventory entries not seen for this long are evicted
    pub stale_after: Duration,
    pub max_backoff: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Counts from one scan pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub found: usize,
    pub added: usize,
    pub evicted: usize,
}

#[derive(Clone)]
struct ScanContext {
    config: ScannerConfig,
    pool: RadioPool,
    backend: Arc<dyn WirelessBackend>,
    inventory: NetworkInventory,
}

impl ScanContext {
    async fn scan_once(&self) -> Result<ScanSummary> {
        let lease = self.pool.lease(true)?;
        let interface = lease.interface().to_string();

        let scanned = self.backend.scan(&interface).await;
        let now = Utc::now();
        let raw = match scanned {
            Ok(raw) => {
                lease.release(LeaseEnd::Idle);
                raw
            }
            Err(e) => {
                lease.release(LeaseEnd::Error(e.to_string()));
                // Networks that left still age out while the radio is failing
                let evicted = self.evict_stale(now).await;
                if evicted > 0 {
                    debug!("Evicted {} stale network(s) after failed scan", evicted);
                }
                return Err(e);
            }
        };

        let observations: Vec<NetworkObservation> = raw
            .into_iter()
            .map(|r| NetworkObservation::from_raw(r, now))
            .filter(|o| !o.is_hidden())
            .collect();
        let found = observations.len();
        let added = self.inventory.merge(observations).await;
        let evicted = self.evict_stale(now).await;

        debug!(
            "Scan on {}: {} network(s), {} new, {} evicted",
            interface, found, added, evicted
        );
        Ok(ScanSummary {
            found,
            added,
            evicted,
        })
    }

    async fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        let max_age = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.inventory.evict_older_than(now, max_age).await
    }
}

/// Delay before the next scan after `failures` consecutive failures
pub fn scan_backoff(interval: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
    interval.saturating_mul(factor).min(max.max(interval))
}

/// Periodically refreshes the network inventory
pub struct Scanner {
    ctx: ScanContext,
    shutdown_tx: broadcast::Sender<()>,
    task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl Scanner {
    pub fn new(
        config: ScannerConfig,
        pool: RadioPool,
        backend: Arc<dyn WirelessBackend>,
        inventory: NetworkInventory,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        Self {
            ctx: ScanContext {
                config,
                pool,
                backend,
                inventory,
            },
            shutdown_tx,
            task: Arc::new(RwLock::new(None)),
        }
    }

    /// Run a single scan pass immediately
    pub async fn scan_once(&self) -> Result<ScanSummary> {
        self.ctx.scan_once().await
    }

    pub fn inventory(&self) -> &NetworkInventory {
        &self.ctx.inventory
    }

    /// Start the scan loop. The first scan runs immediately.
    pub async fn start(&self) -> Result<()> {
        let ctx = self.ctx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!("Starting scanner (interval: {:?})", ctx.config.interval);

        let handle = tokio::spawn(async move {
            let mut delay = Duration::ZERO;
            let mut failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Scanner shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        match ctx.scan_once().await {
                            Ok(_) => {
                                if failures > 0 {
                                    info!("Scanning recovered after {} failure(s)", failures);
                                }
                                failures = 0;
                                delay = ctx.config.interval;
                            }
                            Err(e) => {
                                failures = failures.saturating_add(1);
                                delay = scan_backoff(ctx.config.interval, ctx.config.max_backoff, failures);
                                if failures == 1 {
                                    warn!("Scan failed: {} (retrying in {:?})", e, delay);
                                } else {
                                    error!("Scan failed {} times in a row: {} (retrying in {:?})", failures, e, delay);
                                }
                            }
                        }
                    }
                }
            }
        });

        *self.task.write().await = Some(handle);
        Ok(())
    }

    /// Stop the scan loop and wait for it to exit
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.task.write().await.take() {
            let _ = handle.await;
        }
    }
}

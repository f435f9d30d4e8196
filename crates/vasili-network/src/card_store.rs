//! Card state storage
//!
//! Records each radio's role and state so it can be inspected (and recovered)
//! without the pool depending on any particular persistence backend.

use crate::error::Result;
use crate::radio::Radio;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Key/value store of radio records keyed by interface name
#[async_trait::async_trait]
pub trait CardStateStore: Send + Sync {
    /// Whether the store can currently accept calls
    fn is_available(&self) -> bool;

    async fn save(&self, radio: &Radio) -> Result<()>;

    async fn load(&self, interface: &str) -> Result<Option<Radio>>;

    async fn load_all(&self) -> Result<Vec<Radio>>;
}

/// Volatile store; always available
#[derive(Default)]
pub struct MemoryCardStore {
    radios: RwLock<HashMap<String, Radio>>,
}

impl MemoryCardStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CardStateStore for MemoryCardStore {
    fn is_available(&self) -> bool {
        true
    }

    async fn save(&self, radio: &Radio) -> Result<()> {
        self.radios
            .write()
            .await
            .insert(radio.interface.clone(), radio.clone());
        Ok(())
    }

    async fn load(&self, interface: &str) -> Result<Option<Radio>> {
        Ok(self.radios.read().await.get(interface).cloned())
    }

    async fn load_all(&self) -> Result<Vec<Radio>> {
        let mut radios: Vec<Radio> = self.radios.read().await.values().cloned().collect();
        radios.sort_by(|a, b| a.interface.cmp(&b.interface));
        Ok(radios)
    }
}

/// Durable store with in-memory fallback.
///
/// Every record is kept in memory. While the durable store is available it
/// receives a copy of each write; the first durable failure logs a warning
/// and the store stays on memory for the rest of the process lifetime.
pub struct FallbackCardStore {
    durable: Option<Arc<dyn CardStateStore>>,
    memory: MemoryCardStore,
    degraded: AtomicBool,
}

impl FallbackCardStore {
    pub fn new(durable: Option<Arc<dyn CardStateStore>>) -> Self {
        let degraded = match &durable {
            Some(store) if store.is_available() => false,
            Some(_) => {
                warn!("Card state store unavailable, using in-memory state");
                true
            }
            None => true,
        };

        Self {
            durable,
            memory: MemoryCardStore::new(),
            degraded: AtomicBool::new(degraded),
        }
    }

    pub fn memory_only() -> Self {
        Self::new(None)
    }

    /// True once the durable store has been abandoned (or was never present)
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn active_durable(&self) -> Option<&Arc<dyn CardStateStore>> {
        if self.is_degraded() {
            return None;
        }
        self.durable.as_ref()
    }

    fn degrade(&self, reason: &dyn std::fmt::Display) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(
                "Card state store failed ({}), continuing with in-memory state",
                reason
            );
        }
    }
}

#[async_trait::async_trait]
impl CardStateStore for FallbackCardStore {
    fn is_available(&self) -> bool {
        true
    }

    async fn save(&self, radio: &Radio) -> Result<()> {
        self.memory.save(radio).await?;

        if let Some(durable) = self.active_durable() {
            if !durable.is_available() {
                self.degrade(&"store reported unavailable");
            } else if let Err(e) = durable.save(radio).await {
                self.degrade(&e);
            } else {
                debug!("Persisted card state for {}", radio.interface);
            }
        }

        Ok(())
    }

    async fn load(&self, interface: &str) -> Result<Option<Radio>> {
        if let Some(radio) = self.memory.load(interface).await? {
            return Ok(Some(radio));
        }

        if let Some(durable) = self.active_durable() {
            match durable.load(interface).await {
                Ok(radio) => return Ok(radio),
                Err(e) => self.degrade(&e),
            }
        }

        Ok(None)
    }

    async fn load_all(&self) -> Result<Vec<Radio>> {
        self.memory.load_all().await
    }
}

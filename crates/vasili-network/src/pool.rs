//! Radio pool
//!
//! Owns the set of physical radios, assigns exactly one to scanning and
//! hands out exclusive leases on the rest. A lease is a guard: dropping it
//! always returns the radio to the pool.

use crate::backend::WirelessBackend;
use crate::card_store::CardStateStore;
use crate::error::{NetworkError, Result};
use crate::radio::{Radio, RadioRole, RadioState};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

enum StoreCommand {
    Save(Radio),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct PoolState {
    radios: Vec<Radio>,
    scan_holders: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    store_tx: mpsc::UnboundedSender<StoreCommand>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // State is only ever replaced whole, so a poisoned guard is still coherent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, radio: &Radio) {
        if self.store_tx.send(StoreCommand::Save(radio.clone())).is_err() {
            debug!("Card store writer gone, skipping write for {}", radio.interface);
        }
    }

    fn finish_lease(&self, interface: &str, role: RadioRole, ending: &LeaseEnd) {
        let mut state = self.lock();

        if role == RadioRole::Scanning {
            state.scan_holders = state.scan_holders.saturating_sub(1);
            if state.scan_holders > 0 && matches!(ending, LeaseEnd::Idle) {
                return;
            }
        }

        let Some(radio) = state.radios.iter_mut().find(|r| r.interface == interface) else {
            // Radio set was reassigned while the lease was out
            debug!("Released lease for unknown radio {}", interface);
            return;
        };

        match ending {
            LeaseEnd::Idle => radio.transition(RadioState::Idle),
            LeaseEnd::Error(reason) => {
                radio.transition(RadioState::Error);
                radio.last_error = Some(reason.clone());
                warn!("Radio {} released in error state: {}", interface, reason);
            }
        }
        let snapshot = radio.clone();
        drop(state);
        self.persist(&snapshot);
    }
}

/// How a lease ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEnd {
    Idle,
    /// Radio needs a hardware re-check before it can be leased again
    Error(String),
}

/// Scoped claim on a radio
pub struct RadioLease {
    pool: Arc<PoolInner>,
    interface: String,
    role: RadioRole,
    fault: Mutex<Option<String>>,
    released: bool,
}

impl RadioLease {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn role(&self) -> RadioRole {
        self.role
    }

    /// Record that the radio is now associated with `ssid`
    pub fn mark_connected(&self, ssid: &str) {
        let mut state = self.pool.lock();
        if let Some(radio) = state.radios.iter_mut().find(|r| r.interface == self.interface) {
            radio.transition(RadioState::Connected);
            radio.connected_ssid = Some(ssid.to_string());
            let snapshot = radio.clone();
            drop(state);
            self.pool.persist(&snapshot);
        }
    }

    /// Note a hardware-level problem seen while using the radio. The holder
    /// should release to [`LeaseEnd::Error`] so the radio gets re-checked.
    pub fn record_fault(&self, reason: impl Into<String>) {
        let mut fault = self.fault.lock().unwrap_or_else(|e| e.into_inner());
        fault.get_or_insert(reason.into());
    }

    pub fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Return the radio to the pool
    pub fn release(mut self, ending: LeaseEnd) {
        self.released = true;
        self.pool.finish_lease(&self.interface, self.role, &ending);
    }
}

impl std::fmt::Debug for RadioLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioLease")
            .field("interface", &self.interface)
            .field("role", &self.role)
            .finish()
    }
}

impl Drop for RadioLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // A connection lease that was never explicitly released ended abnormally
        // (panic, abort at a deadline), so the radio state is unknown.
        let ending = match self.role {
            RadioRole::Scanning => LeaseEnd::Idle,
            _ => LeaseEnd::Error("lease dropped without release".to_string()),
        };
        self.pool.finish_lease(&self.interface, self.role, &ending);
    }
}

/// Pool of wireless radios
#[derive(Clone)]
pub struct RadioPool {
    inner: Arc<PoolInner>,
}

impl RadioPool {
    /// Create an empty pool. Spawns the task that writes role/state changes
    /// through to `store`, so this must be called inside a Tokio runtime.
    pub fn new(store: Arc<dyn CardStateStore>) -> Self {
        let (store_tx, mut store_rx) = mpsc::unbounded_channel::<StoreCommand>();

        tokio::spawn(async move {
            while let Some(command) = store_rx.recv().await {
                match command {
                    StoreCommand::Save(radio) => {
                        if let Err(e) = store.save(&radio).await {
                            warn!("Failed to record state for {}: {}", radio.interface, e);
                        }
                    }
                    StoreCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
                store_tx,
            }),
        }
    }

    /// Designate the scanning radio and make every other radio connection-eligible.
    ///
    /// The preferred interface wins if present, otherwise the first one listed.
    /// Calling again replaces the radio set.
    pub fn assign_roles(&self, interfaces: &[String], preferred_scan: Option<&str>) -> Result<()> {
        if interfaces.is_empty() {
            return Err(NetworkError::NoRadiosAvailable);
        }

        let scan_interface = preferred_scan
            .filter(|p| interfaces.iter().any(|i| i == p))
            .unwrap_or(interfaces[0].as_str())
            .to_string();

        if let Some(p) = preferred_scan {
            if p != scan_interface {
                warn!("Preferred scan interface {} not present, using {}", p, scan_interface);
            }
        }

        let mut radios = Vec::with_capacity(interfaces.len());
        for interface in interfaces {
            if radios.iter().any(|r: &Radio| &r.interface == interface) {
                continue;
            }
            let role = if *interface == scan_interface {
                RadioRole::Scanning
            } else {
                RadioRole::Connection
            };
            radios.push(Radio::new(interface.clone(), role));
        }

        info!(
            "Assigned {} as scanning radio, {} connection radio(s)",
            scan_interface,
            radios.len() - 1
        );
        if radios.len() == 1 {
            warn!("Only one radio available: observe-only mode, no connections will be tested");
        }

        let mut state = self.inner.lock();
        state.radios = radios.clone();
        state.scan_holders = 0;
        drop(state);

        for radio in &radios {
            self.inner.persist(radio);
        }

        Ok(())
    }

    /// Lease a radio.
    ///
    /// Scanning leases always return the scanning radio. Connection leases
    /// return an idle connection radio and move it to `connecting`, or fail
    /// with [`NetworkError::NoIdleRadio`].
    pub fn lease(&self, for_scanning: bool) -> Result<RadioLease> {
        let mut state = self.inner.lock();
        if state.radios.is_empty() {
            return Err(NetworkError::NoRadiosAvailable);
        }

        let (role, target) = if for_scanning {
            (RadioRole::Scanning, RadioState::Scanning)
        } else {
            (RadioRole::Connection, RadioState::Connecting)
        };

        let radio = state
            .radios
            .iter_mut()
            .find(|r| r.role == role && (for_scanning || r.state == RadioState::Idle))
            .ok_or(NetworkError::NoIdleRadio)?;

        radio.transition(target);
        let snapshot = radio.clone();
        if for_scanning {
            state.scan_holders += 1;
        }
        drop(state);

        debug!("Leased {} ({})", snapshot.interface, role);
        self.inner.persist(&snapshot);

        Ok(RadioLease {
            pool: Arc::clone(&self.inner),
            interface: snapshot.interface,
            role,
            fault: Mutex::new(None),
            released: false,
        })
    }

    /// Re-check radios in the error state; those that pass return to idle.
    /// Returns the number of radios recovered.
    pub async fn recheck_errored(&self, backend: &dyn WirelessBackend) -> usize {
        let errored: Vec<String> = self
            .inner
            .lock()
            .radios
            .iter()
            .filter(|r| r.state == RadioState::Error)
            .map(|r| r.interface.clone())
            .collect();

        let mut recovered = 0;
        for interface in errored {
            if let Err(e) = backend.disassociate(&interface).await {
                debug!("Disassociate during re-check of {} failed: {}", interface, e);
            }
            let check = backend.check_interface(&interface).await;

            let mut state = self.inner.lock();
            let Some(radio) = state
                .radios
                .iter_mut()
                .find(|r| r.interface == interface && r.state == RadioState::Error)
            else {
                continue;
            };

            match check {
                Ok(()) => {
                    radio.transition(RadioState::Idle);
                    info!("Radio {} passed re-check, back to idle", interface);
                    recovered += 1;
                }
                Err(e) => {
                    radio.last_error = Some(e.to_string());
                    warn!("Radio {} failed re-check: {}", interface, e);
                }
            }
            let snapshot = radio.clone();
            drop(state);
            self.inner.persist(&snapshot);
        }

        recovered
    }

    /// Coherent copy of every radio
    pub fn snapshot(&self) -> Vec<Radio> {
        self.inner.lock().radios.clone()
    }

    pub fn scanning_interface(&self) -> Option<String> {
        self.inner
            .lock()
            .radios
            .iter()
            .find(|r| r.role == RadioRole::Scanning)
            .map(|r| r.interface.clone())
    }

    pub fn connection_radio_count(&self) -> usize {
        self.inner
            .lock()
            .radios
            .iter()
            .filter(|r| r.role == RadioRole::Connection)
            .count()
    }

    pub fn idle_connection_count(&self) -> usize {
        self.inner
            .lock()
            .radios
            .iter()
            .filter(|r| r.role == RadioRole::Connection && r.state == RadioState::Idle)
            .count()
    }

    /// Wait until every queued state change has reached the card store
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.store_tx.send(StoreCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedBackend;
    use crate::card_store::{FallbackCardStore, MemoryCardStore};

    fn ifaces(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn pool() -> RadioPool {
        RadioPool::new(Arc::new(FallbackCardStore::memory_only()))
    }

    #[tokio::test]
    async fn test_assign_roles_empty() {
        let pool = pool();
        assert!(matches!(
            pool.assign_roles(&[], None),
            Err(NetworkError::NoRadiosAvailable)
        ));
    }

    #[tokio::test]
    async fn test_assign_roles_preferred() {
        let pool = pool();
        pool.assign_roles(&ifaces(&["wlan0", "wlan1", "wlan2"]), Some("wlan2"))
            .unwrap();
        assert_eq!(pool.scanning_interface().as_deref(), Some("wlan2"));
        assert_eq!(pool.connection_radio_count(), 2);

        // Missing preference falls back to the first interface
        pool.assign_roles(&ifaces(&["wlan0", "wlan1"]), Some("wlan7"))
            .unwrap();
        assert_eq!(pool.scanning_interface().as_deref(), Some("wlan0"));
    }

    #[tokio::test]
    async fn test_connection_leases_are_exclusive() {
        let pool = pool();
        pool.assign_roles(&ifaces(&["wlan0", "wlan1", "wlan2"]), None)
            .unwrap();

        let a = pool.lease(false).unwrap();
        let b = pool.lease(false).unwrap();
        assert_ne!(a.interface(), b.interface());
        assert_ne!(a.interface(), "wlan0");
        assert_ne!(b.interface(), "wlan0");
        assert!(matches!(pool.lease(false), Err(NetworkError::NoIdleRadio)));

        a.release(LeaseEnd::Idle);
        let c = pool.lease(false).unwrap();
        assert_ne!(c.interface(), b.interface());
    }

    #[tokio::test]
    async fn test_scanning_lease_is_non_exclusive() {
        let pool = pool();
        pool.assign_roles(&ifaces(&["wlan0", "wlan1"]), None).unwrap();

        let a = pool.lease(true).unwrap();
        let b = pool.lease(true).unwrap();
        assert_eq!(a.interface(), "wlan0");
        assert_eq!(b.interface(), "wlan0");

        drop(a);
        assert_eq!(pool.snapshot()[0].state, RadioState::Scanning);
        drop(b);
        assert_eq!(pool.snapshot()[0].state, RadioState::Idle);
    }

    #[tokio::test]
    async fn test_single_radio_observe_only() {
        let pool = pool();
        pool.assign_roles(&ifaces(&["wlan0"]), None).unwrap();

        for _ in 0..3 {
            assert!(matches!(pool.lease(false), Err(NetworkError::NoIdleRadio)));
        }
        assert_eq!(pool.lease(true).unwrap().interface(), "wlan0");
    }

    #[tokio::test]
    async fn test_dropped_connection_lease_goes_to_error() {
        let pool = pool();
        pool.assign_roles(&ifaces(&["wlan0", "wlan1"]), None).unwrap();

        let lease = pool.lease(false).unwrap();
        lease.mark_connected("CafeWifi");
        assert_eq!(pool.snapshot()[1].connected_ssid.as_deref(), Some("CafeWifi"));
        drop(lease);

        let radio = &pool.snapshot()[1];
        assert_eq!(radio.state, RadioState::Error);
        assert!(radio.last_error.is_some());
        assert!(matches!(pool.lease(false), Err(NetworkError::NoIdleRadio)));
    }

    #[tokio::test]
    async fn test_recheck_errored_restores_idle() {
        let backend = SimulatedBackend::new();
        backend.add_interface("wlan0");
        backend.add_interface("wlan1");

        let pool = pool();
        pool.assign_roles(&ifaces(&["wlan0", "wlan1"]), None).unwrap();
        pool.lease(false)
            .unwrap()
            .release(LeaseEnd::Error("timeout".to_string()));
        assert_eq!(pool.idle_connection_count(), 0);

        assert_eq!(pool.recheck_errored(&backend).await, 1);
        assert_eq!(pool.idle_connection_count(), 1);
    }

    #[tokio::test]
    async fn test_recheck_keeps_missing_radio_in_error() {
        let backend = SimulatedBackend::new();
        backend.add_interface("wlan0");

        let pool = pool();
        pool.assign_roles(&ifaces(&["wlan0", "wlan1"]), None).unwrap();
        pool.lease(false)
            .unwrap()
            .release(LeaseEnd::Error("unplugged".to_string()));

        assert_eq!(pool.recheck_errored(&backend).await, 0);
        assert_eq!(pool.snapshot()[1].state, RadioState::Error);
    }

    #[tokio::test]
    async fn test_state_written_through_to_store() {
        let store = Arc::new(MemoryCardStore::new());
        let pool = RadioPool::new(store.clone());
        pool.assign_roles(&ifaces(&["wlan0", "wlan1"]), None).unwrap();

        let lease = pool.lease(false).unwrap();
        pool.flush().await;
        let stored = store.load("wlan1").await.unwrap().unwrap();
        assert_eq!(stored.state, RadioState::Connecting);
        assert_eq!(stored.role, RadioRole::Connection);

        lease.release(LeaseEnd::Idle);
        pool.flush().await;
        assert_eq!(
            store.load("wlan1").await.unwrap().unwrap().state,
            RadioState::Idle
        );
    }
}

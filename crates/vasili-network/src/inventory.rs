//! Live inventory of nearby networks
//!
//! Written by the scanner, read by the orchestrator and the status API.
//! Each merge happens under a single write lock, so readers only ever see
//! whole entries.

use crate::types::NetworkObservation;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Networks currently in range, keyed by BSSID
#[derive(Clone, Default)]
pub struct NetworkInventory {
    entries: Arc<RwLock<HashMap<String, NetworkObservation>>>,
}

impl NetworkInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert new networks and refresh known ones in place.
    /// Returns the number of BSSIDs not seen before.
    pub async fn merge(&self, observations: Vec<NetworkObservation>) -> usize {
        let mut entries = self.entries.write().await;
        let mut added = 0;

        for obs in observations {
            match entries.get_mut(&obs.bssid) {
                Some(existing) => *existing = obs,
                None => {
                    debug!("New network {} ({}) signal {}", obs.ssid, obs.bssid, obs.signal);
                    entries.insert(obs.bssid.clone(), obs);
                    added += 1;
                }
            }
        }

        added
    }

    /// Drop entries last seen more than `max_age` before `now`
    pub async fn evict_older_than(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let cutoff = now - max_age;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, obs| obs.last_seen >= cutoff);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("Evicted {} stale network(s)", evicted);
        }
        evicted
    }

    /// All entries, strongest signal first (BSSID breaks ties)
    pub async fn snapshot(&self) -> Vec<NetworkObservation> {
        let mut list: Vec<NetworkObservation> = self.entries.read().await.values().cloned().collect();
        list.sort_by(|a, b| b.signal.cmp(&a.signal).then_with(|| a.bssid.cmp(&b.bssid)));
        list
    }

    pub async fn get(&self, bssid: &str) -> Option<NetworkObservation> {
        self.entries
            .read()
            .await
            .get(&bssid.to_ascii_lowercase())
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EncryptionClass;

    fn obs(bssid: &str, ssid: &str, signal: u8, seen: DateTime<Utc>) -> NetworkObservation {
        NetworkObservation {
            bssid: bssid.to_string(),
            ssid: ssid.to_string(),
            signal,
            signal_dbm: None,
            channel: Some(6),
            frequency_mhz: None,
            encryption: EncryptionClass::Open,
            last_seen: seen,
        }
    }

    #[tokio::test]
    async fn test_merge_is_idempotent() {
        let inventory = NetworkInventory::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);

        assert_eq!(inventory.merge(vec![obs("aa", "CafeWifi", 80, t0)]).await, 1);
        assert_eq!(inventory.merge(vec![obs("aa", "CafeWifi", 80, t1)]).await, 0);

        assert_eq!(inventory.len().await, 1);
        let entry = inventory.get("aa").await.unwrap();
        assert_eq!(entry, obs("aa", "CafeWifi", 80, t1));
    }

    #[tokio::test]
    async fn test_merge_updates_signal_in_place() {
        let inventory = NetworkInventory::new();
        let now = Utc::now();
        inventory.merge(vec![obs("aa", "CafeWifi", 80, now)]).await;
        inventory.merge(vec![obs("aa", "CafeWifi", 40, now)]).await;
        assert_eq!(inventory.get("aa").await.unwrap().signal, 40);
    }

    #[tokio::test]
    async fn test_shared_ssid_distinct_bssids() {
        let inventory = NetworkInventory::new();
        let now = Utc::now();
        inventory
            .merge(vec![obs("aa", "Hotel", 50, now), obs("bb", "Hotel", 70, now)])
            .await;

        let snapshot = inventory.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].bssid, "bb");
    }

    #[tokio::test]
    async fn test_evict_stale() {
        let inventory = NetworkInventory::new();
        let now = Utc::now();
        inventory
            .merge(vec![
                obs("aa", "Fresh", 50, now),
                obs("bb", "Stale", 50, now - Duration::seconds(120)),
            ])
            .await;

        assert_eq!(inventory.evict_older_than(now, Duration::seconds(60)).await, 1);
        assert!(inventory.get("aa").await.is_some());
        assert!(inventory.get("bb").await.is_none());
    }
}

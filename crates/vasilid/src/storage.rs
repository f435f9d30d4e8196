use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vasili_network::{
    AuthMethod, CardStateStore, NetworkError, PortalPattern, PortalPatternStore, PortalType, Radio,
    RadioRole, RadioState,
};

/// One scored measurement of a network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub bssid: String,
    pub ssid: String,
    pub module: String,
    pub interface: String,
    pub signal: u8,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub score: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregated history for one SSID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRanking {
    pub ssid: String,
    pub samples: i64,
    pub average_score: f64,
    pub best_score: f64,
    pub last_seen: DateTime<Utc>,
}

/// Long-term record of measurements.
///
/// Optional: callers check [`MeasurementStore::is_available`] and carry on
/// without history when it is not.
#[async_trait::async_trait]
pub trait MeasurementStore: Send + Sync {
    fn is_available(&self) -> bool;

    async fn record_measurement(&self, record: &MeasurementRecord) -> Result<()>;

    /// Most recent measurements for `ssid`, newest first
    async fn history(&self, ssid: &str, limit: usize) -> Result<Vec<MeasurementRecord>>;

    async fn average_score(&self, ssid: &str) -> Result<Option<f64>>;

    /// SSIDs ranked by average score
    async fn best_networks(&self, limit: usize) -> Result<Vec<NetworkRanking>>;
}

/// Stand-in used when persistence is not configured
#[derive(Debug, Default)]
pub struct DisabledStore;

#[async_trait::async_trait]
impl MeasurementStore for DisabledStore {
    fn is_available(&self) -> bool {
        false
    }

    async fn record_measurement(&self, _record: &MeasurementRecord) -> Result<()> {
        anyhow::bail!("persistence is disabled")
    }

    async fn history(&self, _ssid: &str, _limit: usize) -> Result<Vec<MeasurementRecord>> {
        Ok(Vec::new())
    }

    async fn average_score(&self, _ssid: &str) -> Result<Option<f64>> {
        Ok(None)
    }

    async fn best_networks(&self, _limit: usize) -> Result<Vec<NetworkRanking>> {
        Ok(Vec::new())
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// SQLite-backed measurement history and card state
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Opening database: {}", url);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .with_context(|| format!("Failed to open database {}", url))?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        info!("Running database migrations...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS card_state (
                interface TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                state TEXT NOT NULL,
                connected_ssid TEXT,
                last_error TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bssid TEXT NOT NULL,
                ssid TEXT NOT NULL,
                module TEXT NOT NULL,
                interface TEXT NOT NULL,
                signal INTEGER NOT NULL,
                download_mbps REAL NOT NULL,
                upload_mbps REAL NOT NULL,
                ping_ms REAL NOT NULL,
                score REAL NOT NULL,
                recorded_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_measurements_ssid ON measurements(ssid, recorded_at)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portal_patterns (
                ssid TEXT NOT NULL,
                redirect_domain TEXT NOT NULL,
                landing_url TEXT,
                portal_type TEXT NOT NULL,
                auth_method TEXT NOT NULL,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL,
                PRIMARY KEY (ssid, redirect_domain)
            )
            "#,
        )
        .execute(pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn record_card_state(&self, radio: &Radio) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO card_state (interface, role, state, connected_ssid, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(interface) DO UPDATE SET
                role = excluded.role,
                state = excluded.state,
                connected_ssid = excluded.connected_ssid,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&radio.interface)
        .bind(radio.role.to_string())
        .bind(radio.state.to_string())
        .bind(&radio.connected_ssid)
        .bind(&radio.last_error)
        .bind(radio.last_updated.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_card_state(&self, interface: Option<&str>) -> Result<Vec<Radio>> {
        let rows = match interface {
            Some(iface) => {
                sqlx::query("SELECT * FROM card_state WHERE interface = ?")
                    .bind(iface)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM card_state ORDER BY interface")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|row| -> Result<Radio> {
                let role: String = row.try_get("role")?;
                let state: String = row.try_get("state")?;
                Ok(Radio {
                    interface: row.try_get("interface")?,
                    role: role.parse::<RadioRole>().map_err(anyhow::Error::msg)?,
                    state: state.parse::<RadioState>().map_err(anyhow::Error::msg)?,
                    connected_ssid: row.try_get("connected_ssid")?,
                    last_error: row.try_get("last_error")?,
                    last_updated: from_millis(row.try_get("updated_at")?),
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl MeasurementStore for SqliteStore {
    fn is_available(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn record_measurement(&self, record: &MeasurementRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO measurements
                (bssid, ssid, module, interface, signal, download_mbps, upload_mbps, ping_ms, score, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.bssid)
        .bind(&record.ssid)
        .bind(&record.module)
        .bind(&record.interface)
        .bind(i64::from(record.signal))
        .bind(record.download_mbps)
        .bind(record.upload_mbps)
        .bind(record.ping_ms)
        .bind(record.score)
        .bind(record.recorded_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!("Recorded measurement for {} ({:.1})", record.ssid, record.score);
        Ok(())
    }

    async fn history(&self, ssid: &str, limit: usize) -> Result<Vec<MeasurementRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM measurements WHERE ssid = ? ORDER BY recorded_at DESC, id DESC LIMIT ?",
        )
        .bind(ssid)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<MeasurementRecord> {
                let signal: i64 = row.try_get("signal")?;
                Ok(MeasurementRecord {
                    bssid: row.try_get("bssid")?,
                    ssid: row.try_get("ssid")?,
                    module: row.try_get("module")?,
                    interface: row.try_get("interface")?,
                    signal: signal.clamp(0, 100) as u8,
                    download_mbps: row.try_get("download_mbps")?,
                    upload_mbps: row.try_get("upload_mbps")?,
                    ping_ms: row.try_get("ping_ms")?,
                    score: row.try_get("score")?,
                    recorded_at: from_millis(row.try_get("recorded_at")?),
                })
            })
            .collect()
    }

    async fn average_score(&self, ssid: &str) -> Result<Option<f64>> {
        let row = sqlx::query("SELECT AVG(score) AS avg FROM measurements WHERE ssid = ?")
            .bind(ssid)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<Option<f64>, _>("avg")?)
    }

    async fn best_networks(&self, limit: usize) -> Result<Vec<NetworkRanking>> {
        let rows = sqlx::query(
            r#"
            SELECT ssid,
                   COUNT(*) AS samples,
                   AVG(score) AS average_score,
                   MAX(score) AS best_score,
                   MAX(recorded_at) AS last_seen
            FROM measurements
            GROUP BY ssid
            ORDER BY average_score DESC, ssid ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<NetworkRanking> {
                Ok(NetworkRanking {
                    ssid: row.try_get("ssid")?,
                    samples: row.try_get("samples")?,
                    average_score: row.try_get("average_score")?,
                    best_score: row.try_get("best_score")?,
                    last_seen: from_millis(row.try_get("last_seen")?),
                })
            })
            .collect()
    }
}

fn card_store_error(e: anyhow::Error) -> NetworkError {
    NetworkError::CardStoreUnavailable(e.to_string())
}

#[async_trait::async_trait]
impl CardStateStore for SqliteStore {
    fn is_available(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn save(&self, radio: &Radio) -> vasili_network::Result<()> {
        self.record_card_state(radio).await.map_err(card_store_error)
    }

    async fn load(&self, interface: &str) -> vasili_network::Result<Option<Radio>> {
        let radios = self
            .read_card_state(Some(interface))
            .await
            .map_err(card_store_error)?;
        Ok(radios.into_iter().next())
    }

    async fn load_all(&self) -> vasili_network::Result<Vec<Radio>> {
        self.read_card_state(None).await.map_err(card_store_error)
    }
}

#[async_trait::async_trait]
impl PortalPatternStore for SqliteStore {
    async fn store_pattern(&self, pattern: &PortalPattern) -> vasili_network::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO portal_patterns
                (ssid, redirect_domain, landing_url, portal_type, auth_method, last_seen)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(ssid, redirect_domain) DO UPDATE SET
                landing_url = excluded.landing_url,
                portal_type = excluded.portal_type,
                auth_method = excluded.auth_method,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(&pattern.ssid)
        .bind(&pattern.redirect_domain)
        .bind(&pattern.landing_url)
        .bind(pattern.portal_type.to_string())
        .bind(pattern.auth_method.to_string())
        .bind(pattern.last_seen.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| pattern_store_error(e.into()))?;

        debug!("Stored portal pattern for {} ({})", pattern.ssid, pattern.redirect_domain);
        Ok(())
    }

    async fn get_pattern(&self, ssid: &str) -> vasili_network::Result<Option<PortalPattern>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM portal_patterns
            WHERE ssid = ?
            ORDER BY success_count DESC, last_seen DESC
            LIMIT 1
            "#,
        )
        .bind(ssid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| pattern_store_error(e.into()))?;

        row.map(|row| -> Result<PortalPattern> {
            let portal_type: String = row.try_get("portal_type")?;
            let auth_method: String = row.try_get("auth_method")?;
            let success_count: i64 = row.try_get("success_count")?;
            let failure_count: i64 = row.try_get("failure_count")?;
            Ok(PortalPattern {
                ssid: row.try_get("ssid")?,
                redirect_domain: row.try_get("redirect_domain")?,
                landing_url: row.try_get("landing_url")?,
                portal_type: PortalType::from_label(&portal_type),
                auth_method: auth_method.parse::<AuthMethod>().map_err(anyhow::Error::msg)?,
                success_count: u32::try_from(success_count).unwrap_or(u32::MAX),
                failure_count: u32::try_from(failure_count).unwrap_or(u32::MAX),
                last_seen: from_millis(row.try_get("last_seen")?),
            })
        })
        .transpose()
        .map_err(pattern_store_error)
    }

    async fn record_auth_result(
        &self,
        ssid: &str,
        redirect_domain: &str,
        success: bool,
    ) -> vasili_network::Result<()> {
        let query = if success {
            "UPDATE portal_patterns SET success_count = success_count + 1, last_seen = ? \
             WHERE ssid = ? AND redirect_domain = ?"
        } else {
            "UPDATE portal_patterns SET failure_count = failure_count + 1, last_seen = ? \
             WHERE ssid = ? AND redirect_domain = ?"
        };
        sqlx::query(query)
            .bind(Utc::now().timestamp_millis())
            .bind(ssid)
            .bind(redirect_domain)
            .execute(&self.pool)
            .await
            .map_err(|e| pattern_store_error(e.into()))?;
        Ok(())
    }
}

fn pattern_store_error(e: anyhow::Error) -> NetworkError {
    NetworkError::PatternStoreUnavailable(e.to_string())
}

/// Open the configured store. An empty URL disables persistence; a store
/// that cannot be opened is logged and treated as absent.
pub async fn open_store(url: &str) -> Option<Arc<SqliteStore>> {
    if url.trim().is_empty() {
        info!("Persistence disabled (no storage url)");
        return None;
    }

    match SqliteStore::connect(url).await {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("Continuing without persistence: {:#}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let store = SqliteStore::connect(&url).await.unwrap();
        (dir, store)
    }

    fn record(ssid: &str, score: f64, at_ms: i64) -> MeasurementRecord {
        MeasurementRecord {
            bssid: "02:00:00:00:00:01".to_string(),
            ssid: ssid.to_string(),
            module: "open".to_string(),
            interface: "wlan1".to_string(),
            signal: 80,
            download_mbps: 60.0,
            upload_mbps: 20.0,
            ping_ms: 15.0,
            score,
            recorded_at: from_millis(at_ms),
        }
    }

    #[tokio::test]
    async fn test_measurement_history() {
        let (_dir, store) = store().await;
        assert!(MeasurementStore::is_available(&store));

        store.record_measurement(&record("CafeWifi", 60.0, 1_000)).await.unwrap();
        store.record_measurement(&record("CafeWifi", 70.0, 2_000)).await.unwrap();
        store.record_measurement(&record("HomeNet", 40.0, 1_500)).await.unwrap();

        let history = store.history("CafeWifi", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].score, 70.0);
        assert_eq!(history[0].recorded_at, from_millis(2_000));

        assert_eq!(store.history("CafeWifi", 1).await.unwrap().len(), 1);
        assert_eq!(store.average_score("CafeWifi").await.unwrap(), Some(65.0));
        assert_eq!(store.average_score("Nowhere").await.unwrap(), None);

        let best = store.best_networks(5).await.unwrap();
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].ssid, "CafeWifi");
        assert_eq!(best[0].samples, 2);
        assert_eq!(best[0].best_score, 70.0);
    }

    #[tokio::test]
    async fn test_card_state_upsert() {
        let (_dir, store) = store().await;

        let mut radio = Radio::new("wlan1", RadioRole::Connection);
        store.save(&radio).await.unwrap();

        radio.state = RadioState::Connected;
        radio.connected_ssid = Some("CafeWifi".to_string());
        store.save(&radio).await.unwrap();

        let loaded = store.load("wlan1").await.unwrap().unwrap();
        assert_eq!(loaded.state, RadioState::Connected);
        assert_eq!(loaded.connected_ssid.as_deref(), Some("CafeWifi"));
        assert_eq!(store.load_all().await.unwrap().len(), 1);
        assert!(store.load("wlan9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_portal_patterns_persist() {
        let (_dir, store) = store().await;
        let mut lobby = PortalPattern {
            ssid: "Lobby".to_string(),
            redirect_domain: "portal.lobby.example".to_string(),
            landing_url: Some("http://portal.lobby.example/welcome".to_string()),
            portal_type: PortalType::Generic,
            auth_method: AuthMethod::ClickThrough,
            success_count: 0,
            failure_count: 0,
            last_seen: from_millis(1_000),
        };
        store.store_pattern(&lobby).await.unwrap();
        store
            .record_auth_result("Lobby", "portal.lobby.example", true)
            .await
            .unwrap();

        let fon = PortalPattern {
            redirect_domain: "login.fon.com".to_string(),
            portal_type: PortalType::VendorSpecific("fon".to_string()),
            auth_method: AuthMethod::TermsAccept,
            ..lobby.clone()
        };
        store.store_pattern(&fon).await.unwrap();
        store.record_auth_result("Lobby", "login.fon.com", false).await.unwrap();

        let best = store.get_pattern("Lobby").await.unwrap().unwrap();
        assert_eq!(best.redirect_domain, "portal.lobby.example");
        assert_eq!(best.auth_method, AuthMethod::ClickThrough);
        assert_eq!((best.success_count, best.failure_count), (1, 0));

        // Re-storing refreshes the entry without resetting its counters
        lobby.auth_method = AuthMethod::TermsAccept;
        store.store_pattern(&lobby).await.unwrap();
        let best = store.get_pattern("Lobby").await.unwrap().unwrap();
        assert_eq!(best.auth_method, AuthMethod::TermsAccept);
        assert_eq!(best.success_count, 1);

        assert!(store.get_pattern("Elsewhere").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_store_reports_unavailable() {
        let (_dir, store) = store().await;
        store.close().await;
        assert!(!MeasurementStore::is_available(&store));
        assert!(matches!(
            store.save(&Radio::new("wlan0", RadioRole::Scanning)).await,
            Err(NetworkError::CardStoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_open_store_empty_url_disables() {
        assert!(open_store("").await.is_none());
        assert!(open_store("sqlite:///nonexistent-dir/x/y.db").await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_store() {
        let store = DisabledStore;
        assert!(!store.is_available());
        assert!(store.record_measurement(&record("x", 1.0, 0)).await.is_err());
        assert!(store.best_networks(3).await.unwrap().is_empty());
    }
}

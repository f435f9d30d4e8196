use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use vasili_network::{NetworkInventory, NetworkObservation, Radio, RadioPool};

use crate::bridge::{BridgeManager, BridgeSnapshot};
use crate::config::ApiConfig;
use crate::monitor::{ConnectionMonitor, MonitorEvent, MonitorStatus};
use crate::orchestrator::{CycleOutcome, CycleReport, CycleTrigger, Orchestrator};
use crate::selector::AutoSelector;
use crate::storage::{MeasurementRecord, MeasurementStore, NetworkRanking};

/// API server state
pub struct ApiState {
    pub pool: RadioPool,
    pub inventory: NetworkInventory,
    pub bridge: Arc<BridgeManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub monitor: Arc<ConnectionMonitor>,
    pub selector: Arc<AutoSelector>,
    pub store: Arc<dyn MeasurementStore>,
    pub triggers: mpsc::Sender<CycleTrigger>,
    pub started_at: Instant,
}

/// API server
pub struct ApiServer {
    config: ApiConfig,
    state: Arc<ApiState>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: Arc<ApiState>) -> Self {
        Self { config, state }
    }

    pub async fn start(&self) -> Result<tokio::task::JoinHandle<Result<()>>> {
        let app = router(self.state.clone());

        let bind_addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&bind_addr).await?;

        info!("API server listening on {}", bind_addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .map_err(|e| anyhow::anyhow!("Server error: {}", e))
        });

        Ok(handle)
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Read-only views
        .route("/api/v1/status", get(get_status))
        .route("/api/v1/networks", get(list_networks))
        .route("/api/v1/networks/best", get(best_networks))
        .route("/api/v1/cards", get(list_cards))
        .route("/api/v1/bridge", get(get_bridge))
        .route("/api/v1/cycle", get(get_last_cycle))
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/history/:ssid", get(get_history))
        // Commands
        .route("/api/v1/connect/:bssid", post(connect))
        .route("/api/v1/disconnect", post(disconnect))
        .route("/api/v1/auto-selection", post(set_auto_selection))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

// === Health Check ===

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

// === Status ===

async fn get_status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let last_cycle = state.orchestrator.last_report().await.map(|r| CycleSummary {
        trigger: r.trigger,
        outcome: r.outcome,
        attempts: r.attempts.len(),
        finished_at: r.finished_at.to_rfc3339(),
    });

    Json(StatusResponse {
        status: "running".to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        scanning_interface: state.pool.scanning_interface(),
        connection_radios: state.pool.connection_radio_count(),
        idle_radios: state.pool.idle_connection_count(),
        networks_in_range: state.inventory.len().await,
        bridge: state.bridge.current().await,
        link: state.monitor.status().await,
        auto_selection: state.selector.is_enabled(),
        persistence: state.store.is_available(),
        modules: state.orchestrator.modules(),
        last_cycle,
    })
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    uptime_secs: u64,
    scanning_interface: Option<String>,
    connection_radios: usize,
    idle_radios: usize,
    networks_in_range: usize,
    bridge: Option<BridgeSnapshot>,
    link: MonitorStatus,
    auto_selection: bool,
    persistence: bool,
    modules: Vec<String>,
    last_cycle: Option<CycleSummary>,
}

#[derive(Serialize)]
struct CycleSummary {
    trigger: CycleTrigger,
    outcome: CycleOutcome,
    attempts: usize,
    finished_at: String,
}

// === Inventory and radios ===

async fn list_networks(State(state): State<Arc<ApiState>>) -> Json<Vec<NetworkObservation>> {
    Json(state.inventory.snapshot().await)
}

async fn list_cards(State(state): State<Arc<ApiState>>) -> Json<Vec<Radio>> {
    Json(state.pool.snapshot())
}

async fn get_bridge(State(state): State<Arc<ApiState>>) -> Result<Json<BridgeSnapshot>, ApiError> {
    state
        .bridge
        .current()
        .await
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "no active bridge"))
}

async fn get_last_cycle(State(state): State<Arc<ApiState>>) -> Result<Json<CycleReport>, ApiError> {
    state
        .orchestrator
        .last_report()
        .await
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "no cycle has run yet"))
}

async fn list_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Vec<MonitorEvent>> {
    Json(state.monitor.get_recent_events(query.limit.unwrap_or(20)).await)
}

// === History ===

fn require_store(state: &ApiState) -> Result<(), ApiError> {
    if state.store.is_available() {
        Ok(())
    } else {
        Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "persistence is disabled"))
    }
}

async fn get_history(
    State(state): State<Arc<ApiState>>,
    Path(ssid): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<MeasurementRecord>>, ApiError> {
    require_store(&state)?;
    let records = state.store.history(&ssid, query.limit.unwrap_or(50)).await?;
    Ok(Json(records))
}

async fn best_networks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<NetworkRanking>>, ApiError> {
    require_store(&state)?;
    let ranking = state.store.best_networks(query.limit.unwrap_or(10)).await?;
    Ok(Json(ranking))
}

// === Commands ===

async fn connect(
    State(state): State<Arc<ApiState>>,
    Path(bssid): Path<String>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let Some(network) = state.inventory.get(&bssid).await else {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            format!("network {} is not in range", bssid),
        ));
    };

    state.orchestrator.request_manual(&network.bssid);
    if let Err(e) = state.triggers.try_send(CycleTrigger::Manual) {
        // The override stays pending and applies to the next cycle that runs
        warn!("Could not queue manual cycle: {}", e);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(CommandResponse {
            status: "queued".to_string(),
            detail: format!("evaluating {} ({})", network.ssid, network.bssid),
        }),
    ))
}

async fn disconnect(State(state): State<Arc<ApiState>>) -> Json<CommandResponse> {
    let detail = match state.bridge.deactivate().await {
        Some(old) => format!("disconnected from {}", old.ssid),
        None => "no active bridge".to_string(),
    };
    Json(CommandResponse {
        status: "ok".to_string(),
        detail,
    })
}

#[derive(Deserialize)]
struct AutoSelectionRequest {
    enabled: bool,
}

async fn set_auto_selection(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<AutoSelectionRequest>,
) -> Json<CommandResponse> {
    if request.enabled {
        state.selector.enable();
    } else {
        state.selector.disable();
    }
    Json(CommandResponse {
        status: "ok".to_string(),
        detail: format!("auto-selection {}", if request.enabled { "enabled" } else { "disabled" }),
    })
}

#[derive(Serialize)]
struct CommandResponse {
    status: String,
    detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorConfig;
    use crate::orchestrator::OrchestratorConfig;
    use crate::scoring::NetworkScorer;
    use crate::storage::DisabledStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;
    use vasili_network::{FallbackCardStore, OpenNetworkModule, Scanner, ScannerConfig, SimulatedBackend, SpeedtestModule};

    async fn state() -> (Arc<ApiState>, mpsc::Receiver<CycleTrigger>) {
        let backend = Arc::new(SimulatedBackend::demo());
        let pool = RadioPool::new(Arc::new(FallbackCardStore::memory_only()));
        pool.assign_roles(
            &["wlan0".to_string(), "wlan1".to_string(), "wlan2".to_string()],
            None,
        )
        .unwrap();
        let inventory = NetworkInventory::new();
        Scanner::new(ScannerConfig::default(), pool.clone(), backend.clone(), inventory.clone())
            .scan_once()
            .await
            .unwrap();

        let speedtest = Arc::new(SpeedtestModule::new(backend.clone(), Duration::from_secs(5)));
        let bridge = Arc::new(BridgeManager::new(
            backend.clone(),
            vec!["eth0".to_string()],
            "http://connectivitycheck.gstatic.com/generate_204".to_string(),
        ));
        let store: Arc<dyn MeasurementStore> = Arc::new(DisabledStore);
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig::default(),
            pool.clone(),
            backend.clone(),
            inventory.clone(),
            vec![Arc::new(OpenNetworkModule::new(backend.clone(), speedtest))],
            NetworkScorer::new_with_defaults(),
            bridge.clone(),
            store.clone(),
        ));
        let (tx, rx) = mpsc::channel(4);
        let monitor = Arc::new(ConnectionMonitor::new(
            MonitorConfig::default(),
            backend.clone(),
            bridge.clone(),
            tx.clone(),
        ));
        let selector = Arc::new(AutoSelector::new(
            true,
            Duration::from_secs(10),
            Duration::from_secs(30),
            tx.clone(),
        ));

        let state = Arc::new(ApiState {
            pool,
            inventory,
            bridge,
            orchestrator,
            monitor,
            selector,
            store,
            triggers: tx,
            started_at: Instant::now(),
        });
        (state, rx)
    }

    async fn send(state: &Arc<ApiState>, method: &str, uri: &str, body: Body) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _rx) = state().await;
        let (status, body) = send(&state, "GET", "/health", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_status_and_listings() {
        let (state, _rx) = state().await;

        let (status, body) = send(&state, "GET", "/api/v1/status", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scanning_interface"], "wlan0");
        assert_eq!(body["connection_radios"], 2);
        assert_eq!(body["networks_in_range"], 3);
        assert!(body["bridge"].is_null());

        let (_, networks) = send(&state, "GET", "/api/v1/networks", Body::empty()).await;
        assert_eq!(networks[0]["ssid"], "CafeWifi");

        let (_, cards) = send(&state, "GET", "/api/v1/cards", Body::empty()).await;
        assert_eq!(cards.as_array().unwrap().len(), 3);

        let (status, _) = send(&state, "GET", "/api/v1/bridge", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_history_without_persistence() {
        let (state, _rx) = state().await;
        let (status, _) = send(&state, "GET", "/api/v1/history/CafeWifi", Body::empty()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_connect_queues_manual_cycle() {
        let (state, mut rx) = state().await;

        let (status, _) = send(&state, "POST", "/api/v1/connect/02:00:00:00:00:99", Body::empty()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&state, "POST", "/api/v1/connect/02:00:00:00:00:02", Body::empty()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(rx.recv().await, Some(CycleTrigger::Manual));
        assert_eq!(state.orchestrator.pending_manual().as_deref(), Some("02:00:00:00:00:02"));
    }

    #[tokio::test]
    async fn test_disconnect_and_bridge_view() {
        let (state, _rx) = state().await;
        state.orchestrator.run_cycle(CycleTrigger::Startup).await;

        let (status, bridge) = send(&state, "GET", "/api/v1/bridge", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bridge["ssid"], "CafeWifi");

        let (status, body) = send(&state, "POST", "/api/v1/disconnect", Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detail"], "disconnected from CafeWifi");
        assert!(state.bridge.current().await.is_none());
    }

    #[tokio::test]
    async fn test_toggle_auto_selection() {
        let (state, _rx) = state().await;
        let (status, _) = send(
            &state,
            "POST",
            "/api/v1/auto-selection",
            Body::from(r#"{"enabled": false}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!state.selector.is_enabled());
    }
}

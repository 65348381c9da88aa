//! HTTP control API for the monitor.
//!
//! Routes:
//!   GET  /status          → status doc + process uptime (open)
//!   GET  /wallet-balance  → latest persisted snapshot per wallet (open)
//!   GET  /alerts          → recent alert log (open)
//!   POST /trigger-check   → run one cycle now (bearer auth)
//!   GET  /config          → current runtime settings (bearer auth)
//!   PUT  /config          → update interval / network set (bearer auth)
//!   POST /restart         → reset running flag + immediate cycle (bearer auth)
//!
//! Trigger and restart share the scheduler's cycle mutex, so an API-driven
//! cycle can never overlap a timer-driven one.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::scheduler::{Monitor, SchedulerSettings};
use crate::store::MonitorStore;

#[derive(Clone)]
pub struct ApiState {
    pub monitor: Arc<Mutex<Monitor>>,
    pub store: Arc<Mutex<MonitorStore>>,
    pub settings: Arc<watch::Sender<SchedulerSettings>>,
    pub bearer_token: String,
    pub started_at: Instant,
    // shared with the health-check task, surfaced on /status
    pub last_cycle: Arc<AtomicI64>,
}

#[derive(Debug, Clone, Serialize)]
struct SettingsView {
    interval_secs: u64,
    networks: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    interval_secs: Option<u64>,
    networks: Option<Vec<String>>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/wallet-balance", get(get_wallet_balance))
        .route("/alerts", get(get_alerts))
        .route("/trigger-check", post(trigger_check))
        .route("/config", get(get_config).put(put_config))
        .route("/restart", post(restart))
        .with_state(state)
}

/// Serve until the cancellation token fires.
pub async fn serve(state: ApiState, bind_addr: &str, cancel: CancellationToken) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "control API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Exact-match bearer auth. An unset token locks the authed routes rather
/// than opening them.
fn bearer_ok(header_value: Option<&str>, token: &str) -> bool {
    if token.is_empty() {
        return false;
    }
    match header_value {
        Some(value) => value == format!("Bearer {token}"),
        None => false,
    }
}

fn authorized(headers: &HeaderMap, state: &ApiState) -> bool {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    bearer_ok(value, &state.bearer_token)
}

// --- Handlers ---

async fn get_status(State(state): State<ApiState>) -> impl IntoResponse {
    let status = match state.store.lock().await.get_status().await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "status read failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    Json(json!({
        "status": status,
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

async fn get_wallet_balance(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.lock().await.latest_balances().await {
        Ok(snapshots) => Json(json!({ "balances": snapshots })).into_response(),
        Err(e) => {
            warn!(error = %e, "balance read failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_alerts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.lock().await.recent_alerts(100).await {
        Ok(alerts) => Json(json!({ "alerts": alerts })).into_response(),
        Err(e) => {
            warn!(error = %e, "alert read failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn trigger_check(headers: HeaderMap, State(state): State<ApiState>) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    info!("cycle triggered via API");
    let outcome = state.monitor.lock().await.run_cycle().await;
    state.last_cycle.store(
        chrono::Utc::now().timestamp(),
        std::sync::atomic::Ordering::SeqCst,
    );
    Json(outcome).into_response()
}

async fn get_config(headers: HeaderMap, State(state): State<ApiState>) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let current = state.settings.borrow().clone();
    Json(SettingsView {
        interval_secs: current.interval_secs,
        networks: current.networks,
    })
    .into_response()
}

async fn put_config(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Json(update): Json<SettingsUpdate>,
) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let mut new = state.settings.borrow().clone();
    if let Some(interval) = update.interval_secs {
        if interval == 0 {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "interval_secs must be at least 1" })),
            )
                .into_response();
        }
        new.interval_secs = interval;
    }
    if let Some(networks) = update.networks {
        if networks.is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "networks must not be empty" })),
            )
                .into_response();
        }
        new.networks = networks;
    }

    info!(interval_secs = new.interval_secs, networks = ?new.networks, "settings updated via API");
    if state.settings.send(new.clone()).is_err() {
        warn!("scheduler gone, settings update dropped");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(SettingsView {
        interval_secs: new.interval_secs,
        networks: new.networks,
    })
    .into_response()
}

async fn restart(headers: HeaderMap, State(state): State<ApiState>) -> impl IntoResponse {
    if !authorized(&headers, &state) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    info!("restart requested via API");
    let mut monitor = state.monitor.lock().await;
    monitor.reset_running().await;
    let outcome = monitor.run_cycle().await;
    drop(monitor);
    state.last_cycle.store(
        chrono::Utc::now().timestamp(),
        std::sync::atomic::Ordering::SeqCst,
    );
    Json(json!({ "restarted": true, "cycle": outcome })).into_response()
}

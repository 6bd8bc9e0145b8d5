use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::prism::{logging, reload, telemetry, tunnel};

/// The admin HTTP surface is a thin consumer of the core's snapshots; nothing
/// here holds state of its own.
#[derive(Clone)]
pub struct AdminState {
    pub metrics: telemetry::SharedMetrics,
    pub sessions: telemetry::SharedSessions,
    pub tracker: Arc<telemetry::ListenerTracker>,
    pub manager: Arc<reload::ConfigManager>,
    pub registry: Option<Arc<tunnel::registry::Registry>>,
}

pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let shared = Arc::new(state);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/conns", get(conns))
        .route("/logs", get(logs))
        .route("/tunnel/services", get(tunnel_services))
        .route("/reload", post(reload_handler))
        .route("/config", get(config_path))
        .with_state(shared)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() {
                    break;
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let ok = st.tracker.healthy();
    let code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthResponse { ok }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.metrics.snapshot()))
}

async fn conns(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.sessions.snapshot()))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn logs(Query(q): Query<LogsQuery>) -> impl IntoResponse {
    let snap = match logging::log_tail() {
        Some(tail) => tail.snapshot(q.limit.unwrap_or(200)),
        None => logging::LogSnapshot {
            lines: Vec::new(),
            dropped: 0,
        },
    };
    (StatusCode::OK, Json(snap))
}

async fn tunnel_services(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = match &st.registry {
        Some(reg) => reg.snapshot_services().await,
        None => Vec::new(),
    };
    (StatusCode::OK, Json(snap))
}

async fn reload_handler(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    match st.manager.reload_now() {
        Ok(_) => (StatusCode::OK, "ok\n".to_string()),
        Err(err) => (StatusCode::BAD_REQUEST, format!("{err:#}\n")),
    }
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config_path(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.manager.path().display().to_string(),
        }),
    )
}

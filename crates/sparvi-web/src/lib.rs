//! JSON surface over a running next-run coordinator.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sparvi_client::HttpAutomationApi;
use sparvi_core::UpcomingRun;
use sparvi_poller::{CoordinatorConfig, NextRunCoordinator, PollError, PollPhase};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const CRATE_NAME: &str = "sparvi-web";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<NextRunCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<NextRunCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NextRunSummary {
    pub phase: PollPhase,
    pub overdue_count: usize,
    pub has_overdue: bool,
    pub running_count: usize,
    pub next_upcoming: Option<UpcomingRun>,
    pub circuit_open: bool,
    pub consecutive_error_count: u32,
    pub loading: bool,
    pub error: Option<PollError>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl NextRunSummary {
    pub fn from_coordinator(coordinator: &NextRunCoordinator) -> Self {
        let state = coordinator.state();
        Self {
            phase: coordinator.phase(),
            overdue_count: state.next_runs.overdue_count(),
            has_overdue: state.next_runs.has_overdue(),
            running_count: state.next_runs.running_count(),
            next_upcoming: state.next_runs.next_upcoming(),
            circuit_open: state.circuit_open,
            consecutive_error_count: state.consecutive_error_count,
            loading: state.loading,
            error: state.error,
            last_updated: state.last_updated,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct NextRunQuery {
    connection_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub connection_id: String,
    pub automation_type: String,
    pub success: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/next-runs", get(next_runs_handler))
        .route("/next-runs/summary", get(summary_handler))
        .route("/next-runs/refresh", post(refresh_handler))
        .route("/next-runs/{automation_type}", get(next_run_handler))
        .route(
            "/connections/{connection_id}/automations/{automation_type}/trigger",
            post(trigger_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(coordinator: Arc<NextRunCoordinator>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "serving next-run api");
    axum::serve(listener, app(AppState::new(coordinator.clone())))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving http")?;
    coordinator.stop();
    Ok(())
}

/// Serve with an api client and coordinator configured from the environment.
pub async fn serve_from_env(addr: SocketAddr) -> anyhow::Result<()> {
    let api = Arc::new(HttpAutomationApi::from_env().context("building automation api client")?);
    let coordinator = Arc::new(NextRunCoordinator::spawn(api, CoordinatorConfig::from_env()));
    serve(coordinator, addr).await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn next_runs_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.coordinator.state()).into_response()
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(NextRunSummary::from_coordinator(&state.coordinator)).into_response()
}

async fn next_run_handler(
    State(state): State<Arc<AppState>>,
    Path(automation_type): Path<String>,
    Query(query): Query<NextRunQuery>,
) -> Response {
    match state
        .coordinator
        .next_run(&automation_type, query.connection_id.as_deref())
    {
        Some(info) => Json(info).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("no next run for {automation_type}") })),
        )
            .into_response(),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    state.coordinator.refresh().await;
    Json(state.coordinator.state()).into_response()
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Path((connection_id, automation_type)): Path<(String, String)>,
) -> Response {
    let success = state
        .coordinator
        .trigger_manual_run_for(&connection_id, &automation_type)
        .await;
    let status = if success {
        StatusCode::ACCEPTED
    } else {
        StatusCode::BAD_GATEWAY
    };
    (
        status,
        Json(TriggerResponse {
            connection_id,
            automation_type,
            success,
        }),
    )
        .into_response()
}

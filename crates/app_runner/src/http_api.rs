//! Read-only HTTP surface. Every GET serializes the current snapshot; the
//! single POST flips the operator kill switch. No endpoint carries logic.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use core_types::AgentStatus;
use metrics_exporter_prometheus::PrometheusHandle;
use plan_builder::SnapshotStore;
use serde::Serialize;
use state_store::StateStore;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<StateStore>,
    pub snapshots: SnapshotStore,
    pub day: NaiveDate,
    pub prometheus: PrometheusHandle,
    pub config_view: Arc<serde_json::Value>,
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    plan_status: core_types::PlanStatus,
    risk: core_types::RiskState,
    kill_switch: bool,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/state", get(live_state))
        .route("/api/plan", get(plan))
        .route("/api/config", get(config))
        .route("/control/kill", post(kill))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let snap = state.store.snapshot();
    let degraded = snap
        .agents
        .values()
        .any(|a| a.status != AgentStatus::Ok);
    Json(HealthResp {
        status: if degraded { "warn" } else { "ok" },
        plan_status: snap.meta.plan_status,
        risk: snap.meta.risk_state.clone(),
        kill_switch: snap.kill_switch,
    })
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    state.prometheus.render()
}

async fn live_state(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.store.snapshot().as_ref().clone())
}

async fn plan(State(state): State<ApiState>) -> impl IntoResponse {
    match state.snapshots.read(state.day).await {
        Ok(Some(snapshot)) => Json(serde_json::json!(snapshot)),
        Ok(None) => Json(serde_json::json!({ "date": state.day, "status": "MISSING" })),
        Err(err) => {
            tracing::warn!(?err, "plan read failed");
            Json(serde_json::json!({ "date": state.day, "status": "MISSING" }))
        }
    }
}

async fn config(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.config_view.as_ref().clone())
}

async fn kill(State(state): State<ApiState>) -> impl IntoResponse {
    state.store.apply(|s| s.kill_switch = true);
    tracing::warn!("kill switch engaged via control api");
    Json(serde_json::json!({ "ok": true, "kill_switch": true }))
}

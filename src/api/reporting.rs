//! Read-only projections for the dashboard and other collaborators. The
//! display layer gets no mutation path into pipeline state; the only
//! accepted write is the operator acknowledgment of an alert.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use super::error::ApiError;
use crate::domain::{Forecast, DeviationReport, Schedule, ScheduleRecord, TunnelState};
use crate::supervisor::{Alert, AppState, ComplianceSnapshot, SystemReport};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/state", get(tunnel_state))
        .route("/schedule", get(schedule))
        .route("/schedule/export", get(schedule_export))
        .route("/forecast", get(forecast))
        .route("/compliance", get(compliance))
        .route("/deviation", get(deviation))
        .route("/alerts", get(alerts))
        .route("/alerts/:id/ack", post(acknowledge_alert))
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn status(State(state): State<AppState>) -> Json<SystemReport> {
    Json(state.supervisor.system_report().await)
}

async fn tunnel_state(State(state): State<AppState>) -> Json<TunnelState> {
    Json(state.supervisor.system_report().await.state)
}

async fn schedule(State(state): State<AppState>) -> Result<Json<Schedule>, ApiError> {
    state
        .supervisor
        .system_report()
        .await
        .schedule
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("active schedule".into()))
}

async fn schedule_export(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScheduleRecord>>, ApiError> {
    state
        .supervisor
        .system_report()
        .await
        .schedule
        .map(|s| Json(s.export_records()))
        .ok_or_else(|| ApiError::NotFound("active schedule".into()))
}

async fn forecast(State(state): State<AppState>) -> Result<Json<Forecast>, ApiError> {
    state
        .supervisor
        .system_report()
        .await
        .forecast
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("forecast".into()))
}

async fn compliance(State(state): State<AppState>) -> Json<ComplianceSnapshot> {
    Json(state.supervisor.system_report().await.compliance)
}

async fn deviation(State(state): State<AppState>) -> Result<Json<DeviationReport>, ApiError> {
    state
        .supervisor
        .system_report()
        .await
        .last_deviation
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("deviation report".into()))
}

async fn alerts(State(state): State<AppState>) -> Json<Vec<Alert>> {
    Json(state.supervisor.system_report().await.alerts)
}

#[derive(Serialize)]
struct AckResponse {
    acknowledged: bool,
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AckResponse>, ApiError> {
    if state.supervisor.acknowledge_alert(id).await {
        Ok(Json(AckResponse { acknowledged: true }))
    } else {
        Err(ApiError::NotFound(format!("alert {}", id)))
    }
}

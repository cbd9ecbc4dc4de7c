//! Operational surface: health, readiness, metrics, event log browsing.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use fleet_common::errors::{ApiError, ErrorCode};
use serde::Deserialize;
use serde_json::json;

use super::AppState;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// Ready only once a trivial query round-trips against the pool; used by
/// orchestrators that should not route traffic to a device still warming
/// up its connection pool.
pub async fn readyz(State(state): State<AppState>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready" })),
        )
            .into_response(),
    }
}

pub async fn metrics() -> Result<Response, ApiError> {
    let body = crate::metrics::encode()
        .map_err(|_| ApiError::new(ErrorCode::Internal, "failed to encode metrics"))?;
    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub aggregate_kind: Option<String>,
    pub aggregate_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(q): Query<ListEventsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);

    let events = match (q.aggregate_kind, q.aggregate_id) {
        (Some(kind), Some(id)) => {
            state
                .events
                .get_aggregate_events(&kind, &id, q.since, limit)
                .await?
        }
        _ => state.events.get_recent(limit).await?,
    };

    Ok(Json(json!(events)))
}

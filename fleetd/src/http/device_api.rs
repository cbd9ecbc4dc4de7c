//! Device-facing endpoints.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use fleet_common::errors::{ApiError, ErrorCode};
use fleet_common::types::{DeviceJobState, StateDocument};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::auth::DeviceAuth;
use super::AppState;
use crate::state_store::{self, PollResult};

pub async fn get_target_state(
    State(state): State<AppState>,
    _auth: DeviceAuth,
    Path(uuid): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let if_none_match = headers
        .get(axum::http::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());

    match state.state_store.get_target_state(uuid, if_none_match).await? {
        PollResult::NotModified => Ok(StatusCode::NOT_MODIFIED.into_response()),
        PollResult::Body(read) => {
            let mut body = serde_json::Map::new();
            body.insert(
                uuid.to_string(),
                json!({ "apps": read.body.apps, "config": read.body.config }),
            );
            let body = Value::Object(body);
            Ok((
                StatusCode::OK,
                [(axum::http::header::ETAG, read.etag)],
                Json(body),
            )
                .into_response())
        }
    }
}

pub async fn report_current_state(
    State(state): State<AppState>,
    _auth: DeviceAuth,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    state_store::reject_legacy_image_shape(&body)?;
    let device_uuid = body
        .get("uuid")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| ApiError::new(ErrorCode::TargetStateShapeInvalid, "body must include a device uuid"))?;
    let doc: StateDocument = serde_json::from_value(body)
        .map_err(|e| ApiError::new(ErrorCode::TargetStateShapeInvalid, format!("malformed state document: {e}")))?;

    state.state_store.report_current_state(device_uuid, &doc).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn upload_logs(
    State(state): State<AppState>,
    _auth: DeviceAuth,
    Path(uuid): Path<Uuid>,
    body: axum::body::Bytes,
) -> Result<StatusCode, ApiError> {
    state.state_store.touch_last_contact(uuid).await?;
    state
        .events
        .publish(
            "device.logs_uploaded",
            "device",
            &uuid.to_string(),
            &json!({ "bytes": body.len() }),
            Default::default(),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn next_job(
    State(state): State<AppState>,
    _auth: DeviceAuth,
    Path(uuid): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    match state.jobs.claim_next(uuid).await? {
        Some(status) => {
            let job = sqlx::query("SELECT job_name, document FROM jobs WHERE job_id = $1")
                .bind(status.job_id)
                .fetch_optional(&state.pool)
                .await
                .map_err(|e| crate::dberror::classify("read_next_job_document", e))?;
            let (job_name, document): (String, Value) = match job {
                Some(row) => {
                    use sqlx::Row;
                    (
                        row.try_get("job_name").unwrap_or_default(),
                        row.try_get("document").unwrap_or(json!({})),
                    )
                }
                None => (String::new(), json!({})),
            };
            Ok(Json(json!({
                "job_id": status.job_id,
                "job_name": job_name,
                "job_document": document,
            })))
        }
        None => Ok(Json(json!({}))),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobStatusUpdate {
    pub status: DeviceJobState,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub status_details: Option<Value>,
}

pub async fn update_job_status(
    State(state): State<AppState>,
    _auth: DeviceAuth,
    Path((uuid, job_id)): Path<(Uuid, Uuid)>,
    Json(update): Json<JobStatusUpdate>,
) -> Result<StatusCode, ApiError> {
    state
        .jobs
        .report_status(
            job_id,
            uuid,
            update.status,
            update.status_details,
            update.exit_code,
            update.stdout,
            update.stderr,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

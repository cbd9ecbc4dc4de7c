//! Registry webhook endpoint.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use fleet_common::errors::{ApiError, ErrorCode};
use serde_json::{json, Value};

use super::AppState;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub async fn docker_registry(
    State(state): State<AppState>,
    headers: HeaderMap,
    raw_body: Bytes,
) -> Result<(StatusCode, axum::Json<Value>), ApiError> {
    let signature_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let payload: Value = serde_json::from_slice(&raw_body)
        .map_err(|e| ApiError::new(ErrorCode::WebhookPayloadUnrecognized, format!("body is not valid JSON: {e}")))?;

    let outcome = super::dispatch_webhook(&state, &raw_body, signature_header, &payload).await?;

    Ok((
        StatusCode::OK,
        axum::Json(json!({
            "image_name": outcome.image_name,
            "tag": outcome.tag,
            "rollout_id": outcome.rollout_id,
        })),
    ))
}

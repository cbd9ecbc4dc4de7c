//! HTTP Surface.
//!
//! A small `AppState` is threaded through every handler via `State`, one
//! module per surface area, with `tower-http`'s `TraceLayer` wrapping the
//! whole router rather than each handler logging for itself.

mod auth;
mod device_api;
mod operator_api;
mod ops_api;
mod webhook_api;

use std::time::{Duration, Instant};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use fleet_common::errors::{ApiError, ErrorKind};
use serde_json::json;
use sqlx::postgres::PgPool;
use tower_http::trace::TraceLayer;

use crate::applications::ApplicationStore;
use crate::event_log::EventLog;
use crate::id_allocator::IdAllocator;
use crate::jobs::JobDispatcher;
use crate::rollout::{PolicyStore, RollbackManager, RolloutOrchestrator};
use crate::state_store::StateStore;
use crate::webhook;

pub use auth::{DeviceAuth, OperatorAuth};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub events: EventLog,
    pub state_store: StateStore,
    pub id_allocator: IdAllocator,
    pub applications: ApplicationStore,
    pub policies: PolicyStore,
    pub orchestrator: RolloutOrchestrator,
    pub rollback: RollbackManager,
    pub jobs: JobDispatcher,
    pub webhook_secret: Option<String>,
    pub api_version: String,
    pub started_at: Instant,
    pub heartbeat_tick: Duration,
    pub offline_threshold: Duration,
}

pub fn create_router(state: AppState) -> Router {
    let version = state.api_version.clone();

    let device_routes = Router::new()
        .route("/device/:uuid/state", get(device_api::get_target_state))
        .route("/device/state", patch(device_api::report_current_state))
        .route("/device/:uuid/logs", post(device_api::upload_logs))
        .route("/devices/:uuid/jobs/next", get(device_api::next_job))
        .route(
            "/devices/:uuid/jobs/:job_id/status",
            patch(device_api::update_job_status),
        );

    let operator_routes = Router::new()
        .route("/devices", get(operator_api::list_devices))
        .route(
            "/devices/:uuid",
            get(operator_api::get_device).delete(operator_api::delete_device),
        )
        .route("/devices/:uuid/active", patch(operator_api::set_device_active))
        .route(
            "/devices/:uuid/target-state",
            post(operator_api::replace_target_state),
        )
        .route(
            "/devices/:uuid/apps",
            post(operator_api::add_app),
        )
        .route(
            "/devices/:uuid/apps/:app_id",
            patch(operator_api::patch_app).delete(operator_api::remove_app),
        )
        .route(
            "/applications",
            get(operator_api::list_applications).post(operator_api::create_application),
        )
        .route(
            "/applications/:id",
            get(operator_api::get_application)
                .patch(operator_api::update_application)
                .delete(operator_api::delete_application),
        )
        .route("/apps/next-id", post(operator_api::next_app_id))
        .route("/services/next-id", post(operator_api::next_service_id))
        .route("/rollouts", get(operator_api::list_rollouts))
        .route("/rollouts/:id", get(operator_api::get_rollout))
        .route("/rollouts/:id/devices", get(operator_api::get_rollout_devices))
        .route("/rollouts/:id/pause", post(operator_api::pause_rollout))
        .route("/rollouts/:id/resume", post(operator_api::resume_rollout))
        .route("/rollouts/:id/cancel", post(operator_api::cancel_rollout))
        .route(
            "/rollouts/:id/rollback-all",
            post(operator_api::rollback_all),
        )
        .route(
            "/rollouts/:id/rollback-device",
            post(operator_api::rollback_device),
        )
        .route(
            "/image-policies",
            get(operator_api::list_policies).post(operator_api::create_policy),
        )
        .route(
            "/image-policies/:id",
            patch(operator_api::update_policy).delete(operator_api::delete_policy),
        )
        .route("/jobs/execute", post(operator_api::execute_job))
        .route("/jobs/:id", get(operator_api::get_job))
        .route("/jobs", get(operator_api::list_jobs))
        .route(
            "/jobs/templates",
            get(operator_api::list_job_templates).post(operator_api::create_job_template),
        )
        .route("/admin/heartbeat", get(operator_api::heartbeat_status))
        .route(
            "/admin/heartbeat/check",
            post(operator_api::heartbeat_check),
        );

    let ops_routes = Router::new()
        .route("/healthz", get(ops_api::healthz))
        .route("/readyz", get(ops_api::readyz))
        .route("/metrics", get(ops_api::metrics))
        .route(&format!("/api/{version}/events"), get(ops_api::list_events));

    Router::new()
        .merge(device_routes)
        .merge(operator_routes)
        .merge(ops_routes)
        .route(
            "/webhooks/docker-registry",
            post(webhook_api::docker_registry),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Every handler returns `Result<T, ApiError>`; this maps the error
/// taxonomy to HTTP status codes and the `{error, message}` body shape.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(json!({ "error": self.code, "message": self.message })),
        )
            .into_response()
    }
}

pub(crate) fn webhook_secret(state: &AppState) -> Option<&str> {
    state.webhook_secret.as_deref()
}

pub(crate) async fn dispatch_webhook(
    state: &AppState,
    raw_body: &[u8],
    signature_header: Option<&str>,
    payload: &serde_json::Value,
) -> Result<webhook::WebhookOutcome, ApiError> {
    webhook::handle(&state.orchestrator, webhook_secret(state), raw_body, signature_header, payload).await
}

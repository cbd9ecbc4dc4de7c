//! Operator-facing endpoints: devices, applications, rollouts, policies,
//! jobs, admin heartbeat.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use fleet_common::errors::{ApiError, ErrorCode};
use fleet_common::types::{
    AppEntry, Device, DeviceFilter, HealthCheckSpec, Job, JobAggregateStatus, JobTargetType,
    RolloutPolicy, RolloutStrategy, ServiceEntry, StateDocument,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::Row;
use uuid::Uuid;

use super::auth::OperatorAuth;
use super::AppState;
use crate::applications::CreateApplication;
use crate::id_allocator::IdKind;
use crate::jobs::CreateJobRequest;
use crate::liveness::LivenessMonitor;

// -- Devices --

pub async fn list_devices(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Vec<Device>>, ApiError> {
    let rows = sqlx::query("SELECT * FROM devices ORDER BY created_at ASC")
        .fetch_all(&state.pool)
        .await
        .map_err(|e| crate::dberror::classify("list_devices", e))?;
    Ok(Json(rows.into_iter().map(row_to_device).collect::<Result<Vec<_>, _>>()?))
}

pub async fn get_device(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(uuid): Path<Uuid>,
) -> Result<Json<Device>, ApiError> {
    let row = sqlx::query("SELECT * FROM devices WHERE uuid = $1")
        .bind(uuid)
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| crate::dberror::classify("get_device", e))?
        .ok_or_else(|| ApiError::new(ErrorCode::DeviceNotFound, "no such device"))?;
    Ok(Json(row_to_device(row)?))
}

#[derive(Debug, Deserialize)]
pub struct SetActiveRequest {
    pub is_active: bool,
}

pub async fn set_device_active(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(uuid): Path<Uuid>,
    Json(req): Json<SetActiveRequest>,
) -> Result<StatusCode, ApiError> {
    let result = sqlx::query("UPDATE devices SET is_active = $2 WHERE uuid = $1")
        .bind(uuid)
        .bind(req.is_active)
        .execute(&state.pool)
        .await
        .map_err(|e| crate::dberror::classify("set_device_active", e))?;
    if result.rows_affected() == 0 {
        return Err(ApiError::new(ErrorCode::DeviceNotFound, "no such device"));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Deletion cascades to target/current state, rollout device rows, and
/// job status rows via `ON DELETE CASCADE`; an in-flight rollout simply
/// excludes this device from its next tick's denominators.
pub async fn delete_device(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(uuid): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let result = sqlx::query("DELETE FROM devices WHERE uuid = $1")
        .bind(uuid)
        .execute(&state.pool)
        .await
        .map_err(|e| crate::dberror::classify("delete_device", e))?;
    if result.rows_affected() == 0 {
        return Err(ApiError::new(ErrorCode::DeviceNotFound, "no such device"));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn replace_target_state(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(uuid): Path<Uuid>,
    Json(doc): Json<StateDocument>,
) -> Result<Json<Value>, ApiError> {
    let version = state.state_store.replace_target_state(uuid, &doc).await?;
    Ok(Json(json!({ "version": version })))
}

#[derive(Debug, Deserialize)]
pub struct AddAppRequest {
    pub app_id: i64,
    pub app_name: String,
    pub services: Vec<ServiceEntry>,
}

pub async fn add_app(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(uuid): Path<Uuid>,
    Json(req): Json<AddAppRequest>,
) -> Result<Json<Value>, ApiError> {
    let app_id = req.app_id;
    let version = state
        .state_store
        .patch_target_state_app(uuid, app_id, move |doc| {
            doc.apps.insert(
                app_id,
                AppEntry {
                    app_id,
                    app_name: req.app_name,
                    services: req.services,
                },
            );
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "version": version })))
}

#[derive(Debug, Deserialize)]
pub struct PatchAppRequest {
    pub services: Option<Vec<ServiceEntry>>,
    pub app_name: Option<String>,
}

pub async fn patch_app(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path((uuid, app_id)): Path<(Uuid, i64)>,
    Json(req): Json<PatchAppRequest>,
) -> Result<Json<Value>, ApiError> {
    let version = state
        .state_store
        .patch_target_state_app(uuid, app_id, move |doc| {
            let app = doc.apps.get_mut(&app_id).ok_or_else(|| {
                ApiError::new(ErrorCode::TargetStateShapeInvalid, "device has no such app")
            })?;
            if let Some(services) = req.services {
                app.services = services;
            }
            if let Some(name) = req.app_name {
                app.app_name = name;
            }
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "version": version })))
}

pub async fn remove_app(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path((uuid, app_id)): Path<(Uuid, i64)>,
) -> Result<Json<Value>, ApiError> {
    let version = state
        .state_store
        .patch_target_state_app(uuid, app_id, move |doc| {
            doc.apps.remove(&app_id);
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "version": version })))
}

fn row_to_device(row: sqlx::postgres::PgRow) -> Result<Device, ApiError> {
    Ok(Device {
        uuid: row
            .try_get("uuid")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed device row"))?,
        display_name: row.try_get("display_name").unwrap_or_default(),
        device_type: row.try_get("device_type").unwrap_or_default(),
        is_active: row.try_get("is_active").unwrap_or(true),
        is_online: row.try_get("is_online").unwrap_or(false),
        last_contact_at: row.try_get("last_contact_at").unwrap_or(None),
        created_at: row
            .try_get("created_at")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed device row"))?,
    })
}

// -- Applications --

#[derive(Debug, Deserialize)]
pub struct CreateApplicationRequest {
    pub app_name: String,
    pub slug: String,
    pub description: Option<String>,
    pub default_config: Option<Value>,
}

pub async fn create_application(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Json(req): Json<CreateApplicationRequest>,
) -> Result<Json<Value>, ApiError> {
    let app_id = state
        .id_allocator
        .allocate(IdKind::App, &req.app_name, json!({ "slug": req.slug }))
        .await?;
    state
        .applications
        .create(CreateApplication {
            app_id,
            name: req.app_name,
            slug: req.slug,
            description: req.description,
            default_config: req.default_config.unwrap_or(json!({})),
        })
        .await?;
    Ok(Json(json!({ "appId": app_id })))
}

pub async fn list_applications(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.applications.list().await?)))
}

pub async fn get_application(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.applications.get(id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateApplicationRequest {
    pub app_name: Option<String>,
    pub description: Option<Option<String>>,
    pub default_config: Option<Value>,
}

pub async fn update_application(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<i64>,
    Json(req): Json<UpdateApplicationRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .applications
        .update(id, req.app_name, req.description, req.default_config)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_application(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.applications.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct NextAppIdRequest {
    pub app_name: String,
    pub metadata: Option<Value>,
}

pub async fn next_app_id(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Json(req): Json<NextAppIdRequest>,
) -> Result<Json<Value>, ApiError> {
    let app_id = state
        .id_allocator
        .allocate(IdKind::App, &req.app_name, req.metadata.unwrap_or(json!({})))
        .await?;
    Ok(Json(json!({ "appId": app_id })))
}

#[derive(Debug, Deserialize)]
pub struct NextServiceIdRequest {
    pub service_name: String,
    pub app_id: i64,
    pub metadata: Option<Value>,
}

pub async fn next_service_id(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Json(req): Json<NextServiceIdRequest>,
) -> Result<Json<Value>, ApiError> {
    let service_id = state
        .id_allocator
        .allocate(
            IdKind::Service,
            &req.service_name,
            json!({ "app_id": req.app_id, "metadata": req.metadata }),
        )
        .await?;
    Ok(Json(json!({ "serviceId": service_id })))
}

// -- Rollouts --

#[derive(Debug, Deserialize)]
pub struct ListRolloutsQuery {
    pub status: Option<String>,
}

pub async fn list_rollouts(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Query(q): Query<ListRolloutsQuery>,
) -> Result<Json<Value>, ApiError> {
    let rows = match &q.status {
        Some(status) => {
            sqlx::query("SELECT * FROM rollouts WHERE status = $1 ORDER BY created_at DESC")
                .bind(status)
                .fetch_all(&state.pool)
                .await
        }
        None => {
            sqlx::query("SELECT * FROM rollouts ORDER BY created_at DESC")
                .fetch_all(&state.pool)
                .await
        }
    }
    .map_err(|e| crate::dberror::classify("list_rollouts", e))?;

    Ok(Json(json!(rows
        .into_iter()
        .map(row_to_rollout_summary)
        .collect::<Vec<_>>())))
}

pub async fn get_rollout(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let row = sqlx::query("SELECT * FROM rollouts WHERE rollout_id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| crate::dberror::classify("get_rollout", e))?
        .ok_or_else(|| ApiError::new(ErrorCode::RolloutNotFound, "no such rollout"))?;
    Ok(Json(row_to_rollout_summary(row)))
}

pub async fn get_rollout_devices(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let rows = sqlx::query("SELECT * FROM device_rollout_status WHERE rollout_id = $1")
        .bind(id)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| crate::dberror::classify("get_rollout_devices", e))?;

    let devices: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            json!({
                "device_uuid": row.try_get::<Uuid, _>("device_uuid").ok(),
                "batch_number": row.try_get::<i32, _>("batch_number").ok(),
                "status": row.try_get::<String, _>("status").ok(),
                "old_image_tag": row.try_get::<Option<String>, _>("old_image_tag").ok().flatten(),
                "new_image_tag": row.try_get::<String, _>("new_image_tag").ok(),
            })
        })
        .collect();
    Ok(Json(json!(devices)))
}

fn row_to_rollout_summary(row: sqlx::postgres::PgRow) -> Value {
    json!({
        "rollout_id": row.try_get::<Uuid, _>("rollout_id").ok(),
        "image_name": row.try_get::<String, _>("image_name").ok(),
        "old_tag": row.try_get::<Option<String>, _>("old_tag").ok().flatten(),
        "new_tag": row.try_get::<String, _>("new_tag").ok(),
        "strategy": row.try_get::<String, _>("strategy").ok(),
        "status": row.try_get::<String, _>("status").ok(),
        "total_devices": row.try_get::<i64, _>("total_devices").ok(),
        "current_batch": row.try_get::<i32, _>("current_batch").ok(),
        "counters": {
            "updated": row.try_get::<i64, _>("counter_updated").ok(),
            "succeeded": row.try_get::<i64, _>("counter_succeeded").ok(),
            "failed": row.try_get::<i64, _>("counter_failed").ok(),
            "rolled_back": row.try_get::<i64, _>("counter_rolled_back").ok(),
        },
    })
}

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub reason: String,
}

pub async fn pause_rollout(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
    Json(req): Json<PauseRequest>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.pause(id, &req.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
pub struct ResumeRequest {
    #[serde(default)]
    pub failure_mitigation_acknowledged: bool,
}

pub async fn resume_rollout(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
    Json(req): Json<ResumeRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .orchestrator
        .resume(id, req.failure_mitigation_acknowledged)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_rollout(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.cancel(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn rollback_all(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let rolled_back = state.rollback.rollback_all(id).await?;
    Ok(Json(json!({ "devices_rolled_back": rolled_back })))
}

#[derive(Debug, Deserialize)]
pub struct RollbackDeviceRequest {
    pub device_uuid: Uuid,
}

pub async fn rollback_device(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
    Json(req): Json<RollbackDeviceRequest>,
) -> Result<StatusCode, ApiError> {
    state.rollback.rollback_device(id, req.device_uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Image policies --

#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequest {
    pub image_pattern: String,
    pub strategy: RolloutStrategy,
    pub staged_fractions: Option<Vec<f64>>,
    pub batch_delay_minutes: Option<i64>,
    pub update_grace_minutes: Option<i64>,
    pub health_check: Option<HealthCheckSpec>,
    pub auto_rollback: Option<bool>,
    pub max_failure_rate: Option<f64>,
    pub maintenance_window: Option<String>,
    pub device_filter: Option<DeviceFilter>,
}

pub async fn list_policies(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Vec<RolloutPolicy>>, ApiError> {
    Ok(Json(state.policies.list_enabled().await?))
}

pub async fn create_policy(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Json(req): Json<CreatePolicyRequest>,
) -> Result<Json<Value>, ApiError> {
    let policy = RolloutPolicy {
        id: Uuid::new_v4(),
        image_pattern: req.image_pattern,
        strategy: req.strategy,
        staged_fractions: req.staged_fractions.unwrap_or_else(RolloutPolicy::default_fractions),
        batch_delay_minutes: req.batch_delay_minutes.unwrap_or(10),
        update_grace_minutes: req
            .update_grace_minutes
            .unwrap_or_else(RolloutPolicy::default_update_grace_minutes),
        health_check: req.health_check,
        auto_rollback: req.auto_rollback.unwrap_or(false),
        max_failure_rate: req
            .max_failure_rate
            .unwrap_or_else(RolloutPolicy::default_max_failure_rate),
        maintenance_window: req.maintenance_window,
        device_filter: req.device_filter,
        enabled: true,
    };
    let id = state.policies.create(&policy).await?;
    Ok(Json(json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePolicyRequest {
    pub enabled: Option<bool>,
}

pub async fn update_policy(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdatePolicyRequest>,
) -> Result<StatusCode, ApiError> {
    if let Some(enabled) = req.enabled {
        state.policies.set_enabled(id, enabled).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_policy(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.policies.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Jobs --

#[derive(Debug, Deserialize)]
pub struct ExecuteJobRequest {
    pub job_name: String,
    pub template_id: Option<Uuid>,
    pub job_document: Option<Value>,
    pub target_type: JobTargetType,
    pub target_devices: Vec<Uuid>,
    pub timeout_seconds: Option<i64>,
}

pub async fn execute_job(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Json(req): Json<ExecuteJobRequest>,
) -> Result<Json<Value>, ApiError> {
    let job_id = state
        .jobs
        .create_job(CreateJobRequest {
            job_name: req.job_name,
            template_id: req.template_id,
            document: req.job_document.unwrap_or(json!({})),
            target_type: req.target_type,
            target_devices: req.target_devices,
            timeout_seconds: req.timeout_seconds.unwrap_or(300),
        })
        .await?;
    Ok(Json(json!({ "job_id": job_id })))
}

#[derive(Debug, Deserialize)]
pub struct CreateJobTemplateRequest {
    pub name: String,
    pub document: Value,
}

pub async fn list_job_templates(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.jobs.list_templates().await?)))
}

pub async fn create_job_template(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Json(req): Json<CreateJobTemplateRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = state.jobs.create_template(&req.name, req.document).await?;
    Ok(Json(json!({ "id": id })))
}

pub async fn get_job(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let status = state.jobs.aggregate_status(id).await?;
    let row = sqlx::query("SELECT * FROM jobs WHERE job_id = $1")
        .bind(id)
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| crate::dberror::classify("get_job", e))?
        .ok_or_else(|| ApiError::new(ErrorCode::JobNotFound, "no such job"))?;
    Ok(Json(row_to_job_summary(row, status)))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Value>, ApiError> {
    let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
        .fetch_all(&state.pool)
        .await
        .map_err(|e| crate::dberror::classify("list_jobs", e))?;

    let mut jobs = Vec::new();
    for row in rows {
        let job_id: Uuid = row.try_get("job_id").unwrap_or_default();
        let status = state
            .jobs
            .aggregate_status(job_id)
            .await
            .unwrap_or(JobAggregateStatus::Pending);
        jobs.push(row_to_job_summary(row, status));
    }
    Ok(Json(json!(jobs)))
}

fn row_to_job_summary(row: sqlx::postgres::PgRow, status: JobAggregateStatus) -> Value {
    let job = Job {
        job_id: row.try_get("job_id").unwrap_or_default(),
        job_name: row.try_get("job_name").unwrap_or_default(),
        template_id: row.try_get("template_id").unwrap_or(None),
        document: row.try_get("document").unwrap_or(json!({})),
        target_type: match row.try_get::<String, _>("target_type").as_deref() {
            Ok("group") => JobTargetType::Group,
            _ => JobTargetType::Device,
        },
        target_devices: row.try_get("target_devices").unwrap_or_default(),
        timeout_seconds: row.try_get("timeout_seconds").unwrap_or(300),
        created_at: row.try_get("created_at").unwrap_or_default(),
        status,
    };
    json!(job)
}

// -- Admin heartbeat --

pub async fn heartbeat_status(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Value>, ApiError> {
    let row = sqlx::query("SELECT value FROM system_config WHERE key = 'heartbeat_last_check'")
        .fetch_optional(&state.pool)
        .await
        .map_err(|e| crate::dberror::classify("heartbeat_status", e))?;
    let last_check: Option<Value> = row.and_then(|r| r.try_get("value").ok());
    Ok(Json(json!({ "last_check": last_check })))
}

pub async fn heartbeat_check(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Value>, ApiError> {
    let monitor = LivenessMonitor::new(
        state.pool.clone(),
        state.events.clone(),
        state.heartbeat_tick,
        state.offline_threshold,
    );
    let marked_offline = monitor.run_once().await?;
    Ok(Json(json!({ "marked_offline": marked_offline })))
}

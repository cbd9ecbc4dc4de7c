//! Remote job execution.
//!
//! Jobs are fanned out eagerly: creating a job materializes one
//! `device_job_status` row per target device up front, so `/jobs/next`
//! is a plain row read rather than a dynamic expansion of `target_type`/
//! `target_devices` on every poll.

use fleet_common::errors::{ApiError, ErrorCode};
use fleet_common::types::{
    aggregate_job_status, DeviceJobState, DeviceJobStatus, JobAggregateStatus, JobTargetType,
    JobTemplate,
};
use serde_json::{json, Value};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event_log::{EventLog, PublishOptions};

#[derive(Clone)]
pub struct JobDispatcher {
    pool: PgPool,
    events: EventLog,
}

pub struct CreateJobRequest {
    pub job_name: String,
    pub template_id: Option<Uuid>,
    pub document: Value,
    pub target_type: JobTargetType,
    pub target_devices: Vec<Uuid>,
    pub timeout_seconds: i64,
}

impl JobDispatcher {
    pub fn new(pool: PgPool, events: EventLog) -> Self {
        Self { pool, events }
    }

    pub async fn create_job(&self, mut req: CreateJobRequest) -> Result<Uuid, ApiError> {
        if req.target_devices.is_empty() {
            return Err(ApiError::new(
                ErrorCode::JobTargetEmpty,
                "job has no target devices",
            ));
        }

        if let Some(template_id) = req.template_id {
            let template = self.get_template(template_id).await?;
            req.document = merge_template_document(template.document, req.document);
        }

        let job_id = Uuid::new_v4();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| crate::dberror::classify("create_job", e))?;

        sqlx::query(
            r#"
            INSERT INTO jobs
                (job_id, job_name, template_id, document, target_type, target_devices, timeout_seconds)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job_id)
        .bind(&req.job_name)
        .bind(req.template_id)
        .bind(&req.document)
        .bind(target_type_as_str(req.target_type))
        .bind(&req.target_devices)
        .bind(req.timeout_seconds)
        .execute(&mut *tx)
        .await
        .map_err(|e| crate::dberror::classify("insert_job", e))?;

        for device_uuid in &req.target_devices {
            sqlx::query(
                "INSERT INTO device_job_status (job_id, device_uuid, status) VALUES ($1, $2, 'QUEUED')",
            )
            .bind(job_id)
            .bind(device_uuid)
            .execute(&mut *tx)
            .await
            .map_err(|e| crate::dberror::classify("queue_device_job", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| crate::dberror::classify("commit_job_creation", e))?;

        self.events
            .publish(
                "job.created",
                "job",
                &job_id.to_string(),
                &json!({ "job_name": req.job_name, "target_devices": req.target_devices }),
                PublishOptions::default(),
            )
            .await?;

        Ok(job_id)
    }

    /// `/devices/:uuid/jobs/next`: the oldest `QUEUED` job for this
    /// device, claimed atomically so two concurrent pollers never both
    /// receive the same job (invariant: at most one `IN_PROGRESS` job per
    /// device).
    pub async fn claim_next(&self, device_uuid: Uuid) -> Result<Option<DeviceJobStatus>, ApiError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| crate::dberror::classify("claim_next", e))?;

        let already_in_progress = sqlx::query(
            "SELECT 1 FROM device_job_status WHERE device_uuid = $1 AND status = 'IN_PROGRESS'",
        )
        .bind(device_uuid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| crate::dberror::classify("check_in_progress_jobs", e))?;

        if already_in_progress.is_some() {
            // The endpoint returns nothing until the in-progress job
            // clears; this is not an error condition.
            tx.commit().await.ok();
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            SELECT djs.job_id, djs.device_uuid, djs.status, djs.status_details, djs.exit_code,
                   djs.stdout, djs.stderr, djs.started_at, djs.completed_at
            FROM device_job_status djs
            JOIN jobs j ON j.job_id = djs.job_id
            WHERE djs.device_uuid = $1 AND djs.status = 'QUEUED'
            ORDER BY j.created_at ASC
            LIMIT 1
            FOR UPDATE OF djs SKIP LOCKED
            "#,
        )
        .bind(device_uuid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| crate::dberror::classify("claim_next_job", e))?;

        let Some(row) = row else {
            tx.commit().await.ok();
            return Ok(None);
        };

        let job_id: Uuid = row
            .try_get("job_id")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed job row"))?;

        sqlx::query(
            "UPDATE device_job_status SET status = 'IN_PROGRESS', started_at = now() \
             WHERE job_id = $1 AND device_uuid = $2",
        )
        .bind(job_id)
        .bind(device_uuid)
        .execute(&mut *tx)
        .await
        .map_err(|e| crate::dberror::classify("claim_job", e))?;

        tx.commit()
            .await
            .map_err(|e| crate::dberror::classify("commit_job_claim", e))?;

        self.events
            .publish(
                "device.job_started",
                "job",
                &job_id.to_string(),
                &json!({ "device_uuid": device_uuid }),
                PublishOptions::default(),
            )
            .await?;

        Ok(Some(row_to_status(row, DeviceJobState::InProgress)?))
    }

    /// Idempotent status update: applying the same terminal payload
    /// twice has the same effect as applying it once. A
    /// transition away from an already-terminal status is rejected
    /// unless the incoming status matches the stored one exactly.
    pub async fn report_status(
        &self,
        job_id: Uuid,
        device_uuid: Uuid,
        status: DeviceJobState,
        status_details: Option<Value>,
        exit_code: Option<i32>,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Result<(), ApiError> {
        let current = self.device_job_state(job_id, device_uuid).await?;

        if current.is_terminal() {
            if current == status {
                return Ok(());
            }
            return Err(ApiError::new(
                ErrorCode::RolloutTransitionInvalid,
                format!("job already terminal as {current:?}, cannot move to {status:?}"),
            ));
        }

        sqlx::query(
            r#"
            UPDATE device_job_status
            SET status = $3, status_details = $4, exit_code = $5, stdout = $6, stderr = $7,
                completed_at = CASE WHEN $8 THEN now() ELSE completed_at END
            WHERE job_id = $1 AND device_uuid = $2
            "#,
        )
        .bind(job_id)
        .bind(device_uuid)
        .bind(state_as_str(status))
        .bind(&status_details)
        .bind(exit_code)
        .bind(&stdout)
        .bind(&stderr)
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("report_job_status", e))?;

        self.events
            .publish(
                "device.job_status_updated",
                "job",
                &job_id.to_string(),
                &json!({ "device_uuid": device_uuid, "status": state_as_str(status) }),
                PublishOptions::default(),
            )
            .await?;

        Ok(())
    }

    pub async fn aggregate_status(&self, job_id: Uuid) -> Result<JobAggregateStatus, ApiError> {
        let rows = sqlx::query("SELECT status FROM device_job_status WHERE job_id = $1")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("aggregate_status", e))?;

        if rows.is_empty() {
            return Err(ApiError::new(ErrorCode::JobNotFound, "no such job"));
        }

        let children: Vec<DeviceJobState> = rows
            .into_iter()
            .filter_map(|r| {
                let raw: String = r.try_get("status").ok()?;
                state_from_str(&raw)
            })
            .collect();

        Ok(aggregate_job_status(&children))
    }

    /// Sweep `IN_PROGRESS` device jobs past their parent's timeout into
    /// `TIMED_OUT`.
    pub async fn sweep_timeouts(&self) -> Result<usize, ApiError> {
        let rows = sqlx::query(
            r#"
            SELECT djs.job_id, djs.device_uuid
            FROM device_job_status djs
            JOIN jobs j ON j.job_id = djs.job_id
            WHERE djs.status = 'IN_PROGRESS'
              AND djs.started_at IS NOT NULL
              AND djs.started_at + make_interval(secs => j.timeout_seconds) < now()
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("list_timed_out_device_jobs", e))?;

        let mut timed_out = 0usize;
        for row in rows {
            let job_id: Uuid = row.try_get("job_id").unwrap_or_default();
            let device_uuid: Uuid = row.try_get("device_uuid").unwrap_or_default();

            let result = sqlx::query(
                "UPDATE device_job_status SET status = 'TIMED_OUT', completed_at = now() \
                 WHERE job_id = $1 AND device_uuid = $2 AND status = 'IN_PROGRESS'",
            )
            .bind(job_id)
            .bind(device_uuid)
            .execute(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("mark_job_timed_out", e))?;

            if result.rows_affected() > 0 {
                timed_out += 1;
                warn!(%job_id, %device_uuid, "device job timed out");
                self.events
                    .publish(
                        "job.timed_out",
                        "job",
                        &job_id.to_string(),
                        &json!({ "device_uuid": device_uuid }),
                        PublishOptions::default(),
                    )
                    .await?;
            }
        }

        if timed_out > 0 {
            info!(timed_out, "job timeout sweep complete");
        }
        Ok(timed_out)
    }

    pub async fn create_template(&self, name: &str, document: Value) -> Result<Uuid, ApiError> {
        let row = sqlx::query(
            "INSERT INTO job_templates (name, document) VALUES ($1, $2) RETURNING id",
        )
        .bind(name)
        .bind(&document)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("create_template", e))?;

        row.try_get("id")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed insert result"))
    }

    pub async fn list_templates(&self) -> Result<Vec<JobTemplate>, ApiError> {
        let rows = sqlx::query("SELECT id, name, document, created_at FROM job_templates ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("list_templates", e))?;
        rows.into_iter().map(row_to_template).collect()
    }

    pub async fn get_template(&self, id: Uuid) -> Result<JobTemplate, ApiError> {
        let row = sqlx::query("SELECT id, name, document, created_at FROM job_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("get_template", e))?
            .ok_or_else(|| ApiError::new(ErrorCode::JobTemplateNotFound, "no such job template"))?;
        row_to_template(row)
    }

    async fn device_job_state(&self, job_id: Uuid, device_uuid: Uuid) -> Result<DeviceJobState, ApiError> {
        let row = sqlx::query(
            "SELECT status FROM device_job_status WHERE job_id = $1 AND device_uuid = $2",
        )
        .bind(job_id)
        .bind(device_uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("device_job_state", e))?
        .ok_or_else(|| ApiError::new(ErrorCode::JobNotFound, "no such device job"))?;
        let raw: String = row.try_get("status").unwrap_or_default();
        state_from_str(&raw)
            .ok_or_else(|| ApiError::new(ErrorCode::Internal, format!("unrecognized job status in store: {raw}")))
    }
}

fn target_type_as_str(target_type: JobTargetType) -> &'static str {
    match target_type {
        JobTargetType::Device => "device",
        JobTargetType::Group => "group",
    }
}

fn state_as_str(state: DeviceJobState) -> &'static str {
    use DeviceJobState::*;
    match state {
        Queued => "QUEUED",
        InProgress => "IN_PROGRESS",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        TimedOut => "TIMED_OUT",
        Cancelled => "CANCELLED",
    }
}

fn state_from_str(raw: &str) -> Option<DeviceJobState> {
    use DeviceJobState::*;
    Some(match raw {
        "QUEUED" => Queued,
        "IN_PROGRESS" => InProgress,
        "SUCCEEDED" => Succeeded,
        "FAILED" => Failed,
        "TIMED_OUT" => TimedOut,
        "CANCELLED" => Cancelled,
        _ => return None,
    })
}

fn row_to_template(row: sqlx::postgres::PgRow) -> Result<JobTemplate, ApiError> {
    Ok(JobTemplate {
        id: row
            .try_get("id")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed job template row"))?,
        name: row.try_get("name").unwrap_or_default(),
        document: row.try_get("document").unwrap_or(json!({})),
        created_at: row
            .try_get("created_at")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed job template row"))?,
    })
}

/// Overlay the request's document on top of the template's: matching
/// top-level keys are replaced, the rest of the template passes through
/// unchanged. A non-object on either side just takes the request's value.
fn merge_template_document(template: Value, overrides: Value) -> Value {
    match (template, overrides) {
        (Value::Object(mut base), Value::Object(extra)) => {
            for (k, v) in extra {
                base.insert(k, v);
            }
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (base, Value::Object(extra)) if extra.is_empty() => base,
        (_, overrides) => overrides,
    }
}

fn row_to_status(
    row: sqlx::postgres::PgRow,
    status: DeviceJobState,
) -> Result<DeviceJobStatus, ApiError> {
    Ok(DeviceJobStatus {
        job_id: row
            .try_get("job_id")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed job row"))?,
        device_uuid: row
            .try_get("device_uuid")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed job row"))?,
        status,
        status_details: row.try_get("status_details").unwrap_or(None),
        exit_code: row.try_get("exit_code").unwrap_or(None),
        stdout: row.try_get("stdout").unwrap_or(None),
        stderr: row.try_get("stderr").unwrap_or(None),
        started_at: row.try_get("started_at").unwrap_or(None),
        completed_at: row.try_get("completed_at").unwrap_or(None),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_wire_string() {
        for s in [
            DeviceJobState::Queued,
            DeviceJobState::InProgress,
            DeviceJobState::Succeeded,
            DeviceJobState::Failed,
            DeviceJobState::TimedOut,
            DeviceJobState::Cancelled,
        ] {
            assert_eq!(state_from_str(state_as_str(s)), Some(s));
        }
    }

    #[test]
    fn unrecognized_state_string_is_none() {
        assert_eq!(state_from_str("BOGUS"), None);
    }
}

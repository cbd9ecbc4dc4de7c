//! Rollout Orchestrator.
//!
//! Owns rollout creation and the background batch-progression tick.
//! Per-device update lifecycle (scheduled → updating → verifying →
//! succeeded|failed|rolledBack) is advanced as part of the same tick so
//! there is one place that reads rollout state under lock-free,
//! idempotent, retriable queries.

use std::collections::HashMap;
use std::collections::HashSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleet_common::errors::{ApiError, ErrorCode};
use fleet_common::image::ImageRef;
use fleet_common::types::{DeviceFilter, RolloutPolicy, RolloutStatus, RolloutStrategy};
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event_log::{EventLog, PublishOptions};
use crate::rollout::batch::assign_batches;
use crate::rollout::health::{HealthChecker, ProbeOutcome};
use crate::rollout::policy::{strategy_as_str, PolicyStore};
use crate::rollout::rollback::RollbackManager;
use crate::rollout::state_machine::{apply_transition, RolloutTransition, TransitionObservations};
use crate::state_store::StateStore;

#[derive(Clone)]
pub struct RolloutOrchestrator {
    pool: PgPool,
    state_store: StateStore,
    events: EventLog,
    policies: PolicyStore,
    health: HealthChecker,
    rollback: RollbackManager,
}

impl RolloutOrchestrator {
    pub fn new(
        pool: PgPool,
        state_store: StateStore,
        events: EventLog,
        policies: PolicyStore,
        health: HealthChecker,
        rollback: RollbackManager,
    ) -> Self {
        Self {
            pool,
            state_store,
            events,
            policies,
            health,
            rollback,
        }
    }

    /// Entry point for both the webhook handler and a direct operator
    /// call. Returns `Ok(None)` when no policy matches — not an error.
    pub async fn create_rollout(
        &self,
        image_name: &str,
        new_tag: &str,
        policy_override: Option<Uuid>,
        triggered_by: &str,
        webhook_payload: Option<Value>,
    ) -> Result<Option<Uuid>, ApiError> {
        let policy = match policy_override {
            Some(id) => Some(self.policies.get(id).await?),
            None => self.policies.match_policy(image_name).await?,
        };
        let Some(policy) = policy else {
            info!(image_name, "no rollout policy matched, skipping");
            return Ok(None);
        };

        if let Some(existing) = self.find_active_rollout(image_name, new_tag).await? {
            info!(image_name, new_tag, %existing, "rollout already active for image/tag, deduping");
            return Ok(Some(existing));
        }

        let old_tag = self.sample_old_tag(image_name).await?;
        let candidates = self
            .select_candidates(image_name, policy.device_filter.as_ref())
            .await?;

        let rollout_id = Uuid::new_v4();
        let fractions = if policy.staged_fractions.is_empty() {
            RolloutPolicy::default_fractions()
        } else {
            policy.staged_fractions.clone()
        };
        let assignments = assign_batches(&candidates, &fractions);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| crate::dberror::classify("create_rollout", e))?;

        sqlx::query(
            r#"
            INSERT INTO rollouts
                (rollout_id, policy_id, image_name, old_tag, new_tag, strategy, status,
                 total_devices, batch_fractions, triggered_by, webhook_payload)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8, $9, $10)
            "#,
        )
        .bind(rollout_id)
        .bind(policy.id)
        .bind(image_name)
        .bind(&old_tag)
        .bind(new_tag)
        .bind(strategy_as_str(policy.strategy))
        .bind(candidates.len() as i64)
        .bind(&fractions)
        .bind(triggered_by)
        .bind(&webhook_payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| crate::dberror::classify("insert_rollout", e))?;

        for (device_uuid, batch_number) in &assignments {
            sqlx::query(
                r#"
                INSERT INTO device_rollout_status
                    (rollout_id, device_uuid, batch_number, status, old_image_tag, new_image_tag)
                VALUES ($1, $2, $3, 'scheduled', $4, $5)
                "#,
            )
            .bind(rollout_id)
            .bind(device_uuid)
            .bind(batch_number)
            .bind(&old_tag)
            .bind(new_tag)
            .execute(&mut *tx)
            .await
            .map_err(|e| crate::dberror::classify("schedule_device_in_rollout", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| crate::dberror::classify("commit_rollout_creation", e))?;

        self.events
            .publish(
                "rollout.created",
                "rollout",
                &rollout_id.to_string(),
                &json!({
                    "image_name": image_name,
                    "new_tag": new_tag,
                    "old_tag": old_tag,
                    "total_devices": candidates.len(),
                    "policy_id": policy.id,
                }),
                PublishOptions::default(),
            )
            .await?;

        if matches!(policy.strategy, RolloutStrategy::Auto | RolloutStrategy::Staged) {
            self.start_rollout(rollout_id, &policy).await?;
        }

        Ok(Some(rollout_id))
    }

    async fn start_rollout(&self, rollout_id: Uuid, policy: &RolloutPolicy) -> Result<(), ApiError> {
        sqlx::query("UPDATE rollouts SET status = 'running', started_at = now() WHERE rollout_id = $1")
            .bind(rollout_id)
            .execute(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("start_rollout", e))?;

        self.activate_batch(rollout_id, 1, policy).await
    }

    /// Flip every `scheduled` device in `batch_number` to `updating` and
    /// rewrite its target state.
    async fn activate_batch(
        &self,
        rollout_id: Uuid,
        batch_number: i32,
        policy: &RolloutPolicy,
    ) -> Result<(), ApiError> {
        let rollout = self.load_rollout_summary(rollout_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT device_uuid FROM device_rollout_status
            WHERE rollout_id = $1 AND batch_number = $2 AND status = 'scheduled'
            "#,
        )
        .bind(rollout_id)
        .bind(batch_number)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("list_activating_batch_devices", e))?;

        for row in rows {
            let device_uuid: Uuid = row
                .try_get("device_uuid")
                .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed batch row"))?;

            self.state_store
                .set_service_image_tag(device_uuid, &rollout.image_name, &rollout.new_tag)
                .await?;

            sqlx::query(
                "UPDATE device_rollout_status SET status = 'updating', update_started_at = now() \
                 WHERE rollout_id = $1 AND device_uuid = $2",
            )
            .bind(rollout_id)
            .bind(device_uuid)
            .execute(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("activate_device_in_batch", e))?;
        }

        let eligible_at = Utc::now() + ChronoDuration::minutes(policy.batch_delay_minutes);
        sqlx::query(
            "UPDATE rollouts SET current_batch = $2, next_batch_eligible_at = $3 WHERE rollout_id = $1",
        )
        .bind(rollout_id)
        .bind(batch_number)
        .bind(eligible_at)
        .execute(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("advance_current_batch", e))?;

        self.events
            .publish(
                "rollout.batch_started",
                "rollout",
                &rollout_id.to_string(),
                &json!({ "batch_number": batch_number }),
                PublishOptions::default(),
            )
            .await?;

        Ok(())
    }

    /// The periodic background tick (default interval: 30s).
    pub async fn tick(&self) -> Result<(), ApiError> {
        self.advance_device_lifecycles().await?;

        let rows = sqlx::query("SELECT rollout_id FROM rollouts WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("list_running_rollouts", e))?;

        for row in rows {
            let rollout_id: Uuid = match row.try_get("rollout_id") {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Err(e) = self.tick_one(rollout_id).await {
                warn!(%rollout_id, error = %e, "rollout tick failed");
                self.events
                    .publish(
                        "rollout.tick_failed",
                        "rollout",
                        &rollout_id.to_string(),
                        &json!({ "error": e.message }),
                        PublishOptions::default(),
                    )
                    .await
                    .ok();
            }
        }
        Ok(())
    }

    async fn tick_one(&self, rollout_id: Uuid) -> Result<(), ApiError> {
        let rollout = self.load_rollout_summary(rollout_id).await?;

        if let Some(eligible_at) = rollout.next_batch_eligible_at {
            if eligible_at > Utc::now() {
                return Ok(());
            }
        }

        let counts = self.batch_device_counts(rollout_id, rollout.current_batch).await?;
        if counts.scheduled > 0 || counts.updating > 0 || counts.verifying > 0 {
            return Ok(());
        }
        if counts.total == 0 {
            return Ok(());
        }

        let failure_rate = counts.failed as f64 / counts.total as f64;
        if failure_rate > rollout.max_failure_rate {
            sqlx::query("UPDATE rollouts SET status = 'paused' WHERE rollout_id = $1")
                .bind(rollout_id)
                .execute(&self.pool)
                .await
                .map_err(|e| crate::dberror::classify("pause_rollout_on_failure_rate", e))?;

            self.events
                .publish(
                    "rollout.paused",
                    "rollout",
                    &rollout_id.to_string(),
                    &json!({ "batch_number": rollout.current_batch, "failure_rate": failure_rate }),
                    PublishOptions::default(),
                )
                .await?;
            return Ok(());
        }

        let total_batches = rollout.batch_fractions.len() as i32;
        if rollout.current_batch < total_batches {
            let policy = self.policies.get(rollout.policy_id).await?;
            self.activate_batch(rollout_id, rollout.current_batch + 1, &policy).await?;
        } else {
            sqlx::query(
                "UPDATE rollouts SET status = 'completed', finished_at = now() WHERE rollout_id = $1",
            )
            .bind(rollout_id)
            .execute(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("complete_rollout", e))?;

            self.events
                .publish(
                    "rollout.completed",
                    "rollout",
                    &rollout_id.to_string(),
                    &json!({}),
                    PublishOptions::default(),
                )
                .await?;
        }

        Ok(())
    }

    /// Progress `updating` devices to `verifying` once their reported
    /// current state shows the new tag, then run the health check and
    /// land on `succeeded`/`failed` (rolling back on failure if the
    /// policy asks for it).
    async fn advance_device_lifecycles(&self) -> Result<(), ApiError> {
        let rows = sqlx::query(
            r#"
            SELECT drs.rollout_id, drs.device_uuid, drs.status, drs.new_image_tag, drs.retry_count,
                   drs.update_started_at, r.image_name, r.policy_id
            FROM device_rollout_status drs
            JOIN rollouts r ON r.rollout_id = drs.rollout_id
            WHERE drs.status IN ('updating', 'verifying') AND r.status = 'running'
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("list_in_flight_devices", e))?;

        for row in rows {
            self.advance_one_device(row).await.ok();
        }
        Ok(())
    }

    async fn advance_one_device(&self, row: PgRow) -> Result<(), ApiError> {
        let rollout_id: Uuid = row.try_get("rollout_id").unwrap_or_default();
        let device_uuid: Uuid = row.try_get("device_uuid").unwrap_or_default();
        let status: String = row.try_get("status").unwrap_or_default();
        let new_tag: String = row.try_get("new_image_tag").unwrap_or_default();
        let image_name: String = row.try_get("image_name").unwrap_or_default();
        let policy_id: Uuid = row.try_get("policy_id").unwrap_or_default();
        let update_started_at: Option<DateTime<Utc>> = row.try_get("update_started_at").unwrap_or(None);

        let policy = self.policies.get(policy_id).await?;

        if status == "updating" {
            let tag_observed = self
                .state_store
                .current_state_has_image(device_uuid, &image_name, &new_tag)
                .await?;

            let grace_elapsed = update_started_at
                .map(|started| Utc::now() - started > ChronoDuration::minutes(policy.update_grace_minutes))
                .unwrap_or(false);

            if tag_observed || grace_elapsed {
                if !tag_observed {
                    warn!(
                        %rollout_id, %device_uuid, grace_minutes = policy.update_grace_minutes,
                        "device did not report the new tag within the grace period, forcing verification"
                    );
                }
                sqlx::query(
                    "UPDATE device_rollout_status SET status = 'verifying', health_checked_at = now() \
                     WHERE rollout_id = $1 AND device_uuid = $2",
                )
                .bind(rollout_id)
                .bind(device_uuid)
                .execute(&self.pool)
                .await
                .map_err(|e| crate::dberror::classify("move_device_to_verifying", e))?;
            }
            return Ok(());
        }

        // status == "verifying"
        let Some(health_check) = policy.health_check.as_ref() else {
            // No health check configured: treat arrival at `verifying` as success.
            return self.mark_device_outcome(rollout_id, device_uuid, true).await;
        };

        let device_ip = self.device_ip_placeholder(device_uuid);
        let outcome = self
            .health
            .check(health_check, device_uuid, &device_ip, &image_name, &new_tag)
            .await;

        match outcome {
            ProbeOutcome::Pass => self.mark_device_outcome(rollout_id, device_uuid, true).await,
            ProbeOutcome::Fail => {
                self.mark_device_outcome(rollout_id, device_uuid, false).await?;
                if policy.auto_rollback {
                    self.rollback.rollback_device(rollout_id, device_uuid).await?;
                }
                Ok(())
            }
        }
    }

    async fn mark_device_outcome(
        &self,
        rollout_id: Uuid,
        device_uuid: Uuid,
        healthy: bool,
    ) -> Result<(), ApiError> {
        let status = if healthy { "succeeded" } else { "failed" };
        sqlx::query(
            "UPDATE device_rollout_status SET status = $3, update_completed_at = now(), \
             health_check_passed = $4 WHERE rollout_id = $1 AND device_uuid = $2",
        )
        .bind(rollout_id)
        .bind(device_uuid)
        .bind(status)
        .bind(healthy)
        .execute(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("record_device_outcome", e))?;

        let counter = if healthy {
            "counter_succeeded"
        } else {
            "counter_failed"
        };
        sqlx::query(&format!(
            "UPDATE rollouts SET {counter} = {counter} + 1, counter_updated = counter_updated + 1 \
             WHERE rollout_id = $1"
        ))
        .bind(rollout_id)
        .execute(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("update_rollout_counters", e))?;

        self.events
            .publish(
                if healthy { "device.rollout_succeeded" } else { "device.rollout_failed" },
                "rollout",
                &rollout_id.to_string(),
                &json!({ "device_uuid": device_uuid }),
                PublishOptions::default(),
            )
            .await?;

        Ok(())
    }

    // -- Admin operations --

    pub async fn pause(&self, rollout_id: Uuid, reason: &str) -> Result<(), ApiError> {
        self.transition(rollout_id, RolloutTransition::Pause, TransitionObservations::default())
            .await?;
        self.events
            .publish(
                "rollout.paused",
                "rollout",
                &rollout_id.to_string(),
                &json!({ "reason": reason }),
                PublishOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn resume(&self, rollout_id: Uuid, mitigation_acknowledged: bool) -> Result<(), ApiError> {
        self.transition(
            rollout_id,
            RolloutTransition::Resume,
            TransitionObservations {
                failure_mitigation_acknowledged: mitigation_acknowledged,
            },
        )
        .await?;
        self.events
            .publish(
                "rollout.resumed",
                "rollout",
                &rollout_id.to_string(),
                &json!({}),
                PublishOptions::default(),
            )
            .await?;
        Ok(())
    }

    pub async fn cancel(&self, rollout_id: Uuid) -> Result<(), ApiError> {
        self.transition(rollout_id, RolloutTransition::Cancel, TransitionObservations::default())
            .await?;
        self.events
            .publish(
                "rollout.cancelled",
                "rollout",
                &rollout_id.to_string(),
                &json!({}),
                PublishOptions::default(),
            )
            .await?;
        Ok(())
    }

    async fn transition(
        &self,
        rollout_id: Uuid,
        transition: RolloutTransition,
        observations: TransitionObservations,
    ) -> Result<(), ApiError> {
        let current = self.load_status(rollout_id).await?;
        let next = apply_transition(current, transition, observations)?;
        sqlx::query("UPDATE rollouts SET status = $2 WHERE rollout_id = $1")
            .bind(rollout_id)
            .bind(status_as_str(next))
            .execute(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("apply_rollout_transition", e))?;
        Ok(())
    }

    // -- Helpers --

    async fn find_active_rollout(&self, image_name: &str, new_tag: &str) -> Result<Option<Uuid>, ApiError> {
        let row = sqlx::query(
            r#"
            SELECT rollout_id FROM rollouts
            WHERE image_name = $1 AND new_tag = $2 AND status IN ('pending', 'running', 'paused')
            "#,
        )
        .bind(image_name)
        .bind(new_tag)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("find_active_rollout", e))?;
        Ok(row.and_then(|r| r.try_get("rollout_id").ok()))
    }

    /// Majority tag currently in use for `image_name` across the fleet;
    /// `None` if no device currently runs it.
    async fn sample_old_tag(&self, image_name: &str) -> Result<Option<String>, ApiError> {
        let devices = self.state_store.find_devices_by_image(image_name).await?;
        if devices.is_empty() {
            return Ok(None);
        }

        let rows = sqlx::query("SELECT body FROM target_states WHERE device_uuid = ANY($1)")
            .bind(&devices)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("sample_old_tag", e))?;

        let mut tally: HashMap<String, usize> = HashMap::new();
        for row in rows {
            let body: Value = row.try_get("body").unwrap_or(json!({}));
            let Ok(doc) = serde_json::from_value::<fleet_common::types::StateDocument>(body) else {
                continue;
            };
            for (_, service) in doc.services() {
                if let Ok(parsed) = ImageRef::parse(&service.image_name) {
                    if parsed.repo == image_name {
                        *tally.entry(parsed.tag).or_insert(0) += 1;
                    }
                }
            }
        }

        Ok(tally.into_iter().max_by_key(|(_, count)| *count).map(|(tag, _)| tag))
    }

    async fn select_candidates(
        &self,
        image_name: &str,
        filter: Option<&DeviceFilter>,
    ) -> Result<Vec<Uuid>, ApiError> {
        let by_image: HashSet<Uuid> = self
            .state_store
            .find_devices_by_image(image_name)
            .await?
            .into_iter()
            .collect();

        let Some(filter) = filter else {
            return Ok(by_image.into_iter().collect());
        };

        if filter.device_uuids.is_empty() {
            return Ok(by_image.into_iter().collect());
        }

        let allow: HashSet<Uuid> = filter.device_uuids.iter().copied().collect();
        Ok(by_image.intersection(&allow).copied().collect())
    }

    /// The wire model has no device-IP field; HTTP health checks key off
    /// the device UUID placeholder until that field exists.
    fn device_ip_placeholder(&self, device_uuid: Uuid) -> String {
        device_uuid.to_string()
    }

    async fn load_status(&self, rollout_id: Uuid) -> Result<RolloutStatus, ApiError> {
        let row = sqlx::query("SELECT status FROM rollouts WHERE rollout_id = $1")
            .bind(rollout_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("load_rollout_status", e))?
            .ok_or_else(|| ApiError::new(ErrorCode::RolloutNotFound, "no such rollout"))?;
        let raw: String = row.try_get("status").unwrap_or_default();
        status_from_str(&raw)
    }

    async fn load_rollout_summary(&self, rollout_id: Uuid) -> Result<RolloutSummary, ApiError> {
        let row = sqlx::query(
            r#"
            SELECT image_name, new_tag, policy_id, current_batch, batch_fractions,
                   next_batch_eligible_at, max_failure_rate
            FROM rollouts r JOIN rollout_policies p ON p.id = r.policy_id
            WHERE r.rollout_id = $1
            "#,
        )
        .bind(rollout_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("load_rollout_summary", e))?
        .ok_or_else(|| ApiError::new(ErrorCode::RolloutNotFound, "no such rollout"))?;

        Ok(RolloutSummary {
            image_name: row.try_get("image_name").unwrap_or_default(),
            new_tag: row.try_get("new_tag").unwrap_or_default(),
            policy_id: row.try_get("policy_id").unwrap_or_default(),
            current_batch: row.try_get("current_batch").unwrap_or(0),
            batch_fractions: row.try_get("batch_fractions").unwrap_or_default(),
            next_batch_eligible_at: row.try_get("next_batch_eligible_at").unwrap_or(None),
            max_failure_rate: row.try_get("max_failure_rate").unwrap_or(0.2),
        })
    }

    async fn batch_device_counts(&self, rollout_id: Uuid, batch_number: i32) -> Result<BatchCounts, ApiError> {
        let rows = sqlx::query(
            "SELECT status FROM device_rollout_status WHERE rollout_id = $1 AND batch_number = $2",
        )
        .bind(rollout_id)
        .bind(batch_number)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("count_batch_devices", e))?;

        let mut counts = BatchCounts::default();
        for row in rows {
            counts.total += 1;
            let status: String = row.try_get("status").unwrap_or_default();
            match status.as_str() {
                "scheduled" => counts.scheduled += 1,
                "updating" => counts.updating += 1,
                "verifying" => counts.verifying += 1,
                "failed" => counts.failed += 1,
                _ => {}
            }
        }
        Ok(counts)
    }
}

struct RolloutSummary {
    image_name: String,
    new_tag: String,
    policy_id: Uuid,
    current_batch: i32,
    batch_fractions: Vec<f64>,
    next_batch_eligible_at: Option<DateTime<Utc>>,
    max_failure_rate: f64,
}

#[derive(Default)]
struct BatchCounts {
    total: usize,
    scheduled: usize,
    updating: usize,
    verifying: usize,
    failed: usize,
}

fn status_as_str(status: RolloutStatus) -> &'static str {
    use RolloutStatus::*;
    match status {
        Pending => "pending",
        Running => "running",
        Paused => "paused",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
        RolledBack => "rolled_back",
    }
}

fn status_from_str(raw: &str) -> Result<RolloutStatus, ApiError> {
    use RolloutStatus::*;
    match raw {
        "pending" => Ok(Pending),
        "running" => Ok(Running),
        "paused" => Ok(Paused),
        "completed" => Ok(Completed),
        "failed" => Ok(Failed),
        "cancelled" => Ok(Cancelled),
        "rolled_back" => Ok(RolledBack),
        other => Err(ApiError::new(
            ErrorCode::Internal,
            format!("unrecognized rollout status in store: {other}"),
        )),
    }
}

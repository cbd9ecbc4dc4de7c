//! Rollback Manager.

use fleet_common::errors::{ApiError, ErrorCode};
use serde_json::json;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::event_log::{EventLog, PublishOptions};
use crate::state_store::StateStore;

#[derive(Clone)]
pub struct RollbackManager {
    pool: PgPool,
    state_store: StateStore,
    events: EventLog,
}

impl RollbackManager {
    pub fn new(pool: PgPool, state_store: StateStore, events: EventLog) -> Self {
        Self {
            pool,
            state_store,
            events,
        }
    }

    pub async fn rollback_device(&self, rollout_id: Uuid, device_uuid: Uuid) -> Result<(), ApiError> {
        let row = sqlx::query(
            "SELECT old_image_tag FROM device_rollout_status WHERE rollout_id = $1 AND device_uuid = $2",
        )
        .bind(rollout_id)
        .bind(device_uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("read_device_rollout_status", e))?
        .ok_or_else(|| ApiError::new(ErrorCode::RolloutNotFound, "no such device in rollout"))?;

        let old_tag: Option<String> = row.try_get("old_image_tag").unwrap_or(None);
        let Some(old_tag) = old_tag else {
            return Err(ApiError::new(
                ErrorCode::RolloutTransitionInvalid,
                "no prior image tag recorded to roll back to",
            ));
        };

        let image_name: String = sqlx::query("SELECT image_name FROM rollouts WHERE rollout_id = $1")
            .bind(rollout_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("read_rollout_image_name", e))?
            .ok_or_else(|| ApiError::new(ErrorCode::RolloutNotFound, "no such rollout"))?
            .try_get("image_name")
            .unwrap_or_default();

        self.state_store
            .set_service_image_tag(device_uuid, &image_name, &old_tag)
            .await?;

        sqlx::query(
            r#"
            UPDATE device_rollout_status
            SET status = 'rolled_back', update_completed_at = now()
            WHERE rollout_id = $1 AND device_uuid = $2
            "#,
        )
        .bind(rollout_id)
        .bind(device_uuid)
        .execute(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("mark_device_rolled_back", e))?;

        sqlx::query("UPDATE rollouts SET counter_rolled_back = counter_rolled_back + 1 WHERE rollout_id = $1")
            .bind(rollout_id)
            .execute(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("increment_rollback_counter", e))?;

        self.events
            .publish(
                "device.rolled_back",
                "rollout",
                &rollout_id.to_string(),
                &json!({ "device_uuid": device_uuid, "old_tag": old_tag }),
                PublishOptions::default(),
            )
            .await?;

        Ok(())
    }

    /// Roll back every device in batch `n`, with bounded concurrency
    /// across the per-device rollback calls.
    pub async fn rollback_batch(&self, rollout_id: Uuid, batch_number: i32) -> Result<usize, ApiError> {
        let rows = sqlx::query(
            "SELECT device_uuid FROM device_rollout_status WHERE rollout_id = $1 AND batch_number = $2",
        )
        .bind(rollout_id)
        .bind(batch_number)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("list_batch_devices", e))?;

        const CONCURRENCY: usize = 8;
        let device_uuids: Vec<Uuid> = rows
            .into_iter()
            .filter_map(|r| r.try_get("device_uuid").ok())
            .collect();

        let mut rolled_back = 0usize;
        for chunk in device_uuids.chunks(CONCURRENCY) {
            let futures = chunk
                .iter()
                .map(|uuid| self.rollback_device(rollout_id, *uuid));
            let results = futures::future::join_all(futures).await;
            rolled_back += results.iter().filter(|r| r.is_ok()).count();
        }

        Ok(rolled_back)
    }

    /// Roll back every `succeeded` or `updating` device, then mark the
    /// rollout terminal.
    pub async fn rollback_all(&self, rollout_id: Uuid) -> Result<usize, ApiError> {
        let rows = sqlx::query(
            r#"
            SELECT device_uuid FROM device_rollout_status
            WHERE rollout_id = $1 AND status IN ('succeeded', 'updating', 'verifying')
            "#,
        )
        .bind(rollout_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("list_rollout_devices", e))?;

        let device_uuids: Vec<Uuid> = rows
            .into_iter()
            .filter_map(|r| r.try_get("device_uuid").ok())
            .collect();

        const CONCURRENCY: usize = 8;
        let mut rolled_back = 0usize;
        for chunk in device_uuids.chunks(CONCURRENCY) {
            let futures = chunk
                .iter()
                .map(|uuid| self.rollback_device(rollout_id, *uuid));
            let results = futures::future::join_all(futures).await;
            rolled_back += results.iter().filter(|r| r.is_ok()).count();
        }

        sqlx::query("UPDATE rollouts SET status = 'rolled_back', finished_at = now() WHERE rollout_id = $1")
            .bind(rollout_id)
            .execute(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("finalize_rollout_rollback", e))?;

        self.events
            .publish(
                "rollout.rolled_back",
                "rollout",
                &rollout_id.to_string(),
                &json!({ "devices_rolled_back": rolled_back }),
                PublishOptions::default(),
            )
            .await?;

        Ok(rolled_back)
    }
}

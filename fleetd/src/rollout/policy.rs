//! Rollout policy matching and storage.

use fleet_common::errors::{ApiError, ErrorCode};
use fleet_common::types::RolloutPolicy;
use glob::Pattern;
use serde_json::json;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

#[derive(Clone)]
pub struct PolicyStore {
    pool: PgPool,
}

impl PolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enabled policies whose `image_pattern` matches `image_name`,
    /// longest pattern string wins on ties. Returns `None` if nothing
    /// matches, which is not an error.
    pub async fn match_policy(&self, image_name: &str) -> Result<Option<RolloutPolicy>, ApiError> {
        let candidates = self.list_enabled().await?;
        Ok(best_match(&candidates, image_name))
    }

    pub async fn list_enabled(&self) -> Result<Vec<RolloutPolicy>, ApiError> {
        let rows = sqlx::query("SELECT * FROM rollout_policies WHERE enabled = TRUE")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("list_enabled_policies", e))?;
        rows.into_iter().map(row_to_policy).collect()
    }

    pub async fn get(&self, id: Uuid) -> Result<RolloutPolicy, ApiError> {
        let row = sqlx::query("SELECT * FROM rollout_policies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("get_policy", e))?
            .ok_or_else(|| ApiError::new(ErrorCode::PolicyNotFound, "no such rollout policy"))?;
        row_to_policy(row)
    }

    pub async fn create(&self, policy: &RolloutPolicy) -> Result<Uuid, ApiError> {
        Pattern::new(&policy.image_pattern).map_err(|e| {
            ApiError::new(
                ErrorCode::PolicyPatternInvalid,
                format!("invalid image pattern: {e}"),
            )
        })?;

        let row = sqlx::query(
            r#"
            INSERT INTO rollout_policies
                (image_pattern, strategy, staged_fractions, batch_delay_minutes,
                 update_grace_minutes, health_check, auto_rollback, max_failure_rate,
                 maintenance_window, device_filter, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(&policy.image_pattern)
        .bind(strategy_as_str(policy.strategy))
        .bind(&policy.staged_fractions)
        .bind(policy.batch_delay_minutes)
        .bind(policy.update_grace_minutes)
        .bind(policy.health_check.as_ref().map(|h| json!(h)))
        .bind(policy.auto_rollback)
        .bind(policy.max_failure_rate)
        .bind(&policy.maintenance_window)
        .bind(policy.device_filter.as_ref().map(|d| json!(d)))
        .bind(policy.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("create_policy", e))?;

        row.try_get("id")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed insert result"))
    }

    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), ApiError> {
        let result = sqlx::query("UPDATE rollout_policies SET enabled = $1 WHERE id = $2")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("set_policy_enabled", e))?;
        if result.rows_affected() == 0 {
            return Err(ApiError::new(ErrorCode::PolicyNotFound, "no such rollout policy"));
        }
        Ok(())
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), ApiError> {
        let result = sqlx::query("DELETE FROM rollout_policies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("delete_policy", e))?;
        if result.rows_affected() == 0 {
            return Err(ApiError::new(ErrorCode::PolicyNotFound, "no such rollout policy"));
        }
        Ok(())
    }
}

pub(crate) fn strategy_as_str(strategy: fleet_common::types::RolloutStrategy) -> &'static str {
    use fleet_common::types::RolloutStrategy::*;
    match strategy {
        Auto => "auto",
        Staged => "staged",
        Manual => "manual",
        Scheduled => "scheduled",
    }
}

/// Pure so the longest-pattern-wins rule can be unit-tested without a
/// database.
pub fn best_match(policies: &[RolloutPolicy], image_name: &str) -> Option<RolloutPolicy> {
    policies
        .iter()
        .filter(|p| {
            Pattern::new(&p.image_pattern)
                .map(|pat| pat.matches(image_name))
                .unwrap_or(false)
        })
        .max_by_key(|p| p.image_pattern.len())
        .cloned()
}

fn row_to_policy(row: sqlx::postgres::PgRow) -> Result<RolloutPolicy, ApiError> {
    let strategy_raw: String = row
        .try_get("strategy")
        .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed policy row"))?;
    let strategy = serde_json::from_value(json!(strategy_raw))
        .map_err(|_| ApiError::new(ErrorCode::Internal, "unrecognized rollout strategy"))?;

    let health_check: Option<serde_json::Value> = row.try_get("health_check").unwrap_or(None);
    let device_filter: Option<serde_json::Value> = row.try_get("device_filter").unwrap_or(None);

    Ok(RolloutPolicy {
        id: row
            .try_get("id")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed policy row"))?,
        image_pattern: row.try_get("image_pattern").unwrap_or_default(),
        strategy,
        staged_fractions: row.try_get("staged_fractions").unwrap_or_default(),
        batch_delay_minutes: row.try_get("batch_delay_minutes").unwrap_or(10),
        update_grace_minutes: row
            .try_get("update_grace_minutes")
            .unwrap_or_else(|_| RolloutPolicy::default_update_grace_minutes()),
        health_check: health_check.and_then(|v| serde_json::from_value(v).ok()),
        auto_rollback: row.try_get("auto_rollback").unwrap_or(false),
        max_failure_rate: row.try_get("max_failure_rate").unwrap_or(0.2),
        maintenance_window: row.try_get("maintenance_window").unwrap_or(None),
        device_filter: device_filter.and_then(|v| serde_json::from_value(v).ok()),
        enabled: row.try_get("enabled").unwrap_or(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::types::RolloutStrategy;

    fn policy(pattern: &str) -> RolloutPolicy {
        RolloutPolicy {
            id: Uuid::new_v4(),
            image_pattern: pattern.to_string(),
            strategy: RolloutStrategy::Staged,
            staged_fractions: RolloutPolicy::default_fractions(),
            batch_delay_minutes: 10,
            update_grace_minutes: RolloutPolicy::default_update_grace_minutes(),
            health_check: None,
            auto_rollback: false,
            max_failure_rate: RolloutPolicy::default_max_failure_rate(),
            maintenance_window: None,
            device_filter: None,
            enabled: true,
        }
    }

    #[test]
    fn matches_glob_with_star() {
        let policies = vec![policy("nginx*")];
        assert!(best_match(&policies, "nginx").is_some());
        assert!(best_match(&policies, "redis").is_none());
    }

    #[test]
    fn longest_pattern_wins_on_overlap() {
        let policies = vec![policy("*"), policy("nginx*"), policy("nginx-web*")];
        let chosen = best_match(&policies, "nginx-web").unwrap();
        assert_eq!(chosen.image_pattern, "nginx-web*");
    }

    #[test]
    fn no_match_returns_none() {
        let policies = vec![policy("redis*")];
        assert!(best_match(&policies, "nginx").is_none());
    }

    #[test]
    fn question_mark_matches_single_char() {
        let policies = vec![policy("nginx-v?")];
        assert!(best_match(&policies, "nginx-v1").is_some());
        assert!(best_match(&policies, "nginx-v10").is_none());
    }
}

//! Application registry (supports the `id_registry` allocator).
//!
//! An `Application` is the template a device's `AppEntry` is stamped
//! from (`appName`, `slug`, default config). Deletion is refused while
//! any device's target state still references the application's id.

use fleet_common::errors::{ApiError, ErrorCode};
use fleet_common::types::Application;
use serde_json::json;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

#[derive(Clone)]
pub struct ApplicationStore {
    pool: PgPool,
}

pub struct CreateApplication {
    pub app_id: i64,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub default_config: serde_json::Value,
}

impl ApplicationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, req: CreateApplication) -> Result<i64, ApiError> {
        sqlx::query(
            r#"
            INSERT INTO applications (id, name, slug, description, default_config)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(req.app_id)
        .bind(&req.name)
        .bind(&req.slug)
        .bind(&req.description)
        .bind(&req.default_config)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.as_database_error()
                .map(|d| d.is_unique_violation())
                .unwrap_or(false)
            {
                ApiError::new(ErrorCode::ApplicationSlugConflict, "slug already in use")
            } else {
                crate::dberror::classify("create_application", e)
            }
        })?;
        Ok(req.app_id)
    }

    pub async fn list(&self) -> Result<Vec<Application>, ApiError> {
        let rows = sqlx::query("SELECT * FROM applications ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("list_applications", e))?;
        rows.into_iter().map(row_to_application).collect()
    }

    pub async fn get(&self, app_id: i64) -> Result<Application, ApiError> {
        let row = sqlx::query("SELECT * FROM applications WHERE id = $1")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("get_application", e))?
            .ok_or_else(|| ApiError::new(ErrorCode::ApplicationNotFound, "no such application"))?;
        row_to_application(row)
    }

    pub async fn update(
        &self,
        app_id: i64,
        name: Option<String>,
        description: Option<Option<String>>,
        default_config: Option<serde_json::Value>,
    ) -> Result<(), ApiError> {
        let current = self.get(app_id).await?;
        let name = name.unwrap_or(current.name);
        let description = description.unwrap_or(current.description);
        let default_config = default_config.unwrap_or(current.default_config);

        sqlx::query(
            "UPDATE applications SET name = $2, description = $3, default_config = $4 WHERE id = $1",
        )
        .bind(app_id)
        .bind(&name)
        .bind(&description)
        .bind(&default_config)
        .execute(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("update_application", e))?;
        Ok(())
    }

    /// Refuses to delete an application still referenced by any device's
    /// target state.
    pub async fn delete(&self, app_id: i64) -> Result<(), ApiError> {
        let in_use = sqlx::query(
            r#"
            SELECT 1 FROM target_states
            WHERE body -> 'apps' ? $1::text
            LIMIT 1
            "#,
        )
        .bind(app_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("check_application_usage", e))?;

        if in_use.is_some() {
            return Err(ApiError::new(
                ErrorCode::ApplicationInUse,
                "application is referenced by at least one device's target state",
            ));
        }

        let result = sqlx::query("DELETE FROM applications WHERE id = $1")
            .bind(app_id)
            .execute(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("delete_application", e))?;
        if result.rows_affected() == 0 {
            return Err(ApiError::new(ErrorCode::ApplicationNotFound, "no such application"));
        }
        Ok(())
    }
}

fn row_to_application(row: PgRow) -> Result<Application, ApiError> {
    Ok(Application {
        app_id: row
            .try_get("id")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed application row"))?,
        name: row.try_get("name").unwrap_or_default(),
        slug: row.try_get("slug").unwrap_or_default(),
        description: row.try_get("description").unwrap_or(None),
        default_config: row.try_get("default_config").unwrap_or(json!({})),
        created_at: row
            .try_get("created_at")
            .map_err(|_| ApiError::new(ErrorCode::Internal, "malformed application row"))?,
    })
}

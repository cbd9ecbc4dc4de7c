//! ID Allocator.
//!
//! Two independent monotone Postgres sequences: app ids (from 1000) and
//! service ids (from 1). Every draw is paired with an insert into
//! `id_registry`; if that insert conflicts, the sequence value is burned
//! rather than retried, since sequences are cheap and this avoids
//! holding the sequence draw and the registry insert in one transaction.

use fleet_common::errors::{ApiError, ErrorCode};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;

#[derive(Clone)]
pub struct IdAllocator {
    pool: PgPool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    App,
    Service,
}

impl IdKind {
    fn sequence_name(&self) -> &'static str {
        match self {
            IdKind::App => "global_app_id_seq",
            IdKind::Service => "global_service_id_seq",
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            IdKind::App => "app",
            IdKind::Service => "service",
        }
    }
}

impl IdAllocator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Draw the next id of `kind` and register it under `name`.
    ///
    /// Uniqueness on `(kind, id)` is enforced by `id_registry`'s primary
    /// key; a conflict there (which should only happen if something else
    /// has written directly to the sequence) simply consumes this draw
    /// and the caller sees the failure — the *next* draw is still
    /// strictly greater, so the sequence never repeats an id.
    pub async fn allocate(&self, kind: IdKind, name: &str, metadata: Value) -> Result<i64, ApiError> {
        let seq_sql = format!("SELECT nextval('{}') AS id", kind.sequence_name());
        let row = sqlx::query(&seq_sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("allocate_id_sequence", e))?;
        let id: i64 = row.try_get("id").map_err(|_| {
            ApiError::new(ErrorCode::Internal, "id sequence returned unexpected shape")
        })?;

        let insert = sqlx::query(
            "INSERT INTO id_registry (kind, id, name, metadata) VALUES ($1, $2, $3, $4)",
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(name)
        .bind(&metadata)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => Ok(id),
            Err(e) if e.as_database_error().map(|d| d.is_unique_violation()).unwrap_or(false) => {
                Err(ApiError::new(
                    ErrorCode::IdRegistryConflict,
                    format!("id {id} already registered for kind {:?}", kind),
                ))
            }
            Err(e) => Err(crate::dberror::classify("register_allocated_id", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_sequence_names_are_distinct() {
        assert_ne!(IdKind::App.sequence_name(), IdKind::Service.sequence_name());
    }

    #[test]
    fn kind_as_str_matches_registry_check_constraint() {
        assert_eq!(IdKind::App.as_str(), "app");
        assert_eq!(IdKind::Service.as_str(), "service");
    }
}

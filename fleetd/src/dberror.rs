//! Classifies a raw `sqlx::Error` into a store-failure kind:
//! connection-level failures are `not_ready` (the caller can
//! retry once the store recovers), everything else is `internal`.
//!
//! `ApiError` lives in `fleet-common`, which deliberately carries no
//! `sqlx` dependency (the store layer is fleetd-only), so this can't be a
//! `From<sqlx::Error>` impl without violating the orphan rule. A plain
//! function at the fleetd/store boundary does the same job.

use fleet_common::errors::{ApiError, ErrorCode};

pub fn classify(context: &str, error: sqlx::Error) -> ApiError {
    match &error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            ApiError::new(ErrorCode::StoreUnreachable, format!("{context}: store unreachable"))
        }
        _ => ApiError::new(ErrorCode::Internal, format!("{context}: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_classifies_as_not_ready() {
        let err = classify("test", sqlx::Error::PoolTimedOut);
        assert_eq!(err.code, ErrorCode::StoreUnreachable);
    }

    #[test]
    fn pool_closed_classifies_as_not_ready() {
        let err = classify("test", sqlx::Error::PoolClosed);
        assert_eq!(err.code, ErrorCode::StoreUnreachable);
    }

    #[test]
    fn row_not_found_classifies_as_internal() {
        let err = classify("test", sqlx::Error::RowNotFound);
        assert_eq!(err.code, ErrorCode::Internal);
    }
}

//! Authentication extractors.
//!
//! Designing the auth scheme itself is out of scope here: a
//! real deployment validates an opaque bearer/key against its own
//! identity provider. `CredentialChecker` is the seam that deployment
//! would implement; the stub here accepts anything with a non-empty
//! `Authorization` header so routes can be wired and tested end to end.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use fleet_common::errors::{ApiError, ErrorCode};

use super::AppState;

pub trait CredentialChecker: Send + Sync {
    fn check(&self, token: &str) -> bool;
}

struct NonEmptyToken;

impl CredentialChecker for NonEmptyToken {
    fn check(&self, token: &str) -> bool {
        !token.is_empty()
    }
}

fn bearer_token(parts: &Parts) -> Result<&str, ApiError> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::new(ErrorCode::DeviceTokenInvalid, "missing Authorization header"))?;
    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::new(ErrorCode::DeviceTokenInvalid, "Authorization must be a Bearer token"))
}

/// A device identity established by a valid device token. A real
/// deployment's `CredentialChecker` would resolve the token to a device
/// uuid rather than trusting the path parameter.
pub struct DeviceAuth;

impl FromRequestParts<AppState> for DeviceAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        if NonEmptyToken.check(token) {
            Ok(DeviceAuth)
        } else {
            Err(ApiError::new(ErrorCode::DeviceTokenInvalid, "invalid device token"))
        }
    }
}

/// An operator identity established by a valid operator token.
pub struct OperatorAuth;

impl FromRequestParts<AppState> for OperatorAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        if NonEmptyToken.check(token) {
            Ok(OperatorAuth)
        } else {
            Err(ApiError::new(ErrorCode::DeviceTokenInvalid, "invalid operator token"))
        }
    }
}

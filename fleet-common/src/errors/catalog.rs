//! Error catalog for the fleet control plane.
//!
//! # Kinds
//!
//! | Kind            | Status | Meaning                                        |
//! |------------------|--------|------------------------------------------------|
//! | `not_found`      | 404    | unknown device, rollout, policy, application    |
//! | `invalid_input`  | 400    | shape/type violation, unparsable image, etc.    |
//! | `conflict`       | 409    | version/ETag mismatch, duplicate slug, in-use   |
//! | `unauthorized`   | 401    | missing/invalid device token, bad signature     |
//! | `forbidden`      | 403    | operator action on a locked rollout             |
//! | `not_ready`      | 503    | store unreachable, startup incomplete           |
//! | `internal`       | 500    | uncaught failure                                |

use serde::{Deserialize, Serialize};
use std::fmt;

/// The taxonomy kind. This is what callers outside the crate compare
/// against and what the HTTP layer maps to a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Conflict,
    Unauthorized,
    Forbidden,
    NotReady,
    Internal,
}

impl ErrorKind {
    /// The wire string used in `{error: "<kind>", ...}` bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stable, loggable error identity. Extend with new variants as new
/// failure modes are discovered; never remove or renumber an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // -- Device (E0xx) --
    DeviceNotFound,
    DeviceInactive,
    DeviceTokenInvalid,

    // -- Target/current state (E1xx) --
    TargetStateVersionConflict,
    TargetStateShapeInvalid,
    ServiceImageUnparsable,
    LegacyImageShapeRejected,

    // -- Applications / IDs (E2xx) --
    ApplicationNotFound,
    ApplicationSlugConflict,
    ApplicationInUse,
    IdRegistryConflict,

    // -- Rollout policies (E3xx) --
    PolicyNotFound,
    PolicyPatternInvalid,
    NoPolicyMatched,

    // -- Rollouts (E4xx) --
    RolloutNotFound,
    RolloutTransitionInvalid,
    RolloutLocked,

    // -- Jobs (E5xx) --
    JobNotFound,
    JobTargetEmpty,
    DeviceJobAlreadyInProgress,
    JobTemplateNotFound,

    // -- Webhook (E6xx) --
    WebhookSignatureInvalid,
    WebhookPayloadUnrecognized,

    // -- Infra (E9xx) --
    StoreUnreachable,
    Internal,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        use ErrorCode::*;
        match self {
            DeviceNotFound | ApplicationNotFound | PolicyNotFound | RolloutNotFound
            | JobNotFound | JobTemplateNotFound => ErrorKind::NotFound,

            TargetStateShapeInvalid
            | ServiceImageUnparsable
            | LegacyImageShapeRejected
            | PolicyPatternInvalid
            | JobTargetEmpty => ErrorKind::InvalidInput,

            TargetStateVersionConflict
            | ApplicationSlugConflict
            | ApplicationInUse
            | IdRegistryConflict
            | DeviceJobAlreadyInProgress => ErrorKind::Conflict,

            DeviceTokenInvalid | WebhookSignatureInvalid => ErrorKind::Unauthorized,

            RolloutLocked | DeviceInactive => ErrorKind::Forbidden,

            StoreUnreachable => ErrorKind::NotReady,

            NoPolicyMatched | RolloutTransitionInvalid | WebhookPayloadUnrecognized | Internal => {
                ErrorKind::Internal
            }
        }
    }
}

/// The error type returned by every fallible operation in `fleetd`.
///
/// Request handlers never leak a raw `sqlx::Error`; they convert through
/// this type, which is what gets serialized as `{error, message}`.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_matches_taxonomy() {
        assert_eq!(ErrorCode::DeviceNotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            ErrorCode::TargetStateVersionConflict.kind(),
            ErrorKind::Conflict
        );
        assert_eq!(ErrorCode::WebhookSignatureInvalid.kind(), ErrorKind::Unauthorized);
        assert_eq!(ErrorCode::RolloutLocked.kind(), ErrorKind::Forbidden);
        assert_eq!(ErrorCode::StoreUnreachable.kind(), ErrorKind::NotReady);
        assert_eq!(ErrorCode::Internal.kind(), ErrorKind::Internal);
    }

    #[test]
    fn kind_as_str_matches_wire_taxonomy() {
        assert_eq!(ErrorKind::NotFound.as_str(), "not_found");
        assert_eq!(ErrorKind::InvalidInput.as_str(), "invalid_input");
        assert_eq!(ErrorKind::NotReady.as_str(), "not_ready");
    }

    #[test]
    fn api_error_serializes_with_code_and_message() {
        let err = ApiError::new(ErrorCode::DeviceNotFound, "no such device");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "DEVICE_NOT_FOUND");
        assert_eq!(value["message"], "no such device");
    }
}

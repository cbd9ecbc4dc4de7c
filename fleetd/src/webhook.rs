//! Registry webhook ingestion.
//!
//! Accepts Docker Hub and GHCR push notifications, verifies the
//! signature, extracts `(image, tag)`, and hands it to the rollout
//! orchestrator. A payload matching no policy is a normal 200, not an
//! error.

use fleet_common::errors::{ApiError, ErrorCode};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use crate::rollout::RolloutOrchestrator;

type HmacSha256 = Hmac<Sha256>;

pub struct WebhookOutcome {
    pub rollout_id: Option<Uuid>,
    pub image_name: String,
    pub tag: String,
}

/// Verify `X-Hub-Signature` (`sha256=<hex>`) against the raw request
/// body. Constant-time comparison is handled by `hmac`'s `verify_slice`.
pub fn verify_signature(secret: &str, raw_body: &[u8], signature_header: &str) -> Result<(), ApiError> {
    let hex_sig = signature_header
        .strip_prefix("sha256=")
        .unwrap_or(signature_header);
    let expected = hex::decode(hex_sig)
        .map_err(|_| ApiError::new(ErrorCode::WebhookSignatureInvalid, "signature is not valid hex"))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::new(ErrorCode::Internal, "webhook secret has invalid length for hmac"))?;
    mac.update(raw_body);
    mac.verify_slice(&expected)
        .map_err(|_| ApiError::new(ErrorCode::WebhookSignatureInvalid, "signature does not match payload"))
}

/// Parse either the Docker Hub or GHCR push-event shape into `(image, tag)`.
pub fn parse_push_event(payload: &Value) -> Result<(String, String), ApiError> {
    if let Some((image, tag)) = parse_docker_hub(payload) {
        return Ok((image, tag));
    }
    if let Some((image, tag)) = parse_ghcr(payload) {
        return Ok((image, tag));
    }
    Err(ApiError::new(
        ErrorCode::WebhookPayloadUnrecognized,
        "payload matches neither the Docker Hub nor GHCR push event shape",
    ))
}

fn parse_docker_hub(payload: &Value) -> Option<(String, String)> {
    let tag = payload.get("push_data")?.get("tag")?.as_str()?;
    let repo = payload.get("repository")?;
    let namespace = repo.get("namespace").and_then(|v| v.as_str());
    let name = repo.get("name").and_then(|v| v.as_str())?;
    let image = match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    };
    Some((image, tag.to_string()))
}

fn parse_ghcr(payload: &Value) -> Option<(String, String)> {
    let name = payload.get("package")?.get("name")?.as_str()?;
    let tag = payload
        .get("package_version")?
        .get("container_metadata")?
        .get("tag")?
        .get("name")?
        .as_str()?;
    Some((name.to_string(), tag.to_string()))
}

/// Run the full webhook pipeline: verify, parse, hand off to the
/// orchestrator. Signature verification is skipped when `secret` is
/// `None` (no secret configured for this deployment).
pub async fn handle(
    orchestrator: &RolloutOrchestrator,
    secret: Option<&str>,
    raw_body: &[u8],
    signature_header: Option<&str>,
    payload: &Value,
) -> Result<WebhookOutcome, ApiError> {
    if let Some(secret) = secret {
        let header = signature_header.ok_or_else(|| {
            ApiError::new(ErrorCode::WebhookSignatureInvalid, "missing X-Hub-Signature header")
        })?;
        verify_signature(secret, raw_body, header)?;
    }

    let (image_name, tag) = parse_push_event(payload)?;

    let rollout_id = orchestrator
        .create_rollout(&image_name, &tag, None, "webhook", Some(payload.clone()))
        .await?;

    Ok(WebhookOutcome {
        rollout_id,
        image_name,
        tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_docker_hub_shape_with_namespace() {
        let payload = json!({
            "push_data": { "tag": "1.2.3" },
            "repository": { "namespace": "acme", "name": "web", "repo_name": "acme/web" },
        });
        let (image, tag) = parse_push_event(&payload).unwrap();
        assert_eq!(image, "acme/web");
        assert_eq!(tag, "1.2.3");
    }

    #[test]
    fn parses_docker_hub_shape_without_namespace() {
        let payload = json!({
            "push_data": { "tag": "latest" },
            "repository": { "name": "nginx", "repo_name": "nginx" },
        });
        let (image, tag) = parse_push_event(&payload).unwrap();
        assert_eq!(image, "nginx");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn parses_ghcr_shape() {
        let payload = json!({
            "package": { "name": "acme/web" },
            "package_version": { "container_metadata": { "tag": { "name": "2.0.0" } } },
        });
        let (image, tag) = parse_push_event(&payload).unwrap();
        assert_eq!(image, "acme/web");
        assert_eq!(tag, "2.0.0");
    }

    #[test]
    fn unrecognized_shape_is_rejected() {
        let payload = json!({ "hello": "world" });
        let err = parse_push_event(&payload).unwrap_err();
        assert_eq!(err.code, ErrorCode::WebhookPayloadUnrecognized);
    }

    #[test]
    fn signature_round_trips() {
        let secret = "shhh";
        let body = br#"{"push_data":{"tag":"1.0"}}"#;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={sig}");
        assert!(verify_signature(secret, body, &header).is_ok());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let secret = "shhh";
        let body = br#"{"push_data":{"tag":"1.0"}}"#;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());
        let header = format!("sha256={sig}");
        let tampered = br#"{"push_data":{"tag":"9.9"}}"#;
        assert!(verify_signature(secret, tampered, &header).is_err());
    }
}

//! Health Checker: probes a device for successful rollout.

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use fleet_common::types::{HealthCheckSpec, HealthCheckType};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state_store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Pass,
    Fail,
}

/// Expand `{device_ip}` / `{device_uuid}` placeholders in an endpoint
/// template. Pure so the substitution rule can be tested without a
/// network call.
pub fn expand_endpoint(template: &str, device_ip: &str, device_uuid: Uuid) -> String {
    template
        .replace("{device_ip}", device_ip)
        .replace("{device_uuid}", &device_uuid.to_string())
}

pub struct HealthChecker {
    state_store: StateStore,
}

impl HealthChecker {
    pub fn new(state_store: StateStore) -> Self {
        Self { state_store }
    }

    /// Run the probe up to `spec.retries` times with `spec.interval_ms`
    /// between attempts, returning the first pass or the final failure.
    pub async fn check(
        &self,
        spec: &HealthCheckSpec,
        device_uuid: Uuid,
        device_ip: &str,
        image_name: &str,
        expected_tag: &str,
    ) -> ProbeOutcome {
        let attempts = spec.retries.max(1);
        for attempt in 0..attempts {
            let outcome = self
                .probe_once(spec, device_uuid, device_ip, image_name, expected_tag)
                .await;
            if outcome == ProbeOutcome::Pass {
                return ProbeOutcome::Pass;
            }
            debug!(%device_uuid, attempt, "health probe attempt failed");
            if attempt + 1 < attempts {
                sleep(Duration::from_millis(spec.interval_ms)).await;
            }
        }
        ProbeOutcome::Fail
    }

    async fn probe_once(
        &self,
        spec: &HealthCheckSpec,
        device_uuid: Uuid,
        device_ip: &str,
        image_name: &str,
        expected_tag: &str,
    ) -> ProbeOutcome {
        match spec.kind {
            HealthCheckType::Http => self.probe_http(spec, device_uuid, device_ip).await,
            HealthCheckType::Tcp => self.probe_tcp(spec, device_ip).await,
            HealthCheckType::Container => {
                self.probe_container(device_uuid, image_name, expected_tag).await
            }
        }
    }

    async fn probe_http(
        &self,
        spec: &HealthCheckSpec,
        device_uuid: Uuid,
        device_ip: &str,
    ) -> ProbeOutcome {
        let Some(template) = spec.endpoint_template.as_ref() else {
            warn!(%device_uuid, "http health check configured without endpoint_template");
            return ProbeOutcome::Fail;
        };
        let url = expand_endpoint(template, device_ip, device_uuid);
        let expected = spec.expected_status.clone();
        let timeout = Duration::from_millis(spec.timeout_ms);

        let call = tokio::task::spawn_blocking(move || {
            ureq::get(&url).call().map(|resp| resp.status().as_u16())
        });

        let result = tokio::time::timeout(timeout, call).await;

        match result {
            Ok(Ok(Ok(status))) if expected.contains(&status) => ProbeOutcome::Pass,
            Ok(Ok(Ok(status))) => {
                debug!(%device_uuid, status, "http health check returned unexpected status");
                ProbeOutcome::Fail
            }
            Ok(Ok(Err(e))) => {
                debug!(%device_uuid, error = %e, "http health check request failed");
                ProbeOutcome::Fail
            }
            Ok(Err(e)) => {
                warn!(%device_uuid, error = %e, "http health check task panicked");
                ProbeOutcome::Fail
            }
            Err(_) => {
                debug!(%device_uuid, "http health check timed out");
                ProbeOutcome::Fail
            }
        }
    }

    async fn probe_tcp(&self, spec: &HealthCheckSpec, device_ip: &str) -> ProbeOutcome {
        let Ok(addr) = device_ip.parse::<SocketAddr>() else {
            warn!(device_ip, "tcp health check target is not host:port");
            return ProbeOutcome::Fail;
        };
        let timeout = Duration::from_millis(spec.timeout_ms);
        match tokio::task::spawn_blocking(move || TcpStream::connect_timeout(&addr, timeout)).await {
            Ok(Ok(_)) => ProbeOutcome::Pass,
            _ => ProbeOutcome::Fail,
        }
    }

    /// Examine the device's *reported current state* (not its target
    /// state) for a service running `image_name` at `expected_tag`, and
    /// trust the device's own report that it is running.
    async fn probe_container(
        &self,
        device_uuid: Uuid,
        image_name: &str,
        expected_tag: &str,
    ) -> ProbeOutcome {
        match self
            .state_store
            .current_state_has_image(device_uuid, image_name, expected_tag)
            .await
        {
            Ok(true) => ProbeOutcome::Pass,
            Ok(false) => ProbeOutcome::Fail,
            Err(_) => ProbeOutcome::Fail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_endpoint_substitutes_both_placeholders() {
        let uuid = Uuid::new_v4();
        let out = expand_endpoint("http://{device_ip}/health?id={device_uuid}", "10.0.0.5", uuid);
        assert_eq!(out, format!("http://10.0.0.5/health?id={uuid}"));
    }

    #[test]
    fn expand_endpoint_is_a_no_op_without_placeholders() {
        let uuid = Uuid::new_v4();
        let out = expand_endpoint("http://example.com/health", "10.0.0.5", uuid);
        assert_eq!(out, "http://example.com/health");
    }
}

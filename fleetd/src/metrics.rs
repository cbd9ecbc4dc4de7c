//! Prometheus metrics surface, exposed at `GET /metrics`.
//!
//! The counters and gauges tracked here mirror the aggregates already
//! kept per-rollout and per-job in Postgres; this module exists purely
//! to make them scrapeable, not as a second source of truth.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref DEVICES_ONLINE: IntGauge = IntGauge::new(
        "fleet_devices_online",
        "Number of devices currently marked online"
    )
    .expect("metric definition");

    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_events_published_total", "Events appended to the event log"),
        &["event_type"]
    )
    .expect("metric definition");

    pub static ref ROLLOUT_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_rollout_transitions_total", "Rollout status transitions applied"),
        &["to_status"]
    )
    .expect("metric definition");

    pub static ref JOBS_TIMED_OUT_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fleet_jobs_timed_out_total", "Device jobs swept into TIMED_OUT"),
        &["job_name"]
    )
    .expect("metric definition");
}

/// Registers every collector. Call once at startup before serving
/// `/metrics`; a second registration of the same collector is a bug, not
/// a condition to recover from at runtime.
pub fn register() {
    REGISTRY
        .register(Box::new(DEVICES_ONLINE.clone()))
        .expect("register DEVICES_ONLINE");
    REGISTRY
        .register(Box::new(EVENTS_PUBLISHED_TOTAL.clone()))
        .expect("register EVENTS_PUBLISHED_TOTAL");
    REGISTRY
        .register(Box::new(ROLLOUT_TRANSITIONS_TOTAL.clone()))
        .expect("register ROLLOUT_TRANSITIONS_TOTAL");
    REGISTRY
        .register(Box::new(JOBS_TIMED_OUT_TOTAL.clone()))
        .expect("register JOBS_TIMED_OUT_TOTAL");
}

/// Render the registry in the Prometheus text exposition format.
pub fn encode() -> Result<String, prometheus::Error> {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_nonempty_text_after_register() {
        register();
        DEVICES_ONLINE.set(3);
        let text = encode().unwrap();
        assert!(text.contains("fleet_devices_online"));
    }
}

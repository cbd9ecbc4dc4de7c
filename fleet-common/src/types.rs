//! Domain types shared between the store layer and the HTTP layer.
//!
//! The device documents are modeled as
//! typed structs with typed leaves (`appId: i64`, `services: Vec<...>`)
//! rather than re-stringified maps; the stringified-id shape on the wire
//! (`{"<appId>": {...}}`) is converted at the HTTP boundary, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One deployed application inside a device's state document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppEntry {
    pub app_id: i64,
    pub app_name: String,
    pub services: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub service_id: i64,
    pub service_name: String,
    pub image_name: String,
    #[serde(default)]
    pub config: ServiceConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// The full shape of a device's target or current state document.
///
/// `apps` is keyed by stringified `appId` on the wire (;
/// internally it is keyed by the typed `i64` so lookups don't re-parse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub apps: BTreeMap<i64, AppEntry>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl StateDocument {
    pub fn empty() -> Self {
        Self {
            apps: BTreeMap::new(),
            config: serde_json::json!({}),
        }
    }

    /// All services across all apps, with their owning app id.
    pub fn services(&self) -> impl Iterator<Item = (i64, &ServiceEntry)> {
        self.apps
            .iter()
            .flat_map(|(app_id, app)| app.services.iter().map(move |s| (*app_id, s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    RaspberryPi,
    Generic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub uuid: Uuid,
    pub display_name: String,
    pub device_type: String,
    pub is_active: bool,
    pub is_online: bool,
    pub last_contact_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A registered application template: a name/slug plus the config
/// defaults new `AppEntry` instances are seeded from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub app_id: i64,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub default_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    Auto,
    Staged,
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckType {
    Http,
    Tcp,
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    #[serde(rename = "type")]
    pub kind: HealthCheckType,
    #[serde(default)]
    pub endpoint_template: Option<String>,
    #[serde(default = "default_expected_status")]
    pub expected_status: Vec<u16>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_expected_status() -> Vec<u16> {
    vec![200]
}
fn default_timeout_ms() -> u64 {
    5_000
}
fn default_retries() -> u32 {
    3
}
fn default_interval_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceFilter {
    #[serde(default)]
    pub fleet_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub device_uuids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutPolicy {
    pub id: Uuid,
    pub image_pattern: String,
    pub strategy: RolloutStrategy,
    pub staged_fractions: Vec<f64>,
    pub batch_delay_minutes: i64,
    /// How long a device may sit in `updating` without reporting the new
    /// tag before it is forced into `verifying` anyway. Without this a
    /// device that never calls back (offline, bricked) would stall its
    /// batch, and every later batch, forever.
    pub update_grace_minutes: i64,
    pub health_check: Option<HealthCheckSpec>,
    pub auto_rollback: bool,
    pub max_failure_rate: f64,
    pub maintenance_window: Option<String>,
    pub device_filter: Option<DeviceFilter>,
    pub enabled: bool,
}

impl RolloutPolicy {
    pub fn default_fractions() -> Vec<f64> {
        vec![0.10, 0.50, 1.00]
    }

    pub fn default_max_failure_rate() -> f64 {
        0.2
    }

    pub fn default_update_grace_minutes() -> i64 {
        15
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl RolloutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutStatus::Completed
                | RolloutStatus::Failed
                | RolloutStatus::Cancelled
                | RolloutStatus::RolledBack
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutCounters {
    pub updated: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub rolled_back: i64,
    pub healthy: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rollout {
    pub rollout_id: Uuid,
    pub policy_id: Uuid,
    pub image_name: String,
    pub old_tag: Option<String>,
    pub new_tag: String,
    pub strategy: RolloutStrategy,
    pub status: RolloutStatus,
    pub total_devices: i64,
    pub current_batch: i32,
    pub batch_fractions: Vec<f64>,
    pub next_batch_eligible_at: Option<DateTime<Utc>>,
    pub counters: RolloutCounters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub triggered_by: String,
    pub webhook_payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRolloutState {
    Scheduled,
    Updating,
    Verifying,
    Succeeded,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRolloutStatus {
    pub rollout_id: Uuid,
    pub device_uuid: Uuid,
    pub batch_number: i32,
    pub status: DeviceRolloutState,
    pub old_image_tag: Option<String>,
    pub new_image_tag: String,
    pub scheduled_at: DateTime<Utc>,
    pub update_started_at: Option<DateTime<Utc>>,
    pub update_completed_at: Option<DateTime<Utc>>,
    pub health_checked_at: Option<DateTime<Utc>>,
    pub health_check_passed: Option<bool>,
    pub retry_count: i32,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub aggregate_kind: String,
    pub aggregate_id: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTargetType {
    Device,
    Group,
}

/// A reusable job document, referenced by `Job::template_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTemplate {
    pub id: Uuid,
    pub name: String,
    pub document: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub job_name: String,
    pub template_id: Option<Uuid>,
    pub document: serde_json::Value,
    pub target_type: JobTargetType,
    pub target_devices: Vec<Uuid>,
    pub timeout_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub status: JobAggregateStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobAggregateStatus {
    Pending,
    InProgress,
    Succeeded,
    PartiallyFailed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceJobState {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl DeviceJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeviceJobState::Succeeded
                | DeviceJobState::Failed
                | DeviceJobState::TimedOut
                | DeviceJobState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceJobStatus {
    pub job_id: Uuid,
    pub device_uuid: Uuid,
    pub status: DeviceJobState,
    pub status_details: Option<serde_json::Value>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate a job's child statuses into the parent's overall status.
///
/// Mirrors.6: `PENDING -> IN_PROGRESS -> SUCCEEDED |
/// PARTIALLY_FAILED | FAILED | TIMED_OUT`.
pub fn aggregate_job_status(children: &[DeviceJobState]) -> JobAggregateStatus {
    if children.is_empty() {
        return JobAggregateStatus::Pending;
    }

    let total = children.len();
    let queued = children
        .iter()
        .filter(|s| **s == DeviceJobState::Queued)
        .count();
    let in_progress = children
        .iter()
        .filter(|s| **s == DeviceJobState::InProgress)
        .count();
    let succeeded = children
        .iter()
        .filter(|s| **s == DeviceJobState::Succeeded)
        .count();
    let failed = children
        .iter()
        .filter(|s| **s == DeviceJobState::Failed)
        .count();
    let timed_out = children
        .iter()
        .filter(|s| **s == DeviceJobState::TimedOut)
        .count();
    let cancelled = children
        .iter()
        .filter(|s| **s == DeviceJobState::Cancelled)
        .count();

    let terminal = succeeded + failed + timed_out + cancelled;

    if queued == total {
        return JobAggregateStatus::Pending;
    }
    if terminal < total {
        return JobAggregateStatus::InProgress;
    }

    // All terminal.
    if timed_out > 0 && succeeded == 0 && failed == 0 {
        return JobAggregateStatus::TimedOut;
    }
    if failed == total || (failed + timed_out + cancelled) == total {
        return JobAggregateStatus::Failed;
    }
    if succeeded == total {
        return JobAggregateStatus::Succeeded;
    }
    JobAggregateStatus::PartiallyFailed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_document_round_trips_through_json() {
        let mut doc = StateDocument::empty();
        doc.apps.insert(
            1000,
            AppEntry {
                app_id: 1000,
                app_name: "mon".into(),
                services: vec![ServiceEntry {
                    service_id: 1,
                    service_name: "nginx".into(),
                    image_name: "nginx:1.0".into(),
                    config: ServiceConfig::default(),
                }],
            },
        );
        let json = serde_json::to_string(&doc).unwrap();
        let back: StateDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn services_iterates_across_all_apps() {
        let mut doc = StateDocument::empty();
        doc.apps.insert(
            1000,
            AppEntry {
                app_id: 1000,
                app_name: "a".into(),
                services: vec![
                    ServiceEntry {
                        service_id: 1,
                        service_name: "s1".into(),
                        image_name: "nginx:1.0".into(),
                        config: ServiceConfig::default(),
                    },
                    ServiceEntry {
                        service_id: 2,
                        service_name: "s2".into(),
                        image_name: "redis:6".into(),
                        config: ServiceConfig::default(),
                    },
                ],
            },
        );
        let collected: Vec<_> = doc.services().map(|(app, s)| (app, s.service_id)).collect();
        assert_eq!(collected, vec![(1000, 1), (1000, 2)]);
    }

    #[test]
    fn aggregate_all_queued_is_pending() {
        let s = vec![DeviceJobState::Queued, DeviceJobState::Queued];
        assert_eq!(aggregate_job_status(&s), JobAggregateStatus::Pending);
    }

    #[test]
    fn aggregate_mixed_in_flight_is_in_progress() {
        let s = vec![DeviceJobState::Succeeded, DeviceJobState::InProgress];
        assert_eq!(aggregate_job_status(&s), JobAggregateStatus::InProgress);
    }

    #[test]
    fn aggregate_all_succeeded() {
        let s = vec![DeviceJobState::Succeeded, DeviceJobState::Succeeded];
        assert_eq!(aggregate_job_status(&s), JobAggregateStatus::Succeeded);
    }

    #[test]
    fn aggregate_all_failed() {
        let s = vec![DeviceJobState::Failed, DeviceJobState::Failed];
        assert_eq!(aggregate_job_status(&s), JobAggregateStatus::Failed);
    }

    #[test]
    fn aggregate_mixed_terminal_is_partially_failed() {
        let s = vec![DeviceJobState::Succeeded, DeviceJobState::Failed];
        assert_eq!(aggregate_job_status(&s), JobAggregateStatus::PartiallyFailed);
    }

    #[test]
    fn aggregate_all_timed_out() {
        let s = vec![DeviceJobState::TimedOut, DeviceJobState::TimedOut];
        assert_eq!(aggregate_job_status(&s), JobAggregateStatus::TimedOut);
    }

    #[test]
    fn aggregate_empty_is_pending() {
        assert_eq!(aggregate_job_status(&[]), JobAggregateStatus::Pending);
    }

    #[test]
    fn rollout_status_terminal_set() {
        assert!(RolloutStatus::Completed.is_terminal());
        assert!(RolloutStatus::Cancelled.is_terminal());
        assert!(!RolloutStatus::Running.is_terminal());
        assert!(!RolloutStatus::Paused.is_terminal());
    }
}

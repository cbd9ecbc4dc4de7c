//! Liveness Monitor.
//!
//! The crash-safe downtime logic is the most bug-prone part of a system
//! like this, so it is isolated here as a pure function over
//! plain values: `evaluate(inputs) -> Outcome`. Everything below this
//! line is DB/event plumbing around that pure core; everything in
//! `algorithm` is deterministic and unit-testable without a database.

use chrono::{DateTime, Utc};
use fleet_common::errors::ApiError;
use serde_json::json;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::event_log::{EventLog, PublishOptions};

pub mod algorithm {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct DeviceSnapshot {
        pub uuid: Uuid,
        pub last_contact_at: Option<DateTime<Utc>>,
    }

    #[derive(Debug, Clone)]
    pub struct Inputs {
        pub t_last: Option<DateTime<Utc>>,
        pub now: DateTime<Utc>,
        pub tick_interval: Duration,
        pub offline_threshold: Duration,
        /// Devices currently recorded as online; only these are
        /// candidates for being marked offline this sweep.
        pub online_devices: Vec<DeviceSnapshot>,
    }

    #[derive(Debug, Clone)]
    pub struct OfflineDecision {
        pub uuid: Uuid,
        pub prior_last_contact_at: Option<DateTime<Utc>>,
        pub reason: &'static str,
    }

    #[derive(Debug, Clone)]
    pub struct RestartInfo {
        pub downtime: Duration,
        pub t_last: DateTime<Utc>,
        pub now: DateTime<Utc>,
    }

    #[derive(Debug, Clone)]
    pub struct Outcome {
        pub to_mark_offline: Vec<OfflineDecision>,
        pub new_t_last: DateTime<Utc>,
        pub restart: Option<RestartInfo>,
    }

    /// The crash-safe sweep decision: first-run, restart-after-downtime,
    /// and normal-sweep paths.
    pub fn evaluate(inputs: Inputs) -> Outcome {
        let Inputs {
            t_last,
            now,
            tick_interval,
            offline_threshold,
            online_devices,
        } = inputs;

        let Some(t_last) = t_last else {
            // First run ever: normal sweep only, no api_restart.
            let to_mark_offline = sweep_normally(&online_devices, now, offline_threshold);
            return Outcome {
                to_mark_offline,
                new_t_last: now,
                restart: None,
            };
        };

        let downtime = (now - t_last)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if downtime > tick_interval.saturating_mul(2) {
            // The plane was down for longer than two ticks: only devices
            // that were already inactive before the known-good anchor
            // `t_last` are marked offline. Devices that contacted between
            // `t_last` and the crash are presumed online pending their own
            // inactivity on a later sweep.
            let to_mark_offline = online_devices
                .iter()
                .filter(|d| match d.last_contact_at {
                    Some(contact) => contact < t_last,
                    None => true,
                })
                .map(|d| OfflineDecision {
                    uuid: d.uuid,
                    prior_last_contact_at: d.last_contact_at,
                    reason: "offline_before_restart_anchor",
                })
                .collect();

            Outcome {
                to_mark_offline,
                new_t_last: now,
                restart: Some(RestartInfo {
                    downtime,
                    t_last,
                    now,
                }),
            }
        } else {
            let to_mark_offline = sweep_normally(&online_devices, now, offline_threshold);
            Outcome {
                to_mark_offline,
                new_t_last: now,
                restart: None,
            }
        }
    }

    fn sweep_normally(
        online_devices: &[DeviceSnapshot],
        now: DateTime<Utc>,
        offline_threshold: Duration,
    ) -> Vec<OfflineDecision> {
        online_devices
            .iter()
            .filter(|d| match d.last_contact_at {
                Some(contact) => {
                    (now - contact).to_std().unwrap_or(Duration::ZERO) > offline_threshold
                }
                None => true,
            })
            .map(|d| OfflineDecision {
                uuid: d.uuid,
                prior_last_contact_at: d.last_contact_at,
                reason: "inactive",
            })
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::TimeZone;

        fn ts(s: &str) -> DateTime<Utc> {
            DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
        }

        #[test]
        fn first_run_has_no_t_last_does_normal_sweep_no_restart_event() {
            let now = ts("2026-01-01T10:00:00Z");
            let inputs = Inputs {
                t_last: None,
                now,
                tick_interval: Duration::from_secs(60),
                offline_threshold: Duration::from_secs(300),
                online_devices: vec![DeviceSnapshot {
                    uuid: Uuid::nil(),
                    last_contact_at: Some(ts("2026-01-01T09:00:00Z")),
                }],
            };
            let outcome = evaluate(inputs);
            assert!(outcome.restart.is_none());
            assert_eq!(outcome.to_mark_offline.len(), 1);
            assert_eq!(outcome.new_t_last, now);
        }

        #[test]
        fn normal_sweep_marks_only_devices_past_threshold() {
            let now = ts("2026-01-01T10:00:00Z");
            let fresh = DeviceSnapshot {
                uuid: Uuid::new_v4(),
                last_contact_at: Some(ts("2026-01-01T09:57:00Z")), // 3 min ago
            };
            let stale = DeviceSnapshot {
                uuid: Uuid::new_v4(),
                last_contact_at: Some(ts("2026-01-01T09:50:00Z")), // 10 min ago
            };
            let inputs = Inputs {
                t_last: Some(ts("2026-01-01T09:59:00Z")),
                now,
                tick_interval: Duration::from_secs(60),
                offline_threshold: Duration::from_secs(300), // 5 min
                online_devices: vec![fresh.clone(), stale.clone()],
            };
            let outcome = evaluate(inputs);
            assert!(outcome.restart.is_none());
            assert_eq!(outcome.to_mark_offline.len(), 1);
            assert_eq!(outcome.to_mark_offline[0].uuid, stale.uuid);
        }

        /// Restart-anchor scenario: T_last=10:00:00, restart at 10:30 after a
        /// 30-minute downtime (> 2x the 1-minute tick). D contacted at
        /// 10:00:30 (after T_last) and must NOT be marked offline; E's last
        /// contact at 09:55 (before T_last) MUST be marked offline.
        #[test]
        fn restart_scenario_only_marks_devices_inactive_before_anchor() {
            let t_last = ts("2026-01-01T10:00:00Z");
            let now = ts("2026-01-01T10:30:00Z");
            let device_d = DeviceSnapshot {
                uuid: Uuid::new_v4(),
                last_contact_at: Some(ts("2026-01-01T10:00:30Z")),
            };
            let device_e = DeviceSnapshot {
                uuid: Uuid::new_v4(),
                last_contact_at: Some(ts("2026-01-01T09:55:00Z")),
            };
            let inputs = Inputs {
                t_last: Some(t_last),
                now,
                tick_interval: Duration::from_secs(60),
                offline_threshold: Duration::from_secs(300),
                online_devices: vec![device_d.clone(), device_e.clone()],
            };
            let outcome = evaluate(inputs);
            assert!(outcome.restart.is_some());
            let restart = outcome.restart.unwrap();
            assert_eq!(restart.t_last, t_last);
            assert_eq!(restart.downtime, Duration::from_secs(30 * 60));

            let offline_uuids: Vec<_> = outcome.to_mark_offline.iter().map(|d| d.uuid).collect();
            assert!(!offline_uuids.contains(&device_d.uuid), "D contacted after T_last, must stay online");
            assert!(offline_uuids.contains(&device_e.uuid), "E was already inactive before T_last");
        }

        #[test]
        fn short_downtime_does_not_trigger_restart_path() {
            let now = ts("2026-01-01T10:01:30Z");
            let inputs = Inputs {
                t_last: Some(ts("2026-01-01T10:00:00Z")), // 90s gap, tick=60s -> threshold is 120s
                now,
                tick_interval: Duration::from_secs(60),
                offline_threshold: Duration::from_secs(300),
                online_devices: vec![],
            };
            let outcome = evaluate(inputs);
            assert!(outcome.restart.is_none());
        }

        #[test]
        fn device_with_no_recorded_contact_is_marked_offline() {
            let now = ts("2026-01-01T10:00:00Z");
            let inputs = Inputs {
                t_last: Some(ts("2026-01-01T09:59:00Z")),
                now,
                tick_interval: Duration::from_secs(60),
                offline_threshold: Duration::from_secs(300),
                online_devices: vec![DeviceSnapshot {
                    uuid: Uuid::new_v4(),
                    last_contact_at: None,
                }],
            };
            let outcome = evaluate(inputs);
            assert_eq!(outcome.to_mark_offline.len(), 1);
        }
    }
}

pub struct LivenessMonitor {
    pool: PgPool,
    events: EventLog,
    tick_interval: Duration,
    offline_threshold: Duration,
}

const SYSTEM_CONFIG_KEY: &str = "heartbeat_last_check";

impl LivenessMonitor {
    pub fn new(
        pool: PgPool,
        events: EventLog,
        tick_interval: Duration,
        offline_threshold: Duration,
    ) -> Self {
        Self {
            pool,
            events,
            tick_interval,
            offline_threshold,
        }
    }

    pub async fn run_once(&self) -> Result<usize, ApiError> {
        let now = Utc::now();
        let t_last = self.read_t_last().await?;
        let online_devices = self.fetch_online_devices().await?;

        let outcome = algorithm::evaluate(algorithm::Inputs {
            t_last,
            now,
            tick_interval: self.tick_interval,
            offline_threshold: self.offline_threshold,
            online_devices,
        });

        if let Some(restart) = &outcome.restart {
            warn!(
                downtime_secs = restart.downtime.as_secs(),
                t_last = %restart.t_last,
                "control plane restart detected by liveness monitor"
            );
            self.events
                .publish(
                    "api_restart",
                    "system",
                    "liveness_monitor",
                    &json!({
                        "downtime_seconds": restart.downtime.as_secs(),
                        "t_last": restart.t_last,
                        "now": restart.now,
                    }),
                    PublishOptions::default(),
                )
                .await?;
        }

        let marked = outcome.to_mark_offline.len();
        for decision in &outcome.to_mark_offline {
            sqlx::query("UPDATE devices SET is_online = FALSE WHERE uuid = $1")
                .bind(decision.uuid)
                .execute(&self.pool)
                .await
                .map_err(|e| crate::dberror::classify("mark_device_offline", e))?;

            self.events
                .publish(
                    "device.offline",
                    "device",
                    &decision.uuid.to_string(),
                    &json!({
                        "prior_last_contact_at": decision.prior_last_contact_at,
                        "reason": decision.reason,
                    }),
                    PublishOptions::default(),
                )
                .await?;
            info!(device_uuid = %decision.uuid, reason = decision.reason, "device marked offline");
        }

        self.write_t_last(outcome.new_t_last).await?;
        Ok(marked)
    }

    async fn read_t_last(&self) -> Result<Option<DateTime<Utc>>, ApiError> {
        let row = sqlx::query("SELECT value FROM system_config WHERE key = $1")
            .bind(SYSTEM_CONFIG_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| crate::dberror::classify("read_heartbeat_checkpoint", e))?;

        Ok(row.and_then(|r| {
            let value: serde_json::Value = r.try_get("value").ok()?;
            value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        }))
    }

    async fn write_t_last(&self, t: DateTime<Utc>) -> Result<(), ApiError> {
        sqlx::query(
            r#"
            INSERT INTO system_config (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(SYSTEM_CONFIG_KEY)
        .bind(json!(t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("write_heartbeat_checkpoint", e))?;
        Ok(())
    }

    async fn fetch_online_devices(&self) -> Result<Vec<algorithm::DeviceSnapshot>, ApiError> {
        let rows = sqlx::query(
            "SELECT uuid, last_contact_at FROM devices WHERE is_online = TRUE AND is_active = TRUE",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("fetch_online_devices", e))?;

        Ok(rows
            .into_iter()
            .map(|r| algorithm::DeviceSnapshot {
                uuid: r.try_get("uuid").unwrap_or_default(),
                last_contact_at: r.try_get("last_contact_at").ok(),
            })
            .collect())
    }
}

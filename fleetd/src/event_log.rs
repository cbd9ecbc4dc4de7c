//! Event Log.
//!
//! Append-only, day-partitioned record of every state change. Every
//! other component publishes through this module rather than writing
//! directly to the `events` table, so the checksum and partition
//! invariants stay in one place.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use fleet_common::errors::{ApiError, ErrorCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use fleet_common::types::Event;

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub source: Option<String>,
}

/// Canonicalize `(type, aggregate_kind, aggregate_id, payload, timestamp)`
/// and hash it. `serde_json` (without the `preserve_order` feature) always
/// renders object keys in sorted order, so this is stable regardless of
/// how the caller constructed the payload.
pub fn compute_checksum(
    event_type: &str,
    aggregate_kind: &str,
    aggregate_id: &str,
    payload: &serde_json::Value,
    timestamp: DateTime<Utc>,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}",
        event_type,
        aggregate_kind,
        aggregate_id,
        payload,
        timestamp.to_rfc3339()
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct EventLog {
    pool: PgPool,
    /// Best-effort in-process fan-out for `listen()` subscribers. Not
    /// authoritative: consumers must be able to reconstruct state from
    /// polled queries if they miss a notification.
    bus: broadcast::Sender<Event>,
}

impl EventLog {
    pub fn new(pool: PgPool) -> Self {
        let (bus, _) = broadcast::channel(1024);
        Self { pool, bus }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    pub async fn publish<T: Serialize>(
        &self,
        event_type: &str,
        aggregate_kind: &str,
        aggregate_id: &str,
        payload: &T,
        opts: PublishOptions,
    ) -> Result<Uuid, ApiError> {
        let payload_value = serde_json::to_value(payload)
            .map_err(|e| ApiError::new(ErrorCode::Internal, format!("payload not serializable: {e}")))?;
        let timestamp = Utc::now();
        let checksum = compute_checksum(event_type, aggregate_kind, aggregate_id, &payload_value, timestamp);
        let event_id = Uuid::new_v4();
        let source = opts.source.unwrap_or_else(|| "fleetd".to_string());

        sqlx::query(
            r#"
            INSERT INTO events
                (event_id, event_type, aggregate_kind, aggregate_id, payload,
                 correlation_id, causation_id, source, ts, checksum)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(aggregate_kind)
        .bind(aggregate_id)
        .bind(&payload_value)
        .bind(opts.correlation_id)
        .bind(opts.causation_id)
        .bind(&source)
        .bind(timestamp)
        .bind(&checksum)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            warn!(error = %e, event_type, "event publish failed");
            crate::dberror::classify("publish_event", e)
        })?;

        let event = Event {
            event_id,
            event_type: event_type.to_string(),
            aggregate_kind: aggregate_kind.to_string(),
            aggregate_id: aggregate_id.to_string(),
            payload: payload_value,
            correlation_id: opts.correlation_id,
            causation_id: opts.causation_id,
            source,
            timestamp,
            checksum,
        };
        let _ = self.bus.send(event);

        Ok(event_id)
    }

    /// Publish several events atomically: either all are durably recorded
    /// or none are.
    pub async fn publish_batch<T: Serialize>(
        &self,
        events: Vec<(String, String, String, T, PublishOptions)>,
    ) -> Result<Vec<Uuid>, ApiError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| crate::dberror::classify("publish_batch_begin", e))?;

        let mut ids = Vec::with_capacity(events.len());
        let mut emitted = Vec::with_capacity(events.len());

        for (event_type, aggregate_kind, aggregate_id, payload, opts) in events {
            let payload_value = serde_json::to_value(&payload).map_err(|e| {
                ApiError::new(ErrorCode::Internal, format!("payload not serializable: {e}"))
            })?;
            let timestamp = Utc::now();
            let checksum =
                compute_checksum(&event_type, &aggregate_kind, &aggregate_id, &payload_value, timestamp);
            let event_id = Uuid::new_v4();
            let source = opts.source.clone().unwrap_or_else(|| "fleetd".to_string());

            sqlx::query(
                r#"
                INSERT INTO events
                    (event_id, event_type, aggregate_kind, aggregate_id, payload,
                     correlation_id, causation_id, source, ts, checksum)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(event_id)
            .bind(&event_type)
            .bind(&aggregate_kind)
            .bind(&aggregate_id)
            .bind(&payload_value)
            .bind(opts.correlation_id)
            .bind(opts.causation_id)
            .bind(&source)
            .bind(timestamp)
            .bind(&checksum)
            .execute(&mut *tx)
            .await
            .map_err(|e| crate::dberror::classify("publish_batch_insert", e))?;

            ids.push(event_id);
            emitted.push(Event {
                event_id,
                event_type,
                aggregate_kind,
                aggregate_id,
                payload: payload_value,
                correlation_id: opts.correlation_id,
                causation_id: opts.causation_id,
                source,
                timestamp,
                checksum,
            });
        }

        tx.commit()
            .await
            .map_err(|e| crate::dberror::classify("publish_batch_commit", e))?;

        for event in emitted {
            let _ = self.bus.send(event);
        }

        Ok(ids)
    }

    pub async fn get_aggregate_events(
        &self,
        kind: &str,
        id: &str,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Event>, ApiError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, event_type, aggregate_kind, aggregate_id, payload,
                   correlation_id, causation_id, source, ts, checksum
            FROM events
            WHERE aggregate_kind = $1 AND aggregate_id = $2
              AND ($3::timestamptz IS NULL OR ts > $3)
            ORDER BY ts ASC, event_id ASC
            LIMIT $4
            "#,
        )
        .bind(kind)
        .bind(id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("get_aggregate_events", e))?;

        Ok(rows.into_iter().map(row_to_event).collect())
    }

    pub async fn get_event_chain(&self, correlation_id: Uuid) -> Result<Vec<Event>, ApiError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, event_type, aggregate_kind, aggregate_id, payload,
                   correlation_id, causation_id, source, ts, checksum
            FROM events
            WHERE correlation_id = $1
            ORDER BY ts ASC, event_id ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("get_event_chain", e))?;

        Ok(rows.into_iter().map(row_to_event).collect())
    }

    pub async fn get_recent(&self, limit: i64) -> Result<Vec<Event>, ApiError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, event_type, aggregate_kind, aggregate_id, payload,
                   correlation_id, causation_id, source, ts, checksum
            FROM events
            ORDER BY ts DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("get_recent_events", e))?;

        Ok(rows.into_iter().map(row_to_event).collect())
    }

    pub async fn get_stats(&self, days: i64) -> Result<EventStats, ApiError> {
        let since = Utc::now() - ChronoDuration::days(days);
        let row = sqlx::query(
            r#"
            SELECT count(*) AS total, count(DISTINCT event_type) AS distinct_types
            FROM events
            WHERE ts > $1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("get_event_stats", e))?;

        Ok(EventStats {
            total: row.try_get::<i64, _>("total").unwrap_or(0),
            distinct_types: row.try_get::<i64, _>("distinct_types").unwrap_or(0),
            window_days: days,
        })
    }

    /// Create partitions `days_ahead` days out and drop partitions older
    /// than `retention_days`. Run on a periodic background tick.
    pub async fn maintain_partitions(
        &self,
        days_ahead: i64,
        retention_days: i64,
    ) -> Result<(), ApiError> {
        let today = Utc::now().date_naive();
        for offset in 0..=days_ahead {
            let day = today + ChronoDuration::days(offset);
            let next = day + ChronoDuration::days(1);
            let partition_name = format!("events_p{:04}{:02}{:02}", day.year(), day.month(), day.day());
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {partition_name} PARTITION OF events \
                 FOR VALUES FROM ('{day}') TO ('{next}')"
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| crate::dberror::classify("create_event_partition", e))?;
        }

        let cutoff = today - ChronoDuration::days(retention_days);
        let rows = sqlx::query(
            r#"
            SELECT relname FROM pg_catalog.pg_class
            WHERE relname LIKE 'events_p%' AND relispartition
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| crate::dberror::classify("list_event_partitions", e))?;

        for row in rows {
            let name: String = row.try_get("relname").unwrap_or_default();
            if let Some(date_part) = name.strip_prefix("events_p") {
                if date_part.len() == 8 {
                    if let Ok(year) = date_part[0..4].parse::<i32>() {
                        if let (Ok(month), Ok(day)) =
                            (date_part[4..6].parse::<u32>(), date_part[6..8].parse::<u32>())
                        {
                            if let Some(partition_date) =
                                chrono::NaiveDate::from_ymd_opt(year, month, day)
                            {
                                if partition_date < cutoff {
                                    let sql = format!("DROP TABLE IF EXISTS {name}");
                                    if let Err(e) = sqlx::query(&sql).execute(&self.pool).await {
                                        warn!(error = %e, partition = %name, "failed to drop old event partition");
                                    } else {
                                        info!(partition = %name, "dropped expired event partition");
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStats {
    pub total: i64,
    pub distinct_types: i64,
    pub window_days: i64,
}

fn row_to_event(row: sqlx::postgres::PgRow) -> Event {
    Event {
        event_id: row.try_get("event_id").unwrap_or_default(),
        event_type: row.try_get("event_type").unwrap_or_default(),
        aggregate_kind: row.try_get("aggregate_kind").unwrap_or_default(),
        aggregate_id: row.try_get("aggregate_id").unwrap_or_default(),
        payload: row.try_get("payload").unwrap_or(serde_json::Value::Null),
        correlation_id: row.try_get("correlation_id").ok(),
        causation_id: row.try_get("causation_id").ok(),
        source: row.try_get("source").unwrap_or_default(),
        timestamp: row.try_get("ts").unwrap_or_else(|_| Utc::now()),
        checksum: row.try_get("checksum").unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic_for_same_inputs() {
        let ts = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let payload = serde_json::json!({"b": 1, "a": 2});
        let c1 = compute_checksum("rollout.created", "rollout", "r-1", &payload, ts);
        let c2 = compute_checksum("rollout.created", "rollout", "r-1", &payload, ts);
        assert_eq!(c1, c2);
    }

    #[test]
    fn checksum_changes_with_payload() {
        let ts = Utc::now();
        let a = compute_checksum("e", "k", "1", &serde_json::json!({"x": 1}), ts);
        let b = compute_checksum("e", "k", "1", &serde_json::json!({"x": 2}), ts);
        assert_ne!(a, b);
    }

    #[test]
    fn checksum_is_insensitive_to_key_insertion_order() {
        // serde_json::Value without `preserve_order` stores maps as
        // BTreeMap, so construction order never leaks into the hash.
        let ts = Utc::now();
        let p1 = serde_json::json!({"a": 1, "b": 2});
        let p2: serde_json::Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        let c1 = compute_checksum("e", "k", "1", &p1, ts);
        let c2 = compute_checksum("e", "k", "1", &p2, ts);
        assert_eq!(c1, c2);
    }

    #[test]
    fn checksum_is_64_hex_chars() {
        let c = compute_checksum("e", "k", "1", &serde_json::json!({}), Utc::now());
        assert_eq!(c.len(), 64);
        assert!(c.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}

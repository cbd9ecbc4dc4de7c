//! Environment-driven configuration.
//!
//! All `FLEETD_*`
//! variables are parsed up front and every parse error is collected, so a
//! misconfigured deployment fails once at startup with the full list of
//! problems instead of dribbling out one error per variable touched.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub api_version: String,
    pub bind_addr: SocketAddr,
    pub heartbeat_enabled: bool,
    pub heartbeat_tick: Duration,
    pub offline_threshold: Duration,
    pub rollout_tick: Duration,
    pub job_sweep_interval: Duration,
    pub partition_maintenance_interval: Duration,
    pub webhook_secret: Option<String>,
    pub event_retention_days: i64,
    pub shutdown_drain: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, Vec<ConfigError>> {
        let mut errors = Vec::new();
        let mut parser = EnvParser::new(&mut errors);

        let database_url = parser.require_string("FLEETD_DATABASE_URL");
        let api_version = parser.string_or("FLEETD_API_VERSION", "v1");
        let bind_addr = parser.socket_addr_or("FLEETD_BIND_ADDR", "0.0.0.0:8080");
        let heartbeat_enabled = parser.bool_or("FLEETD_HEARTBEAT_ENABLED", true);
        let heartbeat_tick = parser.seconds_or("FLEETD_HEARTBEAT_TICK_SECONDS", 60);
        let offline_threshold = parser.seconds_or("FLEETD_OFFLINE_THRESHOLD_SECONDS", 300);
        let rollout_tick = parser.seconds_or("FLEETD_ROLLOUT_TICK_SECONDS", 30);
        let job_sweep_interval = parser.seconds_or("FLEETD_JOB_SWEEP_SECONDS", 30);
        let partition_maintenance_interval =
            parser.seconds_or("FLEETD_PARTITION_MAINTENANCE_SECONDS", 3600);
        let webhook_secret = parser.optional_string("FLEETD_WEBHOOK_SECRET");
        let event_retention_days = parser.i64_or("FLEETD_EVENT_RETENTION_DAYS", 90);
        let shutdown_drain = parser.seconds_or("FLEETD_SHUTDOWN_DRAIN_SECONDS", 20);

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self {
            database_url: database_url.expect("checked by errors.is_empty()"),
            api_version,
            bind_addr: bind_addr.expect("checked by errors.is_empty()"),
            heartbeat_enabled,
            heartbeat_tick,
            offline_threshold,
            rollout_tick,
            job_sweep_interval,
            partition_maintenance_interval,
            webhook_secret,
            event_retention_days,
            shutdown_drain,
        })
    }
}

/// Collects parse errors instead of failing on the first one.
struct EnvParser<'a> {
    errors: &'a mut Vec<ConfigError>,
}

impl<'a> EnvParser<'a> {
    fn new(errors: &'a mut Vec<ConfigError>) -> Self {
        Self { errors }
    }

    fn require_string(&mut self, var: &'static str) -> Option<String> {
        match env::var(var) {
            Ok(v) if !v.is_empty() => Some(v),
            _ => {
                self.errors.push(ConfigError::Missing(var));
                None
            }
        }
    }

    fn optional_string(&mut self, var: &'static str) -> Option<String> {
        env::var(var).ok().filter(|v| !v.is_empty())
    }

    fn string_or(&mut self, var: &'static str, default: &str) -> String {
        env::var(var).unwrap_or_else(|_| default.to_string())
    }

    fn bool_or(&mut self, var: &'static str, default: bool) -> bool {
        match env::var(var) {
            Err(_) => default,
            Ok(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    self.errors.push(ConfigError::InvalidValue {
                        var,
                        expected: "boolean",
                        value: v,
                    });
                    default
                }
            },
        }
    }

    fn i64_or(&mut self, var: &'static str, default: i64) -> i64 {
        match env::var(var) {
            Err(_) => default,
            Ok(v) => v.parse().unwrap_or_else(|_| {
                self.errors.push(ConfigError::InvalidValue {
                    var,
                    expected: "integer",
                    value: v,
                });
                default
            }),
        }
    }

    fn seconds_or(&mut self, var: &'static str, default_secs: u64) -> Duration {
        match env::var(var) {
            Err(_) => Duration::from_secs(default_secs),
            Ok(v) => match v.parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    self.errors.push(ConfigError::InvalidValue {
                        var,
                        expected: "integer seconds",
                        value: v,
                    });
                    Duration::from_secs(default_secs)
                }
            },
        }
    }

    fn socket_addr_or(&mut self, var: &'static str, default: &str) -> Option<SocketAddr> {
        let raw = env::var(var).unwrap_or_else(|_| default.to_string());
        match raw.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                self.errors.push(ConfigError::InvalidValue {
                    var,
                    expected: "host:port",
                    value: raw,
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    #[test]
    fn missing_database_url_is_reported() {
        let _guard = env_lock();
        unsafe {
            env::remove_var("FLEETD_DATABASE_URL");
        }
        let result = Config::from_env();
        assert!(result.is_err());
        let errors = result.unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigError::Missing("FLEETD_DATABASE_URL"))));
    }

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        let _guard = env_lock();
        unsafe {
            env::set_var("FLEETD_DATABASE_URL", "postgres://localhost/fleet");
            env::remove_var("FLEETD_API_VERSION");
            env::remove_var("FLEETD_HEARTBEAT_TICK_SECONDS");
        }
        let cfg = Config::from_env().expect("should parse with defaults");
        assert_eq!(cfg.api_version, "v1");
        assert_eq!(cfg.heartbeat_tick, Duration::from_secs(60));
        assert_eq!(cfg.offline_threshold, Duration::from_secs(300));
        unsafe {
            env::remove_var("FLEETD_DATABASE_URL");
        }
    }

    #[test]
    fn invalid_bool_is_collected_not_fatal_immediately() {
        let _guard = env_lock();
        unsafe {
            env::set_var("FLEETD_DATABASE_URL", "postgres://localhost/fleet");
            env::set_var("FLEETD_HEARTBEAT_ENABLED", "maybe");
        }
        let result = Config::from_env();
        assert!(result.is_err());
        let errors = result.unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigError::InvalidValue {
                var: "FLEETD_HEARTBEAT_ENABLED",
                ..
            }
        )));
        unsafe {
            env::remove_var("FLEETD_DATABASE_URL");
            env::remove_var("FLEETD_HEARTBEAT_ENABLED");
        }
    }
}

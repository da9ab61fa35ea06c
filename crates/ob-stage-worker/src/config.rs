//! Worker configuration.
//!
//! Read from `OB_STAGE_*` environment variables (after `.env` is loaded).
//! Unset variables fall back to defaults; set but unparseable values are an
//! error rather than a silent default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use ob_stage_core::{ExecutorConfig, SuccessPolicy};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Postgres connection string; required by every database command
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub success_policy: SuccessPolicy,
    pub events: EventConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            success_policy: SuccessPolicy::default(),
            events: EventConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let success_policy = match get("OB_STAGE_SUCCESS_POLICY") {
            Some(v) => v
                .parse()
                .map_err(|e: String| anyhow!(e))
                .context("OB_STAGE_SUCCESS_POLICY")?,
            None => defaults.success_policy,
        };

        let drain = DrainConfig {
            batch_size: positive_or(
                get("OB_STAGE_DRAIN_BATCH"),
                "OB_STAGE_DRAIN_BATCH",
                defaults.events.drain.batch_size,
            )?,
            flush_interval_ms: positive_or(
                get("OB_STAGE_DRAIN_FLUSH_MS"),
                "OB_STAGE_DRAIN_FLUSH_MS",
                defaults.events.drain.flush_interval_ms,
            )?,
        };

        let events = EventConfig {
            enabled: parse_bool_or(
                get("OB_STAGE_EVENTS_ENABLED"),
                "OB_STAGE_EVENTS_ENABLED",
                defaults.events.enabled,
            )?,
            buffer_size: positive_or(
                get("OB_STAGE_EVENT_BUFFER"),
                "OB_STAGE_EVENT_BUFFER",
                defaults.events.buffer_size,
            )?,
            path: get("OB_STAGE_EVENTS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.events.path),
            drain,
        };

        Ok(Self {
            database_url: get("OB_STAGE_DATABASE_URL"),
            max_connections: parse_or(
                get("OB_STAGE_DB_MAX_CONNECTIONS"),
                "OB_STAGE_DB_MAX_CONNECTIONS",
                defaults.max_connections,
            )?,
            success_policy,
            events,
        })
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("OB_STAGE_DATABASE_URL must be set (or pass --database-url)"))
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            success_policy: self.success_policy,
        }
    }
}

/// Audit event settings.
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub enabled: bool,

    /// Channel capacity. Events beyond it are dropped and counted.
    pub buffer_size: usize,

    /// JSONL audit log
    pub path: PathBuf,

    pub drain: DrainConfig,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_size: 4096,
            path: PathBuf::from("data/stage_events.jsonl"),
            drain: DrainConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Maximum events written per drain cycle
    pub batch_size: usize,

    pub flush_interval_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 1000,
        }
    }
}

impl DrainConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(v) => v.parse().map_err(|e| anyhow!("{}={:?}: {}", key, v, e)),
        None => Ok(default),
    }
}

/// Like `parse_or`, but zero is rejected.
fn positive_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr + PartialEq + From<u8>,
    T::Err: std::fmt::Display,
{
    let parsed = parse_or(value, key, default)?;
    if parsed == T::from(0) {
        return Err(anyhow!("{} must be greater than zero", key));
    }
    Ok(parsed)
}

fn parse_bool_or(value: Option<String>, key: &str, default: bool) -> Result<bool> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(anyhow!("{}: expected a boolean, got {:?}", key, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.success_policy, SuccessPolicy::AnySucceeded);
        assert!(config.events.enabled);
        assert_eq!(config.events.buffer_size, 4096);
        assert_eq!(config.events.path, PathBuf::from("data/stage_events.jsonl"));
        assert_eq!(config.events.drain.batch_size, 100);
        assert_eq!(config.events.drain.flush_interval(), Duration::from_secs(1));
        assert!(config.database_url().is_err());
    }

    #[test]
    fn test_overrides() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("OB_STAGE_DATABASE_URL", "postgresql:///onboarding"),
            ("OB_STAGE_DB_MAX_CONNECTIONS", "12"),
            ("OB_STAGE_SUCCESS_POLICY", "all"),
            ("OB_STAGE_EVENTS_ENABLED", "off"),
            ("OB_STAGE_EVENTS_PATH", "/tmp/audit.jsonl"),
            ("OB_STAGE_DRAIN_FLUSH_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.database_url().unwrap(), "postgresql:///onboarding");
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.executor().success_policy, SuccessPolicy::AllSucceeded);
        assert!(!config.events.enabled);
        assert_eq!(config.events.path, PathBuf::from("/tmp/audit.jsonl"));
        assert_eq!(config.events.drain.flush_interval_ms, 250);
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[("OB_STAGE_EVENT_BUFFER", "  ")])).unwrap();
        assert_eq!(config.events.buffer_size, 4096);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        for (key, value) in [
            ("OB_STAGE_DRAIN_BATCH", "lots"),
            ("OB_STAGE_EVENTS_ENABLED", "maybe"),
            ("OB_STAGE_SUCCESS_POLICY", "most"),
        ] {
            assert!(WorkerConfig::from_lookup(lookup(&[(key, value)])).is_err(), "{}", key);
        }
    }

    #[test]
    fn test_zero_sizes_and_intervals_are_errors() {
        for key in ["OB_STAGE_DRAIN_FLUSH_MS", "OB_STAGE_EVENT_BUFFER", "OB_STAGE_DRAIN_BATCH"] {
            let err = WorkerConfig::from_lookup(lookup(&[(key, "0")])).unwrap_err();
            assert!(err.to_string().contains(key), "{}: {}", key, err);
        }

        let config =
            WorkerConfig::from_lookup(lookup(&[("OB_STAGE_DRAIN_FLUSH_MS", "1")])).unwrap();
        assert_eq!(config.events.drain.flush_interval(), Duration::from_millis(1));
    }
}

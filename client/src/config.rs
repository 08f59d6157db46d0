//! Configuration management for the sync client.

use std::env;
use std::time::Duration;

use tether_engine::{RetryPolicy, UserId};

use crate::queue::QueueConfig;
use crate::transport::DeviceIdentity;

/// Sync cycle settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Interval between automatic sync cycles
    pub sync_interval: Duration,
    /// Deadline for one `POST /api/sync` round trip
    pub sync_timeout: Duration,
    /// Deadline for the reachability probe
    pub health_timeout: Duration,
    /// Upper bound on round trips within one cycle
    pub max_rounds_per_cycle: u32,
    /// Number of conflict records kept in memory
    pub conflict_history: usize,
    /// User to sync when a cycle is not scoped to one and nothing is queued
    pub default_user_id: Option<UserId>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            max_rounds_per_cycle: 10,
            conflict_history: 100,
            default_user_id: None,
        }
    }
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Device identity and hub location
    pub identity: DeviceIdentity,
    /// SQLite connection URL
    pub database_url: String,
    pub sync: SyncConfig,
    pub queue: QueueConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let hub_url = lookup("TETHER_HUB_URL").ok_or(ConfigError::Missing("TETHER_HUB_URL"))?;
        let device_id =
            lookup("TETHER_DEVICE_ID").ok_or(ConfigError::Missing("TETHER_DEVICE_ID"))?;
        let auth_token = lookup("TETHER_AUTH_TOKEN").filter(|t| !t.is_empty());

        let database_url = lookup("TETHER_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://tether.db?mode=rwc".to_string());

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            sync_interval: secs(&lookup, "TETHER_SYNC_INTERVAL_SECS", defaults.sync_interval)?,
            sync_timeout: secs(&lookup, "TETHER_SYNC_TIMEOUT_SECS", defaults.sync_timeout)?,
            health_timeout: secs(&lookup, "TETHER_HEALTH_TIMEOUT_SECS", defaults.health_timeout)?,
            default_user_id: lookup("TETHER_USER_ID").filter(|u| !u.is_empty()),
            ..defaults
        };

        let queue_defaults = QueueConfig::default();
        let retry = RetryPolicy {
            max_retries: parse(&lookup, "TETHER_MAX_RETRIES")?
                .unwrap_or(queue_defaults.retry.max_retries),
            retry_delays_ms: match lookup("TETHER_RETRY_DELAYS_MS") {
                Some(list) => parse_delays(&list)?,
                None => queue_defaults.retry.retry_delays_ms.clone(),
            },
        };
        let queue = QueueConfig {
            batch_window: parse(&lookup, "TETHER_BATCH_WINDOW_MS")?
                .map(Duration::from_millis)
                .unwrap_or(queue_defaults.batch_window),
            batch_size: parse(&lookup, "TETHER_BATCH_SIZE")?.unwrap_or(queue_defaults.batch_size),
            max_per_request: parse(&lookup, "TETHER_MAX_PER_REQUEST")?
                .unwrap_or(queue_defaults.max_per_request),
            retry,
        };

        Ok(Self {
            identity: DeviceIdentity {
                device_id,
                hub_url,
                auth_token,
            },
            database_url,
            sync,
            queue,
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|raw| raw.trim().parse().map_err(|_| ConfigError::Invalid(key)))
        .transpose()
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    Ok(parse(lookup, key)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}

fn parse_delays(list: &str) -> Result<Vec<u64>, ConfigError> {
    let delays = list
        .split(',')
        .map(|part| part.trim().parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ConfigError::Invalid("TETHER_RETRY_DELAYS_MS"))?;
    if delays.is_empty() {
        return Err(ConfigError::Invalid("TETHER_RETRY_DELAYS_MS"));
    }
    Ok(delays)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("Invalid {0} value")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("TETHER_HUB_URL", "http://hub.local"),
            ("TETHER_DEVICE_ID", "device-1"),
        ]))
        .unwrap();

        assert_eq!(config.identity.hub_url, "http://hub.local");
        assert_eq!(config.identity.auth_token, None);
        assert_eq!(config.database_url, "sqlite://tether.db?mode=rwc");
        assert_eq!(config.sync.sync_timeout, Duration::from_secs(30));
        assert_eq!(config.sync.health_timeout, Duration::from_secs(5));
        assert_eq!(config.queue.batch_window, Duration::from_millis(2000));
        assert_eq!(config.queue.retry, RetryPolicy::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("TETHER_HUB_URL", "http://hub.local"),
            ("TETHER_DEVICE_ID", "device-1"),
            ("TETHER_AUTH_TOKEN", "secret"),
            ("TETHER_USER_ID", "user-9"),
            ("TETHER_BATCH_WINDOW_MS", "250"),
            ("TETHER_MAX_RETRIES", "3"),
            ("TETHER_RETRY_DELAYS_MS", "10, 20,30"),
            ("TETHER_SYNC_INTERVAL_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.identity.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.sync.default_user_id.as_deref(), Some("user-9"));
        assert_eq!(config.sync.sync_interval, Duration::from_secs(5));
        assert_eq!(config.queue.batch_window, Duration::from_millis(250));
        assert_eq!(config.queue.retry.max_retries, 3);
        assert_eq!(config.queue.retry.retry_delays_ms, vec![10, 20, 30]);
    }

    #[test]
    fn missing_and_invalid_values() {
        let err = Config::from_lookup(lookup(&[("TETHER_DEVICE_ID", "d")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TETHER_HUB_URL")));

        let err = Config::from_lookup(lookup(&[
            ("TETHER_HUB_URL", "http://hub.local"),
            ("TETHER_DEVICE_ID", "d"),
            ("TETHER_BATCH_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid TETHER_BATCH_SIZE value");

        let err = Config::from_lookup(lookup(&[
            ("TETHER_HUB_URL", "http://hub.local"),
            ("TETHER_DEVICE_ID", "d"),
            ("TETHER_RETRY_DELAYS_MS", "1,,2"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TETHER_RETRY_DELAYS_MS")));
    }
}

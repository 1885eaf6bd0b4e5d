use std::time::Duration;

use rookwatch_client::{ClientConfig, ReconnectConfig, RetryPolicy};

/// Default interval between poll passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// A configuration variable held a value that could not be used.
#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Engine configuration loaded from environment variables.
///
/// All fields have defaults suitable for a backend on localhost.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backend connection, timeouts and retry policy.
    pub client: ClientConfig,
    /// Interval between poll passes (default: 2s).
    pub poll_interval: Duration,
    /// Whether active jobs are watched over the push channel (default: `true`).
    pub stream_enabled: bool,
    /// Backoff for re-opening a dropped push channel.
    pub reconnect: ReconnectConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::new("http://localhost:8000"),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stream_enabled: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from the process environment (after `.env`).
    ///
    /// | Env Var                          | Default                 |
    /// |----------------------------------|-------------------------|
    /// | `ROOKWATCH_API_URL`              | `http://localhost:8000` |
    /// | `ROOKWATCH_POLL_INTERVAL_MS`     | `2000`                  |
    /// | `ROOKWATCH_READ_TIMEOUT_SECS`    | `10`                    |
    /// | `ROOKWATCH_COMMAND_TIMEOUT_SECS` | `30`                    |
    /// | `ROOKWATCH_RETRY_BASE_DELAY_MS`  | `500`                   |
    /// | `ROOKWATCH_RETRY_MAX_ATTEMPTS`   | `3`                     |
    /// | `ROOKWATCH_STREAM_ENABLED`       | `true`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let base_url = lookup("ROOKWATCH_API_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.client.base_url);
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError {
                var: "ROOKWATCH_API_URL",
                value: base_url,
                reason: "must start with http:// or https://".into(),
            });
        }

        let poll_interval_ms = parse_var(&lookup, "ROOKWATCH_POLL_INTERVAL_MS", 2000u64)?;
        if poll_interval_ms == 0 {
            return Err(ConfigError {
                var: "ROOKWATCH_POLL_INTERVAL_MS",
                value: "0".into(),
                reason: "must be greater than zero".into(),
            });
        }

        let read_timeout_secs = parse_var(&lookup, "ROOKWATCH_READ_TIMEOUT_SECS", 10u64)?;
        let command_timeout_secs = parse_var(&lookup, "ROOKWATCH_COMMAND_TIMEOUT_SECS", 30u64)?;
        let base_delay_ms = parse_var(&lookup, "ROOKWATCH_RETRY_BASE_DELAY_MS", 500u64)?;
        let max_attempts = parse_var(&lookup, "ROOKWATCH_RETRY_MAX_ATTEMPTS", 3u32)?;
        let stream_enabled = parse_var(&lookup, "ROOKWATCH_STREAM_ENABLED", true)?;

        Ok(Self {
            client: ClientConfig {
                base_url,
                read_timeout: Duration::from_secs(read_timeout_secs),
                command_timeout: Duration::from_secs(command_timeout_secs),
                retry: RetryPolicy {
                    base_delay: Duration::from_millis(base_delay_ms),
                    max_attempts,
                    ..defaults.client.retry
                },
            },
            poll_interval: Duration::from_millis(poll_interval_ms),
            stream_enabled,
            reconnect: defaults.reconnect,
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

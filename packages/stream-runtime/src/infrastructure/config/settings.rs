//! Runtime Configuration Settings
//!
//! Settings for the connection runtime, loaded from environment variables.
//! Every knob has a default; `from_env` only fails on values that are
//! present but unparseable.

use std::time::Duration;

use crate::application::retry::RetryConfig;
use crate::infrastructure::connection::reconnect::ElapsedClamp;
use crate::infrastructure::heartbeat::HeartbeatConfig;
use crate::infrastructure::wake::WakeConfig;

// =============================================================================
// Errors
// =============================================================================

/// Configuration loading failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable was set to an unparseable value.
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: String,
        /// The offending value.
        value: String,
    },
}

// =============================================================================
// Settings
// =============================================================================

/// Hedged retry settings for dialing.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Constant term of the round budget.
    pub delay_offset: Duration,
    /// Linear term of the round budget.
    pub delay_multiple: Duration,
    /// Quadratic term of the round budget.
    pub delay_square: Duration,
    /// Cap on any single round budget.
    pub max_delay: Duration,
    /// Maximum attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            delay_offset: Duration::from_millis(100),
            delay_multiple: Duration::from_millis(100),
            delay_square: Duration::ZERO,
            max_delay: Duration::from_secs(120),
            max_attempts: 0, // Unlimited
        }
    }
}

impl RetrySettings {
    /// Build the retry combinator configuration.
    #[must_use]
    pub const fn to_config(&self) -> RetryConfig {
        RetryConfig {
            delay_offset: self.delay_offset,
            delay_multiple: self.delay_multiple,
            delay_square: self.delay_square,
            max_delay: self.max_delay,
            max_attempts: if self.max_attempts == 0 {
                None
            } else {
                Some(self.max_attempts)
            },
            retry_on_error: true,
        }
    }
}

/// Reconnect pacing settings.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Smallest pause between reopen attempts.
    pub min_delay: Duration,
    /// Largest pause between reopen attempts.
    pub max_delay: Duration,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectSettings {
    /// Build the default reconnect schedule.
    #[must_use]
    pub const fn to_schedule(&self) -> ElapsedClamp {
        ElapsedClamp {
            min: self.min_delay,
            max: self.max_delay,
        }
    }
}

/// Heartbeat monitoring settings.
#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    /// Interval between probes.
    pub probe_interval: Duration,
    /// Unanswered-probe deadline.
    pub stale_after: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(20),
            stale_after: Duration::from_secs(20),
        }
    }
}

impl HeartbeatSettings {
    /// Build the heartbeat monitor configuration.
    #[must_use]
    pub const fn to_config(&self) -> HeartbeatConfig {
        HeartbeatConfig::new(self.probe_interval, self.stale_after)
    }
}

/// Wake detection settings.
#[derive(Debug, Clone)]
pub struct WakeSettings {
    /// Wall-clock sampling interval.
    pub poll_interval: Duration,
}

impl Default for WakeSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl WakeSettings {
    /// Build the wake detector configuration.
    #[must_use]
    pub const fn to_config(&self) -> WakeConfig {
        WakeConfig {
            poll_interval: self.poll_interval,
            gap_factor: 2,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Dial retry settings.
    pub retry: RetrySettings,
    /// Reconnect pacing settings.
    pub reconnect: ReconnectSettings,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatSettings,
    /// Wake detection settings.
    pub wake: WakeSettings,
}

impl RuntimeConfig {
    /// Create configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when a variable is set but
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let retry_defaults = RetrySettings::default();
        let retry = RetrySettings {
            delay_offset: parse_env_duration_millis(
                "STREAM_RETRY_DELAY_OFFSET_MS",
                retry_defaults.delay_offset,
            )?,
            delay_multiple: parse_env_duration_millis(
                "STREAM_RETRY_DELAY_MULTIPLE_MS",
                retry_defaults.delay_multiple,
            )?,
            delay_square: parse_env_duration_millis(
                "STREAM_RETRY_DELAY_SQUARE_MS",
                retry_defaults.delay_square,
            )?,
            max_delay: parse_env_duration_millis(
                "STREAM_RETRY_MAX_DELAY_MS",
                retry_defaults.max_delay,
            )?,
            max_attempts: parse_env_u32("STREAM_RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
        };

        let reconnect_defaults = ReconnectSettings::default();
        let reconnect = ReconnectSettings {
            min_delay: parse_env_duration_millis(
                "STREAM_RECONNECT_MIN_DELAY_MS",
                reconnect_defaults.min_delay,
            )?,
            max_delay: parse_env_duration_millis(
                "STREAM_RECONNECT_MAX_DELAY_MS",
                reconnect_defaults.max_delay,
            )?,
        };

        let heartbeat_defaults = HeartbeatSettings::default();
        let heartbeat = HeartbeatSettings {
            probe_interval: parse_env_duration_secs(
                "STREAM_HEARTBEAT_INTERVAL_SECS",
                heartbeat_defaults.probe_interval,
            )?,
            stale_after: parse_env_duration_secs(
                "STREAM_HEARTBEAT_TIMEOUT_SECS",
                heartbeat_defaults.stale_after,
            )?,
        };

        let wake_defaults = WakeSettings::default();
        let wake = WakeSettings {
            poll_interval: parse_env_duration_secs(
                "STREAM_WAKE_POLL_INTERVAL_SECS",
                wake_defaults.poll_interval,
            )?,
        };

        Ok(Self {
            retry,
            reconnect,
            heartbeat,
            wake,
        })
    }
}

// =============================================================================
// Parsing helpers
// =============================================================================

fn parse_u64(var: &str, raw: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match raw {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_owned(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_u32(var: &str, raw: Option<String>, default: u32) -> Result<u32, ConfigError> {
    match raw {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_owned(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_env_u64(var: &str, default: u64) -> Result<u64, ConfigError> {
    parse_u64(var, std::env::var(var).ok(), default)
}

fn parse_env_u32(var: &str, default: u32) -> Result<u32, ConfigError> {
    parse_u32(var, std::env::var(var).ok(), default)
}

fn parse_env_duration_millis(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_env_u64(var, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))
        .map(Duration::from_millis)
}

fn parse_env_duration_secs(var: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_env_u64(var, default.as_secs()).map(Duration::from_secs)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.retry.delay_offset, Duration::from_millis(100));
        assert_eq!(config.retry.delay_multiple, Duration::from_millis(100));
        assert_eq!(config.retry.delay_square, Duration::ZERO);
        assert_eq!(config.retry.max_delay, Duration::from_secs(120));
        assert_eq!(config.retry.max_attempts, 0);
        assert_eq!(config.reconnect.min_delay, Duration::from_millis(100));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(10));
        assert_eq!(config.wake.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn zero_max_attempts_means_unbounded() {
        let settings = RetrySettings::default();
        assert!(settings.to_config().max_attempts.is_none());

        let bounded = RetrySettings {
            max_attempts: 5,
            ..RetrySettings::default()
        };
        assert_eq!(bounded.to_config().max_attempts, Some(5));
    }

    #[test]
    fn reconnect_settings_produce_clamp_schedule() {
        let settings = ReconnectSettings {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        };
        let schedule = settings.to_schedule();
        assert_eq!(schedule.min, Duration::from_millis(50));
        assert_eq!(schedule.max, Duration::from_secs(5));
    }

    #[test]
    fn invalid_value_is_rejected() {
        let result = parse_u64(
            "STREAM_RETRY_DELAY_OFFSET_MS",
            Some("not-a-number".to_owned()),
            7,
        );
        match result {
            Err(ConfigError::InvalidValue { var, value }) => {
                assert_eq!(var, "STREAM_RETRY_DELAY_OFFSET_MS");
                assert_eq!(value, "not-a-number");
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn missing_value_falls_back_to_default() {
        let result = parse_u64("STREAM_RETRY_MAX_DELAY_MS", None, 42);
        assert_eq!(result.unwrap(), 42);

        let result = parse_u32("STREAM_RETRY_MAX_ATTEMPTS", None, 3);
        assert_eq!(result.unwrap(), 3);
    }
}

// ⚙️ Configuration - validated pipeline settings
//
// Raw values come from the command line / environment (see main.rs) and are
// checked once at startup. Anything invalid is a ConfigError and the run
// never starts.

use chrono::FixedOffset;
use secrecy::SecretString;
use std::time::Duration;
use thiserror::Error;

use crate::client::{RetryPolicy, Timeouts};
use crate::temporal::reference_offset;

pub const DEFAULT_BASE_URL: &str = "https://api.psacard.com/publicapi";
pub const DEFAULT_DAILY_CAP: u32 = 80;
pub const DEFAULT_MAX_AGE_SECONDS: i64 = 30 * 24 * 3600;
pub const MAX_RETRY_COUNT: u32 = 10;
pub const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("daily cap must be at least 1 (got {0})")]
    InvalidDailyCap(i64),

    #[error("max age must not be negative (got {0} seconds)")]
    NegativeMaxAge(i64),

    #[error("{name} must be a positive, finite number of seconds (got {value})")]
    InvalidDuration { name: &'static str, value: f64 },

    #[error("retry count must be between 0 and {max} (got {value})")]
    InvalidRetryCount { value: i64, max: u32 },

    #[error("reference UTC offset {0} minutes is outside ±18h")]
    InvalidUtcOffset(i32),

    #[error("authority base URL is empty")]
    MissingBaseUrl,

    #[error("no credential configured (set PSA_TOKEN)")]
    MissingCredential,
}

/// Settings as supplied, before validation
#[derive(Debug, Clone)]
pub struct RawConfig {
    pub daily_cap: i64,
    pub max_age_seconds: i64,
    pub sleep_between_calls_ms: i64,
    pub connect_timeout_secs: f64,
    pub read_timeout_secs: f64,
    pub retry_count: i64,
    pub retry_backoff_ms: i64,
    pub utc_offset_minutes: i32,
    pub base_url: String,
    pub credential: Option<String>,
}

impl Default for RawConfig {
    fn default() -> Self {
        RawConfig {
            daily_cap: DEFAULT_DAILY_CAP as i64,
            max_age_seconds: DEFAULT_MAX_AGE_SECONDS,
            sleep_between_calls_ms: 250,
            connect_timeout_secs: 10.0,
            read_timeout_secs: 25.0,
            retry_count: 3,
            retry_backoff_ms: 800,
            utc_offset_minutes: 0,
            base_url: DEFAULT_BASE_URL.to_string(),
            credential: None,
        }
    }
}

/// Validated settings for one pipeline run
#[derive(Debug)]
pub struct PipelineConfig {
    pub daily_cap: u32,
    pub max_age_seconds: i64,
    pub sleep_between_calls: Duration,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub reference_offset: FixedOffset,
    pub base_url: String,
    pub credential: Option<SecretString>,
}

fn positive_secs(name: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidDuration { name, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { name, value })
}

fn non_negative_millis(name: &'static str, value: i64) -> Result<Duration, ConfigError> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| ConfigError::InvalidDuration {
            name,
            value: value as f64 / 1000.0,
        })
}

/// Reference zone for the quota day, at most ±18h from UTC
pub fn utc_offset(minutes_east: i32) -> Result<FixedOffset, ConfigError> {
    if !(-MAX_UTC_OFFSET_MINUTES..=MAX_UTC_OFFSET_MINUTES).contains(&minutes_east) {
        return Err(ConfigError::InvalidUtcOffset(minutes_east));
    }
    reference_offset(minutes_east).ok_or(ConfigError::InvalidUtcOffset(minutes_east))
}

impl RawConfig {
    /// Check every value; the first problem wins
    pub fn validate(self) -> Result<PipelineConfig, ConfigError> {
        let daily_cap = u32::try_from(self.daily_cap)
            .ok()
            .filter(|cap| *cap >= 1)
            .ok_or(ConfigError::InvalidDailyCap(self.daily_cap))?;

        if self.max_age_seconds < 0 {
            return Err(ConfigError::NegativeMaxAge(self.max_age_seconds));
        }

        let sleep_between_calls =
            non_negative_millis("sleep between calls", self.sleep_between_calls_ms)?;
        let connect = positive_secs("connect timeout", self.connect_timeout_secs)?;
        let read = positive_secs("read timeout", self.read_timeout_secs)?;
        let retry_backoff = non_negative_millis("retry backoff", self.retry_backoff_ms)?;

        let retry_count = u32::try_from(self.retry_count)
            .ok()
            .filter(|n| *n <= MAX_RETRY_COUNT)
            .ok_or(ConfigError::InvalidRetryCount {
                value: self.retry_count,
                max: MAX_RETRY_COUNT,
            })?;

        let reference_offset = utc_offset(self.utc_offset_minutes)?;

        let base_url = self.base_url.trim().to_string();
        if base_url.is_empty() {
            return Err(ConfigError::MissingBaseUrl);
        }

        let credential = self
            .credential
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .map(SecretString::new);

        Ok(PipelineConfig {
            daily_cap,
            max_age_seconds: self.max_age_seconds,
            sleep_between_calls,
            timeouts: Timeouts { connect, read },
            retry: RetryPolicy::new(retry_count, retry_backoff),
            reference_offset,
            base_url,
            credential,
        })
    }
}

impl PipelineConfig {
    /// Hand the credential to the authority client; required before any validation call
    pub fn take_credential(&mut self) -> Result<SecretString, ConfigError> {
        self.credential.take().ok_or(ConfigError::MissingCredential)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_defaults_are_valid() {
        let mut config = RawConfig::default().validate().unwrap();

        assert_eq!(config.daily_cap, 80);
        assert_eq!(config.timeouts.connect, Duration::from_secs(10));
        assert_eq!(config.timeouts.read, Duration::from_secs(25));
        assert_eq!(config.retry.max_attempts(), 4);
        assert_eq!(config.sleep_between_calls, Duration::from_millis(250));
        assert_eq!(config.take_credential().unwrap_err(), ConfigError::MissingCredential);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases: Vec<(RawConfig, ConfigError)> = vec![
            (
                RawConfig { daily_cap: 0, ..Default::default() },
                ConfigError::InvalidDailyCap(0),
            ),
            (
                RawConfig { daily_cap: -5, ..Default::default() },
                ConfigError::InvalidDailyCap(-5),
            ),
            (
                RawConfig { max_age_seconds: -1, ..Default::default() },
                ConfigError::NegativeMaxAge(-1),
            ),
            (
                RawConfig { connect_timeout_secs: 0.0, ..Default::default() },
                ConfigError::InvalidDuration { name: "connect timeout", value: 0.0 },
            ),
            (
                RawConfig { read_timeout_secs: -2.5, ..Default::default() },
                ConfigError::InvalidDuration { name: "read timeout", value: -2.5 },
            ),
            (
                RawConfig { retry_count: 11, ..Default::default() },
                ConfigError::InvalidRetryCount { value: 11, max: MAX_RETRY_COUNT },
            ),
            (
                RawConfig { utc_offset_minutes: 19 * 60, ..Default::default() },
                ConfigError::InvalidUtcOffset(19 * 60),
            ),
            (
                RawConfig { utc_offset_minutes: i32::MIN, ..Default::default() },
                ConfigError::InvalidUtcOffset(i32::MIN),
            ),
            (
                RawConfig { utc_offset_minutes: i32::MAX, ..Default::default() },
                ConfigError::InvalidUtcOffset(i32::MAX),
            ),
            (
                RawConfig { base_url: "  ".to_string(), ..Default::default() },
                ConfigError::MissingBaseUrl,
            ),
        ];

        for (raw, expected) in cases {
            assert_eq!(raw.validate().unwrap_err(), expected);
        }
    }

    #[test]
    fn test_credential_is_trimmed_and_taken_once() {
        let mut config = RawConfig {
            credential: Some(" abc123 \n".to_string()),
            ..Default::default()
        }
        .validate()
        .unwrap();

        let token = config.take_credential().unwrap();
        assert_eq!(token.expose_secret(), "abc123");
        assert_eq!(config.take_credential().unwrap_err(), ConfigError::MissingCredential);
    }

    #[test]
    fn test_utc_offset_bounds() {
        assert_eq!(utc_offset(18 * 60).unwrap().local_minus_utc(), 18 * 3600);
        assert_eq!(utc_offset(-18 * 60).unwrap().local_minus_utc(), -18 * 3600);
        assert_eq!(utc_offset(23 * 60), Err(ConfigError::InvalidUtcOffset(23 * 60)));
        assert_eq!(utc_offset(i32::MIN), Err(ConfigError::InvalidUtcOffset(i32::MIN)));
    }

    #[test]
    fn test_zero_max_age_and_blank_token() {
        let config = RawConfig {
            max_age_seconds: 0,
            credential: Some("   ".to_string()),
            ..Default::default()
        }
        .validate()
        .unwrap();

        assert_eq!(config.max_age_seconds, 0);
        assert!(config.credential.is_none());
    }
}

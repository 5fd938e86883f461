//! Environment configuration for the HTTP adapter.
//!
//! # Invariants
//! - Numeric settings outside their accepted range fall back to defaults.
//! - An unparsable bind address is an error, never silently replaced.

use identity_core::{default_log_level, DEFAULT_MAX_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_BIND: &str = "IDENTITY_HTTP_BIND";
pub const ENV_PORT: &str = "PORT";
pub const ENV_DB_PATH: &str = "IDENTITY_DB_PATH";
pub const ENV_LOG_LEVEL: &str = "IDENTITY_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "IDENTITY_LOG_DIR";
pub const ENV_MAX_ATTEMPTS: &str = "IDENTITY_MAX_ATTEMPTS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "IDENTITY_REQUEST_TIMEOUT_MS";
pub const ENV_BUSY_TIMEOUT_MS: &str = "IDENTITY_BUSY_TIMEOUT_MS";

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_PATH: &str = "identity.sqlite3";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug)]
pub enum ConfigError {
    InvalidBind { value: String, reason: String },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBind { value, reason } => {
                write!(f, "invalid {ENV_BIND} `{value}`: {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

/// Process configuration for the identity HTTP service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub log_level: String,
    /// Logging stays disabled when unset.
    pub log_dir: Option<String>,
    pub max_attempts: u32,
    pub request_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`, which returns the raw value of one key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind = match read(ENV_BIND) {
            Some(value) => value
                .parse::<SocketAddr>()
                .map_err(|err| ConfigError::InvalidBind {
                    value: value.clone(),
                    reason: err.to_string(),
                })?,
            None => {
                let port = read(ENV_PORT)
                    .and_then(|value| value.parse::<u16>().ok())
                    .unwrap_or(DEFAULT_PORT);
                SocketAddr::from(([0, 0, 0, 0], port))
            }
        };

        Ok(Self {
            bind,
            db_path: read(ENV_DB_PATH)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            log_level: read(ENV_LOG_LEVEL).unwrap_or_else(|| default_log_level().to_string()),
            log_dir: read(ENV_LOG_DIR),
            max_attempts: parse_in_range(read(ENV_MAX_ATTEMPTS), 1..=10)
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            request_timeout: parse_in_range(read(ENV_REQUEST_TIMEOUT_MS), 100..=120_000)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            busy_timeout: Duration::from_millis(
                parse_in_range(read(ENV_BUSY_TIMEOUT_MS), 0..=60_000)
                    .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
            ),
        })
    }
}

fn parse_in_range<T>(value: Option<String>, range: std::ops::RangeInclusive<T>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    value
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| range.contains(value))
}

//! Engine configuration.
//!
//! All settings have defaults and can be overridden through environment
//! variables:
//!
//! | Variable                      | Default        |
//! |-------------------------------|----------------|
//! | `WORK_ITEM_REPLICA_NAME`      | `local`        |
//! | `WORK_ITEM_MAX_PARALLEL`      | `-1`           |
//! | `WORK_ITEM_WORKERS`           | `4`            |
//! | `WORK_ITEM_MUTEX_TTL_SECS`    | `60`           |
//! | `WORK_ITEM_STATE_SYNC_SECS`   | `5`            |
//! | `WORK_ITEM_RECEIVE_WAIT_SECS` | `5`            |
//! | `WORK_ITEM_BIND_ADDR`         | `0.0.0.0:3000` |
//!
//! A variable that is set but cannot be parsed is an error rather than a
//! silent fallback to the default. Durations must lie in `1..=MAX_SECS`.
//! A negative `WORK_ITEM_MAX_PARALLEL` means unbounded.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::scope::ConcurrencyLimit;
use crate::types::ReplicaId;

const DEFAULT_REPLICA_NAME: &str = "local";
const DEFAULT_WORKERS: usize = 4;
const DEFAULT_MUTEX_TTL_SECS: u64 = 60;
const DEFAULT_STATE_SYNC_SECS: u64 = 5;
const DEFAULT_RECEIVE_WAIT_SECS: u64 = 5;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 3000);

/// Upper bound for every `*_SECS` setting (one day).
pub const MAX_SECS: u64 = 24 * 60 * 60;

/// Errors from reading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The variable is set to something that does not parse.
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for the engine and its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Identity of this replica; suffix of its state key.
    pub replica: ReplicaId,

    /// Concurrency ceiling for open scopes.
    pub limit: ConcurrencyLimit,

    /// Number of consumer loops the host starts.
    pub workers: usize,

    /// Lifetime of mutex leases.
    pub mutex_ttl: Duration,

    /// How often the replica checks the store for stop/start requests.
    pub state_sync_interval: Duration,

    /// How long a worker waits for a message while holding a scope.
    pub receive_wait: Duration,

    /// Address of the admin HTTP server.
    pub bind_addr: SocketAddr,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        EngineConfig {
            replica: ReplicaId::new(DEFAULT_REPLICA_NAME),
            limit: ConcurrencyLimit::Unbounded,
            workers: DEFAULT_WORKERS,
            mutex_ttl: Duration::from_secs(DEFAULT_MUTEX_TTL_SECS),
            state_sync_interval: Duration::from_secs(DEFAULT_STATE_SYNC_SECS),
            receive_wait: Duration::from_secs(DEFAULT_RECEIVE_WAIT_SECS),
            bind_addr: SocketAddr::from(DEFAULT_BIND_ADDR),
        }
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of
    /// a variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::new();

        let replica = match lookup("WORK_ITEM_REPLICA_NAME") {
            Some(name) if name.trim().is_empty() => {
                return Err(ConfigError::Invalid {
                    name: "WORK_ITEM_REPLICA_NAME",
                    value: name,
                    reason: "must not be empty".to_string(),
                });
            }
            Some(name) => ReplicaId::new(name.trim()),
            None => defaults.replica,
        };

        let limit = match parse::<i64>(&lookup, "WORK_ITEM_MAX_PARALLEL")? {
            Some(raw) => {
                ConcurrencyLimit::from_max_parallel(raw).ok_or_else(|| ConfigError::Invalid {
                    name: "WORK_ITEM_MAX_PARALLEL",
                    value: raw.to_string(),
                    reason: "must be negative (unbounded) or a positive number".to_string(),
                })?
            }
            None => defaults.limit,
        };

        let workers = match parse::<usize>(&lookup, "WORK_ITEM_WORKERS")? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    name: "WORK_ITEM_WORKERS",
                    value: "0".to_string(),
                    reason: "at least one worker is required".to_string(),
                });
            }
            Some(n) => n,
            None => defaults.workers,
        };

        Ok(EngineConfig {
            replica,
            limit,
            workers,
            mutex_ttl: parse_secs(&lookup, "WORK_ITEM_MUTEX_TTL_SECS")?
                .unwrap_or(defaults.mutex_ttl),
            state_sync_interval: parse_secs(&lookup, "WORK_ITEM_STATE_SYNC_SECS")?
                .unwrap_or(defaults.state_sync_interval),
            receive_wait: parse_secs(&lookup, "WORK_ITEM_RECEIVE_WAIT_SECS")?
                .unwrap_or(defaults.receive_wait),
            bind_addr: parse(&lookup, "WORK_ITEM_BIND_ADDR")?.unwrap_or(defaults.bind_addr),
        })
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(name) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        })
}

/// Parses a number of seconds in `1..=MAX_SECS`.
fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match parse::<u64>(lookup, name)? {
        Some(0) => Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Some(secs) if secs > MAX_SECS => Err(ConfigError::Invalid {
            name,
            value: secs.to_string(),
            reason: format!("must be at most {MAX_SECS}"),
        }),
        other => Ok(other.map(Duration::from_secs)),
    }
}

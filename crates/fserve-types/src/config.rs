//! Scheduler configuration.
//!
//! Construction takes the scheduler's identity plus an opaque key/value map;
//! unknown keys are ignored so the map can carry tuning for other
//! subsystems, while malformed values for known keys are rejected.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::SchedulerId;

/// Default event-loop poll timeout.
const DEFAULT_LOOP_INTERVAL_MS: u64 = 100;

/// Default outbound backlog, in bytes, past which the dispatcher drains
/// writes before running another command.
const DEFAULT_QUEUE_LARGE_BYTES: usize = 256 * 1024;

/// Default number of sockets accepted per listener readiness event.
const DEFAULT_ACCEPTS_PER_EVENT: usize = 64;

/// A malformed value for a recognized configuration key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    /// The offending key.
    pub key: &'static str,
    /// The raw value that failed to parse.
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value for configuration key '{}': '{}'",
            self.key, self.value
        )
    }
}

impl std::error::Error for ConfigError {}

/// Per-scheduler construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// This scheduler's identity within the fleet.
    pub id: SchedulerId,
    /// Total number of schedulers in the fleet. Used to partition
    /// engine-wide garbage collection.
    pub scheduler_count: u32,
    /// Upper bound on how long one event-loop poll may block.
    pub loop_interval: Duration,
    /// Outbound backlog threshold for write-first backpressure.
    pub outbound_queue_large_bytes: usize,
    /// How many pending sockets one accept pass will take from a listener.
    pub accepts_per_event: usize,
}

impl SchedulerConfig {
    /// Build a config for scheduler `id` of `scheduler_count` from a raw
    /// key/value map.
    ///
    /// Recognized keys: `loop_interval_ms`, `outbound_queue_large_bytes`,
    /// `accepts_per_event`. Anything else is ignored.
    pub fn from_map(
        id: SchedulerId,
        scheduler_count: u32,
        map: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let loop_interval_ms = parse_or(map, "loop_interval_ms", DEFAULT_LOOP_INTERVAL_MS)?;
        let outbound_queue_large_bytes =
            parse_or(map, "outbound_queue_large_bytes", DEFAULT_QUEUE_LARGE_BYTES)?;
        let accepts_per_event = parse_or(map, "accepts_per_event", DEFAULT_ACCEPTS_PER_EVENT)?;
        Ok(Self {
            id,
            scheduler_count,
            loop_interval: Duration::from_millis(loop_interval_ms),
            outbound_queue_large_bytes,
            accepts_per_event,
        })
    }

    /// Config with all-default tuning, for tests and single-scheduler use.
    #[must_use]
    pub fn with_defaults(id: SchedulerId, scheduler_count: u32) -> Self {
        Self {
            id,
            scheduler_count,
            loop_interval: Duration::from_millis(DEFAULT_LOOP_INTERVAL_MS),
            outbound_queue_large_bytes: DEFAULT_QUEUE_LARGE_BYTES,
            accepts_per_event: DEFAULT_ACCEPTS_PER_EVENT,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    map: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match map.get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError {
            key,
            value: raw.clone(),
        }),
    }
}

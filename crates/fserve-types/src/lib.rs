//! Shared foundation types for FrankenServe.
//!
//! Identifiers, command priorities, step outcomes, and scheduler
//! configuration live here so that the net and scheduler crates can agree
//! on vocabulary without depending on each other.

pub mod config;
pub mod metrics;

pub use config::{ConfigError, SchedulerConfig};
pub use metrics::SchedulerMetricsSnapshot;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies one scheduler within the fleet. Dense, zero-based.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SchedulerId(u32);

impl SchedulerId {
    /// Create a scheduler id from its zero-based index.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The zero-based index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scheduler-{}", self.0)
    }
}

/// Stable identifier of a client session. Unique process-wide for the
/// lifetime of the session; never reused while the session is live.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct SessionId(u64);

impl SessionId {
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire packet id used to correlate a command's response with its request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct PacketId(i32);

impl PacketId {
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the database a session is attached to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct DatabaseId(u32);

impl DatabaseId {
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Command priority. Higher values are more urgent.
pub type Priority = i32;

/// Default priority of a freshly prepared statement, and the lowest value
/// a statement can carry. The dispatcher scans with `MIN_PRIORITY - 1` as
/// its floor so that even minimum-priority commands are selectable.
pub const MIN_PRIORITY: Priority = 1;

/// Priority assigned to ordinary interactive statements.
pub const NORM_PRIORITY: Priority = 5;

/// Upper bound used by commands that must run at the next opportunity.
pub const MAX_PRIORITY: Priority = 10;

/// Result of advancing a yieldable command by one bounded slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The statement ran to completion and its response has been queued.
    Done,
    /// The statement relinquished the thread at a safe point and remains
    /// the session's current command.
    Yielded,
}

/// Wall-clock milliseconds since the Unix epoch.
///
/// Session timeouts are expressed against this clock. A clock that jumps
/// backwards saturates to zero rather than underflowing.
#[must_use]
pub fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

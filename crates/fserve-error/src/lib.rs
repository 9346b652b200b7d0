//! Primary error type for FrankenServe.
//!
//! Structured variants for the failures that cross component boundaries.
//! The scheduler itself never propagates errors out of its main loop:
//! command failures are routed to the owning session's wire channel and
//! background-task failures are logged, so this type mostly travels
//! *sideways* rather than up.

use fserve_types::{PacketId, SessionId};
use thiserror::Error;

/// Error type shared by the net and scheduler crates.
#[derive(Error, Debug)]
pub enum ServeError {
    // === I/O ===
    /// Socket or poller I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The event loop has been closed; no further polling is possible.
    #[error("event loop is closed")]
    EventLoopClosed,

    // === Configuration ===
    /// A recognized configuration key carried a malformed value.
    #[error(transparent)]
    Config(#[from] fserve_types::ConfigError),

    // === Sessions ===
    /// The session exceeded its statement timeout budget.
    #[error("session {session} timed out after {elapsed_ms}ms")]
    SessionTimeout { session: SessionId, elapsed_ms: u64 },

    /// Operation on a session that is already mark-closed or reaped.
    #[error("session {session} is closed")]
    SessionClosed { session: SessionId },

    // === Admission ===
    /// The handshake could not be completed.
    #[error("session handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    /// Credentials were rejected by the authenticator.
    #[error("authentication rejected")]
    AuthRejected,

    // === Commands ===
    /// A statement step failed; the detail is forwarded to the client on
    /// the packet it arrived with.
    #[error("command failed on packet {packet}: {detail}")]
    CommandFailed { packet: PacketId, detail: String },

    // === Background work ===
    /// A one-shot or periodic task reported a failure.
    #[error("background task failed: {detail}")]
    TaskFailed { detail: String },
}

impl ServeError {
    /// Shorthand for a command failure on `packet`.
    #[must_use]
    pub fn command(packet: PacketId, detail: impl Into<String>) -> Self {
        Self::CommandFailed {
            packet,
            detail: detail.into(),
        }
    }

    /// Shorthand for a background-task failure.
    #[must_use]
    pub fn task(detail: impl Into<String>) -> Self {
        Self::TaskFailed {
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_via_from() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer went away");
        let err: ServeError = io.into();
        assert!(matches!(err, ServeError::Io(_)));
    }

    #[test]
    fn timeout_display_names_the_session() {
        let err = ServeError::SessionTimeout {
            session: SessionId::from_raw(7),
            elapsed_ms: 1500,
        };
        assert_eq!(err.to_string(), "session 7 timed out after 1500ms");
    }
}

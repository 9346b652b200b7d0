//! Scheduler-facing session surface.

use fserve_error::ServeError;
use fserve_types::{DatabaseId, PacketId, SessionId};

use crate::command::{CommandScore, YieldableCommand};

/// A live client session as the scheduler sees it.
///
/// The session owns its wire channel, task queues, and current command;
/// the scheduler owns the session. Every method is called from the one
/// scheduler thread that registered the session.
pub trait ServerSession: Send {
    /// Stable id, unique process-wide while the session lives.
    fn session_id(&self) -> SessionId;

    /// Whether the session has been tombstoned. Mark-closed sessions are
    /// skipped by command selection and reaped on the next admission
    /// pass; their pending commands get no response.
    fn is_mark_closed(&self) -> bool;

    /// Drain the per-session task queue.
    fn run_session_tasks(&mut self);

    /// Drain the session's pending handler queue (transaction
    /// continuations and storage callbacks parked on this session).
    fn run_pending_tasks(&mut self);

    /// Mark the session closed if `now_ms` exceeds its activity timeout.
    /// Never unlinks; removal is deferred to the admission pass.
    fn check_session_timeout(&mut self, now_ms: u64);

    /// Score the session's current command for selection, if it has one
    /// ready.
    ///
    /// With `check_timeout` set, a command past its timeout budget must
    /// self-abort during this call: return `None`, surface the timeout
    /// error on the next response opportunity, and mark the session
    /// closed.
    fn yieldable_command(&mut self, check_timeout: bool, now_ms: u64) -> Option<CommandScore>;

    /// Detach the current command so the dispatcher can run one slice.
    fn take_command(&mut self) -> Option<Box<dyn YieldableCommand>>;

    /// Re-attach a command that yielded mid-statement.
    fn restore_command(&mut self, command: Box<dyn YieldableCommand>);

    /// Send an error response for `packet` on the session's wire channel.
    fn send_error(&mut self, packet: PacketId, err: &ServeError);

    /// Drop cached query plans. Idempotent; called under memory pressure
    /// between dispatcher iterations, never mid-step.
    fn clear_query_cache(&mut self);
}

/// Registry entry pairing a session with the database it is attached to.
pub(crate) struct SessionSlot {
    pub(crate) session: Box<dyn ServerSession>,
    pub(crate) database: DatabaseId,
}

//! Yieldable SQL commands.

use fserve_error::ServeError;
use fserve_types::{PacketId, Priority, SessionId, StepOutcome};

use crate::scheduler::StepContext;

/// Selection-time view of a session's current command.
///
/// This is all the dispatcher retains across event-loop polls: the
/// single-slot `next_best_command` cache stores a score, never the
/// command object itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandScore {
    /// Owning session.
    pub session: SessionId,
    /// Packet the response must be correlated with.
    pub packet: PacketId,
    /// Urgency at the instant of the scan. Higher wins.
    pub priority: Priority,
}

/// A partially-executed SQL statement that advances in bounded slices.
///
/// Not a coroutine: implementations are explicit state machines. One
/// [`run`](Self::run) call executes one slice and reports whether the
/// statement finished or relinquished the thread. Long slices should
/// call [`StepContext::yield_if_needed`] at safe points and return
/// [`StepOutcome::Yielded`] when it answers true.
pub trait YieldableCommand: Send {
    /// The session this statement belongs to.
    fn session_id(&self) -> SessionId;

    /// The request packet this statement answers.
    fn packet_id(&self) -> PacketId;

    /// Current urgency.
    fn priority(&self) -> Priority;

    /// Adjust urgency. Raised by the yield protocol so a statement that
    /// gave way is more competitive on re-entry.
    fn set_priority(&mut self, priority: Priority);

    /// Advance one bounded slice.
    fn run(&mut self, cx: &mut StepContext<'_>) -> Result<StepOutcome, ServeError>;
}

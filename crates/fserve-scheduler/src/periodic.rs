//! Periodic housekeeping tasks.

use fserve_error::ServeError;

use crate::list::SlotIdx;

/// A recurring task scanned on every deep housekeeping pass.
///
/// The scan does not track due times: each task decides internally
/// whether it is due and returns immediately otherwise. Registration
/// happens on the main thread (initial set) or the owning scheduler
/// thread (later additions), never from a foreign thread, which is what
/// lets the task list go unlocked.
pub trait PeriodicTask: Send {
    /// Run if due. A failure is logged and the task is retained.
    fn run(&mut self, now_ms: u64) -> Result<(), ServeError>;
}

/// Handle for removing a registered periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicTaskId(pub(crate) SlotIdx);

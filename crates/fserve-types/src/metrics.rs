//! Point-in-time scheduler counters.

/// Snapshot of one scheduler's activity counters.
///
/// Counters are cumulative since scheduler start. Reading a snapshot is
/// cheap and has no effect on the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerMetricsSnapshot {
    /// Sessions currently registered (open or mark-closed, not yet reaped).
    pub sessions_live: u64,
    /// Command steps dispatched.
    pub commands_dispatched: u64,
    /// Command steps that ended in an error routed back to the client.
    pub command_errors: u64,
    /// Cooperative yields taken by in-flight statements.
    pub yields_taken: u64,
    /// Session-init attempts admitted past the validator.
    pub init_tasks_admitted: u64,
    /// Session-init attempts that returned not-yet-ready and were requeued.
    pub init_tasks_requeued: u64,
    /// Misc one-shot tasks executed.
    pub misc_tasks_run: u64,
    /// Misc tasks that failed (logged and dropped).
    pub misc_task_failures: u64,
    /// Periodic task runs that failed (logged and retained).
    pub periodic_task_failures: u64,
    /// Full-GC passes triggered by memory pressure.
    pub gc_passes: u64,
}

//! Process-wide collaborator seams.
//!
//! The transaction engine and memory accounting are shared across the
//! fleet and internally synchronized; the scheduler treats both as
//! opaque handles injected at construction. Page operations are a
//! per-scheduler drain hook owned by the storage layer.

use fserve_types::SchedulerId;

/// Shared transaction engine.
///
/// `full_gc` partitions its work by scheduler index: concurrent calls
/// from every scheduler with distinct indices are safe.
pub trait TransactionEngine: Send + Sync {
    /// Run this scheduler's share of an engine-wide garbage collection.
    fn full_gc(&self, scheduler_count: u32, scheduler: SchedulerId);

    /// Advance transactions that were waiting on engine-internal state.
    fn run_pending_transactions(&self);
}

/// Read-only view of process memory pressure.
pub trait MemoryPressure: Send + Sync {
    /// Whether memory pressure has crossed the full-GC threshold.
    fn need_full_gc(&self) -> bool;
}

/// Per-scheduler storage page-operation queue.
pub trait PageOpDriver: Send {
    /// Run page operations that have come due. Bounded by queue size.
    fn run_page_operations(&mut self);
}

/// Engine handle for deployments and tests without a transaction engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpEngine;

impl TransactionEngine for NoOpEngine {
    fn full_gc(&self, _scheduler_count: u32, _scheduler: SchedulerId) {}
    fn run_pending_transactions(&self) {}
}

/// Memory view that never reports pressure.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGcPressure;

impl MemoryPressure for NoGcPressure {
    fn need_full_gc(&self) -> bool {
        false
    }
}

/// Page-operation driver with no storage attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpPageOps;

impl PageOpDriver for NoOpPageOps {
    fn run_page_operations(&mut self) {}
}

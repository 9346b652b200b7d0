//! Fleet assembly: one thread per scheduler plus cross-thread handles.
//!
//! A [`SchedulerHandle`] is the only surface foreign threads touch:
//! misc-task submission, wakeup, stop, and the load mirror. Everything
//! else belongs to the scheduler's own thread.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_queue::SegQueue;
use tracing::debug;

use fserve_error::ServeError;
use fserve_net::{AcceptorRegistry, ListenerId, LoopWaker};
use fserve_types::{SchedulerConfig, SchedulerId};

use crate::scheduler::{MiscTask, Scheduler};

/// Cross-thread surface of one running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    id: SchedulerId,
    inbox: Arc<SegQueue<MiscTask>>,
    waker: LoopWaker,
    stopped: Arc<AtomicBool>,
    load: Arc<AtomicU64>,
}

impl SchedulerHandle {
    #[must_use]
    pub fn id(&self) -> SchedulerId {
        self.id
    }

    /// Submit a one-shot task; wakes the scheduler so a blocked poll
    /// observes the submission promptly.
    pub fn submit(&self, task: MiscTask) {
        self.inbox.push(task);
        self.waker.wake();
    }

    /// Interrupt a blocked poll.
    pub fn wake(&self) {
        self.waker.wake();
    }

    /// Request shutdown. The current iteration completes, then the
    /// scheduler closes its event loop and exits.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.waker.wake();
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Last load published by the scheduler: queued work plus live
    /// session count.
    #[must_use]
    pub fn load(&self) -> u64 {
        self.load.load(Ordering::Relaxed)
    }
}

/// Builds and owns a fleet of schedulers, one OS thread each.
pub struct SchedulerFactory {
    handles: Vec<SchedulerHandle>,
    threads: Vec<JoinHandle<()>>,
    acceptor: Arc<AcceptorRegistry>,
}

impl SchedulerFactory {
    /// Start `scheduler_count` schedulers.
    ///
    /// `build` constructs each scheduler from its parsed config and the
    /// shared acceptor registry; the factory then moves it onto its own
    /// named thread.
    pub fn start<F>(
        scheduler_count: u32,
        config_map: &HashMap<String, String>,
        mut build: F,
    ) -> Result<Self, ServeError>
    where
        F: FnMut(SchedulerConfig, Arc<AcceptorRegistry>) -> Result<Scheduler, ServeError>,
    {
        let acceptor = Arc::new(AcceptorRegistry::new(scheduler_count));
        let mut handles = Vec::with_capacity(scheduler_count as usize);
        let mut threads = Vec::with_capacity(scheduler_count as usize);
        for index in 0..scheduler_count {
            let config =
                SchedulerConfig::from_map(SchedulerId::new(index), scheduler_count, config_map)?;
            let mut scheduler = build(config, Arc::clone(&acceptor))?;
            handles.push(SchedulerHandle {
                id: scheduler.id(),
                inbox: scheduler.misc_inbox(),
                waker: scheduler.waker(),
                stopped: scheduler.stop_flag(),
                load: scheduler.shared_load(),
            });
            let thread = std::thread::Builder::new()
                .name(format!("fserve-scheduler-{index}"))
                .spawn(move || scheduler.run())?;
            threads.push(thread);
        }
        debug!(scheduler_count, "scheduler fleet started");
        Ok(Self {
            handles,
            threads,
            acceptor,
        })
    }

    /// The fleet-wide acceptor registry.
    #[must_use]
    pub fn acceptor(&self) -> Arc<AcceptorRegistry> {
        Arc::clone(&self.acceptor)
    }

    /// Handles for every scheduler, indexed by scheduler id.
    #[must_use]
    pub fn handles(&self) -> &[SchedulerHandle] {
        &self.handles
    }

    /// The least-loaded scheduler, for assigning new work.
    #[must_use]
    pub fn get_scheduler(&self) -> Option<&SchedulerHandle> {
        self.handles.iter().min_by_key(|h| h.load())
    }

    /// Register a listen socket for accepting on every scheduler in the
    /// fleet, then wake them so the registration is picked up.
    pub fn register_accepter(&self, listener: TcpListener) -> Result<ListenerId, ServeError> {
        let ids = self.handles.iter().map(SchedulerHandle::id).collect();
        let id = self.acceptor.register_accepter(listener, ids)?;
        for handle in &self.handles {
            handle.wake();
        }
        Ok(id)
    }

    /// Stop every scheduler and join their threads.
    pub fn shutdown(mut self) {
        for handle in &self.handles {
            handle.stop();
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!("scheduler thread panicked during shutdown");
            }
        }
    }
}

//! The per-thread cooperative scheduler.
//!
//! One `Scheduler` owns a shard of client sessions and everything needed
//! to drive them: a readiness event loop, the admission throttle, the
//! task lists, and the command dispatcher. A single iteration of
//! [`run`](Scheduler::run) admits new listeners and sessions, drains the
//! background queues, dispatches ready SQL command slices by priority,
//! and only then blocks in the event-loop poll. Everything except that
//! poll is wall-time bounded by queue sizes.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tracing::{debug, warn};

use fserve_error::ServeError;
use fserve_net::{
    AcceptorRegistry, ConnKey, Connection, EventLoop, ListenerId, LoopWaker,
};
use fserve_types::{
    wall_clock_millis, DatabaseId, PacketId, Priority, SchedulerConfig, SchedulerId,
    SchedulerMetricsSnapshot, SessionId, StepOutcome, MIN_PRIORITY,
};

use crate::command::{CommandScore, YieldableCommand};
use crate::engine::{MemoryPressure, PageOpDriver, TransactionEngine};
use crate::init::{InitAttempt, InitContext, InitTaskFactory, SessionInitTask};
use crate::list::PendingList;
use crate::periodic::{PeriodicTask, PeriodicTaskId};
use crate::session::{ServerSession, SessionSlot};
use crate::validator::SessionValidator;

/// One-shot task submitted to a scheduler, possibly from a foreign
/// thread. Failures are logged and the task is dropped.
pub type MiscTask = Box<dyn FnOnce() -> Result<(), ServeError> + Send>;

/// Scheduler facilities exposed to a command slice while it runs.
///
/// The command is detached from its session for the duration of the
/// slice, so the context can hand out the whole scheduler without
/// aliasing it.
pub struct StepContext<'a> {
    pub(crate) scheduler: &'a mut Scheduler,
}

impl StepContext<'_> {
    /// The scheduler executing this slice.
    #[must_use]
    pub fn scheduler_id(&self) -> SchedulerId {
        self.scheduler.config.id
    }

    /// Offer to relinquish the thread to a higher-priority peer.
    ///
    /// Answers true when a strictly higher-priority command exists in
    /// another session; the caller must then return
    /// [`StepOutcome::Yielded`] up to the dispatcher.
    pub fn yield_if_needed(&mut self, current: &mut dyn YieldableCommand) -> bool {
        self.scheduler.yield_if_needed(current)
    }

    /// Borrow a registered connection, e.g. to queue response bytes.
    pub fn connection_mut(&mut self, key: ConnKey) -> Option<&mut dyn Connection> {
        self.scheduler.event_loop.connection_mut(key)
    }
}

/// A single-threaded cooperative scheduler owning one shard of sessions.
pub struct Scheduler {
    config: SchedulerConfig,
    event_loop: EventLoop,
    acceptor: Arc<AcceptorRegistry>,
    init_factory: Box<dyn InitTaskFactory>,
    engine: Arc<dyn TransactionEngine>,
    memory: Arc<dyn MemoryPressure>,
    page_ops: Box<dyn PageOpDriver>,

    validator: SessionValidator,
    sessions: PendingList<SessionSlot>,
    session_init_tasks: PendingList<Box<dyn SessionInitTask>>,
    periodic_tasks: PendingList<Box<dyn PeriodicTask>>,
    misc_tasks: PendingList<MiscTask>,
    misc_inbox: Arc<SegQueue<MiscTask>>,

    /// Single-slot cache bridging the yield protocol and the dispatcher.
    next_best_command: Option<CommandScore>,

    stopped: Arc<AtomicBool>,
    shared_load: Arc<AtomicU64>,
    metrics: SchedulerMetricsSnapshot,
}

impl Scheduler {
    /// Build a scheduler from its configuration and collaborators.
    pub fn new(
        config: SchedulerConfig,
        acceptor: Arc<AcceptorRegistry>,
        init_factory: Box<dyn InitTaskFactory>,
        engine: Arc<dyn TransactionEngine>,
        memory: Arc<dyn MemoryPressure>,
        page_ops: Box<dyn PageOpDriver>,
    ) -> Result<Self, ServeError> {
        let event_loop = EventLoop::new(config.outbound_queue_large_bytes)?;
        Ok(Self {
            config,
            event_loop,
            acceptor,
            init_factory,
            engine,
            memory,
            page_ops,
            validator: SessionValidator::new(),
            sessions: PendingList::new(),
            session_init_tasks: PendingList::new(),
            periodic_tasks: PendingList::new(),
            misc_tasks: PendingList::new(),
            misc_inbox: Arc::new(SegQueue::new()),
            next_best_command: None,
            stopped: Arc::new(AtomicBool::new(false)),
            shared_load: Arc::new(AtomicU64::new(0)),
            metrics: SchedulerMetricsSnapshot::default(),
        })
    }

    /// This scheduler's fleet identity.
    #[must_use]
    pub fn id(&self) -> SchedulerId {
        self.config.id
    }

    /// Thread-safe wakeup handle for the event loop.
    #[must_use]
    pub fn waker(&self) -> LoopWaker {
        self.event_loop.waker()
    }

    /// The MPSC inbox foreign threads push misc tasks into.
    #[must_use]
    pub fn misc_inbox(&self) -> Arc<SegQueue<MiscTask>> {
        Arc::clone(&self.misc_inbox)
    }

    /// The monotonic stop flag. Setting it lets the current iteration
    /// finish, then the loop closes its event loop and exits.
    #[must_use]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopped)
    }

    /// Load mirror published once per loop iteration.
    #[must_use]
    pub fn shared_load(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.shared_load)
    }

    /// Queued work plus live session count.
    #[must_use]
    pub fn get_load(&self) -> u64 {
        (self.misc_tasks.len() + self.session_init_tasks.len() + self.sessions.len()) as u64
    }

    /// Point-in-time activity counters.
    #[must_use]
    pub fn metrics(&self) -> SchedulerMetricsSnapshot {
        let mut snapshot = self.metrics;
        snapshot.sessions_live = self.sessions.len() as u64;
        snapshot
    }

    // -----------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------

    /// Drive the scheduler until the stop flag is set.
    pub fn run(&mut self) {
        debug!(scheduler = %self.config.id, "scheduler loop starting");
        while !self.stopped.load(Ordering::Acquire) {
            self.run_register_accepter_tasks();
            self.run_session_init_tasks();
            self.reap_closed_sessions();
            self.run_misc_tasks();

            self.page_ops.run_page_operations();
            self.run_session_tasks();
            self.engine.run_pending_transactions();
            self.run_pending_tasks();
            self.execute_next_statement();
            self.publish_load();
            self.run_event_loop();
        }
        self.event_loop.close();
        debug!(scheduler = %self.config.id, "scheduler loop stopped");
    }

    fn run_event_loop(&mut self) {
        if let Err(e) = self.event_loop.poll(Some(self.config.loop_interval)) {
            warn!(scheduler = %self.config.id, error = %e, "event loop poll failed");
            if self.event_loop.is_closed() {
                self.stopped.store(true, Ordering::Release);
            }
            return;
        }
        self.handle_ready_accepts();
        self.event_loop.write();
    }

    fn publish_load(&mut self) {
        self.shared_load.store(self.get_load(), Ordering::Relaxed);
    }

    // -----------------------------------------------------------------
    // Misc tasks
    // -----------------------------------------------------------------

    /// Submit a one-shot task. Safe from any thread via the inbox; pair
    /// with a [`waker`](Self::waker) wake so a blocked poll observes it
    /// promptly.
    pub fn handle(&self, task: MiscTask) {
        self.misc_inbox.push(task);
    }

    /// One misc drain: pull foreign submissions into the local FIFO,
    /// then run it to empty. Also invoked by housekeeping inside
    /// [`execute_next_statement`](Self::execute_next_statement).
    pub fn run_misc_tasks(&mut self) {
        // Foreign submissions first, so they join the local FIFO.
        while let Some(task) = self.misc_inbox.pop() {
            self.misc_tasks.push_back(task);
        }
        // Pop before run: a failing task is never re-executed.
        while let Some(task) = self.misc_tasks.pop_front() {
            self.metrics.misc_tasks_run += 1;
            if let Err(e) = task() {
                self.metrics.misc_task_failures += 1;
                warn!(scheduler = %self.config.id, error = %e, "misc task failed");
            }
        }
    }

    // -----------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------

    /// Register a session produced by a completed handshake.
    pub fn add_session(&mut self, session: Box<dyn ServerSession>, database: DatabaseId) {
        debug!(
            scheduler = %self.config.id,
            session = %session.session_id(),
            database = database.get(),
            "session registered"
        );
        self.sessions.push_back(SessionSlot { session, database });
    }

    /// Unregister a session. Returns false if it was not registered.
    pub fn remove_session(&mut self, session: SessionId) -> bool {
        self.sessions
            .remove_where(|slot| slot.session.session_id() == session)
            .is_some()
    }

    /// Number of registered sessions, mark-closed included.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn run_session_tasks(&mut self) {
        self.sessions.for_each_mut(|slot| {
            if !slot.session.is_mark_closed() {
                slot.session.run_session_tasks();
            }
        });
    }

    fn run_pending_tasks(&mut self) {
        self.sessions.for_each_mut(|slot| {
            if !slot.session.is_mark_closed() {
                slot.session.run_pending_tasks();
            }
        });
    }

    fn check_session_timeout(&mut self) {
        let now = wall_clock_millis();
        self.sessions
            .for_each_mut(|slot| slot.session.check_session_timeout(now));
    }

    /// Drop mark-closed sessions. Runs in the admission pass, never
    /// inside a selection or timeout traversal.
    pub fn reap_closed_sessions(&mut self) {
        let id = self.config.id;
        self.sessions.retain_mut(|slot| {
            let closed = slot.session.is_mark_closed();
            if closed {
                debug!(
                    scheduler = %id,
                    session = %slot.session.session_id(),
                    "reaping mark-closed session"
                );
            }
            !closed
        });
    }

    fn find_session_mut(&mut self, id: SessionId) -> Option<&mut SessionSlot> {
        let mut cur = self.sessions.head_idx();
        while let Some(idx) = cur {
            cur = self.sessions.next_idx(idx);
            if self
                .sessions
                .get(idx)
                .is_some_and(|slot| slot.session.session_id() == id)
            {
                return self.sessions.get_mut(idx);
            }
        }
        None
    }

    fn session_alive(&self, id: SessionId) -> bool {
        self.sessions
            .iter()
            .any(|slot| slot.session.session_id() == id && !slot.session.is_mark_closed())
    }

    // -----------------------------------------------------------------
    // Session admission
    // -----------------------------------------------------------------

    /// Queue handshake work for an accepted socket.
    pub fn add_session_init_task(&mut self, task: Box<dyn SessionInitTask>) {
        self.session_init_tasks.push_back(task);
    }

    /// Report a credential-check outcome to the admission throttle.
    pub fn validate_session(&mut self, is_auth_correct: bool) {
        self.validator.validate(is_auth_correct);
    }

    /// One admission pass: replenish the throttle, then attempt queued
    /// init tasks until the pass snapshot is exhausted or the throttle
    /// says stop.
    pub fn run_session_init_tasks(&mut self) {
        self.validator.tick();
        if self.session_init_tasks.is_empty()
            || !self.validator.can_handle_next_session_init_task()
        {
            return;
        }
        // One pass over the tasks queued as of now; requeued tasks land
        // behind the snapshot and wait for the next pass.
        let size = self.session_init_tasks.len();
        for _ in 0..size {
            let Some(mut task) = self.session_init_tasks.pop_front() else {
                break;
            };
            self.validator.note_admission();
            self.metrics.init_tasks_admitted += 1;
            let mut cx =
                InitContext::new(&mut self.validator, &mut self.event_loop, self.config.id);
            match task.attempt(&mut cx) {
                Ok(InitAttempt::Complete(Some(new_session))) => {
                    self.add_session(new_session.session, new_session.database);
                }
                Ok(InitAttempt::Complete(None)) => {}
                Ok(InitAttempt::Retry) => {
                    self.metrics.init_tasks_requeued += 1;
                    self.session_init_tasks.push_back(task);
                }
                Err(e) => {
                    warn!(scheduler = %self.config.id, error = %e, "session init task failed");
                }
            }
            if !self.validator.can_handle_next_session_init_task() {
                break;
            }
        }
    }

    // -----------------------------------------------------------------
    // Periodic tasks
    // -----------------------------------------------------------------

    /// Register a periodic task. Owner-thread only once the scheduler is
    /// running.
    pub fn add_periodic_task(&mut self, task: Box<dyn PeriodicTask>) -> PeriodicTaskId {
        PeriodicTaskId(self.periodic_tasks.push_back(task))
    }

    /// Remove a periodic task by the id its registration returned.
    pub fn remove_periodic_task(&mut self, id: PeriodicTaskId) -> bool {
        self.periodic_tasks.remove(id.0).is_some()
    }

    fn run_periodic_tasks(&mut self) {
        // Bypassed entirely once shutdown has been requested.
        if self.stopped.load(Ordering::Relaxed) || self.periodic_tasks.is_empty() {
            return;
        }
        let now = wall_clock_millis();
        let id = self.config.id;
        let failures = &mut self.metrics.periodic_task_failures;
        self.periodic_tasks.for_each_mut(|task| {
            if let Err(e) = task.run(now) {
                *failures += 1;
                warn!(scheduler = %id, error = %e, "periodic task failed");
            }
        });
    }

    // -----------------------------------------------------------------
    // GC coordination
    // -----------------------------------------------------------------

    fn gc(&mut self) {
        if !self.memory.need_full_gc() {
            return;
        }
        self.metrics.gc_passes += 1;
        self.sessions
            .for_each_mut(|slot| slot.session.clear_query_cache());
        self.engine
            .full_gc(self.config.scheduler_count, self.config.id);
    }

    // -----------------------------------------------------------------
    // Command dispatch
    // -----------------------------------------------------------------

    /// Dispatch ready command slices until no session offers one.
    ///
    /// Each turn of the inner loop drains writes under backpressure,
    /// checks memory pressure, and picks the highest-priority ready
    /// command; when none is found it retries after session tasks and
    /// again after a deep housekeeping pass before giving up.
    pub fn execute_next_statement(&mut self) {
        // One below the minimum so minimum-priority commands still win.
        let floor = MIN_PRIORITY - 1;
        let mut last: Option<(SessionId, PacketId)> = None;
        loop {
            if self.event_loop.is_queue_large() {
                self.event_loop.write();
            }
            self.gc();
            let mut candidate = self.take_cached_best();
            if candidate.is_none() {
                candidate = self.get_next_best_command(None, floor, true);
            }
            if candidate.is_none() {
                self.run_session_tasks();
                candidate = self.get_next_best_command(None, floor, true);
            }
            if candidate.is_none() {
                self.run_register_accepter_tasks();
                self.check_session_timeout();
                self.run_periodic_tasks();
                self.page_ops.run_page_operations();
                self.run_session_tasks();
                self.engine.run_pending_transactions();
                self.run_misc_tasks();
                candidate = self.get_next_best_command(None, floor, true);
            }
            let Some(score) = candidate else {
                break;
            };
            let Some(mut command) = self.take_session_command(score.session) else {
                continue;
            };
            self.metrics.commands_dispatched += 1;
            let outcome = command.run(&mut StepContext { scheduler: self });
            match outcome {
                Ok(step) => {
                    if let StepOutcome::Yielded = step {
                        self.restore_session_command(score.session, command);
                    }
                    // The same command twice in a row means nothing else
                    // is arriving; give housekeeping a slice too.
                    if last == Some((score.session, score.packet)) {
                        self.page_ops.run_page_operations();
                        self.run_session_tasks();
                        self.run_misc_tasks();
                    }
                    last = Some((score.session, score.packet));
                }
                Err(e) => {
                    self.metrics.command_errors += 1;
                    self.route_command_error(score.session, score.packet, &e);
                }
            }
        }
    }

    /// Take the cached yield-protocol candidate if its session is still
    /// live in the registry.
    fn take_cached_best(&mut self) -> Option<CommandScore> {
        let score = self.next_best_command.take()?;
        if self.session_alive(score.session) {
            Some(score)
        } else {
            None
        }
    }

    /// Scan the session list once for the ready command with the
    /// strictly greatest priority above `min_priority`.
    ///
    /// Ties keep the first-seen candidate; the list is append-ordered
    /// and the scan never mutates it, so list order is a stable
    /// tie-break. With `check_timeout` set, sessions abort timed-out
    /// commands during the scan and offer nothing.
    fn get_next_best_command(
        &mut self,
        exclude: Option<SessionId>,
        min_priority: Priority,
        check_timeout: bool,
    ) -> Option<CommandScore> {
        if self.sessions.is_empty() {
            return None;
        }
        let now = wall_clock_millis();
        let mut floor = min_priority;
        let mut best = None;
        let mut cur = self.sessions.head_idx();
        while let Some(idx) = cur {
            cur = self.sessions.next_idx(idx);
            let Some(slot) = self.sessions.get_mut(idx) else {
                continue;
            };
            if slot.session.is_mark_closed() || exclude == Some(slot.session.session_id()) {
                continue;
            }
            let Some(score) = slot.session.yieldable_command(check_timeout, now) else {
                continue;
            };
            if score.priority > floor {
                floor = score.priority;
                best = Some(score);
            }
        }
        best
    }

    fn take_session_command(&mut self, id: SessionId) -> Option<Box<dyn YieldableCommand>> {
        self.find_session_mut(id)?.session.take_command()
    }

    fn restore_session_command(&mut self, id: SessionId, command: Box<dyn YieldableCommand>) {
        if let Some(slot) = self.find_session_mut(id) {
            slot.session.restore_command(command);
        }
    }

    fn route_command_error(&mut self, session: SessionId, packet: PacketId, err: &ServeError) {
        if let Some(slot) = self.find_session_mut(session) {
            slot.session.send_error(packet, err);
        } else {
            warn!(
                scheduler = %self.config.id,
                session = %session,
                error = %err,
                "command failed for a session no longer registered"
            );
        }
    }

    // -----------------------------------------------------------------
    // Yield protocol
    // -----------------------------------------------------------------

    /// Called from within a running statement at a safe point.
    ///
    /// Runs a minimal housekeeping pass, then looks for a strictly
    /// higher-priority command in *other* sessions. When one exists it
    /// is cached for the dispatcher, the current statement's priority is
    /// raised by one so it is more competitive on re-entry, and the
    /// answer is true: the caller must return up to the dispatcher.
    pub fn yield_if_needed(&mut self, current: &mut dyn YieldableCommand) -> bool {
        self.run_register_accepter_tasks();
        if let Err(e) = self.event_loop.select_now() {
            warn!(scheduler = %self.config.id, error = %e, "selector check failed");
        }
        self.handle_ready_accepts();
        self.event_loop.write();
        self.run_session_init_tasks();
        self.run_session_tasks();
        self.event_loop.write();

        // With fewer than two sessions there is nobody to yield to.
        if self.sessions.len() < 2 {
            return false;
        }

        let priority = current.priority();
        let better = self.get_next_best_command(Some(current.session_id()), priority, false);
        if let Some(score) = better {
            self.next_best_command = Some(score);
            current.set_priority(priority + 1);
            self.metrics.yields_taken += 1;
            return true;
        }
        false
    }

    // -----------------------------------------------------------------
    // Acceptor bridge
    // -----------------------------------------------------------------

    /// Register a listen socket for accepting on this scheduler.
    pub fn register_accepter(&mut self, listener: TcpListener) -> Result<ListenerId, ServeError> {
        let id = self
            .acceptor
            .register_accepter(listener, vec![self.config.id])?;
        Ok(id)
    }

    /// Bind an established connection to this scheduler's event loop.
    pub fn register(&mut self, conn: Box<dyn Connection>) -> Result<ConnKey, ServeError> {
        Ok(self.event_loop.register(conn)?)
    }

    fn run_register_accepter_tasks(&mut self) {
        let acceptor = Arc::clone(&self.acceptor);
        acceptor.run_register_accepter_tasks(self.config.id, &mut self.event_loop);
    }

    fn handle_ready_accepts(&mut self) {
        let ready = self.event_loop.handle_selected_keys();
        for listener in ready {
            self.accept(listener);
        }
    }

    fn accept(&mut self, listener: ListenerId) {
        let acceptor = Arc::clone(&self.acceptor);
        let id = self.config.id;
        let max = self.config.accepts_per_event;
        let factory = &self.init_factory;
        let init_tasks = &mut self.session_init_tasks;
        let accepted = acceptor.accept(
            listener,
            id,
            &mut self.event_loop,
            max,
            &mut |stream, peer| {
                debug!(scheduler = %id, peer = %peer, "accepted connection");
                init_tasks.push_back(factory.create(stream, peer, id));
            },
        );
        if accepted > 0 {
            // Session-init work exists now; no-op wake keeps the loop hot.
            self.event_loop.waker().wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{NoGcPressure, NoOpEngine, NoOpPageOps};
    use crate::testkit::{ScriptedCommand, ScriptedSession, SinkInitFactory};

    fn test_scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerConfig::with_defaults(SchedulerId::new(0), 1),
            Arc::new(AcceptorRegistry::new(1)),
            Box::new(SinkInitFactory),
            Arc::new(NoOpEngine),
            Arc::new(NoGcPressure),
            Box::new(NoOpPageOps),
        )
        .expect("scheduler")
    }

    #[test]
    fn empty_registry_dispatches_nothing() {
        let mut scheduler = test_scheduler();
        scheduler.execute_next_statement();
        assert_eq!(scheduler.metrics().commands_dispatched, 0);
    }

    #[test]
    fn highest_priority_session_wins() {
        let mut scheduler = test_scheduler();
        let low = ScriptedSession::new(SessionId::from_raw(1));
        low.push_command(ScriptedCommand::completing(
            SessionId::from_raw(1),
            PacketId::from_raw(1),
            3,
        ));
        let high = ScriptedSession::new(SessionId::from_raw(2));
        high.push_command(ScriptedCommand::completing(
            SessionId::from_raw(2),
            PacketId::from_raw(2),
            9,
        ));
        let low_log = low.log();
        let high_log = high.log();
        scheduler.add_session(Box::new(low), DatabaseId::new(0));
        scheduler.add_session(Box::new(high), DatabaseId::new(0));

        scheduler.execute_next_statement();
        let high_first = high_log.lock().expect("log").first().cloned();
        assert_eq!(high_first.as_deref(), Some("ran packet 2"));
        assert!(low_log
            .lock()
            .expect("log")
            .iter()
            .any(|line| line == "ran packet 1"));
        assert_eq!(scheduler.metrics().commands_dispatched, 2);
    }

    #[test]
    fn priority_ties_go_to_list_order() {
        let mut scheduler = test_scheduler();
        let order: Arc<std::sync::Mutex<Vec<u64>>> = Arc::default();
        for raw in 1..=3u64 {
            let session = ScriptedSession::new(SessionId::from_raw(raw));
            let seen = Arc::clone(&order);
            session.push_command(ScriptedCommand::with_effect(
                SessionId::from_raw(raw),
                PacketId::from_raw(0),
                5,
                Box::new(move || {
                    seen.lock().expect("order").push(raw);
                    Ok(StepOutcome::Done)
                }),
            ));
            scheduler.add_session(Box::new(session), DatabaseId::new(0));
        }
        scheduler.execute_next_statement();
        assert_eq!(order.lock().expect("order").as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn mark_closed_sessions_are_never_selected_and_get_reaped() {
        let mut scheduler = test_scheduler();
        let session = ScriptedSession::new(SessionId::from_raw(4));
        session.push_command(ScriptedCommand::completing(
            SessionId::from_raw(4),
            PacketId::from_raw(1),
            NORM,
        ));
        session.mark_closed();
        let log = session.log();
        scheduler.add_session(Box::new(session), DatabaseId::new(0));

        scheduler.execute_next_statement();
        assert!(log.lock().expect("log").is_empty(), "closed session must not run");

        scheduler.reap_closed_sessions();
        assert_eq!(scheduler.session_count(), 0);
    }

    const NORM: Priority = fserve_types::NORM_PRIORITY;

    #[test]
    fn misc_task_failure_is_isolated() {
        let mut scheduler = test_scheduler();
        let ran: Arc<std::sync::Mutex<Vec<u32>>> = Arc::default();
        for i in 0..10u32 {
            let seen = Arc::clone(&ran);
            scheduler.handle(Box::new(move || {
                if i == 4 {
                    return Err(ServeError::task("scripted failure"));
                }
                seen.lock().expect("ran").push(i);
                Ok(())
            }));
        }
        scheduler.run_misc_tasks();
        let ran = ran.lock().expect("ran");
        assert_eq!(ran.len(), 9);
        assert!(!ran.contains(&4));
        let metrics = scheduler.metrics();
        assert_eq!(metrics.misc_tasks_run, 10);
        assert_eq!(metrics.misc_task_failures, 1);
        // Drained to empty: a second pass runs nothing new.
        scheduler.run_misc_tasks();
        assert_eq!(scheduler.metrics().misc_tasks_run, 10);
    }

    #[test]
    fn load_counts_sessions_and_queued_work() {
        let mut scheduler = test_scheduler();
        assert_eq!(scheduler.get_load(), 0);
        scheduler.add_session(
            Box::new(ScriptedSession::new(SessionId::from_raw(9))),
            DatabaseId::new(0),
        );
        scheduler.handle(Box::new(|| Ok(())));
        // The inbox does not count until drained into the local list.
        assert_eq!(scheduler.get_load(), 1);
        scheduler.remove_session(SessionId::from_raw(9));
        assert_eq!(scheduler.get_load(), 0);
    }
}

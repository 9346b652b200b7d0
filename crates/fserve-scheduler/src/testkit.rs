//! Scripted collaborators for scheduler tests.
//!
//! Real sessions sit on sockets and a SQL engine; these stand-ins let a
//! test stage exact command arrivals, auth outcomes, and timeouts, and
//! then assert on a shared activity log. Handles are `Clone` so a test
//! can keep observing a session after boxing it into the registry.

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use fserve_error::ServeError;
use fserve_types::{PacketId, Priority, SchedulerId, SessionId, StepOutcome};

use crate::command::{CommandScore, YieldableCommand};
use crate::init::{InitAttempt, InitContext, InitTaskFactory, SessionInitTask};
use crate::scheduler::StepContext;
use crate::session::ServerSession;

/// Shared line-oriented activity log.
pub type ActivityLog = Arc<Mutex<Vec<String>>>;

fn log_line(log: &ActivityLog, line: String) {
    log.lock().expect("activity log poisoned").push(line);
}

// ---------------------------------------------------------------------------
// ScriptedCommand
// ---------------------------------------------------------------------------

type Effect = Box<dyn FnMut() -> Result<StepOutcome, ServeError> + Send>;

/// A yieldable command whose behavior is scripted by the test.
pub struct ScriptedCommand {
    session: SessionId,
    packet: PacketId,
    priority: Priority,
    cooperative: bool,
    before_step: Option<Box<dyn FnMut() + Send>>,
    effect: Effect,
    log: ActivityLog,
    priority_probe: Option<Arc<AtomicI32>>,
}

impl ScriptedCommand {
    /// A command that completes on its first slice.
    #[must_use]
    pub fn completing(session: SessionId, packet: PacketId, priority: Priority) -> Self {
        Self::with_effect(session, packet, priority, Box::new(|| Ok(StepOutcome::Done)))
    }

    /// A command whose first slice fails with `detail`.
    #[must_use]
    pub fn failing(
        session: SessionId,
        packet: PacketId,
        priority: Priority,
        detail: &str,
    ) -> Self {
        let detail = detail.to_owned();
        Self::with_effect(
            session,
            packet,
            priority,
            Box::new(move || Err(ServeError::command(packet, detail.clone()))),
        )
    }

    /// A command driven by an arbitrary per-slice effect.
    #[must_use]
    pub fn with_effect(
        session: SessionId,
        packet: PacketId,
        priority: Priority,
        effect: Effect,
    ) -> Self {
        Self {
            session,
            packet,
            priority,
            cooperative: false,
            before_step: None,
            effect,
            log: Arc::default(),
            priority_probe: None,
        }
    }

    /// Offer to yield at the start of every slice.
    #[must_use]
    pub fn cooperative(mut self) -> Self {
        self.cooperative = true;
        self
    }

    /// Run `hook` at the start of every slice, before the yield check.
    /// Lets a test stage work (e.g. a rival command) mid-statement.
    #[must_use]
    pub fn before_step(mut self, hook: Box<dyn FnMut() + Send>) -> Self {
        self.before_step = Some(hook);
        self
    }

    /// Mirror every priority change into `probe`, so a test can observe
    /// the yield protocol raising this command's priority.
    #[must_use]
    pub fn probe_priority(mut self, probe: Arc<AtomicI32>) -> Self {
        probe.store(self.priority, Ordering::Relaxed);
        self.priority_probe = Some(probe);
        self
    }

    fn adopt_log(&mut self, log: &ActivityLog) {
        self.log = Arc::clone(log);
    }
}

impl YieldableCommand for ScriptedCommand {
    fn session_id(&self) -> SessionId {
        self.session
    }

    fn packet_id(&self) -> PacketId {
        self.packet
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
        if let Some(probe) = &self.priority_probe {
            probe.store(priority, Ordering::Relaxed);
        }
    }

    fn run(&mut self, cx: &mut StepContext<'_>) -> Result<StepOutcome, ServeError> {
        if let Some(hook) = &mut self.before_step {
            hook();
        }
        if self.cooperative && cx.yield_if_needed(&mut *self) {
            log_line(&self.log, format!("yielded packet {}", self.packet));
            return Ok(StepOutcome::Yielded);
        }
        log_line(&self.log, format!("ran packet {}", self.packet));
        (self.effect)()
    }
}

// ---------------------------------------------------------------------------
// ScriptedSession
// ---------------------------------------------------------------------------

struct SessionState {
    id: SessionId,
    mark_closed: bool,
    current: Option<Box<dyn YieldableCommand>>,
    queued: VecDeque<ScriptedCommand>,
    timeout_at_ms: Option<u64>,
    session_tasks_run: u64,
    pending_tasks_run: u64,
    cache_clears: u64,
    log: ActivityLog,
}

/// A [`ServerSession`] whose commands and lifecycle a test scripts.
///
/// Cloning shares state, so keep a clone to observe the session after
/// handing the original to the scheduler.
#[derive(Clone)]
pub struct ScriptedSession {
    state: Arc<Mutex<SessionState>>,
}

impl ScriptedSession {
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState {
                id,
                mark_closed: false,
                current: None,
                queued: VecDeque::new(),
                timeout_at_ms: None,
                session_tasks_run: 0,
                pending_tasks_run: 0,
                cache_clears: 0,
                log: Arc::default(),
            })),
        }
    }

    /// Queue a command; it becomes current once prior commands finish.
    pub fn push_command(&self, mut command: ScriptedCommand) {
        let state = &mut *self.state.lock().expect("session state poisoned");
        command.adopt_log(&state.log);
        state.queued.push_back(command);
    }

    /// Tombstone the session.
    pub fn mark_closed(&self) {
        self.state.lock().expect("session state poisoned").mark_closed = true;
    }

    /// Make the session time out once the wall clock reaches `at_ms`.
    pub fn set_timeout_at(&self, at_ms: u64) {
        self.state.lock().expect("session state poisoned").timeout_at_ms = Some(at_ms);
    }

    /// The shared activity log (commands run, yields, errors sent).
    #[must_use]
    pub fn log(&self) -> ActivityLog {
        Arc::clone(&self.state.lock().expect("session state poisoned").log)
    }

    /// How many times the query cache was cleared.
    #[must_use]
    pub fn cache_clears(&self) -> u64 {
        self.state.lock().expect("session state poisoned").cache_clears
    }

    /// How many session-task drains ran.
    #[must_use]
    pub fn session_tasks_run(&self) -> u64 {
        self.state.lock().expect("session state poisoned").session_tasks_run
    }
}

impl SessionState {
    fn timed_out(&self, now_ms: u64) -> bool {
        self.timeout_at_ms.is_some_and(|at| now_ms >= at)
    }

    fn promote(&mut self) {
        if self.current.is_none() {
            if let Some(next) = self.queued.pop_front() {
                self.current = Some(Box::new(next));
            }
        }
    }
}

impl ServerSession for ScriptedSession {
    fn session_id(&self) -> SessionId {
        self.state.lock().expect("session state poisoned").id
    }

    fn is_mark_closed(&self) -> bool {
        self.state.lock().expect("session state poisoned").mark_closed
    }

    fn run_session_tasks(&mut self) {
        self.state.lock().expect("session state poisoned").session_tasks_run += 1;
    }

    fn run_pending_tasks(&mut self) {
        self.state.lock().expect("session state poisoned").pending_tasks_run += 1;
    }

    fn check_session_timeout(&mut self, now_ms: u64) {
        let state = &mut *self.state.lock().expect("session state poisoned");
        if !state.mark_closed && state.timed_out(now_ms) {
            state.mark_closed = true;
            let log = Arc::clone(&state.log);
            log_line(&log, format!("session {} timed out", state.id));
        }
    }

    fn yieldable_command(&mut self, check_timeout: bool, now_ms: u64) -> Option<CommandScore> {
        let state = &mut *self.state.lock().expect("session state poisoned");
        if state.mark_closed {
            return None;
        }
        state.promote();
        let (packet, priority) = match state.current.as_ref() {
            Some(current) => (current.packet_id(), current.priority()),
            None => return None,
        };
        if check_timeout && state.timed_out(now_ms) {
            // Self-abort during selection: drop the command, surface the
            // timeout on its packet, tombstone the session.
            let err = ServeError::SessionTimeout {
                session: state.id,
                elapsed_ms: now_ms.saturating_sub(state.timeout_at_ms.unwrap_or(now_ms)),
            };
            state.current = None;
            state.mark_closed = true;
            let log = Arc::clone(&state.log);
            log_line(&log, format!("error packet {packet}: {err}"));
            return None;
        }
        Some(CommandScore {
            session: state.id,
            packet,
            priority,
        })
    }

    fn take_command(&mut self) -> Option<Box<dyn YieldableCommand>> {
        self.state.lock().expect("session state poisoned").current.take()
    }

    fn restore_command(&mut self, command: Box<dyn YieldableCommand>) {
        self.state.lock().expect("session state poisoned").current = Some(command);
    }

    fn send_error(&mut self, packet: PacketId, err: &ServeError) {
        let state = &mut *self.state.lock().expect("session state poisoned");
        let log = Arc::clone(&state.log);
        log_line(&log, format!("error packet {packet}: {err}"));
    }

    fn clear_query_cache(&mut self) {
        self.state.lock().expect("session state poisoned").cache_clears += 1;
    }
}

// ---------------------------------------------------------------------------
// Init-task scaffolding
// ---------------------------------------------------------------------------

/// Factory whose init tasks complete immediately without a session.
/// For schedulers that never see a real accept path in the test.
pub struct SinkInitFactory;

impl InitTaskFactory for SinkInitFactory {
    fn create(
        &self,
        _stream: TcpStream,
        _peer: SocketAddr,
        _scheduler: SchedulerId,
    ) -> Box<dyn SessionInitTask> {
        Box::new(SinkInitTask)
    }
}

struct SinkInitTask;

impl SessionInitTask for SinkInitTask {
    fn attempt(&mut self, _cx: &mut InitContext<'_>) -> Result<InitAttempt, ServeError> {
        Ok(InitAttempt::Complete(None))
    }
}

/// Scripted handshake: reports an auth outcome, optionally retries a few
/// times first, then completes. Appends to a shared log for assertions.
pub struct ScriptedInitTask {
    name: String,
    auth_ok: bool,
    retries_left: u32,
    log: ActivityLog,
}

impl ScriptedInitTask {
    #[must_use]
    pub fn new(name: impl Into<String>, auth_ok: bool, log: &ActivityLog) -> Self {
        Self {
            name: name.into(),
            auth_ok,
            retries_left: 0,
            log: Arc::clone(log),
        }
    }

    /// Return not-yet-ready `retries` times before completing.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_left = retries;
        self
    }
}

impl SessionInitTask for ScriptedInitTask {
    fn attempt(&mut self, cx: &mut InitContext<'_>) -> Result<InitAttempt, ServeError> {
        if self.retries_left > 0 {
            self.retries_left -= 1;
            log_line(&self.log, format!("{} retried", self.name));
            return Ok(InitAttempt::Retry);
        }
        cx.validate_session(self.auth_ok);
        if self.auth_ok {
            log_line(&self.log, format!("{} completed", self.name));
            Ok(InitAttempt::Complete(None))
        } else {
            log_line(&self.log, format!("{} rejected", self.name));
            Err(ServeError::AuthRejected)
        }
    }
}

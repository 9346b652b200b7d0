//! End-to-end dispatcher scenarios against scripted sessions.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use fserve_error::ServeError;
use fserve_net::AcceptorRegistry;
use fserve_scheduler::testkit::{ActivityLog, ScriptedCommand, ScriptedInitTask, ScriptedSession, SinkInitFactory};
use fserve_scheduler::{
    MemoryPressure, NoGcPressure, NoOpEngine, NoOpPageOps, PeriodicTask, Scheduler,
    TransactionEngine,
};
use fserve_types::{
    DatabaseId, PacketId, SchedulerConfig, SchedulerId, SessionId, StepOutcome,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn scheduler_with(
    engine: Arc<dyn TransactionEngine>,
    memory: Arc<dyn MemoryPressure>,
) -> Scheduler {
    init_logging();
    Scheduler::new(
        SchedulerConfig::with_defaults(SchedulerId::new(0), 1),
        Arc::new(AcceptorRegistry::new(1)),
        Box::new(SinkInitFactory),
        engine,
        memory,
        Box::new(NoOpPageOps),
    )
    .expect("scheduler should construct")
}

fn scheduler() -> Scheduler {
    scheduler_with(Arc::new(NoOpEngine), Arc::new(NoGcPressure))
}

fn log_lines(log: &ActivityLog) -> Vec<String> {
    log.lock().expect("log").clone()
}

// ---------------------------------------------------------------------------
// Scenario: priority preemption via the yield protocol
// ---------------------------------------------------------------------------

#[test]
fn long_statement_yields_to_higher_priority_peer_then_finishes() {
    let mut sched = scheduler();
    let a = ScriptedSession::new(SessionId::from_raw(1));
    let b = ScriptedSession::new(SessionId::from_raw(2));

    // B exists but has nothing to run yet; its rival command arrives
    // while A's statement is mid-flight.
    let rival_for = b.clone();
    let staged = AtomicBool::new(false);
    let a_priority = Arc::new(AtomicI32::new(0));
    let a_cmd = ScriptedCommand::completing(SessionId::from_raw(1), PacketId::from_raw(10), 5)
        .cooperative()
        .probe_priority(Arc::clone(&a_priority))
        .before_step(Box::new(move || {
            if !staged.swap(true, Ordering::Relaxed) {
                rival_for.push_command(ScriptedCommand::completing(
                    SessionId::from_raw(2),
                    PacketId::from_raw(20),
                    9,
                ));
            }
        }));
    a.push_command(a_cmd);

    let a_log = a.log();
    let b_log = b.log();
    sched.add_session(Box::new(a.clone()), DatabaseId::new(0));
    sched.add_session(Box::new(b.clone()), DatabaseId::new(0));

    sched.execute_next_statement();

    assert_eq!(
        log_lines(&a_log),
        vec!["yielded packet 10", "ran packet 10"],
        "A must give way once, then run to completion"
    );
    assert_eq!(log_lines(&b_log), vec!["ran packet 20"]);
    assert_eq!(
        a_priority.load(Ordering::Relaxed),
        6,
        "yielding must raise the statement's priority by one"
    );
    let metrics = sched.metrics();
    assert_eq!(metrics.yields_taken, 1);
    assert_eq!(metrics.commands_dispatched, 3, "A twice plus B once");
}

// ---------------------------------------------------------------------------
// Scenario: single session never yields
// ---------------------------------------------------------------------------

#[test]
fn single_session_never_yields_regardless_of_priority() {
    let mut sched = scheduler();
    let only = ScriptedSession::new(SessionId::from_raw(1));
    only.push_command(
        ScriptedCommand::completing(SessionId::from_raw(1), PacketId::from_raw(1), 5).cooperative(),
    );
    let log = only.log();
    sched.add_session(Box::new(only), DatabaseId::new(0));

    sched.execute_next_statement();

    assert_eq!(log_lines(&log), vec!["ran packet 1"]);
    assert_eq!(sched.metrics().yields_taken, 0);
}

// ---------------------------------------------------------------------------
// Scenario: admission throttle under credential failures
// ---------------------------------------------------------------------------

#[test]
fn auth_failures_throttle_admission_and_backlog_eventually_drains() {
    let mut sched = scheduler();
    let log: ActivityLog = Arc::default();
    for i in 0..20u32 {
        // The first five handshakes fail their credential check.
        let auth_ok = i >= 5;
        sched.add_session_init_task(Box::new(ScriptedInitTask::new(
            format!("init-{i}"),
            auth_ok,
            &log,
        )));
    }

    let mut saw_starved_pass = false;
    let mut passes = 0;
    while sched.get_load() > 0 {
        let before = sched.metrics().init_tasks_admitted;
        sched.run_session_init_tasks();
        let admitted = sched.metrics().init_tasks_admitted - before;
        if admitted == 0 && sched.get_load() > 0 {
            saw_starved_pass = true;
        }
        passes += 1;
        assert!(passes < 500, "backlog must drain, stuck after {passes} passes");
    }

    assert!(
        saw_starved_pass,
        "at least one pass must admit zero init tasks while throttled"
    );
    let lines = log_lines(&log);
    assert_eq!(lines.len(), 20, "every init task runs exactly once: {lines:?}");
    assert_eq!(lines.iter().filter(|l| l.ends_with("rejected")).count(), 5);
    assert_eq!(lines.iter().filter(|l| l.ends_with("completed")).count(), 15);
}

#[test]
fn retrying_init_task_completes_once() {
    let mut sched = scheduler();
    let log: ActivityLog = Arc::default();
    sched.add_session_init_task(Box::new(
        ScriptedInitTask::new("slow", true, &log).with_retries(2),
    ));

    for _ in 0..10 {
        sched.run_session_init_tasks();
    }

    let lines = log_lines(&log);
    assert_eq!(
        lines,
        vec!["slow retried", "slow retried", "slow completed"],
        "a not-yet-ready task is requeued, and completes exactly once"
    );
    assert_eq!(sched.metrics().init_tasks_requeued, 2);
}

// ---------------------------------------------------------------------------
// Scenario: saturated validator starves only admission
// ---------------------------------------------------------------------------

#[test]
fn saturated_validator_leaves_other_loops_running() {
    let mut sched = scheduler();
    let log: ActivityLog = Arc::default();

    // Saturate: repeated failures collapse the replenishment rate, then
    // failing tasks burn the burst budget.
    for _ in 0..6 {
        sched.validate_session(false);
    }
    for i in 0..6u32 {
        sched.add_session_init_task(Box::new(ScriptedInitTask::new(
            format!("burn-{i}"),
            false,
            &log,
        )));
    }
    loop {
        let before = sched.metrics().init_tasks_admitted;
        sched.run_session_init_tasks();
        if sched.metrics().init_tasks_admitted == before {
            break;
        }
    }
    let backlog = sched.get_load();
    assert!(backlog > 0, "some init tasks must still be queued");

    // Misc tasks and command dispatch are unaffected.
    let ran = Arc::new(Mutex::new(false));
    let probe = Arc::clone(&ran);
    sched.handle(Box::new(move || {
        *probe.lock().expect("probe") = true;
        Ok(())
    }));
    sched.run_misc_tasks();
    assert!(*ran.lock().expect("probe"));

    let session = ScriptedSession::new(SessionId::from_raw(1));
    session.push_command(ScriptedCommand::completing(
        SessionId::from_raw(1),
        PacketId::from_raw(1),
        5,
    ));
    let log_s = session.log();
    sched.add_session(Box::new(session), DatabaseId::new(0));
    sched.execute_next_statement();
    assert_eq!(log_lines(&log_s), vec!["ran packet 1"]);
}

// ---------------------------------------------------------------------------
// Scenario: mark-closed sessions are skipped and reaped silently
// ---------------------------------------------------------------------------

#[test]
fn mark_closed_session_gets_no_response_and_is_reaped() {
    let mut sched = scheduler();
    let closed = ScriptedSession::new(SessionId::from_raw(1));
    closed.push_command(ScriptedCommand::completing(
        SessionId::from_raw(1),
        PacketId::from_raw(7),
        9,
    ));
    closed.mark_closed();
    let live = ScriptedSession::new(SessionId::from_raw(2));
    live.push_command(ScriptedCommand::completing(
        SessionId::from_raw(2),
        PacketId::from_raw(8),
        1,
    ));

    let closed_log = closed.log();
    let live_log = live.log();
    sched.add_session(Box::new(closed), DatabaseId::new(0));
    sched.add_session(Box::new(live), DatabaseId::new(0));

    sched.execute_next_statement();
    assert!(
        log_lines(&closed_log).is_empty(),
        "no step and no response for a mark-closed session"
    );
    assert_eq!(log_lines(&live_log), vec!["ran packet 8"]);

    sched.reap_closed_sessions();
    assert_eq!(sched.session_count(), 1);
}

// ---------------------------------------------------------------------------
// Scenario: timeout observed during selection
// ---------------------------------------------------------------------------

#[test]
fn timed_out_command_aborts_during_selection() {
    let mut sched = scheduler();
    let session = ScriptedSession::new(SessionId::from_raw(3));
    session.push_command(ScriptedCommand::completing(
        SessionId::from_raw(3),
        PacketId::from_raw(11),
        5,
    ));
    // A deadline in the past: already exceeded at selection time.
    session.set_timeout_at(1);
    let log = session.log();
    sched.add_session(Box::new(session), DatabaseId::new(0));

    sched.execute_next_statement();

    assert_eq!(sched.metrics().commands_dispatched, 0);
    let lines = log_lines(&log);
    assert_eq!(lines.len(), 1);
    assert!(
        lines[0].starts_with("error packet 11:"),
        "timeout error must be surfaced on the command's packet: {lines:?}"
    );

    sched.reap_closed_sessions();
    assert_eq!(sched.session_count(), 0);
}

// ---------------------------------------------------------------------------
// Scenario: command failure routes to the owning session
// ---------------------------------------------------------------------------

#[test]
fn failing_command_reports_on_its_own_packet_and_session_survives() {
    let mut sched = scheduler();
    let session = ScriptedSession::new(SessionId::from_raw(4));
    session.push_command(ScriptedCommand::failing(
        SessionId::from_raw(4),
        PacketId::from_raw(21),
        5,
        "division by zero",
    ));
    let log = session.log();
    sched.add_session(Box::new(session), DatabaseId::new(0));

    sched.execute_next_statement();

    let lines = log_lines(&log);
    assert_eq!(lines.len(), 2, "one step, one error response: {lines:?}");
    assert_eq!(lines[0], "ran packet 21");
    assert!(lines[1].starts_with("error packet 21:"));
    assert!(lines[1].contains("division by zero"));
    assert_eq!(sched.metrics().command_errors, 1);
    assert_eq!(sched.session_count(), 1, "a command error does not close the session");
}

// ---------------------------------------------------------------------------
// GC coordination
// ---------------------------------------------------------------------------

struct TogglePressure(AtomicBool);

impl MemoryPressure for TogglePressure {
    fn need_full_gc(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct RecordingEngine {
    gcs: Mutex<Vec<(u32, SchedulerId)>>,
}

impl TransactionEngine for RecordingEngine {
    fn full_gc(&self, scheduler_count: u32, scheduler: SchedulerId) {
        self.gcs.lock().expect("gcs").push((scheduler_count, scheduler));
    }

    fn run_pending_transactions(&self) {}
}

#[test]
fn memory_pressure_clears_caches_and_partitions_engine_gc() {
    let engine = Arc::new(RecordingEngine::default());
    let pressure = Arc::new(TogglePressure(AtomicBool::new(true)));
    let mut sched = scheduler_with(
        Arc::<RecordingEngine>::clone(&engine),
        Arc::<TogglePressure>::clone(&pressure),
    );

    let session = ScriptedSession::new(SessionId::from_raw(5));
    sched.add_session(Box::new(session.clone()), DatabaseId::new(0));

    sched.execute_next_statement();
    assert!(session.cache_clears() >= 1, "per-session cache flush under pressure");
    {
        let gcs = engine.gcs.lock().expect("gcs");
        assert!(!gcs.is_empty());
        assert!(gcs.iter().all(|&(count, id)| count == 1 && id == SchedulerId::new(0)));
    }

    pressure.0.store(false, Ordering::Relaxed);
    let before = engine.gcs.lock().expect("gcs").len();
    sched.execute_next_statement();
    assert_eq!(engine.gcs.lock().expect("gcs").len(), before, "no GC without pressure");
}

// ---------------------------------------------------------------------------
// Periodic tasks
// ---------------------------------------------------------------------------

struct CountingPeriodic {
    runs: Arc<Mutex<u32>>,
    fail: bool,
}

impl PeriodicTask for CountingPeriodic {
    fn run(&mut self, _now_ms: u64) -> Result<(), ServeError> {
        *self.runs.lock().expect("runs") += 1;
        if self.fail {
            return Err(ServeError::task("periodic probe failure"));
        }
        Ok(())
    }
}

#[test]
fn periodic_tasks_run_in_housekeeping_and_survive_failures() {
    let mut sched = scheduler();
    let runs = Arc::new(Mutex::new(0));
    let id = sched.add_periodic_task(Box::new(CountingPeriodic {
        runs: Arc::clone(&runs),
        fail: true,
    }));

    // No commands: the dispatcher falls through to deep housekeeping.
    sched.execute_next_statement();
    assert_eq!(*runs.lock().expect("runs"), 1);
    assert_eq!(sched.metrics().periodic_task_failures, 1);

    // Failure retained the task: it runs again on the next pass.
    sched.execute_next_statement();
    assert_eq!(*runs.lock().expect("runs"), 2);

    assert!(sched.remove_periodic_task(id));
    sched.execute_next_statement();
    assert_eq!(*runs.lock().expect("runs"), 2, "removed task must not run");
}

// ---------------------------------------------------------------------------
// Registry round-trip
// ---------------------------------------------------------------------------

#[test]
fn register_then_remove_restores_registry_shape() {
    let mut sched = scheduler();
    let keep_a = ScriptedSession::new(SessionId::from_raw(1));
    let keep_b = ScriptedSession::new(SessionId::from_raw(2));
    sched.add_session(Box::new(keep_a), DatabaseId::new(0));
    sched.add_session(Box::new(keep_b), DatabaseId::new(0));
    assert_eq!(sched.session_count(), 2);

    let transient = ScriptedSession::new(SessionId::from_raw(3));
    sched.add_session(Box::new(transient), DatabaseId::new(0));
    assert_eq!(sched.session_count(), 3);
    assert!(sched.remove_session(SessionId::from_raw(3)));
    assert_eq!(sched.session_count(), 2);
    assert!(!sched.remove_session(SessionId::from_raw(3)), "second removal is a no-op");

    // Order is preserved for the survivors: a fresh command on each and
    // equal priorities dispatches in registration order.
    let order: Arc<Mutex<Vec<u64>>> = Arc::default();
    for raw in [1u64, 2] {
        let session = ScriptedSession::new(SessionId::from_raw(10 + raw));
        let seen = Arc::clone(&order);
        session.push_command(ScriptedCommand::with_effect(
            SessionId::from_raw(10 + raw),
            PacketId::from_raw(0),
            5,
            Box::new(move || {
                seen.lock().expect("order").push(raw);
                Ok(StepOutcome::Done)
            }),
        ));
        sched.add_session(Box::new(session), DatabaseId::new(0));
    }
    sched.execute_next_statement();
    assert_eq!(order.lock().expect("order").as_slice(), &[1, 2]);
}

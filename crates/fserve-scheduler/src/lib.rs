//! FrankenServe scheduler core.
//!
//! A fleet of single-threaded cooperative schedulers forms a database
//! server's execution substrate. Each [`Scheduler`] owns a shard of
//! client sessions and, per loop iteration: admits new listeners and
//! (throttled) new sessions, drains one-shot and storage queues,
//! dispatches partially-executed SQL commands by priority with
//! mid-statement yield, and blocks only in the event-loop poll.
//!
//! Collaborators — SQL compilation, storage pages, the transaction
//! engine, credential verification, wire framing — stay behind the
//! traits in [`session`], [`command`], [`init`], and [`engine`].

pub mod command;
pub mod engine;
pub mod fleet;
pub mod init;
pub mod list;
pub mod periodic;
pub mod scheduler;
pub mod session;
pub mod testkit;
pub mod validator;

pub use command::{CommandScore, YieldableCommand};
pub use engine::{
    MemoryPressure, NoGcPressure, NoOpEngine, NoOpPageOps, PageOpDriver, TransactionEngine,
};
pub use fleet::{SchedulerFactory, SchedulerHandle};
pub use init::{InitAttempt, InitContext, InitTaskFactory, NewSession, SessionInitTask};
pub use list::{PendingList, SlotIdx};
pub use periodic::{PeriodicTask, PeriodicTaskId};
pub use scheduler::{MiscTask, Scheduler, StepContext};
pub use session::ServerSession;
pub use validator::SessionValidator;

//! Deferred session establishment.
//!
//! An accepted socket does not become a session until its handshake and
//! credential check complete, and neither is allowed to block the
//! scheduler. The accept path wraps each socket in a [`SessionInitTask`]
//! whose `attempt` runs one non-blocking round: finish and hand back a
//! session, report a permanent failure, or ask to be requeued at the
//! tail of the init list.

use std::net::{SocketAddr, TcpStream};

use fserve_error::ServeError;
use fserve_net::{ConnKey, Connection, EventLoop};
use fserve_types::{DatabaseId, SchedulerId};

use crate::session::ServerSession;
use crate::validator::SessionValidator;

/// A session produced by a completed handshake.
pub struct NewSession {
    /// The session to register with the scheduler that ran the init task.
    pub session: Box<dyn ServerSession>,
    /// Database the credentials resolved to.
    pub database: DatabaseId,
}

/// Outcome of one init attempt.
pub enum InitAttempt {
    /// Handshake finished. `None` means the exchange concluded without a
    /// session (e.g. the client was redirected or hung up cleanly).
    Complete(Option<NewSession>),
    /// Not ready yet; requeue at the tail of the init list.
    Retry,
}

/// Scheduler facilities available to an init attempt.
pub struct InitContext<'a> {
    validator: &'a mut SessionValidator,
    event_loop: &'a mut EventLoop,
    scheduler: SchedulerId,
}

impl<'a> InitContext<'a> {
    pub(crate) fn new(
        validator: &'a mut SessionValidator,
        event_loop: &'a mut EventLoop,
        scheduler: SchedulerId,
    ) -> Self {
        Self {
            validator,
            event_loop,
            scheduler,
        }
    }

    /// The scheduler this task is running on.
    #[must_use]
    pub fn scheduler_id(&self) -> SchedulerId {
        self.scheduler
    }

    /// Report a credential-check outcome to the admission throttle.
    /// Call after every check, pass or fail.
    pub fn validate_session(&mut self, is_auth_correct: bool) {
        self.validator.validate(is_auth_correct);
    }

    /// Bind the session's connection to this scheduler's event loop.
    pub fn register(&mut self, conn: Box<dyn Connection>) -> Result<ConnKey, ServeError> {
        Ok(self.event_loop.register(conn)?)
    }

    /// Borrow a connection registered earlier in the handshake.
    pub fn connection_mut(&mut self, key: ConnKey) -> Option<&mut dyn Connection> {
        self.event_loop.connection_mut(key)
    }
}

/// Restartable handshake work for one accepted socket.
///
/// `attempt` must not block. A permanent failure is reported by `Err`;
/// the scheduler logs it and drops the task (the implementation should
/// have already sent the error to the client if the wire allows).
pub trait SessionInitTask: Send {
    fn attempt(&mut self, cx: &mut InitContext<'_>) -> Result<InitAttempt, ServeError>;
}

/// Builds the init task for a freshly accepted socket.
///
/// Implemented by the protocol server; the scheduler calls it from the
/// accept path so the task is scoped to the accepting scheduler.
pub trait InitTaskFactory: Send {
    fn create(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        scheduler: SchedulerId,
    ) -> Box<dyn SessionInitTask>;
}

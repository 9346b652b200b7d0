//! Fleet-level acceptor registry.
//!
//! Every listener is registered with the set of schedulers allowed to
//! accept on it; each of those schedulers watches the listener fd in its
//! own poller. When readiness fires, the schedulers race a
//! compare-and-set on the listener's owner slot: exactly one wins, drains
//! the pending accepts onto its own thread, and releases the slot. Losers
//! simply re-arm. This balances new connections by contention on the
//! accept itself, with no central queue.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_queue::SegQueue;
use fserve_types::SchedulerId;
use parking_lot::RwLock;
use tracing::warn;

use crate::event_loop::EventLoop;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u32);

impl ListenerId {
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Owner slot value meaning "no scheduler is currently accepting".
const OWNER_FREE: i64 = -1;

struct AcceptorSlot {
    listener: TcpListener,
    /// Scheduler index currently draining accepts, or [`OWNER_FREE`].
    owner: AtomicI64,
    schedulers: Vec<SchedulerId>,
}

/// Fleet-wide table of listen sockets and their accepting schedulers.
///
/// Shared by `Arc` across the fleet; all interior mutation is lock-free
/// or behind short registry locks, never held across an accept.
pub struct AcceptorRegistry {
    slots: RwLock<Vec<AcceptorSlot>>,
    /// Per-scheduler queue of listeners that still need registering with
    /// that scheduler's poller. Drained on the owning thread.
    registration_tasks: Vec<SegQueue<ListenerId>>,
}

impl AcceptorRegistry {
    /// Registry for a fleet of `scheduler_count` schedulers.
    #[must_use]
    pub fn new(scheduler_count: u32) -> Self {
        let registration_tasks = (0..scheduler_count).map(|_| SegQueue::new()).collect();
        Self {
            slots: RwLock::new(Vec::new()),
            registration_tasks,
        }
    }

    /// Number of schedulers this registry was sized for.
    #[must_use]
    pub fn scheduler_count(&self) -> usize {
        self.registration_tasks.len()
    }

    /// Register `listener` for accepting on the given schedulers.
    ///
    /// The listener is switched to nonblocking mode and each named
    /// scheduler receives a registration task; callers should wake those
    /// schedulers afterwards so the tasks are picked up promptly.
    pub fn register_accepter(
        &self,
        listener: TcpListener,
        schedulers: Vec<SchedulerId>,
    ) -> io::Result<ListenerId> {
        listener.set_nonblocking(true)?;
        let mut slots = self.slots.write();
        let id = ListenerId(u32::try_from(slots.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::OutOfMemory, "listener table exhausted")
        })?);
        for scheduler in &schedulers {
            if let Some(queue) = self.registration_tasks.get(scheduler.index() as usize) {
                queue.push(id);
            }
        }
        slots.push(AcceptorSlot {
            listener,
            owner: AtomicI64::new(OWNER_FREE),
            schedulers,
        });
        Ok(id)
    }

    /// Drain `scheduler`'s pending listener registrations into its event
    /// loop. Called from the owning scheduler thread only.
    pub fn run_register_accepter_tasks(&self, scheduler: SchedulerId, event_loop: &mut EventLoop) {
        let Some(queue) = self.registration_tasks.get(scheduler.index() as usize) else {
            return;
        };
        while let Some(id) = queue.pop() {
            let slots = self.slots.read();
            let Some(slot) = slots.get(id.index() as usize) else {
                continue;
            };
            if let Err(e) = event_loop.register_listener(id, &slot.listener) {
                warn!(listener = %id, scheduler = %scheduler, error = %e,
                    "failed to register listener with event loop");
            }
        }
    }

    /// Attempt to win the accept on `id` for `scheduler`.
    ///
    /// On a win, accepts up to `max` sockets (stopping at `WouldBlock`),
    /// hands each to `sink` in nonblocking mode, then releases the owner
    /// slot. Win or lose, the listener's read interest in this
    /// scheduler's poller is re-armed. Returns the number of sockets
    /// accepted by this call.
    pub fn accept(
        &self,
        id: ListenerId,
        scheduler: SchedulerId,
        event_loop: &mut EventLoop,
        max: usize,
        sink: &mut dyn FnMut(TcpStream, SocketAddr),
    ) -> usize {
        let slots = self.slots.read();
        let Some(slot) = slots.get(id.index() as usize) else {
            return 0;
        };
        if !slot.schedulers.contains(&scheduler) {
            return 0;
        }
        let mut accepted = 0;
        let won = slot
            .owner
            .compare_exchange(
                OWNER_FREE,
                i64::from(scheduler.index()),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            while accepted < max {
                match slot.listener.accept() {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nonblocking(true) {
                            warn!(listener = %id, peer = %addr, error = %e,
                                "failed to set accepted socket nonblocking");
                            continue;
                        }
                        sink(stream, addr);
                        accepted += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!(listener = %id, error = %e, "accept failed");
                        break;
                    }
                }
            }
            slot.owner.store(OWNER_FREE, Ordering::Release);
        }
        event_loop.rearm_listener(id, &slot.listener);
        accepted
    }

    /// Local address of a registered listener, for tests and logging.
    pub fn local_addr(&self, id: ListenerId) -> Option<SocketAddr> {
        let slots = self.slots.read();
        slots.get(id.index() as usize)?.listener.local_addr().ok()
    }
}

//! Per-scheduler readiness event loop.
//!
//! One [`EventLoop`] per scheduler thread. `poll` is the only blocking
//! call a scheduler ever makes; [`LoopWaker::wake`] is safe from any
//! thread and makes a blocked poll return promptly. Registered interest
//! is oneshot, so readiness is re-armed after every delivery: readable
//! always, writable only while a connection has queued outbound bytes.

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use polling::{Event, Poller};
use tracing::{debug, warn};

use crate::acceptor::ListenerId;
use crate::connection::Connection;

/// Stable key of a registered connection within one event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey(usize);

impl ConnKey {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Thread-safe wakeup handle for a blocked [`EventLoop::poll`].
#[derive(Clone)]
pub struct LoopWaker {
    poller: Arc<Poller>,
}

impl LoopWaker {
    /// Interrupt a blocked poll. No-op if the loop is not blocked.
    pub fn wake(&self) {
        if let Err(e) = self.poller.notify() {
            warn!(error = %e, "failed to notify event loop poller");
        }
    }
}

/// Readiness poller plus connection registry for one scheduler.
pub struct EventLoop {
    poller: Arc<Poller>,
    events: Vec<Event>,
    conns: HashMap<usize, Box<dyn Connection>>,
    listeners: HashMap<usize, ListenerId>,
    listener_keys: HashMap<ListenerId, usize>,
    next_key: usize,
    queue_large_bytes: usize,
    closed: bool,
}

impl EventLoop {
    /// Create an event loop whose [`is_queue_large`](Self::is_queue_large)
    /// threshold is `queue_large_bytes` of aggregate queued output.
    pub fn new(queue_large_bytes: usize) -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            events: Vec::new(),
            conns: HashMap::new(),
            listeners: HashMap::new(),
            listener_keys: HashMap::new(),
            next_key: 1,
            queue_large_bytes,
            closed: false,
        })
    }

    /// A cloneable wakeup handle usable from any thread.
    #[must_use]
    pub fn waker(&self) -> LoopWaker {
        LoopWaker {
            poller: Arc::clone(&self.poller),
        }
    }

    fn alloc_key(&mut self) -> usize {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    /// Bind a connection to this loop's poller with read interest.
    pub fn register(&mut self, conn: Box<dyn Connection>) -> io::Result<ConnKey> {
        let key = self.alloc_key();
        self.poller.add(conn.socket(), Event::readable(key))?;
        self.conns.insert(key, conn);
        Ok(ConnKey(key))
    }

    /// Remove a connection, dropping any queued outbound bytes.
    pub fn deregister(&mut self, key: ConnKey) {
        if let Some(conn) = self.conns.remove(&key.0) {
            if let Err(e) = self.poller.delete(conn.socket()) {
                debug!(key = key.0, error = %e, "poller delete on deregister");
            }
        }
    }

    /// Watch a listener socket for incoming connections.
    pub fn register_listener(&mut self, id: ListenerId, listener: &TcpListener) -> io::Result<()> {
        if self.listener_keys.contains_key(&id) {
            return Ok(());
        }
        let key = self.alloc_key();
        self.poller.add(listener, Event::readable(key))?;
        self.listeners.insert(key, id);
        self.listener_keys.insert(id, key);
        Ok(())
    }

    /// Re-arm read interest on a listener after an accept pass.
    pub fn rearm_listener(&mut self, id: ListenerId, listener: &TcpListener) {
        if let Some(&key) = self.listener_keys.get(&id) {
            if let Err(e) = self.poller.modify(listener, Event::readable(key)) {
                warn!(listener = %id, error = %e, "failed to re-arm listener");
            }
        }
    }

    /// Block until readiness, wakeup, or `timeout`. The collected events
    /// are consumed by [`handle_selected_keys`](Self::handle_selected_keys).
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "event loop is closed",
            ));
        }
        self.events.clear();
        self.poller.wait(&mut self.events, timeout)
    }

    /// Non-blocking readiness check, used from yield points.
    pub fn select_now(&mut self) -> io::Result<usize> {
        self.poll(Some(Duration::ZERO))
    }

    /// Dispatch collected readiness to connections and return the
    /// listeners that have pending accepts.
    ///
    /// Connection I/O errors are logged at warn and deregister only the
    /// failing connection.
    pub fn handle_selected_keys(&mut self) -> Vec<ListenerId> {
        let events = std::mem::take(&mut self.events);
        let mut ready_listeners = Vec::new();
        let mut dead = Vec::new();
        for event in &events {
            if let Some(&listener) = self.listeners.get(&event.key) {
                ready_listeners.push(listener);
                continue;
            }
            let Some(conn) = self.conns.get_mut(&event.key) else {
                continue;
            };
            if event.readable {
                if let Err(e) = conn.handle_readable() {
                    warn!(key = event.key, error = %e, "connection read failed");
                    dead.push(event.key);
                    continue;
                }
            }
            if event.writable {
                if let Err(e) = conn.flush_outbound() {
                    warn!(key = event.key, error = %e, "connection write failed");
                    dead.push(event.key);
                    continue;
                }
            }
            if conn.is_closed() {
                dead.push(event.key);
                continue;
            }
            // Oneshot interest: re-arm for the next readiness edge.
            let interest = if conn.queued_outbound() > 0 {
                Event::all(event.key)
            } else {
                Event::readable(event.key)
            };
            if let Err(e) = self.poller.modify(conn.socket(), interest) {
                warn!(key = event.key, error = %e, "failed to re-arm connection");
                dead.push(event.key);
            }
        }
        self.events = events;
        for key in dead {
            self.deregister(ConnKey(key));
        }
        ready_listeners
    }

    /// Flush queued outbound bytes on every registered connection.
    pub fn write(&mut self) {
        let mut dead = Vec::new();
        for (&key, conn) in &mut self.conns {
            if conn.queued_outbound() == 0 {
                continue;
            }
            if let Err(e) = conn.flush_outbound() {
                warn!(key, error = %e, "write drain failed");
                dead.push(key);
                continue;
            }
            if conn.queued_outbound() > 0 {
                if let Err(e) = self.poller.modify(conn.socket(), Event::all(key)) {
                    warn!(key, error = %e, "failed to arm write interest");
                    dead.push(key);
                }
            }
        }
        for key in dead {
            self.deregister(ConnKey(key));
        }
    }

    /// Whether aggregate queued output exceeds the backpressure threshold.
    #[must_use]
    pub fn is_queue_large(&self) -> bool {
        let queued: usize = self.conns.values().map(|c| c.queued_outbound()).sum();
        queued > self.queue_large_bytes
    }

    /// Borrow a registered connection, e.g. to queue response bytes.
    pub fn connection_mut(&mut self, key: ConnKey) -> Option<&mut (dyn Connection + '_)> {
        match self.conns.get_mut(&key.0) {
            Some(conn) => Some(conn.as_mut()),
            None => None,
        }
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Deregister everything and refuse further polls.
    pub fn close(&mut self) {
        let keys: Vec<usize> = self.conns.keys().copied().collect();
        for key in keys {
            self.deregister(ConnKey(key));
        }
        self.listeners.clear();
        self.listener_keys.clear();
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::BufferedConnection;
    use std::io::Write;
    use std::net::TcpStream;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        server.set_nonblocking(true).expect("nonblocking");
        (server, client)
    }

    #[test]
    fn wake_interrupts_a_blocked_poll() {
        let mut el = EventLoop::new(1024).expect("event loop");
        let waker = el.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            waker.wake();
        });
        let start = std::time::Instant::now();
        el.poll(Some(Duration::from_secs(5))).expect("poll");
        assert!(start.elapsed() < Duration::from_secs(4), "wake was not observed");
        handle.join().expect("join");
    }

    #[test]
    fn readable_event_reaches_the_connection() {
        let mut el = EventLoop::new(1024).expect("event loop");
        let (server, mut client) = pair();
        let got = std::sync::Arc::new(std::sync::Mutex::new(0usize));
        let sink = std::sync::Arc::clone(&got);
        el.register(Box::new(BufferedConnection::new(
            server,
            Box::new(move |bytes| *sink.lock().expect("lock") += bytes.len()),
        )))
        .expect("register");

        client.write_all(b"ping").expect("client write");
        el.poll(Some(Duration::from_secs(2))).expect("poll");
        let accepts = el.handle_selected_keys();
        assert!(accepts.is_empty());
        assert_eq!(*got.lock().expect("lock"), 4);
    }

    #[test]
    fn queue_large_reflects_outbound_backlog() {
        let mut el = EventLoop::new(8).expect("event loop");
        let (server, _client) = pair();
        let mut conn = BufferedConnection::new(server, Box::new(|_| {}));
        conn.queue_bytes(&[0u8; 64]);
        el.register(Box::new(conn)).expect("register");
        assert!(el.is_queue_large());
        el.write();
        assert!(!el.is_queue_large());
    }

    #[test]
    fn close_refuses_further_polls() {
        let mut el = EventLoop::new(1024).expect("event loop");
        el.close();
        assert!(el.is_closed());
        assert!(el.poll(Some(Duration::ZERO)).is_err());
    }
}

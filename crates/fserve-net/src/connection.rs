//! Connection seam between the event loop and the wire protocol.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;

/// A registered client connection.
///
/// The event loop owns the readiness lifecycle: it calls
/// [`handle_readable`](Connection::handle_readable) when the socket has
/// inbound bytes and [`flush_outbound`](Connection::flush_outbound) to
/// drain queued responses. Protocol framing, handshakes, and response
/// encoding all live behind this trait.
pub trait Connection: Send {
    /// The underlying socket, used for poller registration.
    fn socket(&self) -> &TcpStream;

    /// Drain inbound bytes until the socket would block.
    ///
    /// Returning an error deregisters the connection.
    fn handle_readable(&mut self) -> io::Result<()>;

    /// Bytes currently queued for write.
    fn queued_outbound(&self) -> usize;

    /// Write queued bytes until the queue empties or the socket would
    /// block.
    fn flush_outbound(&mut self) -> io::Result<()>;

    /// Whether the peer has closed or the connection hit a fatal error.
    fn is_closed(&self) -> bool;
}

/// Read buffer size for one readable pass.
const READ_CHUNK: usize = 4096;

/// A [`Connection`] over a nonblocking [`TcpStream`] with an owned
/// outbound byte queue and an inbound-bytes callback.
///
/// Session-init tasks wrap the accepted socket in one of these; the
/// callback hands raw inbound bytes to the protocol layer.
pub struct BufferedConnection {
    stream: TcpStream,
    outbound: VecDeque<u8>,
    on_data: Box<dyn FnMut(&[u8]) + Send>,
    closed: bool,
}

impl BufferedConnection {
    /// Wrap `stream`, delivering inbound bytes to `on_data`.
    ///
    /// The stream must already be in nonblocking mode.
    pub fn new(stream: TcpStream, on_data: Box<dyn FnMut(&[u8]) + Send>) -> Self {
        Self {
            stream,
            outbound: VecDeque::new(),
            on_data,
            closed: false,
        }
    }

    /// Queue response bytes for the next write drain.
    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.outbound.extend(bytes);
    }
}

impl Connection for BufferedConnection {
    fn socket(&self) -> &TcpStream {
        &self.stream
    }

    fn handle_readable(&mut self) -> io::Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(());
                }
                Ok(n) => (self.on_data)(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.closed = true;
                    return Err(e);
                }
            }
        }
    }

    fn queued_outbound(&self) -> usize {
        self.outbound.len()
    }

    fn flush_outbound(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            let (front, _) = self.outbound.as_slices();
            match self.stream.write(front) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.closed = true;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    fn nonblocking_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        server.set_nonblocking(true).expect("nonblocking");
        client.set_nonblocking(true).expect("nonblocking");
        (server, client)
    }

    #[test]
    fn inbound_bytes_reach_the_callback() {
        let (server, mut client) = nonblocking_pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut conn = BufferedConnection::new(
            server,
            Box::new(move |bytes| sink.lock().expect("lock").extend_from_slice(bytes)),
        );

        client.set_nonblocking(false).expect("blocking client");
        client.write_all(b"hello scheduler").expect("write");
        // Give the kernel a moment to move the bytes across loopback.
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.handle_readable().expect("readable");
        assert_eq!(seen.lock().expect("lock").as_slice(), b"hello scheduler");
        assert!(!conn.is_closed());
    }

    #[test]
    fn flush_drains_the_outbound_queue() {
        let (server, mut client) = nonblocking_pair();
        let mut conn = BufferedConnection::new(server, Box::new(|_| {}));
        conn.queue_bytes(b"response");
        assert_eq!(conn.queued_outbound(), 8);
        conn.flush_outbound().expect("flush");
        assert_eq!(conn.queued_outbound(), 0);

        client.set_nonblocking(false).expect("blocking client");
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"response");
    }

    #[test]
    fn peer_close_marks_the_connection_closed() {
        let (server, client) = nonblocking_pair();
        let mut conn = BufferedConnection::new(server, Box::new(|_| {}));
        drop(client);
        std::thread::sleep(std::time::Duration::from_millis(20));
        conn.handle_readable().expect("readable after close");
        assert!(conn.is_closed());
    }
}

//! Completion facade over mio readiness.
//!
//! mio reports *readiness* (epoll on Linux, kqueue on macOS); connections
//! want *completions*. The proactor bridges the two. A single poller thread
//! owns the `Poll`, performs the non-blocking syscalls for posted operations
//! when their sockets turn ready, and publishes a [`Completion`] per finished
//! operation on a channel that any number of worker threads drain.
//!
//! Sockets are registered edge-triggered for both directions. Posting and
//! event handling run under the same lock, so a readiness edge is either
//! observed by the post (which tries the syscall immediately) or finds the
//! posted operation waiting for it.

use crate::error::TransportError;
use crate::runtime::{
    Completion, CompletionPayload, ConnectionSocket, ContextKey, Demultiplexer, IoBuffer,
    PostResult, Posted, Status, LISTENER_KEY,
};
use bytes::{Buf, Bytes, BytesMut};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const LISTENER: Token = Token(LISTENER_KEY);
const WAKER: Token = Token(usize::MAX - 1);

const EVENTS_CAPACITY: usize = 1024;
const LISTEN_BACKLOG: i32 = 1024;
/// Poll timeout while queued accepts are stuck behind a failed `accept`.
const ACCEPT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A send the socket could not take in one go.
struct PendingSend {
    buf: BytesMut,
    total: usize,
}

/// A registered connection socket and the operations posted on it.
struct Entry {
    stream: Arc<TcpStream>,
    epoch: u64,
    receive: Option<IoBuffer>,
    send: Option<PendingSend>,
}

struct State {
    listener: TcpListener,
    entries: HashMap<ContextKey, Entry>,
    /// Connections waiting for a peer, in the order their accepts were posted.
    accept_queue: VecDeque<ContextKey>,
    /// The last drain stopped on an error with accepts still queued. No new
    /// edge may arrive for peers already in the backlog, so the poller retries.
    accept_stalled: bool,
}

pub struct Proactor {
    poll: Mutex<Option<Poll>>,
    registry: Registry,
    waker: Waker,
    local_addr: SocketAddr,
    state: Mutex<State>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    /// Dropped on shutdown, which wakes every blocked worker.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    running: AtomicBool,
}

impl Proactor {
    /// Bind the listening socket and set up the poll instance.
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let listener =
            create_listener(addr).map_err(|source| TransportError::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr()?;
        registry
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|source| TransportError::Registration {
                key: LISTENER_KEY,
                source,
            })?;

        let (completions_tx, completions_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();

        Ok(Self {
            poll: Mutex::new(Some(poll)),
            registry,
            waker,
            local_addr,
            state: Mutex::new(State {
                listener,
                entries: HashMap::new(),
                accept_queue: VecDeque::new(),
                accept_stalled: false,
            }),
            completions_tx,
            completions_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            running: AtomicBool::new(true),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run the poll loop on the calling thread until [`shutdown`](Self::shutdown).
    pub fn run(&self) -> io::Result<()> {
        let mut poll = self.poll.lock().take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "poll loop already running")
        })?;
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        debug!(addr = %self.local_addr, "Poller started");

        while self.is_running() {
            let timeout = self.accept_stalled().then_some(ACCEPT_RETRY_INTERVAL);
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    LISTENER => self.drain_accepts(),
                    Token(key) => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.complete_receive(key);
                        }
                        if event.is_writable() || event.is_error() {
                            self.flush_send(key);
                        }
                    }
                }
            }

            if self.accept_stalled() {
                self.drain_accepts();
            }
        }

        debug!("Poller stopped");
        Ok(())
    }

    /// Stop the poll loop and release every thread blocked in `await_completion`.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.lock().take();
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake poller");
        }
    }

    fn complete(&self, completion: Completion) {
        if self.completions_tx.send(completion).is_err() {
            debug!("Completion dropped, queue closed");
        }
    }

    fn accept_stalled(&self) -> bool {
        self.state.lock().accept_stalled
    }

    fn drain_accepts(&self) {
        let mut state = self.state.lock();
        state.accept_stalled = false;
        while let Some(&conn) = state.accept_queue.front() {
            match state.listener.accept() {
                Ok((stream, peer)) => {
                    state.accept_queue.pop_front();
                    trace!(conn_id = conn, peer = %peer, "Accepted");
                    self.complete(accepted(conn, stream, peer));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e)
                    if e.kind() == io::ErrorKind::Interrupted
                        || e.kind() == io::ErrorKind::ConnectionAborted =>
                {
                    continue
                }
                Err(e) => {
                    warn!(error = %e, queued = state.accept_queue.len(), "Accept failed, will retry");
                    state.accept_stalled = true;
                    break;
                }
            }
        }
    }

    fn complete_receive(&self, key: ContextKey) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&key) else {
            return;
        };
        let Some(mut buffer) = entry.receive.take() else {
            return;
        };

        let (bytes, status) = match read_into(&entry.stream, &mut buffer) {
            Ok(n) => (n, Status::Success),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                entry.receive = Some(buffer);
                return;
            }
            Err(e) => (0, Status::Failed(e)),
        };
        let epoch = entry.epoch;
        drop(state);

        trace!(conn_id = key, bytes, "Receive completed");
        self.complete(Completion {
            key,
            conn: key,
            epoch,
            bytes,
            status,
            payload: CompletionPayload::Received(buffer),
        });
    }

    fn flush_send(&self, key: ContextKey) {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&key) else {
            return;
        };
        let Some(mut pending) = entry.send.take() else {
            return;
        };

        let status = match write_from(&entry.stream, &mut pending.buf) {
            Ok(()) if pending.buf.is_empty() => Status::Success,
            Ok(()) => {
                entry.send = Some(pending);
                return;
            }
            Err(e) => Status::Failed(e),
        };
        let epoch = entry.epoch;
        drop(state);

        self.complete(Completion {
            key,
            conn: key,
            epoch,
            bytes: pending.total,
            status,
            payload: CompletionPayload::Sent,
        });
    }
}

impl Demultiplexer for Proactor {
    fn register(
        &self,
        key: ContextKey,
        epoch: u64,
        socket: &ConnectionSocket,
    ) -> Result<(), TransportError> {
        let stream = socket.handle().ok_or_else(|| TransportError::Registration {
            key,
            source: io::Error::from(io::ErrorKind::NotConnected),
        })?;

        let mut state = self.state.lock();
        if let Some(old) = state.entries.remove(&key) {
            debug!(conn_id = key, epoch = old.epoch, "Replacing stale registration");
            let fd = old.stream.as_raw_fd();
            let _ = self.registry.deregister(&mut SourceFd(&fd));
        }

        let fd = stream.as_raw_fd();
        self.registry
            .register(
                &mut SourceFd(&fd),
                Token(key),
                Interest::READABLE | Interest::WRITABLE,
            )
            .map_err(|source| TransportError::Registration { key, source })?;

        state.entries.insert(
            key,
            Entry {
                stream,
                epoch,
                receive: None,
                send: None,
            },
        );
        Ok(())
    }

    fn post_accept(&self, conn: ContextKey) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.accept_queue.is_empty() {
            loop {
                match state.listener.accept() {
                    Ok((stream, peer)) => {
                        drop(state);
                        self.complete(accepted(conn, stream, peer));
                        return Ok(());
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e)
                        if e.kind() == io::ErrorKind::Interrupted
                            || e.kind() == io::ErrorKind::ConnectionAborted => {}
                    Err(e) => {
                        state.accept_queue.push_back(conn);
                        state.accept_stalled = true;
                        drop(state);
                        // Let the poller pick up the retry timeout.
                        if let Err(wake) = self.waker.wake() {
                            warn!(error = %wake, "Failed to wake poller");
                        }
                        return Err(e);
                    }
                }
            }
        }
        state.accept_queue.push_back(conn);
        Ok(())
    }

    fn post_receive(&self, key: ContextKey, mut buffer: IoBuffer) -> PostResult {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&key) else {
            return PostResult::Failed {
                error: io::Error::from(io::ErrorKind::NotConnected),
                buffer,
            };
        };
        if entry.receive.is_some() {
            return PostResult::Failed {
                error: io::Error::new(io::ErrorKind::Other, "receive already outstanding"),
                buffer,
            };
        }

        match read_into(&entry.stream, &mut buffer) {
            Ok(bytes) => PostResult::Ready { bytes, buffer },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                entry.receive = Some(buffer);
                PostResult::Pending
            }
            Err(error) => PostResult::Failed { error, buffer },
        }
    }

    fn post_send(&self, key: ContextKey, data: Bytes) -> io::Result<Posted> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&key)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        // Keep ordering behind a send that is still draining.
        if let Some(pending) = entry.send.as_mut() {
            pending.buf.extend_from_slice(&data);
            pending.total += data.len();
            return Ok(Posted::Pending);
        }

        let total = data.len();
        let mut buf = BytesMut::from(&data[..]);
        write_from(&entry.stream, &mut buf)?;
        if buf.is_empty() {
            trace!(conn_id = key, bytes = total, "Send completed synchronously");
            return Ok(Posted::Completed);
        }

        entry.send = Some(PendingSend { buf, total });
        Ok(Posted::Pending)
    }

    fn post_disconnect(&self, key: ContextKey) -> io::Result<Posted> {
        let entry = self.state.lock().entries.remove(&key);
        let Some(entry) = entry else {
            return Ok(Posted::Completed);
        };

        let fd = entry.stream.as_raw_fd();
        if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
            debug!(conn_id = key, error = %e, "Deregister failed");
        }
        match entry.stream.shutdown(Shutdown::Both) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => return Err(e),
        }
        Ok(Posted::Completed)
    }

    fn await_completion(&self) -> Option<Completion> {
        if !self.is_running() {
            return None;
        }
        select! {
            recv(self.completions_rx) -> completion => completion.ok(),
            recv(self.shutdown_rx) -> _ => None,
        }
    }
}

impl std::fmt::Debug for Proactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proactor")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

fn accepted(conn: ContextKey, stream: TcpStream, peer: SocketAddr) -> Completion {
    Completion {
        key: LISTENER_KEY,
        conn,
        epoch: 0,
        bytes: 0,
        status: Status::Success,
        payload: CompletionPayload::Accepted { stream, peer },
    }
}

fn read_into(stream: &TcpStream, buffer: &mut IoBuffer) -> io::Result<usize> {
    loop {
        match (&*stream).read(buffer.as_mut_slice()) {
            Ok(n) => {
                buffer.set_filled(n);
                return Ok(n);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write until `buf` is drained or the socket would block.
fn write_from(stream: &TcpStream, buf: &mut BytesMut) -> io::Result<()> {
    while !buf.is_empty() {
        match (&*stream).write(buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => buf.advance(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Create a reusable, non-blocking listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn loopback() -> Arc<Proactor> {
        Arc::new(Proactor::bind("127.0.0.1:0".parse().unwrap()).unwrap())
    }

    fn spawn_poller(proactor: &Arc<Proactor>) -> thread::JoinHandle<()> {
        let proactor = Arc::clone(proactor);
        thread::spawn(move || proactor.run().unwrap())
    }

    /// Accept one peer for `conn` and register it.
    fn connect_peer(proactor: &Proactor, conn: ContextKey) -> (ConnectionSocket, std::net::TcpStream) {
        let client = std::net::TcpStream::connect(proactor.local_addr()).unwrap();
        proactor.post_accept(conn).unwrap();
        let completion = proactor.await_completion().unwrap();
        assert_eq!(completion.key, LISTENER_KEY);
        assert_eq!(completion.conn, conn);
        let CompletionPayload::Accepted { stream, .. } = completion.payload else {
            panic!("expected accepted payload");
        };
        let socket = ConnectionSocket::create(conn, false);
        socket.adopt(stream).unwrap();
        proactor.register(conn, 1, &socket).unwrap();
        (socket, client)
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let proactor = loopback();
        assert_ne!(proactor.local_addr().port(), 0);
        assert!(proactor.is_running());
    }

    #[test]
    fn test_pending_receive_completes_on_data() {
        let proactor = loopback();
        let poller = spawn_poller(&proactor);
        let (_socket, mut client) = connect_peer(&proactor, 4);

        let result = proactor.post_receive(4, IoBuffer::with_capacity(64));
        assert!(matches!(result, PostResult::Pending));

        client.write_all(b"PING\r\n.\r\n").unwrap();

        let completion = proactor.await_completion().unwrap();
        assert_eq!(completion.conn, 4);
        assert_eq!(completion.epoch, 1);
        assert!(matches!(completion.status, Status::Success));
        let CompletionPayload::Received(buffer) = completion.payload else {
            panic!("expected received payload");
        };
        assert_eq!(buffer.filled(), b"PING\r\n.\r\n");

        proactor.shutdown();
        poller.join().unwrap();
    }

    #[test]
    fn test_receive_is_immediate_when_data_waits() {
        let proactor = loopback();
        let (_socket, mut client) = connect_peer(&proactor, 0);

        client.write_all(b"hello").unwrap();
        thread::sleep(Duration::from_millis(50));

        match proactor.post_receive(0, IoBuffer::with_capacity(64)) {
            PostResult::Ready { bytes, buffer } => {
                assert_eq!(bytes, 5);
                assert_eq!(buffer.filled(), b"hello");
            }
            other => panic!("expected immediate data, got {other:?}"),
        }
    }

    #[test]
    fn test_send_and_disconnect() {
        let proactor = loopback();
        let (socket, mut client) = connect_peer(&proactor, 2);

        let posted = proactor
            .post_send(2, Bytes::from_static(b"PONG\r\n.\r\n"))
            .unwrap();
        assert_eq!(posted, Posted::Completed);

        let mut reply = [0u8; 9];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"PONG\r\n.\r\n");

        assert_eq!(proactor.post_disconnect(2).unwrap(), Posted::Completed);
        socket.close();

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).unwrap(), 0);

        // Unknown keys are already disconnected
        assert_eq!(proactor.post_disconnect(2).unwrap(), Posted::Completed);
    }

    #[test]
    fn test_receive_on_unregistered_key_fails() {
        let proactor = loopback();
        let result = proactor.post_receive(9, IoBuffer::with_capacity(8));
        assert!(matches!(result, PostResult::Failed { .. }));
        assert!(proactor.post_send(9, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_queued_accepts_complete_in_order() {
        let proactor = loopback();
        let poller = spawn_poller(&proactor);

        proactor.post_accept(0).unwrap();
        proactor.post_accept(1).unwrap();

        let _a = std::net::TcpStream::connect(proactor.local_addr()).unwrap();
        let first = proactor.await_completion().unwrap();
        let _b = std::net::TcpStream::connect(proactor.local_addr()).unwrap();
        let second = proactor.await_completion().unwrap();

        assert_eq!(first.conn, 0);
        assert_eq!(second.conn, 1);

        proactor.shutdown();
        poller.join().unwrap();
    }

    #[test]
    fn test_stalled_accept_is_retried_without_new_peer() {
        let proactor = loopback();
        let poller = spawn_poller(&proactor);

        // The peer's readiness edge is consumed while no accept is queued.
        let _peer = std::net::TcpStream::connect(proactor.local_addr()).unwrap();
        thread::sleep(Duration::from_millis(50));

        // Same state a failed accept (EMFILE and the like) leaves behind.
        {
            let mut state = proactor.state.lock();
            state.accept_queue.push_back(3);
            state.accept_stalled = true;
        }
        proactor.waker.wake().unwrap();

        let completion = proactor.await_completion().unwrap();
        assert_eq!(completion.conn, 3);
        assert!(matches!(completion.payload, CompletionPayload::Accepted { .. }));
        assert!(!proactor.accept_stalled());

        proactor.shutdown();
        poller.join().unwrap();
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let proactor = loopback();
        let waiter = {
            let proactor = Arc::clone(&proactor);
            thread::spawn(move || proactor.await_completion().is_none())
        };

        thread::sleep(Duration::from_millis(20));
        proactor.shutdown();
        assert!(waiter.join().unwrap());
        assert!(!proactor.is_running());
    }
}

//! Connection state machine driven by completion events.
//!
//! ```text
//! Idle ──accept queued──> Accepting ──peer accepted──> Connected
//!  ^                                                   │     ^
//!  │                                        receive    v     │ data
//!  └── disconnect done ── Disconnecting <── reset ── Receiving
//! ```
//!
//! Each connection has at most one outstanding receive, so completions for
//! the same connection never race each other. The only cell that can be hit
//! concurrently is `connected`, which `reset` flips with a single
//! compare-exchange so a late completion cannot close the connection twice.

use crate::error::ResponseError;
use crate::runtime::{
    is_peer_reset, BufferPool, Completion, CompletionPayload, ConnectionSocket, ContextKey,
    Demultiplexer, IoBuffer, PostResult, Posted, Status,
};
use crate::server::{EventHandler, Responder};
use crate::stream::ByteStream;
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// No socket; reusable.
    Idle = 0,
    /// An accept has been queued on this connection's behalf.
    Accepting = 1,
    Connected = 2,
    /// A receive is outstanding.
    Receiving = 3,
    /// Disconnect issued, waiting for the socket to be released.
    Disconnecting = 4,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnState::Accepting,
            2 => ConnState::Connected,
            3 => ConnState::Receiving,
            4 => ConnState::Disconnecting,
            _ => ConnState::Idle,
        }
    }
}

/// Receive-side state. Only touched by the thread handling this
/// connection's current completion, so the lock is uncontended.
struct IoState {
    /// Buffer for the next receive; `None` while one is outstanding.
    buffer: Option<IoBuffer>,
    receiving: bool,
    stream: ByteStream,
}

pub struct Connection {
    id: ContextKey,
    socket: ConnectionSocket,
    connected: AtomicBool,
    authenticated: AtomicBool,
    state: AtomicU8,
    /// Bumped each time a socket is adopted; completions from older
    /// registrations are stale.
    epoch: AtomicU64,
    io: Mutex<IoState>,
    buffers: Arc<BufferPool>,
    demux: Arc<dyn Demultiplexer>,
    handler: Arc<dyn EventHandler>,
    responder: Arc<dyn Responder>,
}

impl Connection {
    pub fn new(
        socket: ConnectionSocket,
        buffers: Arc<BufferPool>,
        demux: Arc<dyn Demultiplexer>,
        handler: Arc<dyn EventHandler>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        let buffer = buffers.acquire();
        Self {
            id: socket.key(),
            socket,
            connected: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            state: AtomicU8::new(ConnState::Idle as u8),
            epoch: AtomicU64::new(0),
            io: Mutex::new(IoState {
                buffer: Some(buffer),
                receiving: false,
                stream: ByteStream::new(),
            }),
            buffers,
            demux,
            handler,
            responder,
        }
    }

    pub fn id(&self) -> ContextKey {
        self.id
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn socket(&self) -> &ConnectionSocket {
        &self.socket
    }

    /// Record that an accept was queued for this connection.
    pub fn accept_queued(&self) {
        let _ = self.state.compare_exchange(
            ConnState::Idle as u8,
            ConnState::Accepting as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Central transition function.
    pub fn on_completion(&self, completion: Completion) {
        let Completion {
            key,
            epoch,
            bytes,
            status,
            payload,
            ..
        } = completion;

        // Signals on the listener's context mean a peer was accepted for us.
        if key != self.id {
            match payload {
                CompletionPayload::Accepted { stream, peer } => self.handle_connection(stream, peer),
                other => {
                    warn!(conn_id = self.id, key, "Unexpected completion on foreign context");
                    self.reclaim(other);
                }
            }
            return;
        }

        match status {
            Status::Success => match payload {
                CompletionPayload::Accepted { stream, peer } => {
                    // Deferred completion of the initial accept.
                    if self.is_connected() {
                        warn!(conn_id = self.id, peer = %peer, "Accept completed on a connected socket");
                    } else {
                        self.handle_connection(stream, peer);
                    }
                }
                CompletionPayload::Disconnected => self.finish_disconnect(),
                CompletionPayload::Sent => trace!(conn_id = self.id, bytes, "Response sent"),
                CompletionPayload::Received(buffer) => {
                    if !self.receive_is_current(epoch) {
                        self.reclaim_buffer(buffer);
                        return;
                    }
                    self.end_receive();
                    if bytes == 0 {
                        debug!(conn_id = self.id, "Connection closed by peer");
                        self.reclaim_buffer(buffer);
                        self.reset();
                        return;
                    }
                    self.set_state(ConnState::Connected);
                    if self.absorb(buffer, epoch) {
                        self.prepare_to_receive();
                    }
                }
            },
            Status::Incomplete => {
                // Still pending. Once connected, drain whatever the OS
                // already reported before re-arming.
                if let CompletionPayload::Received(buffer) = payload {
                    if !self.receive_is_current(epoch) {
                        self.reclaim_buffer(buffer);
                        return;
                    }
                    self.end_receive();
                    self.set_state(ConnState::Connected);
                    let current = if bytes > 0 {
                        self.absorb(buffer, epoch)
                    } else {
                        self.reclaim_buffer(buffer);
                        true
                    };
                    if current {
                        self.prepare_to_receive();
                    }
                }
            }
            Status::Failed(e) => match payload {
                CompletionPayload::Sent => {
                    self.responder
                        .handle_error_sending_response(&ResponseError::Send(e));
                }
                CompletionPayload::Disconnected => {
                    self.socket.close();
                    self.handler.report_error(&format!(
                        "disconnect failed on connection {}: {}",
                        self.id, e
                    ));
                    self.finish_disconnect();
                }
                other => {
                    if let CompletionPayload::Received(buffer) = other {
                        if !self.receive_is_current(epoch) {
                            self.reclaim_buffer(buffer);
                            return;
                        }
                        self.end_receive();
                        self.reclaim_buffer(buffer);
                    }
                    self.fail(e);
                }
            },
        }
    }

    /// Adopt the accepted socket and arm the first receive.
    fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if self.is_connected() {
            warn!(conn_id = self.id, peer = %peer, "Dropping peer accepted for a busy connection");
            return;
        }

        if let Err(e) = self.socket.adopt(stream) {
            error!(conn_id = self.id, error = %e, "Failed to adopt accepted socket");
            self.handler.report_error(&e.to_string());
            self.finish_disconnect();
            return;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if let Err(e) = self.demux.register(self.id, epoch, &self.socket) {
            error!(conn_id = self.id, error = %e, "Failed to register socket");
            self.handler.report_error(&e.to_string());
            self.finish_disconnect();
            return;
        }

        {
            let mut io = self.io.lock();
            io.stream = ByteStream::new();
            io.receiving = false;
        }
        self.authenticated.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        self.set_state(ConnState::Connected);

        debug!(conn_id = self.id, peer = %peer, epoch, "Connection established");

        // A new peer is expected to talk first.
        self.prepare_to_receive();
    }

    /// Post a receive, draining any data the OS hands back synchronously.
    pub fn prepare_to_receive(&self) {
        let epoch = self.epoch();
        loop {
            let buffer = {
                let mut io = self.io.lock();
                if io.receiving {
                    trace!(conn_id = self.id, "Receive already outstanding");
                    return;
                }
                io.receiving = true;
                io.buffer.take().unwrap_or_else(|| self.buffers.acquire())
            };

            if !self.is_current(epoch) {
                self.end_receive();
                self.reclaim_buffer(buffer);
                return;
            }

            self.set_state(ConnState::Receiving);
            match self.demux.post_receive(self.id, buffer) {
                PostResult::Pending => return,
                PostResult::Ready { bytes: 0, buffer } => {
                    self.end_receive();
                    self.reclaim_buffer(buffer);
                    debug!(conn_id = self.id, "Connection closed by peer");
                    self.reset();
                    return;
                }
                PostResult::Ready { bytes, buffer } => {
                    trace!(conn_id = self.id, bytes, "Receive completed synchronously");
                    self.end_receive();
                    self.set_state(ConnState::Connected);
                    if !self.absorb(buffer, epoch) {
                        return;
                    }
                }
                PostResult::Failed { error, buffer } => {
                    self.end_receive();
                    self.reclaim_buffer(buffer);
                    if self.is_current(epoch) {
                        self.fail(error);
                    }
                    return;
                }
            }
        }
    }

    /// Close the connection once: disconnect the socket and tell the responder.
    ///
    /// A second or concurrent call is a no-op.
    pub fn reset(&self) {
        if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.set_state(ConnState::Disconnecting);
        {
            let mut io = self.io.lock();
            io.stream = ByteStream::new();
            io.receiving = false;
        }
        self.authenticated.store(false, Ordering::Release);

        let posted = self.socket.disconnect(&*self.demux, &*self.handler);
        self.responder.handle_connection_closed(self.id);

        match posted {
            Some(Posted::Pending) => {}
            Some(Posted::Completed) | None => self.finish_disconnect(),
        }
    }

    /// Socket released: back to `Idle` and ask for the next peer.
    fn finish_disconnect(&self) {
        self.socket.close();
        self.set_state(ConnState::Idle);
        debug!(conn_id = self.id, "Connection idle");
        self.handler.queue_accept(self);
    }

    fn fail(&self, error: std::io::Error) {
        if is_peer_reset(&error) {
            debug!(conn_id = self.id, error = %error, "Connection reset by peer");
        } else {
            error!(conn_id = self.id, error = %error, "Receive failed");
            self.handler
                .report_error(&format!("receive failed on connection {}: {}", self.id, error));
        }
        self.reset();
    }

    /// Move received bytes into the accumulator and forward what it holds.
    ///
    /// Returns `false` once the session that received the bytes is over. A
    /// forwarded message can reset the connection and a new peer can be
    /// adopted before the rest are forwarded; those belong to the old peer and
    /// are dropped.
    fn absorb(&self, buffer: IoBuffer, epoch: u64) -> bool {
        let mut messages = Vec::new();
        {
            let mut io = self.io.lock();
            let mut chunk = buffer.filled();
            while !chunk.is_empty() {
                let consumed = io.stream.append(chunk);
                chunk = &chunk[consumed..];
                if io.stream.has_eof() {
                    messages.push(io.stream.take());
                } else {
                    messages.push(io.stream.clone());
                }
            }
        }
        self.reclaim_buffer(buffer);

        for message in messages {
            if !self.is_current(epoch) {
                trace!(conn_id = self.id, epoch, "Dropping messages from a closed session");
                return false;
            }
            self.forward(message);
        }
        self.is_current(epoch)
    }

    /// Whether `epoch` is still the live session.
    fn is_current(&self, epoch: u64) -> bool {
        self.is_connected() && self.epoch() == epoch
    }

    fn forward(&self, message: ByteStream) {
        if message.has_eof()
            && self.responder.requires_authentication()
            && !self.authenticated.load(Ordering::Acquire)
        {
            if self.responder.authenticate_connection(&message) {
                self.authenticated.store(true, Ordering::Release);
                debug!(conn_id = self.id, "Connection authenticated");
                let mut ack = ByteStream::new();
                ack.append_eof();
                if let Err(e) = self.demux.post_send(self.id, ack.to_wire()) {
                    self.responder
                        .handle_error_sending_response(&ResponseError::Send(e));
                }
            } else {
                warn!(conn_id = self.id, "Authentication rejected");
                self.reset();
            }
            return;
        }

        self.handler.handle_response(self.id, message);
    }

    fn receive_is_current(&self, epoch: u64) -> bool {
        let current = self.is_current(epoch);
        if !current {
            trace!(conn_id = self.id, epoch, "Discarding stale receive");
        }
        current
    }

    fn end_receive(&self) {
        self.io.lock().receiving = false;
    }

    fn reclaim(&self, payload: CompletionPayload) {
        if let CompletionPayload::Received(buffer) = payload {
            self.reclaim_buffer(buffer);
        }
    }

    fn reclaim_buffer(&self, mut buffer: IoBuffer) {
        buffer.clear();
        let mut io = self.io.lock();
        if io.buffer.is_none() {
            io.buffer = Some(buffer);
        } else {
            drop(io);
            self.buffers.release(buffer);
        }
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .field("epoch", &self.epoch())
            .finish()
    }
}

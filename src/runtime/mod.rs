//! Completion-driven connection runtime.
//!
//! Operations are *posted* with the resources they need (a receive owns its
//! buffer, a send owns its bytes) and finish later as a [`Completion`] pulled
//! by worker threads. Shared pieces:
//! - `IoBuffer` / `BufferPool`: buffers owned by in-flight operations
//! - `ConnectionSocket`: one adoptable, reusable socket handle
//! - `Connection`: per-connection state machine driven by completions
//! - `Proactor`: completion facade over mio readiness (epoll/kqueue)

mod buffer;
mod connection;
mod proactor;
mod socket;

pub use buffer::{BufferPool, IoBuffer};
pub use connection::{ConnState, Connection};
pub use proactor::Proactor;
pub use socket::ConnectionSocket;

use crate::error::TransportError;
use bytes::Bytes;
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;

/// Key a completion is delivered under. Connections use their table index.
pub type ContextKey = usize;

/// Context key of the listening socket.
pub const LISTENER_KEY: ContextKey = usize::MAX;

/// Outcome reported with a completion.
#[derive(Debug)]
pub enum Status {
    Success,
    /// The operation has not finished yet; not an error.
    Incomplete,
    Failed(io::Error),
}

/// The operation a completion belongs to, carrying back whatever it owned.
#[derive(Debug)]
pub enum CompletionPayload {
    /// A peer was accepted for the connection that queued the accept.
    Accepted { stream: TcpStream, peer: SocketAddr },
    /// A receive finished; the buffer returns to its owner.
    Received(IoBuffer),
    Sent,
    Disconnected,
}

/// A finished operation, as pulled from [`Demultiplexer::await_completion`].
#[derive(Debug)]
pub struct Completion {
    /// Context the completion arrived on: [`LISTENER_KEY`] for accepts.
    pub key: ContextKey,
    /// Connection the operation was posted for.
    pub conn: ContextKey,
    /// Registration epoch of the socket when the operation was posted.
    pub epoch: u64,
    pub bytes: usize,
    pub status: Status,
    pub payload: CompletionPayload,
}

/// Result of posting a receive.
///
/// Some platforms deliver data synchronously even for an asynchronous call,
/// so a post can finish on the spot.
#[derive(Debug)]
pub enum PostResult {
    /// Queued; a completion will follow.
    Pending,
    /// Finished immediately. `bytes == 0` means the peer closed.
    Ready { bytes: usize, buffer: IoBuffer },
    Failed { error: io::Error, buffer: IoBuffer },
}

/// Whether a posted operation already finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Posted {
    Completed,
    Pending,
}

/// OS completion-event delivery consumed by the connection state machine.
///
/// Implementations may sit on a real completion queue or emulate one over a
/// readiness primitive.
pub trait Demultiplexer: Send + Sync {
    /// Bind a connected socket to the queue under `key`.
    fn register(
        &self,
        key: ContextKey,
        epoch: u64,
        socket: &ConnectionSocket,
    ) -> Result<(), TransportError>;

    /// Ask for the next inbound connection to be handed to `conn`.
    ///
    /// An error reports a failed attempt; the accept stays queued and is
    /// retried.
    fn post_accept(&self, conn: ContextKey) -> io::Result<()>;

    fn post_receive(&self, key: ContextKey, buffer: IoBuffer) -> PostResult;

    fn post_send(&self, key: ContextKey, data: Bytes) -> io::Result<Posted>;

    /// Disconnect the socket and release its registration so it can be reused.
    fn post_disconnect(&self, key: ContextKey) -> io::Result<Posted>;

    /// Block until a completion is available. `None` once shut down.
    fn await_completion(&self) -> Option<Completion>;
}

/// Errors that mean the peer went away rather than a local fault.
pub(crate) fn is_peer_reset(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

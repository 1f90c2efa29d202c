//! Error types for the transport, the client pipeline and responders.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Setup and transport faults on the server side.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The OS could not allocate or configure a socket handle.
    #[error("socket creation error: {0}")]
    SocketCreation(#[source] io::Error),

    /// The completion queue refused a socket (duplicate key, invalid handle).
    #[error("failed to register context {key} with the completion queue: {source}")]
    Registration {
        key: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure delivered through a request's future.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is disconnected")]
    Disconnected,

    /// The request was queued behind one that failed and tore the connection down.
    #[error("connection lost before the request was sent")]
    ConnectionLost,

    #[error("failed to send complete message: wrote {written} of {expected} bytes")]
    IncompleteSend { written: usize, expected: usize },

    #[error("received no data, disconnected from server")]
    NoResponse,

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("failed to resolve address: {0}")]
    ResolveAddress(String),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("authentication rejected by server")]
    AuthenticationFailed,

    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Failure producing or sending a server response.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("responder rejected request: {0}")]
    Rejected(String),

    #[error("failed to send response: {0}")]
    Send(#[source] io::Error),
}

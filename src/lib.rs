//! quicktcp: asynchronous TCP client/server transport.
//!
//! Messages are arbitrary payloads terminated by an explicit end-of-message
//! marker ([`stream::END_OF_MESSAGE`]).
//!
//! - [`server`]: fixed table of completion-driven connections served by
//!   worker threads, with application logic behind a [`server::Responder`]
//! - [`client`]: pipelined request/response client with futures as
//!   completion signals
//! - [`runtime`]: the completion facade and connection state machine

pub mod client;
pub mod config;
pub mod error;
pub mod responders;
pub mod runtime;
pub mod server;
pub mod stream;

pub use client::{Client, ServerInfo};
pub use config::Config;
pub use error::{ClientError, ResponseError, TransportError};
pub use server::{Responder, Server};
pub use stream::{ByteStream, END_OF_MESSAGE};

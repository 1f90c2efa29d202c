//! Client-side collaborators: response decoding and connection handshake.

use crate::error::ClientError;
use crate::stream::ByteStream;
use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tracing::warn;

/// Turns raw responses into results and hears about connection failures.
pub trait Processor: Send + Sync + 'static {
    type Output: Send + 'static;

    fn decode(&self, response: ByteStream) -> Result<Self::Output, ClientError>;

    fn handle_error_resolve_address(&self, message: &str) {
        warn!(error = message, "Failed to resolve server address");
    }

    fn handle_error_connect(&self, message: &str) {
        warn!(error = message, "Failed to connect to server");
    }
}

/// Runs once on a freshly connected socket before it is used for requests.
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(&'a self, stream: &'a mut TcpStream) -> BoxFuture<'a, bool>;
}

/// Hands back the raw response.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamProcessor;

impl Processor for StreamProcessor {
    type Output = ByteStream;

    fn decode(&self, response: ByteStream) -> Result<ByteStream, ClientError> {
        Ok(response)
    }
}

/// Decodes the response payload as UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Processor;

impl Processor for Utf8Processor {
    type Output = String;

    fn decode(&self, response: ByteStream) -> Result<String, ClientError> {
        String::from_utf8(response.as_bytes().to_vec())
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

//! One logical request/response exchange.
//!
//! The exchange is an explicit state machine:
//!
//! ```text
//! Queued ──begin──> Sending ──on_sent(all)──> Receiving ──marker / eof──> Completed
//!                      │                        │    ^
//!                      └── short write ──┐      └────┘ more data
//!                                        v
//!                                      Failed  <── transport error / no data
//! ```
//!
//! Each transition returns the [`Step`] the driver must take next, so the
//! driver only performs I/O and feeds the results back in.

use crate::error::ClientError;
use crate::stream::ByteStream;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Sending,
    Receiving,
    Completed,
    Failed,
}

/// Next action for the driver.
#[derive(Debug)]
pub enum Step {
    /// Write the payload in a single send.
    Send(Bytes),
    /// Read the next chunk.
    Receive,
    /// Response complete; decode and resolve.
    Complete(ByteStream),
    Fail(ClientError),
}

pub struct PendingRequest<T> {
    payload: Bytes,
    response: ByteStream,
    /// Wire bytes received so far, marker included.
    received: usize,
    state: RequestState,
    reply: oneshot::Sender<Result<T, ClientError>>,
}

impl<T> PendingRequest<T> {
    /// Create a request and the future it resolves. The payload is
    /// terminated with the end-of-message marker if it is not already.
    pub fn new(mut payload: ByteStream) -> (Self, ResponseFuture<T>) {
        payload.append_eof();
        let (reply, rx) = oneshot::channel();
        let request = Self {
            payload: payload.to_wire(),
            response: ByteStream::new(),
            received: 0,
            state: RequestState::Queued,
            reply,
        };
        (request, ResponseFuture { rx })
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Wire bytes this request sends.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn begin(&mut self) -> Step {
        self.state = RequestState::Sending;
        Step::Send(self.payload.clone())
    }

    /// A send finished. Anything short of the whole payload is fatal.
    pub fn on_sent(&mut self, written: usize) -> Step {
        let expected = self.payload.len();
        if written != expected {
            return self.on_error(ClientError::IncompleteSend { written, expected });
        }
        trace!(bytes = written, "Request sent");
        self.state = RequestState::Receiving;
        Step::Receive
    }

    /// A read finished. An empty chunk means the server closed the stream.
    pub fn on_received(&mut self, chunk: &[u8]) -> Step {
        if chunk.is_empty() {
            if self.received == 0 {
                return self.on_error(ClientError::NoResponse);
            }
            // End of stream terminates the response as well as the marker.
            return self.finish();
        }

        self.received += chunk.len();
        let consumed = self.response.append(chunk);
        if consumed < chunk.len() {
            warn!(
                bytes = chunk.len() - consumed,
                "Discarding bytes received after end of response"
            );
        }

        if self.response.has_eof() {
            self.finish()
        } else {
            Step::Receive
        }
    }

    pub fn on_error(&mut self, error: ClientError) -> Step {
        self.state = RequestState::Failed;
        Step::Fail(error)
    }

    fn finish(&mut self) -> Step {
        self.state = RequestState::Completed;
        Step::Complete(self.response.take())
    }

    /// Resolve the request's future.
    pub fn resolve(self, result: Result<T, ClientError>) {
        // The caller may have dropped its future.
        let _ = self.reply.send(result);
    }
}

impl<T> std::fmt::Debug for PendingRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("state", &self.state)
            .field("payload_len", &self.payload.len())
            .field("received", &self.received)
            .finish()
    }
}

/// Completion signal for one request.
///
/// Await it from async code, or call [`wait`](Self::wait) from a plain thread.
#[must_use = "a response future does nothing unless awaited or waited on"]
pub struct ResponseFuture<T> {
    rx: oneshot::Receiver<Result<T, ClientError>>,
}

impl<T> ResponseFuture<T> {
    /// A future that is already resolved with `error`.
    pub fn failed(error: ClientError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self { rx }
    }

    /// Block the current thread until the response arrives.
    ///
    /// # Panics
    /// Panics if called from within an asynchronous execution context.
    pub fn wait(self) -> Result<T, ClientError> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(ClientError::Disconnected))
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ClientError::Disconnected)))
    }
}

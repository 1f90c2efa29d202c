//! Collaborator interfaces consumed by the connection state machine.

use crate::error::ResponseError;
use crate::runtime::{Connection, ContextKey};
use crate::stream::ByteStream;

/// Server-side sink for connection events.
pub trait EventHandler: Send + Sync {
    /// Arm `conn` for the next inbound peer.
    fn queue_accept(&self, conn: &Connection);

    /// Called after every chunk with a snapshot of the accumulated message.
    ///
    /// Snapshots without `eof` are partial; the final one for each message
    /// has `eof` set and no longer includes the marker.
    fn handle_response(&self, conn: ContextKey, stream: ByteStream);

    fn report_error(&self, message: &str);
}

/// Application logic that turns requests into responses.
pub trait Responder: Send + Sync {
    /// Whether each connection must authenticate with its first message.
    fn requires_authentication(&self) -> bool {
        false
    }

    fn authenticate_connection(&self, _stream: &ByteStream) -> bool {
        true
    }

    fn respond(&self, request: ByteStream) -> Result<ByteStream, ResponseError>;

    fn handle_error_sending_response(&self, error: &ResponseError);

    /// Called exactly once per connection teardown.
    fn handle_connection_closed(&self, _conn: ContextKey) {}
}

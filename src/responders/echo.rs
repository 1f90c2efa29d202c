//! Echo responder.

use crate::error::ResponseError;
use crate::runtime::ContextKey;
use crate::server::Responder;
use crate::stream::ByteStream;
use tracing::{debug, warn};

/// Replies with the request payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoResponder;

impl Responder for EchoResponder {
    fn respond(&self, request: ByteStream) -> Result<ByteStream, ResponseError> {
        Ok(ByteStream::from_payload(request.into_bytes()))
    }

    fn handle_error_sending_response(&self, error: &ResponseError) {
        warn!(error = %error, "Failed to send echo");
    }

    fn handle_connection_closed(&self, conn: ContextKey) {
        debug!(conn_id = conn, "Echo connection closed");
    }
}

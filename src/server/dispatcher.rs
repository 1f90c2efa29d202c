//! Default event handler: routes complete messages through a responder and
//! posts the reply on the same connection.

use crate::error::ResponseError;
use crate::runtime::{Connection, ContextKey, Demultiplexer, Posted};
use crate::server::{EventHandler, Responder};
use crate::stream::ByteStream;
use std::sync::Arc;
use tracing::{error, trace};

pub struct Dispatcher {
    demux: Arc<dyn Demultiplexer>,
    responder: Arc<dyn Responder>,
}

impl Dispatcher {
    pub fn new(demux: Arc<dyn Demultiplexer>, responder: Arc<dyn Responder>) -> Self {
        Self { demux, responder }
    }
}

impl EventHandler for Dispatcher {
    fn queue_accept(&self, conn: &Connection) {
        if let Err(e) = self.demux.post_accept(conn.id()) {
            self.report_error(&format!("accept failed for connection {}: {}", conn.id(), e));
        }
        conn.accept_queued();
    }

    fn handle_response(&self, conn: ContextKey, stream: ByteStream) {
        if !stream.has_eof() {
            trace!(conn_id = conn, bytes = stream.len(), "Partial message");
            return;
        }
        if stream.is_close_signal() {
            trace!(conn_id = conn, "Close signal");
            return;
        }

        let mut reply = match self.responder.respond(stream) {
            Ok(reply) => reply,
            Err(e) => {
                self.responder.handle_error_sending_response(&e);
                return;
            }
        };
        reply.append_eof();

        match self.demux.post_send(conn, reply.to_wire()) {
            Ok(Posted::Completed) => trace!(conn_id = conn, "Reply sent"),
            Ok(Posted::Pending) => trace!(conn_id = conn, "Reply queued"),
            Err(e) => self
                .responder
                .handle_error_sending_response(&ResponseError::Send(e)),
        }
    }

    fn report_error(&self, message: &str) {
        error!("{}", message);
    }
}

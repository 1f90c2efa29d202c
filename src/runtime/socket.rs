//! Reusable socket handle owned by one connection.
//!
//! The slot is empty while the connection is idle, holds an adopted stream
//! while connected, and is emptied again by disconnect so the connection can
//! accept the next peer.

use crate::error::TransportError;
use crate::runtime::{ContextKey, Demultiplexer, Posted};
use crate::server::EventHandler;
use mio::net::TcpStream;
use parking_lot::Mutex;
use socket2::SockRef;
use std::net::Shutdown;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ConnectionSocket {
    key: ContextKey,
    /// Disable kernel send/receive buffering on adopted sockets.
    unbuffered: bool,
    stream: Mutex<Option<Arc<TcpStream>>>,
}

impl ConnectionSocket {
    /// Create an empty handle for the connection keyed `key`.
    pub fn create(key: ContextKey, unbuffered: bool) -> Self {
        Self {
            key,
            unbuffered,
            stream: Mutex::new(None),
        }
    }

    pub fn key(&self) -> ContextKey {
        self.key
    }

    /// Take ownership of an accepted stream and configure it for async use.
    ///
    /// With `unbuffered` set, `SO_SNDBUF` and `SO_RCVBUF` are zeroed so
    /// transfers go straight from application buffers. That trades peak
    /// throughput for fewer copies.
    pub fn adopt(&self, stream: TcpStream) -> Result<(), TransportError> {
        {
            let sock = SockRef::from(&stream);
            sock.set_nonblocking(true)
                .map_err(TransportError::SocketCreation)?;
            sock.set_nodelay(true)
                .map_err(TransportError::SocketCreation)?;
            if self.unbuffered {
                sock.set_send_buffer_size(0)
                    .map_err(TransportError::SocketCreation)?;
                sock.set_recv_buffer_size(0)
                    .map_err(TransportError::SocketCreation)?;
            }
        }

        let mut slot = self.stream.lock();
        if slot.is_some() {
            warn!(conn_id = self.key, "Replacing a socket that was never released");
        }
        *slot = Some(Arc::new(stream));
        Ok(())
    }

    /// Shared handle to the adopted stream, if any.
    pub fn handle(&self) -> Option<Arc<TcpStream>> {
        self.stream.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Issue the asynchronous disconnect-and-reuse primitive.
    ///
    /// An immediate failure closes the socket outright and is reported to
    /// the event handler; it never propagates past this call. Returns `None`
    /// in that case.
    pub fn disconnect(
        &self,
        demux: &dyn Demultiplexer,
        handler: &dyn EventHandler,
    ) -> Option<Posted> {
        match demux.post_disconnect(self.key) {
            Ok(posted) => Some(posted),
            Err(e) => {
                self.close();
                handler.report_error(&format!(
                    "disconnect failed on connection {}: {}",
                    self.key, e
                ));
                None
            }
        }
    }

    /// Drop the stream, shutting it down first.
    pub fn close(&self) {
        if let Some(stream) = self.stream.lock().take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(conn_id = self.key, error = %e, "Shutdown on close failed");
            }
        }
    }
}

impl std::fmt::Debug for ConnectionSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSocket")
            .field("key", &self.key)
            .field("open", &self.is_open())
            .finish()
    }
}

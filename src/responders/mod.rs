//! Built-in responders served by the binary.
//!
//! - `echo`: reply with the request payload
//! - `ping`: minimal PING/PONG for health checks and latency testing

mod echo;
mod ping;

pub use echo::EchoResponder;
pub use ping::PingResponder;

use crate::config::ResponderKind;
use crate::server::Responder;
use std::sync::Arc;

/// Build the responder selected in the configuration.
pub fn build(kind: ResponderKind) -> Arc<dyn Responder> {
    match kind {
        ResponderKind::Echo => Arc::new(EchoResponder),
        ResponderKind::Ping => Arc::new(PingResponder),
    }
}

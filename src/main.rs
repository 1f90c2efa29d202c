//! quicktcp-server: completion-driven TCP message server
//!
//! Serves one of the built-in responders:
//! - `echo`: reply with the request payload
//! - `ping`: PING / PONG
//!
//! Configuration via CLI arguments or TOML file.

use quicktcp::config::Config;
use quicktcp::{responders, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        unbuffered = config.unbuffered,
        responder = ?config.responder,
        "Starting quicktcp server"
    );

    let server = Server::bind(&config, responders::build(config.responder))?;
    info!(addr = %server.local_addr(), "Ready");
    server.wait();

    Ok(())
}

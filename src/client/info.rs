//! Target server descriptor.

use crate::error::ClientError;
use std::fmt;
use std::net::SocketAddr;

/// Host and port of the server a client talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
}

impl ServerInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the first connectable address.
    pub async fn resolve(&self) -> Result<SocketAddr, ClientError> {
        let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| ClientError::ResolveAddress(format!("{self}: {e}")))?;
        addrs
            .next()
            .ok_or_else(|| ClientError::ResolveAddress(format!("{self}: no addresses")))
    }
}

impl From<SocketAddr> for ServerInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

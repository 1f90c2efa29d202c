//! Completion-driven TCP server.
//!
//! A fixed table of [`Connection`]s is created up front, each queued for
//! accept. One poller thread drives the [`Proactor`]; worker threads pull
//! completions and hand them to the connection they belong to.

mod dispatcher;
mod handler;

pub use dispatcher::Dispatcher;
pub use handler::{EventHandler, Responder};

use crate::config::Config;
use crate::error::TransportError;
use crate::runtime::{BufferPool, Connection, ConnectionSocket, Demultiplexer, Proactor};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub struct Server {
    proactor: Arc<Proactor>,
    connections: Arc<[Connection]>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind the listener, pre-create the connection table and start serving.
    pub fn bind(config: &Config, responder: Arc<dyn Responder>) -> Result<Self, TransportError> {
        let addr = resolve(&config.listen)?;
        let proactor = Arc::new(Proactor::bind(addr)?);
        let demux: Arc<dyn Demultiplexer> = proactor.clone();
        let handler: Arc<dyn EventHandler> =
            Arc::new(Dispatcher::new(demux.clone(), responder.clone()));
        let buffers = Arc::new(BufferPool::new(config.max_connections, config.buffer_size));

        let connections: Arc<[Connection]> = (0..config.max_connections)
            .map(|id| {
                Connection::new(
                    ConnectionSocket::create(id, config.unbuffered),
                    buffers.clone(),
                    demux.clone(),
                    handler.clone(),
                    responder.clone(),
                )
            })
            .collect();

        let threads = match spawn_threads(&proactor, &connections, config.workers) {
            Ok(threads) => threads,
            Err(e) => {
                proactor.shutdown();
                return Err(e.into());
            }
        };

        for conn in connections.iter() {
            handler.queue_accept(conn);
        }

        info!(
            addr = %proactor.local_addr(),
            workers = config.workers,
            max_connections = config.max_connections,
            buffer_size = config.buffer_size,
            "Server listening"
        );

        Ok(Self {
            proactor,
            connections,
            threads,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.proactor.local_addr()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Stop the poller and workers and wait for them to exit.
    pub fn shutdown(&mut self) {
        self.proactor.shutdown();
        self.join();
        for conn in self.connections.iter() {
            conn.socket().close();
        }
    }

    /// Block until the server stops.
    pub fn wait(mut self) {
        self.join();
    }

    fn join(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Server thread panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.proactor.is_running() || !self.threads.is_empty() {
            self.shutdown();
        }
    }
}

fn spawn_threads(
    proactor: &Arc<Proactor>,
    connections: &Arc<[Connection]>,
    workers: usize,
) -> io::Result<Vec<JoinHandle<()>>> {
    let mut threads = Vec::with_capacity(workers + 1);

    let poller = proactor.clone();
    threads.push(
        thread::Builder::new()
            .name("poller".to_string())
            .spawn(move || {
                if let Err(e) = poller.run() {
                    error!(error = %e, "Poller failed");
                    poller.shutdown();
                }
            })?,
    );

    for worker_id in 0..workers {
        let proactor = proactor.clone();
        let connections = connections.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &proactor, &connections))?,
        );
    }

    Ok(threads)
}

fn worker_loop(worker_id: usize, proactor: &Proactor, connections: &[Connection]) {
    debug!(worker = worker_id, "Worker started");
    while let Some(completion) = proactor.await_completion() {
        match connections.get(completion.conn) {
            Some(conn) => conn.on_completion(completion),
            None => warn!(worker = worker_id, conn_id = completion.conn, "Completion for unknown connection"),
        }
    }
    debug!(worker = worker_id, "Worker stopped");
}

fn resolve(listen: &str) -> Result<SocketAddr, TransportError> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        TransportError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address for {listen}"),
        ))
    })
}

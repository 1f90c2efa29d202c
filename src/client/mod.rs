//! Pipelined request/response client.
//!
//! Requests may be submitted from any thread. They queue in FIFO order and
//! are exchanged one at a time over a single connection: a request is sent
//! only after the previous one's future has resolved. Network work runs on
//! the tokio runtime handed to [`Client::new`].

mod info;
mod processor;
mod request;

pub use info::ServerInfo;
pub use processor::{Authenticator, Processor, StreamProcessor, Utf8Processor};
pub use request::{PendingRequest, RequestState, ResponseFuture, Step};

use crate::error::ClientError;
use crate::stream::ByteStream;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Receive buffer size used when none is configured.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 2048;

/// Byte stream the driver exchanges requests over. A `TcpStream` once
/// connected.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Queue entry. The head is `InFlight` while the driver works on it, which
/// keeps the queue non-empty so no second driver starts.
enum Slot<T> {
    Waiting(PendingRequest<T>),
    InFlight,
}

struct Shared<P: Processor> {
    runtime: Handle,
    info: ServerInfo,
    processor: Arc<P>,
    authenticator: Option<Arc<dyn Authenticator>>,
    recv_buffer_size: usize,
    /// Held by the driver for the length of an exchange.
    socket: tokio::sync::Mutex<Option<Box<dyn Transport>>>,
    queue: Mutex<VecDeque<Slot<P::Output>>>,
    connected: Mutex<bool>,
    connected_signal: Condvar,
    /// Bumped by `disconnect` to abort an exchange in progress.
    cancel: watch::Sender<u64>,
}

pub struct Client<P: Processor> {
    shared: Arc<Shared<P>>,
}

impl<P: Processor> Client<P> {
    pub fn new(
        runtime: Handle,
        info: ServerInfo,
        processor: Arc<P>,
        recv_buffer_size: usize,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Self {
        let (cancel, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                runtime,
                info,
                processor,
                authenticator,
                recv_buffer_size: recv_buffer_size.max(1),
                socket: tokio::sync::Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                connected: Mutex::new(false),
                connected_signal: Condvar::new(),
                cancel,
            }),
        }
    }

    /// Start connecting in the background.
    ///
    /// Failures are reported to the processor; use
    /// [`wait_for_connection`](Self::wait_for_connection) to block until the
    /// connection is usable.
    pub fn connect(&self) {
        let shared = self.shared.clone();
        self.shared.runtime.spawn(async move {
            let _ = shared.establish().await;
        });
    }

    /// Resolve, connect and authenticate, returning once the client is usable.
    pub async fn establish(&self) -> Result<(), ClientError> {
        self.shared.establish().await
    }

    /// Submit a request.
    ///
    /// Never blocks. When disconnected the returned future is already
    /// resolved with [`ClientError::Disconnected`].
    pub fn request(&self, stream: ByteStream) -> ResponseFuture<P::Output> {
        if !self.is_connected() {
            return ResponseFuture::failed(ClientError::Disconnected);
        }

        let (request, future) = PendingRequest::new(stream);
        let start = {
            let mut queue = self.shared.queue.lock();
            let start = queue.is_empty();
            queue.push_back(Slot::Waiting(request));
            start
        };

        if start {
            self.shared.runtime.spawn(self.shared.clone().drive());
        }
        future
    }

    /// Drop the connection. An exchange in progress fails with
    /// [`ClientError::Disconnected`].
    pub fn disconnect(&self) {
        self.shared.set_connected(false);
        self.shared
            .cancel
            .send_modify(|epoch| *epoch = epoch.wrapping_add(1));

        // Busy sockets are dropped by the driver once it sees the cancel.
        if let Ok(mut socket) = self.shared.socket.try_lock() {
            if socket.take().is_some() {
                debug!(server = %self.shared.info, "Disconnected");
            }
        }
    }

    /// Block the calling thread until the client is connected. No timeout.
    pub fn wait_for_connection(&self) {
        let mut connected = self.shared.connected.lock();
        while !*connected {
            self.shared.connected_signal.wait(&mut connected);
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.lock()
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.recv_buffer_size
    }

    pub fn server(&self) -> &ServerInfo {
        &self.shared.info
    }
}

impl<P: Processor> Drop for Client<P> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<P: Processor> Shared<P> {
    async fn establish(&self) -> Result<(), ClientError> {
        let addr = match self.info.resolve().await {
            Ok(addr) => addr,
            Err(e) => {
                self.processor.handle_error_resolve_address(&e.to_string());
                return Err(e);
            }
        };

        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                let message = format!("{addr}: {e}");
                self.processor.handle_error_connect(&message);
                return Err(ClientError::Connect(message));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        if let Some(authenticator) = &self.authenticator {
            if !authenticator.authenticate(&mut stream).await {
                self.processor
                    .handle_error_connect(&format!("{addr}: authentication rejected"));
                return Err(ClientError::AuthenticationFailed);
            }
        }

        self.attach(Box::new(stream)).await;
        debug!(server = %self.info, peer = %addr, "Connected");
        Ok(())
    }

    async fn attach(&self, transport: Box<dyn Transport>) {
        *self.socket.lock().await = Some(transport);
        self.set_connected(true);
    }

    fn set_connected(&self, value: bool) {
        let mut connected = self.connected.lock();
        *connected = value;
        if value {
            self.connected_signal.notify_all();
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    /// Work through the queue until it is empty or the connection fails.
    async fn drive(self: Arc<Self>) {
        let mut socket = self.socket.lock().await;
        let mut cancel = self.cancel.subscribe();
        let mut buf = vec![0u8; self.recv_buffer_size];

        loop {
            let mut request = {
                let mut queue = self.queue.lock();
                match queue.front_mut().map(|slot| std::mem::replace(slot, Slot::InFlight)) {
                    Some(Slot::Waiting(request)) => request,
                    Some(Slot::InFlight) | None => return,
                }
            };

            let outcome = match socket.as_mut() {
                Some(stream) if self.is_connected() => {
                    tokio::select! {
                        outcome = exchange(stream, &mut request, &mut buf) => outcome,
                        _ = cancel.changed() => Err(ClientError::Disconnected),
                    }
                }
                _ => Err(ClientError::Disconnected),
            };

            match outcome {
                Ok(response) => {
                    request.resolve(self.processor.decode(response));
                    let mut queue = self.queue.lock();
                    queue.pop_front();
                    if queue.is_empty() {
                        return;
                    }
                }
                Err(error) => {
                    debug!(server = %self.info, error = %error, "Request failed, disconnecting");
                    self.set_connected(false);
                    socket.take();
                    request.resolve(Err(error));

                    let orphaned: Vec<_> = {
                        let mut queue = self.queue.lock();
                        queue.pop_front();
                        queue.drain(..).collect()
                    };
                    for slot in orphaned {
                        if let Slot::Waiting(request) = slot {
                            request.resolve(Err(ClientError::ConnectionLost));
                        }
                    }
                    return;
                }
            }
        }
    }
}

/// Run one request through its state machine on `stream`.
async fn exchange<S, T>(
    stream: &mut S,
    request: &mut PendingRequest<T>,
    buf: &mut [u8],
) -> Result<ByteStream, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut step = request.begin();
    loop {
        step = match step {
            Step::Send(payload) => match stream.write(&payload).await {
                Ok(written) => request.on_sent(written),
                Err(e) => request.on_error(e.into()),
            },
            Step::Receive => match stream.read(buf).await {
                Ok(n) => {
                    trace!(bytes = n, "Response chunk");
                    request.on_received(&buf[..n])
                }
                Err(e) => request.on_error(e.into()),
            },
            Step::Complete(response) => return Ok(response),
            Step::Fail(error) => return Err(error),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::io::{ErrorKind, Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::time::Duration;
    use tokio::runtime::Runtime;

    const MARKER: &[u8] = b"\r\n.\r\n";

    #[derive(Default)]
    struct RecordingProcessor {
        connect_errors: Mutex<Vec<String>>,
    }

    impl Processor for RecordingProcessor {
        type Output = String;

        fn decode(&self, response: ByteStream) -> Result<String, ClientError> {
            Utf8Processor.decode(response)
        }

        fn handle_error_connect(&self, message: &str) {
            self.connect_errors.lock().push(message.to_string());
        }
    }

    struct Reject;

    impl Authenticator for Reject {
        fn authenticate<'a>(&'a self, _stream: &'a mut TcpStream) -> BoxFuture<'a, bool> {
            Box::pin(async { false })
        }
    }

    fn client_for(addr: SocketAddr, rt: &Runtime) -> Client<RecordingProcessor> {
        Client::new(
            rt.handle().clone(),
            ServerInfo::from(addr),
            Arc::new(RecordingProcessor::default()),
            DEFAULT_RECV_BUFFER_SIZE,
            None,
        )
    }

    /// Read from `stream` until a full message has arrived.
    fn read_message(stream: &mut std::net::TcpStream) -> Vec<u8> {
        let mut message = Vec::new();
        let mut chunk = [0u8; 64];
        while !message.ends_with(MARKER) {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "client closed early");
            message.extend_from_slice(&chunk[..n]);
        }
        message.truncate(message.len() - MARKER.len());
        message
    }

    fn assert_nothing_pending(stream: &mut std::net::TcpStream) {
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut byte = [0u8; 1];
        match stream.read(&mut byte) {
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            other => panic!("next request sent early: {other:?}"),
        }
        stream.set_read_timeout(None).unwrap();
    }

    #[test]
    fn test_requests_while_disconnected_fail_immediately() {
        let rt = Runtime::new().unwrap();
        let client = client_for("127.0.0.1:9".parse().unwrap(), &rt);
        assert!(!client.is_connected());

        std::thread::scope(|s| {
            let handles: Vec<_> = ["R1", "R2", "R3"]
                .into_iter()
                .map(|payload| {
                    let client = &client;
                    s.spawn(move || client.request(ByteStream::from(payload)).wait())
                })
                .collect();
            for handle in handles {
                assert!(matches!(
                    handle.join().unwrap(),
                    Err(ClientError::Disconnected)
                ));
            }
        });
    }

    #[test]
    fn test_disconnected_future_is_already_resolved() {
        let rt = Runtime::new().unwrap();
        let client = client_for("127.0.0.1:9".parse().unwrap(), &rt);

        let mut fut = tokio_test::task::spawn(client.request(ByteStream::from("R1")));
        let result = tokio_test::assert_ready!(fut.poll());
        assert!(matches!(result, Err(ClientError::Disconnected)));
    }

    #[test]
    fn test_pipelined_requests_are_sent_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for expected in ["R1", "R2"] {
                assert_eq!(read_message(&mut stream), expected.as_bytes());
                // The next request must wait for this reply.
                assert_nothing_pending(&mut stream);
                stream
                    .write_all(format!("re:{expected}\r\n.\r\n").as_bytes())
                    .unwrap();
            }
        });

        let rt = Runtime::new().unwrap();
        let client = client_for(addr, &rt);
        rt.block_on(client.establish()).unwrap();
        assert!(client.is_connected());

        let r1 = client.request(ByteStream::from("R1"));
        let r2 = client.request(ByteStream::from("R2"));

        assert_eq!(r1.wait().unwrap(), "re:R1");
        assert_eq!(r2.wait().unwrap(), "re:R2");
        peer.join().unwrap();
        assert!(client.is_connected());
    }

    #[test]
    fn test_failure_mid_pipeline_fails_queued_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_message(&mut stream);
            // Hang up without answering.
        });

        let rt = Runtime::new().unwrap();
        let client = client_for(addr, &rt);
        rt.block_on(client.establish()).unwrap();

        let r1 = client.request(ByteStream::from("R1"));
        let r2 = client.request(ByteStream::from("R2"));

        assert!(matches!(r1.wait(), Err(ClientError::NoResponse)));
        assert!(matches!(r2.wait(), Err(ClientError::ConnectionLost)));
        assert!(!client.is_connected());
        peer.join().unwrap();

        let r3 = client.request(ByteStream::from("R3"));
        assert!(matches!(r3.wait(), Err(ClientError::Disconnected)));
    }

    #[tokio::test]
    async fn test_short_write_disconnects_and_fails_queue() {
        let client = Client::new(
            Handle::current(),
            ServerInfo::from("127.0.0.1:9".parse::<SocketAddr>().unwrap()),
            Arc::new(RecordingProcessor::default()),
            DEFAULT_RECV_BUFFER_SIZE,
            None,
        );
        // The pipe takes at most 3 bytes per write, fewer than "R1" plus the marker.
        let (transport, _peer) = tokio::io::duplex(3);
        client.shared.attach(Box::new(transport)).await;
        assert!(client.is_connected());

        let r1 = client.request(ByteStream::from("R1"));
        let r2 = client.request(ByteStream::from("R2"));

        match r1.await {
            Err(ClientError::IncompleteSend { written, expected }) => {
                assert_eq!(written, 3);
                assert_eq!(expected, 2 + MARKER.len());
            }
            other => panic!("expected incomplete send, got {other:?}"),
        }
        assert!(matches!(r2.await, Err(ClientError::ConnectionLost)));
        assert!(!client.is_connected());
        assert!(client.shared.socket.lock().await.is_none());
        assert!(matches!(
            client.request(ByteStream::from("R3")).await,
            Err(ClientError::Disconnected)
        ));
    }

    #[test]
    fn test_disconnect_cancels_in_flight_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received_rx) = std::sync::mpsc::channel();
        let peer = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_message(&mut stream);
            received_tx.send(()).unwrap();
            // Never reply; wait for the client to go away.
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest);
        });

        let rt = Runtime::new().unwrap();
        let client = client_for(addr, &rt);
        rt.block_on(client.establish()).unwrap();

        let r1 = client.request(ByteStream::from("R1"));
        received_rx.recv().unwrap();
        client.disconnect();

        assert!(matches!(r1.wait(), Err(ClientError::Disconnected)));
        assert!(!client.is_connected());
        peer.join().unwrap();
    }

    #[test]
    fn test_connect_failure_is_reported() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let rt = Runtime::new().unwrap();
        let client = client_for(addr, &rt);
        let err = rt.block_on(client.establish()).unwrap_err();

        assert!(matches!(err, ClientError::Connect(_)));
        assert_eq!(client.shared.processor.connect_errors.lock().len(), 1);
        assert!(!client.is_connected());
    }

    #[test]
    fn test_rejected_authentication_leaves_client_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let rt = Runtime::new().unwrap();
        let client = Client::new(
            rt.handle().clone(),
            ServerInfo::from(addr),
            Arc::new(RecordingProcessor::default()),
            64,
            Some(Arc::new(Reject) as Arc<dyn Authenticator>),
        );

        let err = rt.block_on(client.establish()).unwrap_err();
        assert!(matches!(err, ClientError::AuthenticationFailed));
        assert!(!client.is_connected());
        assert_eq!(client.buffer_size(), 64);
        drop(listener);
    }

    #[test]
    fn test_connect_wakes_waiters() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let rt = Runtime::new().unwrap();
        let client = client_for(addr, &rt);
        client.connect();
        client.wait_for_connection();
        assert!(client.is_connected());

        client.disconnect();
        assert!(!client.is_connected());
        drop(listener);
    }
}

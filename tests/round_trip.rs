//! End-to-end exchanges between the server and the client.

use quicktcp::client::{StreamProcessor, Utf8Processor, DEFAULT_RECV_BUFFER_SIZE};
use quicktcp::config::Config;
use quicktcp::responders::{EchoResponder, PingResponder};
use quicktcp::{ByteStream, Client, ClientError, Responder, ResponseError, Server, ServerInfo};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Runtime};

fn config() -> Config {
    Config {
        listen: "127.0.0.1:0".to_string(),
        workers: 2,
        max_connections: 8,
        buffer_size: 16,
        ..Config::default()
    }
}

fn runtime() -> Runtime {
    Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn ping_round_trip() {
    let mut server = Server::bind(&config(), Arc::new(PingResponder)).unwrap();
    let rt = runtime();
    let client = Client::new(
        rt.handle().clone(),
        ServerInfo::from(server.local_addr()),
        Arc::new(Utf8Processor),
        DEFAULT_RECV_BUFFER_SIZE,
        None,
    );

    rt.block_on(client.establish()).unwrap();

    assert_eq!(client.request(ByteStream::from("PING")).wait().unwrap(), "PONG");
    assert_eq!(
        client.request(ByteStream::from("PING hello")).wait().unwrap(),
        "PONG hello"
    );
    assert_eq!(
        client.request(ByteStream::from("HELLO")).wait().unwrap(),
        "ERROR unknown command"
    );

    drop(client);
    server.shutdown();
}

#[test]
fn echo_payload_larger_than_receive_buffer() {
    let mut server = Server::bind(&config(), Arc::new(EchoResponder)).unwrap();
    let rt = runtime();
    let client = Client::new(
        rt.handle().clone(),
        ServerInfo::from(server.local_addr()),
        Arc::new(StreamProcessor),
        32,
        None,
    );
    rt.block_on(client.establish()).unwrap();

    let payload = "x".repeat(1000);
    let reply = client
        .request(ByteStream::from(payload.as_str()))
        .wait()
        .unwrap();
    assert_eq!(reply.as_bytes(), payload.as_bytes());
    assert!(reply.has_eof());

    // The accumulators start clean for the next exchange.
    let reply = client.request(ByteStream::from("next")).wait().unwrap();
    assert_eq!(reply.as_bytes(), b"next");

    drop(client);
    server.shutdown();
}

#[test]
fn pipelined_requests_from_many_threads() {
    let mut server = Server::bind(&config(), Arc::new(EchoResponder)).unwrap();
    let rt = runtime();
    let client = Client::new(
        rt.handle().clone(),
        ServerInfo::from(server.local_addr()),
        Arc::new(Utf8Processor),
        DEFAULT_RECV_BUFFER_SIZE,
        None,
    );
    rt.block_on(client.establish()).unwrap();

    std::thread::scope(|s| {
        for t in 0..4 {
            let client = &client;
            s.spawn(move || {
                for i in 0..10 {
                    let payload = format!("thread {t} request {i}");
                    let reply = client
                        .request(ByteStream::from(payload.as_str()))
                        .wait()
                        .unwrap();
                    assert_eq!(reply, payload);
                }
            });
        }
    });

    drop(client);
    server.shutdown();
}

struct Guarded {
    closed: AtomicUsize,
}

impl Responder for Guarded {
    fn requires_authentication(&self) -> bool {
        true
    }

    fn authenticate_connection(&self, stream: &ByteStream) -> bool {
        stream.as_bytes() == b"let me in"
    }

    fn respond(&self, request: ByteStream) -> Result<ByteStream, ResponseError> {
        Ok(ByteStream::from_payload(request.as_bytes()))
    }

    fn handle_error_sending_response(&self, _error: &ResponseError) {}

    fn handle_connection_closed(&self, _conn: usize) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn authentication_gates_the_connection() {
    let responder = Arc::new(Guarded {
        closed: AtomicUsize::new(0),
    });
    let mut server = Server::bind(&config(), responder.clone()).unwrap();
    let rt = runtime();

    let client = Client::new(
        rt.handle().clone(),
        ServerInfo::from(server.local_addr()),
        Arc::new(StreamProcessor),
        DEFAULT_RECV_BUFFER_SIZE,
        None,
    );
    rt.block_on(client.establish()).unwrap();

    // First message is the credential; the acknowledgement is empty.
    let ack = client.request(ByteStream::from("let me in")).wait().unwrap();
    assert!(ack.is_empty());
    let reply = client.request(ByteStream::from("hi")).wait().unwrap();
    assert_eq!(reply.as_bytes(), b"hi");

    let intruder = Client::new(
        rt.handle().clone(),
        ServerInfo::from(server.local_addr()),
        Arc::new(StreamProcessor),
        DEFAULT_RECV_BUFFER_SIZE,
        None,
    );
    rt.block_on(intruder.establish()).unwrap();
    let rejected = intruder.request(ByteStream::from("guess")).wait();
    assert!(matches!(
        rejected,
        Err(ClientError::NoResponse) | Err(ClientError::Transport(_))
    ));
    assert!(!intruder.is_connected());

    let deadline = Instant::now() + Duration::from_secs(5);
    while responder.closed.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "close not reported");
        std::thread::sleep(Duration::from_millis(10));
    }

    drop(intruder);
    drop(client);
    server.shutdown();
}

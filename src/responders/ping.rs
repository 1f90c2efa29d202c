//! Ping responder.

use crate::error::ResponseError;
use crate::server::Responder;
use crate::stream::ByteStream;
use tracing::warn;

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(&'a [u8]),
    Unknown,
}

/// Parse one request payload. Case-insensitive; trailing CR/LF is ignored.
pub fn parse(payload: &[u8]) -> Command<'_> {
    let line = trim_line_ending(payload);

    if line.eq_ignore_ascii_case(b"PING") {
        Command::Ping
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        Command::PingMsg(&line[5..])
    } else {
        Command::Unknown
    }
}

fn trim_line_ending(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\r' | b'\n'] = line {
        line = rest;
    }
    line
}

/// PING -> PONG, `PING msg` -> `PONG msg`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingResponder;

impl Responder for PingResponder {
    fn respond(&self, request: ByteStream) -> Result<ByteStream, ResponseError> {
        let reply = match parse(request.as_bytes()) {
            Command::Ping => ByteStream::from("PONG"),
            Command::PingMsg(msg) => {
                let mut resp = Vec::with_capacity(5 + msg.len());
                resp.extend_from_slice(b"PONG ");
                resp.extend_from_slice(msg);
                ByteStream::from(resp)
            }
            Command::Unknown => ByteStream::from("ERROR unknown command"),
        };
        Ok(reply)
    }

    fn handle_error_sending_response(&self, error: &ResponseError) {
        warn!(error = %error, "Failed to send pong");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        assert_eq!(parse(b"PING"), Command::Ping);
        assert_eq!(parse(b"ping"), Command::Ping);
        assert_eq!(parse(b"PING\r\n"), Command::Ping);
    }

    #[test]
    fn test_parse_ping_msg() {
        assert_eq!(parse(b"PING hello"), Command::PingMsg(b"hello"));
        assert_eq!(parse(b"ping hello\r\n"), Command::PingMsg(b"hello"));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse(b"FOO"), Command::Unknown);
        assert_eq!(parse(b"PING "), Command::Unknown);
        assert_eq!(parse(b""), Command::Unknown);
    }

    #[test]
    fn test_responses() {
        let pong = PingResponder.respond(ByteStream::from("PING")).unwrap();
        assert_eq!(pong.as_bytes(), b"PONG");

        let pong = PingResponder.respond(ByteStream::from("PING there")).unwrap();
        assert_eq!(pong.as_bytes(), b"PONG there");

        let err = PingResponder.respond(ByteStream::from("GET x")).unwrap();
        assert_eq!(err.as_bytes(), b"ERROR unknown command");
    }
}

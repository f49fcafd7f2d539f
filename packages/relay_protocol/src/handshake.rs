//! Upgrade handshake: request head parsing, accept token, response block.

use data_encoding::BASE64;
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;

/// Fixed GUID appended to the client key before hashing (RFC 6455 section 1.3).
pub const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Accept token for a client-supplied `sec-websocket-key`.
pub fn accept_key(key: &str) -> String {
    let digest = Sha1::new()
        .chain_update(key.as_bytes())
        .chain_update(HANDSHAKE_GUID.as_bytes())
        .finalize();
    BASE64.encode(&digest)
}

/// Offset just past the blank line ending a request head, if buffered.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// The request line and headers of an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Parse a request head (everything up to and including the blank line).
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| HandshakeError::Malformed("head is not UTF-8".to_string()))?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| HandshakeError::Malformed("empty request line".to_string()))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HandshakeError::Malformed(format!(
                "bad request line: {request_line}"
            )));
        };

        let mut headers = Vec::new();
        for line in lines.take_while(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::Malformed(format!("bad header line: {line}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The non-empty `sec-websocket-key`.
    pub fn key(&self) -> Result<&str, HandshakeError> {
        self.header("sec-websocket-key")
            .filter(|k| !k.is_empty())
            .ok_or(HandshakeError::MissingKey)
    }

    /// The query string of the request target, without the `?`.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }
}

/// Response written back on the same stream as the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeResponse {
    SwitchingProtocols { accept: String },
    BadRequest,
}

impl UpgradeResponse {
    pub fn accept(key: &str) -> Self {
        Self::SwitchingProtocols {
            accept: accept_key(key),
        }
    }

    pub fn is_upgrade(&self) -> bool {
        matches!(self, Self::SwitchingProtocols { .. })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl std::fmt::Display for UpgradeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SwitchingProtocols { accept } => write!(
                f,
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {accept}\r\n\
                 \r\n"
            ),
            Self::BadRequest => write!(
                f,
                "HTTP/1.1 400 Bad Request\r\n\
                 Connection: close\r\n\
                 Content-Length: 0\r\n\
                 \r\n"
            ),
        }
    }
}

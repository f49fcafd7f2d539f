//! Error types for frame coding, handshakes, and message parsing.

/// Failures while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("payload of {len} bytes exceeds the {max}-byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("64-bit extended payload length is not supported")]
    UnsupportedLength,

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True for the length violations that make a frame unrepresentable.
    pub fn is_length_violation(&self) -> bool {
        matches!(
            self,
            Self::PayloadTooLarge { .. } | Self::UnsupportedLength
        )
    }
}

/// Why a text payload could not be read as an application message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("payload is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Rejections of an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("missing sec-websocket-key header")]
    MissingKey,

    #[error("malformed request head: {0}")]
    Malformed(String),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("connection closed before the request head was complete")]
    Incomplete,

    #[error("failed to read request head: {0}")]
    Io(String),
}

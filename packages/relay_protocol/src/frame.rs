//! Frame layout and encoding.
//!
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| payload len |   extended length (16 bit)    |
//! |I|S|S|S|  (4)  |A|     (7)     |    present when len == 126    |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |  masking key (4 bytes, peer -> relay only) |  payload ...     |
//! +--------------------------------------------+------------------+
//! ```
//!
//! Only the 7-bit and 16-bit length forms exist here. The 64-bit form is
//! rejected on both sides, which caps a payload at [`MAX_PAYLOAD_LEN`].

use std::sync::OnceLock;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::message::InboundMessage;

pub(crate) const FIN_BIT: u8 = 0b1000_0000;
pub(crate) const OPCODE_MASK: u8 = 0b0000_1111;
pub(crate) const MASK_BIT: u8 = 0b1000_0000;
pub(crate) const LENGTH_MASK: u8 = 0b0111_1111;

/// 7-bit length marker announcing a 16-bit extended length.
pub(crate) const LENGTH_16_BIT: u8 = 126;
/// 7-bit length marker announcing a 64-bit extended length (unsupported).
pub(crate) const LENGTH_64_BIT: u8 = 127;

/// Largest payload a frame may carry (lengths must stay below `u16::MAX`).
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize - 1;

/// Frame opcode (low nibble of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// 0x3-0x7 and 0xB-0xF.
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Self {
        match byte & OPCODE_MASK {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(n) => n & OPCODE_MASK,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

/// A single decoded frame. The payload is already unmasked.
#[derive(Debug, Clone)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    /// The key the payload was masked with on the wire, if any.
    pub mask_key: Option<[u8; 4]>,
    pub payload: Bytes,
    message: OnceLock<InboundMessage>,
}

impl Frame {
    pub fn new(fin: bool, opcode: Opcode, mask_key: Option<[u8; 4]>, payload: Bytes) -> Self {
        Self {
            fin,
            opcode,
            mask_key,
            payload,
            message: OnceLock::new(),
        }
    }

    /// Final, unmasked text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, Opcode::Text, None, payload.into())
    }

    pub fn is_masked(&self) -> bool {
        self.mask_key.is_some()
    }

    pub fn is_close(&self) -> bool {
        self.opcode == Opcode::Close
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// The payload read as an application message.
    ///
    /// Parsed on first call and cached; later calls return the same value.
    /// Payloads that do not parse come back as [`InboundMessage::Empty`].
    pub fn message(&self) -> &InboundMessage {
        self.message
            .get_or_init(|| InboundMessage::from_payload(&self.payload))
    }
}

/// XOR `buf` with the 4-byte masking key, in place.
///
/// Masking and unmasking are the same operation.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Encode a single final frame.
///
/// With `mask` set the mask bit and key are written and the payload is
/// masked, as a client must do. The relay itself never masks.
pub fn encode_frame(
    opcode: Opcode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> Result<Bytes, ProtocolError> {
    let len = payload.len();
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            len,
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    let mut buf = BytesMut::with_capacity(2 + 2 + 4 + len);
    buf.put_u8(FIN_BIT | opcode.as_u8());

    if len < LENGTH_16_BIT as usize {
        buf.put_u8(mask_bit | len as u8);
    } else {
        buf.put_u8(mask_bit | LENGTH_16_BIT);
        buf.put_u16(len as u16);
    }

    match mask {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.put_slice(payload),
    }

    Ok(buf.freeze())
}

/// Encode an unmasked, final text frame carrying `payload`.
pub fn encode_text(payload: &[u8]) -> Result<Bytes, ProtocolError> {
    encode_frame(Opcode::Text, payload, None)
}

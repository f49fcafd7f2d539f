//! Wire protocol for the chat relay.
//!
//! This crate has no networking of its own. It turns bytes into frames and
//! frames into bytes, computes the upgrade handshake, and models the JSON
//! messages carried inside text frames.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use relay_protocol::{FrameDecoder, MaskPolicy, Opcode, encode_frame};
//! use tokio_util::codec::Decoder;
//!
//! let wire = encode_frame(Opcode::Text, br#"{"type":"login"}"#, Some([1, 2, 3, 4])).unwrap();
//!
//! let mut decoder = FrameDecoder::new(MaskPolicy::Always);
//! let mut buf = BytesMut::from(&wire[..]);
//! let frame = decoder.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(frame.opcode, Opcode::Text);
//! assert_eq!(&frame.payload[..], br#"{"type":"login"}"#);
//! ```

pub mod decoder;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

pub use decoder::{DecodeState, FrameDecoder, MaskPolicy};
pub use error::{HandshakeError, MessageError, ProtocolError};
pub use frame::{Frame, MAX_PAYLOAD_LEN, Opcode, apply_mask, encode_frame, encode_text};
pub use handshake::{HANDSHAKE_GUID, UpgradeRequest, UpgradeResponse, accept_key, find_head_end};
pub use message::{ApplicationMessage, InboundMessage, parse_message};

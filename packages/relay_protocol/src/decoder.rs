//! Incremental frame decoder.
//!
//! Bytes arrive in chunks of any size. The decoder walks
//! `Header -> ExtendedLength -> MaskKey -> Payload`, consuming each field only
//! once it is fully buffered, and yields a [`Frame`] when the payload is
//! complete. Nothing is assumed about how the chunks line up with frames.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::frame::{
    FIN_BIT, Frame, LENGTH_16_BIT, LENGTH_64_BIT, LENGTH_MASK, MASK_BIT, MAX_PAYLOAD_LEN, Opcode,
    apply_mask,
};

/// How the decoder treats the mask bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Every frame carries a masking key, whatever the mask bit says.
    /// This is the relay's view of its peers.
    Always,
    /// Read a masking key only when the mask bit is set. Used to read the
    /// relay's own (unmasked) output.
    FromHeader,
}

/// Where the decoder is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Header,
    ExtendedLength,
    MaskKey,
    Payload,
}

#[derive(Debug, Default, Clone, Copy)]
struct PartialHeader {
    fin: bool,
    opcode: u8,
    masked: bool,
    len: usize,
    mask_key: Option<[u8; 4]>,
}

#[derive(Debug)]
pub struct FrameDecoder {
    policy: MaskPolicy,
    state: DecodeState,
    header: PartialHeader,
}

impl FrameDecoder {
    pub fn new(policy: MaskPolicy) -> Self {
        Self {
            policy,
            state: DecodeState::Header,
            header: PartialHeader::default(),
        }
    }

    /// Decoder for frames sent by peers to the relay.
    pub fn server() -> Self {
        Self::new(MaskPolicy::Always)
    }

    /// Decoder for frames sent by the relay.
    pub fn client() -> Self {
        Self::new(MaskPolicy::FromHeader)
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Header
    }

    fn after_length(&self) -> DecodeState {
        if self.header.masked {
            DecodeState::MaskKey
        } else {
            DecodeState::Payload
        }
    }

    fn reset(&mut self) {
        self.state = DecodeState::Header;
        self.header = PartialHeader::default();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::server()
    }
}

/// Ask for `needed` bytes, reserving room for the rest of them.
fn wait_for(src: &mut BytesMut, needed: usize) -> bool {
    if src.len() >= needed {
        true
    } else {
        src.reserve(needed - src.len());
        false
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if !wait_for(src, 2) {
                        return Ok(None);
                    }
                    let first = src.get_u8();
                    let second = src.get_u8();

                    self.header.fin = first & FIN_BIT != 0;
                    self.header.opcode = first;
                    self.header.masked = match self.policy {
                        MaskPolicy::Always => true,
                        MaskPolicy::FromHeader => second & MASK_BIT != 0,
                    };

                    match second & LENGTH_MASK {
                        LENGTH_64_BIT => {
                            self.reset();
                            return Err(ProtocolError::UnsupportedLength);
                        }
                        LENGTH_16_BIT => self.state = DecodeState::ExtendedLength,
                        len => {
                            self.header.len = len as usize;
                            self.state = self.after_length();
                        }
                    }
                }
                DecodeState::ExtendedLength => {
                    if !wait_for(src, 2) {
                        return Ok(None);
                    }
                    let len = src.get_u16() as usize;
                    if len > MAX_PAYLOAD_LEN {
                        self.reset();
                        return Err(ProtocolError::PayloadTooLarge {
                            len,
                            max: MAX_PAYLOAD_LEN,
                        });
                    }
                    self.header.len = len;
                    self.state = self.after_length();
                }
                DecodeState::MaskKey => {
                    if !wait_for(src, 4) {
                        return Ok(None);
                    }
                    let mut key = [0u8; 4];
                    src.copy_to_slice(&mut key);
                    self.header.mask_key = Some(key);
                    self.state = DecodeState::Payload;
                }
                DecodeState::Payload => {
                    let len = self.header.len;
                    if !wait_for(src, len) {
                        return Ok(None);
                    }
                    let mut payload = src.split_to(len);
                    if let Some(key) = self.header.mask_key {
                        apply_mask(&mut payload, key);
                    }

                    let header = self.header;
                    self.reset();

                    let frame = Frame::new(
                        header.fin,
                        Opcode::from_u8(header.opcode),
                        header.mask_key,
                        payload.freeze(),
                    );
                    trace!(
                        opcode = ?frame.opcode,
                        fin = frame.fin,
                        len = frame.payload_len(),
                        "decoded frame"
                    );
                    return Ok(Some(frame));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !self.is_idle() || !src.is_empty() {
            debug!(
                state = ?self.state,
                buffered = src.len(),
                "stream ended mid-frame, discarding partial frame"
            );
            src.clear();
            self.reset();
        }
        Ok(None)
    }
}

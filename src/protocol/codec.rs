//! Protocol codec for encoding/decoding packets
//!
//! Handles the fixed 25-byte header, the JSON payload and stream framing for
//! the control channel.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{MessageType, Payload};

/// Maximum payload size (64 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Width of the zero-padded identity field
pub const IDENTITY_SIZE: usize = 16;

/// Header size: type(1) + identity(16) + sequence(4) + length(4) = 25 bytes
pub const HEADER_SIZE: usize = 1 + IDENTITY_SIZE + 4 + 4;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Identity too long: {0} bytes (max: {max})", max = IDENTITY_SIZE)]
    IdentityTooLong(usize),

    #[error("Identity is not valid UTF-8")]
    InvalidIdentity,

    #[error("Payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(usize, usize),

    #[error("Unparseable payload: {0}")]
    UnparseablePayload(#[from] serde_json::Error),

    #[error("Truncated packet: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

/// Decoded packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Raw type tag, kept even when unknown so the payload can be skipped
    pub message_type: u8,
    pub sender: String,
    pub sequence: u32,
    pub payload_len: u32,
}

impl Header {
    /// Known message type, if any
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::try_from(self.message_type).ok()
    }

    /// Total on-wire size of the packet this header introduces
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }
}

/// Encode a complete packet
pub fn encode(
    kind: MessageType,
    sender: &str,
    sequence: u32,
    payload: &Payload,
) -> Result<Bytes, CodecError> {
    let identity = sender.as_bytes();
    if identity.len() > IDENTITY_SIZE {
        return Err(CodecError::IdentityTooLong(identity.len()));
    }

    let body = serde_json::to_vec(payload)?;
    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::PayloadTooLarge(body.len(), MAX_PAYLOAD_SIZE));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_u8(kind.type_id());
    buf.put_slice(identity);
    buf.put_bytes(0, IDENTITY_SIZE - identity.len());
    buf.put_u32(sequence);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);

    Ok(buf.freeze())
}

/// Decode the fixed header from the first `HEADER_SIZE` bytes
pub fn decode_header(bytes: &[u8]) -> Result<Header, CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::Truncated {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let message_type = bytes[0];

    let identity = &bytes[1..1 + IDENTITY_SIZE];
    let end = identity
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |i| i + 1);
    let sender = std::str::from_utf8(&identity[..end])
        .map_err(|_| CodecError::InvalidIdentity)?
        .to_string();

    let sequence = u32::from_be_bytes([bytes[17], bytes[18], bytes[19], bytes[20]]);
    let payload_len = u32::from_be_bytes([bytes[21], bytes[22], bytes[23], bytes[24]]);

    Ok(Header {
        message_type,
        sender,
        sequence,
        payload_len,
    })
}

/// Decode a JSON payload; an empty slice is the empty map
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, CodecError> {
    if bytes.is_empty() {
        return Ok(Payload::new());
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// A complete packet together with its exact on-wire bytes
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    /// Header plus payload, exactly as received
    pub raw: Bytes,
}

impl Frame {
    /// Parse a single datagram
    ///
    /// Bytes past the declared payload length are not part of the frame.
    pub fn from_datagram(datagram: &[u8]) -> Result<Self, CodecError> {
        let header = decode_header(datagram)?;
        let len = header.frame_len();
        if header.payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(
                header.payload_len as usize,
                MAX_PAYLOAD_SIZE,
            ));
        }
        if datagram.len() < len {
            return Err(CodecError::Truncated {
                needed: len,
                available: datagram.len(),
            });
        }

        Ok(Self {
            header,
            raw: Bytes::copy_from_slice(&datagram[..len]),
        })
    }

    pub fn kind(&self) -> Option<MessageType> {
        self.header.kind()
    }

    pub fn sender(&self) -> &str {
        &self.header.sender
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.raw[HEADER_SIZE..]
    }

    /// Decode the payload
    pub fn payload(&self) -> Result<Payload, CodecError> {
        decode_payload(self.payload_bytes())
    }
}

/// Decodes packets from a byte stream
pub struct Decoder {
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload(Header),
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
        }
    }

    /// Attempt to decode a frame from the buffer
    /// Returns Ok(None) if more data is needed
    ///
    /// Header errors leave the stream unframed; callers must drop the
    /// connection rather than retry.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let header = decode_header(&buf[..HEADER_SIZE])?;
                    if header.payload_len as usize > MAX_PAYLOAD_SIZE {
                        return Err(CodecError::PayloadTooLarge(
                            header.payload_len as usize,
                            MAX_PAYLOAD_SIZE,
                        ));
                    }

                    self.state = DecodeState::Payload(header);
                }
                DecodeState::Payload(header) => {
                    if buf.len() < header.frame_len() {
                        return Ok(None);
                    }

                    let raw = buf.split_to(header.frame_len()).freeze();
                    let DecodeState::Payload(header) = std::mem::take(&mut self.state) else {
                        unreachable!("decoder state checked above");
                    };

                    return Ok(Some(Frame { header, raw }));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

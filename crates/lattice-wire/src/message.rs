//! The in-memory message type and its body segment codec.
//!
//! On the wire a message is a fixed header followed by one body segment:
//! the serialized body, the 96-byte signature block, then the raw data
//! payload. The header's length fields are authoritative; a segment whose
//! length disagrees with them is rejected before any field is used.

use crate::error::WireError;
use crate::header::MessageHeader;
use crate::sign::MessageSign;
use crate::{CommandCode, SIGN_BLOCK_SIZE};

/// A complete transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Application-defined routing tag.
    pub tag: i16,
    /// The eight-byte command code.
    pub command: CommandCode,
    /// Sender's protocol version.
    pub version: u16,
    /// Request correlation id, zero for unsolicited messages.
    pub req_id: u64,
    /// Serialized message body.
    pub body: Vec<u8>,
    /// Raw data payload, carried outside the body.
    pub data: Vec<u8>,
    /// Signature block, present on every received message.
    pub sign: Option<MessageSign>,
}

impl Message {
    /// A new unsigned message carrying the given body and data.
    #[must_use]
    pub fn new(command: CommandCode, body: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            tag: 0,
            command,
            version: 0,
            req_id: 0,
            body,
            data,
            sign: None,
        }
    }

    /// Build the wire header for this message.
    #[must_use]
    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            tag: self.tag,
            body_len: self.body.len() as u32,
            data_len: self.data.len() as u32,
            command: self.command,
            req_id: self.req_id,
            version: self.version,
        }
    }

    /// Serialize the body segment with the given signature block.
    #[must_use]
    pub fn encode_segment(&self, sign: &MessageSign) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + SIGN_BLOCK_SIZE + self.data.len());
        out.extend_from_slice(&self.body);
        out.extend_from_slice(&sign.encode());
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse a body segment back into a message using its header.
    pub fn decode_segment(header: &MessageHeader, segment: &[u8]) -> Result<Self, WireError> {
        let expected = header.segment_len();
        if segment.len() != expected {
            return Err(WireError::SegmentMismatch {
                declared: expected,
                actual: segment.len(),
            });
        }
        let body_end = header.body_len as usize;
        let sign_end = body_end + SIGN_BLOCK_SIZE;

        let sign = MessageSign::decode(&segment[body_end..sign_end])?;
        Ok(Self {
            tag: header.tag,
            command: header.command,
            version: header.version,
            req_id: header.req_id,
            body: segment[..body_end].to_vec(),
            data: segment[sign_end..].to_vec(),
            sign: Some(sign),
        })
    }
}

//! Fixed-width message header codec.
//!
//! The header is the first of the two encrypted frames that make up a
//! steady-state message. 28 bytes, all integers big-endian:
//!
//! ```text
//! tag: i16 | body_len: u32 | data_len: u32 | command: [u8; 8]
//!          | req_id: u64   | version: u16
//! ```
//!
//! Encoding and decoding are pure and allocation-free beyond the output
//! array. The codec performs no semantic validation; supplying fewer than
//! 28 bytes to [`MessageHeader::decode`] is a caller contract violation.

use crate::{COMMAND_SIZE, CommandCode, HEADER_SIZE};

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Application flow/version tag.
    pub tag: i16,
    /// Length of the signed body in bytes.
    pub body_len: u32,
    /// Length of the raw payload segment appended after the signed body.
    pub data_len: u32,
    /// Command code routing this message to a handler.
    pub command: CommandCode,
    /// Correlation id linking requests and responses.
    pub req_id: u64,
    /// Protocol version the sender speaks.
    pub version: u16,
}

impl MessageHeader {
    /// Encode into the 28-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.tag.to_be_bytes());
        buf[2..6].copy_from_slice(&self.body_len.to_be_bytes());
        buf[6..10].copy_from_slice(&self.data_len.to_be_bytes());
        buf[10..18].copy_from_slice(self.command.as_bytes());
        buf[18..26].copy_from_slice(&self.req_id.to_be_bytes());
        buf[26..28].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    /// Decode from the 28-byte wire form.
    #[must_use]
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut command = [0u8; COMMAND_SIZE];
        command.copy_from_slice(&buf[10..18]);
        Self {
            tag: i16::from_be_bytes([buf[0], buf[1]]),
            body_len: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            data_len: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            command: CommandCode::from_bytes(command),
            req_id: u64::from_be_bytes([
                buf[18], buf[19], buf[20], buf[21], buf[22], buf[23], buf[24], buf[25],
            ]),
            version: u16::from_be_bytes([buf[26], buf[27]]),
        }
    }

    /// Total decrypted length of the body segment this header announces:
    /// `body_len + sign block + data_len`.
    #[must_use]
    pub fn segment_len(&self) -> usize {
        self.body_len as usize + crate::SIGN_BLOCK_SIZE + self.data_len as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_encode_layout() {
        let header = MessageHeader {
            tag: 1,
            body_len: 2,
            data_len: 3,
            command: CommandCode::from_bytes(*b"PING1234"),
            req_id: 0x0102_0304_0506_0708,
            version: 9,
        };

        let wire = header.encode();
        assert_eq!(&wire[0..2], &[0x00, 0x01]);
        assert_eq!(&wire[2..6], &[0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&wire[6..10], &[0x00, 0x00, 0x00, 0x03]);
        assert_eq!(&wire[10..18], b"PING1234");
        assert_eq!(&wire[18..26], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&wire[26..28], &[0x00, 0x09]);
    }

    #[test]
    fn test_negative_tag() {
        let header = MessageHeader {
            tag: -7,
            body_len: 0,
            data_len: 0,
            command: CommandCode::REQ_HEARTBEAT,
            req_id: 0,
            version: 1,
        };
        assert_eq!(MessageHeader::decode(&header.encode()).tag, -7);
    }

    #[test]
    fn test_segment_len() {
        let header = MessageHeader {
            tag: 0,
            body_len: 10,
            data_len: 20,
            command: CommandCode::REQ_UPLOAD_SLICE,
            req_id: 1,
            version: 1,
        };
        assert_eq!(header.segment_len(), 10 + crate::SIGN_BLOCK_SIZE + 20);
    }

    proptest! {
        #[test]
        fn prop_header_roundtrip(
            tag in any::<i16>(),
            body_len in any::<u32>(),
            data_len in any::<u32>(),
            command in any::<[u8; 8]>(),
            req_id in any::<u64>(),
            version in any::<u16>(),
        ) {
            let header = MessageHeader {
                tag,
                body_len,
                data_len,
                command: CommandCode::from_bytes(command),
                req_id,
                version,
            };
            prop_assert_eq!(MessageHeader::decode(&header.encode()), header);
        }
    }
}

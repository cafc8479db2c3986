//! 8-byte ASCII command codes.
//!
//! Commands identify the handler a message is routed to. They travel as
//! exactly eight bytes on the wire; shorter mnemonics are space-padded
//! when constructed through [`CommandCode::from_str_padded`], and the
//! codec itself never pads (callers of the raw constructor supply all
//! eight bytes).

use crate::COMMAND_SIZE;
use std::fmt;

/// Fixed-width command identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandCode([u8; COMMAND_SIZE]);

impl CommandCode {
    /// Heartbeat request.
    pub const REQ_HEARTBEAT: Self = Self(*b"ReqHeart");
    /// Heartbeat response.
    pub const RSP_HEARTBEAT: Self = Self(*b"RspHeart");
    /// Latency probe to an index node.
    pub const REQ_LATENCY: Self = Self(*b"ReqLatcy");
    /// Latency probe response.
    pub const RSP_LATENCY: Self = Self(*b"RspLatcy");
    /// Upload a file slice to a storage provider. High-volume: the
    /// outbound rate limiter, when enabled, applies to this command.
    pub const REQ_UPLOAD_SLICE: Self = Self(*b"ReqUpSlc");
    /// Upload slice acknowledgement.
    pub const RSP_UPLOAD_SLICE: Self = Self(*b"RspUpSlc");
    /// Download a file slice from a storage provider.
    pub const REQ_DOWNLOAD_SLICE: Self = Self(*b"ReqDlSlc");
    /// Download slice payload. High-volume: the inbound rate limiter,
    /// when enabled, applies to this command.
    pub const RSP_DOWNLOAD_SLICE: Self = Self(*b"RspDlSlc");
    /// Notice that a message used a protocol version below the
    /// receiver's floor. Defined for applications that want to reply;
    /// the transport itself skips stale messages silently.
    pub const RSP_BAD_VERSION: Self = Self(*b"RspBdVer");

    /// Build a command from its raw wire bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; COMMAND_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a command from an ASCII mnemonic, right-padding with spaces.
    /// Mnemonics longer than eight bytes are truncated, matching the
    /// wire contract that a command is always exactly eight bytes.
    #[must_use]
    pub fn from_str_padded(s: &str) -> Self {
        let mut bytes = [b' '; COMMAND_SIZE];
        let src = s.as_bytes();
        let n = src.len().min(COMMAND_SIZE);
        bytes[..n].copy_from_slice(&src[..n]);
        Self(bytes)
    }

    /// Raw wire bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; COMMAND_SIZE] {
        &self.0
    }

    /// Trimmed ASCII form for logging.
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0)
            .unwrap_or("<binary>")
            .trim_end_matches([' ', '\0'])
    }
}

impl fmt::Debug for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandCode({})", self.as_str())
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

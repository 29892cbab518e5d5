//! Wire format encoding and decoding for byte-stream transports.
//!
//! Implements the 10-byte header format:
//! ```text
//! ┌───────┬───────┬──────────┬──────────┐
//! │ Kind  │ Flags │ Sequence │ Length   │
//! │ 1 byte│ 1 byte│ 4 bytes  │ 4 bytes  │
//! │       │       │ uint32 BE│ uint32 BE│
//! └───────┴───────┴──────────┴──────────┘
//! ```
//!
//! `Kind` is a [`Phase`](super::Phase) code, or a status code when the
//! `IS_ERROR` flag is set. `Sequence` counts frames per direction from zero.

use crate::error::{Result, TxnError};

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_SIZE: usize = 10;

/// Default maximum payload size (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Flag constants for the protocol.
pub mod flags {
    /// Direction: connector to runtime (1) or runtime to connector (0).
    pub const IS_RESPONSE: u8 = 0b0000_0001;
    /// Status frame ending the stream with an error.
    pub const IS_ERROR: u8 = 0b0000_0010;

    /// Reserved bits mask (bits 2-7).
    pub const RESERVED_MASK: u8 = 0b1111_1100;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Phase code, or status code of an error frame.
    pub kind: u8,
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Frame sequence number within this direction.
    pub sequence: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: u8, flags: u8, sequence: u32, payload_length: u32) -> Self {
        Self {
            kind,
            flags,
            sequence,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use materialize_txn::protocol::{flags, Header, Phase};
    ///
    /// let header = Header::new(Phase::Loaded.code(), flags::IS_RESPONSE, 7, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), 10);
    /// assert_eq!(Header::decode(&bytes), Some(header));
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.kind;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.sequence.to_be_bytes());
        buf[6..10].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            kind: buf[0],
            flags: buf[1],
            sequence: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            payload_length: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Payload length doesn't exceed max
    /// - Reserved flag bits are 0
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(TxnError::Protocol(format!(
                "payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }
        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(TxnError::Protocol(format!(
                "reserved flag bits set: {:#010b}",
                self.flags
            )));
        }
        Ok(())
    }

    /// Check if this frame flows from connector to runtime.
    #[inline]
    pub fn is_response(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_RESPONSE)
    }

    /// Check if this is an error status frame.
    #[inline]
    pub fn is_error(&self) -> bool {
        flags::has_flag(self.flags, flags::IS_ERROR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let header = Header::new(0x82, flags::IS_RESPONSE, 0x01020304, 0x0a0b0c0d);
        assert_eq!(
            header.encode(),
            [0x82, 0x01, 0x01, 0x02, 0x03, 0x04, 0x0a, 0x0b, 0x0c, 0x0d]
        );
    }

    #[test]
    fn test_decode_short_buffer() {
        assert_eq!(Header::decode(&[0u8; HEADER_SIZE - 1]), None);
    }

    #[test]
    fn test_flags() {
        let header = Header::new(3, flags::IS_RESPONSE | flags::IS_ERROR, 0, 0);
        assert!(header.is_response());
        assert!(header.is_error());

        let header = Header::new(3, 0, 0, 0);
        assert!(!header.is_response());
        assert!(!header.is_error());
    }

    #[test]
    fn test_validate() {
        assert!(Header::new(1, 0, 0, 100).validate(100).is_ok());

        let err = Header::new(1, 0, 0, 101).validate(100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));

        let err = Header::new(1, 0b1000_0000, 0, 0).validate(100).unwrap_err();
        assert!(err.to_string().contains("reserved flag bits"));
    }
}

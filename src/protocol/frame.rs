//! Frame struct with typed accessors.
//!
//! Represents a complete byte-stream frame with header and payload.
//! Uses `bytes::Bytes` for zero-copy payload sharing.

use bytes::Bytes;

use super::messages::Phase;
use super::wire_format::{Header, HEADER_SIZE};

/// A complete byte-stream frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Phase of a data frame, or `None` for an error frame or unknown code.
    pub fn phase(&self) -> Option<Phase> {
        if self.header.is_error() {
            None
        } else {
            Phase::from_code(self.header.kind)
        }
    }

    /// Sequence number of this frame.
    #[inline]
    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    /// Check if this is an error status frame.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }
}

/// Build a complete frame as one contiguous buffer.
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;

    #[test]
    fn test_phase_of_data_frame() {
        let frame = Frame::new(Header::new(Phase::Flush.code(), 0, 4, 0), Bytes::new());
        assert_eq!(frame.phase(), Some(Phase::Flush));
        assert_eq!(frame.sequence(), 4);
    }

    #[test]
    fn test_error_frame_has_no_phase() {
        let frame = Frame::new(
            Header::new(Phase::Flush.code(), flags::IS_ERROR, 0, 4),
            Bytes::from_static(b"boom"),
        );
        assert!(frame.is_error());
        assert_eq!(frame.phase(), None);
    }

    #[test]
    fn test_build_frame() {
        let header = Header::new(Phase::Load.code(), 0, 0, 3);
        let bytes = build_frame(&header, b"abc");
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(&bytes[HEADER_SIZE..], b"abc");
    }
}

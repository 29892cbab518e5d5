//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 10 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//!
//! Frames must arrive with consecutive sequence numbers starting at zero; a
//! gap means bytes were lost and is a protocol error.
//!
//! # Example
//!
//! ```
//! use materialize_txn::protocol::{build_frame, FrameBuffer, Header, Phase};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(&Header::new(Phase::Flush.code(), 0, 0, 0), &[]);
//!
//! // Data arrives in chunks from the socket.
//! assert!(buffer.push(&bytes[..4]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[4..]).unwrap();
//! assert_eq!(frames[0].phase(), Some(Phase::Flush));
//! ```

use bytes::BytesMut;

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{Result, TxnError};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 10 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_payload_size: u32,
    /// Sequence number the next frame must carry.
    next_sequence: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max payload: 64MB.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a new frame buffer with custom max payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_payload_size,
            next_sequence: 0,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns a vector of complete frames (may be empty if still waiting
    /// for data). Partial data is buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns error if a header is invalid or out of sequence.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        if let State::WaitingForHeader = self.state {
            let header = match Header::decode(&self.buffer) {
                Some(header) => header,
                None => return Ok(None),
            };
            header.validate(self.max_payload_size)?;

            if header.sequence != self.next_sequence {
                return Err(TxnError::Protocol(format!(
                    "frame sequence {} received, expected {}",
                    header.sequence, self.next_sequence
                )));
            }
            self.next_sequence = self.next_sequence.wrapping_add(1);

            let _ = self.buffer.split_to(HEADER_SIZE);
            self.state = State::WaitingForPayload { header };
        }

        let State::WaitingForPayload { header } = self.state else {
            return Ok(None);
        };
        let remaining = header.payload_length as usize;
        if self.buffer.len() < remaining {
            return Ok(None);
        }

        // Zero-copy freeze of the payload.
        let payload = self.buffer.split_to(remaining).freeze();
        self.state = State::WaitingForHeader;

        Ok(Some(Frame::new(header, payload)))
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a frame is partially buffered.
    pub fn is_mid_frame(&self) -> bool {
        !self.buffer.is_empty() || matches!(self.state, State::WaitingForPayload { .. })
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

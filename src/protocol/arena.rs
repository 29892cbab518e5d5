//! Buffer packer for batched frame items.
//!
//! An [`Arena`] packs many variable-length byte payloads into one contiguous
//! buffer, handing back a [`Slice`] of `(begin, end)` offsets for each. A frame
//! carrying hundreds of items then moves as one buffer instead of one
//! allocation per item.
//!
//! Slices are only meaningful against the arena that produced them, and an
//! arena lives for exactly one frame.
//!
//! # Example
//!
//! ```
//! use materialize_txn::protocol::Arena;
//!
//! let mut arena = Arena::new();
//! let a = arena.add(b"hello");
//! let b = arena.add(b"world");
//! assert_eq!(arena.resolve(a), b"hello");
//!
//! let packed = arena.freeze();
//! assert_eq!(&b.get(&packed).unwrap()[..], b"world");
//! ```

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Offsets of one payload within an arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slice {
    /// Inclusive start offset.
    pub begin: u32,
    /// Exclusive end offset.
    pub end: u32,
}

impl Slice {
    /// Create a slice from offsets.
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    /// Length of the referenced payload.
    #[inline]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.begin) as usize
    }

    /// Whether the referenced payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }

    /// Whether this slice lies within an arena of `arena_len` bytes.
    #[inline]
    pub fn fits(&self, arena_len: usize) -> bool {
        self.begin <= self.end && self.end as usize <= arena_len
    }

    /// Resolve against a frozen arena. Zero-copy.
    ///
    /// Returns `None` if the slice lies outside `arena`.
    pub fn get(&self, arena: &Bytes) -> Option<Bytes> {
        if self.fits(arena.len()) {
            Some(arena.slice(self.begin as usize..self.end as usize))
        } else {
            None
        }
    }
}

/// Append-only byte buffer handing out stable slices.
#[derive(Debug, Default)]
pub struct Arena {
    buf: BytesMut,
}

impl Arena {
    /// Largest arena addressable by a [`Slice`].
    pub const MAX_LEN: usize = u32::MAX as usize;

    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an arena with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append `bytes`, returning the slice which resolves to them.
    ///
    /// # Panics
    ///
    /// Panics if the arena would outgrow [`Arena::MAX_LEN`]. Check
    /// [`has_room`](Arena::has_room) first when `bytes` comes from a caller.
    pub fn add(&mut self, bytes: &[u8]) -> Slice {
        assert!(
            self.has_room(bytes.len()),
            "arena of {} bytes cannot hold {} more",
            self.buf.len(),
            bytes.len()
        );
        let begin = self.buf.len() as u32;
        self.buf.extend_from_slice(bytes);
        Slice::new(begin, self.buf.len() as u32)
    }

    /// Whether `size` more bytes keep every offset within a `u32`.
    #[inline]
    pub fn has_room(&self, size: usize) -> bool {
        size <= Self::MAX_LEN - self.buf.len()
    }

    /// Append each payload in order, returning one slice per payload.
    pub fn add_all<I, B>(&mut self, payloads: I) -> Vec<Slice>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        payloads
            .into_iter()
            .map(|payload| self.add(payload.as_ref()))
            .collect()
    }

    /// Resolve a slice produced by this arena. O(1).
    ///
    /// # Panics
    ///
    /// Panics if `slice` was not produced by this arena.
    #[inline]
    pub fn resolve(&self, slice: Slice) -> &[u8] {
        &self.buf[slice.begin as usize..slice.end as usize]
    }

    /// Number of packed bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been packed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard all packed bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Freeze into an immutable buffer for sending.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Take the packed bytes, leaving this arena empty for the next frame.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

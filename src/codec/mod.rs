//! Codec module - serialization of frame payloads.
//!
//! Frame payloads are MessagePack maps produced by [`MsgPackCodec`]. Byte
//! fields (arenas, packed keys, JSON documents) travel as MessagePack `bin`
//! values, so documents are never re-encoded on their way through.
//!
//! # Example
//!
//! ```
//! use materialize_txn::codec::MsgPackCodec;
//! use materialize_txn::protocol::StartCommit;
//! use bytes::Bytes;
//!
//! let start = StartCommit { runtime_checkpoint: Bytes::from_static(br#"{"src":5}"#) };
//! let encoded = MsgPackCodec::encode(&start).unwrap();
//! let decoded: StartCommit = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, start);
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;

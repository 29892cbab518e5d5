//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always written with `to_vec_named`, as maps keyed by field
//! name. Adding an optional field to a message then stays readable by a peer
//! built against the previous shape, which positional arrays would not.

use crate::error::Result;

/// MessagePack codec for frame payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes, structs as maps.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TxnError;
    use crate::protocol::{Arena, ConnectorState, LoadBatch, LoadItem, Slice, StartedCommit};
    use bytes::Bytes;

    #[test]
    fn test_batch_survives_encoding() {
        let mut arena = Arena::new();
        let items = vec![
            LoadItem {
                key_packed: arena.add(b"\x02a\x00"),
                key_json: arena.add(br#"["a"]"#),
            },
            LoadItem {
                key_packed: arena.add(b"\x02b\x00"),
                key_json: Slice::default(),
            },
        ];
        let batch = LoadBatch {
            binding: 3,
            arena: arena.freeze(),
            items,
        };

        let encoded = MsgPackCodec::encode(&batch).unwrap();
        let decoded: LoadBatch = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, batch);
        assert_eq!(&decoded.resolve(decoded.items[0].key_json)[..], br#"["a"]"#);
    }

    #[test]
    fn test_structs_are_maps() {
        let started = StartedCommit {
            state: Some(ConnectorState::replace(Bytes::from_static(b"{}"))),
        };
        let encoded = MsgPackCodec::encode(&started).unwrap();

        // fixmap with one entry, not a fixarray.
        assert_eq!(encoded[0], 0x81, "Expected fixmap, got {:02X}", encoded[0]);
    }

    #[test]
    fn test_bytes_are_bin() {
        let encoded = MsgPackCodec::encode(&Bytes::from_static(b"\x01\x02\x03")).unwrap();
        assert_eq!(encoded, vec![0xc4, 0x03, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_absent_state_is_nil() {
        let started = StartedCommit { state: None };
        let encoded = MsgPackCodec::encode(&started).unwrap();
        let decoded: StartedCommit = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, started);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<LoadBatch> = MsgPackCodec::decode(b"not valid msgpack");
        assert!(matches!(result, Err(TxnError::MsgPackDecode(_))));
    }
}

//! Order-preserving tuple encoding of keys and values.
//!
//! Packed keys compare byte-wise in the same order as their tuples, which lets
//! a connector use them directly as storage keys. The layout is the
//! FoundationDB tuple layer restricted to the types documents produce:
//!
//! ```text
//! 0x00            nil
//! 0x01 .. 0x00    bytes   (0x00 inside escaped as 0x00 0xFF)
//! 0x02 .. 0x00    string  (UTF-8, same escaping)
//! 0x0c ..= 0x13   negative integer, 8..1 bytes, one's complement
//! 0x14            integer zero
//! 0x15 ..= 0x1c   positive integer, 1..8 bytes, big-endian
//! 0x21            f64, big-endian, sign-adjusted
//! 0x26 / 0x27     false / true
//! ```
//!
//! # Example
//!
//! ```
//! use materialize_txn::protocol::{pack, unpack, Element};
//!
//! let key = vec![Element::from("k1"), Element::Int(-3)];
//! let packed = pack(&key);
//! assert_eq!(unpack(&packed).unwrap(), key);
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const NIL: u8 = 0x00;
const BYTES: u8 = 0x01;
const STRING: u8 = 0x02;
const INT_ZERO: u8 = 0x14;
const DOUBLE: u8 = 0x21;
const FALSE: u8 = 0x26;
const TRUE: u8 = 0x27;
const ESCAPE: u8 = 0xff;

/// One element of a key or values tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Nil,
    Bytes(Bytes),
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl From<&str> for Element {
    fn from(s: &str) -> Self {
        Element::String(s.to_string())
    }
}

impl From<String> for Element {
    fn from(s: String) -> Self {
        Element::String(s)
    }
}

impl From<i64> for Element {
    fn from(n: i64) -> Self {
        Element::Int(n)
    }
}

impl From<f64> for Element {
    fn from(n: f64) -> Self {
        Element::Double(n)
    }
}

impl From<bool> for Element {
    fn from(b: bool) -> Self {
        Element::Bool(b)
    }
}

/// Errors decoding a packed tuple.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TupleError {
    #[error("unknown type code {code:#04x} at offset {offset}")]
    UnknownCode { code: u8, offset: usize },

    #[error("truncated tuple at offset {0}")]
    Truncated(usize),

    #[error("invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    #[error("integer at offset {0} overflows i64")]
    Overflow(usize),
}

/// Pack elements into a new buffer.
pub fn pack(elements: &[Element]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    pack_into(elements, &mut buf);
    buf.to_vec()
}

/// Pack elements onto the end of `buf`.
pub fn pack_into(elements: &[Element], buf: &mut BytesMut) {
    for element in elements {
        match element {
            Element::Nil => buf.put_u8(NIL),
            Element::Bytes(b) => {
                buf.put_u8(BYTES);
                put_escaped(buf, b);
            }
            Element::String(s) => {
                buf.put_u8(STRING);
                put_escaped(buf, s.as_bytes());
            }
            Element::Int(n) => put_int(buf, *n),
            Element::Double(f) => {
                let bits = f.to_bits();
                let adjusted = if bits & (1 << 63) != 0 {
                    !bits
                } else {
                    bits ^ (1 << 63)
                };
                buf.put_u8(DOUBLE);
                buf.put_u64(adjusted);
            }
            Element::Bool(false) => buf.put_u8(FALSE),
            Element::Bool(true) => buf.put_u8(TRUE),
        }
    }
}

fn put_escaped(buf: &mut BytesMut, data: &[u8]) {
    for &b in data {
        buf.put_u8(b);
        if b == 0x00 {
            buf.put_u8(ESCAPE);
        }
    }
    buf.put_u8(0x00);
}

fn put_int(buf: &mut BytesMut, n: i64) {
    if n == 0 {
        buf.put_u8(INT_ZERO);
        return;
    }
    let magnitude = n.unsigned_abs();
    let len = 8 - (magnitude.leading_zeros() / 8) as usize;

    let encoded = if n > 0 {
        buf.put_u8(INT_ZERO + len as u8);
        magnitude
    } else {
        buf.put_u8(INT_ZERO - len as u8);
        // One's complement within `len` bytes.
        let mask = if len == 8 { u64::MAX } else { (1u64 << (8 * len)) - 1 };
        mask - magnitude
    };
    buf.put_slice(&encoded.to_be_bytes()[8 - len..]);
}

/// Unpack a tuple produced by [`pack`].
pub fn unpack(data: &[u8]) -> Result<Vec<Element>, TupleError> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let code = data[pos];
        let start = pos;
        pos += 1;

        let element = match code {
            NIL => Element::Nil,
            BYTES => {
                let (raw, next) = take_escaped(data, pos)?;
                pos = next;
                Element::Bytes(Bytes::from(raw))
            }
            STRING => {
                let (raw, next) = take_escaped(data, pos)?;
                pos = next;
                Element::String(String::from_utf8(raw).map_err(|_| TupleError::InvalidUtf8(start))?)
            }
            0x0c..=0x1c => {
                let (n, next) = take_int(data, pos, code, start)?;
                pos = next;
                Element::Int(n)
            }
            DOUBLE => {
                let raw = data
                    .get(pos..pos + 8)
                    .ok_or(TupleError::Truncated(start))?;
                pos += 8;
                let mut be = [0u8; 8];
                be.copy_from_slice(raw);
                let adjusted = u64::from_be_bytes(be);
                let bits = if adjusted & (1 << 63) != 0 {
                    adjusted ^ (1 << 63)
                } else {
                    !adjusted
                };
                Element::Double(f64::from_bits(bits))
            }
            FALSE => Element::Bool(false),
            TRUE => Element::Bool(true),
            code => return Err(TupleError::UnknownCode { code, offset: start }),
        };
        out.push(element);
    }

    Ok(out)
}

fn take_escaped(data: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize), TupleError> {
    let start = pos;
    let mut out = Vec::new();
    loop {
        match data.get(pos) {
            None => return Err(TupleError::Truncated(start)),
            Some(0x00) if data.get(pos + 1) == Some(&ESCAPE) => {
                out.push(0x00);
                pos += 2;
            }
            Some(0x00) => return Ok((out, pos + 1)),
            Some(&b) => {
                out.push(b);
                pos += 1;
            }
        }
    }
}

fn take_int(data: &[u8], pos: usize, code: u8, start: usize) -> Result<(i64, usize), TupleError> {
    if code == INT_ZERO {
        return Ok((0, pos));
    }
    let positive = code > INT_ZERO;
    let len = if positive {
        (code - INT_ZERO) as usize
    } else {
        (INT_ZERO - code) as usize
    };

    let raw = data
        .get(pos..pos + len)
        .ok_or(TupleError::Truncated(start))?;
    let mut be = [0u8; 8];
    be[8 - len..].copy_from_slice(raw);
    let encoded = u64::from_be_bytes(be);

    let n = if positive {
        i64::try_from(encoded).map_err(|_| TupleError::Overflow(start))?
    } else {
        let mask = if len == 8 { u64::MAX } else { (1u64 << (8 * len)) - 1 };
        let magnitude = mask - encoded;
        if magnitude > i64::MIN.unsigned_abs() {
            return Err(TupleError::Overflow(start));
        }
        (-(magnitude as i128)) as i64
    };
    Ok((n, pos + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        assert_eq!(pack(&[Element::from("k1")]), vec![0x02, b'k', b'1', 0x00]);
    }

    #[test]
    fn test_embedded_nul_is_escaped() {
        let el = Element::Bytes(Bytes::from_static(b"a\x00b"));
        let packed = pack(&[el.clone()]);
        assert_eq!(packed, vec![0x01, b'a', 0x00, 0xff, b'b', 0x00]);
        assert_eq!(unpack(&packed).unwrap(), vec![el]);
    }

    #[test]
    fn test_integer_layout() {
        assert_eq!(pack(&[Element::Int(0)]), vec![0x14]);
        assert_eq!(pack(&[Element::Int(5)]), vec![0x15, 0x05]);
        assert_eq!(pack(&[Element::Int(256)]), vec![0x16, 0x01, 0x00]);
        assert_eq!(pack(&[Element::Int(-5)]), vec![0x13, 0xfa]);
        assert_eq!(pack(&[Element::Int(-256)]), vec![0x12, 0xfe, 0xff]);
    }

    #[test]
    fn test_integer_extremes() {
        for n in [i64::MIN, i64::MIN + 1, -1, 1, i64::MAX] {
            let packed = pack(&[Element::Int(n)]);
            assert_eq!(unpack(&packed).unwrap(), vec![Element::Int(n)], "{}", n);
        }
    }

    #[test]
    fn test_ordering_is_preserved() {
        let ordered = vec![
            vec![Element::Nil],
            vec![Element::Bytes(Bytes::from_static(b"a"))],
            vec![Element::from("a")],
            vec![Element::from("a"), Element::Int(1)],
            vec![Element::from("b")],
            vec![Element::Int(-1000)],
            vec![Element::Int(-1)],
            vec![Element::Int(0)],
            vec![Element::Int(7)],
            vec![Element::Int(1000)],
            vec![Element::Double(-2.5)],
            vec![Element::Double(0.0)],
            vec![Element::Double(2.5)],
            vec![Element::Bool(false)],
            vec![Element::Bool(true)],
        ];
        let packed: Vec<Vec<u8>> = ordered.iter().map(|t| pack(t)).collect();
        for pair in packed.windows(2) {
            assert!(pair[0] < pair[1], "{:?} !< {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_mixed_tuple() {
        let tuple = vec![
            Element::from("key"),
            Element::Int(-42),
            Element::Double(1.5),
            Element::Bool(true),
            Element::Nil,
        ];
        assert_eq!(unpack(&pack(&tuple)).unwrap(), tuple);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            unpack(&[0x02, b'a']),
            Err(TupleError::Truncated(1))
        );
        assert_eq!(
            unpack(&[0x99]),
            Err(TupleError::UnknownCode { code: 0x99, offset: 0 })
        );
        assert_eq!(unpack(&[0x16, 0x01]), Err(TupleError::Truncated(0)));
        assert_eq!(
            unpack(&[0x02, 0xff, 0xfe, 0x00]),
            Err(TupleError::InvalidUtf8(0))
        );
        assert_eq!(
            unpack(&[0x1c, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(TupleError::Overflow(0))
        );
    }
}

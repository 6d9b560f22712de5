//! # Order-preserving key codec
//!
//! Encodes heterogeneous scalar values and composite tuples into
//! self-describing byte strings whose **lexicographic byte order matches
//! the domain order** of the source values, across types:
//!
//! ```text
//! null < bool(false) < bool(true) < number < string < date < bytes < array < object
//! ```
//!
//! Numbers order numerically (including infinities), strings and bytes
//! lexicographically, dates chronologically. This lets any ordered
//! structure (secondary indexes, segment min/max bounds) compare raw
//! encoded bytes without decoding.
//!
//! # Wire format
//!
//! | Value        | Encoding                                                    |
//! |--------------|-------------------------------------------------------------|
//! | null         | `[0x01]`                                                    |
//! | bool         | `[0x02][0x00 or 0x01]`                                      |
//! | number       | `[0x03][8 bytes, big-endian, sign-flipped IEEE-754]`        |
//! | string       | `[0x04][escaped UTF-8][0x00]`                               |
//! | date         | `[0x05][8 bytes, big-endian, sign-flipped epoch millis]`    |
//! | bytes        | `[0x06][escaped bytes][0x00]`                               |
//! | array        | `[0x07][element…][0x00]`                                    |
//! | object       | `[0x08][0x01, escaped key, 0x00, value…][0x00]`             |
//!
//! - Non-negative doubles are XOR-flipped by `0x80…00`; negative doubles
//!   are fully bit-inverted. The result compares bytewise in numeric
//!   order. NaN is canonicalized to a single bit pattern and sorts
//!   **after every other number**, including `+∞`. `-0.0` is
//!   canonicalized to `0.0` so numeric equality and byte equality agree.
//! - Embedded `0x00` inside strings, bytes, and object keys is escaped
//!   as `0x00 0xFF`, so no component contains an unescaped terminator.
//! - Containers close with a reserved `0x00` end marker. Every type tag
//!   is `≥ 0x01`, so a shorter tuple sorts before any extension of it
//!   and prefix-equal composites compare by their next component.
//!
//! Composite keys concatenate component encodings, each followed by the
//! `0x00` terminator — see [`encode_composite`].
//!
//! # Determinism
//!
//! Every supported value maps to exactly one encoded form. Encoding
//! never fails; decoding fails with [`KeyCodecError`] on unknown tags,
//! truncation, or bad escapes.
//!
//! # Safety limits
//!
//! Decoding is bounded: container nesting deeper than
//! [`MAX_NESTING_DEPTH`] is rejected with [`KeyCodecError::TooDeep`]
//! instead of recursing, so a crafted buffer of repeated container
//! tags cannot exhaust the stack.


use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Type tags
// ------------------------------------------------------------------------------------------------

/// Reserved terminator / container end marker. Sorts below every tag.
const TERMINATOR: u8 = 0x00;
/// Escape continuation byte: `0x00 0xFF` represents a literal `0x00`.
const ESCAPE: u8 = 0xFF;
/// Precedes each object field, so an empty field name never reads as
/// the container end marker.
const FIELD_MARKER: u8 = 0x01;

const TAG_NULL: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_NUMBER: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_DATE: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_ARRAY: u8 = 0x07;
const TAG_OBJECT: u8 = 0x08;

const SIGN_BIT: u64 = 0x8000_0000_0000_0000;

/// Maximum container nesting depth accepted during decoding.
///
/// Each nesting level costs one stack frame of recursion, so untrusted
/// input must not control the depth. Real keys nest a handful of
/// levels; anything past this limit is rejected as malformed.
pub const MAX_NESTING_DEPTH: usize = 128;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced when decoding an encoded key.
#[derive(Debug, Error)]
pub enum KeyCodecError {
    /// The buffer ended before the value was complete.
    #[error("truncated key: need {needed} more bytes")]
    Truncated {
        /// Bytes required to continue decoding.
        needed: usize,
    },

    /// The type tag byte was not recognised.
    #[error("unknown key type tag 0x{0:02X}")]
    UnknownTag(u8),

    /// A string/bytes component or container ran out of input before its
    /// terminator.
    #[error("unterminated key component")]
    Unterminated,

    /// `0x00` was followed by a byte that is neither the escape
    /// continuation nor a valid terminator position.
    #[error("invalid escape sequence 0x00 0x{0:02X}")]
    BadEscape(u8),

    /// A decoded string component was not valid UTF-8.
    #[error("invalid UTF-8 in key string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Bytes remained after the value was fully decoded.
    #[error("trailing bytes after decoded key ({0} left)")]
    TrailingBytes(usize),

    /// Container nesting exceeded [`MAX_NESTING_DEPTH`].
    #[error("key nesting deeper than {MAX_NESTING_DEPTH} levels")]
    TooDeep,

    /// A character outside `[0-9a-fA-F]` appeared in a hex key string.
    #[error("invalid hex character {0:?}")]
    InvalidHex(char),
}

// ------------------------------------------------------------------------------------------------
// Key — tagged value sum
// ------------------------------------------------------------------------------------------------

/// A key component: the tagged sum of every encodable value.
///
/// The variant order mirrors the cross-type domain order.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    /// Absent / null. JSON `null` and absent optional fields both land here.
    Null,
    /// Boolean; `false` sorts before `true`.
    Bool(bool),
    /// IEEE-754 double. NaN sorts last among numbers.
    Number(f64),
    /// UTF-8 string, lexicographic byte order.
    String(String),
    /// Instant as signed milliseconds since the Unix epoch.
    Date(i64),
    /// Raw binary, lexicographic order.
    Bytes(Vec<u8>),
    /// Heterogeneous tuple.
    Array(Vec<Key>),
    /// Ordered field map. Field order is significant for encoding.
    Object(Vec<(String, Key)>),
}

impl Key {
    /// Encodes this value into its canonical ordered byte form.
    pub fn encode(&self) -> EncodedKey {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        EncodedKey(buf)
    }

    /// Decodes a single value that spans the whole input.
    ///
    /// Fails with [`KeyCodecError::TrailingBytes`] if input remains after
    /// the value.
    pub fn decode(bytes: &[u8]) -> Result<Self, KeyCodecError> {
        let (key, consumed) = Self::decode_one(bytes, 0)?;
        if consumed != bytes.len() {
            return Err(KeyCodecError::TrailingBytes(bytes.len() - consumed));
        }
        Ok(key)
    }

    /// Converts a JSON value into a key component.
    ///
    /// JSON has no date or binary type, so those variants never come out
    /// of this conversion; absent input (`undefined` in dynamic hosts)
    /// must be passed as `Value::Null` and maps to [`Key::Null`].
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Key::Null,
            serde_json::Value::Bool(b) => Key::Bool(*b),
            serde_json::Value::Number(n) => Key::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Key::String(s.clone()),
            serde_json::Value::Array(items) => {
                Key::Array(items.iter().map(Key::from_json).collect())
            }
            serde_json::Value::Object(map) => Key::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Key::from_json(v)))
                    .collect(),
            ),
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Key::Null => buf.push(TAG_NULL),
            Key::Bool(b) => {
                buf.push(TAG_BOOL);
                buf.push(u8::from(*b));
            }
            Key::Number(v) => {
                buf.push(TAG_NUMBER);
                buf.extend_from_slice(&encode_f64(*v));
            }
            Key::String(s) => {
                buf.push(TAG_STRING);
                escape_into(s.as_bytes(), buf);
                buf.push(TERMINATOR);
            }
            Key::Date(ms) => {
                buf.push(TAG_DATE);
                buf.extend_from_slice(&encode_i64(*ms));
            }
            Key::Bytes(b) => {
                buf.push(TAG_BYTES);
                escape_into(b, buf);
                buf.push(TERMINATOR);
            }
            Key::Array(items) => {
                buf.push(TAG_ARRAY);
                for item in items {
                    item.encode_into(buf);
                }
                buf.push(TERMINATOR);
            }
            Key::Object(fields) => {
                buf.push(TAG_OBJECT);
                for (name, value) in fields {
                    // Field marker disambiguates an empty field name
                    // from the container end marker.
                    buf.push(FIELD_MARKER);
                    escape_into(name.as_bytes(), buf);
                    buf.push(TERMINATOR);
                    value.encode_into(buf);
                }
                buf.push(TERMINATOR);
            }
        }
    }

    /// Decodes one value starting at `buf[0]`, returning it together with
    /// the number of bytes consumed. `depth` counts enclosing containers
    /// and is capped at [`MAX_NESTING_DEPTH`].
    fn decode_one(buf: &[u8], depth: usize) -> Result<(Self, usize), KeyCodecError> {
        let Some(&tag) = buf.first() else {
            return Err(KeyCodecError::Truncated { needed: 1 });
        };
        if depth >= MAX_NESTING_DEPTH && (tag == TAG_ARRAY || tag == TAG_OBJECT) {
            return Err(KeyCodecError::TooDeep);
        }
        let rest = &buf[1..];
        match tag {
            TAG_NULL => Ok((Key::Null, 1)),
            TAG_BOOL => {
                let Some(&b) = rest.first() else {
                    return Err(KeyCodecError::Truncated { needed: 1 });
                };
                Ok((Key::Bool(b != 0), 2))
            }
            TAG_NUMBER => {
                let raw = fixed8(rest)?;
                Ok((Key::Number(decode_f64(raw)), 9))
            }
            TAG_DATE => {
                let raw = fixed8(rest)?;
                Ok((Key::Date(decode_i64(raw)), 9))
            }
            TAG_STRING => {
                let (raw, n) = unescape(rest)?;
                Ok((Key::String(String::from_utf8(raw)?), 1 + n))
            }
            TAG_BYTES => {
                let (raw, n) = unescape(rest)?;
                Ok((Key::Bytes(raw), 1 + n))
            }
            TAG_ARRAY => {
                let mut items = Vec::new();
                let mut offset = 0;
                loop {
                    match rest.get(offset) {
                        None => return Err(KeyCodecError::Unterminated),
                        Some(&TERMINATOR) => return Ok((Key::Array(items), 1 + offset + 1)),
                        Some(_) => {
                            let (item, n) = Self::decode_one(&rest[offset..], depth + 1)?;
                            items.push(item);
                            offset += n;
                        }
                    }
                }
            }
            TAG_OBJECT => {
                let mut fields = Vec::new();
                let mut offset = 0;
                loop {
                    match rest.get(offset) {
                        None => return Err(KeyCodecError::Unterminated),
                        Some(&TERMINATOR) => return Ok((Key::Object(fields), 1 + offset + 1)),
                        Some(&FIELD_MARKER) => {
                            offset += 1;
                            let (raw, n) = unescape(&rest[offset..])?;
                            offset += n;
                            let name = String::from_utf8(raw)?;
                            let (value, n) = Self::decode_one(&rest[offset..], depth + 1)?;
                            offset += n;
                            fields.push((name, value));
                        }
                        Some(&other) => return Err(KeyCodecError::UnknownTag(other)),
                    }
                }
            }
            other => Err(KeyCodecError::UnknownTag(other)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// EncodedKey
// ------------------------------------------------------------------------------------------------

/// An encoded key: an opaque byte string whose `Ord` is the domain order
/// of the value it encodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncodedKey(Vec<u8>);

impl EncodedKey {
    /// Raw encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the key, returning the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Wraps raw bytes previously produced by [`Key::encode`] or
    /// [`encode_composite`]. Validity is checked on decode, not here.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Stable 32-bit hash of the encoded bytes.
    pub fn hash32(&self) -> u32 {
        crc32fast::hash(&self.0)
    }

    /// Lowercase hex rendering for debugging and on-wire ids.
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 2);
        for byte in &self.0 {
            out.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            out.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
        }
        out
    }

    /// Parses the output of [`EncodedKey::hex`].
    pub fn from_hex(hex: &str) -> Result<Self, KeyCodecError> {
        let chars: Vec<char> = hex.chars().collect();
        if chars.len() % 2 != 0 {
            return Err(KeyCodecError::Truncated { needed: 1 });
        }
        let mut bytes = Vec::with_capacity(chars.len() / 2);
        for pair in chars.chunks_exact(2) {
            let hi = hex_nibble(pair[0])?;
            let lo = hex_nibble(pair[1])?;
            bytes.push((hi << 4) | lo);
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for EncodedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

fn hex_nibble(c: char) -> Result<u8, KeyCodecError> {
    match c {
        '0'..='9' => Ok(c as u8 - b'0'),
        'a'..='f' => Ok(c as u8 - b'a' + 10),
        'A'..='F' => Ok(c as u8 - b'A' + 10),
        other => Err(KeyCodecError::InvalidHex(other)),
    }
}

// ------------------------------------------------------------------------------------------------
// Composite keys
// ------------------------------------------------------------------------------------------------

/// Encodes a composite key: each component's encoding followed by the
/// reserved `0x00` terminator.
///
/// For two composites with an equal prefix, byte order is decided by the
/// first differing component, so
/// `compare(encode_composite(&[ns, n1]), encode_composite(&[ns, n2]))`
/// agrees with `n1.cmp(n2)`.
pub fn encode_composite(parts: &[Key]) -> EncodedKey {
    let mut buf = Vec::new();
    for part in parts {
        part.encode_into(&mut buf);
        buf.push(TERMINATOR);
    }
    EncodedKey(buf)
}

/// Decodes the output of [`encode_composite`] back into its components.
pub fn decode_composite(key: &EncodedKey) -> Result<Vec<Key>, KeyCodecError> {
    let bytes = key.as_bytes();
    let mut parts = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (part, n) = Key::decode_one(&bytes[offset..], 0)?;
        offset += n;
        match bytes.get(offset) {
            Some(&TERMINATOR) => offset += 1,
            Some(_) | None => return Err(KeyCodecError::Unterminated),
        }
        parts.push(part);
    }
    Ok(parts)
}

/// Compares two encoded keys. Plain lexicographic byte order — the
/// encoding guarantees this equals the domain order.
pub fn compare(a: &EncodedKey, b: &EncodedKey) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

// ------------------------------------------------------------------------------------------------
// Scalar transforms
// ------------------------------------------------------------------------------------------------

/// Sign-flip transform making IEEE-754 doubles compare bytewise in
/// numeric order. `-0.0` folds into `0.0`; every NaN folds into the
/// positive quiet NaN, which sorts above `+∞`.
fn encode_f64(v: f64) -> [u8; 8] {
    let v = if v.is_nan() {
        f64::NAN
    } else if v == 0.0 {
        0.0
    } else {
        v
    };
    let bits = v.to_bits();
    let flipped = if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits ^ SIGN_BIT
    };
    flipped.to_be_bytes()
}

fn decode_f64(raw: [u8; 8]) -> f64 {
    let flipped = u64::from_be_bytes(raw);
    let bits = if flipped & SIGN_BIT != 0 {
        flipped ^ SIGN_BIT
    } else {
        !flipped
    };
    f64::from_bits(bits)
}

/// Signed-integer flip: XOR of the sign bit makes two's-complement
/// values compare bytewise in numeric order. Dates before 1970 are
/// negative millis and order correctly.
fn encode_i64(v: i64) -> [u8; 8] {
    ((v as u64) ^ SIGN_BIT).to_be_bytes()
}

fn decode_i64(raw: [u8; 8]) -> i64 {
    (u64::from_be_bytes(raw) ^ SIGN_BIT) as i64
}

fn fixed8(buf: &[u8]) -> Result<[u8; 8], KeyCodecError> {
    if buf.len() < 8 {
        return Err(KeyCodecError::Truncated {
            needed: 8 - buf.len(),
        });
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    Ok(raw)
}

// ------------------------------------------------------------------------------------------------
// 0x00 escaping
// ------------------------------------------------------------------------------------------------

fn escape_into(data: &[u8], buf: &mut Vec<u8>) {
    for &byte in data {
        if byte == TERMINATOR {
            buf.push(TERMINATOR);
            buf.push(ESCAPE);
        } else {
            buf.push(byte);
        }
    }
}

/// Reads an escaped component up to (and including) its terminator.
/// Returns the unescaped payload and the bytes consumed.
fn unescape(buf: &[u8]) -> Result<(Vec<u8>, usize), KeyCodecError> {
    let mut out = Vec::new();
    let mut offset = 0;
    loop {
        match buf.get(offset) {
            None => return Err(KeyCodecError::Unterminated),
            Some(&TERMINATOR) => match buf.get(offset + 1) {
                Some(&ESCAPE) => {
                    out.push(TERMINATOR);
                    offset += 2;
                }
                _ => return Ok((out, offset + 1)),
            },
            Some(&byte) => {
                out.push(byte);
                offset += 1;
            }
        }
    }
}

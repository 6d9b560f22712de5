//! # Split-block bloom filter
//!
//! Parquet-compatible probabilistic membership structure used for
//! predicate-pushdown point lookups against sealed segments.
//!
//! ## Filter layout
//!
//! The filter is a contiguous array of **32-byte blocks**; each block is
//! eight little-endian `u32` words. One value touches exactly one block:
//!
//! 1. The value is canonicalized through the key codec and hashed with
//!    [`xxhash64`] (seed 0).
//! 2. The upper 32 hash bits select the block (`mod block_count`).
//! 3. Each of the eight words gets one bit in `0..32`, derived by
//!    multiplying the lower 32 hash bits with that word's Parquet SALT
//!    constant and taking the top five bits.
//!
//! Insertion sets all eight bits; membership requires all eight. False
//! negatives are impossible; the false-positive rate is set by the
//! caller through the byte size.
//!
//! ## On-disk framing
//!
//! A sealed filter is preceded by a Parquet Thrift-compact header:
//!
//! ```text
//! [field 1, i32]  numBytes
//! [field 2, union] algorithm   = SPLIT_BLOCK
//! [field 3, union] hash        = XXHASH
//! [field 4, union] compression = UNCOMPRESSED
//! [stop]
//! [numBytes of raw filter data]
//! ```
//!
//! [`parse_header`] accepts truncated headers that stop after `numBytes`
//! (unions default to their only variant). [`BloomSidecar`] maps a
//! sealed header+data file read-only, the way segment files are opened.

mod xxhash;


use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::keycodec::Key;

pub use xxhash::xxhash64;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Bytes per block: eight 32-bit words.
pub const BLOCK_BYTES: usize = 32;

/// Parquet split-block salt constants, one per word in a block.
const SALT: [u32; 8] = [
    0x47b6137b, 0x44974d91, 0x8824ad5b, 0xa2b7289d, 0x705495c7, 0x2df1424b, 0x9efc4947, 0x5c6bfb31,
];

// Thrift compact-protocol type nibbles used by the header.
const CT_I32: u8 = 0x05;
const CT_STRUCT: u8 = 0x0C;
const CT_STOP: u8 = 0x00;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by filter construction and header framing.
#[derive(Debug, Error)]
pub enum BloomError {
    /// Filter byte size was zero or not a multiple of 32.
    #[error("bloom filter size {0} is not a positive multiple of 32 bytes")]
    InvalidSize(usize),

    /// The Thrift-compact header could not be parsed.
    #[error("malformed bloom filter header: {0}")]
    MalformedHeader(String),

    /// The header claims more data bytes than the input holds.
    #[error("bloom filter data truncated: header claims {claimed} bytes, {available} available")]
    DataTruncated {
        /// Bytes the header's `numBytes` field claims.
        claimed: usize,
        /// Bytes actually present after the header.
        available: usize,
    },

    /// Underlying I/O error while opening a sidecar file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// SplitBlockFilter
// ------------------------------------------------------------------------------------------------

/// In-memory split-block bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitBlockFilter {
    blocks: Vec<[u32; 8]>,
}

impl SplitBlockFilter {
    /// Creates an empty filter of `num_bytes` total size.
    ///
    /// `num_bytes` must be a positive multiple of 32.
    pub fn new(num_bytes: usize) -> Result<Self, BloomError> {
        if num_bytes == 0 || num_bytes % BLOCK_BYTES != 0 {
            return Err(BloomError::InvalidSize(num_bytes));
        }
        Ok(Self {
            blocks: vec![[0u32; 8]; num_bytes / BLOCK_BYTES],
        })
    }

    /// Creates an empty filter with the given number of 32-byte blocks.
    pub fn with_block_count(block_count: usize) -> Result<Self, BloomError> {
        Self::new(block_count * BLOCK_BYTES)
    }

    /// Reconstructs a filter from raw little-endian filter bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, BloomError> {
        if data.is_empty() || data.len() % BLOCK_BYTES != 0 {
            return Err(BloomError::InvalidSize(data.len()));
        }
        let mut blocks = Vec::with_capacity(data.len() / BLOCK_BYTES);
        for chunk in data.chunks_exact(BLOCK_BYTES) {
            let mut block = [0u32; 8];
            for (word, raw) in block.iter_mut().zip(chunk.chunks_exact(4)) {
                *word = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            }
            blocks.push(block);
        }
        Ok(Self { blocks })
    }

    /// Serializes the filter data (no header) as little-endian words.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.num_bytes());
        for block in &self.blocks {
            for word in block {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        out
    }

    /// Total filter size in bytes.
    pub fn num_bytes(&self) -> usize {
        self.blocks.len() * BLOCK_BYTES
    }

    /// Number of 32-byte blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Inserts a precomputed xxHash64.
    pub fn insert_hash(&mut self, hash: u64) {
        let index = self.block_index(hash);
        let mask = block_mask(hash as u32);
        let block = &mut self.blocks[index];
        for (word, bit) in block.iter_mut().zip(mask) {
            *word |= bit;
        }
    }

    /// Tests a precomputed xxHash64. All eight bits must be set.
    pub fn check_hash(&self, hash: u64) -> bool {
        let index = self.block_index(hash);
        let mask = block_mask(hash as u32);
        let block = &self.blocks[index];
        block.iter().zip(mask).all(|(word, bit)| word & bit == bit)
    }

    /// Inserts any codec-supported value, canonicalized through the key
    /// codec before hashing.
    pub fn insert_value(&mut self, value: &Key) {
        self.insert_hash(hash_value(value));
    }

    /// Membership test for any codec-supported value.
    ///
    /// `false` means definitely absent; `true` means possibly present.
    pub fn might_contain(&self, value: &Key) -> bool {
        self.check_hash(hash_value(value))
    }

    /// Serializes the Thrift-compact header followed by the filter data.
    pub fn to_sidecar_bytes(&self) -> Vec<u8> {
        let header = BloomFilterHeader {
            num_bytes: self.num_bytes() as i32,
            algorithm: BloomAlgorithm::SplitBlock,
            hash: BloomHash::XxHash,
            compression: BloomCompression::Uncompressed,
        };
        let mut out = Vec::with_capacity(self.num_bytes() + 24);
        write_header(&header, &mut out);
        out.extend_from_slice(&self.to_bytes());
        out
    }

    fn block_index(&self, hash: u64) -> usize {
        ((hash >> 32) % self.blocks.len() as u64) as usize
    }
}

/// Canonical hash of a key value: encode, then xxHash64 with seed 0.
pub fn hash_value(value: &Key) -> u64 {
    xxhash64(value.encode().as_bytes(), 0)
}

/// Derives the eight-bit block mask from the lower 32 hash bits.
#[inline]
fn block_mask(key: u32) -> [u32; 8] {
    let mut mask = [0u32; 8];
    for (slot, salt) in mask.iter_mut().zip(SALT) {
        *slot = 1 << (salt.wrapping_mul(key) >> 27);
    }
    mask
}

// ------------------------------------------------------------------------------------------------
// Thrift-compact header
// ------------------------------------------------------------------------------------------------

/// Algorithm union. Only SPLIT_BLOCK exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomAlgorithm {
    /// Parquet split-block algorithm.
    SplitBlock,
}

/// Hash union. Only XXHASH exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomHash {
    /// xxHash64 with seed 0.
    XxHash,
}

/// Compression union. Only UNCOMPRESSED exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BloomCompression {
    /// Raw, uncompressed filter bytes.
    Uncompressed,
}

/// Parsed bloom filter file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomFilterHeader {
    /// Size of the filter data that follows the header.
    pub num_bytes: i32,
    /// Filter algorithm.
    pub algorithm: BloomAlgorithm,
    /// Hash function.
    pub hash: BloomHash,
    /// Data compression.
    pub compression: BloomCompression,
}

/// Serializes the header in Thrift compact protocol.
pub fn write_header(header: &BloomFilterHeader, out: &mut Vec<u8>) {
    // Field 1, i32: numBytes as zigzag varint.
    out.push((1 << 4) | CT_I32);
    write_varint(zigzag32(header.num_bytes), out);
    // Fields 2..4: unions, each holding its single variant as field 1,
    // an empty struct.
    for _ in 0..3 {
        out.push((1 << 4) | CT_STRUCT); // outer field, delta 1
        out.push((1 << 4) | CT_STRUCT); // union variant 1
        out.push(CT_STOP); // end of empty variant struct
        out.push(CT_STOP); // end of union
    }
    out.push(CT_STOP);
}

/// Parses a Thrift-compact bloom header.
///
/// Returns the header and the offset at which raw filter data begins.
/// Union fields absent from the input default to their only variant, so
/// a minimal `numBytes`-only header parses.
pub fn parse_header(bytes: &[u8]) -> Result<(BloomFilterHeader, usize), BloomError> {
    let mut offset = 0usize;
    let mut field_id: i16 = 0;
    let mut num_bytes: Option<i32> = None;

    loop {
        let Some(&byte) = bytes.get(offset) else {
            return Err(BloomError::MalformedHeader(
                "unexpected end of header".into(),
            ));
        };
        offset += 1;
        if byte == CT_STOP {
            break;
        }

        let delta = (byte >> 4) as i16;
        let ctype = byte & 0x0F;
        if delta == 0 {
            return Err(BloomError::MalformedHeader(
                "long-form field ids are not used by bloom headers".into(),
            ));
        }
        field_id += delta;

        match (field_id, ctype) {
            (1, CT_I32) => {
                let (raw, n) = read_varint(&bytes[offset..])?;
                offset += n;
                num_bytes = Some(unzigzag32(raw));
            }
            (2..=4, CT_STRUCT) => {
                offset += skip_union(&bytes[offset..])?;
            }
            (id, t) => {
                return Err(BloomError::MalformedHeader(format!(
                    "unexpected field {id} of compact type 0x{t:X}"
                )));
            }
        }
    }

    let Some(num_bytes) = num_bytes else {
        return Err(BloomError::MalformedHeader("missing numBytes".into()));
    };
    if num_bytes < 0 {
        return Err(BloomError::MalformedHeader(format!(
            "negative numBytes {num_bytes}"
        )));
    }

    Ok((
        BloomFilterHeader {
            num_bytes,
            algorithm: BloomAlgorithm::SplitBlock,
            hash: BloomHash::XxHash,
            compression: BloomCompression::Uncompressed,
        },
        offset,
    ))
}

/// Skips a union holding one empty-struct variant. Returns bytes consumed.
fn skip_union(bytes: &[u8]) -> Result<usize, BloomError> {
    let mut offset = 0usize;
    // Variant field header (or immediate stop for a degenerate empty union).
    let Some(&variant) = bytes.get(offset) else {
        return Err(BloomError::MalformedHeader("truncated union".into()));
    };
    offset += 1;
    if variant == CT_STOP {
        return Ok(offset);
    }
    if variant & 0x0F != CT_STRUCT {
        return Err(BloomError::MalformedHeader(format!(
            "union variant has compact type 0x{:X}, expected struct",
            variant & 0x0F
        )));
    }
    // Empty variant struct: immediate stop.
    match bytes.get(offset) {
        Some(&CT_STOP) => offset += 1,
        _ => return Err(BloomError::MalformedHeader("unterminated union variant".into())),
    }
    // Union stop.
    match bytes.get(offset) {
        Some(&CT_STOP) => offset += 1,
        _ => return Err(BloomError::MalformedHeader("unterminated union".into())),
    }
    Ok(offset)
}

fn zigzag32(v: i32) -> u64 {
    (((v << 1) ^ (v >> 31)) as u32) as u64
}

fn unzigzag32(raw: u64) -> i32 {
    let raw = raw as u32;
    ((raw >> 1) as i32) ^ -((raw & 1) as i32)
}

fn write_varint(mut v: u64, out: &mut Vec<u8>) {
    loop {
        if v < 0x80 {
            out.push(v as u8);
            return;
        }
        out.push((v as u8 & 0x7F) | 0x80);
        v >>= 7;
    }
}

fn read_varint(bytes: &[u8]) -> Result<(u64, usize), BloomError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return Err(BloomError::MalformedHeader("varint overflow".into()));
        }
    }
    Err(BloomError::MalformedHeader("truncated varint".into()))
}

// ------------------------------------------------------------------------------------------------
// BloomSidecar — sealed, mmapped filter file
// ------------------------------------------------------------------------------------------------

/// A sealed bloom filter file: Thrift-compact header followed by
/// `numBytes` of filter data, mapped read-only.
pub struct BloomSidecar {
    mmap: Mmap,
    header: BloomFilterHeader,
    data_offset: usize,
}

impl BloomSidecar {
    /// Opens and validates a sidecar file.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }` but is memory-safe because the
    /// file is sealed (never written after creation), the mapping is
    /// read-only, and all offsets are validated before slicing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BloomError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let (header, data_offset) = parse_header(&mmap)?;
        let claimed = header.num_bytes as usize;
        let available = mmap.len().saturating_sub(data_offset);
        if available < claimed {
            return Err(BloomError::DataTruncated { claimed, available });
        }
        Ok(Self {
            mmap,
            header,
            data_offset,
        })
    }

    /// The parsed header.
    pub fn header(&self) -> &BloomFilterHeader {
        &self.header
    }

    /// Offset of the raw filter data within the file.
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    /// Raw filter data bytes.
    pub fn data(&self) -> &[u8] {
        &self.mmap[self.data_offset..self.data_offset + self.header.num_bytes as usize]
    }

    /// Materializes the filter for querying.
    pub fn filter(&self) -> Result<SplitBlockFilter, BloomError> {
        SplitBlockFilter::from_bytes(self.data())
    }
}

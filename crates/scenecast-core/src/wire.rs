//! scenecast wire format: on-wire headers for scene updates and resource streams.
//!
//! These types ARE the protocol. Every field, every size and every enumerator
//! value is persisted implicitly in every packet; changing one breaks wire
//! compatibility with existing producers and consumers.
//!
//! All multi-byte integers are little-endian. Headers are zerocopy structs of
//! unaligned little-endian fields, so reading and writing is a plain copy with
//! no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Scene update packets ──────────────────────────────────────────────────────

/// Prefix of every packet produced by the packet framer.
///
/// `sequence` starts at 1 for the first packet of an update and increments by
/// one per packet; `continuation` is one of the two packet sentinels.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PacketHeader {
    pub sequence: U32<LittleEndian>,
    pub continuation: U32<LittleEndian>,
}

assert_eq_size!(PacketHeader, [u8; 8]);

impl PacketHeader {
    pub fn new(sequence: u32, continuation: Continuation) -> Self {
        Self {
            sequence: U32::new(sequence),
            continuation: U32::new(continuation as u32),
        }
    }
}

/// Header of a block inside a scene update stream.
///
/// `size` counts every byte that follows this header and belongs to the
/// block, including the block's inner length header.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct BlockHeader {
    pub block_type: U32<LittleEndian>,
    pub size: U32<LittleEndian>,
}

assert_eq_size!(BlockHeader, [u8; 8]);

impl BlockHeader {
    pub fn new(block_type: BlockType, size: u32) -> Self {
        Self {
            block_type: U32::new(block_type as u32),
            size: U32::new(size),
        }
    }
}

/// Two parallel lengths following a command-log or resource block header.
///
/// Command log: (structural table length, raw data length).
/// Resource:    (metadata length, blob length).
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct LengthPair {
    pub first: U32<LittleEndian>,
    pub second: U32<LittleEndian>,
}

assert_eq_size!(LengthPair, [u8; 8]);

impl LengthPair {
    pub fn new(first: u32, second: u32) -> Self {
        Self {
            first: U32::new(first),
            second: U32::new(second),
        }
    }
}

/// Block type enumerators. Stable, persisted in every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockType {
    CommandLog = 1,
    Resource = 2,
    FlushMetadata = 3,
}

impl TryFrom<u32> for BlockType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(BlockType::CommandLog),
            2 => Ok(BlockType::Resource),
            3 => Ok(BlockType::FlushMetadata),
            other => Err(WireError::UnknownBlockType(other)),
        }
    }
}

/// Packet continuation sentinels.
///
/// Distinct from each other and from every `BlockType` enumerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Continuation {
    MoreFollows = 0xC0FF_EE01,
    Last = 0xC0FF_EEFF,
}

impl TryFrom<u32> for Continuation {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0xC0FF_EE01 => Ok(Continuation::MoreFollows),
            0xC0FF_EEFF => Ok(Continuation::Last),
            other => Err(WireError::UnknownContinuation(other)),
        }
    }
}

// ── Resource stream frames ────────────────────────────────────────────────────

/// Header preceding every resource in a resource stream.
///
/// Written atomically: a frame header never spans two packets.
///
/// Wire size: 40 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    pub metadata_size: U32<LittleEndian>,
    pub blob_size: U32<LittleEndian>,
    pub content_hash: [u8; 32],
}

assert_eq_size!(FrameHeader, [u8; 40]);

impl FrameHeader {
    pub fn new(metadata_size: u32, blob_size: u32, content_hash: [u8; 32]) -> Self {
        Self {
            metadata_size: U32::new(metadata_size),
            blob_size: U32::new(blob_size),
            content_hash,
        }
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the scene update packet header.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Size of a block header.
pub const BLOCK_HEADER_SIZE: usize = 8;

/// Size of the inner length pair of command-log and resource blocks.
pub const LENGTH_PAIR_SIZE: usize = 8;

/// Size of the inner length field of a flush-metadata block.
pub const FLUSH_LENGTH_SIZE: usize = 4;

/// Smallest packet the framer accepts: the packet header plus the largest
/// atomic block preamble (block header + length pair).
pub const MIN_PACKET_CAPACITY: usize = PACKET_HEADER_SIZE + BLOCK_HEADER_SIZE + LENGTH_PAIR_SIZE;

/// Size of the packet number prefixing every resource stream packet.
pub const STREAM_PACKET_NUMBER_SIZE: usize = 4;

/// Size of a resource stream frame header.
pub const FRAME_HEADER_SIZE: usize = 40;

/// Default packet size for transports that don't negotiate one.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 65_000;

/// Default cap on the reassembled size of one scene update.
pub const DEFAULT_MAX_UPDATE_SIZE: usize = 512 * 1024 * 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown block type: {0}")]
    UnknownBlockType(u32),

    #[error("unknown continuation flag: 0x{0:08x}")]
    UnknownContinuation(u32),

    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("{what} of {size} bytes does not fit a 32-bit length field")]
    TooLarge { what: &'static str, size: usize },
}

/// Convert an in-memory length to its 32-bit wire field.
pub fn wire_length(size: usize, what: &'static str) -> Result<u32, WireError> {
    u32::try_from(size).map_err(|_| WireError::TooLarge { what, size })
}

/// Read a zerocopy header from the front of `bytes`.
pub fn read_header<T: FromBytes>(bytes: &[u8], what: &'static str) -> Result<T, WireError> {
    T::read_from_prefix(bytes).ok_or(WireError::Truncated {
        what,
        need: std::mem::size_of::<T>(),
        have: bytes.len(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

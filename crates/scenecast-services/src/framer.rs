//! Packet framer: scene updates to fixed-capacity packets and back.
//!
//! Every packet starts with a `PacketHeader`. The update itself is a sequence
//! of blocks: exactly one command log, one block per resource and an optional
//! flush-metadata block, in that order. A block header and its inner length
//! header are always written into the same packet; payload bytes are split
//! wherever the packet runs out.

use std::sync::Arc;

use bytes::Bytes;
use scenecast_core::hash::ResourceContentHash;
use scenecast_core::resource::{Resource, ResourceError, ResourceHeader};
use scenecast_core::scene_update::{CommandLog, CommandLogError, FlushMetadata, SceneUpdate};
use scenecast_core::stats::TransportStatistics;
use scenecast_core::wire::{
    self, wire_length, BlockHeader, BlockType, Continuation, LengthPair, PacketHeader,
    WireError, BLOCK_HEADER_SIZE, DEFAULT_MAX_UPDATE_SIZE, FLUSH_LENGTH_SIZE, LENGTH_PAIR_SIZE,
    MIN_PACKET_CAPACITY, PACKET_HEADER_SIZE,
};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::AsBytes;

const HASH_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum FramerError {
    #[error("packet capacity {capacity} is below the minimum of {MIN_PACKET_CAPACITY}")]
    CapacityTooSmall { capacity: usize },

    #[error("packet sink rejected packet {sequence}")]
    SinkRejected { sequence: u32 },

    #[error("flush metadata could not be encoded: {0}")]
    FlushEncoding(#[from] serde_json::Error),

    #[error(transparent)]
    Wire(#[from] WireError),
}

// ── Send side ─────────────────────────────────────────────────────────────────

/// Serializes one scene update into packets.
pub struct SceneUpdateSerializer<'a> {
    update: &'a SceneUpdate,
    stats: Option<&'a TransportStatistics>,
}

impl<'a> SceneUpdateSerializer<'a> {
    pub fn new(update: &'a SceneUpdate) -> Self {
        Self {
            update,
            stats: None,
        }
    }

    /// Report every finalized packet to `stats`.
    pub fn with_statistics(mut self, stats: &'a TransportStatistics) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Write the update into `packet`, handing each finalized packet to
    /// `sink`. The whole of `packet` is the capacity.
    ///
    /// Returns the number of packets emitted. A `false` from the sink, or a
    /// block too large for its 32-bit length fields, aborts the update;
    /// packets already handed over are not recalled.
    pub fn write_to_packets<F>(&self, packet: &mut [u8], sink: F) -> Result<u32, FramerError>
    where
        F: FnMut(&[u8]) -> bool,
    {
        if packet.len() < MIN_PACKET_CAPACITY {
            tracing::error!(
                capacity = packet.len(),
                minimum = MIN_PACKET_CAPACITY,
                "packet capacity too small, scene update not sent"
            );
            return Err(FramerError::CapacityTooSmall {
                capacity: packet.len(),
            });
        }

        // Encoded before the first byte goes out so a failure emits nothing.
        let flush = self
            .update
            .flush
            .as_ref()
            .map(FlushMetadata::to_bytes)
            .transpose()?;

        let mut writer = PacketWriter {
            packet,
            used: 0,
            sequence: 0,
            sink,
            stats: self.stats,
        };

        let commands = &self.update.commands;
        let table = commands.table_bytes();
        writer.write_pair_header(BlockType::CommandLog, &table, commands.data())?;
        writer.write_payload(&table)?;
        writer.write_payload(commands.data())?;

        for resource in &self.update.resources {
            let mut metadata = Vec::with_capacity(HASH_SIZE + resource.header().serialized_size());
            metadata.extend_from_slice(resource.hash().as_bytes());
            resource.header().write_to(&mut metadata);
            let (_, blob) = resource.stream_blob();

            writer.write_pair_header(BlockType::Resource, &metadata, &blob)?;
            writer.write_payload(&metadata)?;
            writer.write_payload(&blob)?;
        }

        if let Some(flush) = flush {
            let mut preamble = [0u8; BLOCK_HEADER_SIZE + FLUSH_LENGTH_SIZE];
            let block = BlockHeader::new(
                BlockType::FlushMetadata,
                wire_length(FLUSH_LENGTH_SIZE + flush.len(), "flush metadata block")?,
            );
            let len = wire_length(flush.len(), "flush metadata")?;
            preamble[..BLOCK_HEADER_SIZE].copy_from_slice(block.as_bytes());
            preamble[BLOCK_HEADER_SIZE..].copy_from_slice(&len.to_le_bytes());
            writer.write_header(&preamble)?;
            writer.write_payload(&flush)?;
        }

        writer.finish()?;
        tracing::debug!(
            packets = writer.sequence,
            commands = commands.len(),
            resources = self.update.resources.len(),
            "scene update serialized"
        );
        Ok(writer.sequence)
    }
}

struct PacketWriter<'p, 's, F> {
    packet: &'p mut [u8],
    /// Bytes used in the open packet, header included. 0 = no packet open.
    used: usize,
    sequence: u32,
    sink: F,
    stats: Option<&'s TransportStatistics>,
}

impl<F> PacketWriter<'_, '_, F>
where
    F: FnMut(&[u8]) -> bool,
{
    fn open(&mut self) {
        if self.used == 0 {
            self.sequence += 1;
            self.used = PACKET_HEADER_SIZE;
        }
    }

    fn remaining(&self) -> usize {
        self.packet.len() - self.used
    }

    fn finalize(&mut self, continuation: Continuation) -> Result<(), FramerError> {
        let header = PacketHeader::new(self.sequence, continuation);
        self.packet[..PACKET_HEADER_SIZE].copy_from_slice(header.as_bytes());
        let size = std::mem::take(&mut self.used);

        if let Some(stats) = self.stats {
            stats.record_packet_sent(size);
        }
        tracing::trace!(sequence = self.sequence, size, ?continuation, "packet ready");

        if !(self.sink)(&self.packet[..size]) {
            tracing::warn!(sequence = self.sequence, "packet sink failed, aborting scene update");
            return Err(FramerError::SinkRejected {
                sequence: self.sequence,
            });
        }
        Ok(())
    }

    /// Write `bytes` into a single packet, rotating first if they don't fit.
    fn write_header(&mut self, bytes: &[u8]) -> Result<(), FramerError> {
        self.open();
        if self.remaining() < bytes.len() {
            self.finalize(Continuation::MoreFollows)?;
            self.open();
        }
        let start = self.used;
        self.packet[start..start + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        Ok(())
    }

    fn write_pair_header(
        &mut self,
        block_type: BlockType,
        first: &[u8],
        second: &[u8],
    ) -> Result<(), FramerError> {
        let mut preamble = [0u8; BLOCK_HEADER_SIZE + LENGTH_PAIR_SIZE];
        let size = LENGTH_PAIR_SIZE + first.len() + second.len();
        let block = BlockHeader::new(block_type, wire_length(size, "block")?);
        let lengths = LengthPair::new(
            wire_length(first.len(), "block part")?,
            wire_length(second.len(), "block part")?,
        );
        preamble[..BLOCK_HEADER_SIZE].copy_from_slice(block.as_bytes());
        preamble[BLOCK_HEADER_SIZE..].copy_from_slice(lengths.as_bytes());
        self.write_header(&preamble)
    }

    fn write_payload(&mut self, mut bytes: &[u8]) -> Result<(), FramerError> {
        while !bytes.is_empty() {
            self.open();
            if self.remaining() == 0 {
                self.finalize(Continuation::MoreFollows)?;
                self.open();
            }
            let n = self.remaining().min(bytes.len());
            let start = self.used;
            self.packet[start..start + n].copy_from_slice(&bytes[..n]);
            self.used += n;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), FramerError> {
        if self.used > 0 {
            self.finalize(Continuation::Last)?;
        }
        Ok(())
    }
}

// ── Receive side ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SceneStreamError {
    #[error("packet out of sequence: expected {expected}, got {got}")]
    OutOfSequence { expected: u32, got: u32 },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("malformed {0} block")]
    MalformedBlock(&'static str),

    #[error("scene update must open with exactly one command log block")]
    MissingCommandLog,

    #[error("block follows flush metadata")]
    TrailingBlock,

    #[error("scene update exceeds {limit} bytes")]
    UpdateTooLarge { limit: usize },

    #[error(transparent)]
    CommandLog(#[from] CommandLogError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("flush metadata: {0}")]
    Flush(#[from] serde_json::Error),
}

/// Reassembles scene updates from the packets of `SceneUpdateSerializer`.
///
/// Any error drops the partially received update; the next accepted packet
/// is sequence 1 of a fresh update. An update whose payload outgrows
/// `max_update_size` is dropped the same way.
pub struct SceneUpdateDeserializer {
    expected: u32,
    stream: Vec<u8>,
    max_update_size: usize,
    stats: Option<Arc<TransportStatistics>>,
}

impl Default for SceneUpdateDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneUpdateDeserializer {
    pub fn new() -> Self {
        Self {
            expected: 1,
            stream: Vec::new(),
            max_update_size: DEFAULT_MAX_UPDATE_SIZE,
            stats: None,
        }
    }

    pub fn with_max_update_size(mut self, limit: usize) -> Self {
        self.max_update_size = limit;
        self
    }

    pub fn with_statistics(mut self, stats: Arc<TransportStatistics>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// True when no update is partially received.
    pub fn is_idle(&self) -> bool {
        self.expected == 1
    }

    /// Feed one packet. Returns the update once its last packet arrived.
    pub fn process_packet(&mut self, packet: &[u8]) -> Result<Option<SceneUpdate>, SceneStreamError> {
        let result = self.accept(packet);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "dropping partially received scene update");
            self.expected = 1;
            self.stream.clear();
        }
        result
    }

    fn accept(&mut self, packet: &[u8]) -> Result<Option<SceneUpdate>, SceneStreamError> {
        let header: PacketHeader = wire::read_header(packet, "packet header")?;
        let sequence = header.sequence.get();
        let continuation = Continuation::try_from(header.continuation.get())?;
        if sequence != self.expected {
            return Err(SceneStreamError::OutOfSequence {
                expected: self.expected,
                got: sequence,
            });
        }
        if let Some(stats) = &self.stats {
            stats.record_bytes_received(packet.len());
        }

        let payload = &packet[PACKET_HEADER_SIZE..];
        if self.stream.len() + payload.len() > self.max_update_size {
            return Err(SceneStreamError::UpdateTooLarge {
                limit: self.max_update_size,
            });
        }
        self.expected += 1;
        self.stream.extend_from_slice(payload);

        match continuation {
            Continuation::MoreFollows => Ok(None),
            Continuation::Last => {
                let stream = std::mem::take(&mut self.stream);
                self.expected = 1;
                let update = parse_blocks(&stream)?;
                if let Some(stats) = &self.stats {
                    stats.record_resources_received(update.resources.len());
                }
                Ok(Some(update))
            }
        }
    }
}

fn parse_blocks(mut cursor: &[u8]) -> Result<SceneUpdate, SceneStreamError> {
    let mut commands: Option<CommandLog> = None;
    let mut resources = Vec::new();
    let mut flush = None;

    while !cursor.is_empty() {
        let header: BlockHeader = wire::read_header(cursor, "block header")?;
        let block_type = BlockType::try_from(header.block_type.get())?;
        let size = header.size.get() as usize;
        let rest = &cursor[BLOCK_HEADER_SIZE..];
        if rest.len() < size {
            return Err(WireError::Truncated {
                what: "block body",
                need: size,
                have: rest.len(),
            }
            .into());
        }
        let (body, tail) = rest.split_at(size);
        cursor = tail;

        if flush.is_some() {
            return Err(SceneStreamError::TrailingBlock);
        }
        match block_type {
            BlockType::CommandLog => {
                if commands.is_some() {
                    return Err(SceneStreamError::MissingCommandLog);
                }
                let (table, data) = split_pair(body, "command log")?;
                commands = Some(CommandLog::from_parts(table, data.to_vec())?);
            }
            BlockType::Resource => {
                if commands.is_none() {
                    return Err(SceneStreamError::MissingCommandLog);
                }
                let (metadata, blob) = split_pair(body, "resource")?;
                resources.push(Arc::new(decode_resource(metadata, blob)?));
            }
            BlockType::FlushMetadata => {
                if commands.is_none() {
                    return Err(SceneStreamError::MissingCommandLog);
                }
                let len: U32<LittleEndian> = wire::read_header(body, "flush length")?;
                let bytes = &body[FLUSH_LENGTH_SIZE..];
                if bytes.len() != len.get() as usize {
                    return Err(SceneStreamError::MalformedBlock("flush metadata"));
                }
                flush = Some(FlushMetadata::from_bytes(bytes)?);
            }
        }
    }

    Ok(SceneUpdate {
        commands: commands.ok_or(SceneStreamError::MissingCommandLog)?,
        resources,
        flush,
    })
}

fn split_pair<'b>(body: &'b [u8], what: &'static str) -> Result<(&'b [u8], &'b [u8]), SceneStreamError> {
    let lengths: LengthPair = wire::read_header(body, "length pair")?;
    let first = lengths.first.get() as usize;
    let second = lengths.second.get() as usize;
    let payload = &body[LENGTH_PAIR_SIZE..];
    if payload.len() != first + second {
        return Err(SceneStreamError::MalformedBlock(what));
    }
    Ok(payload.split_at(first))
}

fn decode_resource(metadata: &[u8], blob: &[u8]) -> Result<Resource, SceneStreamError> {
    if metadata.len() < HASH_SIZE {
        return Err(SceneStreamError::MalformedBlock("resource"));
    }
    let (hash, header) = metadata.split_at(HASH_SIZE);
    let mut hash_bytes = [0u8; HASH_SIZE];
    hash_bytes.copy_from_slice(hash);
    let header = ResourceHeader::parse(header)?;
    Ok(Resource::from_header(
        ResourceContentHash(hash_bytes),
        header,
        Bytes::copy_from_slice(blob),
    )?)
}

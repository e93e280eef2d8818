//! Resource stream codec: a list of resources to packets and back.
//!
//! Independent of the scene update framer. Each packet starts with a
//! `packet_number:u32` (0 for the first packet of a stream). Each resource is
//! a `FrameHeader` followed by its serialized `ResourceHeader` and its blob.
//! Frame headers never span packets; metadata and blob bytes do.
//!
//! The encoder asks a `PacketAllocator` for every packet, requesting enough
//! room for the rest of the stream. The allocator may hand out less.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use scenecast_core::hash::ResourceContentHash;
use scenecast_core::resource::{Resource, ResourceError, ResourceHeader};
use scenecast_core::stats::TransportStatistics;
use scenecast_core::wire::{
    self, FrameHeader, WireError, FRAME_HEADER_SIZE, STREAM_PACKET_NUMBER_SIZE,
};
use zerocopy::AsBytes;

/// Upper bound for buffer preallocation driven by untrusted frame sizes.
const PREALLOC_LIMIT: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("allocator granted {granted} bytes, stream needs at least {needed}")]
    AllocationTooSmall { needed: usize, granted: usize },

    #[error("packet {got} out of sequence, expected {expected}")]
    OutOfSequence { expected: u32, got: u32 },

    #[error("packet 0 arrived in the middle of a stream")]
    RestartMidStream,

    #[error("frame announces {frame} blob bytes, metadata says {metadata}")]
    BlobSizeDisagrees { frame: usize, metadata: usize },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Packet memory provider for the encoder.
pub trait PacketAllocator {
    /// Buffer for the next packet. Its length is the usable capacity and may
    /// be smaller than `requested`.
    fn prepare_packet(&mut self, requested: usize) -> BytesMut;

    /// A finished packet, truncated to the bytes actually used.
    fn finished_packet(&mut self, packet: BytesMut);
}

// ── Encoder ───────────────────────────────────────────────────────────────────

struct Frame {
    header: FrameHeader,
    metadata: Vec<u8>,
    blob: Bytes,
}

impl Frame {
    fn new(resource: &Resource) -> Self {
        let header = resource.header();
        let (_, blob) = resource.stream_blob();
        let metadata = header.to_bytes();
        Self {
            header: FrameHeader::new(
                metadata.len() as u32,
                blob.len() as u32,
                *resource.hash().as_bytes(),
            ),
            metadata,
            blob,
        }
    }

    fn len(&self) -> usize {
        FRAME_HEADER_SIZE + self.metadata.len() + self.blob.len()
    }
}

#[derive(Default)]
pub struct ResourceStreamSerializer {
    stats: Option<Arc<TransportStatistics>>,
}

impl ResourceStreamSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statistics(mut self, stats: Arc<TransportStatistics>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Encode `resources` as one stream. Returns the number of packets.
    ///
    /// An empty list produces no packets.
    pub fn serialize<A>(&self, resources: &[Arc<Resource>], allocator: &mut A) -> Result<u32, StreamError>
    where
        A: PacketAllocator,
    {
        // The blob form of every resource is fixed here, before any output.
        let frames: Vec<Frame> = resources.iter().map(|r| Frame::new(r)).collect();

        let mut writer = StreamWriter {
            allocator,
            packet: None,
            capacity: 0,
            used: 0,
            packet_number: 0,
            remaining: frames.iter().map(Frame::len).sum(),
            stats: self.stats.as_deref(),
        };

        for frame in &frames {
            writer.write_header(frame.header.as_bytes())?;
            writer.write_payload(&frame.metadata)?;
            writer.write_payload(&frame.blob)?;
        }
        writer.finalize();

        if let Some(stats) = &self.stats {
            stats.record_resources_sent(frames.len());
        }
        tracing::debug!(
            resources = frames.len(),
            packets = writer.packet_number,
            "resource stream serialized"
        );
        Ok(writer.packet_number)
    }
}

struct StreamWriter<'a, A> {
    allocator: &'a mut A,
    packet: Option<BytesMut>,
    capacity: usize,
    used: usize,
    packet_number: u32,
    /// Stream bytes not yet written.
    remaining: usize,
    stats: Option<&'a TransportStatistics>,
}

impl<A: PacketAllocator> StreamWriter<'_, A> {
    fn open(&mut self) -> Result<(), StreamError> {
        if self.packet.is_some() {
            return Ok(());
        }
        let requested = STREAM_PACKET_NUMBER_SIZE + self.remaining;
        let mut packet = self.allocator.prepare_packet(requested);
        if packet.len() <= STREAM_PACKET_NUMBER_SIZE {
            return Err(StreamError::AllocationTooSmall {
                needed: STREAM_PACKET_NUMBER_SIZE + 1,
                granted: packet.len(),
            });
        }
        packet[..STREAM_PACKET_NUMBER_SIZE].copy_from_slice(&self.packet_number.to_le_bytes());
        self.packet_number += 1;
        self.capacity = packet.len();
        self.used = STREAM_PACKET_NUMBER_SIZE;
        self.packet = Some(packet);
        Ok(())
    }

    fn finalize(&mut self) {
        if let Some(mut packet) = self.packet.take() {
            packet.truncate(self.used);
            if let Some(stats) = self.stats {
                stats.record_packet_sent(self.used);
            }
            self.allocator.finished_packet(packet);
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        if let Some(packet) = self.packet.as_mut() {
            packet[self.used..self.used + bytes.len()].copy_from_slice(bytes);
            self.used += bytes.len();
            self.remaining -= bytes.len();
        }
    }

    fn write_header(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.open()?;
        if self.capacity - self.used < bytes.len() {
            if self.used > STREAM_PACKET_NUMBER_SIZE {
                self.finalize();
                self.open()?;
            }
            if self.capacity - self.used < bytes.len() {
                return Err(StreamError::AllocationTooSmall {
                    needed: STREAM_PACKET_NUMBER_SIZE + bytes.len(),
                    granted: self.capacity,
                });
            }
        }
        self.put(bytes);
        Ok(())
    }

    fn write_payload(&mut self, mut bytes: &[u8]) -> Result<(), StreamError> {
        while !bytes.is_empty() {
            self.open()?;
            if self.capacity == self.used {
                self.finalize();
                self.open()?;
            }
            let n = (self.capacity - self.used).min(bytes.len());
            self.put(&bytes[..n]);
            bytes = &bytes[n..];
        }
        Ok(())
    }
}

// ── Decoder ───────────────────────────────────────────────────────────────────

/// Observable decoder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    None,
    ReadingMetadata,
    ReadingBlob,
    Failed,
}

enum Decoding {
    Idle,
    Metadata {
        hash: ResourceContentHash,
        metadata_size: usize,
        blob_size: usize,
        buffer: Vec<u8>,
    },
    Blob {
        hash: ResourceContentHash,
        header: ResourceHeader,
        buffer: Vec<u8>,
    },
    Failed,
}

/// Reassembles resources from one peer's resource streams.
///
/// Failure is permanent; a failed decoder must be replaced.
pub struct ResourceStreamDeserializer {
    state: Decoding,
    expected_packet: u32,
}

impl Default for ResourceStreamDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceStreamDeserializer {
    pub fn new() -> Self {
        Self {
            state: Decoding::Idle,
            expected_packet: 0,
        }
    }

    pub fn state(&self) -> DecoderState {
        match self.state {
            Decoding::Idle => DecoderState::None,
            Decoding::Metadata { .. } => DecoderState::ReadingMetadata,
            Decoding::Blob { .. } => DecoderState::ReadingBlob,
            Decoding::Failed => DecoderState::Failed,
        }
    }

    /// No resource is partially received.
    pub fn processing_finished(&self) -> bool {
        matches!(self.state, Decoding::Idle)
    }

    pub fn processing_failed(&self) -> bool {
        matches!(self.state, Decoding::Failed)
    }

    /// Feed one packet. Returns every resource completed by it.
    pub fn process_data(&mut self, packet: &[u8]) -> Vec<Resource> {
        let mut completed = Vec::new();
        if self.processing_failed() {
            return completed;
        }
        if let Err(e) = self.accept(packet, &mut completed) {
            tracing::warn!(
                error = %e,
                completed = completed.len(),
                "resource stream failed, decoder is unusable"
            );
            self.state = Decoding::Failed;
        }
        completed
    }

    fn accept(&mut self, packet: &[u8], out: &mut Vec<Resource>) -> Result<(), StreamError> {
        let number: zerocopy::byteorder::U32<zerocopy::byteorder::LittleEndian> =
            wire::read_header(packet, "packet number")?;
        let number = number.get();
        if number == 0 {
            if !self.processing_finished() {
                return Err(StreamError::RestartMidStream);
            }
            self.expected_packet = 1;
        } else if number != self.expected_packet {
            return Err(StreamError::OutOfSequence {
                expected: self.expected_packet,
                got: number,
            });
        } else {
            self.expected_packet += 1;
        }

        let mut body = &packet[STREAM_PACKET_NUMBER_SIZE..];
        loop {
            self.complete(out)?;
            if body.is_empty() {
                return Ok(());
            }
            match &mut self.state {
                Decoding::Idle => {
                    let frame: FrameHeader = wire::read_header(body, "frame header")?;
                    body = &body[FRAME_HEADER_SIZE..];
                    let metadata_size = frame.metadata_size.get() as usize;
                    self.state = Decoding::Metadata {
                        hash: ResourceContentHash(frame.content_hash),
                        metadata_size,
                        blob_size: frame.blob_size.get() as usize,
                        buffer: Vec::with_capacity(metadata_size.min(PREALLOC_LIMIT)),
                    };
                }
                Decoding::Metadata {
                    metadata_size,
                    buffer,
                    ..
                } => {
                    let n = (*metadata_size - buffer.len()).min(body.len());
                    buffer.extend_from_slice(&body[..n]);
                    body = &body[n..];
                }
                Decoding::Blob { header, buffer, .. } => {
                    let n = (header.blob_size as usize - buffer.len()).min(body.len());
                    buffer.extend_from_slice(&body[..n]);
                    body = &body[n..];
                }
                Decoding::Failed => return Ok(()),
            }
        }
    }

    /// Move past a fully read metadata or blob section.
    fn complete(&mut self, out: &mut Vec<Resource>) -> Result<(), StreamError> {
        let state = std::mem::replace(&mut self.state, Decoding::Idle);
        self.state = match state {
            Decoding::Metadata {
                hash,
                metadata_size,
                blob_size,
                buffer,
            } if buffer.len() == metadata_size => {
                let header = ResourceHeader::parse(&buffer)?;
                if header.blob_size as usize != blob_size {
                    return Err(StreamError::BlobSizeDisagrees {
                        frame: blob_size,
                        metadata: header.blob_size as usize,
                    });
                }
                if blob_size == 0 {
                    out.push(Resource::from_header(hash, header, Bytes::new())?);
                    Decoding::Idle
                } else {
                    Decoding::Blob {
                        hash,
                        header,
                        buffer: Vec::with_capacity(blob_size.min(PREALLOC_LIMIT)),
                    }
                }
            }
            Decoding::Blob {
                hash,
                header,
                buffer,
            } if buffer.len() == header.blob_size as usize => {
                tracing::trace!(hash = %hash, size = buffer.len(), "resource received");
                out.push(Resource::from_header(hash, header, Bytes::from(buffer))?);
                Decoding::Idle
            }
            other => other,
        };
        Ok(())
    }
}

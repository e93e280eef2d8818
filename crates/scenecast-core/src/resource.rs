//! Resources: immutable binary blobs with a metadata header and a content hash.
//!
//! A resource carries its payload decompressed, zstd-compressed, or both.
//! Which form travels on the wire is decided by the serializers from
//! `stream_blob()`; the compression state is part of the serialized metadata
//! so a receiver knows which form it is reassembling.

use std::fmt;
use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes};

use crate::hash::{Hasher, ResourceContentHash};

/// Payloads smaller than this are never compressed.
pub const COMPRESSION_MIN_SIZE: usize = 1024;

/// Default zstd level for resources compressed at publish time.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Resource type tag. Stable, persisted in resource files and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResourceType {
    Invalid = 0,
    VertexArray = 1,
    IndexArray = 2,
    Texture2D = 3,
    Texture3D = 4,
    TextureCube = 5,
    Effect = 6,
}

impl TryFrom<u32> for ResourceType {
    type Error = ResourceError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResourceType::Invalid),
            1 => Ok(ResourceType::VertexArray),
            2 => Ok(ResourceType::IndexArray),
            3 => Ok(ResourceType::Texture2D),
            4 => Ok(ResourceType::Texture3D),
            5 => Ok(ResourceType::TextureCube),
            6 => Ok(ResourceType::Effect),
            other => Err(ResourceError::UnknownResourceType(other)),
        }
    }
}

/// Which payload forms a resource currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionState {
    DecompressedOnly,
    CompressedOnly,
    Both,
}

/// Encoding of the blob that accompanies serialized metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlobEncoding {
    Raw = 0,
    Zstd = 1,
}

impl TryFrom<u32> for BlobEncoding {
    type Error = ResourceError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BlobEncoding::Raw),
            1 => Ok(BlobEncoding::Zstd),
            other => Err(ResourceError::UnknownEncoding(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("malformed resource metadata: {0}")]
    MalformedMetadata(&'static str),

    #[error("unknown resource type: {0}")]
    UnknownResourceType(u32),

    #[error("unknown blob encoding: {0}")]
    UnknownEncoding(u32),

    #[error("blob size mismatch: metadata says {expected}, got {actual}")]
    BlobSizeMismatch { expected: usize, actual: usize },

    #[error("zstd failure: {0}")]
    Compression(#[from] std::io::Error),

    #[error("resource has no payload")]
    NoPayload,
}

/// A materialized resource.
#[derive(Clone)]
pub struct Resource {
    hash: ResourceContentHash,
    resource_type: ResourceType,
    name: String,
    cache_flag: u32,
    metadata: Bytes,
    decompressed_size: u32,
    decompressed: Option<Bytes>,
    compressed: Option<Bytes>,
}

impl Resource {
    /// Create a resource from decompressed data and compute its hash.
    pub fn new(
        resource_type: ResourceType,
        metadata: impl Into<Bytes>,
        data: impl Into<Bytes>,
        name: impl Into<String>,
    ) -> Self {
        let metadata = metadata.into();
        let data = data.into();

        let mut hasher = Hasher::new();
        hasher.update(&(resource_type as u32).to_le_bytes());
        hasher.update(&metadata);
        hasher.update(&data);

        Self {
            hash: hasher.finalize(),
            resource_type,
            name: name.into(),
            cache_flag: 0,
            metadata,
            decompressed_size: data.len() as u32,
            decompressed: Some(data),
            compressed: None,
        }
    }

    /// Rebuild a resource whose hash is already known (from a stream or a
    /// resource file). The hash is taken as given.
    pub fn from_header(
        hash: ResourceContentHash,
        header: ResourceHeader,
        blob: Bytes,
    ) -> Result<Self, ResourceError> {
        if blob.len() != header.blob_size as usize {
            return Err(ResourceError::BlobSizeMismatch {
                expected: header.blob_size as usize,
                actual: blob.len(),
            });
        }
        let (decompressed, compressed) = match header.encoding {
            BlobEncoding::Raw => (Some(blob), None),
            BlobEncoding::Zstd => (None, Some(blob)),
        };
        Ok(Self {
            hash,
            resource_type: header.resource_type,
            name: header.name,
            cache_flag: header.cache_flag,
            metadata: header.metadata,
            decompressed_size: header.decompressed_size,
            decompressed,
            compressed,
        })
    }

    pub fn with_cache_flag(mut self, cache_flag: u32) -> Self {
        self.cache_flag = cache_flag;
        self
    }

    pub fn hash(&self) -> ResourceContentHash {
        self.hash
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cache_flag(&self) -> u32 {
        self.cache_flag
    }

    /// Type-specific metadata header.
    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    pub fn decompressed_size(&self) -> u32 {
        self.decompressed_size
    }

    pub fn compression_state(&self) -> CompressionState {
        match (&self.decompressed, &self.compressed) {
            (Some(_), Some(_)) => CompressionState::Both,
            (None, Some(_)) => CompressionState::CompressedOnly,
            _ => CompressionState::DecompressedOnly,
        }
    }

    pub fn decompressed_data(&self) -> Option<&Bytes> {
        self.decompressed.as_ref()
    }

    pub fn compressed_data(&self) -> Option<&Bytes> {
        self.compressed.as_ref()
    }

    /// Bytes this resource keeps resident, all payload forms included.
    pub fn resident_size(&self) -> usize {
        self.decompressed.as_ref().map_or(0, |d| d.len())
            + self.compressed.as_ref().map_or(0, |c| c.len())
    }

    /// The blob serializers put on the wire: compressed when available.
    pub fn stream_blob(&self) -> (BlobEncoding, Bytes) {
        match (&self.compressed, &self.decompressed) {
            (Some(c), _) => (BlobEncoding::Zstd, c.clone()),
            (None, Some(d)) => (BlobEncoding::Raw, d.clone()),
            (None, None) => (BlobEncoding::Raw, Bytes::new()),
        }
    }

    /// Compress the payload in place, keeping the decompressed form.
    ///
    /// Returns false when the payload is too small or doesn't shrink.
    pub fn compress(&mut self, level: i32) -> Result<bool, ResourceError> {
        if self.compressed.is_some() {
            return Ok(true);
        }
        let Some(data) = &self.decompressed else {
            return Err(ResourceError::NoPayload);
        };
        if data.len() < COMPRESSION_MIN_SIZE {
            return Ok(false);
        }
        let packed = zstd::stream::encode_all(Cursor::new(&data[..]), level)?;
        if packed.len() >= data.len() {
            return Ok(false);
        }
        self.compressed = Some(Bytes::from(packed));
        Ok(true)
    }

    /// Make the decompressed form available, decompressing if necessary.
    pub fn decompress(&mut self) -> Result<(), ResourceError> {
        if self.decompressed.is_some() {
            return Ok(());
        }
        let Some(packed) = &self.compressed else {
            return Err(ResourceError::NoPayload);
        };
        let data = zstd::stream::decode_all(Cursor::new(&packed[..]))?;
        if data.len() != self.decompressed_size as usize {
            return Err(ResourceError::BlobSizeMismatch {
                expected: self.decompressed_size as usize,
                actual: data.len(),
            });
        }
        self.decompressed = Some(Bytes::from(data));
        Ok(())
    }

    /// Serialized metadata describing this resource's stream blob.
    pub fn header(&self) -> ResourceHeader {
        let (encoding, blob) = self.stream_blob();
        ResourceHeader {
            resource_type: self.resource_type,
            cache_flag: self.cache_flag,
            encoding,
            decompressed_size: self.decompressed_size,
            blob_size: blob.len() as u32,
            name: self.name.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("hash", &self.hash)
            .field("type", &self.resource_type)
            .field("name", &self.name)
            .field("state", &self.compression_state())
            .field("decompressed_size", &self.decompressed_size)
            .finish()
    }
}

// ── Metadata serialization ────────────────────────────────────────────────────

/// Everything a receiver needs to allocate and interpret a resource blob.
///
/// Layout (little-endian):
///   type:u32 cache_flag:u32 encoding:u32 decompressed_size:u32 blob_size:u32
///   name_len:u32 name[name_len] metadata_len:u32 metadata[metadata_len]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHeader {
    pub resource_type: ResourceType,
    pub cache_flag: u32,
    pub encoding: BlobEncoding,
    pub decompressed_size: u32,
    pub blob_size: u32,
    pub name: String,
    pub metadata: Bytes,
}

const HEADER_FIXED_SIZE: usize = 7 * 4;

impl ResourceHeader {
    pub fn serialized_size(&self) -> usize {
        HEADER_FIXED_SIZE + self.name.len() + self.metadata.len()
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.reserve(self.serialized_size());
        out.put_u32_le(self.resource_type as u32);
        out.put_u32_le(self.cache_flag);
        out.put_u32_le(self.encoding as u32);
        out.put_u32_le(self.decompressed_size);
        out.put_u32_le(self.blob_size);
        out.put_u32_le(self.name.len() as u32);
        out.put_slice(self.name.as_bytes());
        out.put_u32_le(self.metadata.len() as u32);
        out.put_slice(&self.metadata);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        self.write_to(&mut out);
        out
    }

    /// Parse a header. The whole input must be consumed.
    pub fn parse(mut input: &[u8]) -> Result<Self, ResourceError> {
        if input.len() < HEADER_FIXED_SIZE {
            return Err(ResourceError::MalformedMetadata("header too short"));
        }
        let resource_type = ResourceType::try_from(input.get_u32_le())?;
        let cache_flag = input.get_u32_le();
        let encoding = BlobEncoding::try_from(input.get_u32_le())?;
        let decompressed_size = input.get_u32_le();
        let blob_size = input.get_u32_le();

        let name_len = input.get_u32_le() as usize;
        if input.remaining() < name_len + 4 {
            return Err(ResourceError::MalformedMetadata("name overruns header"));
        }
        let name = std::str::from_utf8(&input[..name_len])
            .map_err(|_| ResourceError::MalformedMetadata("name is not utf-8"))?
            .to_string();
        input.advance(name_len);

        let metadata_len = input.get_u32_le() as usize;
        if input.remaining() != metadata_len {
            return Err(ResourceError::MalformedMetadata(
                "metadata length disagrees with header size",
            ));
        }
        let metadata = Bytes::copy_from_slice(input);

        if encoding == BlobEncoding::Raw && blob_size != decompressed_size {
            return Err(ResourceError::MalformedMetadata(
                "raw blob size differs from decompressed size",
            ));
        }

        Ok(Self {
            resource_type,
            cache_flag,
            encoding,
            decompressed_size,
            blob_size,
            name,
            metadata,
        })
    }
}

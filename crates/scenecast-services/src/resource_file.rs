//! Resource files: the on-disk resource index.
//!
//! Layout (little-endian):
//!   magic "SCRF" | version:u32 | toc_offset:u64
//!   entries: metadata_len:u32 blob_len:u32 metadata blob   (repeated)
//!   table of contents: JSON array, from toc_offset to end of file
//!
//! Files are written once and memory-mapped for reading. The index maps
//! every content hash to the file and byte range holding it; loading copies
//! the entry out of the mapping.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use memmap2::Mmap;
use scenecast_core::hash::ResourceContentHash;
use scenecast_core::resource::{Resource, ResourceError, ResourceHeader, ResourceType};
use scenecast_core::wire::{self, LengthPair, WireError, LENGTH_PAIR_SIZE};
use serde::{Deserialize, Serialize};
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const FILE_MAGIC: [u8; 4] = *b"SCRF";
pub const FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct FileHeader {
    magic: [u8; 4],
    version: U32<LittleEndian>,
    toc_offset: U64<LittleEndian>,
}

const FILE_HEADER_SIZE: usize = 16;
static_assertions::assert_eq_size!(FileHeader, [u8; FILE_HEADER_SIZE]);

#[derive(Debug, Serialize, Deserialize)]
struct TocEntry {
    hash: String,
    offset: u64,
    size: u64,
    resource_type: u32,
    name: String,
}

/// Opaque handle of an indexed resource file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

/// Where a resource lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub hash: ResourceContentHash,
    pub file: FileHandle,
    pub offset: u64,
    /// Entry size on disk: length pair, metadata and blob.
    pub size: u64,
    pub resource_type: ResourceType,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("resource file {0:?} is not indexed")]
    UnknownFile(FileHandle),

    #[error("entry at {offset}+{size} lies outside a file of {file_len} bytes")]
    OutOfBounds { offset: u64, size: u64, file_len: usize },

    #[error("malformed entry: {0}")]
    Wire(#[from] WireError),

    #[error("entry length pair disagrees with its table of contents size")]
    SizeMismatch,

    #[error("corrupt resource: {0}")]
    Resource(#[from] ResourceError),
}

/// Disk lookup used by the coordinator.
pub trait ResourceSource: Send + Sync {
    fn lookup(&self, hash: &ResourceContentHash) -> Option<IndexEntry>;

    /// Materialize an entry. Called off the coordinator lock.
    fn load(&self, entry: &IndexEntry) -> Result<Resource, IndexError>;
}

// ── Writing ───────────────────────────────────────────────────────────────────

/// Writes resource files.
pub struct ResourceFileWriter {
    compression_level: i32,
}

impl ResourceFileWriter {
    /// `compression_level` 0 stores payloads as they are.
    pub fn new(compression_level: i32) -> Self {
        Self { compression_level }
    }

    /// Write `resources` to `path`. Atomic: temp file, then rename.
    pub fn write(&self, path: &Path, resources: &[Arc<Resource>]) -> Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0u8; FILE_HEADER_SIZE]);
        let mut toc = Vec::with_capacity(resources.len());

        for resource in resources {
            let stored = if self.compression_level > 0 && resource.compressed_data().is_none() {
                let mut copy = Resource::clone(resource);
                copy.compress(self.compression_level)
                    .with_context(|| format!("failed to compress {}", resource.hash()))?;
                copy
            } else {
                Resource::clone(resource)
            };

            let metadata = stored.header().to_bytes();
            let (_, blob) = stored.stream_blob();
            let offset = body.len() as u64;
            body.extend_from_slice(LengthPair::new(metadata.len() as u32, blob.len() as u32).as_bytes());
            body.extend_from_slice(&metadata);
            body.extend_from_slice(&blob);

            toc.push(TocEntry {
                hash: resource.hash().to_hex(),
                offset,
                size: body.len() as u64 - offset,
                resource_type: resource.resource_type() as u32,
                name: resource.name().to_string(),
            });
        }

        let toc_offset = body.len() as u64;
        let header = FileHeader {
            magic: FILE_MAGIC,
            version: U32::new(FILE_VERSION),
            toc_offset: U64::new(toc_offset),
        };
        body[..FILE_HEADER_SIZE].copy_from_slice(header.as_bytes());
        serde_json::to_writer(&mut body, &toc).context("failed to encode table of contents")?;

        let tmp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(&body).context("failed to write resource file")?;
            file.sync_all().context("failed to sync resource file to disk")?;
        }
        fs::rename(&tmp_path, path).with_context(|| {
            format!("failed to rename {} to {}", tmp_path.display(), path.display())
        })?;

        tracing::info!(
            path = %path.display(),
            resources = resources.len(),
            bytes = body.len(),
            "resource file written"
        );
        Ok(())
    }
}

// ── Index ─────────────────────────────────────────────────────────────────────

struct MappedFile {
    path: PathBuf,
    mmap: Mmap,
}

/// Index over any number of memory-mapped resource files.
#[derive(Default)]
pub struct ResourceFileIndex {
    files: DashMap<FileHandle, Arc<MappedFile>>,
    entries: DashMap<ResourceContentHash, IndexEntry>,
    next_handle: AtomicU64,
}

impl ResourceFileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a resource file and index its table of contents.
    ///
    /// Hashes already indexed from another file keep their first location.
    pub fn add_file(&self, path: &Path) -> Result<FileHandle> {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open resource file: {}", path.display()))?;
        // Safety: the file is opened read-only and the mapping is never mutated.
        let mmap = unsafe {
            Mmap::map(&file)
                .with_context(|| format!("failed to mmap resource file: {}", path.display()))?
        };

        let header: FileHeader = wire::read_header(&mmap, "resource file header")
            .with_context(|| format!("{} is too short", path.display()))?;
        if header.magic != FILE_MAGIC {
            bail!("{} is not a resource file", path.display());
        }
        if header.version.get() != FILE_VERSION {
            bail!(
                "{}: unsupported resource file version {}",
                path.display(),
                header.version.get()
            );
        }
        let toc_offset = header.toc_offset.get() as usize;
        if toc_offset < FILE_HEADER_SIZE || toc_offset > mmap.len() {
            bail!("{}: table of contents offset out of range", path.display());
        }
        let toc: Vec<TocEntry> = serde_json::from_slice(&mmap[toc_offset..])
            .with_context(|| format!("{}: malformed table of contents", path.display()))?;

        let handle = FileHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut indexed = 0usize;
        for item in toc {
            let Some(hash) = ResourceContentHash::from_hex(&item.hash) else {
                tracing::warn!(path = %path.display(), hash = %item.hash, "skipping entry with malformed hash");
                continue;
            };
            let Ok(resource_type) = ResourceType::try_from(item.resource_type) else {
                tracing::warn!(path = %path.display(), hash = %hash, "skipping entry with unknown type");
                continue;
            };
            if self.entries.contains_key(&hash) {
                continue;
            }
            self.entries.insert(
                hash,
                IndexEntry {
                    hash,
                    file: handle,
                    offset: item.offset,
                    size: item.size,
                    resource_type,
                    name: item.name,
                },
            );
            indexed += 1;
        }

        self.files.insert(
            handle,
            Arc::new(MappedFile {
                path: path.to_path_buf(),
                mmap,
            }),
        );
        tracing::info!(path = %path.display(), handle = handle.0, indexed, "resource file indexed");
        Ok(handle)
    }

    /// Forget a file and every entry it contributed.
    pub fn remove_file(&self, handle: FileHandle) -> bool {
        let Some((_, file)) = self.files.remove(&handle) else {
            return false;
        };
        self.entries.retain(|_, e| e.file != handle);
        tracing::info!(path = %file.path.display(), handle = handle.0, "resource file removed");
        true
    }

    pub fn has_file(&self, handle: FileHandle) -> bool {
        self.files.contains_key(&handle)
    }

    pub fn file_path(&self, handle: FileHandle) -> Option<PathBuf> {
        self.files.get(&handle).map(|f| f.path.clone())
    }

    /// Every indexed entry, in no particular order.
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResourceSource for ResourceFileIndex {
    fn lookup(&self, hash: &ResourceContentHash) -> Option<IndexEntry> {
        self.entries.get(hash).map(|e| e.value().clone())
    }

    fn load(&self, entry: &IndexEntry) -> Result<Resource, IndexError> {
        let file = self
            .files
            .get(&entry.file)
            .map(|f| f.value().clone())
            .ok_or(IndexError::UnknownFile(entry.file))?;

        let start = entry.offset as usize;
        let end = start.checked_add(entry.size as usize);
        let bytes = end
            .and_then(|end| file.mmap.get(start..end))
            .ok_or(IndexError::OutOfBounds {
                offset: entry.offset,
                size: entry.size,
                file_len: file.mmap.len(),
            })?;

        let lengths: LengthPair = wire::read_header(bytes, "entry length pair")?;
        let metadata_len = lengths.first.get() as usize;
        let blob_len = lengths.second.get() as usize;
        if LENGTH_PAIR_SIZE + metadata_len + blob_len != bytes.len() {
            return Err(IndexError::SizeMismatch);
        }
        let (metadata, blob) = bytes[LENGTH_PAIR_SIZE..].split_at(metadata_len);
        let header = ResourceHeader::parse(metadata)?;
        Ok(Resource::from_header(
            entry.hash,
            header,
            Bytes::copy_from_slice(blob),
        )?)
    }
}

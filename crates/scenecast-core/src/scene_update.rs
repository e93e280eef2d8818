//! Scene update model: one unit of distribution.
//!
//! A scene update is an ordered command log, the resources it references
//! and, for flushes, a small metadata record. It is built by the scene layer,
//! handed to the packet framer once and then dropped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::resource::Resource;
use crate::wire::{wire_length, WireError};

/// Size of one structural table entry: kind:u32 + offset:u32.
pub const COMMAND_ENTRY_SIZE: usize = 8;

/// One row of the command log's structural table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEntry {
    pub kind: u32,
    /// Offset of this command's payload inside the raw data buffer.
    pub offset: u32,
}

/// Ordered log of opaque scene commands.
///
/// Stored as two parallel arrays: the structural table (kind + payload
/// offset per command) and the concatenated raw payload bytes. A command's
/// payload runs from its offset to the next command's offset (or the end of
/// the data).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLog {
    entries: Vec<CommandEntry>,
    data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandLogError {
    #[error("structural table length {0} is not a multiple of {COMMAND_ENTRY_SIZE}")]
    RaggedTable(usize),

    #[error("command {index} offset {offset} out of order or beyond data length {data_len}")]
    BadOffset {
        index: usize,
        offset: u32,
        data_len: usize,
    },

    #[error(transparent)]
    Wire(#[from] WireError),
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command with its payload. Fails, leaving the log unchanged,
    /// once the raw data would outgrow the 32-bit offsets.
    pub fn push(&mut self, kind: u32, payload: &[u8]) -> Result<(), CommandLogError> {
        let offset = wire_length(self.data.len(), "command data")?;
        wire_length(self.data.len() + payload.len(), "command data")?;
        self.entries.push(CommandEntry { kind, offset });
        self.data.extend_from_slice(payload);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CommandEntry] {
        &self.entries
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload of the command at `index`.
    pub fn payload(&self, index: usize) -> Option<&[u8]> {
        let start = self.entries.get(index)?.offset as usize;
        let end = self
            .entries
            .get(index + 1)
            .map_or(self.data.len(), |e| e.offset as usize);
        self.data.get(start..end)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        (0..self.entries.len()).map(move |i| (self.entries[i].kind, self.payload(i).unwrap_or(&[])))
    }

    pub fn table_size(&self) -> usize {
        self.entries.len() * COMMAND_ENTRY_SIZE
    }

    /// Serialized structural table, little-endian.
    pub fn table_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.table_size());
        for entry in &self.entries {
            out.extend_from_slice(&entry.kind.to_le_bytes());
            out.extend_from_slice(&entry.offset.to_le_bytes());
        }
        out
    }

    /// Rebuild a log from its serialized table and raw data.
    pub fn from_parts(table: &[u8], data: Vec<u8>) -> Result<Self, CommandLogError> {
        if table.len() % COMMAND_ENTRY_SIZE != 0 {
            return Err(CommandLogError::RaggedTable(table.len()));
        }
        let mut entries = Vec::with_capacity(table.len() / COMMAND_ENTRY_SIZE);
        let mut previous = 0u32;
        for (index, row) in table.chunks_exact(COMMAND_ENTRY_SIZE).enumerate() {
            let kind = u32::from_le_bytes([row[0], row[1], row[2], row[3]]);
            let offset = u32::from_le_bytes([row[4], row[5], row[6], row[7]]);
            if offset < previous || offset as usize > data.len() || (index == 0 && offset != 0) {
                return Err(CommandLogError::BadOffset {
                    index,
                    offset,
                    data_len: data.len(),
                });
            }
            previous = offset;
            entries.push(CommandEntry { kind, offset });
        }
        Ok(Self { entries, data })
    }
}

// ── Flush metadata ────────────────────────────────────────────────────────────

/// Preallocation hints for the receiving scene.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneSizeHints {
    pub node_count: u32,
    pub transform_count: u32,
    pub renderable_count: u32,
    pub resource_count: u32,
}

/// Timing attached to a flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushTiming {
    /// Wall-clock millisecond after which the flushed state is stale.
    pub expiration_ms: Option<u64>,
    /// Producer-side millisecond timestamp of the flush.
    pub internal_timestamp_ms: u64,
}

/// Metadata of a flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushMetadata {
    /// Monotonically increasing per scene.
    pub flush_counter: u64,
    pub version_tag: Option<u64>,
    pub size_hints: SceneSizeHints,
    pub timing: FlushTiming,
}

impl FlushMetadata {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

// ── Scene update ──────────────────────────────────────────────────────────────

/// One distribution unit.
#[derive(Debug, Clone, Default)]
pub struct SceneUpdate {
    pub commands: CommandLog,
    pub resources: Vec<Arc<Resource>>,
    /// Present only when the update carries a valid flush.
    pub flush: Option<FlushMetadata>,
}

impl SceneUpdate {
    pub fn new(commands: CommandLog) -> Self {
        Self {
            commands,
            resources: Vec::new(),
            flush: None,
        }
    }

    pub fn with_resources(mut self, resources: Vec<Arc<Resource>>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_flush(mut self, flush: FlushMetadata) -> Self {
        self.flush = Some(flush);
        self
    }
}

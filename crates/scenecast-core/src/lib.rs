//! scenecast-core: shared types, wire format, resources and configuration.
//! All other scenecast crates depend on this one.

pub mod config;
pub mod hash;
pub mod resource;
pub mod scene_update;
pub mod stats;
pub mod wire;

pub use hash::ResourceContentHash;
pub use resource::{BlobEncoding, CompressionState, Resource, ResourceHeader, ResourceType};
pub use scene_update::{CommandLog, FlushMetadata, SceneUpdate};
pub use stats::TransportStatistics;

//! Subcommands.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::Serialize;

use scenecast_core::config::{ScenecastConfig, TransportConfig};
use scenecast_core::hash::ResourceContentHash;
use scenecast_core::resource::{Resource, ResourceType};
use scenecast_core::scene_update::{CommandLog, SceneUpdate};
use scenecast_core::stats::TransportStatistics;
use scenecast_services::{
    BufferedPacketAllocator, CoordinatorSettings, PeerId, RequesterId,
    ResourceCoordinator, ResourceFileWriter, ResourceStreamDeserializer, ResourceStreamSerializer,
    ResourceTransport, SceneUpdateDeserializer, SceneUpdateSerializer, TokioExecutor,
};

/// How long `verify` waits for disk loads before giving up.
const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

const VERIFY_REQUESTER: RequesterId = RequesterId(1);

// ── pack ──────────────────────────────────────────────────────────────────────

pub fn pack(config: &ScenecastConfig, out: &Path, kind: &str, inputs: &[PathBuf]) -> Result<()> {
    let resource_type = parse_type(kind)?;
    let mut resources = Vec::with_capacity(inputs.len());
    for input in inputs {
        let data = std::fs::read(input)
            .with_context(|| format!("failed to read {}", input.display()))?;
        let name = input
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        let resource = Resource::new(resource_type, Bytes::new(), data, name);
        println!("{}  {}", resource.hash().to_hex(), input.display());
        resources.push(Arc::new(resource));
    }
    ResourceFileWriter::new(config.cache.compression_level).write(out, &resources)
}

fn parse_type(kind: &str) -> Result<ResourceType> {
    Ok(match kind {
        "vertex" => ResourceType::VertexArray,
        "index" => ResourceType::IndexArray,
        "texture2d" => ResourceType::Texture2D,
        "texture3d" => ResourceType::Texture3D,
        "cube" => ResourceType::TextureCube,
        "effect" => ResourceType::Effect,
        other => bail!("unknown resource type {other:?}"),
    })
}

// ── inspect ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EntryInfo {
    hash: String,
    name: String,
    resource_type: String,
    file: String,
    offset: u64,
    size: u64,
}

pub fn inspect(files: &[PathBuf]) -> Result<()> {
    let index = scenecast_services::ResourceFileIndex::new();
    for path in files {
        index.add_file(path)?;
    }
    let mut entries = index.entries();
    entries.sort_by(|a, b| (a.file.0, a.offset).cmp(&(b.file.0, b.offset)));
    for entry in entries {
        let info = EntryInfo {
            hash: entry.hash.to_hex(),
            name: entry.name,
            resource_type: format!("{:?}", entry.resource_type),
            file: index
                .file_path(entry.file)
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            offset: entry.offset,
            size: entry.size,
        };
        println!("{}", serde_json::to_string(&info)?);
    }
    Ok(())
}

// ── verify ────────────────────────────────────────────────────────────────────

/// Transport for a coordinator that never talks to other peers.
struct Offline;

impl ResourceTransport for Offline {
    fn request_resources(&self, provider: PeerId, hashes: &[ResourceContentHash]) -> bool {
        tracing::warn!(provider = %provider, count = hashes.len(), "no transport, request dropped");
        false
    }

    fn send_resource_data(&self, _peer: PeerId, _packet: Bytes) -> bool {
        false
    }

    fn send_resources_not_available(&self, _peer: PeerId, _hashes: &[ResourceContentHash]) -> bool {
        false
    }
}

/// Load every indexed resource through the coordinator and push each batch
/// through both codecs at the configured packet sizes.
pub async fn verify(config: &ScenecastConfig, local_peer: PeerId, files: &[PathBuf]) -> Result<bool> {
    let executor = TokioExecutor::current().context("verify needs a tokio runtime")?;
    let coordinator = ResourceCoordinator::new(
        local_peer,
        CoordinatorSettings::from(config),
        Arc::new(Offline),
        Arc::new(executor),
    );
    for path in files {
        coordinator.add_resource_file(path)?;
    }

    let hashes: Vec<ResourceContentHash> = coordinator.index().entries().iter().map(|e| e.hash).collect();
    if hashes.is_empty() {
        tracing::warn!("no resources indexed, nothing to verify");
        return Ok(true);
    }
    // Provider is ourselves: anything missing from the index is an error.
    coordinator.request_async(&hashes, VERIFY_REQUESTER, local_peer);

    let stats = coordinator.statistics();
    let deadline = tokio::time::Instant::now() + LOAD_TIMEOUT;
    let mut verified = 0usize;
    let mut ok = true;
    while verified < hashes.len() {
        let batch = coordinator.pop_arrived(VERIFY_REQUESTER);
        if !batch.is_empty() {
            let shared: Vec<Arc<Resource>> = batch.iter().map(|r| r.resource().clone()).collect();
            ok &= verify_scene_update(&shared, &config.transport, &stats)?;
            ok &= verify_resource_stream(&shared, config.transport.resource_packet_size, &stats)?;
            verified += batch.len();
            drop(shared);
            drop(batch);
            // Released handles free budget for loads still queued.
            coordinator.process_pending_loads();
            continue;
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out after verifying {} of {} resources", verified, hashes.len());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    println!("{}", serde_json::to_string_pretty(&stats.snapshot())?);
    tracing::info!(resources = verified, ok, "verification finished");
    Ok(ok)
}

fn verify_scene_update(
    resources: &[Arc<Resource>],
    transport: &TransportConfig,
    stats: &TransportStatistics,
) -> Result<bool> {
    let mut commands = CommandLog::new();
    for resource in resources {
        commands.push(1, resource.hash().as_bytes())?;
    }
    let update = SceneUpdate::new(commands).with_resources(resources.to_vec());

    let mut packet = vec![0u8; transport.max_packet_size];
    let mut packets: Vec<Vec<u8>> = Vec::new();
    let count = SceneUpdateSerializer::new(&update)
        .with_statistics(stats)
        .write_to_packets(&mut packet, |bytes| {
            packets.push(bytes.to_vec());
            true
        })?;

    let mut decoder = SceneUpdateDeserializer::new().with_max_update_size(transport.max_update_size);
    let mut decoded = None;
    for bytes in &packets {
        if let Some(update) = decoder.process_packet(bytes)? {
            decoded = Some(update);
        }
    }
    let Some(decoded) = decoded else {
        tracing::error!(packets = count, "scene update did not reassemble");
        return Ok(false);
    };
    let ok = decoded.commands.data() == update.commands.data()
        && same_resources(&decoded.resources, resources);
    tracing::info!(packets = count, ok, "scene update round trip");
    Ok(ok)
}

fn verify_resource_stream(
    resources: &[Arc<Resource>],
    packet_size: usize,
    stats: &Arc<TransportStatistics>,
) -> Result<bool> {
    let mut allocator = BufferedPacketAllocator::new(packet_size);
    let count = ResourceStreamSerializer::new()
        .with_statistics(stats.clone())
        .serialize(resources, &mut allocator)?;

    let mut decoder = ResourceStreamDeserializer::new();
    let mut decoded = Vec::new();
    for packet in allocator.into_packets() {
        decoded.extend(decoder.process_data(&packet).into_iter().map(Arc::new));
    }
    let ok = decoder.processing_finished() && same_resources(&decoded, resources);
    tracing::info!(packets = count, ok, "resource stream round trip");
    Ok(ok)
}

fn same_resources(decoded: &[Arc<Resource>], expected: &[Arc<Resource>]) -> bool {
    if decoded.len() != expected.len() {
        return false;
    }
    let mut seen = HashSet::new();
    decoded.iter().zip(expected).all(|(d, e)| {
        seen.insert(d.hash()) && d.hash() == e.hash() && d.stream_blob() == e.stream_blob()
    })
}

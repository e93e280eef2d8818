//! scenecast integration test harness.
//!
//! Producer and consumer coordinators run in one process and talk through
//! an in-memory loopback network: every transport call becomes a message on
//! a tokio channel, and a pump task hands it to the addressed coordinator.
//!
//!   cargo test --test integration

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

use scenecast_core::hash::ResourceContentHash;
use scenecast_core::resource::{Resource, ResourceType};
use scenecast_services::{
    CoordinatorSettings, ManagedResource, PeerId, RequesterId, ResourceCoordinator,
    ResourceTransport, TokioExecutor,
};

mod framing;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const PRODUCER: PeerId = PeerId([0xaa; 32]);
pub const CONSUMER: PeerId = PeerId([0xbb; 32]);

/// How long a test waits for arrivals.
pub const ARRIVAL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Message {
    Request(Vec<ResourceContentHash>),
    Data(Bytes),
    NotAvailable(Vec<ResourceContentHash>),
}

/// One message in flight: sender, receiver, payload.
type Envelope = (PeerId, PeerId, Message);

/// Transport endpoint of one peer on the loopback network.
pub struct LoopbackTransport {
    local: PeerId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl LoopbackTransport {
    fn send(&self, to: PeerId, message: Message) -> bool {
        self.tx.send((self.local, to, message)).is_ok()
    }
}

impl ResourceTransport for LoopbackTransport {
    fn request_resources(&self, provider: PeerId, hashes: &[ResourceContentHash]) -> bool {
        self.send(provider, Message::Request(hashes.to_vec()))
    }

    fn send_resource_data(&self, peer: PeerId, packet: Bytes) -> bool {
        self.send(peer, Message::Data(packet))
    }

    fn send_resources_not_available(&self, peer: PeerId, hashes: &[ResourceContentHash]) -> bool {
        self.send(peer, Message::NotAvailable(hashes.to_vec()))
    }
}

/// Producer and consumer wired to each other.
pub struct Loopback {
    pub producer: ResourceCoordinator,
    pub consumer: ResourceCoordinator,
    pump: tokio::task::JoinHandle<()>,
}

impl Loopback {
    /// Must be called inside a tokio runtime.
    pub fn new(settings: CoordinatorSettings) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let executor = Arc::new(TokioExecutor::current().expect("tokio runtime"));

        let mut nodes = HashMap::new();
        for peer in [PRODUCER, CONSUMER] {
            let transport = Arc::new(LoopbackTransport {
                local: peer,
                tx: tx.clone(),
            });
            nodes.insert(
                peer,
                ResourceCoordinator::new(peer, settings, transport, executor.clone()),
            );
        }
        let producer = nodes[&PRODUCER].clone();
        let consumer = nodes[&CONSUMER].clone();
        producer.new_peer(CONSUMER);
        consumer.new_peer(PRODUCER);

        let pump = tokio::spawn(async move {
            while let Some((from, to, message)) = rx.recv().await {
                let Some(node) = nodes.get(&to) else {
                    continue;
                };
                match message {
                    Message::Request(hashes) => {
                        node.handle_request_resources(&hashes, from);
                    }
                    Message::Data(packet) => node.handle_resource_data(&packet, from),
                    Message::NotAvailable(hashes) => node.handle_resources_not_available(&hashes, from),
                }
            }
        });

        Self {
            producer,
            consumer,
            pump,
        }
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Poll `requester`'s arrived queue on `node` until `count` resources came in.
pub async fn wait_for_arrivals(
    node: &ResourceCoordinator,
    requester: RequesterId,
    count: usize,
) -> Result<Vec<ManagedResource>> {
    let deadline = tokio::time::Instant::now() + ARRIVAL_TIMEOUT;
    let mut arrived = Vec::new();
    loop {
        arrived.extend(node.pop_arrived(requester));
        if arrived.len() >= count {
            return Ok(arrived);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("requester {requester} got {} of {count} resources", arrived.len());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let queued messages drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub fn test_resource(seed: u8, len: usize) -> Resource {
    let data: Vec<u8> = (0..len).map(|i| seed.wrapping_add((i / 64) as u8)).collect();
    Resource::new(ResourceType::Texture2D, vec![seed; 12], data, format!("tex-{seed}"))
}

pub fn settings(packet_size: usize) -> CoordinatorSettings {
    CoordinatorSettings {
        load_budget_bytes: 1 << 20,
        resource_packet_size: packet_size,
    }
}

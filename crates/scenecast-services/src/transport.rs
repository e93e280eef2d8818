//! Transport boundary: peer identities and the calls the coordinator makes
//! into the point-to-point packet transport.

use std::fmt;

use bytes::{Bytes, BytesMut};
use scenecast_core::hash::ResourceContentHash;

use crate::resource_stream::PacketAllocator;

/// Identity of a process taking part in distribution.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Short form for logs.
impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Local consumer identity used to fan out arrived resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequesterId(pub u64);

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outgoing resource traffic. Every call returns false when the transport
/// could not take the message.
pub trait ResourceTransport: Send + Sync {
    fn request_resources(&self, provider: PeerId, hashes: &[ResourceContentHash]) -> bool;

    fn send_resource_data(&self, peer: PeerId, packet: Bytes) -> bool;

    fn send_resources_not_available(&self, peer: PeerId, hashes: &[ResourceContentHash]) -> bool;
}

/// Allocator handing out packets of a fixed maximum size and keeping every
/// finished packet for sending afterwards.
pub struct BufferedPacketAllocator {
    max_packet_size: usize,
    packets: Vec<Bytes>,
}

impl BufferedPacketAllocator {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            packets: Vec::new(),
        }
    }

    pub fn into_packets(self) -> Vec<Bytes> {
        self.packets
    }
}

impl PacketAllocator for BufferedPacketAllocator {
    fn prepare_packet(&mut self, requested: usize) -> BytesMut {
        BytesMut::zeroed(requested.min(self.max_packet_size))
    }

    fn finished_packet(&mut self, packet: BytesMut) {
        self.packets.push(packet.freeze());
    }
}

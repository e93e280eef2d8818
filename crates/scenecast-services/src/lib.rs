//! scenecast-services: packet framing, resource streams, the resource
//! store and the coordinator that ties them to a transport.

pub mod coordinator;
pub mod executor;
pub mod framer;
pub mod resource_file;
pub mod resource_stream;
pub mod store;
pub mod transport;

pub use coordinator::{CoordinatorError, CoordinatorSettings, ResourceCoordinator};
pub use executor::{InlineExecutor, LoadExecutor, TokioExecutor};
pub use framer::{SceneUpdateDeserializer, SceneUpdateSerializer};
pub use resource_file::{FileHandle, ResourceFileIndex, ResourceFileWriter, ResourceSource};
pub use resource_stream::{
    DecoderState, PacketAllocator, ResourceStreamDeserializer, ResourceStreamSerializer,
};
pub use store::{ManagedResource, ResourceHashUsage, ResourceStore};
pub use transport::{BufferedPacketAllocator, PeerId, RequesterId, ResourceTransport};

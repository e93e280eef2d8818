//! Resource coordinator: the single authority in a process for which
//! resources are resident, which are in flight, and who is waiting for them.
//!
//! Requests are resolved in order: resident store, an already pending fetch
//! for the same hash, the on-disk resource index, and finally the network
//! provider. Disk loads are throttled against a byte budget and run on a
//! `LoadExecutor`; they re-enter the coordinator only to publish.
//!
//! Lock order: coordinator state, then the store's leaf lock. Transport calls
//! and executor dispatch happen after the coordinator lock is released.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Result;
use scenecast_core::config::ScenecastConfig;
use scenecast_core::hash::ResourceContentHash;
use scenecast_core::resource::Resource;
use scenecast_core::stats::TransportStatistics;
use scenecast_core::wire::DEFAULT_MAX_PACKET_SIZE;

use crate::executor::{LoadExecutor, LoadTask};
use crate::resource_file::{FileHandle, IndexEntry, IndexError, ResourceFileIndex, ResourceSource};
use crate::resource_stream::{ResourceStreamDeserializer, ResourceStreamSerializer};
use crate::store::{ManagedResource, ResourceHashUsage, ResourceStore};
use crate::transport::{BufferedPacketAllocator, PeerId, RequesterId, ResourceTransport};

/// Coordinators started in this process.
static COORDINATOR_INSTANCES: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("{} resource(s) not resident", .0.len())]
    MissingResources(Vec<ResourceContentHash>),
}

/// Tunables taken from `ScenecastConfig`.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub load_budget_bytes: u64,
    pub resource_packet_size: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&ScenecastConfig::default())
    }
}

impl From<&ScenecastConfig> for CoordinatorSettings {
    fn from(config: &ScenecastConfig) -> Self {
        Self {
            load_budget_bytes: config.cache.load_budget_bytes,
            resource_packet_size: if config.transport.resource_packet_size == 0 {
                DEFAULT_MAX_PACKET_SIZE
            } else {
                config.transport.resource_packet_size
            },
        }
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Disk,
    Peer(PeerId),
}

/// An in-flight fetch. Outlives its last requester until the load or the
/// provider's answer comes back; later requests for the hash join it.
/// `requesters` may be empty.
struct Pending {
    requesters: Vec<RequesterId>,
    origin: Origin,
}

#[derive(Default)]
struct CoordinatorState {
    /// Requesters waiting for each in-flight hash.
    pending: HashMap<ResourceContentHash, Pending>,
    arrived: HashMap<RequesterId, Vec<ManagedResource>>,
    decoders: HashMap<PeerId, ResourceStreamDeserializer>,
    /// Disk loads not yet scheduled, in request order.
    load_queue: VecDeque<IndexEntry>,
    bytes_scheduled: u64,
}

struct CoordinatorShared {
    instance: u64,
    local_peer: PeerId,
    settings: CoordinatorSettings,
    store: ResourceStore,
    index: Arc<ResourceFileIndex>,
    transport: Arc<dyn ResourceTransport>,
    executor: Arc<dyn LoadExecutor>,
    stats: Arc<TransportStatistics>,
    state: Mutex<CoordinatorState>,
}

impl Drop for CoordinatorShared {
    fn drop(&mut self) {
        tracing::debug!(instance = self.instance, "resource coordinator stopped");
    }
}

/// Shared handle to a coordinator. Cloning is cheap.
#[derive(Clone)]
pub struct ResourceCoordinator {
    shared: Arc<CoordinatorShared>,
}

impl ResourceCoordinator {
    pub fn new(
        local_peer: PeerId,
        settings: CoordinatorSettings,
        transport: Arc<dyn ResourceTransport>,
        executor: Arc<dyn LoadExecutor>,
    ) -> Self {
        let instance = COORDINATOR_INSTANCES.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            instance,
            peer = %local_peer,
            budget = settings.load_budget_bytes,
            packet_size = settings.resource_packet_size,
            "resource coordinator started"
        );
        Self {
            shared: Arc::new(CoordinatorShared {
                instance,
                local_peer,
                settings,
                store: ResourceStore::new(),
                index: Arc::new(ResourceFileIndex::new()),
                transport,
                executor,
                stats: Arc::new(TransportStatistics::new()),
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.shared.local_peer
    }

    pub fn statistics(&self) -> Arc<TransportStatistics> {
        self.shared.stats.clone()
    }

    pub fn store(&self) -> &ResourceStore {
        &self.shared.store
    }

    pub fn index(&self) -> &Arc<ResourceFileIndex> {
        &self.shared.index
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the coordinator lock, then dispatch whatever disk loads
    /// the throttle admits once it is released.
    fn with_state<R>(&self, f: impl FnOnce(&mut CoordinatorState) -> R) -> R {
        let (result, tasks) = {
            let mut state = self.lock();
            let result = f(&mut state);
            let tasks = self.schedule_loads(&mut state);
            (result, tasks)
        };
        for task in tasks {
            self.shared.executor.execute(task);
        }
        result
    }

    // ── Local store ───────────────────────────────────────────────────────────

    /// Publish a locally created resource. Requesters already waiting for its
    /// hash receive it.
    pub fn manage_resource(&self, resource: Resource, deletion_allowed: bool) -> ManagedResource {
        self.with_state(|state| {
            let handle = self.shared.store.manage(resource, deletion_allowed);
            if let Some(pending) = state.pending.remove(&handle.hash()) {
                state.load_queue.retain(|e| e.hash != handle.hash());
                fan_out(state, &handle, pending.requesters);
            }
            handle
        })
    }

    pub fn manage_resources(
        &self,
        resources: Vec<Resource>,
        deletion_allowed: bool,
    ) -> Vec<ManagedResource> {
        resources
            .into_iter()
            .map(|r| self.manage_resource(r, deletion_allowed))
            .collect()
    }

    pub fn get_resource(&self, hash: &ResourceContentHash) -> Option<ManagedResource> {
        self.shared.store.get(hash)
    }

    pub fn resources(&self) -> Vec<ManagedResource> {
        self.shared.store.resources()
    }

    pub fn hash_usage(&self, hash: ResourceContentHash) -> ResourceHashUsage {
        self.shared.store.hash_usage(hash)
    }

    pub fn resident_bytes(&self) -> usize {
        self.shared.store.resident_bytes()
    }

    /// Resident subset of `hashes`, in request order. Misses are skipped.
    pub fn resolve(&self, hashes: &[ResourceContentHash]) -> Vec<ManagedResource> {
        self.with_state(|_| {
            hashes
                .iter()
                .filter_map(|h| self.shared.store.get(h))
                .collect()
        })
    }

    /// All of `hashes` or an error naming the ones that are not resident.
    pub fn resolve_for_update(
        &self,
        hashes: &[ResourceContentHash],
    ) -> Result<Vec<ManagedResource>, CoordinatorError> {
        let resolved = self.resolve(hashes);
        if resolved.len() == hashes.len() {
            return Ok(resolved);
        }
        let missing: Vec<ResourceContentHash> = hashes
            .iter()
            .filter(|h| !resolved.iter().any(|r| r.hash() == **h))
            .copied()
            .collect();
        tracing::error!(missing = missing.len(), "scene update references missing resources");
        Err(CoordinatorError::MissingResources(missing))
    }

    // ── Resource files ────────────────────────────────────────────────────────

    pub fn add_resource_file(&self, path: &Path) -> Result<FileHandle> {
        self.shared.index.add_file(path)
    }

    /// Forget a resource file. Resources already resident stay resident.
    pub fn remove_resource_file(&self, handle: FileHandle) -> bool {
        self.shared.index.remove_file(handle)
    }

    pub fn has_resource_file(&self, handle: FileHandle) -> bool {
        self.shared.index.has_file(handle)
    }

    /// Load `hash` from the index on the calling thread, bypassing the
    /// throttle. Returns the resident handle if there already is one.
    pub fn load_resource(&self, hash: &ResourceContentHash) -> Option<ManagedResource> {
        if let Some(resident) = self.shared.store.get(hash) {
            return Some(resident);
        }
        let entry = self.shared.index.lookup(hash)?;
        match self.shared.index.load(&entry) {
            Ok(resource) => {
                self.shared.stats.record_loaded_from_file();
                Some(self.manage_resource(resource, true))
            }
            Err(e) => {
                tracing::error!(hash = %hash, error = %e, "failed to load resource from file");
                None
            }
        }
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Ask for `hashes` on behalf of `requester`. Never blocks: results show
    /// up in `pop_arrived`.
    pub fn request_async(
        &self,
        hashes: &[ResourceContentHash],
        requester: RequesterId,
        provider: PeerId,
    ) {
        let local_peer = self.shared.local_peer;
        let network = self.with_state(|state| {
            let mut network = Vec::new();
            for hash in hashes {
                if let Some(resident) = self.shared.store.get(hash) {
                    state.arrived.entry(requester).or_default().push(resident);
                    continue;
                }
                if let Some(pending) = state.pending.get_mut(hash) {
                    if !pending.requesters.contains(&requester) {
                        pending.requesters.push(requester);
                    }
                    tracing::trace!(hash = %hash, requester = %requester, "joined pending request");
                    continue;
                }
                if let Some(entry) = self.shared.index.lookup(hash) {
                    state.pending.insert(
                        *hash,
                        Pending {
                            requesters: vec![requester],
                            origin: Origin::Disk,
                        },
                    );
                    state.load_queue.push_back(entry);
                    continue;
                }
                if provider == local_peer {
                    tracing::error!(
                        hash = %hash,
                        requester = %requester,
                        "resource requested from this process but not available locally"
                    );
                    continue;
                }
                state.pending.insert(
                    *hash,
                    Pending {
                        requesters: vec![requester],
                        origin: Origin::Peer(provider),
                    },
                );
                network.push(*hash);
            }
            network
        });

        if network.is_empty() {
            return;
        }
        tracing::debug!(provider = %provider, count = network.len(), "requesting resources");
        if !self.shared.transport.request_resources(provider, &network) {
            tracing::warn!(provider = %provider, count = network.len(), "resource request could not be sent");
            let mut state = self.lock();
            for hash in &network {
                if state
                    .pending
                    .get(hash)
                    .is_some_and(|p| p.origin == Origin::Peer(provider))
                {
                    state.pending.remove(hash);
                }
            }
        }
    }

    /// Drain everything that arrived for `requester` since the last call.
    pub fn pop_arrived(&self, requester: RequesterId) -> Vec<ManagedResource> {
        self.with_state(|state| state.arrived.remove(&requester).unwrap_or_default())
    }

    /// Withdraw `requester`'s interest in `hash`.
    pub fn cancel(&self, hash: &ResourceContentHash, requester: RequesterId) {
        self.with_state(|state| {
            let mut found = false;
            if let Some(queue) = state.arrived.get_mut(&requester) {
                let before = queue.len();
                queue.retain(|r| r.hash() != *hash);
                found |= queue.len() != before;
                if queue.is_empty() {
                    state.arrived.remove(&requester);
                }
            }
            if let Some(pending) = state.pending.get_mut(hash) {
                if let Some(pos) = pending.requesters.iter().position(|r| *r == requester) {
                    pending.requesters.remove(pos);
                    found = true;
                }
                // Only a load still waiting for budget can be withdrawn.
                if pending.requesters.is_empty() && state.load_queue.iter().any(|e| e.hash == *hash) {
                    state.pending.remove(hash);
                    state.load_queue.retain(|e| e.hash != *hash);
                }
            }
            if !found {
                tracing::info!(hash = %hash, requester = %requester, "cancel for a resource that was never requested");
            }
        })
    }

    /// Re-evaluate the disk load throttle, e.g. after resident handles were
    /// dropped.
    pub fn process_pending_loads(&self) {
        self.with_state(|_| ());
    }

    /// Bytes of disk loads scheduled but not yet completed.
    pub fn scheduled_bytes(&self) -> u64 {
        self.lock().bytes_scheduled
    }

    /// Disk loads waiting for budget.
    pub fn queued_loads(&self) -> usize {
        self.lock().load_queue.len()
    }

    // ── Peers ─────────────────────────────────────────────────────────────────

    pub fn new_peer(&self, peer: PeerId) {
        let mut state = self.lock();
        if let Some(old) = state.decoders.insert(peer, ResourceStreamDeserializer::new()) {
            if !old.processing_finished() {
                tracing::warn!(peer = %peer, "peer reconnected mid-stream, partial resource discarded");
            }
        }
        tracing::info!(peer = %peer, "peer connected");
    }

    /// Discard the peer's decoder and every fetch it was expected to serve.
    pub fn peer_disconnected(&self, peer: PeerId) {
        let mut state = self.lock();
        if let Some(decoder) = state.decoders.remove(&peer) {
            if !decoder.processing_finished() {
                tracing::warn!(peer = %peer, state = ?decoder.state(), "peer disconnected mid-stream, partial resource discarded");
            }
        }
        let before = state.pending.len();
        state.pending.retain(|_, p| p.origin != Origin::Peer(peer));
        tracing::info!(peer = %peer, dropped_requests = before - state.pending.len(), "peer disconnected");
    }

    // ── Serving remote peers ──────────────────────────────────────────────────

    /// Send the requested resources to `peer` as one resource stream, loading
    /// indexed ones that are not resident, and report the rest as not
    /// available.
    pub fn handle_request_resources(&self, hashes: &[ResourceContentHash], peer: PeerId) -> bool {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for hash in hashes {
            match self.load_resource(hash) {
                Some(resident) => found.push(resident.resource().clone()),
                None => missing.push(*hash),
            }
        }

        let transport = &self.shared.transport;
        let mut ok = true;
        if !found.is_empty() {
            let mut allocator = BufferedPacketAllocator::new(self.shared.settings.resource_packet_size);
            let serializer = ResourceStreamSerializer::new().with_statistics(self.shared.stats.clone());
            match serializer.serialize(&found, &mut allocator) {
                Ok(packets) => {
                    tracing::debug!(peer = %peer, resources = found.len(), packets, "sending resources");
                    ok = allocator
                        .into_packets()
                        .into_iter()
                        .all(|packet| transport.send_resource_data(peer, packet));
                    if !ok {
                        tracing::warn!(peer = %peer, "resource stream aborted by transport");
                    }
                }
                Err(e) => {
                    tracing::error!(peer = %peer, error = %e, "failed to encode resource stream");
                    ok = false;
                }
            }
        }
        if !missing.is_empty() {
            tracing::warn!(peer = %peer, count = missing.len(), "requested resources not available");
            ok &= transport.send_resources_not_available(peer, &missing);
        }
        ok
    }

    // ── Receiving from remote peers ───────────────────────────────────────────

    /// Feed one resource stream packet from `provider` to its decoder and
    /// publish whatever it completes.
    pub fn handle_resource_data(&self, packet: &[u8], provider: PeerId) {
        self.shared.stats.record_bytes_received(packet.len());
        self.with_state(|state| {
            let decoder = state.decoders.entry(provider).or_insert_with(|| {
                tracing::debug!(peer = %provider, "resource data from unannounced peer");
                ResourceStreamDeserializer::new()
            });
            let was_failed = decoder.processing_failed();
            let resources = decoder.process_data(packet);
            if decoder.processing_failed() {
                if !was_failed {
                    tracing::warn!(peer = %provider, "resource stream from peer is broken, ignoring it until reconnect");
                }
                return;
            }
            if resources.is_empty() {
                return;
            }
            self.shared.stats.record_resources_received(resources.len());
            for resource in resources {
                let handle = self.shared.store.manage(resource, true);
                deliver(state, handle, Origin::Peer(provider));
            }
        })
    }

    /// `provider` cannot serve `hashes`. Waiters on fetches from that
    /// provider are dropped unsatisfied; fetches from anywhere else stand.
    pub fn handle_resources_not_available(&self, hashes: &[ResourceContentHash], provider: PeerId) {
        self.with_state(|state| {
            for hash in hashes {
                match state.pending.get(hash) {
                    Some(pending) if pending.origin == Origin::Peer(provider) => {
                        tracing::warn!(
                            hash = %hash,
                            peer = %provider,
                            requesters = pending.requesters.len(),
                            "resource not available at provider"
                        );
                        state.pending.remove(hash);
                    }
                    Some(pending) => tracing::debug!(
                        hash = %hash,
                        peer = %provider,
                        origin = ?pending.origin,
                        "not-available from a peer not serving this fetch, ignored"
                    ),
                    None => {}
                }
            }
        })
    }

    // ── Disk loading ──────────────────────────────────────────────────────────

    /// Admit queued loads while resident + scheduled + next stays within the
    /// budget. A candidate larger than the whole budget is admitted only when
    /// nothing else is scheduled.
    fn schedule_loads(&self, state: &mut CoordinatorState) -> Vec<LoadTask> {
        let budget = self.shared.settings.load_budget_bytes;
        let mut tasks = Vec::new();
        while let Some(entry) = state.load_queue.front() {
            if !state.pending.contains_key(&entry.hash) {
                state.load_queue.pop_front();
                continue;
            }
            let resident = self.shared.store.resident_bytes() as u64;
            let fits = resident + state.bytes_scheduled + entry.size <= budget;
            let oversize = entry.size > budget && state.bytes_scheduled == 0;
            if !fits && !oversize {
                tracing::trace!(
                    hash = %entry.hash,
                    resident,
                    scheduled = state.bytes_scheduled,
                    size = entry.size,
                    "disk loading paused for budget"
                );
                break;
            }
            let Some(entry) = state.load_queue.pop_front() else {
                break;
            };
            state.bytes_scheduled += entry.size;
            tasks.push(self.load_task(entry));
        }
        tasks
    }

    fn load_task(&self, entry: IndexEntry) -> LoadTask {
        let source: Arc<dyn ResourceSource> = self.shared.index.clone();
        let coordinator = Arc::downgrade(&self.shared);
        Box::new(move || {
            let result = source.load(&entry);
            if let Some(shared) = Weak::upgrade(&coordinator) {
                ResourceCoordinator { shared }.finish_load(entry, result);
            }
        })
    }

    fn finish_load(&self, entry: IndexEntry, result: Result<Resource, IndexError>) {
        self.with_state(|state| {
            state.bytes_scheduled = state.bytes_scheduled.saturating_sub(entry.size);
            match result {
                Ok(resource) => {
                    self.shared.stats.record_loaded_from_file();
                    tracing::debug!(hash = %entry.hash, name = %entry.name, size = entry.size, "resource loaded from file");
                    let handle = self.shared.store.manage(resource, true);
                    deliver(state, handle, Origin::Disk);
                }
                Err(e) => {
                    tracing::error!(hash = %entry.hash, name = %entry.name, error = %e, "failed to load resource from file");
                    state.pending.remove(&entry.hash);
                }
            }
        })
    }
}

/// Hand an arrived resource to everyone waiting for it.
fn deliver(state: &mut CoordinatorState, handle: ManagedResource, origin: Origin) {
    let hash = handle.hash();
    let Some(pending) = state.pending.remove(&hash) else {
        match origin {
            Origin::Disk => tracing::debug!(hash = %hash, "disk load finished for a resource no longer pending"),
            Origin::Peer(peer) => tracing::warn!(hash = %hash, peer = %peer, "unsolicited resource arrival"),
        }
        return;
    };
    if pending.requesters.is_empty() {
        tracing::debug!(hash = %hash, origin = ?origin, "fetch finished after its requests were cancelled");
    }
    fan_out(state, &handle, pending.requesters);
}

fn fan_out(state: &mut CoordinatorState, handle: &ManagedResource, requesters: Vec<RequesterId>) {
    for requester in requesters {
        state.arrived.entry(requester).or_default().push(handle.clone());
    }
}

impl std::fmt::Debug for ResourceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCoordinator")
            .field("instance", &self.shared.instance)
            .field("peer", &self.shared.local_peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;
    use crate::resource_file::ResourceFileWriter;
    use bytes::Bytes;
    use scenecast_core::resource::ResourceType;
    use std::path::PathBuf;

    const LOCAL: PeerId = PeerId([1; 32]);
    const REMOTE: PeerId = PeerId([2; 32]);
    const ALICE: RequesterId = RequesterId(1);
    const BOB: RequesterId = RequesterId(2);

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    #[derive(Default)]
    struct RecordingTransport {
        requests: Mutex<Vec<(PeerId, Vec<ResourceContentHash>)>>,
        data: Mutex<Vec<(PeerId, Bytes)>>,
        not_available: Mutex<Vec<(PeerId, Vec<ResourceContentHash>)>>,
        refuse: bool,
    }

    impl ResourceTransport for RecordingTransport {
        fn request_resources(&self, provider: PeerId, hashes: &[ResourceContentHash]) -> bool {
            self.requests.lock().unwrap().push((provider, hashes.to_vec()));
            !self.refuse
        }

        fn send_resource_data(&self, peer: PeerId, packet: Bytes) -> bool {
            self.data.lock().unwrap().push((peer, packet));
            !self.refuse
        }

        fn send_resources_not_available(&self, peer: PeerId, hashes: &[ResourceContentHash]) -> bool {
            self.not_available.lock().unwrap().push((peer, hashes.to_vec()));
            !self.refuse
        }
    }

    /// Collects load tasks so tests decide when they run.
    #[derive(Default)]
    struct ManualExecutor {
        tasks: Mutex<VecDeque<LoadTask>>,
    }

    impl ManualExecutor {
        fn pending(&self) -> usize {
            self.tasks.lock().unwrap().len()
        }

        fn run_one(&self) -> bool {
            let task = self.tasks.lock().unwrap().pop_front();
            match task {
                Some(task) => {
                    task();
                    true
                }
                None => false,
            }
        }

        fn run_all(&self) {
            while self.run_one() {}
        }
    }

    impl LoadExecutor for ManualExecutor {
        fn execute(&self, task: LoadTask) {
            self.tasks.lock().unwrap().push_back(task);
        }
    }

    struct Fixture {
        coordinator: ResourceCoordinator,
        transport: Arc<RecordingTransport>,
        executor: Arc<ManualExecutor>,
    }

    fn fixture_with(budget: u64, transport: RecordingTransport) -> Fixture {
        let transport = Arc::new(transport);
        let executor = Arc::new(ManualExecutor::default());
        let settings = CoordinatorSettings {
            load_budget_bytes: budget,
            resource_packet_size: 256,
        };
        let coordinator = ResourceCoordinator::new(LOCAL, settings, transport.clone(), executor.clone());
        Fixture {
            coordinator,
            transport,
            executor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(1 << 30, RecordingTransport::default())
    }

    fn resource(seed: u8, len: usize) -> Resource {
        Resource::new(ResourceType::VertexArray, vec![seed; 4], vec![seed; len], "res")
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "scenecast-coordinator-{}-{}-{}",
            tag,
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_file(dir: &Path, name: &str, resources: &[Resource]) -> PathBuf {
        let path = dir.join(name);
        let shared: Vec<Arc<Resource>> = resources.iter().cloned().map(Arc::new).collect();
        ResourceFileWriter::new(0).write(&path, &shared).unwrap();
        path
    }

    #[test]
    fn resolve_returns_resident_subset() {
        let f = fixture();
        let a = f.coordinator.manage_resource(resource(1, 10), false);
        let missing = resource(2, 10).hash();
        let resolved = f.coordinator.resolve(&[missing, a.hash()]);
        assert_eq!(resolved.len(), 1);
        assert!(resolved[0].ptr_eq(&a));
        assert!(f.coordinator.resolve(&[]).is_empty());
    }

    #[test]
    fn resolve_for_update_names_missing() {
        let f = fixture();
        let a = f.coordinator.manage_resource(resource(1, 10), false);
        let missing = resource(2, 10).hash();
        assert_eq!(f.coordinator.resolve_for_update(&[a.hash()]).unwrap().len(), 1);
        match f.coordinator.resolve_for_update(&[a.hash(), missing]) {
            Err(CoordinatorError::MissingResources(hashes)) => assert_eq!(hashes, vec![missing]),
            Ok(_) => panic!("expected missing resources"),
        }
    }

    #[test]
    fn resident_request_is_satisfied_immediately() {
        let f = fixture();
        let a = f.coordinator.manage_resource(resource(1, 10), false);
        f.coordinator.request_async(&[a.hash()], ALICE, REMOTE);
        let arrived = f.coordinator.pop_arrived(ALICE);
        assert_eq!(arrived.len(), 1);
        assert!(arrived[0].ptr_eq(&a));
        assert!(f.coordinator.pop_arrived(ALICE).is_empty());
        assert!(f.transport.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn concurrent_network_requests_are_deduplicated() {
        let f = fixture();
        let wanted = resource(3, 100);
        let hash = wanted.hash();
        f.coordinator.request_async(&[hash], ALICE, REMOTE);
        f.coordinator.request_async(&[hash], BOB, REMOTE);
        f.coordinator.request_async(&[hash], BOB, REMOTE);

        let requests = f.transport.requests.lock().unwrap().clone();
        assert_eq!(requests, vec![(REMOTE, vec![hash])]);

        // The provider answers with a stream carrying the resource.
        let mut alloc = BufferedPacketAllocator::new(64);
        ResourceStreamSerializer::new()
            .serialize(&[Arc::new(wanted)], &mut alloc)
            .unwrap();
        f.coordinator.new_peer(REMOTE);
        for packet in alloc.into_packets() {
            f.coordinator.handle_resource_data(&packet, REMOTE);
        }

        let alice = f.coordinator.pop_arrived(ALICE);
        let bob = f.coordinator.pop_arrived(BOB);
        assert_eq!(alice.len(), 1);
        assert_eq!(bob.len(), 1, "requester registered twice gets one copy");
        assert!(alice[0].ptr_eq(&bob[0]));
        assert_eq!(f.coordinator.statistics().snapshot().resources_received, 1);
    }

    #[test]
    fn concurrent_disk_requests_load_once() {
        let f = fixture();
        let dir = temp_dir("dedup");
        let res = resource(4, 64);
        let hash = res.hash();
        f.coordinator
            .add_resource_file(&write_file(&dir, "a.scrf", &[res]))
            .unwrap();

        f.coordinator.request_async(&[hash], ALICE, REMOTE);
        f.coordinator.request_async(&[hash], BOB, REMOTE);
        assert_eq!(f.executor.pending(), 1);
        assert!(f.transport.requests.lock().unwrap().is_empty());

        f.executor.run_all();
        assert_eq!(f.coordinator.pop_arrived(ALICE).len(), 1);
        assert_eq!(f.coordinator.pop_arrived(BOB).len(), 1);
        assert_eq!(f.coordinator.statistics().snapshot().resources_loaded_from_file, 1);
        assert_eq!(f.coordinator.scheduled_bytes(), 0);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn inline_executor_completes_within_request() {
        let transport = Arc::new(RecordingTransport::default());
        let coordinator = ResourceCoordinator::new(
            LOCAL,
            CoordinatorSettings::default(),
            transport,
            Arc::new(InlineExecutor),
        );
        let dir = temp_dir("inline");
        let res = resource(5, 32);
        let hash = res.hash();
        coordinator
            .add_resource_file(&write_file(&dir, "a.scrf", &[res]))
            .unwrap();

        coordinator.request_async(&[hash], ALICE, LOCAL);
        let arrived = coordinator.pop_arrived(ALICE);
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].hash(), hash);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn disk_loads_respect_budget() {
        let dir = temp_dir("budget");
        let resources: Vec<Resource> = (0..3).map(|i| resource(10 + i, 400)).collect();
        let hashes: Vec<_> = resources.iter().map(|r| r.hash()).collect();
        let path = write_file(&dir, "a.scrf", &resources);

        let probe = ResourceFileIndex::new();
        probe.add_file(&path).unwrap();
        let size = probe.lookup(&hashes[0]).unwrap().size;
        let budget = size * 2 + size / 2;

        let f = fixture_with(budget, RecordingTransport::default());
        f.coordinator.add_resource_file(&path).unwrap();
        f.coordinator.request_async(&hashes, ALICE, REMOTE);

        assert_eq!(f.executor.pending(), 2);
        assert_eq!(f.coordinator.queued_loads(), 1);
        assert_eq!(f.coordinator.scheduled_bytes(), 2 * size);

        // One load lands; its payload is resident now, so the third still
        // does not fit.
        f.executor.run_one();
        let resident = f.coordinator.resident_bytes() as u64;
        assert!(resident + f.coordinator.scheduled_bytes() <= budget);
        assert_eq!(f.executor.pending(), 1);
        assert_eq!(f.coordinator.queued_loads(), 1);

        // Shrinking the resident set lets loading resume.
        drop(f.coordinator.pop_arrived(ALICE));
        assert_eq!(f.coordinator.resident_bytes(), 0);
        f.coordinator.process_pending_loads();
        assert_eq!(f.executor.pending(), 2);
        assert_eq!(f.coordinator.queued_loads(), 0);
        assert!(f.coordinator.scheduled_bytes() <= budget);

        f.executor.run_all();
        assert_eq!(f.coordinator.pop_arrived(ALICE).len(), 2);
        assert_eq!(f.coordinator.scheduled_bytes(), 0);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn oversize_candidate_loads_alone() {
        let dir = temp_dir("oversize");
        let res = resource(20, 500);
        let hash = res.hash();
        let path = write_file(&dir, "a.scrf", &[res]);

        let f = fixture_with(100, RecordingTransport::default());
        f.coordinator.add_resource_file(&path).unwrap();
        f.coordinator.request_async(&[hash], ALICE, REMOTE);
        assert_eq!(f.executor.pending(), 1);
        f.executor.run_all();
        assert_eq!(f.coordinator.pop_arrived(ALICE).len(), 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn cancel_removes_pending_and_arrived() {
        let f = fixture();
        let dir = temp_dir("cancel");
        let queued = resource(30, 16);
        let resident = f.coordinator.manage_resource(resource(31, 16), false);
        let path = write_file(&dir, "a.scrf", &[queued.clone()]);
        f.coordinator.add_resource_file(&path).unwrap();

        f.coordinator.request_async(&[resident.hash(), queued.hash()], ALICE, REMOTE);
        f.coordinator.cancel(&resident.hash(), ALICE);
        f.coordinator.cancel(&queued.hash(), ALICE);
        // Neither pending nor arrived: logged, not an error.
        f.coordinator.cancel(&queued.hash(), BOB);

        f.executor.run_all();
        assert!(f.coordinator.pop_arrived(ALICE).is_empty());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn cancel_before_schedule_drops_queued_load() {
        let dir = temp_dir("cancel-queued");
        let res = resource(32, 400);
        let hash = res.hash();
        let path = write_file(&dir, "a.scrf", &[res]);

        // Budget fully used by a resident resource, so the load stays queued.
        let f = fixture_with(600, RecordingTransport::default());
        let _big = f.coordinator.manage_resource(resource(33, 596), false);
        f.coordinator.add_resource_file(&path).unwrap();
        f.coordinator.request_async(&[hash], ALICE, REMOTE);
        assert_eq!(f.coordinator.queued_loads(), 1);
        assert_eq!(f.executor.pending(), 0);

        f.coordinator.cancel(&hash, ALICE);
        assert_eq!(f.coordinator.queued_loads(), 0);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn cancel_then_rerequest_joins_scheduled_load() {
        let f = fixture();
        let dir = temp_dir("cancel-rejoin");
        let res = resource(34, 128);
        let hash = res.hash();
        f.coordinator
            .add_resource_file(&write_file(&dir, "a.scrf", &[res]))
            .unwrap();

        f.coordinator.request_async(&[hash], ALICE, REMOTE);
        assert_eq!(f.executor.pending(), 1);
        let scheduled = f.coordinator.scheduled_bytes();

        f.coordinator.cancel(&hash, ALICE);
        f.coordinator.request_async(&[hash], BOB, REMOTE);
        assert_eq!(f.executor.pending(), 1, "one load per hash");
        assert_eq!(f.coordinator.scheduled_bytes(), scheduled);

        f.executor.run_all();
        assert!(f.coordinator.pop_arrived(ALICE).is_empty());
        assert_eq!(f.coordinator.pop_arrived(BOB).len(), 1);
        assert_eq!(f.coordinator.scheduled_bytes(), 0);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn cancel_then_rerequest_joins_outstanding_network_fetch() {
        let f = fixture();
        let wanted = resource(35, 80);
        let hash = wanted.hash();

        f.coordinator.request_async(&[hash], ALICE, REMOTE);
        f.coordinator.cancel(&hash, ALICE);
        f.coordinator.request_async(&[hash], BOB, REMOTE);
        assert_eq!(f.transport.requests.lock().unwrap().len(), 1);

        let mut alloc = BufferedPacketAllocator::new(256);
        ResourceStreamSerializer::new()
            .serialize(&[Arc::new(wanted)], &mut alloc)
            .unwrap();
        f.coordinator.new_peer(REMOTE);
        for packet in alloc.into_packets() {
            f.coordinator.handle_resource_data(&packet, REMOTE);
        }
        assert!(f.coordinator.pop_arrived(ALICE).is_empty());
        assert_eq!(f.coordinator.pop_arrived(BOB).len(), 1);
    }

    #[test]
    fn not_available_from_another_peer_leaves_fetch_alone() {
        let f = fixture();
        let stranger = PeerId([9; 32]);
        let dir = temp_dir("stranger");
        let on_disk = resource(36, 64);
        f.coordinator
            .add_resource_file(&write_file(&dir, "a.scrf", &[on_disk.clone()]))
            .unwrap();
        let remote = resource(37, 64).hash();

        f.coordinator.request_async(&[on_disk.hash(), remote], ALICE, REMOTE);
        f.coordinator.handle_resources_not_available(&[on_disk.hash(), remote], stranger);

        f.executor.run_all();
        let arrived = f.coordinator.pop_arrived(ALICE);
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].hash(), on_disk.hash());

        // The fetch from REMOTE is still outstanding: a new request joins it.
        f.coordinator.request_async(&[remote], BOB, REMOTE);
        assert_eq!(f.transport.requests.lock().unwrap().len(), 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn self_provided_miss_is_not_requested() {
        let f = fixture();
        let hash = resource(40, 8).hash();
        f.coordinator.request_async(&[hash], ALICE, LOCAL);
        assert!(f.transport.requests.lock().unwrap().is_empty());
        assert!(f.coordinator.pop_arrived(ALICE).is_empty());

        // Nothing pending, so a later remote request does go out.
        f.coordinator.request_async(&[hash], ALICE, REMOTE);
        assert_eq!(f.transport.requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn not_available_clears_demand() {
        let f = fixture();
        let hash = resource(41, 8).hash();
        f.coordinator.request_async(&[hash], ALICE, REMOTE);
        f.coordinator.handle_resources_not_available(&[hash], REMOTE);

        // Demand was cleared, so asking again issues a fresh request.
        f.coordinator.request_async(&[hash], BOB, REMOTE);
        assert_eq!(f.transport.requests.lock().unwrap().len(), 2);
        assert!(f.coordinator.pop_arrived(ALICE).is_empty());
    }

    #[test]
    fn refused_request_clears_demand() {
        let f = fixture_with(
            1 << 20,
            RecordingTransport {
                refuse: true,
                ..Default::default()
            },
        );
        let hash = resource(42, 8).hash();
        f.coordinator.request_async(&[hash], ALICE, REMOTE);
        f.coordinator.request_async(&[hash], BOB, REMOTE);
        assert_eq!(f.transport.requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn disconnect_mid_stream_discards_partial_resource() {
        let f = fixture();
        let wanted = resource(43, 600);
        let hash = wanted.hash();
        f.coordinator.request_async(&[hash], ALICE, REMOTE);

        let mut alloc = BufferedPacketAllocator::new(100);
        ResourceStreamSerializer::new()
            .serialize(&[Arc::new(wanted)], &mut alloc)
            .unwrap();
        let packets = alloc.into_packets();
        assert!(packets.len() > 2);

        f.coordinator.new_peer(REMOTE);
        f.coordinator.handle_resource_data(&packets[0], REMOTE);
        f.coordinator.peer_disconnected(REMOTE);

        // Fresh decoder after reconnect; the tail of the old stream is junk.
        f.coordinator.new_peer(REMOTE);
        for packet in &packets[1..] {
            f.coordinator.handle_resource_data(packet, REMOTE);
        }
        assert!(f.coordinator.pop_arrived(ALICE).is_empty());
        assert!(!f.coordinator.store().contains(&hash));

        // Pending demand on that peer went with it.
        f.coordinator.request_async(&[hash], ALICE, REMOTE);
        assert_eq!(f.transport.requests.lock().unwrap().len(), 2);
    }

    #[test]
    fn unsolicited_arrival_is_dropped() {
        let f = fixture();
        let res = resource(44, 20);
        let hash = res.hash();
        let mut alloc = BufferedPacketAllocator::new(1000);
        ResourceStreamSerializer::new()
            .serialize(&[Arc::new(res)], &mut alloc)
            .unwrap();
        for packet in alloc.into_packets() {
            f.coordinator.handle_resource_data(&packet, REMOTE);
        }
        assert!(!f.coordinator.store().contains(&hash));
        assert_eq!(f.coordinator.statistics().snapshot().resources_received, 1);
    }

    #[test]
    fn corrupt_disk_entry_aborts_only_that_load() {
        let f = fixture();
        let dir = temp_dir("corrupt");
        let bad = resource(50, 32);
        let good = resource(51, 32);
        let path = write_file(&dir, "a.scrf", &[bad.clone(), good.clone()]);
        // First entry sits right after the 16-byte file header; break its
        // length pair.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        f.coordinator.add_resource_file(&path).unwrap();

        f.coordinator.request_async(&[bad.hash(), good.hash()], ALICE, REMOTE);
        f.executor.run_all();
        let arrived = f.coordinator.pop_arrived(ALICE);
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].hash(), good.hash());
        assert_eq!(f.coordinator.scheduled_bytes(), 0);

        // Demand for the broken entry was cleared, so it is retried on request.
        f.coordinator.request_async(&[bad.hash()], ALICE, REMOTE);
        assert_eq!(f.executor.pending(), 1);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn serves_resident_and_reports_missing() {
        let f = fixture();
        let a = f.coordinator.manage_resource(resource(60, 700), false);
        let missing = resource(61, 1).hash();
        assert!(f.coordinator.handle_request_resources(&[a.hash(), missing], REMOTE));

        let sent = f.transport.data.lock().unwrap().clone();
        assert!(sent.len() > 1, "256-byte packets split the stream");
        assert!(sent.iter().all(|(peer, p)| *peer == REMOTE && p.len() <= 256));
        assert_eq!(
            f.transport.not_available.lock().unwrap().clone(),
            vec![(REMOTE, vec![missing])]
        );

        let mut decoder = ResourceStreamDeserializer::new();
        let decoded: Vec<Resource> = sent.iter().flat_map(|(_, p)| decoder.process_data(p)).collect();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].hash(), a.hash());
        assert!(decoder.processing_finished());
    }

    #[test]
    fn serves_indexed_resources_from_file() {
        let f = fixture();
        let dir = temp_dir("serve-file");
        let res = resource(62, 48);
        let hash = res.hash();
        f.coordinator
            .add_resource_file(&write_file(&dir, "a.scrf", &[res]))
            .unwrap();

        assert!(f.coordinator.handle_request_resources(&[hash], REMOTE));
        assert!(!f.transport.data.lock().unwrap().is_empty());
        assert!(f.transport.not_available.lock().unwrap().is_empty());
        // Loaded only for sending.
        assert!(!f.coordinator.store().contains(&hash));

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn load_resource_follows_file_lifetime() {
        let f = fixture();
        let dir = temp_dir("files");
        let res = resource(70, 24);
        let hash = res.hash();
        let handle = f
            .coordinator
            .add_resource_file(&write_file(&dir, "a.scrf", &[res]))
            .unwrap();
        assert!(f.coordinator.has_resource_file(handle));

        let loaded = f.coordinator.load_resource(&hash).unwrap();
        assert_eq!(f.coordinator.statistics().snapshot().resources_loaded_from_file, 1);

        // Removing the file keeps what is resident.
        assert!(f.coordinator.remove_resource_file(handle));
        assert!(!f.coordinator.has_resource_file(handle));
        assert!(f.coordinator.get_resource(&hash).is_some());
        drop(loaded);
        assert!(f.coordinator.get_resource(&hash).is_none());
        assert!(f.coordinator.load_resource(&hash).is_none());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reloading_from_file_does_not_leak() {
        let f = fixture();
        let dir = temp_dir("reload");
        let res = resource(71, 24);
        let hash = res.hash();
        f.coordinator
            .add_resource_file(&write_file(&dir, "a.scrf", &[res]))
            .unwrap();
        let _usage = f.coordinator.hash_usage(hash);

        for _ in 0..5 {
            assert!(f.coordinator.get_resource(&hash).is_none());
            let loaded = f.coordinator.load_resource(&hash).unwrap();
            assert_eq!(loaded.hash(), hash);
            drop(loaded);
            assert!(f.coordinator.resources().is_empty());
        }

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn manage_resource_satisfies_waiters() {
        let f = fixture();
        let res = resource(72, 10);
        f.coordinator.request_async(&[res.hash()], ALICE, REMOTE);
        let handle = f.coordinator.manage_resource(res, false);
        let arrived = f.coordinator.pop_arrived(ALICE);
        assert_eq!(arrived.len(), 1);
        assert!(arrived[0].ptr_eq(&handle));
    }

    #[test]
    fn settings_follow_config() {
        let mut config = ScenecastConfig::default();
        config.cache.load_budget_bytes = 1234;
        config.transport.resource_packet_size = 4096;
        let settings = CoordinatorSettings::from(&config);
        assert_eq!(settings.load_budget_bytes, 1234);
        assert_eq!(settings.resource_packet_size, 4096);
    }
}

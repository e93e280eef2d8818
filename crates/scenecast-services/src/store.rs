//! Content-addressed resource store.
//!
//! Two independent counts keep an entry alive: live `ManagedResource`
//! handles (shared ownership of the payload) and `ResourceHashUsage` tokens
//! (a pin on the hash alone). When the last handle goes away the payload is
//! released, unless a usage token still pins the hash and deletion was never
//! allowed for it. The entry is evicted once neither handles nor tokens nor a
//! retained payload remain. There is no time-based eviction.
//!
//! The store lock is a leaf: nothing else is locked while it is held, and no
//! handle is ever dropped under it.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use scenecast_core::hash::ResourceContentHash;
use scenecast_core::resource::Resource;

#[derive(Default)]
struct Entry {
    /// Resident payload. `None` while only the hash is pinned.
    resource: Option<Arc<Resource>>,
    handle: Weak<ManagedInner>,
    /// Generation of the newest handle wrapper handed out.
    generation: u64,
    handle_live: bool,
    usages: usize,
    deletion_allowed: bool,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<ResourceContentHash, Entry>,
    resident_bytes: usize,
}

struct StoreShared {
    state: Mutex<StoreState>,
    next_generation: AtomicU64,
}

impl StoreShared {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared resource store. Cloning yields another view of the same store.
#[derive(Clone)]
pub struct ResourceStore {
    shared: Arc<StoreShared>,
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(StoreShared {
                state: Mutex::new(StoreState::default()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Publish a resource and get a handle to it.
    ///
    /// If the hash is already resident the existing payload wins and
    /// `resource` is discarded. `deletion_allowed` is OR'd into the entry.
    pub fn manage(&self, resource: Resource, deletion_allowed: bool) -> ManagedResource {
        let hash = resource.hash();
        let mut state = self.shared.lock();
        let StoreState {
            entries,
            resident_bytes,
        } = &mut *state;
        let entry = entries.entry(hash).or_default();
        entry.deletion_allowed |= deletion_allowed;

        if let Some(existing) = entry.handle.upgrade() {
            return ManagedResource(existing);
        }
        let payload = if let Some(existing) = entry.resource.clone() {
            existing
        } else {
            *resident_bytes += resource.resident_size();
            let payload = Arc::new(resource);
            entry.resource = Some(payload.clone());
            tracing::trace!(hash = %hash, deletion_allowed, "resource published");
            payload
        };
        self.new_handle(hash, payload, entry)
    }

    /// Handle to a resident resource.
    pub fn get(&self, hash: &ResourceContentHash) -> Option<ManagedResource> {
        let mut state = self.shared.lock();
        let entry = state.entries.get_mut(hash)?;
        if let Some(existing) = entry.handle.upgrade() {
            return Some(ManagedResource(existing));
        }
        let payload = entry.resource.clone()?;
        Some(self.new_handle(*hash, payload, entry))
    }

    pub fn contains(&self, hash: &ResourceContentHash) -> bool {
        self.shared
            .lock()
            .entries
            .get(hash)
            .is_some_and(|e| e.resource.is_some())
    }

    /// Pin `hash` without requiring its payload.
    pub fn hash_usage(&self, hash: ResourceContentHash) -> ResourceHashUsage {
        let mut state = self.shared.lock();
        state.entries.entry(hash).or_default().usages += 1;
        ResourceHashUsage {
            hash,
            store: Arc::downgrade(&self.shared),
        }
    }

    /// Handles to every resident resource.
    pub fn resources(&self) -> Vec<ManagedResource> {
        let hashes: Vec<ResourceContentHash> = {
            let state = self.shared.lock();
            state
                .entries
                .iter()
                .filter(|(_, e)| e.resource.is_some())
                .map(|(h, _)| *h)
                .collect()
        };
        hashes.iter().filter_map(|h| self.get(h)).collect()
    }

    /// Total payload bytes currently resident.
    pub fn resident_bytes(&self) -> usize {
        self.shared.lock().resident_bytes
    }

    /// Number of entries, including hash-only ones.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn deletion_allowed(&self, hash: &ResourceContentHash) -> bool {
        self.shared
            .lock()
            .entries
            .get(hash)
            .is_some_and(|e| e.deletion_allowed)
    }

    fn new_handle(
        &self,
        hash: ResourceContentHash,
        resource: Arc<Resource>,
        entry: &mut Entry,
    ) -> ManagedResource {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(ManagedInner {
            resource,
            hash,
            generation,
            store: Arc::downgrade(&self.shared),
        });
        entry.handle = Arc::downgrade(&inner);
        entry.generation = generation;
        entry.handle_live = true;
        ManagedResource(inner)
    }
}

// ── Handles ───────────────────────────────────────────────────────────────────

struct ManagedInner {
    resource: Arc<Resource>,
    hash: ResourceContentHash,
    generation: u64,
    store: Weak<StoreShared>,
}

impl Drop for ManagedInner {
    fn drop(&mut self) {
        let Some(shared) = self.store.upgrade() else {
            return;
        };
        let mut state = shared.lock();
        let StoreState {
            entries,
            resident_bytes,
        } = &mut *state;
        let Some(entry) = entries.get_mut(&self.hash) else {
            return;
        };
        if entry.generation != self.generation {
            // A newer wrapper took over after this one lost its last handle.
            return;
        }
        entry.handle_live = false;

        if entry.usages > 0 && !entry.deletion_allowed {
            tracing::trace!(hash = %self.hash, "payload retained by hash usage");
            return;
        }
        if let Some(resource) = entry.resource.take() {
            *resident_bytes -= resource.resident_size();
        }
        if entry.usages == 0 {
            entries.remove(&self.hash);
        }
        tracing::trace!(hash = %self.hash, "resource payload released");
    }
}

/// Shared ownership of a resident resource.
#[derive(Clone)]
pub struct ManagedResource(Arc<ManagedInner>);

impl ManagedResource {
    pub fn hash(&self) -> ResourceContentHash {
        self.0.hash
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.0.resource
    }

    /// Whether two handles share the same payload wrapper.
    pub fn ptr_eq(&self, other: &ManagedResource) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for ManagedResource {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.0.resource
    }
}

impl fmt::Debug for ManagedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ManagedResource").field(&self.0.resource).finish()
    }
}

/// Reference-counted pin on a hash.
pub struct ResourceHashUsage {
    hash: ResourceContentHash,
    store: Weak<StoreShared>,
}

impl ResourceHashUsage {
    pub fn hash(&self) -> ResourceContentHash {
        self.hash
    }
}

impl Clone for ResourceHashUsage {
    fn clone(&self) -> Self {
        if let Some(shared) = self.store.upgrade() {
            shared.lock().entries.entry(self.hash).or_default().usages += 1;
        }
        Self {
            hash: self.hash,
            store: self.store.clone(),
        }
    }
}

impl Drop for ResourceHashUsage {
    fn drop(&mut self) {
        let Some(shared) = self.store.upgrade() else {
            return;
        };
        let mut state = shared.lock();
        let StoreState {
            entries,
            resident_bytes,
        } = &mut *state;
        let Some(entry) = entries.get_mut(&self.hash) else {
            return;
        };
        entry.usages = entry.usages.saturating_sub(1);
        if entry.usages > 0 || entry.handle_live {
            return;
        }
        if let Some(resource) = entry.resource.take() {
            *resident_bytes -= resource.resident_size();
            tracing::trace!(hash = %self.hash, "retained payload released");
        }
        entries.remove(&self.hash);
    }
}

impl fmt::Debug for ResourceHashUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceHashUsage({})", self.hash)
    }
}

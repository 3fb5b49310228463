use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, trace};

use crate::config::{CacheSettings, ExpiryPolicy};
use crate::disk::DiskStore;
use crate::element::Element;
use crate::error::{CacheError, Result};
use crate::memory::MemoryStore;

/// Lifecycle of a cache: initialization builds the stores, disposal is
/// one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Uninitialised,
    Alive,
    Disposed,
}

enum CacheState {
    Uninitialised,
    Alive {
        memory: Arc<MemoryStore>,
        disk: Option<Arc<DiskStore>>,
    },
    Disposed,
}

/// Monotonic usage counters, all in memory only.
#[derive(Debug, Default)]
struct CacheStatistics {
    hit_count: AtomicU64,
    memory_store_hit_count: AtomicU64,
    disk_store_hit_count: AtomicU64,
    miss_count_not_found: AtomicU64,
    miss_count_expired: AtomicU64,
}

impl CacheStatistics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A two-tier cache: a bounded memory store, optionally backed by a disk
/// store the memory tier overflows into.
///
/// Lookups search memory first and then disk; a disk hit is promoted back
/// into the memory tier so recency ordering spans both tiers. An expired
/// element found on either tier is removed on the spot and reported as a
/// miss.
///
/// All operations other than construction fail with a not-alive error until
/// [`CacheManager`](crate::CacheManager) has initialised the cache, and again
/// after disposal.
pub struct Cache {
    settings: CacheSettings,
    policy: ExpiryPolicy,
    state: Mutex<CacheState>,
    statistics: CacheStatistics,
}

impl Cache {
    /// Builds an uninitialised cache. Stores are created when the cache is
    /// added to a manager.
    pub fn new(settings: CacheSettings) -> Self {
        let policy = settings.expiry_policy();
        Self {
            settings,
            policy,
            state: Mutex::new(CacheState::Uninitialised),
            statistics: CacheStatistics::default(),
        }
    }

    /// Creates the stores and brings the cache alive. Called by the manager
    /// with its resolved disk store directory.
    pub(crate) fn initialise(&self, disk_store_path: &Path) -> Result<()> {
        let mut state = self.state.lock()?;
        if !matches!(&*state, CacheState::Uninitialised) {
            return Err(CacheError::not_alive(&self.settings.name));
        }
        let disk = if self.settings.overflow_to_disk {
            Some(Arc::new(DiskStore::new(&self.settings, disk_store_path)?))
        } else {
            None
        };
        let memory = Arc::new(MemoryStore::new(&self.settings, disk.clone()));
        *state = CacheState::Alive { memory, disk };
        debug!("initialised cache {}", self.settings.name);
        Ok(())
    }

    fn not_alive(&self) -> CacheError {
        CacheError::not_alive(&self.settings.name)
    }

    /// Puts an element, resetting its access statistics as for a fresh
    /// insert.
    pub fn put(&self, mut element: Element) -> Result<()> {
        element.reset_access_statistics();
        self.put_quiet(element)
    }

    /// Puts an element without resetting its access statistics. Meant to pair
    /// with [`get_quiet`](Cache::get_quiet).
    pub fn put_quiet(&self, element: Element) -> Result<()> {
        let state = self.state.lock()?;
        let CacheState::Alive { memory, .. } = &*state else {
            return Err(self.not_alive());
        };
        memory.put(element)
    }

    /// Gets an element, updating its access statistics.
    pub fn get(&self, key: &str) -> Result<Option<Element>> {
        self.get_impl(key, true)
    }

    /// Gets an element without updating its access statistics. Cache-level
    /// counters still move.
    pub fn get_quiet(&self, key: &str) -> Result<Option<Element>> {
        self.get_impl(key, false)
    }

    fn get_impl(&self, key: &str, update_statistics: bool) -> Result<Option<Element>> {
        let state = self.state.lock()?;
        let CacheState::Alive { memory, disk } = &*state else {
            return Err(self.not_alive());
        };

        let mut element = self.search_in_memory_store(memory, disk, key, update_statistics)?;
        if element.is_none() {
            if let Some(disk_store) = disk {
                element = self.search_in_disk_store(memory, disk_store, key, update_statistics)?;
            }
        }

        match element {
            Some(element) => {
                CacheStatistics::bump(&self.statistics.hit_count);
                Ok(Some(element))
            }
            None => {
                CacheStatistics::bump(&self.statistics.miss_count_not_found);
                trace!("{} cache - miss for {key}", self.settings.name);
                Ok(None)
            }
        }
    }

    fn search_in_memory_store(
        &self,
        memory: &MemoryStore,
        disk: &Option<Arc<DiskStore>>,
        key: &str,
        update_statistics: bool,
    ) -> Result<Option<Element>> {
        let element = if update_statistics {
            memory.get(key)?
        } else {
            memory.get_quiet(key)?
        };
        let Some(element) = element else {
            return Ok(None);
        };
        if self.policy.is_expired(&element) {
            debug!("{} cache - memory store hit for {key}, but element expired", self.settings.name);
            CacheStatistics::bump(&self.statistics.miss_count_expired);
            remove_from_stores(memory, disk.as_deref(), key)?;
            return Ok(None);
        }
        CacheStatistics::bump(&self.statistics.memory_store_hit_count);
        Ok(Some(element))
    }

    fn search_in_disk_store(
        &self,
        memory: &MemoryStore,
        disk_store: &DiskStore,
        key: &str,
        update_statistics: bool,
    ) -> Result<Option<Element>> {
        let element = if update_statistics {
            disk_store.get(key)?
        } else {
            disk_store.get_quiet(key)?
        };
        let Some(element) = element else {
            return Ok(None);
        };
        if self.policy.is_expired(&element) {
            debug!("{} cache - disk store hit for {key}, but element expired", self.settings.name);
            CacheStatistics::bump(&self.statistics.miss_count_expired);
            remove_from_stores(memory, Some(disk_store), key)?;
            return Ok(None);
        }
        CacheStatistics::bump(&self.statistics.disk_store_hit_count);
        // Put the element back into memory so recency ordering holds across
        // tiers.
        memory.put(element.clone())?;
        Ok(Some(element))
    }

    /// Removes a key from both tiers, reporting whether either held it.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let state = self.state.lock()?;
        let CacheState::Alive { memory, disk } = &*state else {
            return Err(self.not_alive());
        };
        remove_from_stores(memory, disk.as_deref(), key)
    }

    /// Clears both tiers.
    pub fn remove_all(&self) -> Result<()> {
        let state = self.state.lock()?;
        let CacheState::Alive { memory, disk } = &*state else {
            return Err(self.not_alive());
        };
        memory.remove_all()?;
        if let Some(disk_store) = disk {
            disk_store.remove_all()?;
        }
        Ok(())
    }

    /// All keys, deduplicated across tiers: memory keys first, then disk
    /// keys not already seen. Costs O(n).
    pub fn get_keys(&self) -> Result<Vec<String>> {
        let state = self.state.lock()?;
        let CacheState::Alive { memory, disk } = &*state else {
            return Err(self.not_alive());
        };
        let mut keys = memory.keys()?;
        if let Some(disk_store) = disk {
            let mut seen: HashSet<String> = keys.iter().cloned().collect();
            for key in disk_store.keys()? {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    /// Concatenation of memory and disk keys. Faster than
    /// [`get_keys`](Cache::get_keys) but an element mid-overflow can appear
    /// twice.
    pub fn get_keys_no_duplicate_check(&self) -> Result<Vec<String>> {
        let state = self.state.lock()?;
        let CacheState::Alive { memory, disk } = &*state else {
            return Err(self.not_alive());
        };
        let mut keys = memory.keys()?;
        if let Some(disk_store) = disk {
            keys.extend(disk_store.keys()?);
        }
        Ok(keys)
    }

    /// Keys of non-expired elements only, established with quiet per-key
    /// probes. The cache lock is taken per probe, not across the whole scan,
    /// so the result can be stale by the time it returns.
    pub fn get_keys_with_expiry_check(&self) -> Result<Vec<String>> {
        let keys = self.get_keys()?;
        let mut live = Vec::with_capacity(keys.len());
        for key in keys {
            if self.get_quiet(&key)?.is_some() {
                live.push(key);
            }
        }
        Ok(live)
    }

    /// Number of unique keys across both tiers, expired elements included.
    pub fn size(&self) -> Result<usize> {
        Ok(self.get_keys()?.len())
    }

    pub fn memory_store_size(&self) -> Result<usize> {
        let state = self.state.lock()?;
        let CacheState::Alive { memory, .. } = &*state else {
            return Err(self.not_alive());
        };
        memory.len()
    }

    pub fn disk_store_size(&self) -> Result<usize> {
        let state = self.state.lock()?;
        let CacheState::Alive { disk, .. } = &*state else {
            return Err(self.not_alive());
        };
        match disk {
            Some(disk_store) => disk_store.size(),
            None => Ok(0),
        }
    }

    /// Serialized size of the memory tier. Expensive; walks every element.
    pub fn size_in_bytes(&self) -> Result<u64> {
        let state = self.state.lock()?;
        let CacheState::Alive { memory, .. } = &*state else {
            return Err(self.not_alive());
        };
        memory.size_in_bytes()
    }

    /// The disk store behind this cache, if overflow is enabled. Exposed for
    /// the file-level metrics it carries.
    pub fn disk_store(&self) -> Result<Option<Arc<DiskStore>>> {
        let state = self.state.lock()?;
        let CacheState::Alive { disk, .. } = &*state else {
            return Err(self.not_alive());
        };
        Ok(disk.clone())
    }

    /// Whether this element has expired under this cache's policy.
    pub fn is_expired(&self, element: &Element) -> Result<bool> {
        self.check_alive()?;
        Ok(self.policy.is_expired(element))
    }

    /// Disposes both stores. The memory store spools its contents out first
    /// for persistent caches. Safe to call more than once; later calls do
    /// nothing.
    pub fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock()?;
        if let CacheState::Alive { memory, disk } = std::mem::replace(&mut *state, CacheState::Disposed) {
            if let Err(e) = memory.dispose() {
                error!("{} cache: could not dispose memory store: {e}", self.settings.name);
            }
            if let Some(disk_store) = disk {
                if let Err(e) = disk_store.dispose() {
                    error!("{} cache: could not dispose disk store: {e}", self.settings.name);
                }
            }
        }
        Ok(())
    }

    pub fn status(&self) -> Status {
        match self.state.lock() {
            Ok(state) => match &*state {
                CacheState::Uninitialised => Status::Uninitialised,
                CacheState::Alive { .. } => Status::Alive,
                CacheState::Disposed => Status::Disposed,
            },
            Err(_) => Status::Disposed,
        }
    }

    fn check_alive(&self) -> Result<()> {
        match self.status() {
            Status::Alive => Ok(()),
            _ => Err(self.not_alive()),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn hit_count(&self) -> Result<u64> {
        self.check_alive()?;
        Ok(self.statistics.hit_count.load(Ordering::Relaxed))
    }

    pub fn memory_store_hit_count(&self) -> Result<u64> {
        self.check_alive()?;
        Ok(self.statistics.memory_store_hit_count.load(Ordering::Relaxed))
    }

    pub fn disk_store_hit_count(&self) -> Result<u64> {
        self.check_alive()?;
        Ok(self.statistics.disk_store_hit_count.load(Ordering::Relaxed))
    }

    /// Misses where the key was simply absent. An expired hit bumps this as
    /// well, since the removal makes the key absent for the rest of the
    /// lookup.
    pub fn miss_count_not_found(&self) -> Result<u64> {
        self.check_alive()?;
        Ok(self.statistics.miss_count_not_found.load(Ordering::Relaxed))
    }

    pub fn miss_count_expired(&self) -> Result<u64> {
        self.check_alive()?;
        Ok(self.statistics.miss_count_expired.load(Ordering::Relaxed))
    }
}

/// Shared removal path for public removes and the expired-on-read cleanup.
fn remove_from_stores(memory: &MemoryStore, disk: Option<&DiskStore>, key: &str) -> Result<bool> {
    let removed_from_memory = memory.remove(key)?;
    let removed_from_disk = match disk {
        Some(disk_store) => disk_store.remove(key)?,
        None => false,
    };
    Ok(removed_from_memory || removed_from_disk)
}

impl Drop for Cache {
    fn drop(&mut self) {
        if self.status() == Status::Alive {
            if self.settings.disk_persistent {
                debug!(
                    "dropping cache {} while still alive; disposing so the disk store is flushed",
                    self.settings.name
                );
            }
            if let Err(e) = self.dispose() {
                error!("{} cache: could not dispose on drop: {e}", self.settings.name);
            }
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.settings.name)
            .field("status", &self.status())
            .field("eternal", &self.settings.eternal)
            .field("overflow_to_disk", &self.settings.overflow_to_disk)
            .field("max_elements_in_memory", &self.settings.max_elements_in_memory)
            .field("time_to_live_seconds", &self.settings.time_to_live_seconds)
            .field("time_to_idle_seconds", &self.settings.time_to_idle_seconds)
            .field("disk_persistent", &self.settings.disk_persistent)
            .finish()
    }
}

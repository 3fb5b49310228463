use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use lru::LruCache;
use tier_cache::{Cache, CacheManager, CacheSettings, Element};
use tracing::{error, info, trace, warn};

use crate::error::{MegaMapError, Result};

/// Bound on the in-memory value map. Values beyond this are silently let go
/// of, recency-first; the key set and the backing cache keep the entry
/// itself alive.
const VALUE_MAP_CAPACITY: usize = 4096;

/// An unbounded map whose keys stay resident while values are free to fall
/// out of memory, backed by a [`Cache`] that overflows to disk and can
/// persist across restarts.
///
/// Writes are applied to the backing cache asynchronously, in order, by a
/// per-map worker draining a FIFO queue. Reads try the in-memory value map
/// first and fall back to the cache, which may load from disk.
///
/// Created through
/// [`MegaMapManager::create_mega_map`](crate::MegaMapManager::create_mega_map).
pub struct MegaMap {
    name: String,
    cache: Arc<Cache>,
    state: Mutex<MapState>,
    action_sender: Mutex<Option<Sender<CacheAction>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct MapState {
    value_map: LruCache<String, Vec<u8>>,
    key_set: HashSet<String>,
}

/// A write instruction queued for the background worker.
enum CacheAction {
    Put(String, Vec<u8>),
    Remove(String),
}

impl MegaMap {
    /// Builds the map and its backing cache and starts the writer. The cache
    /// keeps a single-element memory tier: the map's own value map is the
    /// real in-memory layer, the cache exists for the disk behind it.
    pub(crate) fn new(name: &str, manager: &CacheManager, persistent: bool) -> Result<MegaMap> {
        let settings = CacheSettings {
            name: name.to_string(),
            max_elements_in_memory: 1,
            eternal: true,
            overflow_to_disk: true,
            disk_persistent: persistent,
            ..Default::default()
        };
        let cache = manager.add_configured_cache(Cache::new(settings))?;

        // For a reloaded persistent map the key set is rebuilt from the
        // cache, so it stays the authoritative list of what the map holds.
        let key_set: HashSet<String> = cache.get_keys()?.into_iter().collect();

        let (action_sender, action_receiver) = mpsc::channel();
        let worker_cache = Arc::clone(&cache);
        let worker_name = name.to_string();
        let worker = std::thread::Builder::new()
            .name(format!("megamap-{name}"))
            .spawn(move || writer_main(&worker_name, &worker_cache, action_receiver))
            .map_err(tier_cache::CacheError::from)?;

        Ok(MegaMap {
            name: name.to_string(),
            cache,
            state: Mutex::new(MapState {
                value_map: LruCache::new(
                    NonZeroUsize::new(VALUE_MAP_CAPACITY).expect("capacity is non-zero"),
                ),
                key_set,
            }),
            action_sender: Mutex::new(Some(action_sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores a value, overwriting any previous value for the key. The write
    /// reaches the backing cache asynchronously but is immediately visible
    /// to [`get`](MegaMap::get).
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        {
            let mut state = self.state.lock()?;
            state.value_map.put(key.clone(), value.clone());
            state.key_set.insert(key.clone());
        }
        self.enqueue(CacheAction::Put(key, value))
    }

    /// Gets the value for a key, consulting the in-memory value map first
    /// and the backing cache second.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        {
            let mut state = self.state.lock()?;
            if let Some(value) = state.value_map.get(key) {
                trace!("MegaMap-{}: found {key} in memory", self.name);
                return Ok(Some(value.clone()));
            }
        }
        let Some(element) = self.cache.get(key)? else {
            return Ok(None);
        };
        trace!("MegaMap-{}: found {key} in backing cache", self.name);
        Ok(element.into_value())
    }

    /// Whether a value is stored for the key. Only probes the resident key
    /// set, so unlike [`get`](MegaMap::get) this never touches disk.
    pub fn has_key(&self, key: &str) -> Result<bool> {
        Ok(self.state.lock()?.key_set.contains(key))
    }

    /// Removes the value for the key.
    pub fn remove(&self, key: &str) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            state.value_map.pop(key);
            state.key_set.remove(key);
        }
        self.enqueue(CacheAction::Remove(key.to_string()))
    }

    /// A snapshot of all keys in the map.
    pub fn get_keys(&self) -> Result<HashSet<String>> {
        Ok(self.state.lock()?.key_set.clone())
    }

    fn enqueue(&self, action: CacheAction) -> Result<()> {
        let sender = self.action_sender.lock()?;
        let Some(sender) = sender.as_ref() else {
            return Err(MegaMapError::ShutDown);
        };
        sender.send(action).map_err(|_| MegaMapError::ShutDown)
    }

    /// Stops accepting writes, waits for the action queue to drain, joins
    /// the worker and disposes the backing cache. Safe to call more than
    /// once.
    pub(crate) fn shutdown(&self) -> Result<()> {
        let sender = self.action_sender.lock()?.take();
        if sender.is_none() {
            return Ok(());
        }
        // Dropping the sender lets the worker finish whatever is queued and
        // then observe the disconnect.
        drop(sender);
        if let Some(worker) = self.worker.lock()?.take() {
            if worker.join().is_err() {
                warn!("MegaMap-{}: persistence worker panicked", self.name);
            }
        }
        self.cache.dispose()?;
        Ok(())
    }
}

impl Drop for MegaMap {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("MegaMap-{}: could not shut down cleanly: {e}", self.name);
        }
    }
}

impl std::fmt::Debug for MegaMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MegaMap").field("name", &self.name).finish()
    }
}

/// Worker loop: applies queued actions to the backing cache in enqueue
/// order until the map is shut down and the queue is empty.
fn writer_main(name: &str, cache: &Cache, receiver: Receiver<CacheAction>) {
    info!("MegaMap-{name} persistence worker started");
    while let Ok(action) = receiver.recv() {
        match action {
            CacheAction::Put(key, value) => {
                trace!("MegaMap-{name}: putting '{key}' in backing cache");
                if let Err(e) = cache.put(Element::new(key, value)) {
                    error!("MegaMap-{name}: background put failed: {e}");
                }
            }
            CacheAction::Remove(key) => {
                trace!("MegaMap-{name}: removing '{key}' from backing cache");
                if let Err(e) = cache.remove(&key) {
                    error!("MegaMap-{name}: background remove failed: {e}");
                }
            }
        }
    }
    info!("MegaMap-{name} persistence worker shutting down");
}

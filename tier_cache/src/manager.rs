use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tracing::{debug, error, warn};

use crate::cache::Cache;
use crate::config::{resolve_disk_store_path, CacheManagerConfig, CacheSettings};
use crate::error::{CacheError, Result};

/// Process-wide slot backing [`CacheManager::instance`]. Shutdown clears it
/// so a later call builds a fresh manager.
static INSTANCE: Lazy<Mutex<Option<Arc<CacheManager>>>> = Lazy::new(|| Mutex::new(None));

const MANAGER_NAME: &str = "CacheManager";

#[derive(Debug, PartialEq, Eq)]
enum ManagerStatus {
    Alive,
    Shutdown,
}

struct ManagerState {
    status: ManagerStatus,
    caches: HashMap<String, Arc<Cache>>,
    disk_store_path: PathBuf,
    default_cache: Option<CacheSettings>,
}

/// Owns the set of named caches, the directory their disk stores share, and
/// orderly shutdown.
///
/// A manager is an ordinary value; [`CacheManager::instance`] additionally
/// offers one lazily-created process-wide manager for callers that want the
/// singleton ergonomics.
pub struct CacheManager {
    state: Mutex<ManagerState>,
}

impl CacheManager {
    /// Builds a manager from a configuration record, creating any caches the
    /// record declares.
    pub fn new(config: CacheManagerConfig) -> Result<Self> {
        let mut state = ManagerState {
            status: ManagerStatus::Alive,
            caches: HashMap::new(),
            disk_store_path: resolve_disk_store_path(config.disk_store_path.as_deref()),
            default_cache: config.default_cache,
        };
        for settings in config.caches {
            add_cache_to(&mut state, Cache::new(settings))?;
        }
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Returns the process-wide manager, creating it with default
    /// configuration on first use (or after a shutdown).
    pub fn instance() -> Result<Arc<CacheManager>> {
        Self::create(CacheManagerConfig::default())
    }

    /// Returns the process-wide manager, creating it from `config` if none
    /// exists yet. An already-created instance is returned as-is.
    pub fn create(config: CacheManagerConfig) -> Result<Arc<CacheManager>> {
        let mut slot = INSTANCE.lock()?;
        if let Some(existing) = slot.as_ref() {
            debug!("returning existing CacheManager instance");
            return Ok(Arc::clone(existing));
        }
        let manager = Arc::new(CacheManager::new(config)?);
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }

    fn alive_state(&self) -> Result<std::sync::MutexGuard<'_, ManagerState>> {
        let state = self.state.lock()?;
        if state.status != ManagerStatus::Alive {
            return Err(CacheError::not_alive(MANAGER_NAME));
        }
        Ok(state)
    }

    /// Adds a cache created from the default cache settings under the given
    /// name.
    pub fn add_cache(&self, name: &str) -> Result<Arc<Cache>> {
        let mut state = self.alive_state()?;
        let Some(default_settings) = state.default_cache.clone() else {
            return Err(CacheError::ConfigurationMissing(format!(
                "no default cache settings configured; cannot create cache {name}"
            )));
        };
        let settings = CacheSettings {
            name: name.to_string(),
            ..default_settings
        };
        add_cache_to(&mut state, Cache::new(settings))
    }

    /// Adds an already-configured cache, initialising its stores against
    /// this manager's disk store path.
    pub fn add_configured_cache(&self, cache: Cache) -> Result<Arc<Cache>> {
        let mut state = self.alive_state()?;
        add_cache_to(&mut state, cache)
    }

    pub fn get_cache(&self, name: &str) -> Result<Option<Arc<Cache>>> {
        let state = self.alive_state()?;
        Ok(state.caches.get(name).cloned())
    }

    pub fn cache_exists(&self, name: &str) -> Result<bool> {
        let state = self.alive_state()?;
        Ok(state.caches.contains_key(name))
    }

    pub fn cache_names(&self) -> Result<Vec<String>> {
        let state = self.alive_state()?;
        Ok(state.caches.keys().cloned().collect())
    }

    /// Removes and disposes a cache. Unknown names are ignored.
    pub fn remove_cache(&self, name: &str) -> Result<()> {
        let mut state = self.alive_state()?;
        if let Some(cache) = state.caches.remove(name) {
            if let Err(e) = cache.dispose() {
                error!("could not dispose cache {name} on removal: {e}");
            }
        }
        Ok(())
    }

    /// Directory used for the disk stores of caches added after this call.
    pub fn set_disk_store_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut state = self.alive_state()?;
        state.disk_store_path = path.as_ref().to_path_buf();
        Ok(())
    }

    pub fn disk_store_path(&self) -> Result<PathBuf> {
        let state = self.alive_state()?;
        Ok(state.disk_store_path.clone())
    }

    /// Disposes every cache and retires the manager. Idempotent; a second
    /// call performs no I/O. Also releases the process-wide slot if this
    /// manager occupies it, so a fresh [`CacheManager::instance`] call
    /// builds a new one.
    pub fn shutdown(&self) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.status == ManagerStatus::Shutdown {
                warn!("CacheManager already shut down");
                return;
            }
            for (name, cache) in state.caches.drain() {
                if let Err(e) = cache.dispose() {
                    error!("could not dispose cache {name} on shutdown: {e}");
                }
            }
            state.status = ManagerStatus::Shutdown;
        }

        if let Ok(mut slot) = INSTANCE.lock() {
            let occupied_by_self = slot
                .as_ref()
                .map(|existing| std::ptr::eq(existing.as_ref(), self))
                .unwrap_or(false);
            if occupied_by_self {
                *slot = None;
            }
        }
    }
}

/// Registers a cache, refusing duplicates, and initialises it against the
/// manager's disk store path.
fn add_cache_to(state: &mut ManagerState, cache: Cache) -> Result<Arc<Cache>> {
    let name = cache.name().to_string();
    if state.caches.contains_key(&name) {
        return Err(CacheError::AlreadyExists { name });
    }
    cache.initialise(&state.disk_store_path)?;
    let cache = Arc::new(cache);
    state.caches.insert(name, Arc::clone(&cache));
    Ok(cache)
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("CacheManager");
        if let Ok(state) = self.state.lock() {
            d.field("status", &state.status)
                .field("caches", &state.caches.keys().collect::<Vec<_>>())
                .field("disk_store_path", &state.disk_store_path);
        }
        d.finish()
    }
}

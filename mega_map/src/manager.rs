use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tier_cache::CacheManager;
use tracing::{debug, error};

use crate::error::{MegaMapError, Result};
use crate::map::MegaMap;

const STORE_SUFFIX: &str = ".data";
const INDEX_SUFFIX: &str = ".index";

const MAX_NAME_LENGTH: usize = 200;

/// Process-wide slot backing [`MegaMapManager::instance`].
static INSTANCE: Lazy<Mutex<Option<Arc<MegaMapManager>>>> = Lazy::new(|| Mutex::new(None));

/// The entry point for creating and managing [`MegaMap`]s.
///
/// Owns the maps by validated name and the [`CacheManager`] their backing
/// caches live in. [`shutdown`](MegaMapManager::shutdown) must run before
/// process exit for persistent maps to be flushed; dropping the manager does
/// this as a fallback.
pub struct MegaMapManager {
    maps: Mutex<HashMap<String, Arc<MegaMap>>>,
    cache_manager: Arc<CacheManager>,
}

impl MegaMapManager {
    /// The process-wide manager, created on first use over the process-wide
    /// [`CacheManager`].
    pub fn instance() -> Result<Arc<MegaMapManager>> {
        let mut slot = INSTANCE.lock()?;
        if let Some(existing) = slot.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let manager = Arc::new(MegaMapManager::with_cache_manager(CacheManager::instance()?));
        *slot = Some(Arc::clone(&manager));
        Ok(manager)
    }

    /// Builds a manager over an explicit cache manager. Useful where the
    /// process-wide singleton is unwanted.
    pub fn with_cache_manager(cache_manager: Arc<CacheManager>) -> MegaMapManager {
        MegaMapManager {
            maps: Mutex::new(HashMap::new()),
            cache_manager,
        }
    }

    /// Sets the directory maps created after this call store their files in.
    /// Defaults to the system temp directory.
    pub fn set_disk_store_path(&self, path: impl AsRef<Path>) -> Result<()> {
        self.cache_manager.set_disk_store_path(path)?;
        Ok(())
    }

    /// Creates a new map, or reloads a persisted one from disk.
    ///
    /// With `overwrite_old` set, files left by an earlier persistent map of
    /// the same name are deleted first.
    pub fn create_mega_map(&self, name: &str, persistent: bool, overwrite_old: bool) -> Result<Arc<MegaMap>> {
        self.create_map_impl(name, None, persistent, overwrite_old)
    }

    /// [`create_mega_map`](MegaMapManager::create_mega_map), but writing the
    /// map's files under `path` instead of the manager's directory.
    pub fn create_mega_map_at(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        persistent: bool,
        overwrite_old: bool,
    ) -> Result<Arc<MegaMap>> {
        self.create_map_impl(name, Some(path.as_ref()), persistent, overwrite_old)
    }

    fn create_map_impl(
        &self,
        name: &str,
        path: Option<&Path>,
        persistent: bool,
        overwrite_old: bool,
    ) -> Result<Arc<MegaMap>> {
        let name = validate_map_name(name)?;
        let mut maps = self.maps.lock()?;
        if maps.contains_key(&name) {
            return Err(MegaMapError::AlreadyExists(name));
        }
        if persistent && overwrite_old {
            self.delete_map_files(path, &name)?;
        }

        // A one-off path override swaps the manager's directory just for
        // this creation.
        let old_path = match path {
            Some(p) => {
                let old = self.cache_manager.disk_store_path()?;
                self.cache_manager.set_disk_store_path(p)?;
                Some(old)
            }
            None => None,
        };
        let created = MegaMap::new(&name, &self.cache_manager, persistent);
        if let Some(old) = old_path {
            self.cache_manager.set_disk_store_path(old)?;
        }

        let map = Arc::new(created?);
        maps.insert(name, Arc::clone(&map));
        Ok(map)
    }

    /// Retrieves a previously created map. Unknown or invalid names give
    /// `None`.
    pub fn get_mega_map(&self, name: &str) -> Option<Arc<MegaMap>> {
        let name = validate_map_name(name).ok()?;
        self.maps.lock().ok()?.get(&name).cloned()
    }

    /// Shuts a map down and removes it from management: its queue is
    /// drained, the writer stopped and the backing cache disposed. The
    /// map's persisted files are left in place; see
    /// [`delete_persisted_mega_map`](MegaMapManager::delete_persisted_mega_map).
    pub fn remove_mega_map(&self, name: &str) -> Result<()> {
        let Ok(name) = validate_map_name(name) else {
            return Ok(());
        };
        let removed = self.maps.lock()?.remove(&name);
        if let Some(map) = removed {
            map.shutdown()?;
            // Disposes the backing cache a second time; dispose is
            // idempotent.
            self.cache_manager.remove_cache(&name)?;
        }
        Ok(())
    }

    /// Deletes the files of a map persisted earlier. The map must not be
    /// active.
    pub fn delete_persisted_mega_map(&self, name: &str, path: Option<&Path>) -> Result<()> {
        let name = validate_map_name(name)?;
        if self.maps.lock()?.contains_key(&name) {
            return Err(MegaMapError::Active(name));
        }
        self.delete_map_files(path, &name)
    }

    fn delete_map_files(&self, path: Option<&Path>, validated_name: &str) -> Result<()> {
        let directory = match path {
            Some(p) => p.to_path_buf(),
            None => self.cache_manager.disk_store_path()?,
        };
        for suffix in [STORE_SUFFIX, INDEX_SUFFIX] {
            let file = directory.join(format!("{validated_name}{suffix}"));
            if file.exists() {
                debug!("deleting map file {}", file.display());
                if let Err(e) = fs::remove_file(&file) {
                    error!("could not delete map file {}: {e}", file.display());
                }
            }
        }
        Ok(())
    }

    /// Shuts down every map and the underlying cache manager. Persistent
    /// maps are all saved to disk. There should be no further use of the
    /// maps after this returns.
    pub fn shutdown(&self) {
        if let Ok(mut maps) = self.maps.lock() {
            for (name, map) in maps.drain() {
                if let Err(e) = map.shutdown() {
                    error!("could not shut down MegaMap-{name}: {e}");
                }
            }
        }
        self.cache_manager.shutdown();

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

    pub fn disk_store_path(&self) -> Result<PathBuf> {
        Ok(self.cache_manager.disk_store_path()?)
    }
}

impl Drop for MegaMapManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MegaMapManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("MegaMapManager");
        if let Ok(maps) = self.maps.lock() {
            d.field("maps", &maps.keys().collect::<Vec<_>>());
        }
        d.finish()
    }
}

/// Checks the length bound and maps every non-alphanumeric character to an
/// underscore; the validated name is what the map files are prefixed with.
fn validate_map_name(name: &str) -> Result<String> {
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(MegaMapError::InvalidName(format!(
            "map name cannot be longer than {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_map_name() {
        assert_eq!(validate_map_name("plainName01").unwrap(), "plainName01");
        assert_eq!(validate_map_name("user cache/v2.1").unwrap(), "user_cache_v2_1");
        assert!(validate_map_name(&"x".repeat(201)).is_err());
        assert_eq!(validate_map_name(&"x".repeat(200)).unwrap().len(), 200);
    }
}

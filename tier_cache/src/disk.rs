use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::config::{CacheSettings, ExpiryPolicy};
use crate::element::{now_ms, Element};
use crate::error::{CacheError, Result};

mod index;

use index::{DiskElement, DiskIndex};

/// A disk store: one data file of allocated blocks plus an index mapping
/// keys to blocks.
///
/// Writes are spooled in memory and committed by a background worker; reads
/// check the spool before the index so a put is always visible to a
/// subsequent get. A second background worker removes expired entries for
/// non-eternal caches.
///
/// Every operation takes the store's one lock, and the spool worker holds it
/// for the whole of a flush, so reads queue behind an in-progress flush.
pub struct DiskStore {
    shared: Arc<DiskShared>,
    persistent: bool,
    eternal: bool,
    expiry_interval: Duration,
    data_file_path: PathBuf,
    index_file_path: PathBuf,
    spool_thread: Mutex<Option<JoinHandle<()>>>,
    expiry_thread: Mutex<Option<JoinHandle<()>>>,
}

/// State shared with the background workers.
struct DiskShared {
    name: String,
    policy: ExpiryPolicy,
    state: Mutex<DiskState>,
    /// Paired with `state`: signalled when the spool gains elements and on
    /// shutdown.
    work_available: Condvar,
    /// Paired with `state` as well: the expiry worker runs its timed sleep
    /// on this so shutdown can cut a sleep short without a missed-wakeup
    /// window.
    expiry_wake: Condvar,
}

struct DiskState {
    active: bool,
    file: Option<File>,
    index: DiskIndex,
    /// Pending writes not yet committed to the data file.
    spool: HashMap<String, Element>,
    /// Live payload bytes. Diverges from the file length as blocks are
    /// reused with smaller payloads; see [`DiskStore::data_file_sparseness`].
    total_size: u64,
}

impl DiskStore {
    /// Creates the store directory and files, restores the index for
    /// persistent stores, and starts the background workers.
    pub fn new(settings: &CacheSettings, disk_path: &Path) -> Result<Self> {
        let name = settings.name.clone();
        if disk_path.exists() && !disk_path.is_dir() {
            return Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("store directory {} exists and is not a directory", disk_path.display()),
            )));
        }
        fs::create_dir_all(disk_path)?;

        let data_file_path = disk_path.join(format!("{name}.data"));
        let index_file_path = disk_path.join(format!("{name}.index"));
        let persistent = settings.disk_persistent;

        let index = if persistent {
            Self::restore_index(&name, &index_file_path, &data_file_path)
        } else {
            debug!("{name}Cache: deleting data file {}", data_file_path.display());
            let _ = fs::remove_file(&data_file_path);
            DiskIndex::default()
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&data_file_path)?;
        let total_size = index.elements.values().map(|e| e.payload_size as u64).sum();

        let shared = Arc::new(DiskShared {
            name: name.clone(),
            policy: settings.expiry_policy(),
            state: Mutex::new(DiskState {
                active: true,
                file: Some(file),
                index,
                spool: HashMap::new(),
                total_size,
            }),
            work_available: Condvar::new(),
            expiry_wake: Condvar::new(),
        });

        let spool_shared = Arc::clone(&shared);
        let spool_thread = std::thread::Builder::new()
            .name(format!("{name}-spool"))
            .spawn(move || spool_worker_main(&spool_shared))?;

        let eternal = settings.eternal;
        let expiry_interval = Duration::from_secs(settings.expiry_thread_interval_seconds());
        let expiry_thread = if eternal {
            None
        } else {
            let expiry_shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name(format!("{name}-expiry"))
                    .spawn(move || expiry_worker_main(&expiry_shared, expiry_interval))?,
            )
        };

        Ok(Self {
            shared,
            persistent,
            eternal,
            expiry_interval,
            data_file_path,
            index_file_path,
            spool_thread: Mutex::new(Some(spool_thread)),
            expiry_thread: Mutex::new(expiry_thread),
        })
    }

    /// Reads the persisted index back, falling back to an empty index (and
    /// discarding the data file) when it is missing or dirty.
    ///
    /// The index file is then recreated empty either way. The rewrite only
    /// happens again on a clean shutdown, so a crash leaves an empty index
    /// behind and the next startup lands in the fallback path, keeping stale
    /// data from being served.
    fn restore_index(name: &str, index_file_path: &Path, data_file_path: &Path) -> DiskIndex {
        let index = File::open(index_file_path)
            .map_err(CacheError::from)
            .and_then(|f| DiskIndex::deserialize(&mut BufReader::new(f)));
        let index = match index {
            Ok(index) => index,
            Err(e) => {
                debug!("{name}Cache: index file dirty or empty ({e}), deleting data file");
                let _ = fs::remove_file(data_file_path);
                DiskIndex::default()
            }
        };
        if let Err(e) = fs::write(index_file_path, b"") {
            warn!("{name}Cache: could not reset index file: {e}");
        }
        index
    }

    fn check_active(&self, state: &DiskState) -> Result<()> {
        if state.active {
            Ok(())
        } else {
            Err(CacheError::not_alive(&self.shared.name))
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Gets an element, updating its access statistics.
    ///
    /// A pending spooled write satisfies the read directly and is taken out
    /// of the spool; the caller owns the returned element.
    pub fn get(&self, key: &str) -> Result<Option<Element>> {
        self.get_impl(key, true)
    }

    /// Gets an element without touching its access statistics.
    pub fn get_quiet(&self, key: &str) -> Result<Option<Element>> {
        self.get_impl(key, false)
    }

    fn get_impl(&self, key: &str, update_statistics: bool) -> Result<Option<Element>> {
        let mut state = self.shared.state.lock()?;
        self.check_active(&state)?;

        if let Some(mut element) = state.spool.remove(key) {
            trace!("{}Cache: spool hit for {key}", self.shared.name);
            if update_statistics {
                element.update_access_statistics();
            }
            return Ok(Some(element));
        }

        let Some(disk_element) = state.index.elements.get(key).cloned() else {
            return Ok(None);
        };
        match read_element(&mut state, &disk_element) {
            Ok(mut element) => {
                if update_statistics {
                    element.update_access_statistics();
                }
                Ok(Some(element))
            }
            Err(CacheError::Serialization(e)) => {
                warn!("{}Cache: could not read disk store element for key {key}: {e}", self.shared.name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Queues an element for writing and wakes the spool worker.
    pub fn put(&self, element: Element) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        self.check_active(&state)?;
        state.spool.insert(element.key().to_string(), element);
        self.shared.work_available.notify_all();
        Ok(())
    }

    /// Removes an entry from the spool or the index, returning whether
    /// anything was removed. A removed block goes back on the free list.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut state = self.shared.state.lock()?;
        self.check_active(&state)?;
        if state.spool.remove(key).is_some() {
            return Ok(true);
        }
        if let Some(element) = state.index.elements.remove(key) {
            free_block(&mut state, element);
            return Ok(true);
        }
        Ok(false)
    }

    /// Drops every entry and truncates the data file.
    pub fn remove_all(&self) -> Result<()> {
        let mut state = self.shared.state.lock()?;
        self.check_active(&state)?;
        state.spool.clear();
        state.index.elements.clear();
        state.index.free_space.clear();
        state.total_size = 0;
        if let Some(file) = state.file.as_mut() {
            file.set_len(0)?;
        }
        if self.persistent {
            fs::write(&self.index_file_path, b"")?;
        }
        Ok(())
    }

    /// All keys currently present, deduplicated across the spool and the
    /// index.
    pub fn keys(&self) -> Result<Vec<String>> {
        let state = self.shared.state.lock()?;
        self.check_active(&state)?;
        let mut seen: HashSet<&String> = HashSet::with_capacity(state.index.elements.len() + state.spool.len());
        let mut keys = Vec::new();
        for key in state.index.elements.keys().chain(state.spool.keys()) {
            if seen.insert(key) {
                keys.push(key.clone());
            }
        }
        Ok(keys)
    }

    /// Entry count, spool included. A key mid-flush can be counted in both
    /// structures.
    pub fn size(&self) -> Result<usize> {
        let state = self.shared.state.lock()?;
        self.check_active(&state)?;
        Ok(state.index.elements.len() + state.spool.len())
    }

    /// Whether all spooled writes have been committed. True for a disposed
    /// store.
    pub fn is_spool_empty(&self) -> Result<bool> {
        let state = self.shared.state.lock()?;
        Ok(!state.active || state.spool.is_empty())
    }

    /// Shuts the store down: flushes and persists if persistent, closes the
    /// file, stops both workers. Safe to call more than once.
    pub fn dispose(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock()?;
            if !state.active {
                return Ok(());
            }
            if self.persistent {
                if let Err(e) = flush_spool(&self.shared.name, &self.shared.policy, &mut state) {
                    error!("{}Cache: could not flush spool on dispose: {e}", self.shared.name);
                }
                if let Err(e) = self.write_index(&state) {
                    error!("{}Cache: could not write index on dispose: {e}", self.shared.name);
                }
            }
            state.spool.clear();
            state.index.elements.clear();
            state.index.free_space.clear();
            state.file = None;
            if !self.persistent {
                debug!("{}Cache: deleting data file {}", self.shared.name, self.data_file_path.display());
                let _ = fs::remove_file(&self.data_file_path);
            }
            state.active = false;
            self.shared.work_available.notify_all();
            self.shared.expiry_wake.notify_all();
        }

        if let Some(handle) = self.spool_thread.lock()?.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.expiry_thread.lock()?.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Serializes the elements map and the free list to the index file.
    fn write_index(&self, state: &DiskState) -> Result<()> {
        let file = File::create(&self.index_file_path)?;
        let mut writer = BufWriter::new(file);
        state.index.serialize(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn data_file_path(&self) -> &Path {
        &self.data_file_path
    }

    pub fn index_file_path(&self) -> &Path {
        &self.index_file_path
    }

    pub fn data_file_size(&self) -> u64 {
        fs::metadata(&self.data_file_path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn index_file_size(&self) -> u64 {
        fs::metadata(&self.index_file_path).map(|m| m.len()).unwrap_or(0)
    }

    pub fn total_file_size(&self) -> u64 {
        self.data_file_size() + self.index_file_size()
    }

    /// Live payload bytes, excluding the holes left by block reuse.
    pub fn used_data_size(&self) -> Result<u64> {
        Ok(self.shared.state.lock()?.total_size)
    }

    /// Fraction of the data file not holding live payload. Block reuse with a
    /// smaller payload leaves gaps that are never compacted, so this grows
    /// over the life of a store.
    pub fn data_file_sparseness(&self) -> Result<f64> {
        let file_size = self.data_file_size();
        if file_size == 0 {
            return Ok(0.0);
        }
        Ok(1.0 - (self.used_data_size()? as f64 / file_size as f64))
    }

    #[cfg(test)]
    fn expiry_thread_alive(&self) -> bool {
        self.expiry_thread
            .lock()
            .map(|g| g.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            error!("{}Cache: could not shut down disk store: {e}", self.shared.name);
        }
    }
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("name", &self.shared.name)
            .field("data_file", &self.data_file_path)
            .field("persistent", &self.persistent)
            .field("eternal", &self.eternal)
            .field("expiry_interval", &self.expiry_interval)
            .finish()
    }
}

/// Reads and deserializes one element out of its block.
///
/// Unreadable payload bytes are reported as a serialization failure so the
/// caller treats the entry as a miss rather than failing the store.
fn read_element(state: &mut DiskState, disk_element: &DiskElement) -> Result<Element> {
    let file = state
        .file
        .as_mut()
        .ok_or_else(|| CacheError::Io(std::io::Error::new(std::io::ErrorKind::NotConnected, "data file closed")))?;
    file.seek(SeekFrom::Start(disk_element.position))?;
    let mut buffer = vec![0u8; disk_element.payload_size as usize];
    match file.read_exact(&mut buffer) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CacheError::serialization("payload truncated"));
        }
        Err(e) => return Err(e.into()),
    }
    Element::deserialize(&mut std::io::Cursor::new(buffer))
}

/// Returns a removed block to the free list.
fn free_block(state: &mut DiskState, mut element: DiskElement) {
    state.total_size = state.total_size.saturating_sub(element.payload_size as u64);
    element.payload_size = 0;
    state.index.free_space.push(element);
}

/// Takes the first free block large enough for `payload_size`, in insertion
/// order.
fn find_free_block(free_space: &mut Vec<DiskElement>, payload_size: u32) -> Option<DiskElement> {
    let position = free_space.iter().position(|e| e.block_size >= payload_size)?;
    Some(free_space.remove(position))
}

/// Commits every spooled element to the data file.
///
/// The spool is cleared whether or not the writes succeed; an element whose
/// write fails is logged and dropped.
fn flush_spool(name: &str, policy: &ExpiryPolicy, state: &mut DiskState) -> Result<()> {
    let spool = std::mem::take(&mut state.spool);
    for (key, element) in spool {
        if let Err(e) = write_element(policy, state, &key, &element) {
            error!("{name}Cache: could not write disk store element for {key}: {e}");
        }
    }
    Ok(())
}

/// The allocator protocol: free any previous block for the key, reuse a free
/// block if one fits or grow the file, write the payload, then install the
/// index entry.
fn write_element(policy: &ExpiryPolicy, state: &mut DiskState, key: &str, element: &Element) -> Result<()> {
    if let Some(old) = state.index.elements.remove(key) {
        free_block(state, old);
    }

    let mut buffer = Vec::with_capacity(element.serialized_size());
    element.serialize(&mut buffer)?;
    let payload_size = buffer.len() as u32;

    let DiskState {
        file, index, total_size, ..
    } = state;
    let file = file
        .as_mut()
        .ok_or_else(|| CacheError::Io(std::io::Error::new(std::io::ErrorKind::NotConnected, "data file closed")))?;

    let mut disk_element = match find_free_block(&mut index.free_space, payload_size) {
        Some(reused) => reused,
        None => DiskElement {
            position: file.seek(SeekFrom::End(0))?,
            block_size: payload_size,
            payload_size: 0,
            expiry_time: 0,
        },
    };

    file.seek(SeekFrom::Start(disk_element.position))?;
    file.write_all(&buffer)?;

    disk_element.expiry_time = policy.expiry_time(element);
    disk_element.payload_size = payload_size;
    *total_size += payload_size as u64;
    index.elements.insert(key.to_string(), disk_element);
    Ok(())
}

/// Spool worker: waits for elements and commits them. Exits when the store
/// is disposed.
fn spool_worker_main(shared: &DiskShared) {
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    loop {
        while state.active && state.spool.is_empty() {
            state = match shared.work_available.wait(state) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
        if !state.active {
            return;
        }
        if let Err(e) = flush_spool(&shared.name, &shared.policy, &mut state) {
            error!("{}Cache: could not write elements to disk store: {e}", shared.name);
        }
    }
}

/// Expiry worker: sleeps for the configured interval, then removes expired
/// entries from the spool and the index. Only started for non-eternal
/// caches.
fn expiry_worker_main(shared: &DiskShared, interval: Duration) {
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    loop {
        let deadline = std::time::Instant::now() + interval;
        while state.active {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            state = match shared.expiry_wake.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(_) => return,
            };
        }
        if !state.active {
            debug!("{}Cache: expiry worker stopping", shared.name);
            return;
        }
        expire_elements(&shared.name, &shared.policy, &mut state);
    }
}

/// One expiry pass over the spool and the on-disk index.
fn expire_elements(name: &str, policy: &ExpiryPolicy, state: &mut DiskState) {
    let now = now_ms();

    state.spool.retain(|key, element| {
        let keep = !policy.is_expired(element);
        if !keep {
            debug!("{name}Cache: removing expired spool element {key}");
        }
        keep
    });

    let expired: Vec<String> = state
        .index
        .elements
        .iter()
        .filter(|(_, disk_element)| now >= disk_element.expiry_time)
        .map(|(key, _)| key.clone())
        .collect();
    for key in expired {
        if let Some(disk_element) = state.index.elements.remove(&key) {
            debug!("{name}Cache: removing expired element {key} from disk store");
            free_block(state, disk_element);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tempfile::TempDir;

    use super::*;
    use crate::config::CacheSettings;

    fn settings(name: &str) -> CacheSettings {
        CacheSettings {
            name: name.to_string(),
            eternal: true,
            overflow_to_disk: true,
            ..Default::default()
        }
    }

    fn wait_for_spool(store: &DiskStore) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !store.is_spool_empty().unwrap() {
            assert!(Instant::now() < deadline, "spool never drained");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_get_served_from_spool_before_flush() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("spool"), dir.path()).unwrap();

        store.put(Element::new("k1", "v1")).unwrap();
        let element = store.get("k1").unwrap().unwrap();
        assert_eq!(element.value(), Some(b"v1".as_ref()));
        assert_eq!(element.hit_count(), 1);
    }

    #[test]
    fn test_get_after_flush_reads_from_file() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("flush"), dir.path()).unwrap();

        store.put(Element::new("k1", "v1")).unwrap();
        wait_for_spool(&store);
        assert!(store.data_file_size() > 0);

        let element = store.get("k1").unwrap().unwrap();
        assert_eq!(element.value(), Some(b"v1".as_ref()));
    }

    #[test]
    fn test_get_quiet_leaves_statistics() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("quiet"), dir.path()).unwrap();

        store.put(Element::new("k1", "v1")).unwrap();
        wait_for_spool(&store);
        let element = store.get_quiet("k1").unwrap().unwrap();
        assert_eq!(element.hit_count(), 0);
        assert_eq!(element.last_access_time(), 0);
    }

    #[test]
    fn test_missing_key() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("missing"), dir.path()).unwrap();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_remove_and_block_reuse() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("reuse"), dir.path()).unwrap();

        store.put(Element::new("k1", vec![1u8; 100])).unwrap();
        wait_for_spool(&store);
        let len_after_first = store.data_file_size();

        assert!(store.remove("k1").unwrap());
        assert!(!store.remove("k1").unwrap());
        assert!(store.get("k1").unwrap().is_none());

        // A same-sized payload lands in the freed block.
        store.put(Element::new("k2", vec![2u8; 100])).unwrap();
        wait_for_spool(&store);
        assert_eq!(store.data_file_size(), len_after_first);
    }

    #[test]
    fn test_rewrites_of_same_key_do_not_grow_file() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("rewrites"), dir.path()).unwrap();

        for round in 0..100u8 {
            store.put(Element::new("k", vec![round; 100])).unwrap();
            wait_for_spool(&store);
        }
        let element = store.get("k").unwrap().unwrap();
        assert_eq!(element.serialized_size() as u64, store.data_file_size());
    }

    #[test]
    fn test_keys_and_size_cover_spool_and_index() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("keys"), dir.path()).unwrap();

        store.put(Element::new("a", "1")).unwrap();
        wait_for_spool(&store);
        store.put(Element::new("b", "2")).unwrap();

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.size().unwrap(), 2);
    }

    #[test]
    fn test_remove_all() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("clear"), dir.path()).unwrap();

        store.put(Element::new("a", "1")).unwrap();
        wait_for_spool(&store);
        store.remove_all().unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert_eq!(store.data_file_size(), 0);
        assert_eq!(store.used_data_size().unwrap(), 0);
    }

    #[test]
    fn test_persistent_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut s = settings("persist");
        s.disk_persistent = true;

        let store = DiskStore::new(&s, dir.path()).unwrap();
        store.put(Element::new("k1", "v1")).unwrap();
        store.put(Element::new("k2", "v2")).unwrap();
        store.dispose().unwrap();

        let reopened = DiskStore::new(&s, dir.path()).unwrap();
        assert_eq!(reopened.get("k1").unwrap().unwrap().value(), Some(b"v1".as_ref()));
        assert_eq!(reopened.get("k2").unwrap().unwrap().value(), Some(b"v2".as_ref()));
    }

    #[test]
    fn test_persistent_round_trip_preserves_free_list() {
        let dir = TempDir::new().unwrap();
        let mut s = settings("freelist");
        s.disk_persistent = true;

        let store = DiskStore::new(&s, dir.path()).unwrap();
        store.put(Element::new("k1", vec![1u8; 100])).unwrap();
        store.put(Element::new("k2", vec![2u8; 100])).unwrap();
        wait_for_spool(&store);
        assert!(store.remove("k1").unwrap());
        store.dispose().unwrap();

        let reopened = DiskStore::new(&s, dir.path()).unwrap();
        let len_before = reopened.data_file_size();
        // The freed block survives the restart and gets reused.
        reopened.put(Element::new("k3", vec![3u8; 100])).unwrap();
        wait_for_spool(&reopened);
        assert_eq!(reopened.data_file_size(), len_before);
    }

    #[test]
    fn test_dirty_restart_discards_data() {
        let dir = TempDir::new().unwrap();
        let mut s = settings("dirty");
        s.disk_persistent = true;

        let store = DiskStore::new(&s, dir.path()).unwrap();
        store.put(Element::new("k1", "v1")).unwrap();
        wait_for_spool(&store);
        assert!(store.data_file_size() > 0);
        // Simulate a crash: the index is never written and dispose never
        // runs.
        std::mem::forget(store);

        let reopened = DiskStore::new(&s, dir.path()).unwrap();
        assert!(reopened.get("k1").unwrap().is_none());
        assert_eq!(reopened.data_file_size(), 0);
    }

    #[test]
    fn test_non_persistent_dispose_deletes_data_file() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("temp"), dir.path()).unwrap();
        let data_path = store.data_file_path().to_path_buf();

        store.put(Element::new("k1", "v1")).unwrap();
        wait_for_spool(&store);
        assert!(data_path.exists());
        store.dispose().unwrap();
        assert!(!data_path.exists());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("twice"), dir.path()).unwrap();
        store.dispose().unwrap();
        store.dispose().unwrap();
        assert!(matches!(store.put(Element::new("k", "v")), Err(CacheError::NotAlive { .. })));
    }

    #[test]
    fn test_expiry_worker_removes_expired_entries() {
        let dir = TempDir::new().unwrap();
        let s = CacheSettings {
            name: "expiring".to_string(),
            eternal: false,
            time_to_live_seconds: 1,
            overflow_to_disk: true,
            disk_expiry_thread_interval_seconds: 1,
            ..Default::default()
        };
        let store = DiskStore::new(&s, dir.path()).unwrap();
        assert!(store.expiry_thread_alive());

        store.put(Element::new("k1", "v1")).unwrap();
        wait_for_spool(&store);
        assert_eq!(store.size().unwrap(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.size().unwrap() > 0 {
            assert!(Instant::now() < deadline, "expiry worker never removed the entry");
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(store.get("k1").unwrap().is_none());
    }

    #[test]
    fn test_random_payloads_round_trip() {
        use rand::Rng;

        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("random"), dir.path()).unwrap();
        let mut rng = rand::thread_rng();

        let mut expected = Vec::new();
        for i in 0..20 {
            let len = rng.gen_range(1..4096);
            let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            store.put(Element::new(format!("k{i}"), payload.clone())).unwrap();
            expected.push((format!("k{i}"), payload));
        }
        wait_for_spool(&store);

        for (key, payload) in expected {
            let element = store.get(&key).unwrap().unwrap();
            assert_eq!(element.value(), Some(payload.as_slice()));
        }
    }

    #[test]
    fn test_sparseness_grows_with_reuse() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::new(&settings("sparse"), dir.path()).unwrap();

        store.put(Element::new("k", vec![0u8; 200])).unwrap();
        wait_for_spool(&store);
        assert_eq!(store.data_file_sparseness().unwrap(), 0.0);

        // Rewrite with a smaller payload: the old 200-byte block is reused
        // but only partially filled.
        store.put(Element::new("k", vec![0u8; 50])).unwrap();
        wait_for_spool(&store);
        let sparseness = store.data_file_sparseness().unwrap();
        assert!(sparseness > 0.0, "sparseness {sparseness} should be positive");
    }
}

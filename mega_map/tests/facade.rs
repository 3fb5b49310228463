//! Facade behavior driven through the map manager.

use std::sync::Arc;

use mega_map::{MegaMapError, MegaMapManager};
use tempfile::TempDir;
use tier_cache::{CacheManager, CacheManagerConfig};

fn facade_manager(dir: &TempDir) -> MegaMapManager {
    let cache_manager = Arc::new(
        CacheManager::new(CacheManagerConfig {
            disk_store_path: Some(dir.path().to_string_lossy().into_owned()),
            ..Default::default()
        })
        .unwrap(),
    );
    MegaMapManager::with_cache_manager(cache_manager)
}

#[test]
fn put_get_remove_round_trip() {
    let dir = TempDir::new().unwrap();
    let manager = facade_manager(&dir);
    let map = manager.create_mega_map("roundtrip", false, false).unwrap();

    map.put("alpha", "one").unwrap();
    map.put("beta", "two").unwrap();

    assert_eq!(map.get("alpha").unwrap(), Some(b"one".to_vec()));
    assert!(map.has_key("beta").unwrap());
    assert!(!map.has_key("gamma").unwrap());
    assert_eq!(map.get_keys().unwrap().len(), 2);

    map.remove("alpha").unwrap();
    assert!(!map.has_key("alpha").unwrap());
    assert_eq!(map.get("alpha").unwrap(), None);
}

#[test]
fn overwrite_is_visible_immediately() {
    let dir = TempDir::new().unwrap();
    let manager = facade_manager(&dir);
    let map = manager.create_mega_map("overwrite", false, false).unwrap();

    map.put("k", "first").unwrap();
    map.put("k", "second").unwrap();
    assert_eq!(map.get("k").unwrap(), Some(b"second".to_vec()));
}

#[test]
fn duplicate_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = facade_manager(&dir);
    manager.create_mega_map("my map", false, false).unwrap();

    let err = manager.create_mega_map("my map", false, false);
    assert!(matches!(err, Err(MegaMapError::AlreadyExists(_))));
    // Validation folds this spelling onto the same file prefix.
    let err = manager.create_mega_map("my+map", false, false);
    assert!(matches!(err, Err(MegaMapError::AlreadyExists(_))));
}

#[test]
fn over_long_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    let manager = facade_manager(&dir);
    let err = manager.create_mega_map(&"n".repeat(201), false, false);
    assert!(matches!(err, Err(MegaMapError::InvalidName(_))));
}

#[test]
fn persistent_map_reloads_values_and_keys() {
    let dir = TempDir::new().unwrap();
    {
        let manager = facade_manager(&dir);
        let map = manager.create_mega_map("persist", true, false).unwrap();
        map.put("k1", "v1").unwrap();
        map.put("k2", "v2").unwrap();
        // Writes applied out of order would break this: the last action for
        // the key wins.
        map.put("k1", "v1-final").unwrap();
        manager.shutdown();
    }

    let manager = facade_manager(&dir);
    let map = manager.create_mega_map("persist", true, false).unwrap();
    assert!(map.has_key("k1").unwrap());
    assert!(map.has_key("k2").unwrap());
    assert_eq!(map.get("k1").unwrap(), Some(b"v1-final".to_vec()));
    assert_eq!(map.get("k2").unwrap(), Some(b"v2".to_vec()));
}

#[test]
fn overwrite_old_discards_persisted_state() {
    let dir = TempDir::new().unwrap();
    {
        let manager = facade_manager(&dir);
        let map = manager.create_mega_map("stale", true, false).unwrap();
        map.put("k", "v").unwrap();
        manager.shutdown();
    }

    let manager = facade_manager(&dir);
    let map = manager.create_mega_map("stale", true, true).unwrap();
    assert!(!map.has_key("k").unwrap());
    assert_eq!(map.get("k").unwrap(), None);
}

#[test]
fn removed_map_stops_accepting_writes() {
    let dir = TempDir::new().unwrap();
    let manager = facade_manager(&dir);
    let map = manager.create_mega_map("finite", false, false).unwrap();
    map.put("k", "v").unwrap();

    manager.remove_mega_map("finite").unwrap();
    assert!(manager.get_mega_map("finite").is_none());
    assert!(matches!(map.put("k2", "v2"), Err(MegaMapError::ShutDown)));
    // Removing again is harmless.
    manager.remove_mega_map("finite").unwrap();
}

#[test]
fn multiple_maps_are_independent() {
    let dir = TempDir::new().unwrap();
    let manager = facade_manager(&dir);
    let first = manager.create_mega_map("first map!", true, true).unwrap();
    let second = manager.create_mega_map("second", false, false).unwrap();

    for i in 1..=4 {
        first.put(format!("{i}"), format!("yup{i}")).unwrap();
    }
    second.put("10", "mega10").unwrap();
    second.put("11", "mega11").unwrap();

    assert_eq!(first.get("4").unwrap(), Some(b"yup4".to_vec()));
    assert_eq!(second.get("11").unwrap(), Some(b"mega11".to_vec()));

    // Removing one map leaves the other fully usable.
    manager.remove_mega_map("first map!").unwrap();
    assert_eq!(second.get("10").unwrap(), Some(b"mega10".to_vec()));
}

#[test]
fn delete_persisted_map_requires_inactive() {
    let dir = TempDir::new().unwrap();
    let manager = facade_manager(&dir);
    let map = manager.create_mega_map("locked", true, false).unwrap();
    map.put("k", "v").unwrap();

    assert!(matches!(
        manager.delete_persisted_mega_map("locked", None),
        Err(MegaMapError::Active(_))
    ));

    manager.remove_mega_map("locked").unwrap();
    manager.delete_persisted_mega_map("locked", None).unwrap();
    assert!(!dir.path().join("locked.data").exists());
    assert!(!dir.path().join("locked.index").exists());
}

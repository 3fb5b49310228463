use std::env;
use std::path::PathBuf;

use crate::element::{now_ms, Element};

const MS_PER_SECOND: u64 = 1000;

/// Interval applied when a configuration leaves the disk expiry interval at
/// zero.
pub const DEFAULT_EXPIRY_THREAD_INTERVAL_SECONDS: u64 = 120;

/// A reserved name denoting the template settings applied to caches created
/// by name only.
pub const DEFAULT_CACHE_NAME: &str = "default";

/// Per-cache settings, as consumed from whatever configuration loader the
/// embedding application uses.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub name: String,
    /// Bound on the in-memory tier, in elements. Zero is allowed but means
    /// every put is immediately evicted.
    pub max_elements_in_memory: usize,
    /// Eternal caches ignore both expiry bounds.
    pub eternal: bool,
    /// Time-to-live since creation, in seconds. Zero disables the check.
    pub time_to_live_seconds: u64,
    /// Time-to-idle since last access, in seconds. Zero disables the check.
    pub time_to_idle_seconds: u64,
    pub overflow_to_disk: bool,
    pub disk_persistent: bool,
    /// How often the disk expiry worker wakes up. This is not a lifetime
    /// bound, just a scan interval.
    pub disk_expiry_thread_interval_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_CACHE_NAME.to_string(),
            max_elements_in_memory: 10_000,
            eternal: false,
            time_to_live_seconds: 0,
            time_to_idle_seconds: 0,
            overflow_to_disk: false,
            disk_persistent: false,
            disk_expiry_thread_interval_seconds: DEFAULT_EXPIRY_THREAD_INTERVAL_SECONDS,
        }
    }
}

impl CacheSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The effective expiry scan interval, with the zero value mapped to the
    /// default.
    pub fn expiry_thread_interval_seconds(&self) -> u64 {
        if self.disk_expiry_thread_interval_seconds == 0 {
            DEFAULT_EXPIRY_THREAD_INTERVAL_SECONDS
        } else {
            self.disk_expiry_thread_interval_seconds
        }
    }

    pub(crate) fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            eternal: self.eternal,
            time_to_live_seconds: self.time_to_live_seconds,
            time_to_idle_seconds: self.time_to_idle_seconds,
        }
    }
}

/// The TTL/TTI/eternal triple, shared by the cache and both stores so each
/// can run the expiry check without a back-reference to the cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ExpiryPolicy {
    pub eternal: bool,
    pub time_to_live_seconds: u64,
    pub time_to_idle_seconds: u64,
}

impl ExpiryPolicy {
    /// Whether the element has expired, checked against the wall clock.
    ///
    /// Idle age is measured from the next-to-last access so the read that is
    /// performing this check does not itself reset the idle clock.
    pub fn is_expired(&self, element: &Element) -> bool {
        if element.value().is_none() {
            return true;
        }
        if self.eternal {
            return false;
        }
        let now = now_ms();
        let age_lived = now.saturating_sub(element.creation_time());
        if self.time_to_live_seconds != 0 && age_lived > self.time_to_live_seconds * MS_PER_SECOND {
            return true;
        }
        let most_recent = element.creation_time().max(element.next_to_last_access_time());
        let age_idled = now.saturating_sub(most_recent);
        self.time_to_idle_seconds != 0 && age_idled > self.time_to_idle_seconds * MS_PER_SECOND
    }

    /// The absolute expiry instant recorded in the disk index when an element
    /// is committed to the data file.
    pub fn expiry_time(&self, element: &Element) -> u64 {
        if self.eternal {
            return u64::MAX;
        }
        let time_to_live = element.creation_time() + self.time_to_live_seconds * MS_PER_SECOND;
        let time_to_idle = element.last_access_time() + self.time_to_idle_seconds * MS_PER_SECOND;
        time_to_live.max(time_to_idle)
    }
}

/// Settings for a cache manager: the shared disk root plus the template and
/// pre-declared caches. Parsing a configuration file into this record is the
/// embedding application's business.
#[derive(Debug, Clone, Default)]
pub struct CacheManagerConfig {
    /// Directory for data and index files. Supports the `user.home`,
    /// `user.dir` and `system.tmpdir` tokens; unset falls back to the system
    /// temp directory.
    pub disk_store_path: Option<String>,
    pub default_cache: Option<CacheSettings>,
    pub caches: Vec<CacheSettings>,
}

/// Resolves a configured disk store path, translating the supported tokens to
/// the corresponding process environment values.
pub fn resolve_disk_store_path(path: Option<&str>) -> PathBuf {
    match path {
        None => env::temp_dir(),
        Some("user.home") => dirs::home_dir().unwrap_or_else(env::temp_dir),
        Some("user.dir") => env::current_dir().unwrap_or_else(|_| env::temp_dir()),
        Some("system.tmpdir") => env::temp_dir(),
        Some(other) => PathBuf::from(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_interval_zero_maps_to_default() {
        let mut settings = CacheSettings::new("c");
        settings.disk_expiry_thread_interval_seconds = 0;
        assert_eq!(settings.expiry_thread_interval_seconds(), DEFAULT_EXPIRY_THREAD_INTERVAL_SECONDS);

        settings.disk_expiry_thread_interval_seconds = 5;
        assert_eq!(settings.expiry_thread_interval_seconds(), 5);
    }

    #[test]
    fn test_eternal_never_expires() {
        let policy = ExpiryPolicy {
            eternal: true,
            time_to_live_seconds: 1,
            time_to_idle_seconds: 1,
        };
        let e = Element::new("k", "v");
        assert!(!policy.is_expired(&e));
        assert_eq!(policy.expiry_time(&e), u64::MAX);
    }

    #[test]
    fn test_ttl_expiry() {
        let policy = ExpiryPolicy {
            eternal: false,
            time_to_live_seconds: 1,
            time_to_idle_seconds: 0,
        };
        let e = Element::new("k", "v");
        assert!(!policy.is_expired(&e));

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(policy.is_expired(&e));
    }

    #[test]
    fn test_idle_expiry_uses_next_to_last_access() {
        let policy = ExpiryPolicy {
            eternal: false,
            time_to_live_seconds: 0,
            time_to_idle_seconds: 1,
        };
        let mut e = Element::new("k", "v");
        std::thread::sleep(std::time::Duration::from_millis(1100));

        // A single fresh access moves last_access_time but not the
        // next-to-last slot, so the element still reads as idle-expired.
        e.update_access_statistics();
        assert!(policy.is_expired(&e));
    }

    #[test]
    fn test_missing_value_is_expired() {
        let policy = ExpiryPolicy {
            eternal: true,
            time_to_live_seconds: 0,
            time_to_idle_seconds: 0,
        };
        let mut buf = Vec::new();
        Element::new("k", "v").serialize(&mut buf).unwrap();
        // Rewrite as a value-less element: version, flag 0, then the key.
        let mut tombstone = Vec::new();
        crate::serialization::write_u8(&mut tombstone, 1).unwrap();
        crate::serialization::write_u8(&mut tombstone, 0).unwrap();
        crate::serialization::write_bytes(&mut tombstone, b"k").unwrap();
        for _ in 0..4 {
            crate::serialization::write_u64(&mut tombstone, 0).unwrap();
        }
        let e = Element::deserialize(&mut std::io::Cursor::new(tombstone)).unwrap();
        assert!(policy.is_expired(&e));
    }

    #[test]
    fn test_resolve_path_tokens() {
        assert_eq!(resolve_disk_store_path(Some("system.tmpdir")), env::temp_dir());
        assert_eq!(resolve_disk_store_path(None), env::temp_dir());
        assert_eq!(resolve_disk_store_path(Some("/var/cache/app")), PathBuf::from("/var/cache/app"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolve_disk_store_path(Some("user.home")), home);
        }
    }
}

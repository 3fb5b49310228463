//! An embeddable key/value cache with a two-tier storage hierarchy: a
//! bounded in-memory tier that overflows to a single-file on-disk tier and
//! can optionally persist across process restarts.
//!
//! [`Cache`] composes a [`MemoryStore`] with an optional [`DiskStore`];
//! [`CacheManager`] owns the set of named caches and their shared disk
//! directory. Values put into a cache land in memory; when the memory tier
//! exceeds its capacity the least recently used element is handed to the
//! disk store's write spool. Lookups that hit disk are promoted back into
//! memory so recency ordering spans both tiers.

pub mod cache;
pub mod config;
pub mod disk;
pub mod element;
pub mod error;
pub mod manager;
pub mod memory;

mod serialization;

pub use cache::{Cache, Status};
pub use config::{CacheManagerConfig, CacheSettings, DEFAULT_CACHE_NAME};
pub use element::Element;
pub use error::{CacheError, Result};
pub use manager::CacheManager;

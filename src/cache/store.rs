//! External store and platform-cache interfaces.

use crate::core::error::CacheResult;
use crate::entry::value::{CacheValue, EntryKey};
use crate::entry::version::Version;
use crate::ops::dr::TopologyVersion;

/// External read-through/write-through store.
///
/// Calls on the atomic path happen inside the entry's critical section; the
/// implementation must never re-enter the cache for the same key.
pub trait CacheStore: Send + Sync {
    /// Load the value for a key.
    fn load(&self, key: &EntryKey) -> CacheResult<Option<CacheValue>>;

    /// Persist a value.
    fn put(&self, key: &EntryKey, value: &CacheValue, version: Version) -> CacheResult<()>;

    /// Remove a key.
    fn remove(&self, key: &EntryKey) -> CacheResult<()>;
}

/// Optional client-visible mirror of entry values on the hosting platform.
///
/// Pushes happen best-effort after lock release; failures are logged and
/// never affect the cache state.
pub trait PlatformCacheSink: Send + Sync {
    /// Push the latest value bytes for a key; `None` removes the mirror
    /// entry.
    fn update(
        &self,
        cache_id: u32,
        key: &EntryKey,
        value: Option<&CacheValue>,
        partition: u32,
        topology: Option<TopologyVersion>,
    );
}

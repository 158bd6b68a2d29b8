//! Row store: the physical `(key → value, version, expireTime, link)` record
//! layer.
//!
//! The store arbitrates concurrent access with per-partition latches. All
//! mutations go through [`RowStore::invoke`]: the closure observes the
//! current row under the latch and decides the physical operation. Two rows
//! with the same `link` represent an in-place update.

use crate::core::error::CacheResult;
use crate::entry::value::{CacheValue, EntryKey};
use crate::entry::version::Version;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// A physical row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// The key.
    pub key: EntryKey,

    /// The value.
    pub value: CacheValue,

    /// Version of the write that produced this row.
    pub version: Version,

    /// Absolute expire time; 0 means eternal.
    pub expire_time: u64,

    /// Opaque physical pointer. Equal links mean the update happened in
    /// place.
    pub link: u64,
}

/// Physical operation produced by an invoke closure.
#[derive(Debug, Clone)]
pub enum RowOp {
    /// Leave the row untouched.
    Noop,
    /// Write a new row.
    Put(Row),
    /// Rewrite the existing row in place (same link).
    InPlace(Row),
    /// Remove the row.
    Remove,
}

/// Closure invoked under the row latch.
pub trait InvokeClosure {
    /// Observe the current row (or `None`) and decide the physical
    /// operation. The latch is held for the whole call.
    fn call(&mut self, old_row: Option<&Row>) -> CacheResult<RowOp>;
}

/// The row store contract.
pub trait RowStore: Send + Sync {
    /// Read the current row for a key.
    fn read(&self, cache_id: u32, key: &EntryKey) -> Option<Row>;

    /// Run a closure under the row latch for `key` and apply its decision.
    fn invoke(
        &self,
        cache_id: u32,
        key: &EntryKey,
        partition: u32,
        closure: &mut dyn InvokeClosure,
    ) -> CacheResult<()>;

    /// Build a row for a pending write. When the new value fits the old
    /// row's slot the old link is reused, making the write in-place.
    fn create_row(
        &self,
        cache_id: u32,
        key: &EntryKey,
        value: CacheValue,
        version: Version,
        expire_time: u64,
        old_row: Option<&Row>,
    ) -> Row;
}

/// Unconditionally write a row (used by non-atomic value installs).
pub fn store_row(
    store: &dyn RowStore,
    cache_id: u32,
    key: &EntryKey,
    value: CacheValue,
    version: Version,
    expire_time: u64,
) -> CacheResult<()> {
    struct PutClosure<'a> {
        store: &'a dyn RowStore,
        cache_id: u32,
        key: &'a EntryKey,
        value: Option<CacheValue>,
        version: Version,
        expire_time: u64,
    }

    impl InvokeClosure for PutClosure<'_> {
        fn call(&mut self, old_row: Option<&Row>) -> CacheResult<RowOp> {
            // The store invokes the closure exactly once; a drained slot
            // means there is nothing left to write.
            let Some(value) = self.value.take() else {
                return Ok(RowOp::Noop);
            };
            let row = self.store.create_row(
                self.cache_id,
                self.key,
                value,
                self.version,
                self.expire_time,
                old_row,
            );
            Ok(match old_row {
                Some(old) if old.link == row.link => RowOp::InPlace(row),
                _ => RowOp::Put(row),
            })
        }
    }

    let mut closure = PutClosure {
        store,
        cache_id,
        key,
        value: Some(value),
        version,
        expire_time,
    };
    store.invoke(cache_id, key, key.partition(), &mut closure)
}

/// Unconditionally remove a row (used by tombstoning paths).
pub fn remove_row(store: &dyn RowStore, cache_id: u32, key: &EntryKey) -> CacheResult<()> {
    struct RemoveClosure;

    impl InvokeClosure for RemoveClosure {
        fn call(&mut self, old_row: Option<&Row>) -> CacheResult<RowOp> {
            Ok(match old_row {
                Some(_) => RowOp::Remove,
                None => RowOp::Noop,
            })
        }
    }

    store.invoke(cache_id, key, key.partition(), &mut RemoveClosure)
}

/// In-memory row store with per-partition latches.
pub struct MemoryRowStore {
    partitions: Vec<Mutex<HashMap<(u32, Bytes), Row>>>,
    link_seq: AtomicU64,
}

impl MemoryRowStore {
    /// Create a store with the given partition count.
    pub fn new(partitions: u32) -> Self {
        let partitions = partitions.max(1) as usize;
        Self {
            partitions: (0..partitions).map(|_| Mutex::new(HashMap::new())).collect(),
            link_seq: AtomicU64::new(1),
        }
    }

    fn latch(&self, partition: u32) -> &Mutex<HashMap<(u32, Bytes), Row>> {
        &self.partitions[(partition as usize) % self.partitions.len()]
    }

    fn next_link(&self) -> u64 {
        self.link_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Total number of rows across all partitions.
    pub fn row_count(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }
}

impl RowStore for MemoryRowStore {
    fn read(&self, cache_id: u32, key: &EntryKey) -> Option<Row> {
        let map = self.latch(key.partition()).lock();
        map.get(&(cache_id, key.as_bytes().clone())).cloned()
    }

    fn invoke(
        &self,
        cache_id: u32,
        key: &EntryKey,
        partition: u32,
        closure: &mut dyn InvokeClosure,
    ) -> CacheResult<()> {
        let mut map = self.latch(partition).lock();
        let map_key = (cache_id, key.as_bytes().clone());
        let old_row = map.get(&map_key).cloned();

        match closure.call(old_row.as_ref())? {
            RowOp::Noop => {}
            RowOp::Put(row) | RowOp::InPlace(row) => {
                map.insert(map_key, row);
            }
            RowOp::Remove => {
                map.remove(&map_key);
            }
        }

        Ok(())
    }

    fn create_row(
        &self,
        _cache_id: u32,
        key: &EntryKey,
        value: CacheValue,
        version: Version,
        expire_time: u64,
        old_row: Option<&Row>,
    ) -> Row {
        let link = match old_row {
            Some(old) if old.value.len() == value.len() => old.link,
            _ => self.next_link(),
        };

        Row {
            key: key.clone(),
            value,
            version,
            expire_time,
            link,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(bytes: &[u8]) -> EntryKey {
        EntryKey::new(Bytes::copy_from_slice(bytes), 0)
    }

    fn ver(order: u64) -> Version {
        Version::new(1, order, 1, 0)
    }

    #[test]
    fn store_and_read_round_trip() {
        let store = MemoryRowStore::new(4);
        let k = key(b"alpha");

        store_row(&store, 1, &k, CacheValue::from(&b"v1"[..]), ver(1), 0).unwrap();
        let row = store.read(1, &k).unwrap();
        assert_eq!(row.value, CacheValue::from(&b"v1"[..]));
        assert_eq!(row.version, ver(1));

        remove_row(&store, 1, &k).unwrap();
        assert!(store.read(1, &k).is_none());
        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn same_size_update_reuses_link() {
        let store = MemoryRowStore::new(4);
        let k = key(b"alpha");

        store_row(&store, 1, &k, CacheValue::from(&b"aa"[..]), ver(1), 0).unwrap();
        let first = store.read(1, &k).unwrap();

        store_row(&store, 1, &k, CacheValue::from(&b"bb"[..]), ver(2), 0).unwrap();
        let second = store.read(1, &k).unwrap();
        assert_eq!(first.link, second.link);

        store_row(&store, 1, &k, CacheValue::from(&b"ccc"[..]), ver(3), 0).unwrap();
        let third = store.read(1, &k).unwrap();
        assert_ne!(second.link, third.link);
    }

    #[test]
    fn caches_are_isolated() {
        let store = MemoryRowStore::new(2);
        let k = key(b"shared");

        store_row(&store, 1, &k, CacheValue::from(&b"one"[..]), ver(1), 0).unwrap();
        assert!(store.read(2, &k).is_none());
    }

    #[test]
    fn closure_observes_current_row() {
        struct Checker {
            saw_value: Option<CacheValue>,
        }
        impl InvokeClosure for Checker {
            fn call(&mut self, old_row: Option<&Row>) -> CacheResult<RowOp> {
                self.saw_value = old_row.map(|r| r.value.clone());
                Ok(RowOp::Noop)
            }
        }

        let store = MemoryRowStore::new(2);
        let k = key(b"k");
        store_row(&store, 1, &k, CacheValue::from(&b"seen"[..]), ver(1), 0).unwrap();

        let mut checker = Checker { saw_value: None };
        store.invoke(1, &k, k.partition(), &mut checker).unwrap();
        assert_eq!(checker.saw_value, Some(CacheValue::from(&b"seen"[..])));
    }
}

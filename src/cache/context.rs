//! Per-cache context handle.
//!
//! Every entry operation receives an explicit `&CacheContext` carrying the
//! cache's capabilities and collaborators. The entry itself keeps only its
//! back-reference identifiers (cache id, partition id); nothing inside the
//! engine reaches for globals.

use crate::cache::deferred::DeferredDeleteQueue;
use crate::cache::events::{DumpChangeListener, EventManager, ListenerRegistry};
use crate::cache::interceptor::CacheInterceptor;
use crate::cache::store::{CacheStore, PlatformCacheSink};
use crate::core::config::Config;
use crate::core::time::TimeSource;
use crate::entry::mvcc::MvccList;
use crate::entry::version::{Version, VersionSource};
use crate::ops::dr::{ConflictResolver, DrReplicator, TopologyVersion};
use crate::storage::row::RowStore;
use crate::storage::wal::Wal;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Tier and tombstoning capabilities of a cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheCapabilities {
    /// Entries belong to a client-side near cache.
    pub is_near: bool,

    /// Entries belong to the DHT primary/backup tier.
    pub is_dht: bool,

    /// Removes tombstone entries and defer obsolete-marking to an external
    /// queue.
    pub deferred_delete: bool,

    /// DHT entries track reader nodes.
    pub track_readers: bool,
}

/// Transaction handle presented to the transactional entry paths.
///
/// The transaction manager itself is external; the entry only verifies lock
/// ownership and stamps WAL records with the transaction id.
#[derive(Debug, Clone)]
pub struct TxContext {
    /// Transaction lock version (xid).
    pub xid: Version,

    /// Write version assigned at commit.
    pub write_version: Version,

    /// Node the transaction originated on.
    pub originating_node_id: u64,

    /// Whether the transaction is local to this node.
    pub local: bool,

    /// Whether this is a one-phase-commit primary applying on behalf of
    /// its coordinator.
    pub one_phase_commit: bool,

    /// Topology the transaction runs under.
    pub topology: TopologyVersion,
}

impl TxContext {
    /// Check whether the transaction holds the entry's lock.
    pub fn owns_lock(&self, mvcc: Option<&MvccList>) -> bool {
        mvcc.is_some_and(|m| m.is_owned_by(&self.xid))
    }

    /// Check whether the transaction may mutate without holding the lock.
    pub fn applies_without_lock(&self) -> bool {
        !self.local && self.one_phase_commit
    }
}

/// Per-cache context: capabilities, collaborators, counters.
pub struct CacheContext {
    cache_id: u32,
    name: String,
    partitions: u32,
    caps: CacheCapabilities,

    read_through: bool,
    write_through: bool,
    load_previous_value: bool,
    log_data_records: bool,
    disable_interceptor_on_conflict: bool,
    entry_lock_timeout: Duration,

    local_node_id: u64,

    time: Arc<dyn TimeSource>,
    versions: VersionSource,
    row_store: Arc<dyn RowStore>,

    wal: Option<Arc<dyn Wal>>,
    store: Option<Arc<dyn CacheStore>>,
    interceptor: Option<Arc<dyn CacheInterceptor>>,
    conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    dr: Option<Arc<dyn DrReplicator>>,
    platform: Option<Arc<dyn PlatformCacheSink>>,
    deferred_queue: Option<Arc<dyn DeferredDeleteQueue>>,
    dump_listener: Option<Arc<dyn DumpChangeListener>>,

    events: EventManager,
    listeners: RwLock<ListenerRegistry>,

    update_counters: Vec<AtomicU64>,
    stopping: AtomicBool,
}

impl CacheContext {
    /// Build a context from configuration with the mandatory collaborators.
    pub fn new(
        config: &Config,
        caps: CacheCapabilities,
        local_node_id: u64,
        data_center_id: u8,
        time: Arc<dyn TimeSource>,
        row_store: Arc<dyn RowStore>,
    ) -> Self {
        let partitions = config.cache.partitions;
        let caps = CacheCapabilities {
            deferred_delete: caps.deferred_delete || config.cache.deferred_delete,
            ..caps
        };
        Self {
            cache_id: config.cache.cache_id,
            name: config.cache.name.clone(),
            partitions,
            caps,
            read_through: config.cache.read_through,
            write_through: config.cache.write_through,
            load_previous_value: config.cache.load_previous_value,
            log_data_records: config.wal.log_data_records,
            disable_interceptor_on_conflict: config.cache.disable_interceptor_on_conflict,
            entry_lock_timeout: Duration::from_millis(config.entry.lock_timeout_ms),
            local_node_id,
            time,
            versions: VersionSource::new(local_node_id as u32, data_center_id),
            row_store,
            wal: None,
            store: None,
            interceptor: None,
            conflict_resolver: None,
            dr: None,
            platform: None,
            deferred_queue: None,
            dump_listener: None,
            events: EventManager::new(),
            listeners: RwLock::new(ListenerRegistry::new()),
            update_counters: (0..partitions.max(1)).map(|_| AtomicU64::new(0)).collect(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Attach a WAL.
    pub fn with_wal(mut self, wal: Arc<dyn Wal>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Attach an external store.
    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Attach an interceptor.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CacheInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Attach a conflict resolver, enabling cross-datacenter resolution.
    pub fn with_conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.conflict_resolver = Some(resolver);
        self
    }

    /// Attach a DR replicator.
    pub fn with_dr(mut self, dr: Arc<dyn DrReplicator>) -> Self {
        self.dr = Some(dr);
        self
    }

    /// Attach a platform cache sink.
    pub fn with_platform(mut self, platform: Arc<dyn PlatformCacheSink>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Attach a deferred-delete queue.
    pub fn with_deferred_queue(mut self, queue: Arc<dyn DeferredDeleteQueue>) -> Self {
        self.deferred_queue = Some(queue);
        self
    }

    /// Attach a dump change listener.
    pub fn with_dump_listener(mut self, listener: Arc<dyn DumpChangeListener>) -> Self {
        self.dump_listener = Some(listener);
        self
    }

    /// Replace the event manager.
    pub fn with_events(mut self, events: EventManager) -> Self {
        self.events = events;
        self
    }

    /// Cache id.
    pub fn cache_id(&self) -> u32 {
        self.cache_id
    }

    /// Cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition count.
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Cache capabilities.
    pub fn caps(&self) -> CacheCapabilities {
        self.caps
    }

    /// Whether removes are deferred.
    pub fn deferred_delete(&self) -> bool {
        self.caps.deferred_delete
    }

    /// Whether read-through is enabled and a store is attached.
    pub fn read_through(&self) -> bool {
        self.read_through && self.store.is_some()
    }

    /// Whether write-through is enabled and a store is attached.
    pub fn write_through(&self) -> bool {
        self.write_through && self.store.is_some()
    }

    /// Whether the previous value is loaded before non-transform atomic
    /// updates.
    pub fn load_previous_value(&self) -> bool {
        self.load_previous_value
    }

    /// Whether interceptors are skipped on conflict-carrying updates.
    pub fn disable_interceptor_on_conflict(&self) -> bool {
        self.disable_interceptor_on_conflict
    }

    /// Diagnostic entry-lock timeout.
    pub fn entry_lock_timeout(&self) -> Duration {
        self.entry_lock_timeout
    }

    /// Local node id.
    pub fn local_node_id(&self) -> u64 {
        self.local_node_id
    }

    /// Current time in milliseconds.
    pub fn now_millis(&self) -> u64 {
        self.time.now_millis()
    }

    /// Generate the next version stamp.
    pub fn next_version(&self) -> Version {
        self.versions.next()
    }

    /// Generate a version for a store-loaded value.
    pub fn next_version_for_load(&self, current: &Version) -> Version {
        self.versions.next_for_load(current)
    }

    /// The version source.
    pub fn versions(&self) -> &VersionSource {
        &self.versions
    }

    /// The row store.
    pub fn row_store(&self) -> &dyn RowStore {
        self.row_store.as_ref()
    }

    /// The WAL, when entry updates are logged to it.
    pub fn data_record_wal(&self) -> Option<&dyn Wal> {
        if self.log_data_records {
            self.wal.as_deref()
        } else {
            None
        }
    }

    /// The external store, if attached.
    pub fn store(&self) -> Option<&dyn CacheStore> {
        self.store.as_deref()
    }

    /// The external store, when read-through is enabled.
    pub fn read_through_store(&self) -> Option<&dyn CacheStore> {
        if self.read_through {
            self.store.as_deref()
        } else {
            None
        }
    }

    /// The external store, when write-through is enabled.
    pub fn write_through_store(&self) -> Option<&dyn CacheStore> {
        if self.write_through {
            self.store.as_deref()
        } else {
            None
        }
    }

    /// The interceptor, if attached.
    pub fn interceptor(&self) -> Option<&dyn CacheInterceptor> {
        self.interceptor.as_deref()
    }

    /// The conflict resolver, if attached.
    pub fn conflict_resolver(&self) -> Option<&dyn ConflictResolver> {
        self.conflict_resolver.as_deref()
    }

    /// The DR replicator, if attached.
    pub fn dr(&self) -> Option<&dyn DrReplicator> {
        self.dr.as_deref()
    }

    /// The platform cache sink, if attached.
    pub fn platform(&self) -> Option<&dyn PlatformCacheSink> {
        self.platform.as_deref()
    }

    /// The deferred-delete queue, if attached.
    pub fn deferred_queue(&self) -> Option<&dyn DeferredDeleteQueue> {
        self.deferred_queue.as_deref()
    }

    /// The dump change listener, if attached.
    pub fn dump_listener(&self) -> Option<&dyn DumpChangeListener> {
        self.dump_listener.as_deref()
    }

    /// The event manager.
    pub fn events(&self) -> &EventManager {
        &self.events
    }

    /// Take the listener lock in read mode. Mutators hold this guard across
    /// the whole entry-locked section; the (listener, entry) acquisition
    /// order is part of the public contract.
    pub fn listener_read(&self) -> RwLockReadGuard<'_, ListenerRegistry> {
        self.listeners.read()
    }

    /// Take the listener lock in write mode for listener registration.
    pub fn listener_write(&self) -> RwLockWriteGuard<'_, ListenerRegistry> {
        self.listeners.write()
    }

    /// Assign the next partition update counter, or record an
    /// externally-assigned one (backup applying the primary's counter).
    pub fn next_partition_counter(&self, partition: u32, provided: Option<u64>) -> u64 {
        let slot = &self.update_counters[(partition as usize) % self.update_counters.len()];
        match provided {
            Some(counter) => {
                slot.fetch_max(counter, Ordering::SeqCst);
                counter
            }
            None => slot.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Current update counter of a partition.
    pub fn partition_counter(&self, partition: u32) -> u64 {
        self.update_counters[(partition as usize) % self.update_counters.len()]
            .load(Ordering::SeqCst)
    }

    /// Mark the node as stopping; expiration paths turn into logged no-ops.
    pub fn set_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Check whether the node is stopping.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::ManualClock;
    use crate::storage::row::MemoryRowStore;

    fn config() -> Config {
        Config::from_toml(
            r#"
[cache]
name = "ctx-test"
cache_id = 5
partitions = 4
"#,
        )
        .unwrap()
    }

    fn context() -> CacheContext {
        CacheContext::new(
            &config(),
            CacheCapabilities::default(),
            1,
            0,
            Arc::new(ManualClock::default()),
            Arc::new(MemoryRowStore::new(4)),
        )
    }

    #[test]
    fn partition_counters_are_independent() {
        let ctx = context();
        assert_eq!(ctx.next_partition_counter(0, None), 1);
        assert_eq!(ctx.next_partition_counter(0, None), 2);
        assert_eq!(ctx.next_partition_counter(1, None), 1);
    }

    #[test]
    fn provided_counter_advances_high_water() {
        let ctx = context();
        assert_eq!(ctx.next_partition_counter(0, Some(10)), 10);
        assert_eq!(ctx.next_partition_counter(0, None), 11);
    }

    #[test]
    fn through_flags_require_store() {
        let ctx = context();
        // Config enables nothing and no store is attached.
        assert!(!ctx.read_through());
        assert!(!ctx.write_through());
    }

    #[test]
    fn tx_ownership_checks_mvcc() {
        let xid = Version::new(1, 5, 1, 0);
        let tx = TxContext {
            xid,
            write_version: Version::new(1, 6, 1, 0),
            originating_node_id: 2,
            local: true,
            one_phase_commit: false,
            topology: TopologyVersion::initial(),
        };

        assert!(!tx.owns_lock(None));

        let mut mvcc = MvccList::new();
        mvcc.add_local(2, 7, xid, false);
        assert!(tx.owns_lock(Some(&mvcc)));
    }
}

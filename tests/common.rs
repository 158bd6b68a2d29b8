//! Common test utilities.
//!
//! This module contains shared helpers and recording fakes for integration
//! tests. Import with `mod common;` in test files.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use trellis::cache::context::{CacheCapabilities, CacheContext};
use trellis::cache::deferred::CollectingDeferredQueue;
use trellis::cache::events::{
    ContinuousQueryListener, EntryEvent, EventManager, EventSink, EventType,
};
use trellis::cache::store::CacheStore;
use trellis::core::config::Config;
use trellis::core::error::{CacheError, CacheResult};
use trellis::core::time::ManualClock;
use trellis::cache::interceptor::CacheInterceptor;
use trellis::entry::entry::{CacheEntry, RemoveArgs, SetArgs};
use trellis::entry::value::{CacheValue, EntryKey};
use trellis::entry::version::Version;
use trellis::ops::dr::{ConflictResolver, DrReplicator, DrType, TopologyVersion};
use trellis::storage::row::MemoryRowStore;
use trellis::storage::wal::FileWal;

/// Build an entry key on partition 0.
pub fn key(name: &str) -> EntryKey {
    EntryKey::new(Bytes::copy_from_slice(name.as_bytes()), 0)
}

/// Build a plain binary value.
pub fn val(data: &str) -> CacheValue {
    CacheValue::from(data.as_bytes())
}

/// Build a version in datacenter 1 with the given order.
pub fn ver(order: u64) -> Version {
    Version::new(1, order, 1, 1)
}

/// Build a version in an explicit datacenter.
pub fn ver_dc(order: u64, dc: u8) -> Version {
    Version::new(1, order, 1, dc)
}

/// Default transactional-path set arguments writing `value`.
pub fn set_args(value: CacheValue) -> SetArgs<'static> {
    SetArgs {
        tx: None,
        value,
        ttl: None,
        dr_expire_time: None,
        explicit_version: None,
        topology: TopologyVersion::initial(),
        dr_type: DrType::None,
        intercept: true,
        write_through: false,
        retval: true,
        evt: true,
        dht_version: None,
        update_counter: None,
        node_id: 1,
    }
}

/// Default transactional-path remove arguments.
pub fn remove_args() -> RemoveArgs<'static> {
    RemoveArgs {
        tx: None,
        explicit_version: None,
        topology: TopologyVersion::initial(),
        dr_type: DrType::None,
        intercept: true,
        write_through: false,
        retval: true,
        evt: true,
        dht_version: None,
        update_counter: None,
        node_id: 1,
    }
}

/// Event sink collecting every recorded event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EntryEvent>>,
}

impl RecordingSink {
    pub fn events_of(&self, event_type: EventType) -> Vec<EntryEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn count_of(&self, event_type: EventType) -> usize {
        self.events_of(event_type).len()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: EntryEvent) {
        self.events.lock().push(event);
    }
}

/// External store backed by a map, recording every call. An optional hook
/// runs during `load`, outside the entry lock, to simulate concurrent
/// writers.
#[derive(Default)]
pub struct MapStore {
    data: Mutex<HashMap<Bytes, CacheValue>>,
    puts: Mutex<Vec<(Bytes, CacheValue)>>,
    removes: Mutex<Vec<Bytes>>,
    loads: Mutex<Vec<Bytes>>,
    on_load: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    fail_loads: Mutex<bool>,
}

impl MapStore {
    pub fn seed(&self, key: &EntryKey, value: CacheValue) {
        self.data.lock().insert(key.as_bytes().clone(), value);
    }

    pub fn stored(&self, key: &EntryKey) -> Option<CacheValue> {
        self.data.lock().get(key.as_bytes()).cloned()
    }

    pub fn put_count(&self) -> usize {
        self.puts.lock().len()
    }

    pub fn remove_count(&self) -> usize {
        self.removes.lock().len()
    }

    pub fn load_count(&self) -> usize {
        self.loads.lock().len()
    }

    pub fn set_on_load(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_load.lock() = Some(Box::new(hook));
    }

    pub fn fail_next_loads(&self) {
        *self.fail_loads.lock() = true;
    }
}

impl CacheStore for MapStore {
    fn load(&self, key: &EntryKey) -> CacheResult<Option<CacheValue>> {
        if *self.fail_loads.lock() {
            return Err(CacheError::loader("injected load failure"));
        }
        if let Some(hook) = self.on_load.lock().take() {
            hook();
        }
        self.loads.lock().push(key.as_bytes().clone());
        Ok(self.data.lock().get(key.as_bytes()).cloned())
    }

    fn put(&self, key: &EntryKey, value: &CacheValue, _version: Version) -> CacheResult<()> {
        self.puts
            .lock()
            .push((key.as_bytes().clone(), value.clone()));
        self.data
            .lock()
            .insert(key.as_bytes().clone(), value.clone());
        Ok(())
    }

    fn remove(&self, key: &EntryKey) -> CacheResult<()> {
        self.removes.lock().push(key.as_bytes().clone());
        self.data.lock().remove(key.as_bytes());
        Ok(())
    }
}

/// DR replicator recording every offered mutation.
#[derive(Default)]
pub struct RecordingDr {
    replicated: Mutex<Vec<(Bytes, Option<CacheValue>, Version, DrType)>>,
}

impl RecordingDr {
    pub fn count(&self) -> usize {
        self.replicated.lock().len()
    }

    pub fn last(&self) -> Option<(Bytes, Option<CacheValue>, Version, DrType)> {
        self.replicated.lock().last().cloned()
    }
}

impl DrReplicator for RecordingDr {
    fn replicate(
        &self,
        key: &EntryKey,
        value: Option<&CacheValue>,
        _ttl: u64,
        _expire_time: u64,
        version: Version,
        dr_type: DrType,
        _topology: TopologyVersion,
    ) {
        self.replicated
            .lock()
            .push((key.as_bytes().clone(), value.cloned(), version, dr_type));
    }
}

/// Continuous-query listener recording notifications in order.
#[derive(Default)]
pub struct RecordingListener {
    updates: Mutex<Vec<(Bytes, Option<CacheValue>, Option<CacheValue>, u64)>>,
    expirations: Mutex<Vec<(Bytes, Option<CacheValue>)>>,
}

impl RecordingListener {
    pub fn updates(&self) -> Vec<(Bytes, Option<CacheValue>, Option<CacheValue>, u64)> {
        self.updates.lock().clone()
    }

    pub fn expirations(&self) -> Vec<(Bytes, Option<CacheValue>)> {
        self.expirations.lock().clone()
    }
}

impl ContinuousQueryListener for RecordingListener {
    fn on_entry_updated(
        &self,
        key: &EntryKey,
        new_value: Option<&CacheValue>,
        old_value: Option<&CacheValue>,
        _partition: u32,
        _primary: bool,
        update_counter: u64,
    ) {
        self.updates.lock().push((
            key.as_bytes().clone(),
            new_value.cloned(),
            old_value.cloned(),
            update_counter,
        ));
    }

    fn on_entry_expired(&self, key: &EntryKey, old_value: Option<&CacheValue>) {
        self.expirations
            .lock()
            .push((key.as_bytes().clone(), old_value.cloned()));
    }
}

/// A fully wired cache context with recording collaborators.
pub struct TestCache {
    pub ctx: CacheContext,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MapStore>,
    pub sink: Arc<RecordingSink>,
    pub queue: Arc<CollectingDeferredQueue>,
    pub dr: Arc<RecordingDr>,
    pub wal: Arc<FileWal>,
    _wal_dir: TempDir,
}

impl TestCache {
    /// Build from a full TOML configuration string.
    pub fn build(config_toml: &str) -> Self {
        Self::build_full(config_toml, CacheCapabilities::default(), None, None)
    }

    /// Build with explicit tier capabilities.
    pub fn build_with_caps(config_toml: &str, caps: CacheCapabilities) -> Self {
        Self::build_full(config_toml, caps, None, None)
    }

    /// Build with every optional collaborator spelled out.
    pub fn build_full(
        config_toml: &str,
        caps: CacheCapabilities,
        interceptor: Option<Arc<dyn CacheInterceptor>>,
        resolver: Option<Arc<dyn ConflictResolver>>,
    ) -> Self {
        let config = Config::from_toml(config_toml).expect("test config parses");

        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MapStore::default());
        let sink = Arc::new(RecordingSink::default());
        let queue = Arc::new(CollectingDeferredQueue::new());
        let dr = Arc::new(RecordingDr::default());

        let wal_dir = TempDir::new().expect("wal dir");
        let wal = Arc::new(FileWal::open(wal_dir.path()).expect("wal opens"));

        let events = EventManager::recording_all();
        events.add_sink(sink.clone());

        let mut ctx = CacheContext::new(
            &config,
            caps,
            1,
            1,
            clock.clone(),
            Arc::new(MemoryRowStore::new(config.cache.partitions)),
        )
        .with_wal(wal.clone())
        .with_store(store.clone())
        .with_deferred_queue(queue.clone())
        .with_dr(dr.clone())
        .with_events(events);

        if let Some(interceptor) = interceptor {
            ctx = ctx.with_interceptor(interceptor);
        }
        if let Some(resolver) = resolver {
            ctx = ctx.with_conflict_resolver(resolver);
        }

        Self {
            ctx,
            clock,
            store,
            sink,
            queue,
            dr,
            wal,
            _wal_dir: wal_dir,
        }
    }

    /// Build a plain atomic cache.
    pub fn plain() -> Self {
        Self::build(
            r#"
[cache]
name = "test"
cache_id = 1
partitions = 4
"#,
        )
    }

    /// Build a deferred-delete cache.
    pub fn deferred() -> Self {
        Self::build(
            r#"
[cache]
name = "test"
cache_id = 1
partitions = 4
deferred_delete = true
"#,
        )
    }

    /// Build a cache with read-through and write-through enabled.
    pub fn with_store_through() -> Self {
        Self::build(
            r#"
[cache]
name = "test"
cache_id = 1
partitions = 4
read_through = true
write_through = true
load_previous_value = true
"#,
        )
    }

    /// Create an entry for a key.
    pub fn entry(&self, name: &str) -> CacheEntry {
        CacheEntry::new(&self.ctx, key(name))
    }
}

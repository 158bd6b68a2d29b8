//! The per-key entry state machine.
//!
//! A [`CacheEntry`] owns one logical key's value, version, expiration state,
//! tombstone flags, and lock candidate list. Every operation takes the
//! entry's lock first and releases it last; mutators additionally hold the
//! per-cache listener lock in read mode for the whole locked section, in
//! that order. Side effects that must not run under the locks (DR
//! replication, interceptor after-hooks, deferred-delete enqueue, platform
//! pushes) are accumulated in a [`PostOps`] buffer and drained after
//! release.

use crate::cache::context::{CacheContext, TxContext};
use crate::cache::interceptor::{
    after_put_guarded, after_remove_guarded, before_put_guarded, before_remove_guarded, EntryView,
};
use crate::cache::events::{EntryEvent, EventType};
use crate::core::error::{CacheError, CacheResult};
use crate::core::time::{is_expired, to_expire_time, EXPIRE_TIME_ETERNAL, TTL_ETERNAL, TTL_MINIMUM};
use crate::entry::atomic::{
    AtomicUpdateArgs, AtomicUpdateClosure, AtomicUpdateResult, EntryOp, UpdateOutcome,
};
use crate::entry::expiry::{access_ttl, ExpiryPolicy};
use crate::entry::extras::ExtrasSlot;
use crate::entry::mvcc::MvccCandidate;
use crate::entry::value::{CacheValue, EntryKey};
use crate::entry::version::{atomic_version_cmp, EntryVersion, Version};
use crate::ops::dr::{DrType, TopologyVersion};
use crate::storage::row::{remove_row, store_row};
use crate::storage::wal::{DataRecord, RecordFlags, RecordOp, WalPointer};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::time::Duration;

bitflags! {
    /// Entry state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        /// Tombstoned in a deferred-delete cache.
        const DELETED = 0x01;
        /// The row store has been consulted at least once.
        const UNSWAPPED = 0x02;
        /// Eviction temporarily disabled (load reservation taken).
        const EVICT_DISABLED = 0x04;
    }
}

/// Tier-specific entry state.
#[derive(Debug, Clone)]
pub enum TierExtra {
    /// Plain entry with no tier state.
    None,
    /// DHT entry tracking reader nodes.
    Dht {
        /// Nodes holding a near copy of this entry.
        readers: Vec<u64>,
    },
    /// Near entry mirroring a DHT entry.
    Near {
        /// Last DHT version observed for this key.
        dht_version: Option<Version>,
        /// Topology epoch through which the entry is valid.
        valid_through: Option<TopologyVersion>,
    },
}

/// Mutable entry state, guarded by the entry lock.
pub(crate) struct EntryState {
    pub(crate) value: Option<CacheValue>,
    pub(crate) version: EntryVersion,
    pub(crate) extras: ExtrasSlot,
    pub(crate) flags: EntryFlags,
    pub(crate) tier: TierExtra,
}

impl EntryState {
    pub(crate) fn check_obsolete(&self) -> CacheResult<()> {
        if self.extras.obsolete_version().is_some() {
            return Err(CacheError::EntryRemoved);
        }
        Ok(())
    }

    pub(crate) fn is_start(&self) -> bool {
        self.version.is_start()
    }

    pub(crate) fn has_value(&self) -> bool {
        self.value.is_some()
    }

    pub(crate) fn deleted(&self) -> bool {
        self.flags.contains(EntryFlags::DELETED)
    }

    pub(crate) fn set_deleted(&mut self, deleted: bool) {
        if deleted {
            self.flags.insert(EntryFlags::DELETED);
        } else {
            self.flags.remove(EntryFlags::DELETED);
        }
    }

    pub(crate) fn evict_disabled(&self) -> bool {
        self.flags.contains(EntryFlags::EVICT_DISABLED)
    }

    pub(crate) fn ttl(&self) -> u64 {
        self.extras.ttl()
    }

    pub(crate) fn expire_time(&self) -> u64 {
        self.extras.expire_time()
    }

    /// Install value, TTL pair, and version; clears the eviction lockout.
    pub(crate) fn update(
        &mut self,
        value: Option<CacheValue>,
        expire_time: u64,
        ttl: u64,
        version: EntryVersion,
    ) {
        self.value = value;
        self.extras.set_ttl_and_expire_time(ttl, expire_time);
        self.version = version;
        self.flags.remove(EntryFlags::EVICT_DISABLED);
    }

    /// Set the terminal obsolete marker.
    ///
    /// Refused while eviction is disabled or while the lock candidate list
    /// holds claims other than `version`. Idempotent once set.
    pub(crate) fn mark_obsolete(&mut self, version: Version, clear: bool) -> bool {
        if self.evict_disabled() {
            return false;
        }

        if self.extras.obsolete_version().is_some() {
            return true;
        }

        let blocked = self
            .extras
            .mvcc()
            .is_some_and(|mvcc| !mvcc.is_empty_except(&version));
        if blocked {
            return false;
        }

        self.extras.set_obsolete_version(version);
        if clear {
            self.value = None;
        }
        true
    }

    fn record_dht_version(&mut self, incoming: Version) -> bool {
        if let TierExtra::Near { dht_version, .. } = &mut self.tier {
            match dht_version {
                Some(current) if atomic_version_cmp(&incoming, current) == CmpOrdering::Less => {
                    return false;
                }
                _ => *dht_version = Some(incoming),
            }
        }
        true
    }

    fn valid(&self, topology: TopologyVersion) -> bool {
        match &self.tier {
            TierExtra::Near { valid_through, .. } => {
                valid_through.is_none_or(|through| topology <= through)
            }
            _ => true,
        }
    }

    fn clear_readers(&mut self) {
        if let TierExtra::Dht { readers } = &mut self.tier {
            readers.clear();
        }
    }

    fn clear_reader(&mut self, node_id: u64) {
        if let TierExtra::Dht { readers } = &mut self.tier {
            readers.retain(|r| *r != node_id);
        }
    }
}

/// DR notification captured for post-lock replication.
pub(crate) struct DrNotify {
    pub value: Option<CacheValue>,
    pub ttl: u64,
    pub expire_time: u64,
    pub version: Version,
    pub dr_type: DrType,
    pub topology: TopologyVersion,
}

/// Side effects accumulated under the locks and drained after release.
#[derive(Default)]
pub(crate) struct PostOps {
    pub(crate) dr: Option<DrNotify>,
    pub(crate) store_put: Option<(CacheValue, Version)>,
    pub(crate) store_remove: bool,
    pub(crate) after_put: Option<EntryView>,
    pub(crate) after_remove: Option<EntryView>,
    pub(crate) platform: Option<(Option<CacheValue>, Option<TopologyVersion>)>,
    pub(crate) deferred: Option<Version>,
    pub(crate) expired_notify: Option<Option<CacheValue>>,
}

impl PostOps {
    pub(crate) fn run(self, ctx: &CacheContext, key: &EntryKey) -> CacheResult<()> {
        if let Some((value, version)) = self.store_put {
            if let Some(store) = ctx.store() {
                store.put(key, &value, version)?;
            }
        }
        if self.store_remove {
            if let Some(store) = ctx.store() {
                store.remove(key)?;
            }
        }

        if let Some(dr) = self.dr {
            if let Some(replicator) = ctx.dr() {
                if dr.dr_type.replicates() {
                    replicator.replicate(
                        key,
                        dr.value.as_ref(),
                        dr.ttl,
                        dr.expire_time,
                        dr.version,
                        dr.dr_type,
                        dr.topology,
                    );
                }
            }
        }

        if let Some(old_value) = self.expired_notify {
            let guard = ctx.listener_read();
            for listener in guard.all() {
                listener.on_entry_expired(key, old_value.as_ref());
            }
        }

        if let Some(view) = self.after_put {
            if let Some(interceptor) = ctx.interceptor() {
                after_put_guarded(interceptor, &view);
            }
        }
        if let Some(view) = self.after_remove {
            if let Some(interceptor) = ctx.interceptor() {
                after_remove_guarded(interceptor, &view);
            }
        }

        if let Some(version) = self.deferred {
            if let Some(queue) = ctx.deferred_queue() {
                queue.enqueue(key.clone(), version);
            }
        }

        if let Some((value, topology)) = self.platform {
            if let Some(platform) = ctx.platform() {
                platform.update(
                    ctx.cache_id(),
                    key,
                    value.as_ref(),
                    key.partition(),
                    topology,
                );
            }
        }

        Ok(())
    }
}

/// Arguments for [`CacheEntry::inner_get`].
pub struct GetArgs<'a> {
    /// Load the value from the external store when absent.
    pub read_through: bool,
    /// Emit a READ event.
    pub evt: bool,
    /// Apply the policy's access TTL to the read.
    pub expiry: Option<&'a dyn ExpiryPolicy>,
    /// Return the entry version alongside the value.
    pub need_version: bool,
    /// Topology the read runs under.
    pub topology: TopologyVersion,
}

impl Default for GetArgs<'_> {
    fn default() -> Self {
        Self {
            read_through: false,
            evt: true,
            expiry: None,
            need_version: false,
            topology: TopologyVersion::initial(),
        }
    }
}

/// Result of [`CacheEntry::inner_get`].
#[derive(Debug, Clone, Default)]
pub struct GetResult {
    /// The value, if found.
    pub value: Option<CacheValue>,
    /// The entry version, when requested.
    pub version: Option<Version>,
    /// Whether a value was found.
    pub found: bool,
}

/// Arguments for [`CacheEntry::inner_set`].
pub struct SetArgs<'a> {
    /// Owning transaction, if any.
    pub tx: Option<&'a TxContext>,
    /// Value to write.
    pub value: CacheValue,
    /// Explicit TTL; `None` keeps the entry's current TTL.
    pub ttl: Option<u64>,
    /// Explicit expire time carried by a DR update.
    pub dr_expire_time: Option<u64>,
    /// Explicit write version (DR replays); otherwise the transaction's
    /// write version or a fresh stamp.
    pub explicit_version: Option<Version>,
    /// Topology the write runs under.
    pub topology: TopologyVersion,
    /// DR participation of this write.
    pub dr_type: DrType,
    /// Run interceptor hooks.
    pub intercept: bool,
    /// Push the value to the external store (outside the entry lock).
    pub write_through: bool,
    /// Return the previous value.
    pub retval: bool,
    /// Emit a PUT event.
    pub evt: bool,
    /// DHT version observed by a near-cache write.
    pub dht_version: Option<Version>,
    /// Externally assigned partition update counter.
    pub update_counter: Option<u64>,
    /// Node the write originates from (for events).
    pub node_id: u64,
}

/// Arguments for [`CacheEntry::inner_remove`].
pub struct RemoveArgs<'a> {
    /// Owning transaction, if any.
    pub tx: Option<&'a TxContext>,
    /// Explicit removal version (DR replays).
    pub explicit_version: Option<Version>,
    /// Topology the removal runs under.
    pub topology: TopologyVersion,
    /// DR participation of this removal.
    pub dr_type: DrType,
    /// Run interceptor hooks.
    pub intercept: bool,
    /// Remove from the external store (outside the entry lock).
    pub write_through: bool,
    /// Return the previous value.
    pub retval: bool,
    /// Emit a REMOVED event.
    pub evt: bool,
    /// DHT version observed by a near-cache removal.
    pub dht_version: Option<Version>,
    /// Externally assigned partition update counter.
    pub update_counter: Option<u64>,
    /// Node the removal originates from (for events).
    pub node_id: u64,
}

/// Result of the transactional set/remove paths.
#[derive(Debug, Clone, Default)]
pub struct TxUpdateResult {
    /// Whether the entry state changed.
    pub updated: bool,
    /// Partition update counter assigned to the change.
    pub update_counter: Option<u64>,
    /// WAL pointer of the logged record, if logging is enabled.
    pub wal_pointer: Option<WalPointer>,
    /// Previous value, when requested.
    pub old_value: Option<CacheValue>,
}

/// A per-key cache entry.
pub struct CacheEntry {
    key: EntryKey,
    cache_id: u32,
    lock_timeout: Duration,
    state: Mutex<EntryState>,
}

impl CacheEntry {
    /// Create an entry at the start version.
    pub fn new(ctx: &CacheContext, key: EntryKey) -> Self {
        let tier = if ctx.caps().is_near {
            TierExtra::Near {
                dht_version: None,
                valid_through: None,
            }
        } else if ctx.caps().is_dht && ctx.caps().track_readers {
            TierExtra::Dht {
                readers: Vec::new(),
            }
        } else {
            TierExtra::None
        };

        Self {
            key,
            cache_id: ctx.cache_id(),
            lock_timeout: ctx.entry_lock_timeout(),
            state: Mutex::new(EntryState {
                value: None,
                version: EntryVersion::start(),
                extras: ExtrasSlot::new(),
                flags: EntryFlags::empty(),
                tier,
            }),
        }
    }

    /// The entry key.
    pub fn key(&self) -> &EntryKey {
        &self.key
    }

    /// The owning cache id.
    pub fn cache_id(&self) -> u32 {
        self.cache_id
    }

    /// The owning partition.
    pub fn partition(&self) -> u32 {
        self.key.partition()
    }

    /// Check whether the entry is at the start version.
    pub fn is_new(&self) -> CacheResult<bool> {
        let st = self.state.lock();
        st.check_obsolete()?;
        Ok(st.is_start())
    }

    /// Current version.
    pub fn version(&self) -> CacheResult<Version> {
        let st = self.state.lock();
        st.check_obsolete()?;
        Ok(st.version.stamp)
    }

    /// Current TTL.
    pub fn ttl(&self) -> CacheResult<u64> {
        let st = self.state.lock();
        st.check_obsolete()?;
        Ok(st.ttl())
    }

    /// Current expire time.
    pub fn expire_time(&self) -> CacheResult<u64> {
        let st = self.state.lock();
        st.check_obsolete()?;
        Ok(st.expire_time())
    }

    /// Check whether the entry currently holds a value.
    pub fn has_value(&self) -> bool {
        self.state.lock().has_value()
    }

    /// Raw value access with no expiry or obsolescence checks.
    pub fn raw_get(&self) -> Option<CacheValue> {
        self.state.lock().value.clone()
    }

    /// Check whether the entry is tombstoned in a deferred-delete cache.
    pub fn deleted(&self) -> bool {
        self.state.lock().deleted()
    }

    /// Check whether the entry is obsolete.
    pub fn obsolete(&self) -> bool {
        self.state.lock().extras.obsolete_version().is_some()
    }

    /// The obsolete marker version, if set.
    pub fn obsolete_version(&self) -> Option<Version> {
        self.state.lock().extras.obsolete_version()
    }

    /// Reader nodes of a DHT entry.
    pub fn readers(&self) -> Vec<u64> {
        match &self.state.lock().tier {
            TierExtra::Dht { readers } => readers.clone(),
            _ => Vec::new(),
        }
    }

    /// Register a reader node on a DHT entry.
    pub fn add_reader(&self, node_id: u64) -> CacheResult<()> {
        let mut st = self.state.lock();
        st.check_obsolete()?;
        if let TierExtra::Dht { readers } = &mut st.tier {
            if !readers.contains(&node_id) {
                readers.push(node_id);
            }
        }
        Ok(())
    }

    /// Bound the topology validity of a near entry.
    pub fn set_valid_through(&self, topology: TopologyVersion) {
        if let TierExtra::Near { valid_through, .. } = &mut self.state.lock().tier {
            *valid_through = Some(topology);
        }
    }

    // ------------------------------------------------------------------
    // Read paths
    // ------------------------------------------------------------------

    /// Read the entry's value.
    ///
    /// Handles lazy unswap from the row store, expiration, access TTL
    /// refresh, READ events, and optional read-through. A read-through
    /// releases the entry lock for the load and installs the loaded value
    /// only if the version is unchanged on re-acquire.
    pub fn inner_get(&self, ctx: &CacheContext, args: GetArgs<'_>) -> CacheResult<GetResult> {
        let read_through_store = if args.read_through {
            ctx.read_through_store()
        } else {
            None
        };

        let mut post = PostOps::default();
        let start_ver;
        let mut done: Option<GetResult> = None;
        let mut evt = args.evt;

        {
            let mut st = self.state.lock();
            st.check_obsolete()?;

            let mut val = None;

            if st.valid(args.topology) {
                if st.value.is_none()
                    && st.is_start()
                    && !st.flags.contains(EntryFlags::UNSWAPPED)
                {
                    self.unswap(ctx, &mut st);
                }

                val = st.value.clone();

                if let Some(current) = val.clone() {
                    if is_expired(st.expire_time(), ctx.now_millis()) {
                        self.on_expired(ctx, &mut st, current, None, &mut post)?;
                        val = None;
                    }
                }
            }

            if evt && ctx.events().is_recordable(EventType::Read) {
                ctx.events().record(EntryEvent {
                    event_type: EventType::Read,
                    cache_id: self.cache_id,
                    partition: self.partition(),
                    key: self.key.as_bytes().clone(),
                    node_id: ctx.local_node_id(),
                    version: Some(st.version.stamp),
                    new_value: val.clone(),
                    old_value: val.clone(),
                });
                evt = false;
            }

            if val.is_some() {
                if let Some(policy) = args.expiry {
                    self.update_ttl_locked(ctx, &mut st, policy)?;
                }
            }

            let version = args.need_version.then(|| match &st.tier {
                TierExtra::Near {
                    dht_version: Some(dht),
                    ..
                } => *dht,
                _ => st.version.stamp,
            });

            start_ver = st.version.stamp;

            if let Some(value) = val {
                done = Some(GetResult {
                    value: Some(value),
                    version,
                    found: true,
                });
            }
        }

        post.run(ctx, &self.key)?;

        if let Some(result) = done {
            return Ok(result);
        }

        let Some(store) = read_through_store else {
            return Ok(GetResult::default());
        };

        // Load outside the entry lock.
        let loaded = store.load(&self.key)?;

        let mut st = self.state.lock();
        st.check_obsolete()?;

        if start_ver == st.version.stamp {
            if let Some(value) = &loaded {
                let ttl = st.ttl();
                let next_ver = ctx.next_version();
                let expire = to_expire_time(ctx.now_millis(), ttl);

                store_row(
                    ctx.row_store(),
                    self.cache_id,
                    &self.key,
                    value.clone(),
                    next_ver,
                    expire,
                )?;

                st.update(Some(value.clone()), expire, ttl, EntryVersion::new(next_ver));

                if ctx.deferred_delete() && st.deleted() {
                    st.set_deleted(false);
                }
            }

            if evt && ctx.events().is_recordable(EventType::Read) {
                ctx.events().record(EntryEvent {
                    event_type: EventType::Read,
                    cache_id: self.cache_id,
                    partition: self.partition(),
                    key: self.key.as_bytes().clone(),
                    node_id: ctx.local_node_id(),
                    version: Some(st.version.stamp),
                    new_value: loaded.clone(),
                    old_value: None,
                });
            }
        }

        Ok(GetResult {
            found: loaded.is_some(),
            value: loaded,
            version: None,
        })
    }

    /// Lock-held read with expiration but without read-through.
    pub fn peek(
        &self,
        ctx: &CacheContext,
        expiry: Option<&dyn ExpiryPolicy>,
        topology: TopologyVersion,
    ) -> CacheResult<Option<CacheValue>> {
        let mut post = PostOps::default();
        let result;

        {
            let mut st = self.state.lock();
            st.check_obsolete()?;

            if !st.valid(topology) {
                return Ok(None);
            }

            if st.value.is_none() && st.is_start() && !st.flags.contains(EntryFlags::UNSWAPPED) {
                self.unswap(ctx, &mut st);
            }

            if is_expired(st.expire_time(), ctx.now_millis()) {
                remove_row(ctx.row_store(), self.cache_id, &self.key)?;
                if ctx.deferred_delete() {
                    post.deferred = Some(st.version.stamp);
                } else {
                    st.mark_obsolete(ctx.next_version(), true);
                }
                result = None;
            } else {
                let val = st.value.clone();
                if val.is_some() {
                    if let Some(policy) = expiry {
                        self.update_ttl_locked(ctx, &mut st, policy)?;
                    }
                }
                result = val;
            }
        }

        post.run(ctx, &self.key)?;
        Ok(result)
    }

    /// Reload the value from the external store.
    ///
    /// The load runs outside the entry lock; the loaded value is installed
    /// only if the version did not move while loading, and is returned to
    /// the caller either way.
    pub fn inner_reload(&self, ctx: &CacheContext) -> CacheResult<Option<CacheValue>> {
        let store = ctx
            .store()
            .ok_or_else(|| CacheError::loader("no store configured"))?;

        let (start_ver, was_new) = {
            let st = self.state.lock();
            st.check_obsolete()?;
            (st.version.stamp, st.is_start())
        };

        let loaded = store.load(&self.key)?;

        let mut st = self.state.lock();
        st.check_obsolete()?;

        // Entry was loaded during the read step.
        if was_new && !st.is_start() {
            return Ok(loaded);
        }

        if start_ver == st.version.stamp {
            let ttl = st.ttl();
            let next_ver = ctx.next_version_for_load(&st.version.stamp);
            let expire = to_expire_time(ctx.now_millis(), ttl);

            match &loaded {
                Some(value) => {
                    store_row(
                        ctx.row_store(),
                        self.cache_id,
                        &self.key,
                        value.clone(),
                        next_ver,
                        expire,
                    )?;
                    if ctx.deferred_delete() && st.deleted() {
                        st.set_deleted(false);
                    }
                    st.update(Some(value.clone()), expire, ttl, EntryVersion::new(next_ver));
                }
                None => {
                    remove_row(ctx.row_store(), self.cache_id, &self.key)?;
                    if ctx.deferred_delete() && !st.deleted() {
                        st.set_deleted(true);
                    }
                    st.update(
                        None,
                        EXPIRE_TIME_ETERNAL,
                        TTL_ETERNAL,
                        EntryVersion::new(next_ver),
                    );
                }
            }
        }

        // On version drift the loaded value is dropped, not installed.
        Ok(loaded)
    }

    // ------------------------------------------------------------------
    // Transactional paths
    // ------------------------------------------------------------------

    /// Transactional write.
    ///
    /// The transaction must hold this entry's lock (or be a one-phase-commit
    /// primary). Write-through runs outside the entry lock; the external
    /// commit protocol owns store ordering.
    pub fn inner_set(&self, ctx: &CacheContext, args: SetArgs<'_>) -> CacheResult<TxUpdateResult> {
        let listener_guard = ctx.listener_read();
        let mut st = self.state.lock();
        st.check_obsolete()?;

        let mut post = PostOps::default();

        if let Some(dht_ver) = args.dht_version {
            // A concurrent get may have installed a fresher DHT version.
            if !st.record_dht_version(dht_ver) {
                return Ok(TxUpdateResult::default());
            }
        }

        debug_assert!(
            args.tx
                .is_none_or(|tx| tx.applies_without_lock() || tx.owns_lock(st.extras.mvcc())),
            "transaction does not own lock for update"
        );

        let valid = st.valid(args.topology);
        let has_listeners = !listener_guard.is_empty();

        if st.is_start() && (args.retval || args.intercept || has_listeners) {
            self.unswap(ctx, &mut st);
        }

        let new_ver = args
            .explicit_version
            .or_else(|| args.tx.map(|tx| tx.write_version))
            .unwrap_or_else(|| ctx.next_version());

        let old = st.value.clone();
        let mut value = args.value;

        let interceptor = if args.intercept
            && !(args.explicit_version.is_some() && ctx.disable_interceptor_on_conflict())
        {
            ctx.interceptor()
        } else {
            None
        };

        if let Some(interceptor) = interceptor {
            match before_put_guarded(interceptor, old.as_ref(), &value) {
                None => return Ok(TxUpdateResult::default()),
                Some(substituted) => value = substituted,
            }
        }

        let (ttl, expire_time) = match args.dr_expire_time {
            Some(dr_expire) => (args.ttl.unwrap_or(TTL_MINIMUM), dr_expire),
            None => match args.ttl {
                None => (st.ttl(), st.expire_time()),
                Some(ttl) => (ttl, to_expire_time(ctx.now_millis(), ttl)),
            },
        };

        if let Some(dump) = ctx.dump_listener() {
            dump.before_change(
                self.cache_id,
                &self.key,
                old.as_ref(),
                st.expire_time(),
                st.version.stamp,
            );
        }

        store_row(
            ctx.row_store(),
            self.cache_id,
            &self.key,
            value.clone(),
            new_ver,
            expire_time,
        )?;

        if ctx.deferred_delete() && st.deleted() {
            st.set_deleted(false);
        }

        let counter = ctx.next_partition_counter(self.partition(), args.update_counter);

        let mut wal_pointer = None;
        if let Some(tx) = args.tx {
            if let Some(wal) = ctx.data_record_wal() {
                wal_pointer = Some(wal.append(&DataRecord {
                    cache_id: self.cache_id,
                    key: self.key.as_bytes().clone(),
                    value: Some(value.clone()),
                    op: if old.is_none() {
                        RecordOp::Create
                    } else {
                        RecordOp::Update
                    },
                    near_xid: Some(tx.xid),
                    write_version: new_ver,
                    expire_time: expire_time as i64,
                    partition: self.partition(),
                    update_counter: counter as i64,
                    flags: if tx.local {
                        RecordFlags::PRIMARY
                    } else {
                        RecordFlags::empty()
                    },
                })?);
            }
        }

        st.update(
            Some(value.clone()),
            expire_time,
            ttl,
            EntryVersion::new(new_ver),
        );

        if args.evt && ctx.events().is_recordable(EventType::Put) {
            ctx.events().record(EntryEvent {
                event_type: EventType::Put,
                cache_id: self.cache_id,
                partition: self.partition(),
                key: self.key.as_bytes().clone(),
                node_id: args.node_id,
                version: Some(new_ver),
                new_value: Some(value.clone()),
                old_value: old.clone(),
            });
        }

        let primary = args.tx.is_none_or(|tx| tx.local);
        for listener in listener_guard.all() {
            listener.on_entry_updated(
                &self.key,
                Some(&value),
                old.as_ref(),
                self.partition(),
                primary,
                counter,
            );
        }

        post.dr = Some(DrNotify {
            value: Some(value.clone()),
            ttl,
            expire_time,
            version: new_ver,
            dr_type: args.dr_type,
            topology: args.topology,
        });
        if args.write_through && ctx.write_through() {
            post.store_put = Some((value.clone(), new_ver));
        }
        if interceptor.is_some() {
            post.after_put = Some(EntryView {
                key: self.key.clone(),
                value: Some(value.clone()),
                update_counter: counter,
            });
        }
        post.platform = Some((Some(value), Some(args.topology)));

        drop(st);
        drop(listener_guard);

        tracing::debug!(key = ?self.key.as_bytes(), version = %new_ver, "entry updated");

        post.run(ctx, &self.key)?;

        Ok(TxUpdateResult {
            updated: valid,
            update_counter: Some(counter),
            wal_pointer,
            old_value: args.retval.then_some(old).flatten(),
        })
    }

    /// Transactional removal.
    ///
    /// Deferred-delete caches tombstone the entry and enqueue it; other
    /// caches mark it obsolete immediately when no foreign lock claims
    /// remain.
    pub fn inner_remove(
        &self,
        ctx: &CacheContext,
        args: RemoveArgs<'_>,
    ) -> CacheResult<TxUpdateResult> {
        let listener_guard = ctx.listener_read();
        let mut st = self.state.lock();
        st.check_obsolete()?;

        let mut post = PostOps::default();

        if let Some(dht_ver) = args.dht_version {
            if !st.record_dht_version(dht_ver) {
                return Ok(TxUpdateResult::default());
            }
        }

        debug_assert!(
            args.tx
                .is_none_or(|tx| tx.applies_without_lock() || tx.owns_lock(st.extras.mvcc())),
            "transaction does not own lock for remove"
        );

        let valid = st.valid(args.topology);
        let has_listeners = !listener_guard.is_empty();

        if st.is_start() && (args.retval || args.intercept || has_listeners) {
            self.unswap(ctx, &mut st);
        }

        let new_ver = args
            .explicit_version
            .or_else(|| args.tx.map(|tx| tx.write_version))
            .unwrap_or_else(|| ctx.next_version());

        let old = st.value.clone();
        let mut reported_old = old.clone();

        let interceptor = if args.intercept
            && !(args.explicit_version.is_some() && ctx.disable_interceptor_on_conflict())
        {
            ctx.interceptor()
        } else {
            None
        };

        if let Some(interceptor) = interceptor {
            let decision = before_remove_guarded(interceptor, old.as_ref());
            if decision.cancel {
                return Ok(TxUpdateResult::default());
            }
            if decision.override_value.is_some() {
                reported_old = decision.override_value;
            }
        }

        if let Some(dump) = ctx.dump_listener() {
            dump.before_change(
                self.cache_id,
                &self.key,
                old.as_ref(),
                st.expire_time(),
                st.version.stamp,
            );
        }

        remove_row(ctx.row_store(), self.cache_id, &self.key)?;

        st.update(
            None,
            EXPIRE_TIME_ETERNAL,
            TTL_ETERNAL,
            EntryVersion::new(new_ver),
        );

        if ctx.deferred_delete() && !st.deleted() {
            st.set_deleted(true);

            if let Some(tx) = args.tx {
                let only_own_claims = st
                    .extras
                    .mvcc()
                    .is_none_or(|m| m.is_empty_except(&tx.xid));
                if only_own_claims {
                    st.clear_readers();
                } else {
                    // Keep the originator's reader while it still has
                    // another active transaction on this entry.
                    let origin_still_active = st.extras.mvcc().is_some_and(|m| {
                        m.local_candidates(false).iter().any(|c| {
                            c.version != tx.xid
                                && c.other_node_id == Some(tx.originating_node_id)
                        })
                    });
                    if !origin_still_active {
                        st.clear_reader(tx.originating_node_id);
                    }
                }
            }
        }

        let counter = ctx.next_partition_counter(self.partition(), args.update_counter);

        let mut wal_pointer = None;
        if let Some(tx) = args.tx {
            if let Some(wal) = ctx.data_record_wal() {
                wal_pointer = Some(wal.append(&DataRecord {
                    cache_id: self.cache_id,
                    key: self.key.as_bytes().clone(),
                    value: None,
                    op: RecordOp::Delete,
                    near_xid: Some(tx.xid),
                    write_version: new_ver,
                    expire_time: 0,
                    partition: self.partition(),
                    update_counter: counter as i64,
                    flags: if tx.local {
                        RecordFlags::PRIMARY
                    } else {
                        RecordFlags::empty()
                    },
                })?);
            }
        }

        let obsolete_ver = match args.tx {
            None => Some(new_ver),
            Some(tx) => {
                if st.extras.mvcc().is_some_and(|m| m.is_owned_by(&tx.xid)) {
                    Some(tx.xid)
                } else {
                    tracing::debug!(key = ?self.key.as_bytes(), "obsolete version not set, lock is explicit");
                    None
                }
            }
        };

        if args.evt && ctx.events().is_recordable(EventType::Removed) {
            ctx.events().record(EntryEvent {
                event_type: EventType::Removed,
                cache_id: self.cache_id,
                partition: self.partition(),
                key: self.key.as_bytes().clone(),
                node_id: args.node_id,
                version: Some(new_ver),
                new_value: None,
                old_value: old.clone(),
            });
        }

        let primary = args.tx.is_none_or(|tx| tx.local);
        for listener in listener_guard.all() {
            listener.on_entry_updated(
                &self.key,
                None,
                old.as_ref(),
                self.partition(),
                primary,
                counter,
            );
        }

        if ctx.deferred_delete() {
            post.deferred = Some(st.version.stamp);
        } else if let Some(obsolete) = obsolete_ver {
            if !st.mark_obsolete(obsolete, true) {
                tracing::debug!(key = ?self.key.as_bytes(), "entry could not be marked obsolete, still in use");
            }
        }

        post.dr = Some(DrNotify {
            value: None,
            ttl: TTL_ETERNAL,
            expire_time: EXPIRE_TIME_ETERNAL,
            version: new_ver,
            dr_type: args.dr_type,
            topology: args.topology,
        });
        if args.write_through && ctx.write_through() {
            post.store_remove = true;
        }
        if interceptor.is_some() {
            post.after_remove = Some(EntryView {
                key: self.key.clone(),
                value: reported_old.clone(),
                update_counter: counter,
            });
        }
        post.platform = Some((None, None));

        drop(st);
        drop(listener_guard);

        post.run(ctx, &self.key)?;

        Ok(TxUpdateResult {
            updated: valid,
            update_counter: Some(counter),
            wal_pointer,
            old_value: args.retval.then_some(reported_old).flatten(),
        })
    }

    // ------------------------------------------------------------------
    // Atomic path
    // ------------------------------------------------------------------

    /// Single-pass atomic update under the row-store critical section.
    pub fn inner_update(
        &self,
        ctx: &CacheContext,
        args: AtomicUpdateArgs<'_>,
    ) -> CacheResult<AtomicUpdateResult> {
        let listener_guard = ctx.listener_read();
        let mut st = self.state.lock();
        st.check_obsolete()?;

        let mut post = PostOps::default();

        let mut closure =
            AtomicUpdateClosure::new(ctx, &self.key, self.cache_id, &mut st, &args, &mut post);

        ctx.row_store()
            .invoke(self.cache_id, &self.key, self.key.partition(), &mut closure)?;

        let final_op = closure.final_op();
        let attempted_value = closure.attempted_value();
        let was_intercepted = closure.was_intercepted();
        let mut result = closure.take_result()?;

        let rejected = match result.outcome {
            UpdateOutcome::VersionCheckFailed => {
                // Backup replica applying a stale primary update still has
                // to drive continuous queries with the attempted value.
                if !args.primary {
                    if let Some(counter) = args.update_counter {
                        for listener in listener_guard.all() {
                            listener.on_entry_updated(
                                &self.key,
                                attempted_value.as_ref(),
                                result.old_value.as_ref(),
                                self.partition(),
                                args.primary,
                                counter,
                            );
                        }
                    }
                }
                true
            }
            UpdateOutcome::ConflictUseOld
            | UpdateOutcome::FilterFailed
            | UpdateOutcome::InvokeNoOp
            | UpdateOutcome::InterceptorCancel => true,
            UpdateOutcome::Success | UpdateOutcome::RemoveNoVal => false,
        };

        if rejected {
            drop(st);
            drop(listener_guard);
            // Side effects collected before the rejection (an expired old
            // row) still have to run.
            post.run(ctx, &self.key)?;
            return Ok(result);
        }

        // A successful update leaves a value behind; a successful removal
        // leaves a downgraded delete op. Anything else is a broken closure.
        if final_op == EntryOp::Transform || (final_op == EntryOp::Update && st.value.is_none()) {
            drop(st);
            drop(listener_guard);
            post.run(ctx, &self.key)?;
            return Err(CacheError::storage(
                "atomic update left inconsistent entry state",
            ));
        }

        if args.evt
            && args.op == EntryOp::Transform
            && ctx.events().is_recordable(EventType::Read)
        {
            ctx.events().record(EntryEvent {
                event_type: EventType::Read,
                cache_id: self.cache_id,
                partition: self.partition(),
                key: self.key.as_bytes().clone(),
                node_id: args.node_id,
                version: Some(args.new_version),
                new_value: result.old_value.clone(),
                old_value: result.old_value.clone(),
            });
        }

        match final_op {
            EntryOp::Update => {
                if let Some(updated) = st.value.clone() {
                    post.dr = Some(DrNotify {
                        value: Some(updated.clone()),
                        ttl: st.ttl(),
                        expire_time: st.expire_time(),
                        version: st.version.conflict_version(),
                        dr_type: args.dr_type,
                        topology: args.topology,
                    });

                    if args.evt && ctx.events().is_recordable(EventType::Put) {
                        ctx.events().record(EntryEvent {
                            event_type: EventType::Put,
                            cache_id: self.cache_id,
                            partition: self.partition(),
                            key: self.key.as_bytes().clone(),
                            node_id: args.node_id,
                            version: Some(st.version.stamp),
                            new_value: Some(updated.clone()),
                            old_value: result.old_value.clone(),
                        });
                    }

                    post.platform = Some((Some(updated), Some(args.topology)));
                }
            }
            EntryOp::Delete => {
                st.clear_readers();

                post.dr = Some(DrNotify {
                    value: None,
                    ttl: TTL_ETERNAL,
                    expire_time: EXPIRE_TIME_ETERNAL,
                    version: st.version.conflict_version(),
                    dr_type: args.dr_type,
                    topology: args.topology,
                });

                if args.evt && ctx.events().is_recordable(EventType::Removed) {
                    ctx.events().record(EntryEvent {
                        event_type: EventType::Removed,
                        cache_id: self.cache_id,
                        partition: self.partition(),
                        key: self.key.as_bytes().clone(),
                        node_id: args.node_id,
                        version: Some(st.version.stamp),
                        new_value: None,
                        old_value: result.old_value.clone(),
                    });
                }

                if ctx.deferred_delete() {
                    post.deferred = result.enqueue_version;
                }

                post.platform = Some((None, None));
            }
            // Rejected above before any side effect was staged.
            EntryOp::Transform => {}
        }

        let new_value = (final_op == EntryOp::Update)
            .then(|| st.value.clone())
            .flatten();
        for listener in listener_guard.all() {
            listener.on_entry_updated(
                &self.key,
                new_value.as_ref(),
                result.old_value.as_ref(),
                self.partition(),
                args.primary,
                result.update_counter,
            );
        }

        if was_intercepted {
            let view = EntryView {
                key: self.key.clone(),
                value: if final_op == EntryOp::Update {
                    new_value.clone()
                } else {
                    result.old_value.clone()
                },
                update_counter: result.update_counter,
            };
            if final_op == EntryOp::Update {
                post.after_put = Some(view);
            } else {
                post.after_remove = Some(view);
            }
        }

        result.new_value = new_value;

        drop(st);
        drop(listener_guard);

        post.run(ctx, &self.key)?;

        Ok(result)
    }

    // ------------------------------------------------------------------
    // Expiration and obsolescence
    // ------------------------------------------------------------------

    /// Expire the entry if its time has come. Driven by the TTL tracker.
    ///
    /// Returns true if the entry was expired by this call.
    pub fn on_ttl_expired(
        &self,
        ctx: &CacheContext,
        obsolete_version: Version,
    ) -> CacheResult<bool> {
        let mut post = PostOps::default();
        let expired;

        {
            let mut st = self.state.lock();
            st.check_obsolete()?;

            if st.is_start() && !st.flags.contains(EntryFlags::UNSWAPPED) {
                self.unswap(ctx, &mut st);
            }

            if !is_expired(st.expire_time(), ctx.now_millis()) {
                return Ok(false);
            }

            let Some(expired_val) = st.value.clone() else {
                return Ok(false);
            };

            expired = match self.on_expired(ctx, &mut st, expired_val, Some(obsolete_version), &mut post)
            {
                Ok(removed) => removed,
                Err(CacheError::NodeStopping) => {
                    tracing::warn!("node is stopping while removing expired value");
                    false
                }
                Err(e) => return Err(e),
            };
        }

        post.run(ctx, &self.key)?;
        Ok(expired)
    }

    /// Expiration under the entry lock: tombstone or obsolete, remove the
    /// row, emit the EXPIRED event, queue listener notification.
    fn on_expired(
        &self,
        ctx: &CacheContext,
        st: &mut EntryState,
        expired_val: CacheValue,
        obsolete_version: Option<Version>,
        post: &mut PostOps,
    ) -> CacheResult<bool> {
        if st.extras.mvcc().is_some() {
            return Ok(false);
        }

        if ctx.is_stopping() {
            return Err(CacheError::NodeStopping);
        }

        if let Some(dump) = ctx.dump_listener() {
            dump.before_change(
                self.cache_id,
                &self.key,
                Some(&expired_val),
                st.expire_time(),
                st.version.stamp,
            );
        }

        let mut removed = false;

        if ctx.deferred_delete() {
            if !st.deleted() && !st.is_start() {
                let version = st.version;
                st.update(None, EXPIRE_TIME_ETERNAL, TTL_ETERNAL, version);
                st.set_deleted(true);
                post.deferred = Some(st.version.stamp);
                removed = true;
            }
        } else {
            let obsolete = obsolete_version.unwrap_or_else(|| ctx.next_version());
            if st.mark_obsolete(obsolete, true) {
                removed = true;
            }
        }

        tracing::trace!(key = ?self.key.as_bytes(), "entry expired");

        remove_row(ctx.row_store(), self.cache_id, &self.key)?;

        if ctx.events().is_recordable(EventType::Expired) {
            ctx.events().record(EntryEvent {
                event_type: EventType::Expired,
                cache_id: self.cache_id,
                partition: self.partition(),
                key: self.key.as_bytes().clone(),
                node_id: ctx.local_node_id(),
                version: Some(st.version.stamp),
                new_value: None,
                old_value: Some(expired_val.clone()),
            });
        }

        post.expired_notify = Some(Some(expired_val));
        post.platform = Some((None, None));

        Ok(removed)
    }

    /// Mark the entry obsolete, clearing its value.
    pub fn mark_obsolete(&self, ctx: &CacheContext, version: Version) -> bool {
        let _ = ctx;
        self.state.lock().mark_obsolete(version, true)
    }

    /// Mark obsolete only if the version enqueued at tombstone time still
    /// matches. Used by the deferred-delete queue consumer.
    pub fn mark_obsolete_version(&self, ctx: &CacheContext, version: Version) -> CacheResult<bool> {
        let mut removed_row = false;
        let marked;

        {
            let mut st = self.state.lock();
            if st.extras.obsolete_version().is_some() {
                return Ok(true);
            }
            if st.version.stamp != version {
                return Ok(false);
            }
            marked = st.mark_obsolete(version, true);
            if marked {
                removed_row = true;
            }
        }

        if removed_row {
            remove_row(ctx.row_store(), self.cache_id, &self.key)?;
        }

        Ok(marked)
    }

    /// Mark obsolete if the entry holds no value and no lock claims.
    pub fn mark_obsolete_if_empty(
        &self,
        ctx: &CacheContext,
        version: Option<Version>,
    ) -> CacheResult<bool> {
        let mut st = self.state.lock();
        st.check_obsolete()?;

        let empty =
            (st.is_start() || st.deleted()) && st.extras.mvcc().is_none() && !st.has_value();
        if !empty {
            return Ok(false);
        }

        let obsolete = version.unwrap_or_else(|| ctx.next_version());
        Ok(st.mark_obsolete(obsolete, true))
    }

    /// Clear the entry: obsolete-mark plus row removal. Refused while
    /// readers exist unless `readers` is set.
    pub fn clear(&self, ctx: &CacheContext, version: Version, readers: bool) -> CacheResult<bool> {
        {
            let mut st = self.state.lock();
            if st.extras.obsolete_version().is_some() {
                return Ok(false);
            }

            let has_readers = matches!(&st.tier, TierExtra::Dht { readers } if !readers.is_empty());
            if has_readers && !readers {
                tracing::debug!(key = ?self.key.as_bytes(), "entry not cleared, still has readers");
                return Ok(false);
            }

            if !st.mark_obsolete(version, true) {
                tracing::debug!(key = ?self.key.as_bytes(), "entry could not be marked obsolete, still in use");
                return Ok(false);
            }

            st.clear_readers();
        }

        remove_row(ctx.row_store(), self.cache_id, &self.key)?;
        Ok(true)
    }

    /// Clear the value and advance the version without tombstoning.
    pub fn invalidate(&self, ctx: &CacheContext, new_version: Version) -> CacheResult<bool> {
        let _ = ctx;
        let mut st = self.state.lock();
        st.value = None;
        st.version = EntryVersion::new(new_version);
        st.flags.remove(EntryFlags::EVICT_DISABLED);
        Ok(st.extras.obsolete_version().is_some())
    }

    /// Install an initial value from preloading or DR, only while the entry
    /// has never been written (or its current stamp loses to the incoming
    /// one under the atomic order).
    #[allow(clippy::too_many_arguments)]
    pub fn initial_value(
        &self,
        ctx: &CacheContext,
        value: CacheValue,
        version: Version,
        ttl: u64,
        expire_time: Option<u64>,
        preload: bool,
        dr_type: DrType,
        topology: TopologyVersion,
    ) -> CacheResult<bool> {
        let mut post = PostOps::default();
        let installed;

        {
            let mut st = self.state.lock();
            st.check_obsolete()?;

            let update = st.is_start()
                || (preload
                    && atomic_version_cmp(&st.version.stamp, &version) == CmpOrdering::Less);

            if update {
                let expire =
                    expire_time.unwrap_or_else(|| to_expire_time(ctx.now_millis(), ttl));

                store_row(
                    ctx.row_store(),
                    self.cache_id,
                    &self.key,
                    value.clone(),
                    version,
                    expire,
                )?;

                if let Some(wal) = ctx.data_record_wal() {
                    wal.append(&DataRecord {
                        cache_id: self.cache_id,
                        key: self.key.as_bytes().clone(),
                        value: Some(value.clone()),
                        op: RecordOp::Create,
                        near_xid: None,
                        write_version: version,
                        expire_time: expire as i64,
                        partition: self.partition(),
                        update_counter: ctx
                            .next_partition_counter(self.partition(), None)
                            as i64,
                        flags: if preload {
                            RecordFlags::PRELOAD
                        } else {
                            RecordFlags::FROM_STORE
                        },
                    })?;
                }

                if ctx.deferred_delete() && st.deleted() {
                    st.set_deleted(false);
                }

                st.update(Some(value.clone()), expire, ttl, EntryVersion::new(version));
                st.flags.insert(EntryFlags::UNSWAPPED);

                post.dr = Some(DrNotify {
                    value: Some(value),
                    ttl,
                    expire_time: expire,
                    version,
                    dr_type,
                    topology,
                });

                installed = true;
            } else {
                installed = false;
            }
        }

        post.run(ctx, &self.key)?;
        Ok(installed)
    }

    // ------------------------------------------------------------------
    // TTL management
    // ------------------------------------------------------------------

    /// Apply the policy's access TTL while holding the entry lock,
    /// persisting the new expire time through the row store.
    pub fn update_ttl(&self, ctx: &CacheContext, policy: &dyn ExpiryPolicy) -> CacheResult<()> {
        let mut st = self.state.lock();
        st.check_obsolete()?;

        if st.has_value() {
            self.update_ttl_locked(ctx, &mut st, policy)?;
        }
        Ok(())
    }

    fn update_ttl_locked(
        &self,
        ctx: &CacheContext,
        st: &mut EntryState,
        policy: &dyn ExpiryPolicy,
    ) -> CacheResult<()> {
        let Some((ttl, expire_time)) = access_ttl(policy, ctx.now_millis()) else {
            return Ok(());
        };

        if st.expire_time() == expire_time {
            return Ok(());
        }

        st.extras.set_ttl_and_expire_time(ttl, expire_time);

        if let Some(value) = st.value.clone() {
            store_row(
                ctx.row_store(),
                self.cache_id,
                &self.key,
                value,
                st.version.stamp,
                expire_time,
            )?;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Load reservations
    // ------------------------------------------------------------------

    /// Reserve the entry for an external load: reports the current state
    /// and disables eviction until the reservation is cleared.
    pub fn reserve_for_load(&self, ctx: &CacheContext) -> CacheResult<(Option<CacheValue>, Version, bool)> {
        let mut st = self.state.lock();
        st.check_obsolete()?;

        if st.value.is_none() && st.is_start() && !st.flags.contains(EntryFlags::UNSWAPPED) {
            self.unswap(ctx, &mut st);
        }

        let reserve = st.value.is_none() && !st.evict_disabled();
        if reserve {
            st.flags.insert(EntryFlags::EVICT_DISABLED);
        }

        Ok((st.value.clone(), st.version.stamp, reserve))
    }

    /// Release a load reservation.
    pub fn clear_reserve_for_load(&self) {
        self.state
            .lock()
            .flags
            .remove(EntryFlags::EVICT_DISABLED);
    }

    // ------------------------------------------------------------------
    // Lock candidates
    // ------------------------------------------------------------------

    /// Add a local lock candidate. Returns true when the candidate became
    /// the owner.
    pub fn add_local_lock(
        &self,
        ctx: &CacheContext,
        thread_id: u64,
        version: Version,
        near_local: bool,
    ) -> CacheResult<bool> {
        let (prev, cur);
        {
            let mut st = self.state.lock();
            st.check_obsolete()?;

            prev = st.extras.mvcc().and_then(|m| m.owner().cloned());
            st.extras
                .mvcc_mut()
                .add_local(ctx.local_node_id(), thread_id, version, near_local);
            cur = st.extras.mvcc().and_then(|m| m.owner().cloned());
        }

        self.check_owner_changed(ctx, prev.as_ref(), cur.as_ref());
        Ok(cur.is_some_and(|c| c.version == version))
    }

    /// Add a remote lock candidate.
    pub fn add_remote_lock(
        &self,
        ctx: &CacheContext,
        node_id: u64,
        thread_id: u64,
        version: Version,
        other_node_id: Option<u64>,
    ) -> CacheResult<()> {
        let (prev, cur);
        {
            let mut st = self.state.lock();
            st.check_obsolete()?;

            prev = st.extras.mvcc().and_then(|m| m.owner().cloned());
            st.extras
                .mvcc_mut()
                .add_remote(node_id, thread_id, version, other_node_id);
            cur = st.extras.mvcc().and_then(|m| m.owner().cloned());
        }

        self.check_owner_changed(ctx, prev.as_ref(), cur.as_ref());
        Ok(())
    }

    /// Remove the lock candidate claimed with `version`.
    pub fn remove_lock(&self, ctx: &CacheContext, version: Version) -> CacheResult<bool> {
        let (removed, prev, cur);
        {
            let mut st = self.state.lock();
            st.check_obsolete()?;

            prev = st.extras.mvcc().and_then(|m| m.owner().cloned());
            removed = st.extras.mvcc_mut().remove_version(&version);
            st.extras.release_mvcc();
            cur = st.extras.mvcc().and_then(|m| m.owner().cloned());
        }

        self.check_owner_changed(ctx, prev.as_ref(), cur.as_ref());
        Ok(removed)
    }

    /// Release a transaction's lock claim.
    pub fn tx_unlock(&self, ctx: &CacheContext, tx: &TxContext) -> CacheResult<bool> {
        self.remove_lock(ctx, tx.xid)
    }

    /// The current lock owner.
    pub fn lock_owner(&self) -> Option<MvccCandidate> {
        self.state
            .lock()
            .extras
            .mvcc()
            .and_then(|m| m.owner().cloned())
    }

    /// Check whether the entry is locked by the given version.
    pub fn is_locked_by(&self, version: Version) -> bool {
        self.state
            .lock()
            .extras
            .mvcc()
            .is_some_and(|m| m.is_owned_by(&version))
    }

    /// Check whether the entry is locked by a local thread.
    pub fn is_locally_locked_by_thread(&self, thread_id: u64) -> bool {
        self.state
            .lock()
            .extras
            .mvcc()
            .is_some_and(|m| m.is_locally_owned_by_thread(thread_id))
    }

    /// Emit LOCKED/UNLOCKED events for an ownership transition. Runs
    /// outside the entry lock.
    fn check_owner_changed(
        &self,
        ctx: &CacheContext,
        prev: Option<&MvccCandidate>,
        cur: Option<&MvccCandidate>,
    ) {
        if let Some(prev_owner) = prev {
            if cur.is_none() && ctx.events().is_recordable(EventType::Unlocked) {
                ctx.events().record(EntryEvent {
                    event_type: EventType::Unlocked,
                    cache_id: self.cache_id,
                    partition: self.partition(),
                    key: self.key.as_bytes().clone(),
                    node_id: prev_owner.node_id,
                    version: Some(prev_owner.version),
                    new_value: None,
                    old_value: None,
                });
            }
        }

        if let Some(cur_owner) = cur {
            let newly_locked = prev.is_none_or(|p| p.version != cur_owner.version);
            if newly_locked && ctx.events().is_recordable(EventType::Locked) {
                ctx.events().record(EntryEvent {
                    event_type: EventType::Locked,
                    cache_id: self.cache_id,
                    partition: self.partition(),
                    key: self.key.as_bytes().clone(),
                    node_id: cur_owner.node_id,
                    version: Some(cur_owner.version),
                    new_value: None,
                    old_value: None,
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Pull the row-store state into memory on first touch.
    fn unswap(&self, ctx: &CacheContext, st: &mut EntryState) {
        if let Some(row) = ctx.row_store().read(self.cache_id, &self.key) {
            let ttl = if row.expire_time == EXPIRE_TIME_ETERNAL {
                TTL_ETERNAL
            } else {
                row.expire_time
                    .saturating_sub(ctx.now_millis())
                    .max(TTL_MINIMUM)
            };
            st.update(
                Some(row.value),
                row.expire_time,
                ttl,
                EntryVersion::new(row.version),
            );
        }
        st.flags.insert(EntryFlags::UNSWAPPED);
    }
}

impl std::fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Diagnostic path: never block on a stuck entry.
        match self.state.try_lock_for(self.lock_timeout) {
            Some(st) => write!(
                f,
                "CacheEntry [key={:?}, ver={}, hasVal={}, deleted={}, obsolete={}]",
                self.key.as_bytes(),
                st.version,
                st.has_value(),
                st.deleted(),
                st.extras.obsolete_version().is_some()
            ),
            None => write!(
                f,
                "CacheEntry [err='lock wait timed out', key={:?}, hash={}]",
                self.key.as_bytes(),
                self.key.hash()
            ),
        }
    }
}

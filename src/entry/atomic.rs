//! Single-pass atomic update executed under the row-store critical section.
//!
//! [`AtomicUpdateClosure`] runs while the row store holds the per-row latch
//! and the entry lock is held. Everything the update decides happens inside
//! one closure invocation, in order: expiry of the old row, read-through,
//! entry-processor transform, conflict resolution, version check, filters,
//! interceptor, TTL computation, write-through, WAL append, and finally the
//! physical row operation.

use crate::cache::context::CacheContext;
use crate::cache::interceptor::{before_put_guarded, before_remove_guarded, CacheInterceptor};
use crate::cache::events::{EntryEvent, EventType};
use crate::cache::store::CacheStore;
use crate::core::error::{CacheError, CacheResult};
use crate::core::time::{is_expired, EXPIRE_TIME_ETERNAL, TTL_ETERNAL, TTL_MINIMUM};
use crate::entry::entry::{EntryFlags, EntryState, PostOps};
use crate::entry::expiry::{access_ttl, initial_ttl_and_expire_time, ttl_and_expire_time, ExpiryPolicy};
use crate::entry::value::{CacheValue, EntryKey};
use crate::entry::version::{atomic_version_cmp, EntryVersion, Version};
use crate::ops::dr::{
    ConflictContext, ConflictDecision, ConflictEntry, ConflictKind, ConflictResolver, DrType,
    TopologyVersion,
};
use crate::storage::row::{InvokeClosure, Row, RowOp};
use crate::storage::wal::{DataRecord, RecordFlags, RecordOp, WalPointer};
use bytes::Bytes;
use std::cmp::Ordering as CmpOrdering;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Logical operation requested of the atomic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOp {
    /// Write a value.
    Update,
    /// Remove the entry.
    Delete,
    /// Run an entry processor; downgraded to update or delete by its
    /// outcome.
    Transform,
}

/// Visible outcome of an atomic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The update was applied.
    Success,
    /// A removal found no value to remove.
    RemoveNoVal,
    /// The filter predicates rejected the update.
    FilterFailed,
    /// The version check rejected the write.
    VersionCheckFailed,
    /// The conflict resolver kept the existing state.
    ConflictUseOld,
    /// The entry processor made no modification.
    InvokeNoOp,
    /// The interceptor vetoed the write.
    InterceptorCancel,
}

impl UpdateOutcome {
    /// Check whether the entry state changed.
    pub fn success(self) -> bool {
        matches!(self, Self::Success | Self::RemoveNoVal)
    }
}

/// Computed result of an entry processor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeResult {
    /// Value computed by the processor, if any.
    pub value: Option<Bytes>,
    /// Captured processor failure. Never propagated as an error.
    pub error: Option<String>,
}

/// Entry processor failure modes.
#[derive(Debug, Clone)]
pub enum ProcessorError {
    /// The processor encountered a value type that is not registered; the
    /// operation is aborted so the caller can register it and retry.
    Unregistered {
        /// Offending type tag.
        type_tag: u8,
    },
    /// The processor failed; captured into the result.
    Failed(String),
}

/// Mutable view of an entry handed to an entry processor.
pub struct InvokeEntry<'a> {
    key: &'a EntryKey,
    value: Option<CacheValue>,
    modified: bool,
}

impl<'a> InvokeEntry<'a> {
    pub(crate) fn new(key: &'a EntryKey, value: Option<CacheValue>) -> Self {
        Self {
            key,
            value,
            modified: false,
        }
    }

    /// The key.
    pub fn key(&self) -> &EntryKey {
        self.key
    }

    /// The current value.
    pub fn value(&self) -> Option<&CacheValue> {
        self.value.as_ref()
    }

    /// Check whether a value exists.
    pub fn exists(&self) -> bool {
        self.value.is_some()
    }

    /// Replace the value.
    pub fn set_value(&mut self, value: CacheValue) {
        self.value = Some(value);
        self.modified = true;
    }

    /// Remove the value.
    pub fn remove(&mut self) {
        self.value = None;
        self.modified = true;
    }

    /// Whether the processor modified the entry.
    pub fn modified(&self) -> bool {
        self.modified
    }

    fn reset_modified(&mut self) {
        self.modified = false;
    }

    fn into_value(self) -> Option<CacheValue> {
        self.value
    }
}

/// User entry processor run by TRANSFORM updates.
pub trait EntryProcessor: Send + Sync {
    /// Process the entry; the optional return value is handed back to the
    /// caller in the [`InvokeResult`].
    fn process(&self, entry: &mut InvokeEntry<'_>) -> Result<Option<Bytes>, ProcessorError>;
}

/// Predicate evaluated atomically against the current value.
pub trait EntryFilter: Send + Sync {
    /// Check the predicate.
    fn apply(&self, value: Option<&CacheValue>) -> bool;

    /// Whether this is a put-if-absent style filter; failing such a filter
    /// skips the access-TTL refresh.
    fn is_put_if_absent(&self) -> bool {
        false
    }
}

/// Arguments of the atomic update path.
pub struct AtomicUpdateArgs<'a> {
    /// Version assigned to the write.
    pub new_version: Version,
    /// Node the update originates from.
    pub node_id: u64,
    /// Requested operation.
    pub op: EntryOp,
    /// Value for update operations.
    pub write_value: Option<CacheValue>,
    /// Entry processor for transform operations.
    pub processor: Option<&'a dyn EntryProcessor>,
    /// Push the result to the external store inside the critical section.
    pub write_through: bool,
    /// Load the previous value from the store when absent.
    pub read_through: bool,
    /// Return the previous value.
    pub retval: bool,
    /// Expiration policy.
    pub expiry: Option<&'a dyn ExpiryPolicy>,
    /// Emit events.
    pub evt: bool,
    /// Whether this node is primary for the key.
    pub primary: bool,
    /// Perform the atomic version check.
    pub ver_check: bool,
    /// Topology the update runs under.
    pub topology: TopologyVersion,
    /// Filter predicates; all must pass.
    pub filters: &'a [&'a dyn EntryFilter],
    /// DR participation.
    pub dr_type: DrType,
    /// Explicit TTL override.
    pub explicit_ttl: Option<u64>,
    /// Explicit expire time override.
    pub explicit_expire_time: Option<u64>,
    /// Conflict version carried by a DR update.
    pub conflict_version: Option<Version>,
    /// Run the conflict resolver.
    pub conflict_resolve: bool,
    /// Run interceptor hooks.
    pub intercept: bool,
    /// Externally assigned partition update counter.
    pub update_counter: Option<u64>,
}

impl<'a> AtomicUpdateArgs<'a> {
    fn base(op: EntryOp, new_version: Version) -> Self {
        Self {
            new_version,
            node_id: 0,
            op,
            write_value: None,
            processor: None,
            write_through: false,
            read_through: false,
            retval: false,
            expiry: None,
            evt: true,
            primary: true,
            ver_check: false,
            topology: TopologyVersion::initial(),
            filters: &[],
            dr_type: DrType::None,
            explicit_ttl: None,
            explicit_expire_time: None,
            conflict_version: None,
            conflict_resolve: false,
            intercept: true,
            update_counter: None,
        }
    }

    /// An update writing `value`.
    pub fn update(new_version: Version, value: CacheValue) -> Self {
        Self {
            write_value: Some(value),
            ..Self::base(EntryOp::Update, new_version)
        }
    }

    /// A removal.
    pub fn delete(new_version: Version) -> Self {
        Self::base(EntryOp::Delete, new_version)
    }

    /// A transform running `processor`.
    pub fn transform(new_version: Version, processor: &'a dyn EntryProcessor) -> Self {
        Self {
            processor: Some(processor),
            ..Self::base(EntryOp::Transform, new_version)
        }
    }
}

/// Result of the atomic update path.
#[derive(Debug, Clone)]
pub struct AtomicUpdateResult {
    /// Visible outcome.
    pub outcome: UpdateOutcome,
    /// Previous value (possibly overridden by the interceptor).
    pub old_value: Option<CacheValue>,
    /// New value, for successful updates.
    pub new_value: Option<CacheValue>,
    /// Captured entry-processor result.
    pub invoke_result: Option<InvokeResult>,
    /// TTL applied by the update.
    pub new_ttl: u64,
    /// Expire time applied by the update.
    pub new_expire_time: u64,
    /// Version to enqueue for deferred deletion, for removals.
    pub enqueue_version: Option<Version>,
    /// Conflict resolution outcome, if a resolver ran.
    pub conflict: Option<ConflictContext>,
    /// Partition update counter assigned to the change.
    pub update_counter: u64,
    /// Whether the change was caused by a transform.
    pub transformed: bool,
    /// WAL pointer of the logged record.
    pub wal_pointer: Option<WalPointer>,
}

impl AtomicUpdateResult {
    fn rejected(
        outcome: UpdateOutcome,
        old_value: Option<CacheValue>,
        invoke_result: Option<InvokeResult>,
        transformed: bool,
    ) -> Self {
        Self {
            outcome,
            old_value,
            new_value: None,
            invoke_result,
            new_ttl: TTL_ETERNAL,
            new_expire_time: EXPIRE_TIME_ETERNAL,
            enqueue_version: None,
            conflict: None,
            update_counter: 0,
            transformed,
            wal_pointer: None,
        }
    }
}

/// The atomic update closure (see module docs for the step order).
pub(crate) struct AtomicUpdateClosure<'a, 'b> {
    ctx: &'a CacheContext,
    key: &'a EntryKey,
    cache_id: u32,
    st: &'a mut EntryState,
    args: &'a AtomicUpdateArgs<'b>,
    post: &'a mut PostOps,

    op: EntryOp,
    write_value: Option<CacheValue>,
    conflict_version: Option<Version>,
    invoke_result: Option<InvokeResult>,
    invoke_modified: bool,
    transformed: bool,
    read_through_store: Option<&'a dyn CacheStore>,
    read_from_store: bool,
    intercepted: bool,
    result: Option<AtomicUpdateResult>,
}

impl<'a, 'b> AtomicUpdateClosure<'a, 'b> {
    pub(crate) fn new(
        ctx: &'a CacheContext,
        key: &'a EntryKey,
        cache_id: u32,
        st: &'a mut EntryState,
        args: &'a AtomicUpdateArgs<'b>,
        post: &'a mut PostOps,
    ) -> Self {
        let read_through_store = if args.read_through
            && (args.op == EntryOp::Transform || ctx.load_previous_value())
        {
            ctx.read_through_store()
        } else {
            None
        };

        Self {
            ctx,
            key,
            cache_id,
            st,
            args,
            post,
            op: args.op,
            write_value: args.write_value.clone(),
            conflict_version: args.conflict_version,
            invoke_result: None,
            invoke_modified: false,
            transformed: false,
            read_through_store,
            read_from_store: false,
            intercepted: false,
            result: None,
        }
    }

    /// The operation after transform/expiry downgrades.
    pub(crate) fn final_op(&self) -> EntryOp {
        self.op
    }

    /// The value the update attempted to write.
    pub(crate) fn attempted_value(&self) -> Option<CacheValue> {
        self.write_value.clone()
    }

    /// Whether a before-hook of the interceptor ran.
    pub(crate) fn was_intercepted(&self) -> bool {
        self.intercepted
    }

    /// Take the computed result. Errs if the closure never ran, so callers
    /// cannot observe a half-built update.
    pub(crate) fn take_result(&mut self) -> CacheResult<AtomicUpdateResult> {
        self.result
            .take()
            .ok_or_else(|| CacheError::storage("atomic update closure did not run"))
    }

    /// The interceptor, when hooks apply to this update.
    fn active_interceptor(&self) -> Option<&'a dyn CacheInterceptor> {
        if !self.args.intercept {
            return None;
        }
        if self.conflict_version.is_some() && self.ctx.disable_interceptor_on_conflict() {
            return None;
        }
        self.ctx.interceptor()
    }

    /// Expire the stored row found overdue: emit EXPIRED, tombstone in
    /// deferred-delete caches, and treat the row as missing.
    fn expire_old_row(&mut self, expired_val: CacheValue) {
        let version = self.st.version;
        self.st
            .update(None, EXPIRE_TIME_ETERNAL, TTL_ETERNAL, version);
        if self.ctx.deferred_delete() && !self.st.deleted() {
            self.st.set_deleted(true);
        }

        if self.ctx.events().is_recordable(EventType::Expired) {
            self.ctx.events().record(EntryEvent {
                event_type: EventType::Expired,
                cache_id: self.cache_id,
                partition: self.key.partition(),
                key: self.key.as_bytes().clone(),
                node_id: self.ctx.local_node_id(),
                version: Some(self.st.version.stamp),
                new_value: None,
                old_value: Some(expired_val.clone()),
            });
        }

        self.post.expired_notify = Some(Some(expired_val));
    }

    fn version_check(&mut self) -> CacheResult<()> {
        if !self.args.ver_check {
            debug_assert!(
                self.st.is_start()
                    || atomic_version_cmp(&self.st.version.stamp, &self.args.new_version)
                        != CmpOrdering::Greater,
                "invalid version for inner update"
            );
            return Ok(());
        }

        if self.st.is_start() {
            return Ok(());
        }

        let cmp = atomic_version_cmp(&self.st.version.stamp, &self.args.new_version);
        if cmp == CmpOrdering::Less {
            return Ok(());
        }

        let replay_store = if cmp == CmpOrdering::Equal && self.args.primary {
            self.ctx.write_through_store()
        } else {
            None
        };

        if let Some(store) = replay_store {
            // Idempotent replay: same version, push current state to the
            // store once more.
            tracing::debug!(key = ?self.key.as_bytes(), "update with same version as current, updating store");
            match &self.st.value {
                Some(value) => store.put(self.key, value, self.st.version.stamp)?,
                None => store.remove(self.key)?,
            }
        } else {
            tracing::debug!(key = ?self.key.as_bytes(), "update with smaller version than current, ignoring");
        }

        self.result = Some(AtomicUpdateResult::rejected(
            UpdateOutcome::VersionCheckFailed,
            self.st.value.clone(),
            self.invoke_result.take(),
            false,
        ));

        Ok(())
    }

    fn resolve_conflict(
        &mut self,
        resolver: &dyn ConflictResolver,
    ) -> CacheResult<Option<ConflictContext>> {
        let now = self.ctx.now_millis();
        let old_conflict_ver = self.st.version.conflict_version();
        let new_conflict_ver = self.conflict_version.unwrap_or(self.args.new_version);

        let resolved = ttl_and_expire_time(
            self.args.expiry,
            self.args.explicit_ttl,
            self.args.explicit_expire_time,
            self.st.has_value(),
            self.st.is_start(),
            self.st.ttl(),
            self.st.expire_time(),
            now,
        );

        let decision = {
            let old_entry = ConflictEntry {
                key: self.key,
                value: self.st.value.as_ref(),
                ttl: self.st.ttl(),
                expire_time: self.st.expire_time(),
                version: old_conflict_ver,
                is_start: self.st.is_start(),
            };
            let new_entry = ConflictEntry {
                key: self.key,
                value: self.write_value.as_ref(),
                ttl: resolved.ttl,
                expire_time: resolved.expire_time,
                version: new_conflict_ver,
                is_start: false,
            };
            resolver.resolve(&old_entry, &new_entry, self.args.ver_check)
        };

        match decision {
            ConflictDecision::UseOld => {
                // Same-DC equal-version replay still pushes the current
                // state to the store on the primary.
                let replay = !self.st.is_start()
                    && self.args.ver_check
                    && old_conflict_ver.data_center_id() == new_conflict_ver.data_center_id()
                    && atomic_version_cmp(&old_conflict_ver, &new_conflict_ver)
                        == CmpOrdering::Equal
                    && self.args.primary;

                if replay {
                    if let Some(store) = self.ctx.write_through_store() {
                        match &self.st.value {
                            Some(value) => store.put(self.key, value, self.st.version.stamp)?,
                            None => store.remove(self.key)?,
                        }
                    }
                }

                let context = ConflictContext {
                    kind: ConflictKind::UseOld,
                    ttl: self.st.ttl(),
                    expire_time: self.st.expire_time(),
                };

                let mut result = AtomicUpdateResult::rejected(
                    UpdateOutcome::ConflictUseOld,
                    self.st.value.clone(),
                    self.invoke_result.take(),
                    false,
                );
                result.conflict = Some(context.clone());
                self.result = Some(result);

                Ok(Some(context))
            }
            ConflictDecision::UseNew => {
                self.op = if self.write_value.is_some() {
                    EntryOp::Update
                } else {
                    EntryOp::Delete
                };
                Ok(Some(ConflictContext {
                    kind: ConflictKind::UseNew,
                    ttl: resolved.ttl,
                    expire_time: resolved.expire_time,
                }))
            }
            ConflictDecision::Merge(merged) => {
                // A merge is a local update; it overrides the incoming
                // value and drops the conflict stamp.
                self.write_value = Some(merged);
                self.conflict_version = None;
                self.op = EntryOp::Update;
                Ok(Some(ConflictContext {
                    kind: ConflictKind::Merge,
                    ttl: resolved.ttl,
                    expire_time: resolved.expire_time,
                }))
            }
        }
    }

    /// Row operation for an aborted update: install a store-loaded value or
    /// refresh the access TTL.
    fn cancel_update_row_op(
        &mut self,
        store_loaded: Option<CacheValue>,
        update_expire: bool,
        old_row: Option<&Row>,
    ) -> CacheResult<RowOp> {
        let now = self.ctx.now_millis();

        if let Some(loaded) = store_loaded {
            let (ttl, expire_time) = initial_ttl_and_expire_time(self.args.expiry, now);
            let version = self.st.version;
            self.st
                .update(Some(loaded.clone()), expire_time, ttl, version);

            let row = self.ctx.row_store().create_row(
                self.cache_id,
                self.key,
                loaded,
                self.st.version.stamp,
                expire_time,
                old_row,
            );
            return Ok(RowOp::Put(row));
        }

        if update_expire {
            if let (Some(current), Some(policy)) = (self.st.value.clone(), self.args.expiry) {
                if let Some((ttl, expire_time)) = access_ttl(policy, now) {
                    if self.st.expire_time() != expire_time {
                        self.st.extras.set_ttl_and_expire_time(ttl, expire_time);
                        let row = self.ctx.row_store().create_row(
                            self.cache_id,
                            self.key,
                            current,
                            self.st.version.stamp,
                            expire_time,
                            old_row,
                        );
                        return Ok(RowOp::Put(row));
                    }
                }
            }
        }

        Ok(RowOp::Noop)
    }

    fn log_update(
        &self,
        value: Option<&CacheValue>,
        expire_time: u64,
        counter: u64,
        creating: bool,
    ) -> CacheResult<Option<WalPointer>> {
        let Some(wal) = self.ctx.data_record_wal() else {
            return Ok(None);
        };

        let record_op = if value.is_none() {
            RecordOp::Delete
        } else if creating {
            RecordOp::Create
        } else {
            RecordOp::Update
        };

        let mut flags = RecordFlags::empty();
        if self.args.primary {
            flags |= RecordFlags::PRIMARY;
        }
        if self.read_from_store {
            flags |= RecordFlags::FROM_STORE;
        }

        Ok(Some(wal.append(&DataRecord {
            cache_id: self.cache_id,
            key: self.key.as_bytes().clone(),
            value: value.cloned(),
            op: record_op,
            near_xid: None,
            write_version: self.args.new_version,
            expire_time: expire_time as i64,
            partition: self.key.partition(),
            update_counter: counter as i64,
            flags,
        })?))
    }

    fn apply_update(
        &mut self,
        value: CacheValue,
        old_val: Option<CacheValue>,
        conflict_ctx: Option<ConflictContext>,
        old_row: Option<&Row>,
    ) -> CacheResult<RowOp> {
        let now = self.ctx.now_millis();

        let (new_ttl, new_expire_time) = match &conflict_ctx {
            Some(context) => (context.ttl, context.expire_time),
            None => {
                let resolved = ttl_and_expire_time(
                    self.args.expiry,
                    self.args.explicit_ttl,
                    self.args.explicit_expire_time,
                    self.st.has_value(),
                    self.st.is_start(),
                    self.st.ttl(),
                    self.st.expire_time(),
                    now,
                );
                (resolved.ttl, resolved.expire_time)
            }
        };

        // A TTL already in the past turns the update into a removal.
        if is_expired(new_expire_time, now) {
            self.op = EntryOp::Delete;
            self.write_value = None;
            return self.apply_remove(old_val, conflict_ctx, old_row);
        }

        let mut value = value;

        if let Some(interceptor) = self.active_interceptor() {
            self.intercepted = true;
            match before_put_guarded(interceptor, old_val.as_ref(), &value) {
                None => {
                    self.result = Some(AtomicUpdateResult::rejected(
                        UpdateOutcome::InterceptorCancel,
                        old_val,
                        self.invoke_result.take(),
                        false,
                    ));
                    return Ok(RowOp::Noop);
                }
                Some(substituted) => {
                    value = substituted;
                    self.write_value = Some(value.clone());
                }
            }
        }

        if let Some(dump) = self.ctx.dump_listener() {
            dump.before_change(
                self.cache_id,
                self.key,
                old_val.as_ref(),
                self.st.expire_time(),
                self.st.version.stamp,
            );
        }

        // Write-through must happen inside the critical section so that the
        // store and the cache agree by the time notifications fire.
        if self.args.write_through {
            if let Some(store) = self.ctx.write_through_store() {
                store.put(self.key, &value, self.args.new_version)?;
            }
        }

        if self.st.value.is_none()
            && !self.st.is_start()
            && self.ctx.deferred_delete()
            && self.st.deleted()
        {
            self.st.set_deleted(false);
        }

        let counter = self
            .ctx
            .next_partition_counter(self.key.partition(), self.args.update_counter);

        let creating = old_val.is_none();
        let wal_pointer = self.log_update(Some(&value), new_expire_time, counter, creating)?;

        let row = self.ctx.row_store().create_row(
            self.cache_id,
            self.key,
            value.clone(),
            self.args.new_version,
            new_expire_time,
            old_row,
        );
        let row_op = match old_row {
            Some(old) if old.link == row.link => RowOp::InPlace(row),
            _ => RowOp::Put(row),
        };

        let entry_version =
            EntryVersion::with_conflict(self.args.new_version, self.conflict_version);
        self.st
            .update(Some(value.clone()), new_expire_time, new_ttl, entry_version);

        self.result = Some(AtomicUpdateResult {
            outcome: UpdateOutcome::Success,
            old_value: old_val,
            new_value: Some(value),
            invoke_result: self.invoke_result.take(),
            new_ttl,
            new_expire_time,
            enqueue_version: None,
            conflict: conflict_ctx,
            update_counter: counter,
            transformed: self.transformed,
            wal_pointer,
        });

        Ok(row_op)
    }

    fn apply_remove(
        &mut self,
        old_val: Option<CacheValue>,
        conflict_ctx: Option<ConflictContext>,
        old_row: Option<&Row>,
    ) -> CacheResult<RowOp> {
        let mut reported_old = old_val.clone();

        if let Some(interceptor) = self.active_interceptor() {
            self.intercepted = true;
            let decision = before_remove_guarded(interceptor, old_val.as_ref());
            if decision.cancel {
                self.result = Some(AtomicUpdateResult::rejected(
                    UpdateOutcome::InterceptorCancel,
                    decision.override_value.or(old_val),
                    self.invoke_result.take(),
                    false,
                ));
                return Ok(RowOp::Noop);
            }
            if decision.override_value.is_some() {
                reported_old = decision.override_value;
            }
        }

        if let Some(dump) = self.ctx.dump_listener() {
            dump.before_change(
                self.cache_id,
                self.key,
                old_val.as_ref(),
                self.st.expire_time(),
                self.st.version.stamp,
            );
        }

        if self.args.write_through {
            if let Some(store) = self.ctx.write_through_store() {
                store.remove(self.key)?;
            }
        }

        let counter = self
            .ctx
            .next_partition_counter(self.key.partition(), self.args.update_counter);

        let wal_pointer = self.log_update(None, EXPIRE_TIME_ETERNAL, counter, false)?;

        if self.ctx.deferred_delete() && !self.st.deleted() && (old_val.is_some() || self.st.is_start())
        {
            self.st.set_deleted(true);
        }

        let entry_version =
            EntryVersion::with_conflict(self.args.new_version, self.conflict_version);
        self.st
            .update(None, EXPIRE_TIME_ETERNAL, TTL_ETERNAL, entry_version);

        let row_op = if old_row.is_none() || self.read_from_store {
            RowOp::Noop
        } else {
            RowOp::Remove
        };

        let outcome = if old_val.is_some() {
            UpdateOutcome::Success
        } else {
            UpdateOutcome::RemoveNoVal
        };

        self.result = Some(AtomicUpdateResult {
            outcome,
            old_value: reported_old,
            new_value: None,
            invoke_result: self.invoke_result.take(),
            new_ttl: TTL_ETERNAL,
            new_expire_time: EXPIRE_TIME_ETERNAL,
            enqueue_version: Some(self.args.new_version),
            conflict: conflict_ctx,
            update_counter: counter,
            transformed: self.transformed,
            wal_pointer,
        });

        Ok(row_op)
    }
}

impl InvokeClosure for AtomicUpdateClosure<'_, '_> {
    fn call(&mut self, old_row: Option<&Row>) -> CacheResult<RowOp> {
        let now = self.ctx.now_millis();

        // 1. Install the stored row; expire it if overdue.
        let mut old_row_live = old_row;
        if let Some(row) = old_row {
            let ttl = if row.expire_time == EXPIRE_TIME_ETERNAL {
                TTL_ETERNAL
            } else {
                row.expire_time.saturating_sub(now).max(TTL_MINIMUM)
            };
            self.st.update(
                Some(row.value.clone()),
                row.expire_time,
                ttl,
                EntryVersion::new(row.version),
            );

            if is_expired(row.expire_time, now) {
                self.expire_old_row(row.value.clone());
                old_row_live = None;
            }
        }
        self.st.flags.insert(EntryFlags::UNSWAPPED);

        let mut old_val = if old_row_live.is_some() {
            self.st.value.clone()
        } else {
            None
        };

        // 2. Read-through for the previous value.
        let mut store_loaded: Option<CacheValue> = None;
        if old_val.is_none() {
            if let Some(store) = self.read_through_store {
                if let Some(loaded) = store.load(self.key)? {
                    self.st.value = Some(loaded.clone());
                    if self.st.deleted() {
                        self.st.set_deleted(false);
                    }
                    old_val = Some(loaded.clone());
                    store_loaded = Some(loaded);
                    self.read_from_store = true;
                }
            }
        } else if self.st.deleted() {
            self.st.set_deleted(false);
        }

        // 3. Transform: run the user processor over a mutable view and
        //    downgrade the operation by its outcome.
        if self.op == EntryOp::Transform {
            let processor = self
                .args
                .processor
                .ok_or_else(|| CacheError::storage("transform update without processor"))?;

            let mut invoke_entry = InvokeEntry::new(self.key, old_val.clone());
            self.invoke_result = run_processor(processor, &mut invoke_entry)?;
            self.invoke_modified = invoke_entry.modified();
            self.transformed = true;

            self.write_value = if self.invoke_modified {
                invoke_entry.into_value()
            } else {
                old_val.clone()
            };

            self.op = if self.write_value.is_some() {
                EntryOp::Update
            } else {
                EntryOp::Delete
            };
        }

        // 4. Conflict resolution.
        let resolver = if self.args.conflict_resolve {
            self.ctx.conflict_resolver()
        } else {
            None
        };

        let mut conflict_ctx = None;
        if let Some(resolver) = resolver {
            conflict_ctx = self.resolve_conflict(resolver)?;
            if self.result.is_some() {
                return Ok(RowOp::Noop);
            }
        } else {
            // No explicit resolution; subsequent updates use the regular
            // version.
            self.conflict_version = None;
        }

        // 5. Version check, only when no resolver ran.
        if conflict_ctx.is_none() {
            self.version_check()?;
            if self.result.is_some() {
                return Ok(RowOp::Noop);
            }
        }

        // 6. Filters, evaluated atomically.
        if !self.args.filters.is_empty()
            && !self.args.filters.iter().all(|f| f.apply(old_val.as_ref()))
        {
            let put_if_absent = self.args.filters.iter().any(|f| f.is_put_if_absent());
            let row_op = self.cancel_update_row_op(store_loaded, !put_if_absent, old_row)?;
            self.result = Some(AtomicUpdateResult::rejected(
                UpdateOutcome::FilterFailed,
                old_val,
                self.invoke_result.take(),
                false,
            ));
            return Ok(row_op);
        }

        // 7. A transform that modified nothing is a no-op.
        if self.transformed && !self.invoke_modified {
            let row_op = self.cancel_update_row_op(store_loaded, true, old_row)?;
            self.result = Some(AtomicUpdateResult::rejected(
                UpdateOutcome::InvokeNoOp,
                old_val,
                self.invoke_result.take(),
                true,
            ));
            return Ok(row_op);
        }

        // 8-13. Apply the physical update or removal. The original row is
        // passed even when expired: the physical replacement or deletion
        // still targets it.
        match (self.op, self.write_value.clone()) {
            (EntryOp::Update, Some(value)) => {
                self.apply_update(value, old_val, conflict_ctx, old_row)
            }
            (EntryOp::Delete, _) => self.apply_remove(old_val, conflict_ctx, old_row),
            (EntryOp::Update, None) | (EntryOp::Transform, _) => Err(CacheError::storage(
                "atomic update reached the row phase in an invalid state",
            )),
        }
    }
}

/// Run the entry processor behind a panic barrier. Processor failures are
/// captured in the result, never propagated; unregistered-type errors abort
/// the operation so the caller can register the type and retry.
fn run_processor(
    processor: &dyn EntryProcessor,
    entry: &mut InvokeEntry<'_>,
) -> CacheResult<Option<InvokeResult>> {
    let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(&mut *entry)));

    match outcome {
        Ok(Ok(None)) => Ok(None),
        Ok(Ok(Some(value))) => Ok(Some(InvokeResult {
            value: Some(value),
            error: None,
        })),
        Ok(Err(ProcessorError::Unregistered { type_tag })) => {
            Err(CacheError::UnregisteredType { type_tag })
        }
        Ok(Err(ProcessorError::Failed(message))) => {
            entry.reset_modified();
            Ok(Some(InvokeResult {
                value: None,
                error: Some(message),
            }))
        }
        Err(_) => {
            entry.reset_modified();
            Ok(Some(InvokeResult {
                value: None,
                error: Some("entry processor panicked".to_string()),
            }))
        }
    }
}

//! Entry-level event emission and listener plumbing.
//!
//! Events carry fixed numeric ids that are part of the public contract.
//! Continuous-query listeners are registered under the per-cache listener
//! write lock; mutators hold the read side of that lock for the whole
//! locked section, so a registration never observes a half-applied update.

use crate::entry::value::{CacheValue, EntryKey};
use crate::entry::version::Version;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Entry event codes (fixed numeric ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EventType {
    /// Value written.
    Put = 63,
    /// Value read.
    Read = 64,
    /// Value removed.
    Removed = 65,
    /// Lock owner elected.
    Locked = 66,
    /// Lock owner released.
    Unlocked = 67,
    /// Value expired.
    Expired = 70,
}

impl EventType {
    /// The stable numeric id.
    pub const fn id(self) -> u16 {
        self as u16
    }
}

/// An emitted entry event.
#[derive(Debug, Clone)]
pub struct EntryEvent {
    /// Event code.
    pub event_type: EventType,

    /// Owning cache.
    pub cache_id: u32,

    /// Owning partition.
    pub partition: u32,

    /// Key bytes.
    pub key: Bytes,

    /// Node the event was observed on.
    pub node_id: u64,

    /// Version of the mutation, when applicable.
    pub version: Option<Version>,

    /// New value, when applicable.
    pub new_value: Option<CacheValue>,

    /// Previous value, when applicable.
    pub old_value: Option<CacheValue>,
}

/// Fire-and-forget event sink.
pub trait EventSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: EntryEvent);
}

/// Per-cache event manager: recordability mask plus registered sinks.
pub struct EventManager {
    recordable: RwLock<HashSet<EventType>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventManager {
    /// Create a manager with no recordable events and no sinks.
    pub fn new() -> Self {
        Self {
            recordable: RwLock::new(HashSet::new()),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Create a manager with every event type recordable.
    pub fn recording_all() -> Self {
        let manager = Self::new();
        for event_type in [
            EventType::Put,
            EventType::Read,
            EventType::Removed,
            EventType::Locked,
            EventType::Unlocked,
            EventType::Expired,
        ] {
            manager.enable(event_type);
        }
        manager
    }

    /// Mark an event type recordable.
    pub fn enable(&self, event_type: EventType) {
        self.recordable.write().insert(event_type);
    }

    /// Mark an event type not recordable.
    pub fn disable(&self, event_type: EventType) {
        self.recordable.write().remove(&event_type);
    }

    /// Check whether an event type should be emitted.
    pub fn is_recordable(&self, event_type: EventType) -> bool {
        self.recordable.read().contains(&event_type)
    }

    /// Attach a sink.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Emit an event to every sink.
    pub fn record(&self, event: EntryEvent) {
        for sink in self.sinks.read().iter() {
            sink.record(event.clone());
        }
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Continuous-query listener notified of entry updates and expirations
/// while the entry lock is held, in WAL order.
pub trait ContinuousQueryListener: Send + Sync {
    /// An entry was written or removed. `new_value` is absent for removals.
    fn on_entry_updated(
        &self,
        key: &EntryKey,
        new_value: Option<&CacheValue>,
        old_value: Option<&CacheValue>,
        partition: u32,
        primary: bool,
        update_counter: u64,
    );

    /// An entry expired; `old_value` is the pre-expiry value.
    fn on_entry_expired(&self, key: &EntryKey, old_value: Option<&CacheValue>);
}

/// Data-region dump listener, invoked before every physical change.
pub trait DumpChangeListener: Send + Sync {
    /// Observe the pre-change state of the entry.
    fn before_change(
        &self,
        cache_id: u32,
        key: &EntryKey,
        old_value: Option<&CacheValue>,
        expire_time: u64,
        version: Version,
    );
}

/// Registered continuous-query listeners for one cache.
///
/// The registry itself lives behind the per-cache listener lock; this type
/// is only ever touched through a lock guard.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn ContinuousQueryListener>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn register(&mut self, listener: Arc<dyn ContinuousQueryListener>) {
        self.listeners.push(listener);
    }

    /// Registered listeners.
    pub fn all(&self) -> &[Arc<dyn ContinuousQueryListener>] {
        &self.listeners
    }

    /// Check whether any listener is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

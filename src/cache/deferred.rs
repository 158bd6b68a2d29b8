//! Deferred-delete queue interface.
//!
//! In deferred-delete caches a remove flips the entry's deleted flag and
//! hands `(key, version)` to this queue; an external single consumer later
//! marks the entry obsolete.

use crate::entry::value::EntryKey;
use crate::entry::version::Version;
use parking_lot::Mutex;

/// Multi-producer deferred-delete queue.
pub trait DeferredDeleteQueue: Send + Sync {
    /// Enqueue a tombstoned entry for eventual obsolete-marking.
    fn enqueue(&self, key: EntryKey, version: Version);
}

/// Queue that collects enqueued tombstones for an external consumer to
/// drain.
#[derive(Default)]
pub struct CollectingDeferredQueue {
    entries: Mutex<Vec<(EntryKey, Version)>>,
}

impl CollectingDeferredQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tombstones.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drain all queued tombstones.
    pub fn drain(&self) -> Vec<(EntryKey, Version)> {
        std::mem::take(&mut *self.entries.lock())
    }
}

impl DeferredDeleteQueue for CollectingDeferredQueue {
    fn enqueue(&self, key: EntryKey, version: Version) {
        self.entries.lock().push((key, version));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_collects_and_drains() {
        let queue = CollectingDeferredQueue::new();
        assert!(queue.is_empty());

        queue.enqueue(EntryKey::new(&b"k"[..], 0), Version::new(1, 1, 1, 0));
        assert_eq!(queue.len(), 1);

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());
    }
}

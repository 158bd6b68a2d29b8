//! User interceptor hooks and the panic barrier around them.
//!
//! Interceptors run user code inside the entry's critical section. Every
//! call crosses a panic barrier: a panicking interceptor counts as a veto
//! and never leaves the entry inconsistent or the lock poisoned.

use crate::entry::value::{CacheValue, EntryKey};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Read-only view of an entry handed to after-hooks.
#[derive(Debug, Clone)]
pub struct EntryView {
    /// The key.
    pub key: EntryKey,

    /// The value after the operation (for puts) or before it (for removes).
    pub value: Option<CacheValue>,

    /// Partition update counter assigned to the operation.
    pub update_counter: u64,
}

/// Verdict of `on_before_remove`.
#[derive(Debug, Clone, Default)]
pub struct RemoveDecision {
    /// Cancel the removal.
    pub cancel: bool,

    /// Value to report to the caller instead of the entry's current one.
    pub override_value: Option<CacheValue>,
}

/// Entry-boundary interceptor.
pub trait CacheInterceptor: Send + Sync {
    /// Called before a value is written. Returning `None` cancels the
    /// write; returning a different value substitutes it.
    fn on_before_put(
        &self,
        old_value: Option<&CacheValue>,
        candidate: &CacheValue,
    ) -> Option<CacheValue>;

    /// Called after a successful write, outside the entry lock.
    fn on_after_put(&self, view: &EntryView);

    /// Called before a removal.
    fn on_before_remove(&self, old_value: Option<&CacheValue>) -> RemoveDecision;

    /// Called after a successful removal, outside the entry lock.
    fn on_after_remove(&self, view: &EntryView);
}

/// Run `on_before_put` behind the panic barrier. A panic vetoes the write.
pub fn before_put_guarded(
    interceptor: &dyn CacheInterceptor,
    old_value: Option<&CacheValue>,
    candidate: &CacheValue,
) -> Option<CacheValue> {
    match catch_unwind(AssertUnwindSafe(|| {
        interceptor.on_before_put(old_value, candidate)
    })) {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("interceptor on_before_put panicked; treating as veto");
            None
        }
    }
}

/// Run `on_after_put` behind the panic barrier.
pub fn after_put_guarded(interceptor: &dyn CacheInterceptor, view: &EntryView) {
    if catch_unwind(AssertUnwindSafe(|| interceptor.on_after_put(view))).is_err() {
        tracing::warn!("interceptor on_after_put panicked");
    }
}

/// Run `on_before_remove` behind the panic barrier. A panic cancels the
/// removal.
pub fn before_remove_guarded(
    interceptor: &dyn CacheInterceptor,
    old_value: Option<&CacheValue>,
) -> RemoveDecision {
    match catch_unwind(AssertUnwindSafe(|| interceptor.on_before_remove(old_value))) {
        Ok(decision) => decision,
        Err(_) => {
            tracing::warn!("interceptor on_before_remove panicked; cancelling remove");
            RemoveDecision {
                cancel: true,
                override_value: None,
            }
        }
    }
}

/// Run `on_after_remove` behind the panic barrier.
pub fn after_remove_guarded(interceptor: &dyn CacheInterceptor, view: &EntryView) {
    if catch_unwind(AssertUnwindSafe(|| interceptor.on_after_remove(view))).is_err() {
        tracing::warn!("interceptor on_after_remove panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Panicking;

    impl CacheInterceptor for Panicking {
        fn on_before_put(
            &self,
            _old_value: Option<&CacheValue>,
            _candidate: &CacheValue,
        ) -> Option<CacheValue> {
            panic!("boom");
        }

        fn on_after_put(&self, _view: &EntryView) {
            panic!("boom");
        }

        fn on_before_remove(&self, _old_value: Option<&CacheValue>) -> RemoveDecision {
            panic!("boom");
        }

        fn on_after_remove(&self, _view: &EntryView) {
            panic!("boom");
        }
    }

    #[test]
    fn panicking_before_put_vetoes() {
        let candidate = CacheValue::from(&b"v"[..]);
        assert!(before_put_guarded(&Panicking, None, &candidate).is_none());
    }

    #[test]
    fn panicking_before_remove_cancels() {
        let decision = before_remove_guarded(&Panicking, None);
        assert!(decision.cancel);
    }

    #[test]
    fn panicking_after_hooks_are_swallowed() {
        let view = EntryView {
            key: EntryKey::new(&b"k"[..], 0),
            value: None,
            update_counter: 1,
        };
        after_put_guarded(&Panicking, &view);
        after_remove_guarded(&Panicking, &view);
    }
}

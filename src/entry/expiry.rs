//! Expiration policy and TTL resolution.
//!
//! A policy answers three questions: what TTL applies when an entry is
//! created, updated, or read. Answers are [`TtlDecision`] values; the
//! resolution helpers below turn a decision plus the entry's current state
//! into the concrete `(ttl, expire_time)` pair stored in the extras.

use crate::core::time::{
    expire_time_in_past, to_expire_time, EXPIRE_TIME_ETERNAL, TTL_ETERNAL, TTL_MINIMUM,
};

/// A policy answer for one of the three lifecycle points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlDecision {
    /// Keep the TTL the entry already has.
    NotChanged,
    /// Expire immediately.
    Zero,
    /// Never expire.
    Eternal,
    /// Expire after the given number of milliseconds.
    Duration(u64),
}

/// Expiration policy consulted on create, update, and access.
pub trait ExpiryPolicy: Send + Sync {
    /// TTL for a newly created entry.
    fn for_create(&self) -> TtlDecision;

    /// TTL for an updated entry.
    fn for_update(&self) -> TtlDecision;

    /// TTL refresh applied when an entry is read.
    fn for_access(&self) -> TtlDecision;
}

/// Policy that never expires anything.
#[derive(Debug, Default)]
pub struct EternalExpiry;

impl ExpiryPolicy for EternalExpiry {
    fn for_create(&self) -> TtlDecision {
        TtlDecision::Eternal
    }

    fn for_update(&self) -> TtlDecision {
        TtlDecision::NotChanged
    }

    fn for_access(&self) -> TtlDecision {
        TtlDecision::NotChanged
    }
}

/// Policy that sets a TTL at creation and leaves it alone afterwards.
#[derive(Debug)]
pub struct CreatedExpiry {
    ttl_ms: u64,
}

impl CreatedExpiry {
    /// Create a policy with the given creation TTL.
    pub fn new(ttl_ms: u64) -> Self {
        Self { ttl_ms }
    }
}

impl ExpiryPolicy for CreatedExpiry {
    fn for_create(&self) -> TtlDecision {
        TtlDecision::Duration(self.ttl_ms)
    }

    fn for_update(&self) -> TtlDecision {
        TtlDecision::NotChanged
    }

    fn for_access(&self) -> TtlDecision {
        TtlDecision::NotChanged
    }
}

/// Policy that refreshes the TTL on every touch: create, update, and read.
#[derive(Debug)]
pub struct TouchedExpiry {
    ttl_ms: u64,
}

impl TouchedExpiry {
    /// Create a policy with the given sliding TTL.
    pub fn new(ttl_ms: u64) -> Self {
        Self { ttl_ms }
    }
}

impl ExpiryPolicy for TouchedExpiry {
    fn for_create(&self) -> TtlDecision {
        TtlDecision::Duration(self.ttl_ms)
    }

    fn for_update(&self) -> TtlDecision {
        TtlDecision::Duration(self.ttl_ms)
    }

    fn for_access(&self) -> TtlDecision {
        TtlDecision::Duration(self.ttl_ms)
    }
}

/// Resolved TTL state for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlResolution {
    /// TTL to store.
    pub ttl: u64,

    /// Expire time to store.
    pub expire_time: u64,

    /// The policy demanded immediate expiry; the write must turn into a
    /// removal.
    pub remove: bool,
}

/// Resolve the TTL pair for a write.
///
/// An explicit TTL always wins. Otherwise the policy is consulted for
/// update or create depending on whether the entry currently has a value;
/// `NotChanged` retains the prior pair, which for start-version entries
/// means eternal.
#[allow(clippy::too_many_arguments)]
pub fn ttl_and_expire_time(
    policy: Option<&dyn ExpiryPolicy>,
    explicit_ttl: Option<u64>,
    explicit_expire_time: Option<u64>,
    has_value: bool,
    is_start: bool,
    current_ttl: u64,
    current_expire_time: u64,
    now_ms: u64,
) -> TtlResolution {
    if let Some(ttl) = explicit_ttl {
        let expire_time = explicit_expire_time.unwrap_or_else(|| to_expire_time(now_ms, ttl));
        return TtlResolution {
            ttl,
            expire_time,
            remove: false,
        };
    }

    let decision = match policy {
        Some(policy) if has_value => policy.for_update(),
        Some(policy) => policy.for_create(),
        None => TtlDecision::NotChanged,
    };

    resolve_decision(decision, is_start, current_ttl, current_expire_time, now_ms)
}

/// Resolve the TTL pair for a freshly installed value (store load, preload).
pub fn initial_ttl_and_expire_time(
    policy: Option<&dyn ExpiryPolicy>,
    now_ms: u64,
) -> (u64, u64) {
    let decision = policy.map_or(TtlDecision::Eternal, |p| p.for_create());
    let resolved = resolve_decision(decision, true, TTL_ETERNAL, EXPIRE_TIME_ETERNAL, now_ms);
    (resolved.ttl, resolved.expire_time)
}

/// Resolve an access-time TTL refresh. Returns `None` when the policy keeps
/// the current TTL, so no row rewrite is needed.
pub fn access_ttl(policy: &dyn ExpiryPolicy, now_ms: u64) -> Option<(u64, u64)> {
    match policy.for_access() {
        TtlDecision::NotChanged => None,
        TtlDecision::Zero => Some((TTL_MINIMUM, expire_time_in_past(now_ms))),
        TtlDecision::Eternal => Some((TTL_ETERNAL, EXPIRE_TIME_ETERNAL)),
        TtlDecision::Duration(ttl) => Some((ttl, to_expire_time(now_ms, ttl))),
    }
}

fn resolve_decision(
    decision: TtlDecision,
    is_start: bool,
    current_ttl: u64,
    current_expire_time: u64,
    now_ms: u64,
) -> TtlResolution {
    match decision {
        TtlDecision::NotChanged => {
            if is_start {
                TtlResolution {
                    ttl: TTL_ETERNAL,
                    expire_time: EXPIRE_TIME_ETERNAL,
                    remove: false,
                }
            } else {
                TtlResolution {
                    ttl: current_ttl,
                    expire_time: current_expire_time,
                    remove: false,
                }
            }
        }
        TtlDecision::Zero => TtlResolution {
            ttl: TTL_MINIMUM,
            expire_time: expire_time_in_past(now_ms),
            remove: true,
        },
        TtlDecision::Eternal | TtlDecision::Duration(TTL_ETERNAL) => TtlResolution {
            ttl: TTL_ETERNAL,
            expire_time: EXPIRE_TIME_ETERNAL,
            remove: false,
        },
        TtlDecision::Duration(ttl) => TtlResolution {
            ttl,
            expire_time: to_expire_time(now_ms, ttl),
            remove: false,
        },
    }
}

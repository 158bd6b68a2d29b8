//! Cross-datacenter replication hooks and conflict resolution.
//!
//! When DR is enabled, versions carry a datacenter id and every successful
//! mutation is offered to a replicator after the entry lock is released.
//! Conflicting updates between datacenters are resolved by a pluggable
//! [`ConflictResolver`].

use crate::entry::value::{CacheValue, EntryKey};
use crate::entry::version::Version;
use serde::{Deserialize, Serialize};

/// How a mutation participates in cross-datacenter replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrType {
    /// No replication.
    None,
    /// Primary update; replicated to remote datacenters.
    Primary,
    /// Backup update; recorded but not re-replicated.
    Backup,
    /// Value installed by a data loader.
    Load,
    /// Value installed by preloading.
    Preload,
}

impl DrType {
    /// Check whether this update should be offered to the replicator.
    pub fn replicates(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Topology epoch observed by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TopologyVersion(pub u64);

impl TopologyVersion {
    /// The initial topology.
    pub const fn initial() -> Self {
        Self(1)
    }
}

impl std::fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "top:{}", self.0)
    }
}

/// Replication sink invoked after lock release with the version of the
/// mutation, preserving causal order per key across datacenters.
pub trait DrReplicator: Send + Sync {
    /// Offer a mutation for replication. `value` is absent for removals.
    #[allow(clippy::too_many_arguments)]
    fn replicate(
        &self,
        key: &EntryKey,
        value: Option<&CacheValue>,
        ttl: u64,
        expire_time: u64,
        version: Version,
        dr_type: DrType,
        topology: TopologyVersion,
    );
}

/// One side of a conflict, presented to the resolver.
#[derive(Debug, Clone)]
pub struct ConflictEntry<'a> {
    /// The key under conflict.
    pub key: &'a EntryKey,

    /// The value on this side; absent for removals and never-written
    /// entries.
    pub value: Option<&'a CacheValue>,

    /// TTL on this side.
    pub ttl: u64,

    /// Expire time on this side.
    pub expire_time: u64,

    /// Conflict version stamp of this side.
    pub version: Version,

    /// Whether this side has never been written.
    pub is_start: bool,
}

/// Resolver verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Keep the existing state; abort the incoming update.
    UseOld,
    /// Apply the incoming update as-is.
    UseNew,
    /// Apply a merged value instead of the incoming one.
    Merge(CacheValue),
}

/// Pluggable cross-datacenter conflict resolver.
pub trait ConflictResolver: Send + Sync {
    /// Resolve a conflict between the current entry state and an incoming
    /// update. `ver_check` signals that the caller would otherwise perform
    /// an atomic version check.
    fn resolve(
        &self,
        old: &ConflictEntry<'_>,
        new: &ConflictEntry<'_>,
        ver_check: bool,
    ) -> ConflictDecision;
}

/// Outcome of a resolver run, carried on atomic results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictContext {
    /// The verdict kind.
    pub kind: ConflictKind,

    /// TTL chosen for the surviving state.
    pub ttl: u64,

    /// Expire time chosen for the surviving state.
    pub expire_time: u64,
}

/// Verdict kind recorded in a [`ConflictContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The existing state won.
    UseOld,
    /// The incoming update won.
    UseNew,
    /// A merged value was applied.
    Merge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dr_type_replication() {
        assert!(!DrType::None.replicates());
        assert!(DrType::Primary.replicates());
        assert!(DrType::Preload.replicates());
    }

    #[test]
    fn topology_ordering() {
        assert!(TopologyVersion(2) > TopologyVersion::initial());
    }
}

//! Lock candidate list for entry-level concurrency control.
//!
//! Each entry may carry an ordered list of lock candidates, one per
//! `(node, thread, version)` claim. The head non-reentrant candidate is the
//! *owner*; there is at most one owner at any time. Ownership transitions
//! are observed by the entry, which emits LOCKED/UNLOCKED events.

use crate::entry::version::Version;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Candidate attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CandidateFlags: u8 {
        /// Candidate belongs to the local node.
        const LOCAL = 0b0000_0001;
        /// Candidate is a reentry of a lock already held by the same thread.
        const REENTRY = 0b0000_0010;
        /// Candidate was added on behalf of a near-cache lock.
        const NEAR_LOCAL = 0b0000_0100;
    }
}

/// A single lock claim on an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccCandidate {
    /// Lock version (transaction xid for transactional locks).
    pub version: Version,

    /// Claiming node.
    pub node_id: u64,

    /// Claiming thread on that node.
    pub thread_id: u64,

    /// For remote candidates, the node the claim was mapped from.
    pub other_node_id: Option<u64>,

    flags: CandidateFlags,
}

impl MvccCandidate {
    /// Check whether this candidate is local.
    pub fn local(&self) -> bool {
        self.flags.contains(CandidateFlags::LOCAL)
    }

    /// Check whether this candidate is a reentry.
    pub fn reentry(&self) -> bool {
        self.flags.contains(CandidateFlags::REENTRY)
    }

    /// Check whether this candidate is near-local.
    pub fn near_local(&self) -> bool {
        self.flags.contains(CandidateFlags::NEAR_LOCAL)
    }
}

/// Ordered list of lock candidates for one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvccList {
    candidates: Vec<MvccCandidate>,
}

impl MvccList {
    /// Create an empty candidate list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a local candidate and return it. If the thread already holds a
    /// non-reentrant local candidate, the new claim is flagged as a
    /// reentry.
    pub fn add_local(
        &mut self,
        node_id: u64,
        thread_id: u64,
        version: Version,
        near_local: bool,
    ) -> MvccCandidate {
        let mut flags = CandidateFlags::LOCAL;
        if near_local {
            flags |= CandidateFlags::NEAR_LOCAL;
        }
        if self.local_candidate(thread_id).is_some() {
            flags |= CandidateFlags::REENTRY;
        }

        let candidate = MvccCandidate {
            version,
            node_id,
            thread_id,
            other_node_id: None,
            flags,
        };
        self.candidates.push(candidate.clone());
        candidate
    }

    /// Add a remote candidate mapped from another node and return it.
    pub fn add_remote(
        &mut self,
        node_id: u64,
        thread_id: u64,
        version: Version,
        other_node_id: Option<u64>,
    ) -> MvccCandidate {
        let candidate = MvccCandidate {
            version,
            node_id,
            thread_id,
            other_node_id,
            flags: CandidateFlags::empty(),
        };
        self.candidates.push(candidate.clone());
        candidate
    }

    /// The current owner: the head candidate that is not a reentry.
    pub fn owner(&self) -> Option<&MvccCandidate> {
        self.candidates.iter().find(|c| !c.reentry())
    }

    /// Check whether the entry is owned by the given lock version.
    pub fn is_owned_by(&self, version: &Version) -> bool {
        self.owner().is_some_and(|o| o.version == *version)
    }

    /// The non-reentrant local candidate for a thread, if any.
    pub fn local_candidate(&self, thread_id: u64) -> Option<&MvccCandidate> {
        self.candidates
            .iter()
            .find(|c| c.local() && !c.reentry() && c.thread_id == thread_id)
    }

    /// Check whether the owner is a local candidate of the given thread.
    pub fn is_locally_owned_by_thread(&self, thread_id: u64) -> bool {
        self.owner()
            .is_some_and(|o| o.local() && o.thread_id == thread_id)
    }

    /// Remove the candidate with the given version. Returns true if a
    /// candidate was removed.
    pub fn remove_version(&mut self, version: &Version) -> bool {
        match self.candidates.iter().position(|c| c.version == *version) {
            Some(idx) => {
                self.candidates.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Check whether the list has no candidates at all.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Check whether the list has no candidates other than ones claimed
    /// with the given version.
    pub fn is_empty_except(&self, version: &Version) -> bool {
        self.candidates.iter().all(|c| c.version == *version)
    }

    /// All local candidates, optionally including reentries.
    pub fn local_candidates(&self, include_reentries: bool) -> Vec<&MvccCandidate> {
        self.candidates
            .iter()
            .filter(|c| c.local() && (include_reentries || !c.reentry()))
            .collect()
    }

    /// Number of candidates, reentries included.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ver(order: u64) -> Version {
        Version::new(1, order, 1, 0)
    }

    #[test]
    fn head_non_reentrant_is_owner() {
        let mut mvcc = MvccList::new();
        assert!(mvcc.owner().is_none());

        mvcc.add_local(1, 10, ver(1), false);
        assert_eq!(mvcc.owner().unwrap().version, ver(1));

        // Same thread reenters; ownership does not move.
        let reentry = mvcc.add_local(1, 10, ver(2), false);
        assert!(reentry.reentry());
        assert_eq!(mvcc.owner().unwrap().version, ver(1));
    }

    #[test]
    fn at_most_one_owner() {
        let mut mvcc = MvccList::new();
        mvcc.add_local(1, 10, ver(1), false);
        mvcc.add_remote(2, 20, ver(2), None);
        mvcc.add_local(1, 30, ver(3), false);

        let owners = mvcc
            .candidates
            .iter()
            .filter(|c| mvcc.owner().map(|o| o.version) == Some(c.version))
            .count();
        assert_eq!(owners, 1);
        assert!(mvcc.is_owned_by(&ver(1)));
        assert!(!mvcc.is_owned_by(&ver(2)));
    }

    #[test]
    fn ownership_moves_on_removal() {
        let mut mvcc = MvccList::new();
        mvcc.add_local(1, 10, ver(1), false);
        mvcc.add_remote(2, 20, ver(2), Some(9));

        assert!(mvcc.remove_version(&ver(1)));
        assert_eq!(mvcc.owner().unwrap().version, ver(2));
        assert!(!mvcc.remove_version(&ver(1)));
    }

    #[test]
    fn empty_except_ignores_own_version() {
        let mut mvcc = MvccList::new();
        mvcc.add_local(1, 10, ver(5), false);
        assert!(mvcc.is_empty_except(&ver(5)));
        assert!(!mvcc.is_empty_except(&ver(6)));

        mvcc.add_remote(2, 20, ver(7), None);
        assert!(!mvcc.is_empty_except(&ver(5)));
    }

    #[test]
    fn thread_ownership() {
        let mut mvcc = MvccList::new();
        mvcc.add_local(1, 10, ver(1), false);
        assert!(mvcc.is_locally_owned_by_thread(10));
        assert!(!mvcc.is_locally_owned_by_thread(11));
        assert!(mvcc.local_candidate(10).is_some());
        assert!(mvcc.local_candidate(11).is_none());
    }
}

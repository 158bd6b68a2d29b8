//! Entry version stamps and comparators.
//!
//! A version stamp totally orders every mutation of a key. The stamp packs
//! the topology epoch, a per-node monotone order, and the node order with
//! the originating datacenter id folded into the top bits. The all-zero
//! *start version* marks an entry that has never been written.
//!
//! Two comparators exist: the natural order `(topology, order, node order,
//! dc id)` and the atomic order used by atomic-cache version checks, which
//! ranks stamps from different datacenters by datacenter id first so that
//! cross-DC updates resolve deterministically.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};

/// Bits of `node_order_dr_id` holding the node order.
const NODE_ORDER_MASK: u32 = 0x00FF_FFFF;

/// Shift of the datacenter id inside `node_order_dr_id`.
const DR_ID_SHIFT: u32 = 24;

/// A 16-byte version stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Topology epoch the update was issued under.
    pub top_ver: u32,

    /// Monotone per-node order.
    pub order: u64,

    /// Node order (low 24 bits) and datacenter id (high 8 bits).
    pub node_order_dr_id: u32,
}

impl Version {
    /// Encoded size on the wire.
    pub const WIRE_SIZE: usize = 16;

    /// Create a version stamp.
    pub fn new(top_ver: u32, order: u64, node_order: u32, data_center_id: u8) -> Self {
        debug_assert!(node_order <= NODE_ORDER_MASK, "node order overflow");
        Self {
            top_ver,
            order,
            node_order_dr_id: (u32::from(data_center_id) << DR_ID_SHIFT)
                | (node_order & NODE_ORDER_MASK),
        }
    }

    /// The start version: assigned at entry creation, meaning "never
    /// written". Never reused after any mutation.
    pub const fn start() -> Self {
        Self {
            top_ver: 0,
            order: 0,
            node_order_dr_id: 0,
        }
    }

    /// Check whether this is the start version.
    pub const fn is_start(&self) -> bool {
        self.top_ver == 0 && self.order == 0 && self.node_order_dr_id == 0
    }

    /// Node order of the originating node.
    pub const fn node_order(&self) -> u32 {
        self.node_order_dr_id & NODE_ORDER_MASK
    }

    /// Datacenter id of the originating node.
    pub const fn data_center_id(&self) -> u8 {
        (self.node_order_dr_id >> DR_ID_SHIFT) as u8
    }

    /// Write the 16-byte wire form (big-endian).
    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.top_ver);
        buf.put_u64(self.order);
        buf.put_u32(self.node_order_dr_id);
    }

    /// Read the 16-byte wire form (big-endian).
    pub fn read_from(buf: &mut impl Buf) -> Self {
        let top_ver = buf.get_u32();
        let order = buf.get_u64();
        let node_order_dr_id = buf.get_u32();
        Self {
            top_ver,
            order,
            node_order_dr_id,
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.top_ver
            .cmp(&other.top_ver)
            .then_with(|| self.order.cmp(&other.order))
            .then_with(|| self.node_order().cmp(&other.node_order()))
            .then_with(|| self.data_center_id().cmp(&other.data_center_id()))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "v{}.{}.{}@dc{}",
            self.top_ver,
            self.order,
            self.node_order(),
            self.data_center_id()
        )
    }
}

/// Atomic-cache version comparator.
///
/// Updates originating in the same datacenter follow the natural numeric
/// order; updates from different datacenters are ordered by datacenter id.
pub fn atomic_version_cmp(one: &Version, other: &Version) -> Ordering {
    let dc = one.data_center_id().cmp(&other.data_center_id());
    if dc != Ordering::Equal {
        return dc;
    }
    one.top_ver
        .cmp(&other.top_ver)
        .then_with(|| one.order.cmp(&other.order))
        .then_with(|| one.node_order().cmp(&other.node_order()))
}

/// A version stamp plus the optional cross-datacenter conflict stamp folded
/// into it by conflict-aware updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryVersion {
    /// The write version proper.
    pub stamp: Version,

    /// Conflict stamp carried by DR updates, if any.
    pub conflict: Option<Version>,
}

impl EntryVersion {
    /// Wrap a plain stamp with no conflict information.
    pub const fn new(stamp: Version) -> Self {
        Self {
            stamp,
            conflict: None,
        }
    }

    /// The start entry version.
    pub const fn start() -> Self {
        Self::new(Version::start())
    }

    /// Fold a conflict stamp into a write version. A `None` conflict leaves
    /// the stamp plain.
    pub fn with_conflict(stamp: Version, conflict: Option<Version>) -> Self {
        Self { stamp, conflict }
    }

    /// The stamp used for cross-datacenter conflict comparison: the folded
    /// conflict stamp when present, otherwise the write stamp itself.
    pub fn conflict_version(&self) -> Version {
        self.conflict.unwrap_or(self.stamp)
    }

    /// Check whether this is the start version.
    pub fn is_start(&self) -> bool {
        self.stamp.is_start()
    }
}

impl From<Version> for EntryVersion {
    fn from(stamp: Version) -> Self {
        Self::new(stamp)
    }
}

impl std::fmt::Display for EntryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.conflict {
            Some(conflict) => write!(f, "{}(conflict {})", self.stamp, conflict),
            None => write!(f, "{}", self.stamp),
        }
    }
}

/// Generator of version stamps for a single node.
///
/// The order component increases monotonically; load-generated versions use
/// the same sequence so that every stamp handed out is unique.
pub struct VersionSource {
    node_order: u32,
    data_center_id: u8,
    top_ver: AtomicU32,
    order: AtomicU64,
}

impl VersionSource {
    /// Create a version source for a node.
    pub fn new(node_order: u32, data_center_id: u8) -> Self {
        Self {
            node_order,
            data_center_id,
            top_ver: AtomicU32::new(1),
            order: AtomicU64::new(0),
        }
    }

    /// Update the topology epoch stamped into new versions.
    pub fn on_topology_changed(&self, top_ver: u32) {
        self.top_ver.store(top_ver, AtomicOrdering::SeqCst);
    }

    /// Generate the next version stamp.
    pub fn next(&self) -> Version {
        let order = self.order.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        Version::new(
            self.top_ver.load(AtomicOrdering::SeqCst),
            order,
            self.node_order,
            self.data_center_id,
        )
    }

    /// Generate a version for a store-loaded value. Guaranteed greater than
    /// the given current version in the natural order.
    pub fn next_for_load(&self, current: &Version) -> Version {
        loop {
            let candidate = self.next();
            if candidate > *current {
                return candidate;
            }
            // Current stamp is from a later epoch; catch the counter up.
            let _ = self.order.fetch_max(current.order, AtomicOrdering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn start_version_is_zero() {
        assert!(Version::start().is_start());
        assert!(!Version::new(1, 1, 1, 0).is_start());
    }

    #[test]
    fn packs_node_order_and_dc_id() {
        let ver = Version::new(3, 42, 0x00AB_CDEF, 9);
        assert_eq!(ver.node_order(), 0x00AB_CDEF);
        assert_eq!(ver.data_center_id(), 9);
    }

    #[test]
    fn natural_order() {
        let a = Version::new(1, 5, 1, 0);
        let b = Version::new(1, 6, 1, 0);
        let c = Version::new(2, 1, 1, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn atomic_order_ranks_dc_first() {
        let dc1_new = Version::new(5, 100, 1, 1);
        let dc2_old = Version::new(1, 1, 1, 2);
        assert_eq!(atomic_version_cmp(&dc1_new, &dc2_old), Ordering::Less);

        let same_dc_old = Version::new(1, 1, 1, 1);
        assert_eq!(
            atomic_version_cmp(&dc1_new, &same_dc_old),
            Ordering::Greater
        );
    }

    #[test]
    fn wire_round_trip() {
        let ver = Version::new(7, 0xDEAD_BEEF, 123, 4);
        let mut buf = BytesMut::new();
        ver.write_to(&mut buf);
        assert_eq!(buf.len(), Version::WIRE_SIZE);
        let back = Version::read_from(&mut buf.freeze());
        assert_eq!(ver, back);
    }

    #[test]
    fn conflict_version_falls_back_to_stamp() {
        let stamp = Version::new(1, 2, 3, 0);
        let conflict = Version::new(1, 9, 3, 2);
        assert_eq!(EntryVersion::new(stamp).conflict_version(), stamp);
        assert_eq!(
            EntryVersion::with_conflict(stamp, Some(conflict)).conflict_version(),
            conflict
        );
    }

    #[test]
    fn source_is_monotone() {
        let source = VersionSource::new(1, 0);
        let a = source.next();
        let b = source.next();
        assert!(b > a);

        let ahead = Version::new(1, 1000, 1, 0);
        let load = source.next_for_load(&ahead);
        assert!(load > ahead);
    }
}

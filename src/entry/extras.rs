//! Compact storage for rarely-present entry fields.
//!
//! Most entries are eternal, unlocked, and live; the TTL pair, the lock
//! candidate list, and the obsolete marker are therefore kept behind one
//! optional boxed record that is dropped as soon as every field returns to
//! its default.

use crate::core::time::{EXPIRE_TIME_ETERNAL, TTL_ETERNAL};
use crate::entry::mvcc::MvccList;
use crate::entry::version::Version;

/// The rarely-present entry fields.
#[derive(Debug, Clone, Default)]
pub struct EntryExtras {
    /// Time-to-live in milliseconds; 0 means eternal.
    pub ttl: u64,

    /// Absolute expire time in milliseconds; 0 means eternal.
    pub expire_time: u64,

    /// Lock candidate list, present while any lock is claimed.
    pub mvcc: Option<MvccList>,

    /// Terminal tombstone marker. Once set, no mutation ever succeeds.
    pub obsolete: Option<Version>,
}

impl EntryExtras {
    fn is_empty(&self) -> bool {
        self.ttl == TTL_ETERNAL
            && self.expire_time == EXPIRE_TIME_ETERNAL
            && self.mvcc.as_ref().is_none_or(|m| m.is_empty())
            && self.obsolete.is_none()
    }
}

/// Slot holding the optional extras record of one entry.
#[derive(Debug, Clone, Default)]
pub struct ExtrasSlot(Option<Box<EntryExtras>>);

impl ExtrasSlot {
    /// An empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// TTL in milliseconds; eternal when no extras are present.
    pub fn ttl(&self) -> u64 {
        self.0.as_ref().map_or(TTL_ETERNAL, |e| e.ttl)
    }

    /// Expire time in milliseconds; eternal when no extras are present.
    pub fn expire_time(&self) -> u64 {
        self.0.as_ref().map_or(EXPIRE_TIME_ETERNAL, |e| e.expire_time)
    }

    /// Store the TTL pair, materializing or dropping the record as needed.
    pub fn set_ttl_and_expire_time(&mut self, ttl: u64, expire_time: u64) {
        match &mut self.0 {
            Some(extras) => {
                extras.ttl = ttl;
                extras.expire_time = expire_time;
            }
            None => {
                if ttl != TTL_ETERNAL || expire_time != EXPIRE_TIME_ETERNAL {
                    self.0 = Some(Box::new(EntryExtras {
                        ttl,
                        expire_time,
                        ..EntryExtras::default()
                    }));
                }
            }
        }
        self.compact();
    }

    /// The lock candidate list, if present and non-empty.
    pub fn mvcc(&self) -> Option<&MvccList> {
        self.0
            .as_ref()
            .and_then(|e| e.mvcc.as_ref())
            .filter(|m| !m.is_empty())
    }

    /// Mutable access to the lock candidate list, creating it on demand.
    pub fn mvcc_mut(&mut self) -> &mut MvccList {
        let extras = self.0.get_or_insert_with(Default::default);
        extras.mvcc.get_or_insert_with(MvccList::new)
    }

    /// Drop an emptied lock candidate list and compact the slot.
    pub fn release_mvcc(&mut self) {
        if let Some(extras) = &mut self.0 {
            if extras.mvcc.as_ref().is_some_and(|m| m.is_empty()) {
                extras.mvcc = None;
            }
        }
        self.compact();
    }

    /// The obsolete marker, if set.
    pub fn obsolete_version(&self) -> Option<Version> {
        self.0.as_ref().and_then(|e| e.obsolete)
    }

    /// Set the terminal obsolete marker.
    pub fn set_obsolete_version(&mut self, version: Version) {
        let extras = self.0.get_or_insert_with(Default::default);
        extras.obsolete = Some(version);
    }

    fn compact(&mut self) {
        if self.0.as_ref().is_some_and(|e| e.is_empty()) {
            self.0 = None;
        }
    }

    /// Approximate heap footprint of the extras record.
    pub fn size(&self) -> usize {
        match &self.0 {
            None => 0,
            Some(extras) => {
                std::mem::size_of::<EntryExtras>()
                    + extras
                        .mvcc
                        .as_ref()
                        .map_or(0, |m| m.len() * std::mem::size_of::<crate::entry::mvcc::MvccCandidate>())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slot_reads_eternal() {
        let slot = ExtrasSlot::new();
        assert_eq!(slot.ttl(), TTL_ETERNAL);
        assert_eq!(slot.expire_time(), EXPIRE_TIME_ETERNAL);
        assert!(slot.mvcc().is_none());
        assert!(slot.obsolete_version().is_none());
        assert_eq!(slot.size(), 0);
    }

    #[test]
    fn slot_drops_when_all_fields_default() {
        let mut slot = ExtrasSlot::new();
        slot.set_ttl_and_expire_time(500, 1500);
        assert_eq!(slot.ttl(), 500);
        assert!(slot.size() > 0);

        slot.set_ttl_and_expire_time(TTL_ETERNAL, EXPIRE_TIME_ETERNAL);
        assert_eq!(slot.size(), 0);
    }

    #[test]
    fn empty_mvcc_reads_as_absent() {
        let mut slot = ExtrasSlot::new();
        let ver = Version::new(1, 1, 1, 0);
        slot.mvcc_mut().add_local(1, 1, ver, false);
        assert!(slot.mvcc().is_some());

        slot.mvcc_mut().remove_version(&ver);
        assert!(slot.mvcc().is_none());
        slot.release_mvcc();
        assert_eq!(slot.size(), 0);
    }

    #[test]
    fn obsolete_marker_survives_ttl_reset() {
        let mut slot = ExtrasSlot::new();
        slot.set_obsolete_version(Version::new(1, 9, 1, 0));
        slot.set_ttl_and_expire_time(TTL_ETERNAL, EXPIRE_TIME_ETERNAL);
        assert!(slot.obsolete_version().is_some());
    }
}

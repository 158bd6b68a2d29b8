//! Performance-statistics operation types.
//!
//! Operation identifiers are persisted in performance-statistics files and
//! are part of the on-disk contract: the byte ids and the record sizes they
//! imply must never change.

/// Performance statistics operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationType {
    /// Cache get.
    CacheGet = 0,
    /// Cache put.
    CachePut = 1,
    /// Cache remove.
    CacheRemove = 2,
    /// Cache get and put.
    CacheGetAndPut = 3,
    /// Cache get and remove.
    CacheGetAndRemove = 4,
    /// Cache invoke.
    CacheInvoke = 5,
    /// Cache lock.
    CacheLock = 6,
    /// Cache get all.
    CacheGetAll = 7,
    /// Cache put all.
    CachePutAll = 8,
    /// Cache remove all.
    CacheRemoveAll = 9,
    /// Cache invoke all.
    CacheInvokeAll = 10,
    /// Transaction commit.
    TxCommit = 11,
    /// Transaction rollback.
    TxRollback = 12,
    /// Query.
    Query = 13,
    /// Query reads.
    QueryReads = 14,
    /// Task.
    Task = 15,
    /// Job.
    Job = 16,
    /// Cache start.
    CacheStart = 17,
    /// Checkpoint.
    Checkpoint = 18,
    /// Pages write throttle.
    PagesWriteThrottle = 19,
    /// Count of rows processed by query.
    QueryRows = 20,
    /// Custom query property.
    QueryProperty = 21,
    /// Cache put all conflict.
    CachePutAllConflict = 22,
    /// Cache remove all conflict.
    CacheRemoveAllConflict = 23,
    /// System view schema.
    SystemViewSchema = 24,
    /// System view row.
    SystemViewRow = 25,
    /// Statistics format version.
    Version = 255,
}

impl OperationType {
    /// All operation types.
    pub const ALL: [OperationType; 27] = [
        Self::CacheGet,
        Self::CachePut,
        Self::CacheRemove,
        Self::CacheGetAndPut,
        Self::CacheGetAndRemove,
        Self::CacheInvoke,
        Self::CacheLock,
        Self::CacheGetAll,
        Self::CachePutAll,
        Self::CacheRemoveAll,
        Self::CacheInvokeAll,
        Self::TxCommit,
        Self::TxRollback,
        Self::Query,
        Self::QueryReads,
        Self::Task,
        Self::Job,
        Self::CacheStart,
        Self::Checkpoint,
        Self::PagesWriteThrottle,
        Self::QueryRows,
        Self::QueryProperty,
        Self::CachePutAllConflict,
        Self::CacheRemoveAllConflict,
        Self::SystemViewSchema,
        Self::SystemViewRow,
        Self::Version,
    ];

    /// Unique operation identifier.
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Operation type of the given identifier.
    pub fn of(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.id() == id)
    }

    /// Check whether this is a cache operation.
    pub const fn cache_operation(self) -> bool {
        matches!(
            self,
            Self::CacheGet
                | Self::CachePut
                | Self::CacheRemove
                | Self::CacheGetAndPut
                | Self::CacheGetAndRemove
                | Self::CacheInvoke
                | Self::CacheLock
                | Self::CacheGetAll
                | Self::CachePutAll
                | Self::CacheRemoveAll
                | Self::CacheInvokeAll
                | Self::CachePutAllConflict
                | Self::CacheRemoveAllConflict
        )
    }

    /// Check whether this is a transaction operation.
    pub const fn transaction_operation(self) -> bool {
        matches!(self, Self::TxCommit | Self::TxRollback)
    }
}

/// Cache start record size.
pub const fn cache_start_record_size(name_len: usize, cached: bool) -> usize {
    1 + 4 + if cached { 4 } else { 4 + name_len }
}

/// Cache start record size left after reading the name string.
pub const fn read_cache_start_record_size() -> usize {
    cache_start_record_size(0, true) - 1 - 4
}

/// Cache operation record size.
pub const fn cache_record_size() -> usize {
    4 + 8 + 8
}

/// Transaction record size.
pub const fn transaction_record_size(cache_ids_count: usize) -> usize {
    4 + cache_ids_count * 4 + 8 + 8
}

/// Query record size.
pub const fn query_record_size(text_len: usize, cached: bool) -> usize {
    1 + (if cached { 4 } else { 4 + text_len }) + 1 + 8 + 8 + 8 + 1
}

/// Query record size left after reading the text string.
pub const fn read_query_record_size() -> usize {
    query_record_size(0, true) - 1 - 4
}

/// Query reads record size.
pub const fn query_reads_record_size() -> usize {
    1 + 16 + 8 + 8 + 8
}

/// Query rows record size.
pub const fn query_rows_record_size(action_len: usize, cached: bool) -> usize {
    1 + (if cached { 4 } else { 4 + action_len }) + 1 + 16 + 8 + 8
}

/// Query property record size.
pub const fn query_property_record_size(
    name_len: usize,
    name_cached: bool,
    val_len: usize,
    val_cached: bool,
) -> usize {
    1 + (if name_cached { 4 } else { 4 + name_len })
        + 1
        + (if val_cached { 4 } else { 4 + val_len })
        + 1
        + 16
        + 8
}

/// Task record size.
pub const fn task_record_size(name_len: usize, cached: bool) -> usize {
    1 + (if cached { 4 } else { 4 + name_len }) + 24 + 8 + 8 + 4
}

/// Job record size.
pub const fn job_record_size() -> usize {
    24 + 8 + 8 + 8 + 1
}

/// Checkpoint record size.
pub const fn checkpoint_record_size() -> usize {
    8 * 13 + 4 * 3
}

/// Statistics format version record size.
pub const fn version_record_size() -> usize {
    2
}

/// Pages write throttle record size.
pub const fn pages_write_throttle_record_size() -> usize {
    8 + 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_stable() {
        assert_eq!(OperationType::CacheGet.id(), 0);
        assert_eq!(OperationType::CachePut.id(), 1);
        assert_eq!(OperationType::CacheRemove.id(), 2);
        assert_eq!(OperationType::CacheInvoke.id(), 5);
        assert_eq!(OperationType::TxCommit.id(), 11);
        assert_eq!(OperationType::TxRollback.id(), 12);
        assert_eq!(OperationType::Checkpoint.id(), 18);
        assert_eq!(OperationType::SystemViewRow.id(), 25);
        assert_eq!(OperationType::Version.id(), 255);
    }

    #[test]
    fn ids_are_unique() {
        let ids: HashSet<u8> = OperationType::ALL.iter().map(|op| op.id()).collect();
        assert_eq!(ids.len(), OperationType::ALL.len());
    }

    #[test]
    fn lookup_by_id() {
        for op in OperationType::ALL {
            assert_eq!(OperationType::of(op.id()), Some(op));
        }
        assert_eq!(OperationType::of(26), None);
    }

    #[test]
    fn operation_classes() {
        assert!(OperationType::CacheGet.cache_operation());
        assert!(OperationType::CachePutAllConflict.cache_operation());
        assert!(!OperationType::TxCommit.cache_operation());
        assert!(OperationType::TxCommit.transaction_operation());
        assert!(!OperationType::Query.transaction_operation());
    }

    #[test]
    fn record_sizes() {
        assert_eq!(cache_record_size(), 20);
        assert_eq!(transaction_record_size(2), 28);
        assert_eq!(checkpoint_record_size(), 116);
        assert_eq!(version_record_size(), 2);
        assert_eq!(pages_write_throttle_record_size(), 16);
        assert_eq!(job_record_size(), 49);
        assert_eq!(query_reads_record_size(), 41);
        assert_eq!(cache_start_record_size(10, false), 19);
        assert_eq!(cache_start_record_size(10, true), 9);
    }
}

//! Tests for cache-level collaborators: configuration, counters, events,
//! and entry lifecycle supplements (preload installs, invalidate, clear).

mod common;

use common::{key, set_args, val, ver, TestCache};
use std::sync::Arc;
use trellis::cache::context::CacheCapabilities;
use trellis::cache::events::EventType;
use trellis::core::config::{Config, ENTRY_LOCK_TIMEOUT_ENV};
use trellis::ops::dr::{DrType, TopologyVersion};
use trellis::ops::stats::{cache_record_size, OperationType};
use trellis::storage::wal::RecordFlags;

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn env_override_freezes_lock_timeout() {
    std::env::set_var(ENTRY_LOCK_TIMEOUT_ENV, "250");
    let config = Config::from_toml(
        r#"
[cache]
name = "env"
cache_id = 1
"#,
    )
    .unwrap();
    std::env::remove_var(ENTRY_LOCK_TIMEOUT_ENV);

    assert_eq!(config.entry.lock_timeout_ms, 250);

    // The override was read once; later loads see the default again.
    let config = Config::from_toml(
        r#"
[cache]
name = "env"
cache_id = 1
"#,
    )
    .unwrap();
    assert_eq!(config.entry.lock_timeout_ms, 1000);
}

// ============================================================================
// Update counters
// ============================================================================

#[test]
fn counters_advance_per_partition() {
    let t = TestCache::plain();
    assert_eq!(t.ctx.next_partition_counter(0, None), 1);
    assert_eq!(t.ctx.next_partition_counter(0, None), 2);
    assert_eq!(t.ctx.next_partition_counter(3, None), 1);
    assert_eq!(t.ctx.partition_counter(0), 2);
}

#[test]
fn externally_assigned_counter_sets_the_high_water() {
    let t = TestCache::plain();
    assert_eq!(t.ctx.next_partition_counter(0, Some(40)), 40);
    // A lower replayed counter does not move the high water back.
    assert_eq!(t.ctx.next_partition_counter(0, Some(10)), 10);
    assert_eq!(t.ctx.next_partition_counter(0, None), 41);
}

// ============================================================================
// Stable identifiers
// ============================================================================

#[test]
fn event_and_operation_ids_are_frozen() {
    assert_eq!(EventType::Put.id(), 63);
    assert_eq!(EventType::Read.id(), 64);
    assert_eq!(EventType::Removed.id(), 65);
    assert_eq!(EventType::Locked.id(), 66);
    assert_eq!(EventType::Unlocked.id(), 67);
    assert_eq!(EventType::Expired.id(), 70);

    assert_eq!(OperationType::CacheGet.id(), 0);
    assert_eq!(OperationType::CachePut.id(), 1);
    assert_eq!(OperationType::TxCommit.id(), 11);
    assert_eq!(OperationType::Checkpoint.id(), 18);
    assert_eq!(OperationType::Version.id(), 255);
    assert_eq!(cache_record_size(), 20);
}

// ============================================================================
// Preload installs
// ============================================================================

#[test]
fn initial_value_installs_only_on_fresh_entries() {
    let t = TestCache::plain();
    let entry = t.entry("k1");

    let installed = entry
        .initial_value(
            &t.ctx,
            val("preloaded"),
            ver(5),
            0,
            None,
            true,
            DrType::Preload,
            TopologyVersion::initial(),
        )
        .unwrap();
    assert!(installed);
    assert_eq!(entry.raw_get(), Some(val("preloaded")));
    assert_eq!(entry.version().unwrap(), ver(5));

    // A preload with an older stamp loses.
    let installed = entry
        .initial_value(
            &t.ctx,
            val("older"),
            ver(3),
            0,
            None,
            true,
            DrType::Preload,
            TopologyVersion::initial(),
        )
        .unwrap();
    assert!(!installed);
    assert_eq!(entry.raw_get(), Some(val("preloaded")));

    // A newer preload stamp wins.
    let installed = entry
        .initial_value(
            &t.ctx,
            val("newer"),
            ver(9),
            0,
            None,
            true,
            DrType::Preload,
            TopologyVersion::initial(),
        )
        .unwrap();
    assert!(installed);
    assert_eq!(entry.raw_get(), Some(val("newer")));
}

#[test]
fn preload_records_carry_the_preload_flag() {
    let t = TestCache::plain();
    let entry = t.entry("k1");

    entry
        .initial_value(
            &t.ctx,
            val("preloaded"),
            ver(5),
            0,
            None,
            true,
            DrType::Preload,
            TopologyVersion::initial(),
        )
        .unwrap();

    let records = t.wal.read_records().unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].flags.contains(RecordFlags::PRELOAD));
}

// ============================================================================
// Invalidate and clear
// ============================================================================

#[test]
fn invalidate_clears_the_value_and_advances_the_version() {
    let t = TestCache::plain();
    let entry = t.entry("k1");
    entry.inner_set(&t.ctx, set_args(val("v1"))).unwrap();

    entry.invalidate(&t.ctx, ver(50)).unwrap();
    assert!(entry.raw_get().is_none());
    assert_eq!(entry.version().unwrap(), ver(50));
    assert!(!entry.obsolete());
}

#[test]
fn clear_refuses_while_readers_exist() {
    let t = TestCache::build_with_caps(
        r#"
[cache]
name = "dht"
cache_id = 1
partitions = 4
"#,
        CacheCapabilities {
            is_dht: true,
            track_readers: true,
            ..CacheCapabilities::default()
        },
    );
    let entry = t.entry("k1");
    entry.inner_set(&t.ctx, set_args(val("v1"))).unwrap();
    entry.add_reader(9).unwrap();

    assert!(!entry.clear(&t.ctx, ver(50), false).unwrap());
    assert!(!entry.obsolete());

    assert!(entry.clear(&t.ctx, ver(50), true).unwrap());
    assert!(entry.obsolete());
    assert!(t.ctx.row_store().read(1, &key("k1")).is_none());
}

#[test]
fn mark_obsolete_if_empty_needs_an_empty_entry() {
    let t = TestCache::plain();
    let entry = t.entry("k1");

    entry.inner_set(&t.ctx, set_args(val("v1"))).unwrap();
    assert!(!entry.mark_obsolete_if_empty(&t.ctx, None).unwrap());

    let empty = t.entry("k2");
    assert!(empty.mark_obsolete_if_empty(&t.ctx, None).unwrap());
    assert!(empty.obsolete());
}

// ============================================================================
// Deferred-delete queue
// ============================================================================

#[test]
fn queue_consumer_completes_tombstones() {
    let t = TestCache::deferred();
    let entry = Arc::new(t.entry("k1"));

    entry.inner_set(&t.ctx, set_args(val("v1"))).unwrap();
    entry
        .inner_remove(&t.ctx, common::remove_args())
        .unwrap();

    for (queued_key, queued_ver) in t.queue.drain() {
        assert_eq!(queued_key, key("k1"));
        assert!(entry.mark_obsolete_version(&t.ctx, queued_ver).unwrap());
    }

    assert!(entry.obsolete());
}

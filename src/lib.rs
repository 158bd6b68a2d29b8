//! Trellis - per-key cache entry engine for a distributed in-memory
//! key/value store.
//!
//! Trellis implements the state machine that governs a single logical
//! entry's lifetime: its value, version, expiration, tombstoning, and the
//! atomic/transactional update protocols that mutate it. Discovery,
//! rebalancing, transaction coordination, and replication transport are
//! external collaborators consumed through narrow interfaces.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Callers                               │
//! │     atomic updates  │  transaction manager  │  TTL tracker      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Entry State Machine                        │
//! │   value │ version │ extras │ MVCC candidates │ tombstone flags  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Storage Layer                             │
//! │          row store (per-partition latches) │ WAL                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error types
//! - [`core::time`] - Time sources and TTL sentinels
//!
//! ## Cache
//! - [`cache::context`] - Per-cache context handle
//! - [`cache::events`] - Event emission and listener plumbing
//! - [`cache::interceptor`] - User interceptor hooks
//! - [`cache::store`] - External store and platform-cache interfaces
//! - [`cache::deferred`] - Deferred-delete queue
//!
//! ## Entry
//! - [`entry::entry`] - The entry state machine
//! - [`entry::atomic`] - Atomic update closure
//! - [`entry::version`] - Version stamps and comparators
//! - [`entry::value`] - Opaque values and keys
//! - [`entry::extras`] - Compact rarely-present fields
//! - [`entry::mvcc`] - Lock candidate list
//! - [`entry::expiry`] - Expiration policy
//!
//! ## Storage
//! - [`storage::row`] - Row store
//! - [`storage::wal`] - Write-ahead log
//!
//! ## Operations
//! - [`ops::stats`] - Performance-statistics operation types
//! - [`ops::dr`] - Cross-datacenter replication hooks
//!
//! # Key Invariants
//!
//! - Successful mutations produce strictly increasing versions per entry
//! - After any mutation, the stored row matches the in-memory projection
//! - An obsolete entry absorbs every operation with an entry-removed result
//! - Per key: WAL order ≡ version order ≡ row mutation order
//! - The lock candidate list has at most one non-reentrant owner

// Core infrastructure
pub mod core;

// Cache-level collaborators
pub mod cache;

// The entry engine
pub mod entry;

// Storage layer
pub mod storage;

// Operational concerns
pub mod ops;

// Re-exports for convenience
pub use self::core::{config, error, time};
pub use cache::{context, deferred, events, interceptor, store};
pub use entry::{atomic, expiry, extras, mvcc, value, version};
pub use ops::{dr, stats};
pub use storage::{row, wal};

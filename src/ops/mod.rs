//! Operational concerns: performance-statistics types and cross-datacenter
//! replication hooks.

pub mod dr;
pub mod stats;

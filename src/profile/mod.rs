//! Profile Aggregator
//!
//! On-demand fan-out/fan-in snapshot of tasks and models across the cluster.

pub mod aggregator;
pub mod handlers;
pub mod types;

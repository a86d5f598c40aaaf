//! Sync Module
//!
//! Periodic reconciliation of routing and task state against what nodes
//! actually report.
//!
//! ## Submodules
//! - **`reconciler`**: The pass itself and its background loop.
//! - **`handlers`**: `/internal/sync` (node state) and the public `/sync` trigger.
//! - **`types`**: Node reports and the pass summary.

pub mod handlers;
pub mod reconciler;
pub mod types;

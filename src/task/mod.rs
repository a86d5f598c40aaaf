//! Task Registry Module
//!
//! Tracks load/unload jobs through their lifecycle.
//!
//! ## Submodules
//! - **`types`**: Task record, state machine and partial updates.
//! - **`registry`**: Per-node cache with per-task update locks and write-through
//!   to the artifact store.

pub mod registry;
pub mod types;

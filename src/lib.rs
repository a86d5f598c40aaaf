//! Model Distribution Cluster Library
//!
//! Core of a cluster that spreads trained model artifacts over its nodes,
//! loads them into each node's runtime, and keeps track of where every model
//! is loaded. The binary (`main.rs`) wires these modules into a node process.
//!
//! ## Architecture Modules
//!
//! - **`membership`**: UDP gossip (SWIM-like) discovery and failure detection,
//!   node roles and groups.
//! - **`placement`**: Decides which nodes may host a model.
//! - **`task`**: Task lifecycle and the per-node task registry.
//! - **`chunk`**: Splitting artifacts into chunks and reassembling them on a worker.
//! - **`dispatch`**: Coordinator/worker protocol for loading and unloading models.
//! - **`routing`**: Which nodes serve which model.
//! - **`sync`**: Periodic reconciliation of routing and tasks against node reports.
//! - **`profile`**: Cluster-wide read-only snapshot.
//! - **`store`** / **`runtime`** / **`transport`**: The seams to the artifact
//!   store, the model runtime and the other nodes.

pub mod chunk;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod membership;
pub mod node;
pub mod placement;
pub mod profile;
pub mod routing;
pub mod runtime;
pub mod server;
pub mod store;
pub mod sync;
pub mod task;
pub mod transport;

#[cfg(test)]
mod testing;

//! Dispatch Module
//!
//! Load and unload orchestration. The node that receives a client request
//! coordinates the task; the nodes it selects are its workers.
//!
//! ## Submodules
//! - **`service`**: `ModelDispatcher`, both sides of the protocol.
//! - **`handlers`**: Internal worker endpoints and the public model/task API.
//! - **`protocol`**: Messages and public request bodies.

pub mod handlers;
pub mod protocol;
pub mod service;

#[cfg(test)]
mod tests;

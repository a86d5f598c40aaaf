//! Chunked Transfer Engine
//!
//! Splits model payloads into fixed-size chunks for the store and rebuilds
//! them into a single local artifact on worker nodes.

pub mod retriever;
pub mod splitter;
pub mod types;

//! Membership & Discovery Module
//!
//! Gossip-based membership (inspired by SWIM) that tells every other component
//! which nodes exist, what roles they declare, and whether they are alive.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Nodes periodically exchange full member records over UDP.
//! - **Failure Detection**: "Suspect" -> "Dead" transitions driven by timeouts.
//! - **Incarnation Numbers**: Resolve disputed Alive/Suspect claims.
//! - **Events**: Joins and deaths are published on a broadcast channel so the
//!   sync reconciler can react to topology changes.

pub mod provider;
pub mod service;
pub mod types;

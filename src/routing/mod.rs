//! Model routing table: which workers hold a loaded copy of each model.
//!
//! Best-effort and eventually consistent. Forward messages add and remove
//! entries; the sync reconciler repairs drift.

pub mod table;

pub use table::RoutingTable;

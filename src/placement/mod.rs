//! Node Eligibility Module
//!
//! Decides which live nodes may host a model. Pure functions over the current
//! membership view; no I/O.

pub mod selector;

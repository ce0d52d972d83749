//! Observability
//!
//! Structured audit events for every evaluation.

pub mod audit;

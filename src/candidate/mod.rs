//! Candidate contract and loader.
//!
//! The contract fixes the entry point name and return-word width; the loader
//! resolves a compiled artifact against it or reports a [`LinkError`].

pub mod contract;
pub mod loader;

pub use contract::{Candidate, CandidateContract};
pub use loader::{LinkError, LoadedCandidate, Loader};

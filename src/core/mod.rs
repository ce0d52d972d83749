//! Isolated execution core.
//!
//! The supervisor forks one proxy per evaluation. The proxy forks the
//! confined candidate process, watches it and sweeps up whatever it spawned;
//! the probe is what runs inside the candidate process.

pub mod probe;
pub mod proxy;
pub mod supervisor;
pub mod types;

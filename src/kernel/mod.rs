//! Kernel primitives used to confine a candidate process.

pub mod process;
pub mod rlimit;
pub mod signal;

//! Utility modules

pub mod fd_closure;

//! Configuration
//!
//! Harness configuration types, file loading and startup validation.

pub mod config;
pub mod types;
pub mod validator;

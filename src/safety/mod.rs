//! Safety and cleanup
//!
//! Run-scoped workspaces with guaranteed teardown.

pub mod workspace;

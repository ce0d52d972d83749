//! Fitness computation and outcome classification
//!
//! Both are pure functions over what the supervisor observed.

pub mod fitness;
pub mod verdict;

pub use fitness::{FitnessScore, PopcountMethod};
pub use verdict::{Verdict, VerdictClassifier};

//! fitbox: a sandboxed population-count fitness harness
//! Scores untrusted candidate routines by the number of set bits in the word they return
//!
//! # Architecture
//!
//! Link failures are decided in the harness by reading the artifact as data.
//! Everything else runs under a freshly forked supervising proxy, which
//! forks the confined candidate process, enforces the wall budget and kills
//! whatever the candidate spawned before it reports back.
//!
//! ## Candidate Contract ([`candidate`])
//! - [`candidate::contract`]: Entry point, word width and the [`candidate::Candidate`] trait
//! - [`candidate::loader`]: Static link check, dynamic-unit resolution and link errors
//!
//! ## Isolated Execution ([`core`])
//! - [`core::supervisor`]: Harness side: pipes, setup handshake, outer watchdog
//! - [`core::proxy`]: Candidate watchdog and descendant sweep
//! - [`core::probe`]: Candidate-side hardening and report transfer
//! - [`core::types`]: Limits, reports and outcomes
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::process`]: Process group, parent-death signal, subreaper, signal dispositions
//! - [`kernel::rlimit`]: Resource limits for the candidate
//! - [`kernel::signal`]: Harness termination handling
//!
//! ## Fitness & Verdict ([`verdict`])
//! - [`verdict::fitness`]: Population count scoring
//! - [`verdict::verdict`]: Outcome classification
//!
//! ## Evaluation & Reporting
//! - [`evaluator`]: End-to-end evaluation of one candidate
//! - [`reporter`]: Caller-visible output and exit status
//!
//! ## Safety ([`safety`])
//! - [`safety::workspace`]: Run-scoped artifact staging and digest
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured audit events
//!
//! ## Configuration ([`config`])
//! - [`config::config`]: Configuration loading
//! - [`config::validator`]: Startup validation
//! - [`config::types`]: Shared type definitions and closed enums
//!
//! ## Utilities ([`utils`])
//! - [`utils::fd_closure`]: Descriptor hygiene in the child
//!
//! # Design Principles
//!
//! 1. **Total scoring** - Anything that started running gets a score; only link failures do not
//! 2. **Kernel as truth** - Timeouts and faults come from the wait status, not the candidate
//! 3. **Candidate claims are not evidence** - Nothing written by candidate code can produce a link failure or a harness error
//! 4. **Fresh processes per evaluation** - No state or process survives from one candidate to the next
//! 5. **Types prevent errors** - A fitness score can only be built from a masked word

// Candidate Contract
pub mod candidate;

// Isolated execution core
pub mod core;

// Kernel Primitives
pub mod kernel;

// Fitness & Verdict
pub mod verdict;

// Evaluation & Reporting
pub mod evaluator;
pub mod reporter;

// Safety
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI
pub mod cli;

pub use candidate::{Candidate, CandidateContract, LinkError};
pub use config::types::{
    EntryPoint, EvaluationResult, EvaluationStatus, FitboxError, HarnessConfig, Result, WordWidth,
};
pub use evaluator::Evaluator;
pub use reporter::{HarnessExit, ReportFormat, Reporter};
pub use verdict::{FitnessScore, PopcountMethod};

use crate::candidate::LinkError;
use crate::config::types::HarnessConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits enforced on one isolated invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub wall_time_limit_ms: u64,
    pub cpu_time_limit_secs: u64,
    pub memory_limit: Option<u64>,
    pub process_limit: Option<u32>,
    pub file_size_limit: Option<u64>,
    pub core_limit: Option<u64>,
    pub fd_limit: Option<u64>,
    pub strict_mode: bool,
}

impl ExecutionLimits {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            wall_time_limit_ms: config.wall_time_limit_ms,
            cpu_time_limit_secs: config.cpu_time_limit_secs(),
            memory_limit: config.memory_limit,
            process_limit: config.process_limit,
            file_size_limit: config.file_size_limit,
            core_limit: config.core_limit,
            fd_limit: config.fd_limit,
            strict_mode: config.strict_mode,
        }
    }

    pub fn wall_time_limit(&self) -> Duration {
        Duration::from_millis(self.wall_time_limit_ms)
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

/// Written by the candidate process to the stage pipe after hardening and
/// before any candidate code runs. The harness reads it before releasing
/// the candidate, so nothing the candidate does can alter it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupReport {
    /// Sandbox could not be set up; not the candidate's fault
    pub setup_error: Option<String>,
    /// Controls that were skipped in permissive mode
    pub setup_warnings: Vec<String>,
}

/// Candidate->harness payload transferred through the report pipe.
///
/// Candidate code shares the process that writes it, so every field is a
/// claim by the candidate rather than evidence.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeReport {
    /// Zero-extended word returned by the candidate
    pub word: Option<u64>,
    /// Loader disagreed with the static link check after the unit was opened
    pub link_error: Option<LinkError>,
    /// Candidate unwound with a Rust panic
    pub panic_message: Option<String>,
    /// Time spent inside the candidate call
    pub invoke_time_us: u64,
}

impl ProbeReport {
    pub fn returned(word: u64, invoke_time_us: u64) -> Self {
        Self {
            word: Some(word),
            invoke_time_us,
            ..Self::default()
        }
    }

    pub fn link_failed(err: LinkError) -> Self {
        Self {
            link_error: Some(err),
            ..Self::default()
        }
    }
}

/// How a process left, as seen by waitpid.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitOutcome {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Watchdog escalation record for forced terminations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Written by the supervising process once the candidate and everything it
/// spawned have been killed and reaped.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub candidate_pid: Option<i32>,
    pub wait: WaitOutcome,
    pub timed_out: bool,
    pub wall_time_ms: u64,
    pub kill_report: Option<KillReport>,
    /// Processes the candidate left behind, killed after it exited
    pub reaped_descendants: u32,
    pub warnings: Vec<String>,
    /// The supervisor could not run the candidate at all
    pub internal_error: Option<String>,
}

/// Everything the harness observed about one isolated invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub candidate_pid: Option<i32>,
    pub wait: WaitOutcome,
    pub timed_out: bool,
    pub wall_time_ms: u64,
    /// Controls skipped by the supervisor or the candidate process
    pub setup_warnings: Vec<String>,
    /// The supervising process died or its status could not be trusted
    pub supervision_error: Option<String>,
    pub report: Option<ProbeReport>,
    /// Why no report could be decoded
    pub report_error: Option<String>,
    pub kill_report: Option<KillReport>,
    pub reaped_descendants: u32,
}

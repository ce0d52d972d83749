/// Core types shared by the loader, evaluator and reporter
use crate::candidate::LinkError;
use crate::verdict::fitness::{FitnessScore, PopcountMethod};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default entry point every candidate must export.
pub const DEFAULT_ENTRY_POINT: &str = "one_max";

/// Default wall-clock budget for one evaluation.
pub const DEFAULT_WALL_TIME_LIMIT_MS: u64 = 1000;

/// Return-word width agreed between harness and candidate.
///
/// Fixed per harness configuration, never inferred from a candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum WordWidth {
    W32,
    W64,
}

impl WordWidth {
    pub fn bits(self) -> u32 {
        match self {
            Self::W32 => 32,
            Self::W64 => 64,
        }
    }

    /// Mask selecting the low `bits()` bits of a zero-extended word.
    pub fn mask(self) -> u64 {
        match self {
            Self::W32 => u32::MAX as u64,
            Self::W64 => u64::MAX,
        }
    }

    pub fn truncate(self, raw: u64) -> u64 {
        raw & self.mask()
    }
}

impl Default for WordWidth {
    fn default() -> Self {
        Self::W32
    }
}

impl TryFrom<u32> for WordWidth {
    type Error = String;

    fn try_from(bits: u32) -> std::result::Result<Self, Self::Error> {
        match bits {
            32 => Ok(Self::W32),
            64 => Ok(Self::W64),
            other => Err(format!("unsupported word width {other} (expected 32 or 64)")),
        }
    }
}

impl From<WordWidth> for u32 {
    fn from(width: WordWidth) -> Self {
        width.bits()
    }
}

impl FromStr for WordWidth {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bits: u32 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid word width '{s}'"))?;
        Self::try_from(bits)
    }
}

impl fmt::Display for WordWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// Contractually named symbol a candidate exports.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryPoint(String);

impl EntryPoint {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !Self::is_valid_identifier(&name) {
            return Err(FitboxError::Config(format!(
                "entry point '{}' is not a valid C identifier",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid_identifier(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
            _ => return false,
        }
        chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
    }
}

impl Default for EntryPoint {
    fn default() -> Self {
        Self(DEFAULT_ENTRY_POINT.to_string())
    }
}

impl TryFrom<String> for EntryPoint {
    type Error = String;

    fn try_from(name: String) -> std::result::Result<Self, Self::Error> {
        Self::new(name).map_err(|e| e.to_string())
    }
}

impl From<EntryPoint> for String {
    fn from(entry: EntryPoint) -> Self {
        entry.0
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Harness-wide configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Symbol every candidate must export
    pub entry_point: EntryPoint,
    /// Declared return-word width
    pub word_width: WordWidth,
    /// Wall clock budget per evaluation
    pub wall_time_limit_ms: u64,
    /// CPU time budget; derived from the wall budget when unset
    pub cpu_time_limit_ms: Option<u64>,
    /// Address space limit in bytes
    pub memory_limit: Option<u64>,
    /// RLIMIT_NPROC applied to the candidate
    pub process_limit: Option<u32>,
    /// Maximum file size the candidate may write (0 forbids regular file writes)
    pub file_size_limit: Option<u64>,
    /// Core dump size limit in bytes
    pub core_limit: Option<u64>,
    /// Max open files inside the candidate process
    pub fd_limit: Option<u64>,
    /// Parent directory of run-scoped workspaces
    pub runtime_dir: PathBuf,
    /// Copy the artifact into the run workspace before loading it
    pub stage_artifact: bool,
    /// Population count algorithm
    pub popcount: PopcountMethod,
    /// Append audit events as JSON lines to this file
    pub audit_log: Option<PathBuf>,
    /// Strict mode: fail the evaluation if any sandbox control cannot be applied
    pub strict_mode: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            entry_point: EntryPoint::default(),
            word_width: WordWidth::default(),
            wall_time_limit_ms: DEFAULT_WALL_TIME_LIMIT_MS,
            cpu_time_limit_ms: None,
            memory_limit: None,
            process_limit: Some(1),
            file_size_limit: Some(0),
            core_limit: Some(0),
            fd_limit: Some(64),
            runtime_dir: Self::default_runtime_dir(),
            stage_artifact: true,
            popcount: PopcountMethod::default(),
            audit_log: None,
            strict_mode: false,
        }
    }
}

impl HarnessConfig {
    pub fn default_runtime_dir() -> PathBuf {
        std::env::temp_dir().join("fitbox")
    }

    pub fn wall_time_limit(&self) -> Duration {
        Duration::from_millis(self.wall_time_limit_ms)
    }

    /// RLIMIT_CPU works in whole seconds; keep it strictly above the wall budget
    /// so the watchdog, not the kernel, normally decides a timeout.
    pub fn cpu_time_limit_secs(&self) -> u64 {
        let ms = self.cpu_time_limit_ms.unwrap_or(self.wall_time_limit_ms);
        ms.div_ceil(1000) + 1
    }
}

/// Outcome class of one evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    /// Candidate returned a word
    Success,
    /// Entry point could not be resolved
    LinkFailure,
    /// Candidate terminated abnormally
    RuntimeFault,
    /// Candidate exceeded its budget and was killed
    Timeout,
}

impl EvaluationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::LinkFailure => "link_failure",
            Self::RuntimeFault => "runtime_fault",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating one candidate; immutable once built.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub run_id: String,
    pub status: EvaluationStatus,
    /// Returned word masked to `word_width`; `None` if the candidate never returned
    pub raw_word: Option<u64>,
    pub fitness: FitnessScore,
    pub word_width: WordWidth,
    pub entry_point: EntryPoint,
    pub artifact: Option<PathBuf>,
    /// SHA-256 of the artifact bytes
    pub artifact_digest: Option<String>,
    pub wall_time_ms: u64,
    /// Time spent inside the entry point call, as measured around it
    pub invoke_time_us: Option<u64>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Processes the candidate spawned that were still around when it finished
    pub reaped_descendants: u32,
    pub link_error: Option<LinkError>,
    pub detail: Option<String>,
}

/// Custom error types for fitbox
#[derive(Error, Debug)]
pub enum FitboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Sandbox setup error: {0}")]
    Sandbox(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),
}

pub type Result<T> = std::result::Result<T, FitboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_width_parses_only_supported_values() {
        assert_eq!("32".parse::<WordWidth>().unwrap(), WordWidth::W32);
        assert_eq!(" 64 ".parse::<WordWidth>().unwrap(), WordWidth::W64);
        assert!("16".parse::<WordWidth>().is_err());
        assert!("wide".parse::<WordWidth>().is_err());
    }

    #[test]
    fn word_width_truncates_to_declared_bits() {
        assert_eq!(WordWidth::W32.truncate(0x1_FFFF_FFFF), 0xFFFF_FFFF);
        assert_eq!(WordWidth::W64.truncate(u64::MAX), u64::MAX);
    }

    #[test]
    fn entry_point_rejects_non_identifiers() {
        assert!(EntryPoint::new("one_max").is_ok());
        assert!(EntryPoint::new("_darwin2").is_ok());
        assert!(EntryPoint::new("").is_err());
        assert!(EntryPoint::new("2fast").is_err());
        assert!(EntryPoint::new("one-max").is_err());
        assert!(EntryPoint::new("a b").is_err());
    }

    #[test]
    fn config_round_trips_through_json_with_defaults() {
        let config: HarnessConfig =
            serde_json::from_str(r#"{"word_width": 64, "entry_point": "darwin"}"#).unwrap();
        assert_eq!(config.word_width, WordWidth::W64);
        assert_eq!(config.entry_point.as_str(), "darwin");
        assert_eq!(config.wall_time_limit_ms, DEFAULT_WALL_TIME_LIMIT_MS);
        assert!(config.stage_artifact);

        assert!(serde_json::from_str::<HarnessConfig>(r#"{"word_width": 48}"#).is_err());
        assert!(serde_json::from_str::<HarnessConfig>(r#"{"entry_point": "x-y"}"#).is_err());
    }

    #[test]
    fn cpu_limit_stays_above_wall_budget() {
        let mut config = HarnessConfig::default();
        config.wall_time_limit_ms = 1000;
        assert_eq!(config.cpu_time_limit_secs(), 2);
        config.wall_time_limit_ms = 250;
        assert_eq!(config.cpu_time_limit_secs(), 2);
        config.cpu_time_limit_ms = Some(3500);
        assert_eq!(config.cpu_time_limit_secs(), 5);
    }
}

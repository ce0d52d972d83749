// Startup config validation
// Strict mode fails fast with actionable errors; permissive mode logs them.

use crate::config::types::{FitboxError, HarnessConfig, Result};
use crate::utils::fd_closure::RELEASE_FD;

/// Longest wall budget accepted without a warning
const LONG_WALL_BUDGET_MS: u64 = 10 * 60 * 1000;

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate a harness configuration.
///
/// Errors make the configuration unusable and are always returned as
/// `Err`; warnings are returned for the caller to log, and are promoted to
/// errors in strict mode.
pub fn validate_config(config: &HarnessConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(config, &mut result);
    validate_paths(config, &mut result);

    if config.strict_mode && !result.warnings.is_empty() {
        for warning in std::mem::take(&mut result.warnings) {
            result.add_error(warning);
        }
    }

    if !result.is_valid() {
        return Err(FitboxError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_limits(config: &HarnessConfig, result: &mut ValidationResult) {
    if config.wall_time_limit_ms == 0 {
        result.add_error("wall_time_limit_ms cannot be zero".to_string());
    } else if config.wall_time_limit_ms > LONG_WALL_BUDGET_MS {
        result.add_warning(format!(
            "wall_time_limit_ms {} is longer than ten minutes",
            config.wall_time_limit_ms
        ));
    }

    if config.cpu_time_limit_ms == Some(0) {
        result.add_error("cpu_time_limit_ms cannot be zero".to_string());
    }

    if let Some(memory_limit) = config.memory_limit {
        if memory_limit == 0 {
            result.add_error("memory_limit cannot be zero".to_string());
        } else if memory_limit < 1024 * 1024 {
            result.add_warning(format!(
                "memory_limit {} is very low (< 1MB), the candidate may not load",
                memory_limit
            ));
        }
    }

    if config.process_limit == Some(0) {
        result.add_error("process_limit cannot be zero".to_string());
    }

    // Stdio plus the report, stage and release pipes are open when the limit applies.
    if let Some(fd_limit) = config.fd_limit {
        if fd_limit <= RELEASE_FD as u64 {
            result.add_error(format!(
                "fd_limit {} leaves no room for the harness descriptors (up to fd {})",
                fd_limit, RELEASE_FD
            ));
        }
    }
}

fn validate_paths(config: &HarnessConfig, result: &mut ValidationResult) {
    if !config.runtime_dir.is_absolute() {
        result.add_error(format!(
            "runtime_dir must be absolute path: {:?}",
            config.runtime_dir
        ));
    }

    if let Some(ref audit_log) = config.audit_log {
        if audit_log.is_dir() {
            result.add_error(format!("audit_log points at a directory: {:?}", audit_log));
        }
    }
}

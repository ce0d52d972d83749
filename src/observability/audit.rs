/// Evaluation audit trail
///
/// Structured events keyed by run id. Every event goes to the `log` facade
/// on the `fitbox::audit` target; when an audit file is configured it is also
/// appended there as one JSON line.
use crate::config::types::{EvaluationResult, FitboxError, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const AUDIT_TARGET: &str = "fitbox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    EvaluationStart,
    EvaluationEnd,
    LinkFailure,
    RuntimeFault,
    ForcedKill,
    DescendantsKilled,
    ControlDegraded,
    WorkspaceCleanup,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            Self::EvaluationStart | Self::EvaluationEnd | Self::WorkspaceCleanup => AuditSeverity::Low,
            Self::LinkFailure
            | Self::RuntimeFault
            | Self::DescendantsKilled
            | Self::ControlDegraded => AuditSeverity::Medium,
            Self::ForcedKill => AuditSeverity::High,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub run_id: String,
    pub details: String,
    pub artifact: Option<PathBuf>,
    pub artifact_digest: Option<String>,
    pub status: Option<String>,
    pub fitness: Option<u32>,
    pub invoke_time_us: Option<u64>,
    pub process_id: u32,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, run_id: &str, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: chrono::Utc::now(),
            run_id: run_id.to_string(),
            details: details.into(),
            artifact: None,
            artifact_digest: None,
            status: None,
            fitness: None,
            invoke_time_us: None,
            process_id: std::process::id(),
        }
    }

    pub fn with_artifact(mut self, artifact: Option<&Path>, digest: Option<&str>) -> Self {
        self.artifact = artifact.map(Path::to_path_buf);
        self.artifact_digest = digest.map(str::to_string);
        self
    }

    /// Final event of a run, carrying its status and score.
    pub fn evaluation_end(result: &EvaluationResult) -> Self {
        let mut event = Self::new(
            AuditEventType::EvaluationEnd,
            &result.run_id,
            result.detail.clone().unwrap_or_else(|| "evaluation complete".to_string()),
        )
        .with_artifact(result.artifact.as_deref(), result.artifact_digest.as_deref());
        event.status = Some(result.status.to_string());
        event.fitness = Some(result.fitness.value());
        event.invoke_time_us = result.invoke_time_us;
        event
    }
}

/// Sink for audit events
pub struct AuditLogger {
    file: Option<Mutex<File>>,
}

impl AuditLogger {
    /// Logger that only uses the `log` facade.
    pub fn log_only() -> Self {
        Self { file: None }
    }

    /// Logger that also appends JSON lines to `path`.
    pub fn with_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    FitboxError::Config(format!("Failed to create audit log directory: {}", e))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FitboxError::Config(format!("Failed to open audit log {}: {}", path.display(), e)))?;

        Ok(Self {
            file: Some(Mutex::new(file)),
        })
    }

    pub fn from_config(audit_log: Option<&Path>) -> Result<Self> {
        match audit_log {
            Some(path) => Self::with_file(path),
            None => Ok(Self::log_only()),
        }
    }

    pub fn log_event(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(target: AUDIT_TARGET, "unserializable audit event {:?}: {}", event.event_type, e);
                return;
            }
        };

        match event.severity {
            AuditSeverity::High => warn!(target: AUDIT_TARGET, "{}", line),
            AuditSeverity::Medium | AuditSeverity::Low => info!(target: AUDIT_TARGET, "{}", line),
        }

        if let Some(file) = &self.file {
            match file.lock() {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{}", line).and_then(|_| file.flush()) {
                        warn!(target: AUDIT_TARGET, "Failed to write audit log: {}", e);
                    }
                }
                Err(_) => warn!(target: AUDIT_TARGET, "Audit log lock poisoned"),
            }
        }
    }
}

/// Candidate evaluation
///
/// Ties the pieces together: pre-flight, workspace staging, the static link
/// check, isolated load and invocation, classification, scoring and audit. Each call is independent;
/// nothing a candidate does survives into the next evaluation.
use crate::candidate::{Candidate, CandidateContract, LinkError, Loader};
use crate::config::types::{EvaluationResult, EvaluationStatus, HarnessConfig, Result};
use crate::config::validator::validate_config;
use crate::core::supervisor::supervise;
use crate::core::types::{ExecutionLimits, ProbeOutcome, ProbeReport};
use crate::observability::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::safety::workspace::{artifact_digest, Workspace};
use crate::verdict::{FitnessScore, VerdictClassifier};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

/// Identity of what is being evaluated, carried into the result.
struct Subject {
    run_id: String,
    artifact: Option<PathBuf>,
    digest: Option<String>,
}

impl Subject {
    fn in_process() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            artifact: None,
            digest: None,
        }
    }
}

pub struct Evaluator {
    config: HarnessConfig,
    loader: Loader,
    limits: ExecutionLimits,
    audit: AuditLogger,
}

impl Evaluator {
    /// Build an evaluator. Fails on invalid configuration, before any
    /// candidate is touched.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        let validation = validate_config(&config)?;
        for warning in &validation.warnings {
            warn!("config: {}", warning);
        }

        let audit = AuditLogger::from_config(config.audit_log.as_deref())?;
        let loader = Loader::new(CandidateContract::from_config(&config));
        let limits = ExecutionLimits::from_config(&config);

        debug!(
            "evaluator ready: {} wall={}ms cpu={}s",
            loader.contract().signature(),
            limits.wall_time_limit_ms,
            limits.cpu_time_limit_secs
        );

        Ok(Self {
            config,
            loader,
            limits,
            audit,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn contract(&self) -> &CandidateContract {
        self.loader.contract()
    }

    /// Evaluate a compiled candidate artifact.
    pub fn evaluate_artifact(&self, artifact: &Path) -> Result<EvaluationResult> {
        if let Err(err) = self.loader.preflight(artifact) {
            let subject = Subject {
                artifact: Some(artifact.to_path_buf()),
                ..Subject::in_process()
            };
            self.audit_start(&subject);
            let result = self.link_failure(&subject, err);
            self.audit.log_event(AuditEvent::evaluation_end(&result));
            return Ok(result);
        }

        let digest = artifact_digest(artifact)?;
        let mut workspace = Workspace::new(&self.config.runtime_dir)?;
        let subject = Subject {
            run_id: workspace.run_id().to_string(),
            artifact: Some(artifact.to_path_buf()),
            digest: Some(digest),
        };
        self.audit_start(&subject);

        let result = self.run_in_workspace(&subject, &mut workspace, artifact);
        let cleanup = workspace.cleanup();
        let result = result?;

        match cleanup {
            Ok(()) => self.audit.log_event(AuditEvent::new(
                AuditEventType::WorkspaceCleanup,
                &subject.run_id,
                format!("removed {}", workspace.run_dir().display()),
            )),
            Err(e) => warn!("run {}: {}", subject.run_id, e),
        }

        Ok(result)
    }

    /// Evaluate an in-process candidate under the same isolation as an
    /// artifact. The candidate runs in a forked child, so state it mutates
    /// is not visible to the caller afterwards.
    pub fn evaluate<C: Candidate>(&self, mut candidate: C) -> Result<EvaluationResult> {
        let subject = Subject::in_process();
        self.audit_start(&subject);

        let outcome = supervise(&self.limits, move || invoke_timed(&mut candidate))?;
        self.conclude(&subject, outcome)
    }

    fn run_in_workspace(
        &self,
        subject: &Subject,
        workspace: &mut Workspace,
        artifact: &Path,
    ) -> Result<EvaluationResult> {
        let load_path = if self.config.stage_artifact {
            workspace.stage_artifact(artifact)?
        } else {
            artifact.to_path_buf()
        };

        // Link status is settled here, before any candidate code can run.
        if let Err(err) = self.loader.inspect(&load_path) {
            let result = self.link_failure(subject, err);
            self.audit.log_event(AuditEvent::evaluation_end(&result));
            return Ok(result);
        }

        let loader = &self.loader;
        let outcome = supervise(&self.limits, move || match loader.load(&load_path) {
            Ok(mut candidate) => {
                let report = invoke_timed(&mut candidate);
                drop(candidate);
                report
            }
            Err(err) => ProbeReport::link_failed(err),
        })?;
        self.conclude(subject, outcome)
    }

    fn conclude(&self, subject: &Subject, outcome: ProbeOutcome) -> Result<EvaluationResult> {
        if !outcome.setup_warnings.is_empty() {
            for warning in &outcome.setup_warnings {
                warn!("run {}: sandbox control skipped: {}", subject.run_id, warning);
            }
            self.audit.log_event(AuditEvent::new(
                AuditEventType::ControlDegraded,
                &subject.run_id,
                outcome.setup_warnings.join("; "),
            ));
        }

        if let Some(kill) = &outcome.kill_report {
            let mut details = format!(
                "wall budget {}ms exceeded, candidate killed",
                self.limits.wall_time_limit_ms
            );
            if !kill.notes.is_empty() {
                details = format!("{} ({})", details, kill.notes.join("; "));
            }
            self.audit.log_event(
                AuditEvent::new(AuditEventType::ForcedKill, &subject.run_id, details)
                    .with_artifact(subject.artifact.as_deref(), subject.digest.as_deref()),
            );
        }

        if outcome.reaped_descendants > 0 {
            self.audit.log_event(
                AuditEvent::new(
                    AuditEventType::DescendantsKilled,
                    &subject.run_id,
                    format!("{} leftover process(es) killed and reaped", outcome.reaped_descendants),
                )
                .with_artifact(subject.artifact.as_deref(), subject.digest.as_deref()),
            );
        }

        let verdict = VerdictClassifier::classify(&outcome);
        let width = self.config.word_width;
        let (fitness, invoke_time_us) = match (verdict.status, verdict.word) {
            (EvaluationStatus::Success, Some(word)) => (
                FitnessScore::of(word, width, self.config.popcount),
                outcome.report.as_ref().map(|report| report.invoke_time_us),
            ),
            _ => (FitnessScore::ZERO, None),
        };

        let result = EvaluationResult {
            run_id: subject.run_id.clone(),
            status: verdict.status,
            raw_word: verdict.word.map(|word| width.truncate(word)),
            fitness,
            word_width: width,
            entry_point: self.config.entry_point.clone(),
            artifact: subject.artifact.clone(),
            artifact_digest: subject.digest.clone(),
            wall_time_ms: outcome.wall_time_ms,
            invoke_time_us,
            exit_code: outcome.wait.exit_code,
            signal: outcome.wait.signal,
            reaped_descendants: outcome.reaped_descendants,
            link_error: None,
            detail: verdict.detail,
        };

        match result.status {
            EvaluationStatus::Success => {
                info!(
                    "run {}: fitness {} ({}us in entry point)",
                    result.run_id,
                    result.fitness,
                    invoke_time_us.unwrap_or_default()
                )
            }
            EvaluationStatus::LinkFailure => self.audit_link_failure(&result),
            EvaluationStatus::RuntimeFault => self.audit.log_event(
                AuditEvent::new(
                    AuditEventType::RuntimeFault,
                    &result.run_id,
                    result.detail.clone().unwrap_or_default(),
                )
                .with_artifact(subject.artifact.as_deref(), subject.digest.as_deref()),
            ),
            EvaluationStatus::Timeout => {}
        }
        self.audit.log_event(AuditEvent::evaluation_end(&result));

        Ok(result)
    }

    fn link_failure(&self, subject: &Subject, err: LinkError) -> EvaluationResult {
        let result = EvaluationResult {
            run_id: subject.run_id.clone(),
            status: EvaluationStatus::LinkFailure,
            raw_word: None,
            fitness: FitnessScore::ZERO,
            word_width: self.config.word_width,
            entry_point: self.config.entry_point.clone(),
            artifact: subject.artifact.clone(),
            artifact_digest: subject.digest.clone(),
            wall_time_ms: 0,
            invoke_time_us: None,
            exit_code: None,
            signal: None,
            reaped_descendants: 0,
            detail: Some(err.to_string()),
            link_error: Some(err),
        };
        self.audit_link_failure(&result);
        result
    }

    fn audit_start(&self, subject: &Subject) {
        self.audit.log_event(
            AuditEvent::new(
                AuditEventType::EvaluationStart,
                &subject.run_id,
                self.loader.contract().signature(),
            )
            .with_artifact(subject.artifact.as_deref(), subject.digest.as_deref()),
        );
    }

    fn audit_link_failure(&self, result: &EvaluationResult) {
        self.audit.log_event(
            AuditEvent::new(
                AuditEventType::LinkFailure,
                &result.run_id,
                result.detail.clone().unwrap_or_default(),
            )
            .with_artifact(result.artifact.as_deref(), result.artifact_digest.as_deref()),
        );
    }
}

/// Runs inside the isolated child.
fn invoke_timed<C: Candidate>(candidate: &mut C) -> ProbeReport {
    let started = Instant::now();
    let word = candidate.invoke();
    ProbeReport::returned(word, started.elapsed().as_micros() as u64)
}

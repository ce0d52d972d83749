/// Outcome classification
///
/// Maps what the supervisor observed to an evaluation status. This is a pure
/// function over the outcome; it never looks at the host.
///
/// Link failures are settled by the static check before fork, so nothing
/// observed here can produce one: once candidate code may have run, any
/// claim it makes about linking or setup is a fault.
use crate::config::types::EvaluationStatus;
use crate::core::types::ProbeOutcome;

/// Classification of one supervised invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct Verdict {
    pub status: EvaluationStatus,
    /// Unmasked word, only for `Success`
    pub word: Option<u64>,
    pub detail: Option<String>,
}

impl Verdict {
    fn new(status: EvaluationStatus) -> Self {
        Self {
            status,
            word: None,
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub struct VerdictClassifier;

impl VerdictClassifier {
    /// Classify a supervised invocation.
    ///
    /// Precedence: watchdog kill, kernel CPU limit, lost supervisor, clean
    /// return, everything else is a fault.
    pub fn classify(outcome: &ProbeOutcome) -> Verdict {
        if outcome.timed_out {
            return Verdict::new(EvaluationStatus::Timeout)
                .with_detail(format!("killed after {}ms wall budget", outcome.wall_time_ms));
        }

        if outcome.wait.signal == Some(libc::SIGXCPU) {
            return Verdict::new(EvaluationStatus::Timeout).with_detail("CPU time limit exceeded");
        }

        if let Some(reason) = &outcome.supervision_error {
            return Verdict::new(EvaluationStatus::RuntimeFault).with_detail(reason.clone());
        }

        if let Some(report) = &outcome.report {
            if let Some(err) = &report.link_error {
                return Verdict::new(EvaluationStatus::RuntimeFault)
                    .with_detail(format!("loader rejected the unit after opening it: {}", err));
            }
            if let Some(message) = &report.panic_message {
                return Verdict::new(EvaluationStatus::RuntimeFault)
                    .with_detail(format!("candidate panicked: {}", message));
            }
            if let (Some(word), Some(0)) = (report.word, outcome.wait.exit_code) {
                let mut verdict = Verdict::new(EvaluationStatus::Success);
                verdict.word = Some(word);
                return verdict;
            }
        }

        Verdict::new(EvaluationStatus::RuntimeFault).with_detail(Self::fault_detail(outcome))
    }

    fn fault_detail(outcome: &ProbeOutcome) -> String {
        if let Some(sig) = outcome.wait.signal {
            let name = nix::sys::signal::Signal::try_from(sig)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| format!("signal {}", sig));
            return format!("terminated by {}", name);
        }
        if let Some(code) = outcome.wait.exit_code {
            if code != 0 {
                return format!("exited with status {} before returning", code);
            }
        }
        outcome
            .report_error
            .clone()
            .unwrap_or_else(|| "candidate did not return a word".to_string())
    }
}

/// Result reporting
///
/// Turns an [`EvaluationResult`] into caller-visible output and a process
/// exit status. A numeric score is printed only for candidates that ran.
use crate::config::types::{EvaluationResult, EvaluationStatus};
use std::io::{self, Write};
use std::process::ExitCode;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReportFormat {
    /// Bare fitness on stdout, diagnostics on stderr
    #[default]
    Plain,
    /// One JSON object per evaluation on stdout
    Json,
}

/// Process exit status of the harness
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HarnessExit {
    Success,
    HarnessError,
    UsageError,
    LinkFailure,
    RuntimeFault,
    Timeout,
}

impl HarnessExit {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::HarnessError => 1,
            Self::UsageError => 2,
            Self::LinkFailure => 3,
            Self::RuntimeFault => 4,
            Self::Timeout => 5,
        }
    }
}

impl From<EvaluationStatus> for HarnessExit {
    fn from(status: EvaluationStatus) -> Self {
        match status {
            EvaluationStatus::Success => Self::Success,
            EvaluationStatus::LinkFailure => Self::LinkFailure,
            EvaluationStatus::RuntimeFault => Self::RuntimeFault,
            EvaluationStatus::Timeout => Self::Timeout,
        }
    }
}

impl From<HarnessExit> for ExitCode {
    fn from(exit: HarnessExit) -> Self {
        ExitCode::from(exit.code())
    }
}

pub struct Reporter<W: Write, E: Write> {
    out: W,
    err: E,
    format: ReportFormat,
}

impl Reporter<io::Stdout, io::Stderr> {
    pub fn stdio(format: ReportFormat) -> Self {
        Self::new(io::stdout(), io::stderr(), format)
    }
}

impl<W: Write, E: Write> Reporter<W, E> {
    pub fn new(out: W, err: E, format: ReportFormat) -> Self {
        Self { out, err, format }
    }

    /// Emit `result` and return the exit status the harness should use.
    pub fn report(&mut self, result: &EvaluationResult) -> io::Result<HarnessExit> {
        let exit = HarnessExit::from(result.status);
        match self.format {
            ReportFormat::Plain => self.report_plain(result)?,
            ReportFormat::Json => self.report_json(result, exit)?,
        }
        self.out.flush()?;
        self.err.flush()?;
        Ok(exit)
    }

    fn report_plain(&mut self, result: &EvaluationResult) -> io::Result<()> {
        match result.status {
            EvaluationStatus::Success => writeln!(self.out, "{}", result.fitness),
            EvaluationStatus::LinkFailure => {
                writeln!(self.err, "fitbox: link failure: {}", describe(result))
            }
            EvaluationStatus::RuntimeFault | EvaluationStatus::Timeout => {
                writeln!(self.out, "0")?;
                writeln!(self.err, "fitbox: {}: {}", result.status, describe(result))
            }
        }
    }

    fn report_json(&mut self, result: &EvaluationResult, exit: HarnessExit) -> io::Result<()> {
        let mut value = serde_json::to_value(result)?;
        if let Some(object) = value.as_object_mut() {
            if result.status == EvaluationStatus::LinkFailure {
                object.insert("fitness".to_string(), serde_json::Value::Null);
            }
            object.insert("exit_code_harness".to_string(), exit.code().into());
        }
        serde_json::to_writer(&mut self.out, &value)?;
        writeln!(self.out)
    }

    /// Report a failure of the harness itself.
    pub fn report_error(&mut self, error: &dyn std::fmt::Display) -> io::Result<HarnessExit> {
        match self.format {
            ReportFormat::Plain => writeln!(self.err, "fitbox: error: {}", error)?,
            ReportFormat::Json => {
                let value = serde_json::json!({
                    "status": "harness_error",
                    "error": error.to_string(),
                    "exit_code_harness": HarnessExit::HarnessError.code(),
                });
                writeln!(self.out, "{}", value)?;
            }
        }
        self.out.flush()?;
        self.err.flush()?;
        Ok(HarnessExit::HarnessError)
    }
}

fn describe(result: &EvaluationResult) -> String {
    result
        .detail
        .clone()
        .unwrap_or_else(|| result.status.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::LinkError;
    use crate::config::types::{EntryPoint, WordWidth};
    use crate::verdict::{FitnessScore, PopcountMethod};

    fn result(status: EvaluationStatus, word: Option<u64>) -> EvaluationResult {
        EvaluationResult {
            run_id: "run".to_string(),
            status,
            raw_word: word,
            fitness: word
                .map(|w| FitnessScore::of(w, WordWidth::W32, PopcountMethod::Hardware))
                .unwrap_or(FitnessScore::ZERO),
            word_width: WordWidth::W32,
            entry_point: EntryPoint::default(),
            artifact: None,
            artifact_digest: None,
            wall_time_ms: 1,
            invoke_time_us: word.map(|_| 12),
            exit_code: Some(0),
            signal: None,
            reaped_descendants: 0,
            link_error: None,
            detail: None,
        }
    }

    fn plain(result: &EvaluationResult) -> (String, String, HarnessExit) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let exit = Reporter::new(&mut out, &mut err, ReportFormat::Plain)
            .report(result)
            .unwrap();
        (String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap(), exit)
    }

    #[test]
    fn success_prints_fitness_only() {
        for (word, expected) in [(0u64, "0\n"), (0xFFFF_FFFF, "32\n"), (0b101, "2\n")] {
            let (out, err, exit) = plain(&result(EvaluationStatus::Success, Some(word)));
            assert_eq!(out, expected);
            assert!(err.is_empty());
            assert_eq!(exit.code(), 0);
        }
    }

    #[test]
    fn link_failure_prints_no_number() {
        let mut r = result(EvaluationStatus::LinkFailure, None);
        let err = LinkError::SymbolMissing {
            symbol: "one_max".to_string(),
            reason: "undefined symbol: one_max".to_string(),
        };
        r.detail = Some(err.to_string());
        r.link_error = Some(err);

        let (out, err, exit) = plain(&r);
        assert!(out.is_empty());
        assert!(err.contains("one_max"));
        assert_eq!(exit, HarnessExit::LinkFailure);
        assert_eq!(exit.code(), 3);
    }

    #[test]
    fn faults_print_sentinel_and_distinct_codes() {
        let mut fault = result(EvaluationStatus::RuntimeFault, None);
        fault.detail = Some("terminated by SIGSEGV".to_string());
        let (out, err, exit) = plain(&fault);
        assert_eq!(out, "0\n");
        assert!(err.contains("SIGSEGV"));
        assert_eq!(exit.code(), 4);

        let (out, _, exit) = plain(&result(EvaluationStatus::Timeout, None));
        assert_eq!(out, "0\n");
        assert_eq!(exit.code(), 5);
    }

    #[test]
    fn json_report_nulls_fitness_for_link_failure() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let exit = Reporter::new(&mut out, &mut err, ReportFormat::Json)
            .report(&result(EvaluationStatus::LinkFailure, None))
            .unwrap();
        assert_eq!(exit, HarnessExit::LinkFailure);

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["status"], "link_failure");
        assert!(value["fitness"].is_null());
        assert_eq!(value["exit_code_harness"], 3);
        assert!(err.is_empty());
    }

    #[test]
    fn json_report_carries_score() {
        let mut out = Vec::new();
        Reporter::new(&mut out, Vec::new(), ReportFormat::Json)
            .report(&result(EvaluationStatus::Success, Some(0xF0)))
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["fitness"], 4);
        assert_eq!(value["raw_word"], 0xF0);
        assert_eq!(value["word_width"], 32);
        assert_eq!(value["invoke_time_us"], 12);
    }
}

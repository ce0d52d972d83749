use crate::config::types::{EntryPoint, HarnessConfig, WordWidth};
use crate::evaluator::Evaluator;
use crate::kernel::process::set_not_dumpable;
use crate::kernel::signal::install_termination_handlers;
use crate::reporter::{HarnessExit, ReportFormat, Reporter};
use crate::verdict::PopcountMethod;
use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, warn};
use std::path::PathBuf;
use std::process::ExitCode;

/// Score an untrusted candidate by the population count of the word it returns.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Compiled candidate (shared object) to evaluate
    artifact: PathBuf,

    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Symbol the candidate must export
    #[arg(long, value_parser = parse_entry_point)]
    entry_point: Option<EntryPoint>,

    /// Width of the returned word in bits (32 or 64)
    #[arg(long)]
    word_width: Option<WordWidth>,

    /// Wall clock budget in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// CPU time budget in milliseconds (rounded up to whole seconds)
    #[arg(long)]
    cpu_time_ms: Option<u64>,

    /// Address space limit in MB
    #[arg(long)]
    memory_limit_mb: Option<u64>,

    /// Popcount algorithm: shift-and-test, byte-table or hardware
    #[arg(long, value_parser = parse_popcount)]
    popcount: Option<PopcountMethod>,

    /// Directory for run-scoped workspaces
    #[arg(long)]
    runtime_dir: Option<PathBuf>,

    /// Load the artifact in place instead of staging a copy
    #[arg(long)]
    no_stage: bool,

    /// Append audit events as JSON lines to this file
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// Fail instead of degrading when a sandbox control cannot be applied
    #[arg(long)]
    strict: bool,

    /// Print the full result as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn harness_config(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => HarnessConfig::default(),
        };

        if let Some(entry_point) = &self.entry_point {
            config.entry_point = entry_point.clone();
        }
        if let Some(word_width) = self.word_width {
            config.word_width = word_width;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.wall_time_limit_ms = timeout_ms;
        }
        if let Some(cpu_time_ms) = self.cpu_time_ms {
            config.cpu_time_limit_ms = Some(cpu_time_ms);
        }
        if let Some(memory_mb) = self.memory_limit_mb {
            config.memory_limit = Some(memory_mb * 1024 * 1024);
        }
        if let Some(popcount) = self.popcount {
            config.popcount = popcount;
        }
        if let Some(runtime_dir) = &self.runtime_dir {
            config.runtime_dir = runtime_dir.clone();
        }
        if self.no_stage {
            config.stage_artifact = false;
        }
        if let Some(audit_log) = &self.audit_log {
            config.audit_log = Some(audit_log.clone());
        }
        if self.strict {
            config.strict_mode = true;
        }

        Ok(config)
    }
}

fn parse_entry_point(value: &str) -> std::result::Result<EntryPoint, String> {
    EntryPoint::new(value).map_err(|e| e.to_string())
}

fn parse_popcount(value: &str) -> std::result::Result<PopcountMethod, String> {
    match value {
        "shift-and-test" | "shift_and_test" => Ok(PopcountMethod::ShiftAndTest),
        "byte-table" | "byte_table" => Ok(PopcountMethod::ByteTable),
        "hardware" => Ok(PopcountMethod::Hardware),
        other => Err(format!(
            "unknown popcount method '{other}' (expected shift-and-test, byte-table or hardware)"
        )),
    }
}

pub fn run() -> Result<ExitCode> {
    env_logger::init();

    // Interrupting the harness must not orphan a running candidate.
    if let Err(e) = install_termination_handlers() {
        warn!("{}", e);
    }

    // Same-user candidates cannot open this process's pipes through /proc.
    if let Err(e) = set_not_dumpable() {
        warn!("{}", e);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let exit = if e.use_stderr() {
                HarnessExit::UsageError
            } else {
                HarnessExit::Success
            };
            return Ok(exit.into());
        }
    };
    let format = if cli.json {
        ReportFormat::Json
    } else {
        ReportFormat::Plain
    };
    let mut reporter = Reporter::stdio(format);

    let outcome = cli
        .harness_config()
        .and_then(|config| Evaluator::new(config).context("invalid configuration"))
        .and_then(|evaluator| {
            debug!("evaluating {}", cli.artifact.display());
            evaluator
                .evaluate_artifact(&cli.artifact)
                .with_context(|| format!("evaluating {}", cli.artifact.display()))
        });

    let exit = match outcome {
        Ok(result) => reporter.report(&result)?,
        Err(e) => reporter.report_error(&format!("{:#}", e))?,
    };

    Ok(exit.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "fitbox",
            "cand.so",
            "--entry-point",
            "darwin",
            "--word-width",
            "64",
            "--timeout-ms",
            "250",
            "--memory-limit-mb",
            "64",
            "--popcount",
            "byte-table",
            "--no-stage",
            "--strict",
        ])
        .unwrap();
        let config = cli.harness_config().unwrap();

        assert_eq!(config.entry_point.as_str(), "darwin");
        assert_eq!(config.word_width, WordWidth::W64);
        assert_eq!(config.wall_time_limit_ms, 250);
        assert_eq!(config.memory_limit, Some(64 * 1024 * 1024));
        assert_eq!(config.popcount, PopcountMethod::ByteTable);
        assert!(!config.stage_artifact);
        assert!(config.strict_mode);
    }

    #[test]
    fn bad_flag_values_are_usage_errors() {
        assert!(Cli::try_parse_from(["fitbox", "c.so", "--word-width", "16"]).is_err());
        assert!(Cli::try_parse_from(["fitbox", "c.so", "--entry-point", "1st"]).is_err());
        assert!(Cli::try_parse_from(["fitbox", "c.so", "--popcount", "magic"]).is_err());
        assert!(Cli::try_parse_from(["fitbox"]).is_err());
    }

    #[test]
    fn defaults_without_flags() {
        let cli = Cli::try_parse_from(["fitbox", "cand.so"]).unwrap();
        let config = cli.harness_config().unwrap();
        assert_eq!(config.entry_point.as_str(), "one_max");
        assert_eq!(config.word_width, WordWidth::W32);
        assert_eq!(config.wall_time_limit_ms, 1000);
        assert!(!cli.json);
    }
}

//! Candidate side of an isolated invocation.
//!
//! Runs in the process forked by the supervising proxy. It hardens itself,
//! hands its setup result to the harness over the stage pipe, waits to be
//! released, runs the body under `catch_unwind`, writes one JSON
//! [`ProbeReport`] to the report pipe and `_exit`s. It never returns into
//! harness code and never logs.
//!
//! The stage and release descriptors are closed before the body runs, so
//! candidate code (initializers included) can only ever reach the report
//! pipe.

use crate::config::types::{FitboxError, Result};
use crate::core::types::{ExecutionLimits, ProbeReport, SetupReport};
use crate::kernel::{process, rlimit};
use crate::utils::fd_closure::{self, RELEASE_FD, REPORT_FD, STAGE_FD, STATUS_FD};
use nix::unistd::close;
use serde::Serialize;
use std::any::Any;
use std::fs::File;
use std::io::{Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};

/// Candidate process exit code when the report could not be written.
pub const REPORT_WRITE_FAILED: i32 = 125;
/// Candidate process exit code when it was never released to run the body.
pub const NOT_RELEASED: i32 = 126;

/// Candidate process entrypoint. Expects the report, stage and release
/// descriptors at their fixed numbers, as arranged by the proxy.
pub fn run_probe<F>(limits: &ExecutionLimits, body: F) -> !
where
    F: FnOnce() -> ProbeReport,
{
    let setup = match harden(limits) {
        Ok(setup_warnings) => SetupReport {
            setup_error: None,
            setup_warnings,
        },
        Err(err) => SetupReport {
            setup_error: Some(err.to_string()),
            setup_warnings: Vec::new(),
        },
    };

    let staged = write_json_line(STAGE_FD, &setup);
    let _ = close(STAGE_FD);
    if staged.is_err() {
        exit(REPORT_WRITE_FAILED);
    }
    if setup.setup_error.is_some() || !wait_for_release() {
        exit(NOT_RELEASED);
    }

    let report = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(report) => report,
        Err(payload) => ProbeReport {
            panic_message: Some(panic_text(payload.as_ref())),
            ..ProbeReport::default()
        },
    };

    match write_json_line(REPORT_FD, &report) {
        Ok(()) => exit(0),
        Err(_) => exit(REPORT_WRITE_FAILED),
    }
}

/// Confinement applied before any candidate code is loaded or called.
fn harden(limits: &ExecutionLimits) -> Result<Vec<String>> {
    let mut warnings = Vec::new();

    process::setup_parent_death_signal()?;
    fd_closure::redirect_stdio_to_null()?;
    fd_closure::close_fds_from(STATUS_FD)?;
    process::reset_candidate_signals()?;
    warnings.extend(rlimit::apply_candidate_limits(limits)?);

    if let Err(err) = process::set_no_new_privs() {
        if limits.strict_mode {
            return Err(err);
        }
        warnings.push(err.to_string());
    }

    Ok(warnings)
}

/// Block until the harness writes the release byte. EOF or an error means
/// the harness gave up on this evaluation.
fn wait_for_release() -> bool {
    let mut release = unsafe { File::from_raw_fd(RELEASE_FD) };
    let mut byte = [0u8; 1];
    let released = loop {
        match release.read(&mut byte) {
            Ok(1) => break true,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            _ => break false,
        }
    };
    drop(release);
    released
}

/// One JSON document followed by a newline. The descriptor stays open.
pub(crate) fn write_json_line<T: Serialize>(fd: RawFd, value: &T) -> Result<()> {
    let mut payload =
        serde_json::to_vec(value).map_err(|e| FitboxError::Process(format!("encode report: {e}")))?;
    payload.push(b'\n');
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(fd) });
    file.write_all(&payload)
        .and_then(|_| file.flush())
        .map_err(|e| FitboxError::Process(format!("write fd {fd}: {e}")))
}

fn exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "candidate panicked".to_string()
    }
}

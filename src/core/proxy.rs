//! Supervising process between the harness and the candidate.
//!
//! The proxy never runs candidate code. It marks itself a child subreaper,
//! forks the candidate process, enforces the wall budget on it, and once the
//! candidate is gone kills and reaps every process the candidate left
//! behind (including ones that called `setsid`, which orphans re-parent to
//! the proxy). Only then does it write its [`ProxyStatus`] and exit, so a
//! finished evaluation has no surviving descendants.

use crate::config::types::Result;
use crate::core::probe::{run_probe, write_json_line};
use crate::core::types::{ExecutionLimits, KillReport, ProbeReport, ProxyStatus, WaitOutcome};
use crate::kernel::process;
use crate::utils::fd_closure::{self, RELEASE_FD, REPORT_FD, STAGE_FD, STATUS_FD};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, fork, ForkResult, Pid};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

const POLL_FLOOR: Duration = Duration::from_millis(1);
const POLL_CEILING: Duration = Duration::from_millis(10);
/// Upper bound on kill-and-reap rounds over re-parented descendants.
const MAX_SWEEPS: usize = 64;

/// Write ends (and the release read end) handed to the proxy by the harness.
pub struct ProxyFds {
    pub report: RawFd,
    pub stage: RawFd,
    pub release: RawFd,
    pub status: RawFd,
}

/// Proxy entrypoint, called right after the harness forks.
pub fn run_proxy<F>(fds: ProxyFds, limits: &ExecutionLimits, body: F) -> !
where
    F: FnOnce() -> ProbeReport,
{
    let status = match fd_closure::move_fds(&[
        (fds.report, REPORT_FD),
        (fds.stage, STAGE_FD),
        (fds.release, RELEASE_FD),
        (fds.status, STATUS_FD),
    ]) {
        Ok(()) => supervise_candidate(limits, body),
        Err(err) => ProxyStatus {
            internal_error: Some(err.to_string()),
            ..ProxyStatus::default()
        },
    };

    let code = match write_json_line(STATUS_FD, &status) {
        Ok(()) => 0,
        Err(_) => 1,
    };
    unsafe { libc::_exit(code) }
}

fn supervise_candidate<F>(limits: &ExecutionLimits, body: F) -> ProxyStatus
where
    F: FnOnce() -> ProbeReport,
{
    let mut warnings = Vec::new();
    if let Err(err) = prepare(limits, &mut warnings) {
        return ProxyStatus {
            warnings,
            internal_error: Some(err.to_string()),
            ..ProxyStatus::default()
        };
    }

    let candidate = match unsafe { fork() } {
        Ok(ForkResult::Child) => run_probe(limits, body),
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            return ProxyStatus {
                warnings,
                internal_error: Some(format!("fork(candidate): {e}")),
                ..ProxyStatus::default()
            }
        }
    };

    // Only the candidate process needs these.
    for fd in [REPORT_FD, STAGE_FD, RELEASE_FD] {
        let _ = close(fd);
    }

    let started = Instant::now();
    let (wait, timed_out, kill_report) = watch(candidate, limits);
    let wall_time_ms = started.elapsed().as_millis() as u64;
    let (reaped_descendants, sweep_notes) = reap_descendants();
    warnings.extend(sweep_notes);

    ProxyStatus {
        candidate_pid: Some(candidate.as_raw()),
        wait,
        timed_out,
        wall_time_ms,
        kill_report,
        reaped_descendants,
        warnings,
        internal_error: None,
    }
}

fn prepare(limits: &ExecutionLimits, warnings: &mut Vec<String>) -> Result<()> {
    // The harness also calls setpgid on us; whichever runs first wins the race.
    if let Err(err) = process::enter_own_process_group() {
        warnings.push(err.to_string());
    }
    process::setup_parent_death_signal()?;
    fd_closure::redirect_stdio_to_null()?;
    fd_closure::close_fds_from(STATUS_FD + 1)?;
    process::ignore_supervisor_signals()?;
    process::set_child_subreaper()?;

    if let Err(err) = process::set_not_dumpable() {
        if limits.strict_mode {
            return Err(err);
        }
        warnings.push(err.to_string());
    }
    Ok(())
}

/// Wait for the candidate, killing it when the wall budget runs out.
fn watch(candidate: Pid, limits: &ExecutionLimits) -> (WaitOutcome, bool, Option<KillReport>) {
    let wall_limit = limits.wall_time_limit();
    let started = Instant::now();
    let mut poll = POLL_FLOOR;
    let mut timed_out = false;
    let mut kill_report = None;

    loop {
        match waitpid(candidate, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                let elapsed = started.elapsed();
                if elapsed >= wall_limit && !timed_out {
                    timed_out = true;
                    kill_report = Some(terminate(candidate));
                    continue;
                }
                let remaining = wall_limit.saturating_sub(elapsed);
                std::thread::sleep(poll.min(remaining).max(Duration::from_micros(100)));
                poll = (poll * 2).min(POLL_CEILING);
            }
            Ok(status) => {
                if let Some(outcome) = wait_outcome(status) {
                    return (outcome, timed_out, kill_report);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                let report = kill_report.get_or_insert_with(KillReport::default);
                report.notes.push(format!("waitpid(candidate) failed: {e}"));
                return (WaitOutcome::default(), timed_out, kill_report);
            }
        }
    }
}

fn terminate(candidate: Pid) -> KillReport {
    let start = Instant::now();
    let mut report = KillReport::default();
    match kill(candidate, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => report.kill_sent = true,
        Err(e) => report.notes.push(format!("SIGKILL to candidate failed: {e}")),
    }
    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

pub(crate) fn wait_outcome(status: WaitStatus) -> Option<WaitOutcome> {
    match status {
        WaitStatus::Exited(_, code) => Some(WaitOutcome {
            exit_code: Some(code),
            signal: None,
        }),
        WaitStatus::Signaled(_, sig, _) => Some(WaitOutcome {
            exit_code: None,
            signal: Some(sig as i32),
        }),
        _ => None,
    }
}

/// Kill and reap everything that re-parented to the proxy. Killing one
/// process re-parents its own children here, so repeat until none remain.
fn reap_descendants() -> (u32, Vec<String>) {
    let me = Pid::this();
    let mut reaped = 0u32;
    let mut notes = Vec::new();
    let mut listing_failed = false;

    for _ in 0..MAX_SWEEPS {
        let children = match process::child_pids(me) {
            Ok(children) => children,
            Err(err) => {
                notes.push(err.to_string());
                listing_failed = true;
                break;
            }
        };
        if children.is_empty() {
            return (reaped, notes);
        }

        for &pid in &children {
            let _ = kill(pid, Signal::SIGKILL);
        }
        for pid in children {
            loop {
                match waitpid(pid, None) {
                    Err(Errno::EINTR) => continue,
                    Ok(_) => {
                        reaped += 1;
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }

    // Anything already dead but not yet collected.
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
            Ok(_) => reaped += 1,
        }
    }
    if !listing_failed {
        notes.push(format!("descendants still present after {} sweeps", MAX_SWEEPS));
    }
    (reaped, notes)
}

/// Per-child process hardening that does not involve resource limits
use crate::config::types::{FitboxError, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{setpgid, Pid};

/// Signals that mean "the candidate faulted". They must terminate the child
/// rather than reach any handler inherited from the harness.
pub const FAULT_SIGNALS: [Signal; 5] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGABRT,
];

/// Signals the supervising process ignores, so a candidate signalling its
/// own process group cannot take the supervisor down with it. The candidate
/// process restores their defaults.
pub const SUPERVISOR_IGNORED_SIGNALS: [Signal; 7] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGALRM,
];

/// Put the calling process in its own process group so the watchdog can
/// kill everything the candidate spawns with one killpg.
pub fn enter_own_process_group() -> Result<()> {
    setpgid(Pid::from_raw(0), Pid::from_raw(0))
        .map_err(|e| FitboxError::Sandbox(format!("setpgid failed: {}", e)))
}

/// Child receives SIGKILL if the harness dies first.
pub fn setup_parent_death_signal() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::prctl;

        prctl::set_pdeathsig(Signal::SIGKILL)
            .map_err(|e| FitboxError::Sandbox(format!("Failed to set parent death signal: {}", e)))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Ok(())
    }
}

/// prctl(PR_SET_NO_NEW_PRIVS, 1)
pub fn set_no_new_privs() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(FitboxError::Sandbox(format!(
                "PR_SET_NO_NEW_PRIVS failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Orphaned descendants are re-parented to the calling process instead of
/// init, so it can find and reap everything a candidate spawned.
pub fn set_child_subreaper() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(FitboxError::Sandbox(format!(
                "PR_SET_CHILD_SUBREAPER failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// prctl(PR_SET_DUMPABLE, 0): same-uid processes without CAP_SYS_PTRACE can
/// no longer ptrace the caller or open its /proc/<pid>/fd entries.
pub fn set_not_dumpable() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) };
        if rc != 0 {
            return Err(FitboxError::Sandbox(format!(
                "PR_SET_DUMPABLE failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

pub fn ignore_supervisor_signals() -> Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for sig in SUPERVISOR_IGNORED_SIGNALS {
        unsafe { signal::sigaction(sig, &ignore) }
            .map_err(|e| FitboxError::Sandbox(format!("sigaction({}) failed: {}", sig, e)))?;
    }
    Ok(())
}

/// Pids whose parent is `parent`, zombies included.
///
/// Reads the `children` file of every thread of `parent` and falls back to
/// scanning every `/proc/<pid>/stat` when those files are not available.
pub fn child_pids(parent: Pid) -> Result<Vec<Pid>> {
    if let Some(children) = children_from_tasks(parent) {
        return Ok(children);
    }

    let entries = std::fs::read_dir("/proc")
        .map_err(|e| FitboxError::Sandbox(format!("Failed to read /proc: {}", e)))?;
    let mut children = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<i32>().ok()) else {
            continue;
        };
        // The process may be gone by now.
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if parent_from_stat(&stat) == Some(parent.as_raw()) {
            children.push(Pid::from_raw(pid));
        }
    }
    Ok(children)
}

/// `None` when the kernel does not expose `/proc/<pid>/task/<tid>/children`.
fn children_from_tasks(parent: Pid) -> Option<Vec<Pid>> {
    let tasks = std::fs::read_dir(format!("/proc/{}/task", parent)).ok()?;
    let mut children = Vec::new();
    let mut readable = false;
    for task in tasks.flatten() {
        if let Ok(list) = std::fs::read_to_string(task.path().join("children")) {
            readable = true;
            children.extend(
                list.split_whitespace()
                    .filter_map(|pid| pid.parse::<i32>().ok())
                    .map(Pid::from_raw),
            );
        }
    }
    readable.then_some(children)
}

/// PPID field of a `/proc/<pid>/stat` line. The command name is
/// parenthesised and may itself contain spaces or parentheses.
fn parent_from_stat(stat: &str) -> Option<i32> {
    let (_, rest) = stat.rsplit_once(')')?;
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

/// Restore default disposition for fault signals and for the signals the
/// supervising process ignores, and unblock them.
pub fn reset_candidate_signals() -> Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let mut mask = SigSet::empty();
    for sig in FAULT_SIGNALS.into_iter().chain(SUPERVISOR_IGNORED_SIGNALS) {
        unsafe { signal::sigaction(sig, &default) }
            .map_err(|e| FitboxError::Sandbox(format!("sigaction({}) failed: {}", sig, e)))?;
        mask.add(sig);
    }
    signal::sigprocmask(signal::SigmaskHow::SIG_UNBLOCK, Some(&mask), None)
        .map_err(|e| FitboxError::Sandbox(format!("sigprocmask failed: {}", e)))
}

use crate::config::types::{FitboxError, Result};
use crate::core::proxy::{run_proxy, wait_outcome, ProxyFds};
use crate::core::types::{
    ExecutionLimits, KillReport, ProbeOutcome, ProbeReport, ProxyStatus, SetupReport, WaitOutcome,
};
use crate::kernel::signal as harness_signal;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, fork, pipe2, setpgid, write, ForkResult, Pid};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::Read;
use std::mem::ManuallyDrop;
use std::os::fd::FromRawFd;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

const POLL_FLOOR: Duration = Duration::from_millis(1);
const POLL_CEILING: Duration = Duration::from_millis(10);
/// Time the proxy gets beyond the wall budget to kill, sweep and report.
const SUPERVISION_GRACE: Duration = Duration::from_millis(1000);
/// Reports are a few hundred bytes; anything bigger is not ours.
const MAX_REPORT_BYTES: usize = 64 * 1024;

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> FitboxError {
    FitboxError::Process(format!("{prefix}: {err}"))
}

/// Read and write ends of one channel.
struct Channel {
    read: RawFd,
    write: RawFd,
}

impl Channel {
    fn open(name: &str) -> Result<Self> {
        let (read, write) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| to_process_error(&format!("pipe({name})"), e))?;
        Ok(Self { read, write })
    }
}

/// The four pipes of one evaluation.
struct Channels {
    report: Channel,
    stage: Channel,
    release: Channel,
    status: Channel,
}

impl Channels {
    fn open() -> Result<Self> {
        let report = Channel::open("report")?;
        let stage = Channel::open("stage").map_err(|e| close_all(&[&report], e))?;
        let release = Channel::open("release").map_err(|e| close_all(&[&report, &stage], e))?;
        let status =
            Channel::open("status").map_err(|e| close_all(&[&report, &stage, &release], e))?;
        Ok(Self {
            report,
            stage,
            release,
            status,
        })
    }

    fn proxy_fds(&self) -> ProxyFds {
        ProxyFds {
            report: self.report.write,
            stage: self.stage.write,
            release: self.release.read,
            status: self.status.write,
        }
    }

    /// Ends the proxy keeps; the harness closes these after fork.
    fn proxy_ends(&self) -> [RawFd; 4] {
        [self.report.write, self.stage.write, self.release.read, self.status.write]
    }

    /// Ends the harness keeps; the proxy drops these after fork.
    fn harness_ends(&self) -> [RawFd; 4] {
        [self.report.read, self.stage.read, self.release.write, self.status.read]
    }
}

fn close_all(channels: &[&Channel], err: FitboxError) -> FitboxError {
    for channel in channels {
        let _ = close(channel.read);
        let _ = close(channel.write);
    }
    err
}

/// Owns the forked proxy until it has been reaped. Dropping an unreaped
/// guard kills the whole group, so early `?` returns cannot leak a candidate.
struct ChildGuard {
    pid: Pid,
    reaped: bool,
}

impl ChildGuard {
    fn new(pid: Pid) -> Self {
        harness_signal::set_active_group(pid.as_raw());
        Self { pid, reaped: false }
    }

    fn kill_group(&self) -> std::result::Result<(), Errno> {
        match killpg(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            // The proxy may not have reached setpgid; fall back to the pid itself.
            Err(_) => match nix::sys::signal::kill(self.pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    fn mark_reaped(&mut self) {
        self.reaped = true;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        // Group members that outlived the proxy die here.
        let _ = self.kill_group();
        if !self.reaped {
            loop {
                match waitpid(self.pid, None) {
                    Err(Errno::EINTR) => continue,
                    _ => break,
                }
            }
        }
        harness_signal::clear_active_group(self.pid.as_raw());
    }
}

fn terminate_group(guard: &ChildGuard) -> KillReport {
    let start = Instant::now();
    let mut report = KillReport::default();

    match guard.kill_group() {
        Ok(()) => report.kill_sent = true,
        Err(e) => report.notes.push(format!("SIGKILL to group failed: {}", e)),
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// Read one newline-terminated JSON document from the stage pipe, giving up
/// at `deadline` or when the proxy exits without sending it. EOF is not
/// awaited: a concurrent fork elsewhere in the harness may hold a copy of
/// the write end.
fn read_setup(
    stage_fd: RawFd,
    guard: &mut ChildGuard,
    deadline: Instant,
) -> std::result::Result<SetupReport, String> {
    if let Err(e) = fcntl(stage_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
        return Err(format!("fcntl(O_NONBLOCK) on stage pipe: {e}"));
    }
    let mut file = ManuallyDrop::new(unsafe { File::from_raw_fd(stage_fd) });

    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    let mut poll = POLL_FLOOR;
    loop {
        match file.read(&mut buf) {
            Ok(0) => return Err("stage pipe closed before setup was reported".to_string()),
            Ok(n) => {
                data.extend_from_slice(&buf[..n]);
                if let Some(end) = data.iter().position(|b| *b == b'\n') {
                    return serde_json::from_slice(&data[..end])
                        .map_err(|e| format!("undecodable setup report: {e}"));
                }
                if data.len() > MAX_REPORT_BYTES {
                    return Err("setup report exceeds size bound".to_string());
                }
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(format!("read stage pipe: {e}")),
        }

        match waitpid(guard.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
            Ok(_) | Err(_) => {
                guard.mark_reaped();
                return Err("supervisor exited before setup was reported".to_string());
            }
        }
        if Instant::now() >= deadline {
            return Err("timed out waiting for sandbox setup".to_string());
        }
        std::thread::sleep(poll);
        poll = (poll * 2).min(POLL_CEILING);
    }
}

/// Read whatever is left in a pipe without ever blocking: a straggler
/// holding the write end open must not stall the harness.
fn drain_json<T: DeserializeOwned>(read_fd: RawFd, name: &str) -> (Option<T>, Option<String>) {
    let mut file = unsafe { File::from_raw_fd(read_fd) };
    if let Err(e) = fcntl(read_fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)) {
        return (None, Some(format!("fcntl(O_NONBLOCK) on {name} pipe: {e}")));
    }

    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                data.extend_from_slice(&buf[..n]);
                if data.len() > MAX_REPORT_BYTES {
                    return (None, Some(format!("{name} exceeds size bound")));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return (None, Some(format!("read {name} pipe: {e}"))),
        }
    }

    if data.is_empty() {
        return (None, Some(format!("no {name} was written")));
    }
    // Exactly one document; anything appended to it is rejected.
    match serde_json::from_slice::<T>(&data) {
        Ok(value) => (Some(value), None),
        Err(e) => (None, Some(format!("undecodable {name}: {e}"))),
    }
}

/// Let the candidate process run its body.
fn release(release_fd: RawFd) -> Result<()> {
    loop {
        match write(release_fd, b"1") {
            Ok(1) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Ok(_) => return Err(FitboxError::Process("short write on release pipe".to_string())),
            Err(e) => return Err(to_process_error("write(release)", e)),
        }
    }
}

/// Run `body` once in a freshly forked, confined candidate process under a
/// supervising proxy, and wait until both are gone.
///
/// Returns `Err` only for harness-side failures, all of which happen before
/// candidate code is released to run. Everything after release is evidence
/// for the classifier.
///
/// The caller must not hold locks other threads need inside `body`; only the
/// forking thread exists in the child.
pub fn supervise<F>(limits: &ExecutionLimits, body: F) -> Result<ProbeOutcome>
where
    F: FnOnce() -> ProbeReport,
{
    let channels = Channels::open()?;

    let proxy = match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            for fd in channels.harness_ends() {
                let _ = close(fd);
            }
            run_proxy(channels.proxy_fds(), limits, body)
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => {
            for fd in channels.harness_ends().into_iter().chain(channels.proxy_ends()) {
                let _ = close(fd);
            }
            return Err(to_process_error("fork(proxy)", e));
        }
    };

    for fd in channels.proxy_ends() {
        let _ = close(fd);
    }
    // Mirror the proxy's own setpgid so killpg works even if it has not run yet.
    let _ = setpgid(proxy, proxy);
    let mut guard = ChildGuard::new(proxy);

    let started = Instant::now();
    let deadline = started + limits.wall_time_limit() + SUPERVISION_GRACE;

    let setup = read_setup(channels.stage.read, &mut guard, deadline);
    let _ = close(channels.stage.read);
    let released = match &setup {
        Ok(report) if report.setup_error.is_none() => release(channels.release.write),
        Ok(report) => Err(FitboxError::Sandbox(report.setup_error.clone().unwrap_or_default())),
        Err(reason) => Err(FitboxError::Sandbox(format!("sandbox setup did not report: {reason}"))),
    };
    let _ = close(channels.release.write);

    if let Err(err) = released {
        // Nothing of the candidate has run; stop everything and surface the
        // proxy's own diagnosis when it has one.
        drop(guard);
        let _ = close(channels.report.read);
        let (status, _) = drain_json::<ProxyStatus>(channels.status.read, "status");
        return Err(match status.and_then(|s| s.internal_error) {
            Some(internal) => FitboxError::Sandbox(internal),
            None => err,
        });
    }
    let mut setup_warnings = setup.map(|report| report.setup_warnings).unwrap_or_default();

    let mut poll = POLL_FLOOR;
    let mut outer_kill = None;
    let proxy_wait = loop {
        match waitpid(proxy, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                let now = Instant::now();
                if now >= deadline && outer_kill.is_none() {
                    outer_kill = Some(terminate_group(&guard));
                    log::warn!("supervisor pid {} missed its deadline; group killed", proxy);
                    continue;
                }
                let remaining = deadline.saturating_duration_since(now);
                std::thread::sleep(poll.min(remaining).max(Duration::from_micros(100)));
                poll = (poll * 2).min(POLL_CEILING);
            }
            Ok(status) => {
                if let Some(outcome) = wait_outcome(status) {
                    break outcome;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                let _ = close(channels.report.read);
                let _ = close(channels.status.read);
                return Err(to_process_error("waitpid(proxy)", e));
            }
        }
    };
    guard.mark_reaped();
    let wall_time_ms = started.elapsed().as_millis() as u64;

    // Drop kills any surviving group members before the pipes are drained.
    drop(guard);
    let (status, status_error) = drain_json::<ProxyStatus>(channels.status.read, "status");
    let (report, report_error) = drain_json::<ProbeReport>(channels.report.read, "report");

    let outcome = match (status, outer_kill) {
        (Some(status), None) if proxy_wait.exit_code == Some(0) && status.internal_error.is_none() => {
            setup_warnings.extend(status.warnings);
            ProbeOutcome {
                candidate_pid: status.candidate_pid,
                wait: status.wait,
                timed_out: status.timed_out,
                wall_time_ms: status.wall_time_ms,
                setup_warnings,
                supervision_error: None,
                report,
                report_error,
                kill_report: status.kill_report,
                reaped_descendants: status.reaped_descendants,
            }
        }
        (status, outer_kill) => ProbeOutcome {
            candidate_pid: status.as_ref().and_then(|s| s.candidate_pid),
            wait: WaitOutcome::default(),
            timed_out: outer_kill.is_some(),
            wall_time_ms,
            setup_warnings,
            supervision_error: Some(supervision_failure(&proxy_wait, status.as_ref(), status_error)),
            report,
            report_error,
            kill_report: outer_kill,
            reaped_descendants: 0,
        },
    };
    Ok(outcome)
}

fn supervision_failure(
    proxy_wait: &WaitOutcome,
    status: Option<&ProxyStatus>,
    status_error: Option<String>,
) -> String {
    if let Some(internal) = status.and_then(|s| s.internal_error.as_deref()) {
        return format!("supervisor failed after release: {internal}");
    }
    if let Some(sig) = proxy_wait.signal {
        return format!("supervisor was killed by signal {sig}");
    }
    status_error.unwrap_or_else(|| format!("supervisor exited with status {:?}", proxy_wait.exit_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_limits(wall_ms: u64) -> ExecutionLimits {
        ExecutionLimits {
            wall_time_limit_ms: wall_ms,
            ..ExecutionLimits::default()
        }
    }

    #[test]
    fn returning_body_is_reported() {
        let outcome = supervise(&quick_limits(2000), || ProbeReport::returned(0xF0, 1)).unwrap();
        assert!(!outcome.timed_out);
        assert!(outcome.supervision_error.is_none());
        assert_eq!(outcome.wait.exit_code, Some(0));
        assert_eq!(outcome.report.unwrap().word, Some(0xF0));
        assert_eq!(outcome.reaped_descendants, 0);
    }

    #[test]
    fn hanging_body_is_killed_at_budget() {
        let started = Instant::now();
        let outcome = supervise(&quick_limits(150), || loop {
            std::hint::spin_loop();
        })
        .unwrap();

        assert!(outcome.timed_out);
        assert!(outcome.supervision_error.is_none());
        assert_eq!(outcome.wait.signal, Some(libc::SIGKILL));
        assert!(outcome.report.is_none());
        assert!(outcome.kill_report.unwrap().kill_sent);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn aborting_body_reports_signal() {
        let outcome = supervise(&quick_limits(2000), || std::process::abort()).unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.wait.signal, Some(libc::SIGABRT));
        assert!(outcome.report.is_none());
        assert!(outcome.report_error.is_some());
    }

    #[test]
    fn panicking_body_is_contained() {
        let outcome = supervise(&quick_limits(2000), || panic!("bad genome")).unwrap();
        assert_eq!(outcome.wait.exit_code, Some(0));
        let report = outcome.report.unwrap();
        assert_eq!(report.panic_message.as_deref(), Some("bad genome"));
        assert!(report.word.is_none());
    }

    #[test]
    fn child_cannot_write_to_harness_stdout() {
        let outcome = supervise(&quick_limits(2000), || {
            let msg = b"42\n";
            let n = unsafe { libc::write(1, msg.as_ptr() as *const libc::c_void, msg.len()) };
            // /dev/null swallows the bytes but reports success
            ProbeReport::returned(n as u64, 0)
        })
        .unwrap();
        assert_eq!(outcome.report.unwrap().word, Some(3));
    }

    #[test]
    fn body_sees_only_stdio_and_the_report_descriptor() {
        let outcome = supervise(&quick_limits(2000), || {
            let open: Vec<RawFd> = (0..64)
                .filter(|fd| unsafe { libc::fcntl(*fd, libc::F_GETFD) } != -1)
                .collect();
            let mask = open.iter().fold(0u64, |acc, fd| acc | (1 << fd));
            ProbeReport::returned(mask, 0)
        })
        .unwrap();
        assert_eq!(outcome.report.unwrap().word, Some(0b1111));
    }

    #[test]
    fn killing_the_supervisor_is_a_supervision_error() {
        let outcome = supervise(&quick_limits(2000), || {
            unsafe {
                libc::kill(libc::getppid(), libc::SIGKILL);
            }
            std::thread::sleep(Duration::from_secs(5));
            ProbeReport::returned(1, 0)
        })
        .unwrap();
        assert!(!outcome.timed_out);
        assert!(outcome.supervision_error.unwrap().contains("signal 9"));
        assert!(outcome.report.is_none());
    }

    #[test]
    fn spawned_processes_are_reaped_before_return() {
        let outcome = supervise(
            &ExecutionLimits {
                process_limit: None,
                ..quick_limits(2000)
            },
            || match unsafe { libc::fork() } {
                0 => unsafe {
                    libc::setsid();
                    libc::sleep(30);
                    libc::_exit(0)
                },
                pid => ProbeReport::returned(pid as u64, 0),
            },
        )
        .unwrap();

        assert_eq!(outcome.reaped_descendants, 1);
        let pid = outcome.report.unwrap().word.unwrap() as i32;
        assert!(pid > 0);
        assert_eq!(
            nix::sys::signal::kill(Pid::from_raw(pid), None),
            Err(Errno::ESRCH)
        );
    }
}

/// File descriptor hygiene for the candidate process
///
/// - Prefer close_range
/// - Fallback to iterating /proc/self/fd
/// - Nothing here logs; it runs after fork
use crate::config::types::{FitboxError, Result};
use nix::fcntl::{fcntl, open, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2};
use std::fs;
use std::os::unix::io::RawFd;

/// Candidate process writes its report here.
pub const REPORT_FD: RawFd = 3;
/// Candidate process writes its setup result here, then closes it.
pub const STAGE_FD: RawFd = 4;
/// The harness writes one byte here once it has read the setup result.
pub const RELEASE_FD: RawFd = 5;
/// Supervising process writes its status here. Never open in the candidate.
pub const STATUS_FD: RawFd = 6;

/// Sources are parked at or above this number while descriptors are moved.
const PARK_FLOOR: RawFd = 32;

/// Point stdin, stdout and stderr at /dev/null so a candidate cannot write
/// into the harness's output channel.
pub fn redirect_stdio_to_null() -> Result<()> {
    let null = open("/dev/null", OFlag::O_RDWR, Mode::empty())
        .map_err(|e| FitboxError::Sandbox(format!("open(/dev/null) failed: {}", e)))?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        dup2(null, target).map_err(|e| FitboxError::Sandbox(format!("dup2(null, {}) failed: {}", target, e)))?;
    }
    if null > libc::STDERR_FILENO {
        let _ = close(null);
    }
    Ok(())
}

/// Move each `(fd, target)` pair so `fd` ends up at `target`, closing the
/// originals. Sources are parked above the targets first, so a source that
/// already sits on another pair's target is never clobbered.
pub fn move_fds(moves: &[(RawFd, RawFd)]) -> Result<()> {
    let mut parked = Vec::with_capacity(moves.len());
    for &(fd, target) in moves {
        let high = fcntl(fd, FcntlArg::F_DUPFD(PARK_FLOOR))
            .map_err(|e| FitboxError::Sandbox(format!("fcntl(F_DUPFD, {}) failed: {}", fd, e)))?;
        let _ = close(fd);
        parked.push((high, target));
    }

    for (high, target) in parked {
        dup2(high, target)
            .map_err(|e| FitboxError::Sandbox(format!("dup2({}, {}) failed: {}", high, target, e)))?;
        let _ = close(high);
    }
    Ok(())
}

/// Close every descriptor numbered `first` or above.
pub fn close_fds_from(first: RawFd) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if try_close_range(first) {
            return Ok(());
        }
    }

    close_fds_via_proc(first)
}

#[cfg(target_os = "linux")]
fn try_close_range(first: RawFd) -> bool {
    let result = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            first as libc::c_uint,
            libc::c_uint::MAX,
            0 as libc::c_uint,
        )
    };
    result == 0
}

fn close_fds_via_proc(first: RawFd) -> Result<()> {
    let fd_dir = "/proc/self/fd";

    // Collect first: closing while iterating would close the directory's own fd.
    let fds: Vec<RawFd> = fs::read_dir(fd_dir)
        .map_err(|e| FitboxError::Sandbox(format!("Failed to read {}: {}", fd_dir, e)))?
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<RawFd>().ok())
        .filter(|fd| *fd >= first)
        .collect();

    for fd in fds {
        match close(fd) {
            Ok(()) | Err(nix::errno::Errno::EBADF) => {}
            Err(e) => {
                return Err(FitboxError::Sandbox(format!("close({}) failed: {}", fd, e)));
            }
        }
    }
    Ok(())
}

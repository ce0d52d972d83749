use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Harness-side termination handling
///
/// If the harness is interrupted while a candidate runs, the candidate's
/// process group is killed before the harness exits.
use std::sync::atomic::{AtomicI32, Ordering};

/// Process group of the evaluation currently running (0 if none)
static ACTIVE_GROUP: AtomicI32 = AtomicI32::new(0);

/// Record the process group of the candidate being supervised.
pub fn set_active_group(pgid: i32) {
    ACTIVE_GROUP.store(pgid, Ordering::SeqCst);
}

/// Forget the candidate group once it has been reaped.
pub fn clear_active_group(pgid: i32) {
    let _ = ACTIVE_GROUP.compare_exchange(pgid, 0, Ordering::SeqCst, Ordering::SeqCst);
}

/// Install handlers for SIGINT, SIGTERM, SIGHUP.
/// Must be called early in main() before any candidate is launched.
pub fn install_termination_handlers() -> Result<(), String> {
    let sig_action = SigAction::new(
        SigHandler::Handler(termination_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        unsafe { signal::sigaction(sig, &sig_action) }
            .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
    }

    info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

// ASYNC-SIGNAL SAFETY: atomics, kill, write and _exit only.
extern "C" fn termination_handler(sig: libc::c_int) {
    let pgid = ACTIVE_GROUP.load(Ordering::SeqCst);
    let msg = b"fitbox: signal received, killing candidate and exiting\n";
    unsafe {
        if pgid > 0 {
            libc::kill(-pgid, libc::SIGKILL);
        }
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_handlers_install() {
        assert!(install_termination_handlers().is_ok());
    }
}

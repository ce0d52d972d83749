/// Resource limits applied to the candidate process
///
/// Runs in the forked child, so nothing here logs: failures are either
/// returned (strict mode) or collected as warnings for the parent to log.
use crate::config::types::{FitboxError, Result};
use crate::core::types::ExecutionLimits;

#[cfg(target_os = "linux")]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(target_os = "linux"))]
type Resource = libc::c_int;

fn apply_rlimit_value(
    name: &str,
    resource: Resource,
    value: u64,
    strict_mode: bool,
    warnings: &mut Vec<String>,
) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };

    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if strict_mode {
        Err(FitboxError::Sandbox(format!(
            "Failed to apply {}={}: {}",
            name, value, err
        )))
    } else {
        warnings.push(format!("{}={} not applied: {}", name, value, err));
        Ok(())
    }
}

/// Apply every configured limit. Returns the warnings of permissive mode.
pub fn apply_candidate_limits(limits: &ExecutionLimits) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    let strict = limits.strict_mode;

    apply_rlimit_value(
        "RLIMIT_CPU",
        libc::RLIMIT_CPU,
        limits.cpu_time_limit_secs,
        strict,
        &mut warnings,
    )?;
    if let Some(bytes) = limits.memory_limit {
        apply_rlimit_value("RLIMIT_AS", libc::RLIMIT_AS, bytes, strict, &mut warnings)?;
    }
    if let Some(bytes) = limits.file_size_limit {
        apply_rlimit_value("RLIMIT_FSIZE", libc::RLIMIT_FSIZE, bytes, strict, &mut warnings)?;
    }
    if let Some(bytes) = limits.core_limit {
        apply_rlimit_value("RLIMIT_CORE", libc::RLIMIT_CORE, bytes, strict, &mut warnings)?;
    }
    if let Some(files) = limits.fd_limit {
        apply_rlimit_value("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, files, strict, &mut warnings)?;
    }
    if let Some(procs) = limits.process_limit {
        apply_rlimit_value(
            "RLIMIT_NPROC",
            libc::RLIMIT_NPROC,
            procs as u64,
            strict,
            &mut warnings,
        )?;
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raising_hard_limit_fails_only_in_strict_mode() {
        // Raising RLIMIT_CORE above the current hard limit needs CAP_SYS_RESOURCE.
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_CORE, &mut current) }, 0);
        if current.rlim_max == libc::RLIM_INFINITY || unsafe { libc::geteuid() } == 0 {
            return;
        }
        let too_high = current.rlim_max as u64 + 1;

        let mut warnings = Vec::new();
        assert!(apply_rlimit_value("RLIMIT_CORE", libc::RLIMIT_CORE, too_high, false, &mut warnings).is_ok());
        assert_eq!(warnings.len(), 1);

        let mut warnings = Vec::new();
        assert!(apply_rlimit_value("RLIMIT_CORE", libc::RLIMIT_CORE, too_high, true, &mut warnings).is_err());
        assert!(warnings.is_empty());
    }
}

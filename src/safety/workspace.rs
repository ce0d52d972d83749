/// Run-scoped workspace for candidate artifacts
///
/// Each evaluation gets its own directory; the artifact is staged there so
/// it cannot be swapped while the candidate runs, and the directory is
/// removed on every exit path.
use crate::config::types::{FitboxError, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Workspace for one evaluation
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
    staged_artifact: Option<PathBuf>,
    cleaned: bool,
}

impl Workspace {
    /// Create a fresh run directory under `base_dir`.
    pub fn new(base_dir: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join(&run_id);

        fs::create_dir_all(&run_dir).map_err(|e| {
            FitboxError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create workspace directory {}: {}", run_dir.display(), e),
            ))
        })?;

        Ok(Self {
            run_id,
            run_dir,
            staged_artifact: None,
            cleaned: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn staged_artifact(&self) -> Option<&Path> {
        self.staged_artifact.as_deref()
    }

    /// Copy `artifact` into the run directory. Returns the staged path.
    pub fn stage_artifact(&mut self, artifact: &Path) -> Result<PathBuf> {
        let name = artifact
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "candidate.so".into());
        let staged = self.run_dir.join(name);

        fs::copy(artifact, &staged).map_err(|e| {
            FitboxError::Filesystem(format!(
                "Failed to stage {} into {}: {}",
                artifact.display(),
                staged.display(),
                e
            ))
        })?;

        self.staged_artifact = Some(staged.clone());
        Ok(staged)
    }

    /// Remove the run directory (idempotent)
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        if self.run_dir.exists() {
            fs::remove_dir_all(&self.run_dir).map_err(|e| {
                FitboxError::Filesystem(format!(
                    "Failed to remove run directory {}: {}",
                    self.run_dir.display(),
                    e
                ))
            })?;
        }
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("{}", e);
        }
    }
}

/// Hex SHA-256 of a file's bytes; the artifact's stable identity.
pub fn artifact_digest(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| {
        FitboxError::Filesystem(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

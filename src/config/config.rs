/// Configuration loading from a JSON file
use crate::config::types::{FitboxError, HarnessConfig, Result};
use std::path::Path;

impl HarnessConfig {
    /// Load configuration from a JSON file. Missing keys take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FitboxError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        Self::from_json(&content)
            .map_err(|e| FitboxError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| FitboxError::Config(format!("Failed to parse config: {}", e)))
    }
}

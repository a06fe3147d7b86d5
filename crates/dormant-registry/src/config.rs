//! Registry configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default cap on registered jobs.
pub const DEFAULT_MAX_JOBS: usize = 100;

/// Tunables for a [`JobRegistry`](crate::JobRegistry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Most jobs the registry will hold at once.
    pub max_jobs: usize,
    /// Where the durable job document lives.
    pub store_path: PathBuf,
}

impl RegistryConfig {
    /// Default location of the job document.
    pub fn default_store_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dormant")
            .join("jobs.json")
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_MAX_JOBS,
            store_path: Self::default_store_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: RegistryConfig = serde_json::from_str(r#"{"max_jobs": 7}"#).unwrap();
        assert_eq!(config.max_jobs, 7);
        assert_eq!(config.store_path, RegistryConfig::default_store_path());
    }

    #[test]
    fn default_path_ends_in_job_document() {
        let path = RegistryConfig::default_store_path();
        assert!(path.ends_with("dormant/jobs.json"));
    }
}

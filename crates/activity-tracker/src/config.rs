//! Runtime configuration for the tracker.
//!
//! Configuration is a small JSON file; every field is optional and falls
//! back to a sensible default rooted in the user's home directory. A
//! missing file is not an error, a malformed one is.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DATA_DIR_NAME: &str = ".github-activity-tracker";
const JOBS_FILE_NAME: &str = "jobs.json";
const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Raw on-disk shape; unset fields resolve to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct RawConfig {
    data_dir: Option<PathBuf>,
    reports_dir: Option<PathBuf>,
    default_max_workers: Option<usize>,
    job_retention_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Root for all persistent tracker state.
    pub data_dir: PathBuf,
    /// Where report artifact directories are created.
    pub reports_dir: PathBuf,
    /// Worker count used when a job request does not specify one.
    /// Zero means auto-detect from the CPU count.
    pub default_max_workers: usize,
    /// Jobs older than this are eligible for cleanup.
    pub job_retention_days: u32,
}

impl TrackerConfig {
    /// Defaults rooted under `~/.github-activity-tracker`.
    pub fn with_defaults() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        let data_dir = home.join(DATA_DIR_NAME);
        Ok(Self {
            reports_dir: data_dir.join("reports"),
            data_dir,
            default_max_workers: 0,
            job_retention_days: DEFAULT_RETENTION_DAYS,
        })
    }

    /// Path of the durable jobs file inside the data directory.
    pub fn jobs_file(&self) -> PathBuf {
        self.data_dir.join(JOBS_FILE_NAME)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let data_dir = match raw.data_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHomeDirectory)?
                .join(DATA_DIR_NAME),
        };
        let reports_dir = raw
            .reports_dir
            .unwrap_or_else(|| data_dir.join("reports"));

        let config = Self {
            data_dir,
            reports_dir,
            default_max_workers: raw.default_max_workers.unwrap_or(0),
            job_retention_days: raw.job_retention_days.unwrap_or(DEFAULT_RETENTION_DAYS),
        };
        validate_config(&config)?;
        Ok(config)
    }
}

/// Loads configuration from a JSON file. A missing file yields the
/// defaults; unreadable or invalid content is an error.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TrackerConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        let config = TrackerConfig::with_defaults()?;
        validate_config(&config)?;
        return Ok(config);
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<TrackerConfig, ConfigError> {
    let raw: RawConfig = serde_json::from_str(content)?;
    TrackerConfig::from_raw(raw)
}

fn validate_config(config: &TrackerConfig) -> Result<(), ConfigError> {
    if config.data_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "data_dir must not be empty".to_string(),
        });
    }
    if config.reports_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "reports_dir must not be empty".to_string(),
        });
    }
    if config.job_retention_days == 0 {
        return Err(ConfigError::Validation {
            message: "job_retention_days must be at least 1".to_string(),
        });
    }
    Ok(())
}

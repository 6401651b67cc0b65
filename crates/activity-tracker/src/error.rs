use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} is still {status}, refusing to {action}")]
    JobStillActive {
        job_id: String,
        status: String,
        action: &'static str,
    },

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Could not determine home directory for default data dir")]
    NoHomeDirectory,
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(String),
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to create report directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write report file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV export failed: {0}")]
    CsvExport(String),

    #[error("No activities to render")]
    NoActivities,
}

pub type Result<T> = std::result::Result<T, TrackerError>;

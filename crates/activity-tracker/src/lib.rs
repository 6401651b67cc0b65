pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod registry;
pub mod report;
pub mod service;
pub mod source;
pub mod store;

pub use config::{load_config, TrackerConfig};
pub use error::{ConfigError, ReportError, Result, TrackerError, WorkerError};
pub use job::{Activity, ActivityKind, JobParameters, JobRecord, JobStatus};
pub use orchestrator::JobOrchestrator;
pub use registry::{lock_job, JobRegistry, SharedJob};
pub use report::{FileReportRenderer, ReportFormat, ReportRenderer};
pub use service::{JobRequest, JobService};
pub use source::{ActivitySource, FetchError};
pub use store::JobStore;

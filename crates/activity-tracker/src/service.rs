//! Facade for submitting and managing tracking jobs.
//!
//! This is the surface an embedding web layer talks to: submit a request,
//! poll snapshots, cancel, delete, clean up. Each submission gets a fresh
//! orchestrator on its own named thread; the service itself never blocks
//! on job execution.

use std::sync::Arc;

use chrono::NaiveDate;
use log::info;
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::error::{Result, TrackerError};
use crate::job::{JobParameters, JobRecord};
use crate::orchestrator::JobOrchestrator;
use crate::registry::{lock_job, JobRegistry};
use crate::report::{FileReportRenderer, ReportFormat, ReportRenderer};
use crate::source::ActivitySource;
use crate::store::JobStore;

/// An incoming tracking request, before validation.
///
/// The full token is used only to authenticate the fetch; what gets
/// persisted is the masked suffix inside [`JobParameters`].
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub token: String,
    pub org: Option<String>,
    pub users: Vec<String>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub output_format: ReportFormat,
    /// Worker count override; `None` falls back to the configured default.
    pub max_workers: Option<usize>,
    pub owner: Option<String>,
    pub owner_id: Option<String>,
}

pub struct JobService {
    config: TrackerConfig,
    store: Arc<JobStore>,
    registry: Arc<JobRegistry>,
    source: Arc<dyn ActivitySource>,
    renderer: Arc<dyn ReportRenderer>,
}

impl JobService {
    /// Builds a service with the default file-based report renderer.
    pub fn new(config: TrackerConfig, source: Arc<dyn ActivitySource>) -> Self {
        let renderer = Arc::new(FileReportRenderer::new(&config.reports_dir));
        Self::with_renderer(config, source, renderer)
    }

    pub fn with_renderer(
        config: TrackerConfig,
        source: Arc<dyn ActivitySource>,
        renderer: Arc<dyn ReportRenderer>,
    ) -> Self {
        let store = Arc::new(JobStore::new(config.jobs_file()));

        // Jobs left mid-flight by a previous process must come back failed,
        // not stuck running forever.
        let repaired = store.repair_interrupted();
        if repaired > 0 {
            info!("Repaired {} interrupted jobs at startup", repaired);
        }

        let registry = Arc::new(JobRegistry::new());
        registry.load_from_store(&store);

        Self {
            config,
            store,
            registry,
            source,
            renderer,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Validates a request, persists the new record, and starts execution
    /// on a dedicated thread. Returns the new job id.
    pub fn submit(&self, request: JobRequest) -> Result<String> {
        validate_request(&request)?;

        let max_workers = request
            .max_workers
            .unwrap_or(self.config.default_max_workers);
        let parameters = JobParameters::new(
            &request.token,
            request.org,
            request.users,
            request.date_from,
            request.date_to,
            request.output_format,
            max_workers,
        );

        let job_id = Uuid::new_v4().to_string();
        let record = JobRecord::new(parameters, request.owner, request.owner_id);

        let shared = self.registry.insert(&job_id, record.clone());
        self.store.save(&job_id, &record);

        info!(
            "Submitted job {} for {} users",
            job_id, record.total_users
        );

        let orchestrator = JobOrchestrator::new(
            job_id.clone(),
            shared,
            Arc::clone(&self.store),
            Arc::clone(&self.source),
            Arc::clone(&self.renderer),
        );
        orchestrator.spawn().map_err(TrackerError::Worker)?;

        Ok(job_id)
    }

    /// Point-in-time copy of one job.
    pub fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        self.registry
            .snapshot(job_id)
            .ok_or_else(|| TrackerError::JobNotFound(job_id.to_string()))
    }

    /// Point-in-time copies of all jobs, newest first.
    pub fn list_jobs(&self) -> Vec<(String, JobRecord)> {
        self.registry.snapshot_all()
    }

    /// URL path for a job's report artifact, when one exists on disk.
    pub fn report_url(&self, record: &JobRecord) -> Option<String> {
        let path = record.report_path.as_ref()?;
        if !path.exists() {
            return None;
        }
        let name = path.file_name()?.to_string_lossy();
        Some(format!("/reports/{name}"))
    }

    /// Requests cooperative cancellation. Returns true when the job was
    /// downgraded to cancelled, false when it had already reached a
    /// terminal state.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let shared = self
            .registry
            .get(job_id)
            .ok_or_else(|| TrackerError::JobNotFound(job_id.to_string()))?;

        let mut job = lock_job(&shared);
        if job.mark_cancelled() {
            info!("Job {} marked as cancelled", job_id);
            self.store.save(job_id, &job);
            Ok(true)
        } else {
            info!(
                "Job {} already {} when cancellation was requested",
                job_id, job.status
            );
            Ok(false)
        }
    }

    /// Removes a finished job and its report artifact. Active jobs are
    /// refused; cancel first.
    pub fn delete(&self, job_id: &str) -> Result<()> {
        let snapshot = self
            .registry
            .snapshot(job_id)
            .ok_or_else(|| TrackerError::JobNotFound(job_id.to_string()))?;

        if !snapshot.is_finished() {
            return Err(TrackerError::JobStillActive {
                job_id: job_id.to_string(),
                status: snapshot.status.to_string(),
                action: "delete",
            });
        }

        self.registry.remove(job_id);
        self.store.delete(job_id);
        Ok(())
    }

    /// Removes jobs older than the configured retention window. Returns
    /// how many were removed; zero when the store lock could not be taken.
    ///
    /// Only the pruned entries leave the registry. Surviving entries keep
    /// their shared handles: a running orchestrator and its cancellers must
    /// stay on the same record across a cleanup.
    pub fn clean_old_jobs(&self) -> usize {
        let max_age = chrono::Duration::days(i64::from(self.config.job_retention_days));
        let removed = self.store.clean_old(max_age);
        for job_id in &removed {
            self.registry.remove(job_id);
        }
        removed.len()
    }
}

fn validate_request(request: &JobRequest) -> Result<()> {
    if request.token.trim().is_empty() {
        return Err(TrackerError::InvalidRequest(
            "an API token is required".to_string(),
        ));
    }
    if request.users.is_empty() {
        return Err(TrackerError::InvalidRequest(
            "at least one username is required".to_string(),
        ));
    }
    if request.users.iter().any(|u| u.trim().is_empty()) {
        return Err(TrackerError::InvalidRequest(
            "usernames must not be blank".to_string(),
        ));
    }
    if request.date_from > request.date_to {
        return Err(TrackerError::InvalidRequest(format!(
            "date_from {} is after date_to {}",
            request.date_from, request.date_to
        )));
    }
    Ok(())
}

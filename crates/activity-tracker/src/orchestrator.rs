//! Drives one job's execution lifecycle.
//!
//! One orchestrator instance owns one job record for the duration of a run:
//! it fans usernames out across a bounded pool of worker threads, merges
//! each worker's outcome back into the record under the per-job mutex,
//! persists after every merge, and walks the status state machine through
//! to a terminal state. Per-user failure is never fatal; a top-level guard
//! converts any unanticipated fault into a `Failed` record rather than
//! leaving the job stuck mid-flight.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Utc;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::error::{Result, TrackerError, WorkerError};
use crate::job::{Activity, JobStatus};
use crate::registry::{lock_job, SharedJob};
use crate::report::ReportRenderer;
use crate::source::ActivitySource;
use crate::store::JobStore;

/// Ceiling for auto-detected worker counts.
const MAX_AUTO_WORKERS: usize = 8;

/// What a per-user worker reports back to the orchestrator.
enum WorkerEvent {
    /// A worker picked up this username.
    Started(String),
    /// The fetch finished, successfully or not.
    Finished { username: String, outcome: Outcome },
}

enum Outcome {
    Fetched(Vec<Activity>),
    Errored(String),
    /// The job was already cancelled when the worker got to this user;
    /// nothing was fetched and the user does not count as processed.
    Skipped,
}

pub struct JobOrchestrator {
    job_id: String,
    job: SharedJob,
    store: Arc<JobStore>,
    source: Arc<dyn ActivitySource>,
    renderer: Arc<dyn ReportRenderer>,
}

impl JobOrchestrator {
    pub fn new(
        job_id: impl Into<String>,
        job: SharedJob,
        store: Arc<JobStore>,
        source: Arc<dyn ActivitySource>,
        renderer: Arc<dyn ReportRenderer>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job,
            store,
            source,
            renderer,
        }
    }

    /// Runs the orchestration on a dedicated named thread.
    pub fn spawn(self) -> std::result::Result<JoinHandle<()>, WorkerError> {
        let name = format!("job-{}", self.job_id);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))
    }

    /// Executes the job to a terminal state. Never panics outward: any
    /// fault that escapes the orchestration body forces the record to
    /// `Failed` with an end time before this returns.
    pub fn run(&self) {
        info!("=== Starting job {} ===", self.job_id);

        match catch_unwind(AssertUnwindSafe(|| self.run_inner())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Error in tracking job {}: {}", self.job_id, e);
                self.fail_job(format!("Error in tracking job: {e}"));
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!(
                    "Unhandled fault in job thread {}: {}",
                    self.job_id, message
                );
                self.fail_job(format!("Unhandled fault in job thread: {message}"));
            }
        }

        // Whatever happened above, the record must leave with an end time.
        {
            let mut job = lock_job(&self.job);
            if job.end_time.is_none() {
                job.end_time = Some(Utc::now());
            }
            if !self.store.save(&self.job_id, &job) {
                error!("Failed final persist for job {}", self.job_id);
            }
        }

        info!("=== Job {} finished ===", self.job_id);
    }

    fn run_inner(&self) -> Result<()> {
        let (users, requested_workers) = {
            let mut job = lock_job(&self.job);

            // An externally cancelled job skips dispatch entirely.
            if job.status == JobStatus::Cancelled {
                info!("Job {} was cancelled before dispatch, skipping", self.job_id);
                self.store.save(&self.job_id, &job);
                return Ok(());
            }

            job.transition(JobStatus::Running);
            job.activities.clear();
            job.processed_users = 0;
            self.store.save(&self.job_id, &job);

            (
                job.parameters.users.clone(),
                job.parameters.max_workers,
            )
        };

        let worker_count = effective_worker_count(requested_workers);
        info!(
            "Using {} parallel workers for processing {} users",
            worker_count,
            users.len()
        );

        self.run_workers(&users, worker_count)?;

        // Cancelled jobs stop here: no report, in-flight results discarded.
        {
            let mut job = lock_job(&self.job);
            if job.status == JobStatus::Cancelled {
                info!("Job {} was cancelled, stopping processing", self.job_id);
                job.current_user = None;
                self.store.save(&self.job_id, &job);
                return Ok(());
            }
        }

        self.generate_report();
        self.finalize();
        Ok(())
    }

    /// Fans out one worker task per username across `worker_count` threads
    /// and merges outcomes as they complete, in arbitrary completion order.
    fn run_workers(&self, users: &[String], worker_count: usize) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }

        let (user_tx, user_rx) = unbounded::<String>();
        for username in users {
            // Cannot fail: the receiver is alive in this scope.
            let _ = user_tx.send(username.clone());
        }
        drop(user_tx);

        let (event_tx, event_rx) = bounded::<WorkerEvent>(users.len() * 2);

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let user_rx = user_rx.clone();
            let event_tx = event_tx.clone();
            let source = Arc::clone(&self.source);
            let job = Arc::clone(&self.job);
            let job_id = self.job_id.clone();

            let handle = std::thread::Builder::new()
                .name(format!("job-{}-worker-{}", self.job_id, worker_id))
                .spawn(move || {
                    run_worker(worker_id, &job_id, job, source, user_rx, event_tx);
                })
                .map_err(|e| TrackerError::Worker(WorkerError::SpawnFailed(e.to_string())))?;
            handles.push(handle);
        }
        drop(event_tx);

        // Receive until every worker has hung up its sender.
        for event in event_rx.iter() {
            match event {
                WorkerEvent::Started(username) => {
                    let mut job = lock_job(&self.job);
                    job.current_user = Some(username);
                }
                WorkerEvent::Finished { username, outcome } => {
                    self.merge_outcome(&username, outcome);
                }
            }
        }

        for (i, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.join() {
                let message = panic_message(&e);
                error!("Worker {} panicked: {}", i, message);
                let mut job = lock_job(&self.job);
                job.errors
                    .push(format!("Worker thread {i} panicked: {message}"));
                self.store.save(&self.job_id, &job);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        Ok(())
    }

    /// Merges one worker outcome into the record. Extend, count, and
    /// persist all happen in one critical section so concurrent workers
    /// can never interleave partial updates.
    fn merge_outcome(&self, username: &str, outcome: Outcome) {
        let mut job = lock_job(&self.job);
        match outcome {
            Outcome::Fetched(activities) => {
                if job.status == JobStatus::Cancelled {
                    // In-flight result arriving after cancellation: discard
                    // wholesale, the user does not count as processed.
                    debug!(
                        "Discarding {} activities for {} on cancelled job {}",
                        activities.len(),
                        username,
                        self.job_id
                    );
                    return;
                }
                if !activities.is_empty() {
                    info!(
                        "Found {} activities for user {}",
                        activities.len(),
                        username
                    );
                    job.activities.extend(activities);
                } else {
                    info!("No activities found for user {}", username);
                }
                job.processed_users += 1;
            }
            Outcome::Errored(message) => {
                error!("{}", message);
                job.errors.push(message);
                job.processed_users += 1;
            }
            Outcome::Skipped => {
                debug!(
                    "User {} skipped on cancelled job {}",
                    username, self.job_id
                );
                return;
            }
        }
        debug_assert!(job.processed_users <= job.total_users);
        self.store.save(&self.job_id, &job);
    }

    /// Report phase: only entered when activities exist. A rendering
    /// failure is appended to `errors` and the job keeps progressing;
    /// collected activity data is the primary value.
    fn generate_report(&self) {
        let (activities, format) = {
            let mut job = lock_job(&self.job);
            if job.activities.is_empty() {
                warn!("No activities found for any users in job {}", self.job_id);
                job.errors
                    .push("No activities found for any users".to_string());
                return;
            }
            info!(
                "Generating {} report with {} activities",
                job.parameters.output_format,
                job.activities.len()
            );
            job.transition(JobStatus::GeneratingReport);
            self.store.save(&self.job_id, &job);
            (job.activities.clone(), job.parameters.output_format)
        };

        // Rendering happens off the job mutex; pollers stay unblocked.
        match self.renderer.generate_report(&activities, format) {
            Ok(report_path) => {
                info!("Report generated at {}", report_path.display());
                let mut job = lock_job(&self.job);
                job.report_path = Some(report_path);
            }
            Err(e) => {
                let message = format!("Error generating report: {e}");
                error!("{}", message);
                let mut job = lock_job(&self.job);
                job.errors.push(message);
            }
        }
    }

    fn finalize(&self) {
        let mut job = lock_job(&self.job);

        // Cancellation observed during the report phase: the report may
        // have completed, but the job stays cancelled.
        if job.status == JobStatus::Cancelled {
            job.current_user = None;
            self.store.save(&self.job_id, &job);
            return;
        }

        // Force 100%: errored users were still processed.
        job.processed_users = job.total_users;
        job.current_user = None;
        job.transition(JobStatus::Completed);
        job.end_time = Some(Utc::now());
        self.store.save(&self.job_id, &job);

        info!(
            "Job {} completed: {} activities, {} errors",
            self.job_id,
            job.activities.len(),
            job.errors.len()
        );
    }

    fn fail_job(&self, message: String) {
        let mut job = lock_job(&self.job);
        job.mark_failed(message);
        if !self.store.save(&self.job_id, &job) {
            error!(
                "Could not persist failed status for job {}",
                self.job_id
            );
        }
    }
}

/// Requested value when positive, otherwise a bounded auto-detected
/// default of `min(8, cpu_count * 2)`.
fn effective_worker_count(requested: usize) -> usize {
    if requested > 0 {
        requested
    } else {
        let cpu_count = num_cpus::get().max(1);
        MAX_AUTO_WORKERS.min(cpu_count * 2)
    }
}

fn run_worker(
    worker_id: usize,
    job_id: &str,
    job: SharedJob,
    source: Arc<dyn ActivitySource>,
    user_rx: Receiver<String>,
    event_tx: Sender<WorkerEvent>,
) {
    debug!("Worker {} started", worker_id);

    for username in user_rx.iter() {
        // Cooperative cancellation checkpoint: not-yet-started users are
        // skipped once the job is cancelled.
        let (cancelled, date_from, date_to, org) = {
            let job = lock_job(&job);
            (
                job.status == JobStatus::Cancelled,
                job.parameters.date_from,
                job.parameters.date_to,
                job.parameters.org.clone(),
            )
        };
        if cancelled {
            info!("Job {} was cancelled, skipping user {}", job_id, username);
            let _ = event_tx.send(WorkerEvent::Finished {
                username,
                outcome: Outcome::Skipped,
            });
            continue;
        }

        let _ = event_tx.send(WorkerEvent::Started(username.clone()));
        info!("Starting to process user: {}", username);

        // The source is an external client; a panic in it is just another
        // per-user failure, never a crash of the pool.
        let fetched = catch_unwind(AssertUnwindSafe(|| {
            source.fetch_user_activities(&username, date_from, date_to, org.as_deref())
        }));

        let outcome = match fetched {
            Ok(Ok(activities)) => Outcome::Fetched(activities),
            Ok(Err(e)) => Outcome::Errored(format!(
                "Error tracking activities for user {username}: {e}"
            )),
            Err(panic) => Outcome::Errored(format!(
                "Worker fault while processing user {username}: {}",
                panic_message(&panic)
            )),
        };

        if event_tx
            .send(WorkerEvent::Finished { username, outcome })
            .is_err()
        {
            error!("Worker {} failed to send result", worker_id);
            break;
        }
    }

    debug!("Worker {} stopped", worker_id);
}

/// Best-effort extraction of a panic payload's message.
fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_worker_count_uses_request() {
        assert_eq!(effective_worker_count(3), 3);
        assert_eq!(effective_worker_count(12), 12);
    }

    #[test]
    fn test_effective_worker_count_auto_is_bounded() {
        let auto = effective_worker_count(0);
        assert!(auto >= 1);
        assert!(auto <= MAX_AUTO_WORKERS);
    }
}

//! In-memory mirror of the job store for low-latency status reads.
//!
//! The registry is an explicit object constructed once at process start and
//! passed by handle; it is never ambient global state. Each job is held
//! behind its own mutex: the orchestrator owns that mutex for the duration
//! of execution, while pollers and cancellers take it only briefly to read
//! or downgrade status. Registry reads never touch the store's lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};

use crate::job::JobRecord;
use crate::store::JobStore;

/// Shared handle to one job's mutable record.
pub type SharedJob = Arc<Mutex<JobRecord>>;

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, SharedJob>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populates the registry from the store at process start. Existing
    /// in-memory entries are discarded; the store is the source of truth.
    pub fn load_from_store(&self, store: &JobStore) {
        let persisted = store.load_all();
        let count = persisted.len();

        let mut jobs = self.write_jobs();
        jobs.clear();
        for (job_id, record) in persisted {
            jobs.insert(job_id, Arc::new(Mutex::new(record)));
        }

        if count > 0 {
            info!("Loaded {} jobs from persistent storage", count);
        }
    }

    /// Registers a new record, returning the shared handle the orchestrator
    /// will own for the duration of execution.
    pub fn insert(&self, job_id: &str, record: JobRecord) -> SharedJob {
        let shared = Arc::new(Mutex::new(record));
        self.write_jobs()
            .insert(job_id.to_string(), Arc::clone(&shared));
        shared
    }

    pub fn get(&self, job_id: &str) -> Option<SharedJob> {
        self.read_jobs().get(job_id).cloned()
    }

    /// Point-in-time copy of one record.
    pub fn snapshot(&self, job_id: &str) -> Option<JobRecord> {
        let shared = self.get(job_id)?;
        let record = lock_job(&shared).clone();
        Some(record)
    }

    /// Point-in-time copies of every record, newest submission first.
    pub fn snapshot_all(&self) -> Vec<(String, JobRecord)> {
        let jobs = self.read_jobs();
        let mut snapshots: Vec<(String, JobRecord)> = jobs
            .iter()
            .map(|(id, shared)| (id.clone(), lock_job(shared).clone()))
            .collect();
        snapshots.sort_by(|a, b| b.1.start_time.cmp(&a.1.start_time));
        snapshots
    }

    pub fn remove(&self, job_id: &str) -> Option<SharedJob> {
        self.write_jobs().remove(job_id)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.read_jobs().contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.read_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_jobs().is_empty()
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, SharedJob>> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_jobs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, SharedJob>> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Job registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Locks one job's record, recovering from a poisoned mutex. A worker panic
/// must not make the job unreadable for pollers.
pub fn lock_job(shared: &SharedJob) -> std::sync::MutexGuard<'_, JobRecord> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Job record lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobParameters, JobStatus};
    use tempfile::TempDir;

    fn record() -> JobRecord {
        JobRecord::new(JobParameters::default(), None, None)
    }

    #[test]
    fn test_insert_and_snapshot() {
        let registry = JobRegistry::new();
        registry.insert("job-1", record());

        let snapshot = registry.snapshot("job-1").unwrap();
        assert_eq!(snapshot.status, JobStatus::Initializing);
        assert!(registry.contains("job-1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_shared_handle_mutations_are_visible() {
        let registry = JobRegistry::new();
        let shared = registry.insert("job-1", record());

        {
            let mut job = lock_job(&shared);
            job.transition(JobStatus::Running);
            job.processed_users = 3;
        }

        let snapshot = registry.snapshot("job-1").unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);
        assert_eq!(snapshot.processed_users, 3);
    }

    #[test]
    fn test_load_from_store_mirrors_persisted_jobs() {
        let temp = TempDir::new().unwrap();
        let store = JobStore::new(temp.path().join("jobs.json"));
        store.save("persisted", &record());

        let registry = JobRegistry::new();
        registry.insert("stale-memory-only", record());
        registry.load_from_store(&store);

        assert!(registry.contains("persisted"));
        assert!(!registry.contains("stale-memory-only"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_all_sorted_newest_first() {
        let registry = JobRegistry::new();
        let mut older = record();
        older.start_time = older.start_time - chrono::Duration::hours(1);
        registry.insert("older", older);
        registry.insert("newer", record());

        let all = registry.snapshot_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "newer");
        assert_eq!(all[1].0, "older");
    }

    #[test]
    fn test_remove() {
        let registry = JobRegistry::new();
        registry.insert("job-1", record());
        assert!(registry.remove("job-1").is_some());
        assert!(registry.snapshot("job-1").is_none());
        assert!(registry.is_empty());
    }
}

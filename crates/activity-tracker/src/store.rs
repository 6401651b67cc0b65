//! Durable, crash-safe persistence for job records.
//!
//! The entire collection lives in one JSON file, `job_id -> JobRecord`.
//! Every logical operation is a full load-modify-save of the whole
//! collection under a single process-wide mutex. Writes go to a temp file,
//! are validated by parsing them back, and only then replace the primary
//! atomically. A corrupt primary is never fatal: it gets backed up with a
//! timestamp and the store resets to an empty collection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::job::JobRecord;

/// How long `clean_old` will wait for the store lock before giving up.
const CLEANUP_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const CLEANUP_LOCK_POLL: Duration = Duration::from_millis(50);

pub struct JobStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JobStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Job store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Loads the entire persisted collection. Fails soft: any unreadable or
    /// malformed storage is backed up, reset to empty, and an empty map is
    /// returned. Never errors to the caller.
    pub fn load_all(&self) -> BTreeMap<String, JobRecord> {
        let _guard = self.lock();
        self.load_unlocked()
    }

    /// Persists the full collection. Returns false (leaving the primary
    /// file untouched) when the write cannot be validated.
    pub fn save_all(&self, jobs: &BTreeMap<String, JobRecord>) -> bool {
        let _guard = self.lock();
        self.save_unlocked(jobs)
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        let _guard = self.lock();
        self.load_unlocked().remove(job_id)
    }

    /// Upserts a single record via load-modify-save under the lock.
    pub fn save(&self, job_id: &str, record: &JobRecord) -> bool {
        debug!("Saving job {} to storage", job_id);
        let _guard = self.lock();
        let mut jobs = self.load_unlocked();
        jobs.insert(job_id.to_string(), record.clone());
        let result = self.save_unlocked(&jobs);
        debug!("Job {} saved to storage: {}", job_id, result);
        result
    }

    /// Removes a record and its report artifact. Returns false when the job
    /// does not exist or the save could not be validated.
    pub fn delete(&self, job_id: &str) -> bool {
        let _guard = self.lock();
        let mut jobs = self.load_unlocked();
        let Some(record) = jobs.remove(job_id) else {
            warn!("Job {} not found for deletion", job_id);
            return false;
        };

        let result = self.save_unlocked(&jobs);

        if let Some(report_path) = &record.report_path {
            if report_path.exists() {
                match std::fs::remove_dir_all(report_path) {
                    Ok(()) => info!(
                        "Deleted report directory for job {}: {}",
                        job_id,
                        report_path.display()
                    ),
                    Err(e) => error!(
                        "Error deleting report directory for job {}: {}",
                        job_id, e
                    ),
                }
            }
        }

        info!("Deleted job {}", job_id);
        result
    }

    /// Removes records whose `end_time` (or `start_time` when absent) is
    /// older than `max_age` and returns the ids actually removed. Waits at
    /// most two seconds for the store lock; on timeout the cleanup aborts
    /// and reports nothing removed rather than blocking indefinitely. The
    /// same holds when the pruned collection cannot be persisted: the
    /// primary file is unchanged, so no removals are reported.
    pub fn clean_old(&self, max_age: chrono::Duration) -> Vec<String> {
        debug!("Starting clean_old with max_age={}", max_age);

        let deadline = Instant::now() + CLEANUP_LOCK_TIMEOUT;
        let _guard = loop {
            match self.lock.try_lock() {
                Ok(guard) => break guard,
                Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                    warn!("Job store lock was poisoned, recovering");
                    break poisoned.into_inner();
                }
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        warn!("Timed out waiting for store lock in clean_old, cleanup aborted");
                        return Vec::new();
                    }
                    std::thread::sleep(CLEANUP_LOCK_POLL);
                }
            }
        };

        let mut jobs = self.load_unlocked();
        let cutoff = Utc::now() - max_age;
        debug!("Cutoff for cleanup: {}", cutoff);

        let mut removed = Vec::new();
        jobs.retain(|job_id, record| {
            let keep = record.retention_time() >= cutoff;
            if !keep {
                debug!("Job {} is older than cutoff, removing", job_id);
                removed.push(job_id.clone());
            }
            keep
        });

        if !removed.is_empty() && !self.save_unlocked(&jobs) {
            error!(
                "Failed to save jobs after removing {} old entries, nothing was cleaned",
                removed.len()
            );
            return Vec::new();
        }

        info!("Cleaned {} jobs older than {}", removed.len(), max_age);
        removed
    }

    /// Marks records stuck in a non-terminal state as failed. Intended to
    /// run once at process start, before the registry loads: a job whose
    /// process died mid-run must not stay `running` forever.
    pub fn repair_interrupted(&self) -> usize {
        let _guard = self.lock();
        let mut jobs = self.load_unlocked();

        let mut repaired = 0;
        for (job_id, record) in jobs.iter_mut() {
            if !record.is_finished() {
                warn!(
                    "Job {} was {} at shutdown, marking failed",
                    job_id, record.status
                );
                record.mark_failed("job interrupted by process restart before completion");
                repaired += 1;
            }
        }

        if repaired > 0 && !self.save_unlocked(&jobs) {
            error!("Failed to persist {} repaired jobs", repaired);
        }
        repaired
    }

    // ─── Internals (caller holds the lock) ──────────────────────────────

    /// Creates the storage directory and an empty jobs file if absent.
    fn ensure_file(&self) {
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    error!("Failed to create jobs directory {}: {}", dir.display(), e);
                    return;
                }
                debug!("Created jobs directory: {}", dir.display());
            }
        }

        if !self.path.exists() {
            match std::fs::write(&self.path, "{}") {
                Ok(()) => info!("Created empty jobs file: {}", self.path.display()),
                Err(e) => error!("Failed to create jobs file: {}", e),
            }
        }
    }

    fn load_unlocked(&self) -> BTreeMap<String, JobRecord> {
        self.ensure_file();

        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) => {
                error!("Error reading jobs file {}: {}", self.path.display(), e);
                return BTreeMap::new();
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                error!("Jobs file contains invalid JSON: {}", e);
                self.backup_corrupt();
                self.reset_to_empty();
                return BTreeMap::new();
            }
        };

        let serde_json::Value::Object(entries) = value else {
            error!("Jobs data is not a mapping, resetting to empty collection");
            self.backup_corrupt();
            self.reset_to_empty();
            return BTreeMap::new();
        };

        let mut jobs = BTreeMap::new();
        for (job_id, entry) in entries {
            match serde_json::from_value::<JobRecord>(entry) {
                Ok(record) => {
                    jobs.insert(job_id, record);
                }
                Err(e) => {
                    // One bad record must not abort the whole load.
                    warn!(
                        "Invalid job data for job {}, replacing with placeholder: {}",
                        job_id, e
                    );
                    jobs.insert(job_id, JobRecord::placeholder(&e.to_string()));
                }
            }
        }

        debug!("Loaded {} jobs from storage", jobs.len());
        jobs
    }

    fn save_unlocked(&self, jobs: &BTreeMap<String, JobRecord>) -> bool {
        self.ensure_file();

        let serialized = match serde_json::to_string_pretty(jobs) {
            Ok(serialized) => serialized,
            Err(e) => {
                error!("Error serializing jobs data: {}", e);
                return false;
            }
        };

        let temp_path = self.path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&temp_path, &serialized) {
            error!("Error writing temp jobs file {}: {}", temp_path.display(), e);
            return false;
        }

        // Validate by reading the write back before touching the primary.
        match std::fs::read_to_string(&temp_path)
            .map_err(|e| e.to_string())
            .and_then(|content| {
                serde_json::from_str::<BTreeMap<String, JobRecord>>(&content)
                    .map_err(|e| e.to_string())
            }) {
            Ok(_) => {}
            Err(reason) => {
                error!("Written jobs file failed validation: {}", reason);
                let _ = std::fs::remove_file(&temp_path);
                return false;
            }
        }

        // Fast path: atomic rename. Fallback keeps the previous good
        // version as a backup until the new one is confirmed in place.
        if let Err(rename_err) = std::fs::rename(&temp_path, &self.path) {
            debug!(
                "Atomic rename unavailable ({}), falling back to backup-then-copy",
                rename_err
            );
            let backup_path = self.path.with_extension("json.bak");
            if self.path.exists() {
                if let Err(e) = std::fs::copy(&self.path, &backup_path) {
                    warn!("Could not create backup file: {}", e);
                }
            }
            if let Err(e) = std::fs::copy(&temp_path, &self.path) {
                error!("Error replacing jobs file: {}", e);
                let _ = std::fs::remove_file(&temp_path);
                return false;
            }
            let _ = std::fs::remove_file(&temp_path);
        }

        debug!("Saved {} jobs to storage", jobs.len());
        true
    }

    /// Preserves the current (corrupt) primary with a timestamped suffix.
    fn backup_corrupt(&self) {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let backup_path = PathBuf::from(format!("{}.bak.{}", self.path.display(), stamp));
        match std::fs::copy(&self.path, &backup_path) {
            Ok(_) => info!(
                "Created backup of corrupted jobs file at {}",
                backup_path.display()
            ),
            Err(e) => warn!("Could not create backup of jobs file: {}", e),
        }
    }

    fn reset_to_empty(&self) {
        match std::fs::write(&self.path, "{}") {
            Ok(()) => info!("Reset jobs file to empty collection"),
            Err(e) => error!("Could not reset jobs file: {}", e),
        }
    }

    #[cfg(test)]
    fn hold_lock_for_test(&self) -> MutexGuard<'_, ()> {
        self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobParameters, JobStatus};
    use crate::job::{Activity, ActivityKind};
    use crate::report::ReportFormat;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn sample_record() -> JobRecord {
        let params = JobParameters::new(
            "ghp_secret9876",
            Some("acme".to_string()),
            vec!["alice".to_string(), "bob".to_string()],
            NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap(),
            ReportFormat::Csv,
            4,
        );
        let mut record = JobRecord::new(params, Some("alice".to_string()), Some("u1".to_string()));
        record.activities.push(Activity::new(
            "alice",
            Utc::now(),
            ActivityKind::Review,
            "acme/widgets",
            "42",
            "https://github.com/acme/widgets/pull/42",
        ));
        record
    }

    fn store_in(dir: &TempDir) -> JobStore {
        JobStore::new(dir.path().join("jobs.json"))
    }

    #[test]
    fn test_load_all_creates_empty_file() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        assert!(store.load_all().is_empty());
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap().trim(),
            "{}"
        );
    }

    #[test]
    fn test_save_then_get_round_trips_exactly() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let record = sample_record();
        assert!(store.save("job-1", &record));

        let loaded = store.get("job-1").expect("record should exist");
        assert_eq!(loaded, record);
        assert_eq!(loaded.start_time, record.start_time);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        assert!(store.get("nope").is_none());
    }

    #[test]
    fn test_corrupt_file_recovers_with_backup() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        std::fs::write(store.path(), "{not valid json!!").unwrap();

        let jobs = store.load_all();
        assert!(jobs.is_empty());

        // Storage was reset to a valid empty collection
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap().trim(),
            "{}"
        );

        // And the corrupt content survives in a timestamped backup
        let backup = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().contains(".bak."))
            .expect("backup file should exist");
        let backed_up = std::fs::read_to_string(backup.path()).unwrap();
        assert_eq!(backed_up, "{not valid json!!");
    }

    #[test]
    fn test_non_mapping_file_resets() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        std::fs::write(store.path(), "[1, 2, 3]").unwrap();
        assert!(store.load_all().is_empty());
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap().trim(),
            "{}"
        );
    }

    #[test]
    fn test_invalid_record_becomes_placeholder() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        std::fs::write(
            store.path(),
            r#"{"good": {"status": "completed", "start_time": "2026-01-01T00:00:00Z"},
                "bad": "not a mapping"}"#,
        )
        .unwrap();

        let jobs = store.load_all();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs["good"].status, JobStatus::Completed);
        assert_eq!(jobs["bad"].status, JobStatus::Failed);
        assert!(jobs["bad"].errors[0].contains("invalid job record recovered"));
    }

    #[test]
    fn test_save_failure_leaves_primary_untouched() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let mut jobs = BTreeMap::new();
        jobs.insert("job-1".to_string(), sample_record());
        assert!(store.save_all(&jobs));
        let before = std::fs::read_to_string(store.path()).unwrap();

        // Point a second store at an impossible path: the parent is a
        // regular file, so the temp write must fail and save_all report it.
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").unwrap();
        let broken = JobStore::new(blocker.join("jobs.json"));
        assert!(!broken.save_all(&jobs));

        // The good store's primary is unchanged
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn test_delete_removes_record_and_report_dir() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let report_dir = temp.path().join("report-1");
        std::fs::create_dir_all(&report_dir).unwrap();
        std::fs::write(report_dir.join("index.html"), "<html></html>").unwrap();

        let mut record = sample_record();
        record.report_path = Some(report_dir.clone());
        store.save("job-1", &record);

        assert!(store.delete("job-1"));
        assert!(store.get("job-1").is_none());
        assert!(!report_dir.exists());
    }

    #[test]
    fn test_delete_missing_returns_false() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);
        assert!(!store.delete("ghost"));
    }

    #[test]
    fn test_clean_old_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let mut old_record = sample_record();
        old_record.start_time = Utc::now() - chrono::Duration::days(90);
        old_record.end_time = Some(Utc::now() - chrono::Duration::days(89));
        store.save("old", &old_record);
        store.save("fresh", &sample_record());

        let removed = store.clean_old(chrono::Duration::days(30));
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());

        // Second pass with no new jobs removes nothing
        assert!(store.clean_old(chrono::Duration::days(30)).is_empty());
    }

    #[test]
    fn test_clean_old_uses_start_time_when_unfinished() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let mut record = sample_record();
        record.start_time = Utc::now() - chrono::Duration::days(45);
        record.end_time = None;
        store.save("stale", &record);

        assert_eq!(store.clean_old(chrono::Duration::days(30)).len(), 1);
    }

    #[test]
    fn test_clean_old_reports_nothing_when_save_fails() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let mut old_record = sample_record();
        old_record.start_time = Utc::now() - chrono::Duration::days(90);
        old_record.end_time = Some(Utc::now() - chrono::Duration::days(89));
        store.save("old", &old_record);

        // A directory squatting on the temp path makes the pruned write
        // fail, so the primary keeps the old record.
        let temp_path = store.path().with_extension("json.tmp");
        std::fs::create_dir(&temp_path).unwrap();

        assert!(store.clean_old(chrono::Duration::days(30)).is_empty());
        assert!(store.get("old").is_some());

        // With the obstruction gone the cleanup goes through
        std::fs::remove_dir(&temp_path).unwrap();
        assert_eq!(
            store.clean_old(chrono::Duration::days(30)),
            vec!["old".to_string()]
        );
        assert!(store.get("old").is_none());
    }

    #[test]
    fn test_clean_old_aborts_on_held_lock() {
        let temp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(store_in(&temp));

        let mut old_record = sample_record();
        old_record.start_time = Utc::now() - chrono::Duration::days(90);
        store.save("old", &old_record);

        let guard = store.hold_lock_for_test();
        let cleaner = {
            let store = std::sync::Arc::clone(&store);
            std::thread::spawn(move || store.clean_old(chrono::Duration::days(30)))
        };
        // The cleaner gives up rather than waiting forever
        assert!(cleaner.join().unwrap().is_empty());
        drop(guard);

        // With the lock free it works
        assert_eq!(store.clean_old(chrono::Duration::days(30)).len(), 1);
    }

    #[test]
    fn test_repair_interrupted_fails_stuck_jobs() {
        let temp = TempDir::new().unwrap();
        let store = store_in(&temp);

        let mut running = sample_record();
        running.transition(JobStatus::Running);
        store.save("stuck", &running);

        let mut done = sample_record();
        done.transition(JobStatus::Running);
        done.transition(JobStatus::Completed);
        done.end_time = Some(Utc::now());
        store.save("done", &done);

        assert_eq!(store.repair_interrupted(), 1);

        let repaired = store.get("stuck").unwrap();
        assert_eq!(repaired.status, JobStatus::Failed);
        assert!(repaired.end_time.is_some());
        assert!(repaired.errors[0].contains("interrupted"));

        assert_eq!(store.get("done").unwrap().status, JobStatus::Completed);
        // Idempotent
        assert_eq!(store.repair_interrupted(), 0);
    }

    #[test]
    fn test_save_all_survives_process_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("jobs.json");

        {
            let store = JobStore::new(&path);
            store.save("job-1", &sample_record());
        }

        // A brand new store instance sees the same data
        let store = JobStore::new(&path);
        assert!(store.get("job-1").is_some());
    }
}

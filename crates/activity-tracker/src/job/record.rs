use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::job::activity::Activity;
use crate::job::status::JobStatus;
use crate::report::ReportFormat;

/// The original tracking request, as persisted with the job.
///
/// The API token is never stored in full; only a masked suffix is kept so
/// the UI can show which credential a job ran with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobParameters {
    /// Masked token, `"***"` plus the last four characters.
    pub token_suffix: String,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub users: Vec<String>,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    #[serde(default)]
    pub output_format: ReportFormat,
    /// Requested worker count; 0 means auto-detect.
    #[serde(default)]
    pub max_workers: usize,
}

impl JobParameters {
    pub fn new(
        token: &str,
        org: Option<String>,
        users: Vec<String>,
        date_from: NaiveDate,
        date_to: NaiveDate,
        output_format: ReportFormat,
        max_workers: usize,
    ) -> Self {
        Self {
            token_suffix: mask_token(token),
            org,
            users,
            date_from,
            date_to,
            output_format,
            max_workers,
        }
    }
}

impl Default for JobParameters {
    fn default() -> Self {
        Self {
            token_suffix: "***".to_string(),
            org: None,
            users: Vec::new(),
            date_from: NaiveDate::default(),
            date_to: NaiveDate::default(),
            output_format: ReportFormat::default(),
            max_workers: 0,
        }
    }
}

/// Masks an API token down to `"***"` plus its last four characters.
pub fn mask_token(token: &str) -> String {
    let suffix: String = token
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("***{}", suffix)
}

/// The unit of persisted state for one tracking request.
///
/// Keyed externally by job id (the store holds a `job_id -> JobRecord` map).
/// Mutated exclusively by the owning orchestrator during execution, except
/// for cancellation, which may only ever downgrade the status to
/// `Cancelled`. Loaders ignore unknown fields and default missing optional
/// ones, so older files stay readable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Username currently being processed. Advisory, UI-only.
    #[serde(default)]
    pub current_user: Option<String>,
    #[serde(default)]
    pub processed_users: u32,
    #[serde(default)]
    pub total_users: u32,
    /// Activities accumulated so far. Append-only during execution.
    #[serde(default)]
    pub activities: Vec<Activity>,
    /// Non-fatal error strings accumulated during execution. Append-only.
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub report_path: Option<PathBuf>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub parameters: JobParameters,
}

impl JobRecord {
    /// Creates a fresh record for a newly submitted job.
    pub fn new(parameters: JobParameters, owner: Option<String>, owner_id: Option<String>) -> Self {
        let total_users = parameters.users.len() as u32;
        Self {
            status: JobStatus::Initializing,
            start_time: Utc::now(),
            end_time: None,
            current_user: None,
            processed_users: 0,
            total_users,
            activities: Vec::new(),
            errors: Vec::new(),
            report_path: None,
            owner,
            owner_id,
            parameters,
        }
    }

    /// Synthesized stand-in for a persisted record that failed to parse.
    /// Carries the diagnostic instead of aborting the whole load.
    pub fn placeholder(reason: &str) -> Self {
        let now = Utc::now();
        Self {
            status: JobStatus::Failed,
            start_time: now,
            end_time: Some(now),
            current_user: None,
            processed_users: 0,
            total_users: 0,
            activities: Vec::new(),
            errors: vec![format!("invalid job record recovered: {reason}")],
            report_path: None,
            owner: None,
            owner_id: None,
            parameters: JobParameters::default(),
        }
    }

    /// Applies a state transition if it is legal; illegal transitions are
    /// logged and ignored so a late writer can never resurrect a terminal
    /// job.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            log::warn!(
                "Ignoring illegal job state transition {} -> {}",
                self.status,
                next
            );
            false
        }
    }

    /// Forces the record into `Failed` with a diagnostic, closing it out.
    /// No-op on an already terminal record apart from recording the error.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        if self.transition(JobStatus::Failed) {
            self.end_time = Some(Utc::now());
            self.current_user = None;
        }
    }

    /// Downgrades a non-terminal record to `Cancelled`. Returns false when
    /// the job had already reached a terminal state.
    pub fn mark_cancelled(&mut self) -> bool {
        if self.transition(JobStatus::Cancelled) {
            self.end_time = Some(Utc::now());
            true
        } else {
            false
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Timestamp used for retention decisions: completion time when the job
    /// finished, submission time otherwise.
    pub fn retention_time(&self) -> DateTime<Utc> {
        self.end_time.unwrap_or(self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> JobParameters {
        JobParameters::new(
            "ghp_secret1234",
            Some("acme".to_string()),
            vec!["a".to_string(), "b".to_string()],
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
            ReportFormat::Html,
            0,
        )
    }

    #[test]
    fn test_token_is_masked() {
        let p = params();
        assert_eq!(p.token_suffix, "***1234");
        assert!(!serde_json::to_string(&p).unwrap().contains("secret"));
    }

    #[test]
    fn test_mask_short_token() {
        assert_eq!(mask_token("ab"), "***ab");
        assert_eq!(mask_token(""), "***");
    }

    #[test]
    fn test_new_record_counts_users() {
        let record = JobRecord::new(params(), Some("alice".to_string()), Some("u1".to_string()));
        assert_eq!(record.status, JobStatus::Initializing);
        assert_eq!(record.total_users, 2);
        assert_eq!(record.processed_users, 0);
        assert!(record.end_time.is_none());
        assert!(record.activities.is_empty());
    }

    #[test]
    fn test_mark_failed_closes_record() {
        let mut record = JobRecord::new(params(), None, None);
        record.transition(JobStatus::Running);
        record.mark_failed("boom");
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.end_time.is_some());
        assert_eq!(record.errors, vec!["boom".to_string()]);
    }

    #[test]
    fn test_cancel_is_noop_on_terminal() {
        let mut record = JobRecord::new(params(), None, None);
        record.transition(JobStatus::Running);
        record.transition(JobStatus::Completed);
        assert!(!record.mark_cancelled());
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[test]
    fn test_illegal_transition_ignored() {
        let mut record = JobRecord::new(params(), None, None);
        assert!(!record.transition(JobStatus::Completed));
        assert_eq!(record.status, JobStatus::Initializing);
    }

    #[test]
    fn test_unknown_fields_ignored_and_defaults_applied() {
        let json = r#"{
            "status": "running",
            "start_time": "2026-02-01T09:00:00Z",
            "some_future_field": {"nested": true}
        }"#;
        let record: JobRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.processed_users, 0);
        assert!(record.errors.is_empty());
        assert!(record.report_path.is_none());
    }

    #[test]
    fn test_placeholder_carries_diagnostic() {
        let record = JobRecord::placeholder("expected a map");
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.errors[0].contains("expected a map"));
        assert!(record.end_time.is_some());
    }

    #[test]
    fn test_retention_time_prefers_end_time() {
        let mut record = JobRecord::new(params(), None, None);
        assert_eq!(record.retention_time(), record.start_time);
        record.transition(JobStatus::Running);
        record.mark_failed("x");
        assert_eq!(record.retention_time(), record.end_time.unwrap());
    }
}

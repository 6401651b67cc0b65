use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracking job.
///
/// Statuses only move forward: `Initializing -> Running -> GeneratingReport
/// -> Completed`, with `Cancelled` and `Failed` reachable from any
/// non-terminal state. Terminal states are never left.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Initializing,
    Running,
    GeneratingReport,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns true once the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Cancelled | JobStatus::Failed => true,
            JobStatus::Running => matches!(self, JobStatus::Initializing),
            JobStatus::GeneratingReport => matches!(self, JobStatus::Running),
            JobStatus::Completed => {
                matches!(self, JobStatus::Running | JobStatus::GeneratingReport)
            }
            JobStatus::Initializing => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Initializing => write!(f, "initializing"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::GeneratingReport => write!(f, "generating_report"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

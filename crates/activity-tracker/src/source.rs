//! Capability contract for the remote activity-fetching client.
//!
//! The actual HTTP client lives outside this crate; the orchestrator only
//! sees this trait. Every failure mode it can produce is caught at the
//! per-user worker and turned into an error string on the job record, so
//! nothing here ever propagates as a fault past the worker.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::job::Activity;

/// Errors the remote activity source may surface for a single user.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("rate limit exceeded, resets at {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("remote API error (status {status}): {message}")]
    RemoteApi { status: u16, message: String },

    #[error("user '{username}' not found")]
    NotFound { username: String },

    #[error("network error: {0}")]
    Network(String),
}

/// Fetches one user's activities over a date range.
///
/// Implementations must be shareable across worker threads. A call fetches
/// for exactly one user; partial failure is per user by construction.
pub trait ActivitySource: Send + Sync {
    fn fetch_user_activities(
        &self,
        username: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
        org: Option<&str>,
    ) -> Result<Vec<Activity>, FetchError>;
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of remote activity observed for a tracked user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A submitted change (pull request opened by the user).
    Submission,
    /// A review performed by the user on someone else's change.
    Review,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityKind::Submission => write!(f, "submission"),
            ActivityKind::Review => write!(f, "review"),
        }
    }
}

/// One observed unit of remote user activity.
///
/// Immutable once created; owned by whichever job accumulated it. The same
/// remote `id` may legitimately appear in several jobs run at different
/// times, so there is no identity beyond the containing job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    /// Username the activity belongs to.
    pub user: String,
    /// When the activity happened on the remote side.
    pub date: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// Repository in `namespace/name` form.
    pub repo: String,
    /// Remote identifier, opaque string.
    pub id: String,
    pub url: String,
    /// Free-form details specific to the activity kind.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl Activity {
    pub fn new(
        user: impl Into<String>,
        date: DateTime<Utc>,
        kind: ActivityKind,
        repo: impl Into<String>,
        id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            date,
            kind,
            repo: repo.into(),
            id: id.into(),
            url: url.into(),
            details: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Activity {
        Activity::new(
            "octocat",
            Utc::now(),
            ActivityKind::Submission,
            "acme/widgets",
            "12345",
            "https://github.com/acme/widgets/pull/7",
        )
        .with_detail("title", "Add frobnicator")
        .with_detail("state", "open")
    }

    #[test]
    fn test_kind_serializes_as_type_field() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["type"], "submission");
        assert_eq!(json["repo"], "acme/widgets");
        assert_eq!(json["details"]["title"], "Add frobnicator");
    }

    #[test]
    fn test_round_trip() {
        let activity = sample();
        let json = serde_json::to_string(&activity).unwrap();
        let back: Activity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, activity);
    }

    #[test]
    fn test_missing_details_defaults_empty() {
        let json = r#"{
            "user": "octocat",
            "date": "2026-03-01T12:00:00Z",
            "type": "review",
            "repo": "acme/widgets",
            "id": "99",
            "url": "https://github.com/acme/widgets/pull/9"
        }"#;
        let activity: Activity = serde_json::from_str(json).unwrap();
        assert_eq!(activity.kind, ActivityKind::Review);
        assert!(activity.details.is_empty());
    }
}

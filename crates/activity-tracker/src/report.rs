//! Report rendering collaborator.
//!
//! The orchestrator hands a flat activity list to a [`ReportRenderer`] and
//! receives back an artifact directory. Rendering failures are data to the
//! orchestrator, never faults: a failed report does not erase collected
//! activities. Implementations must be safe to invoke from multiple job
//! threads at once (or serialize internally).

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ReportError;
use crate::job::Activity;

/// Output format for a generated report.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Csv,
    #[default]
    Html,
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportFormat::Csv => write!(f, "csv"),
            ReportFormat::Html => write!(f, "html"),
        }
    }
}

/// Renders an activity list into a report artifact on disk.
pub trait ReportRenderer: Send + Sync {
    /// Returns the directory containing the generated report.
    fn generate_report(
        &self,
        activities: &[Activity],
        format: ReportFormat,
    ) -> Result<PathBuf, ReportError>;
}

/// Default renderer: one directory per report under a configured root,
/// containing either `activities.csv` or `index.html`.
pub struct FileReportRenderer {
    output_directory: PathBuf,
}

impl FileReportRenderer {
    pub fn new<P: AsRef<Path>>(output_directory: P) -> Self {
        Self {
            output_directory: output_directory.as_ref().to_path_buf(),
        }
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }

    /// Creates a fresh, uniquely named directory for one report.
    fn create_report_dir(&self) -> Result<PathBuf, ReportError> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        for counter in 1..=1000 {
            let name = if counter == 1 {
                format!("activity_report_{stamp}")
            } else {
                format!("activity_report_{stamp}_{counter}")
            };
            let candidate = self.output_directory.join(&name);
            match std::fs::create_dir_all(&self.output_directory)
                .and_then(|_| std::fs::create_dir(&candidate))
            {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(ReportError::CreateDirectory {
                        path: candidate,
                        source: e,
                    })
                }
            }
        }
        Err(ReportError::CreateDirectory {
            path: self.output_directory.clone(),
            source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "no free report name"),
        })
    }

    fn write_csv(&self, dir: &Path, activities: &[Activity]) -> Result<(), ReportError> {
        let path = dir.join("activities.csv");
        let mut writer = csv::Writer::from_path(&path)
            .map_err(|e| ReportError::CsvExport(e.to_string()))?;

        writer
            .write_record(["user", "date", "type", "repo", "id", "url", "details"])
            .map_err(|e| ReportError::CsvExport(e.to_string()))?;

        for activity in activities {
            let details = serde_json::Value::Object(activity.details.clone()).to_string();
            writer
                .write_record([
                    activity.user.as_str(),
                    &activity.date.to_rfc3339(),
                    &activity.kind.to_string(),
                    activity.repo.as_str(),
                    activity.id.as_str(),
                    activity.url.as_str(),
                    &details,
                ])
                .map_err(|e| ReportError::CsvExport(e.to_string()))?;
        }

        writer
            .flush()
            .map_err(|e| ReportError::CsvExport(e.to_string()))?;
        debug!("Wrote {} activities to {}", activities.len(), path.display());
        Ok(())
    }

    fn write_html(&self, dir: &Path, activities: &[Activity]) -> Result<(), ReportError> {
        let path = dir.join("index.html");
        let mut out = String::with_capacity(activities.len() * 160 + 512);
        out.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        out.push_str("<title>Activity Report</title>\n</head>\n<body>\n");
        out.push_str(&format!(
            "<h1>Activity Report</h1>\n<p>{} activities, generated {}</p>\n",
            activities.len(),
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str("<table border=\"1\">\n<tr><th>User</th><th>Date</th><th>Type</th><th>Repository</th><th>Link</th></tr>\n");
        for activity in activities {
            out.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td><a href=\"{}\">{}</a></td></tr>\n",
                escape_html(&activity.user),
                activity.date.format("%Y-%m-%d %H:%M"),
                activity.kind,
                escape_html(&activity.repo),
                escape_html(&activity.url),
                escape_html(&activity.id),
            ));
        }
        out.push_str("</table>\n</body>\n</html>\n");

        let mut file = std::fs::File::create(&path).map_err(|e| ReportError::WriteFile {
            path: path.clone(),
            source: e,
        })?;
        file.write_all(out.as_bytes())
            .map_err(|e| ReportError::WriteFile { path, source: e })?;
        Ok(())
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

impl ReportRenderer for FileReportRenderer {
    fn generate_report(
        &self,
        activities: &[Activity],
        format: ReportFormat,
    ) -> Result<PathBuf, ReportError> {
        if activities.is_empty() {
            return Err(ReportError::NoActivities);
        }

        let dir = self.create_report_dir()?;
        match format {
            ReportFormat::Csv => self.write_csv(&dir, activities)?,
            ReportFormat::Html => self.write_html(&dir, activities)?,
        }

        info!(
            "Generated {} report with {} activities at {}",
            format,
            activities.len(),
            dir.display()
        );
        Ok(dir)
    }
}

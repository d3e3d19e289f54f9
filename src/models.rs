use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a backup job.
///
/// `Completed` is terminal. `Failed` is terminal once the retry budget is
/// exhausted; until then the job stays eligible for another run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Interrupted => "INTERRUPTED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "INTERRUPTED" => Ok(JobStatus::Interrupted),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named backup destination: one bucket plus its crypt overlay.
///
/// Created once by setup; only `last_backup_at` ever changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destination {
    pub id: i64,
    pub name: String,
    pub dest_type: String,
    pub bucket: String,
    pub remote_path: String,
    pub created_at: DateTime<Utc>,
    pub last_backup_at: Option<DateTime<Utc>>,
}

/// One unit of work: one source directory synced to one destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub destination_id: i64,
    pub source_path: String,
    pub status: JobStatus,
    pub priority: i64,
    pub bytes_total: i64,
    pub bytes_transferred: i64,
    pub files_total: i64,
    pub files_transferred: i64,
    pub transfer_speed: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether the scheduler may submit this job to the sync tool.
    ///
    /// `retry_count` counts failed attempts; a failed job stays eligible
    /// until the initial attempt plus `max_retries` recoveries have all
    /// failed.
    pub fn is_eligible(&self, max_retries: i64) -> bool {
        match self.status {
            JobStatus::Pending | JobStatus::Interrupted => true,
            JobStatus::Failed => self.retry_count <= max_retries,
            JobStatus::Running | JobStatus::Completed => false,
        }
    }

    /// Byte progress as a percentage, 0 when the total is unknown.
    pub fn progress_percent(&self) -> f64 {
        if self.bytes_total <= 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Credentials read from the secret manager. Held in process memory for the
/// duration of one command invocation; never written to the store or any
/// file this crate owns.
#[derive(Clone)]
pub struct CredentialBundle {
    pub application_key_id: String,
    pub application_key: String,
    pub bucket_name: String,
    pub encryption_password: String,
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("application_key_id", &self.application_key_id)
            .field("application_key", &"<redacted>")
            .field("bucket_name", &self.bucket_name)
            .field("encryption_password", &"<redacted>")
            .finish()
    }
}

/// A single progress datapoint parsed from the sync tool's output stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub bytes_transferred: i64,
    pub bytes_total: i64,
    pub files_transferred: i64,
    pub files_total: i64,
    pub speed: f64,
    pub eta_seconds: Option<i64>,
}

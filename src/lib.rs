use thiserror::Error;

pub mod config;
pub mod dest;
pub mod logging;
pub mod models;
pub mod progress;
pub mod rclone;
pub mod scheduler;
pub mod secrets;
pub mod setup;
pub mod sources;
pub mod store;

/// Error taxonomy for the backup command.
///
/// Store and setup errors are fatal and abort the command. `SyncFailed` is
/// local to one job: it drives retry accounting and the scheduler moves on
/// to the next eligible job.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Required environment variable absent or the data tree does not exist
    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    /// External tool not installed or not authenticated
    #[error("Prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    /// Required fields absent from the secret item or still placeholders
    #[error("Credentials incomplete: {0}")]
    CredentialsIncomplete(String),

    /// The sync tool rejected remote configuration arguments
    #[error("Remote configuration failed for '{remote}': {message}")]
    RemoteConfigurationFailed { remote: String, message: String },

    /// Remote reachable check failed
    #[error("Connection test failed for '{0}'")]
    ConnectionTestFailed(String),

    /// End-to-end encryption probe failed
    #[error("Test write failed for '{0}': the crypt overlay is not functional")]
    TestWriteFailed(String),

    /// The sync tool exited non-zero; per-job, drives retry accounting
    #[error("Sync failed: {0}")]
    SyncFailed(String),

    /// The store could not be brought to the current schema
    #[error("Schema migration failed: {0}")]
    SchemaMigration(String),

    /// A unique constraint was violated (destination names are unique)
    #[error("Already exists: {0}")]
    UniqueViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// RUNNING jobs whose progress stalled past the stats interval.
    /// Raised only when the user did not pass --force; carries the job list
    /// so the report can name them.
    #[error("{} stale running job(s) detected; re-run with --force to resume them or --reset to start over", .0.len())]
    StaleJobs(Vec<crate::models::Job>),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// True for job-local failures the scheduler absorbs; everything else
    /// aborts the command.
    pub fn is_job_local(&self) -> bool {
        matches!(self, BackupError::SyncFailed(_))
    }
}

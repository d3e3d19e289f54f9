// tests/common/mod.rs
// Shared fixtures: an on-disk store, a source tree, and a scripted sync
// runner that stands in for rclone.

use b2backup::models::Progress;
use b2backup::rclone::{ProgressStream, SyncOptions, SyncRunner};
use b2backup::store::Store;
use b2backup::BackupError;
use chrono::{Duration, SecondsFormat, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// A real store file in a temp directory, plus room for source trees.
pub struct BackupFixture {
    pub temp_dir: TempDir,
    pub db_path: PathBuf,
    pub store: Store,
}

impl BackupFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let db_path = temp_dir.path().join("data").join("backup.db");
        let store = Store::open(&db_path).expect("failed to open store");

        Self {
            temp_dir,
            db_path,
            store,
        }
    }

    /// A source directory with one small file in it.
    pub fn create_source(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::create_dir_all(&path).expect("failed to create source dir");
        fs::write(path.join("asset.jpg"), b"not really a jpeg").expect("failed to write file");
        path
    }

    pub fn create_job(&self, destination_id: i64, source: &Path, priority: i64) -> i64 {
        self.store
            .create_job(destination_id, &source.to_string_lossy(), priority)
            .expect("failed to create job")
    }

    /// Rewind a job's `last_update` through a second connection, the way a
    /// crashed process would leave it behind.
    pub fn backdate_job(&self, job_id: i64, seconds: i64) {
        let conn = rusqlite::Connection::open(&self.db_path).expect("failed to open db");
        let past = (Utc::now() - Duration::seconds(seconds))
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        conn.execute(
            "UPDATE jobs SET last_update = ?2 WHERE id = ?1",
            rusqlite::params![job_id, past],
        )
        .expect("failed to backdate job");
    }
}

/// Sync runner that replays scripted event lists, one list per
/// invocation, in order.
pub struct ScriptedSync {
    scripts: Mutex<Vec<Vec<Result<Progress, BackupError>>>>,
}

impl ScriptedSync {
    pub fn new(scripts: Vec<Vec<Result<Progress, BackupError>>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
        }
    }
}

impl SyncRunner for ScriptedSync {
    fn start_sync(&self, _source: &Path, _target: &str, _options: &SyncOptions) -> ProgressStream {
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Vec::new()
            } else {
                scripts.remove(0)
            }
        };

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}

pub fn progress_event(bytes: i64, bytes_total: i64, files: i64, files_total: i64) -> Result<Progress, BackupError> {
    Ok(Progress {
        bytes_transferred: bytes,
        bytes_total,
        files_transferred: files,
        files_total,
        speed: 2_097_152.0,
        eta_seconds: Some(30),
    })
}

/// A transfer that reports progress twice and then finishes cleanly.
pub fn clean_completion(bytes_total: i64, files_total: i64) -> Vec<Result<Progress, BackupError>> {
    vec![
        progress_event(bytes_total / 2, bytes_total, files_total / 2, files_total),
        progress_event(bytes_total, bytes_total, files_total, files_total),
    ]
}

pub fn failure(message: &str) -> Vec<Result<Progress, BackupError>> {
    vec![Err(BackupError::SyncFailed(message.to_string()))]
}

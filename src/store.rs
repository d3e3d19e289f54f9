// src/store.rs
// Embedded job store: a single SQLite file with WAL journaling.

use crate::models::{Destination, Job, JobStatus, Progress};
use crate::BackupError;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Persistence for destinations and jobs.
///
/// One connection behind a mutex: one writer at a time, WAL readers
/// uncontended. Opened on command entry, dropped on exit.
pub struct Store {
    conn: Mutex<Connection>,
}

/// Fixed-width UTC timestamps so equality and ordering survive the text
/// round-trip.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_ts_opt(text: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    text.map(|t| parse_ts(&t)).transpose()
}

/// Columns the jobs table must carry; older store files are upgraded by
/// adding whichever of these are missing.
const JOB_COLUMNS: &[(&str, &str)] = &[
    ("bytes_total", "ALTER TABLE jobs ADD COLUMN bytes_total INTEGER NOT NULL DEFAULT 0"),
    (
        "bytes_transferred",
        "ALTER TABLE jobs ADD COLUMN bytes_transferred INTEGER NOT NULL DEFAULT 0",
    ),
    ("files_total", "ALTER TABLE jobs ADD COLUMN files_total INTEGER NOT NULL DEFAULT 0"),
    (
        "files_transferred",
        "ALTER TABLE jobs ADD COLUMN files_transferred INTEGER NOT NULL DEFAULT 0",
    ),
    ("transfer_speed", "ALTER TABLE jobs ADD COLUMN transfer_speed REAL NOT NULL DEFAULT 0"),
    ("started_at", "ALTER TABLE jobs ADD COLUMN started_at TEXT"),
    ("completed_at", "ALTER TABLE jobs ADD COLUMN completed_at TEXT"),
    ("error_message", "ALTER TABLE jobs ADD COLUMN error_message TEXT"),
    ("retry_count", "ALTER TABLE jobs ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0"),
];

const DESTINATION_COLUMNS: &[(&str, &str)] =
    &[("last_backup_at", "ALTER TABLE destinations ADD COLUMN last_backup_at TEXT")];

impl Store {
    /// Open (creating if necessary) the store file and bring its schema up
    /// to date.
    pub fn open(db_path: &Path) -> Result<Self, BackupError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        // journal_mode returns the resulting mode as a row
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        Self::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, BackupError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema migrations: create the tables if absent, then inspect the
    /// live column set and apply only the additions the file lacks. Each
    /// required DDL failure is fatal; index creation is not.
    fn migrate(conn: &Connection) -> Result<(), BackupError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS destinations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                dest_type TEXT NOT NULL,
                bucket TEXT NOT NULL,
                remote_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_backup_at TEXT
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                destination_id INTEGER NOT NULL REFERENCES destinations(id) ON DELETE CASCADE,
                source_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                priority INTEGER NOT NULL DEFAULT 99,
                bytes_total INTEGER NOT NULL DEFAULT 0,
                bytes_transferred INTEGER NOT NULL DEFAULT 0,
                files_total INTEGER NOT NULL DEFAULT 0,
                files_transferred INTEGER NOT NULL DEFAULT 0,
                transfer_speed REAL NOT NULL DEFAULT 0,
                started_at TEXT,
                completed_at TEXT,
                last_update TEXT NOT NULL,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(|e| BackupError::SchemaMigration(e.to_string()))?;

        Self::add_missing_columns(conn, "jobs", JOB_COLUMNS)?;
        Self::add_missing_columns(conn, "destinations", DESTINATION_COLUMNS)?;

        // Indexes speed up the scheduler's lookups but the store works
        // without them; log and continue on failure.
        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_jobs_destination ON jobs(destination_id, priority, id)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
        ] {
            if let Err(e) = conn.execute(ddl, []) {
                warn!(error = %e, "index creation failed, continuing without it");
            }
        }

        Ok(())
    }

    fn add_missing_columns(
        conn: &Connection,
        table: &str,
        columns: &[(&str, &str)],
    ) -> Result<(), BackupError> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .map_err(|e| BackupError::SchemaMigration(e.to_string()))?;
        let existing: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| BackupError::SchemaMigration(e.to_string()))?
            .collect::<Result<_, _>>()
            .map_err(|e| BackupError::SchemaMigration(e.to_string()))?;

        for (name, ddl) in columns {
            if !existing.contains(*name) {
                debug!(table, column = name, "adding missing column");
                conn.execute(ddl, []).map_err(|e| {
                    BackupError::SchemaMigration(format!(
                        "failed to add column {}.{}: {}",
                        table, name, e
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another store call panicked; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Destinations
    // ------------------------------------------------------------------

    pub fn create_destination(
        &self,
        name: &str,
        dest_type: &str,
        bucket: &str,
        remote_path: &str,
    ) -> Result<i64, BackupError> {
        let conn = self.lock();
        let result = conn.execute(
            "INSERT INTO destinations (name, dest_type, bucket, remote_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, dest_type, bucket, remote_path, fmt_ts(Utc::now())],
        );

        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => {
                Err(BackupError::UniqueViolation(format!("destination '{}'", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_destination(&self, name: &str) -> Result<Destination, BackupError> {
        self.lock()
            .query_row(
                "SELECT id, name, dest_type, bucket, remote_path, created_at, last_backup_at
                 FROM destinations WHERE name = ?1",
                params![name],
                destination_from_row,
            )
            .optional()?
            .ok_or_else(|| BackupError::NotFound(format!("destination '{}'", name)))
    }

    pub fn get_destination_by_id(&self, id: i64) -> Result<Destination, BackupError> {
        self.lock()
            .query_row(
                "SELECT id, name, dest_type, bucket, remote_path, created_at, last_backup_at
                 FROM destinations WHERE id = ?1",
                params![id],
                destination_from_row,
            )
            .optional()?
            .ok_or_else(|| BackupError::NotFound(format!("destination id {}", id)))
    }

    pub fn list_destinations(&self) -> Result<Vec<Destination>, BackupError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, dest_type, bucket, remote_path, created_at, last_backup_at
             FROM destinations ORDER BY name",
        )?;
        let destinations = stmt
            .query_map([], destination_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(destinations)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub fn create_job(
        &self,
        destination_id: i64,
        source_path: &str,
        priority: i64,
    ) -> Result<i64, BackupError> {
        let conn = self.lock();
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO jobs (destination_id, source_path, status, priority, last_update, created_at)
             VALUES (?1, ?2, 'PENDING', ?3, ?4, ?4)",
            params![destination_id, source_path, priority, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_job(&self, id: i64) -> Result<Job, BackupError> {
        self.lock()
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_JOB),
                params![id],
                job_from_row,
            )
            .optional()?
            .ok_or_else(|| BackupError::NotFound(format!("job id {}", id)))
    }

    /// The job (if any) already planned for this source under this
    /// destination. Repeated invocations must not duplicate jobs.
    pub fn find_job(
        &self,
        destination_id: i64,
        source_path: &str,
    ) -> Result<Option<Job>, BackupError> {
        Ok(self
            .lock()
            .query_row(
                &format!(
                    "{} WHERE destination_id = ?1 AND source_path = ?2",
                    SELECT_JOB
                ),
                params![destination_id, source_path],
                job_from_row,
            )
            .optional()?)
    }

    /// Move a job to `status`, updating counters and `last_update`.
    ///
    /// `started_at` is stamped on the first transition to RUNNING;
    /// `completed_at` on any transition away from RUNNING into a terminal
    /// state. COMPLETED jobs are terminal and are never mutated again.
    pub fn update_job(
        &self,
        id: i64,
        status: JobStatus,
        progress: Option<&Progress>,
        error: Option<&str>,
    ) -> Result<(), BackupError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let current: JobStatus = tx
            .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| {
                let text: String = row.get(0)?;
                text.parse().map_err(invalid_status)
            })
            .optional()?
            .ok_or_else(|| BackupError::NotFound(format!("job id {}", id)))?;

        if current == JobStatus::Completed {
            warn!(job_id = id, "ignoring update to a completed job");
            return Ok(());
        }

        let now = fmt_ts(Utc::now());
        let stamp_started = status == JobStatus::Running;
        let stamp_completed = current == JobStatus::Running
            && matches!(status, JobStatus::Completed | JobStatus::Failed);

        if let Some(p) = progress {
            tx.execute(
                "UPDATE jobs SET
                     status = ?2,
                     bytes_transferred = ?3,
                     bytes_total = ?4,
                     files_transferred = ?5,
                     files_total = ?6,
                     transfer_speed = ?7,
                     error_message = ?8,
                     started_at = CASE WHEN ?9 THEN COALESCE(started_at, ?10) ELSE started_at END,
                     completed_at = CASE WHEN ?11 THEN ?10 ELSE completed_at END,
                     last_update = ?10
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    p.bytes_transferred,
                    p.bytes_total,
                    p.files_transferred,
                    p.files_total,
                    p.speed,
                    error,
                    stamp_started,
                    now,
                    stamp_completed,
                ],
            )?;
        } else {
            tx.execute(
                "UPDATE jobs SET
                     status = ?2,
                     error_message = COALESCE(?3, error_message),
                     started_at = CASE WHEN ?4 THEN COALESCE(started_at, ?5) ELSE started_at END,
                     completed_at = CASE WHEN ?6 THEN ?5 ELSE completed_at END,
                     last_update = ?5
                 WHERE id = ?1",
                params![id, status.as_str(), error, stamp_started, now, stamp_completed],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Atomic terminal transition: the job goes to COMPLETED and its
    /// destination's `last_backup_at` advances in the same transaction.
    pub fn mark_job_completed(&self, id: i64, bytes: i64, files: i64) -> Result<(), BackupError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let (destination_id, bytes_total, files_total): (i64, i64, i64) = tx
            .query_row(
                "SELECT destination_id, bytes_total, files_total FROM jobs WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| BackupError::NotFound(format!("job id {}", id)))?;

        let now = fmt_ts(Utc::now());
        tx.execute(
            "UPDATE jobs SET
                 status = 'COMPLETED',
                 bytes_transferred = ?2,
                 bytes_total = ?3,
                 files_transferred = ?4,
                 files_total = ?5,
                 error_message = NULL,
                 completed_at = ?6,
                 last_update = ?6
             WHERE id = ?1",
            params![id, bytes, bytes_total.max(bytes), files, files_total.max(files), now],
        )?;
        tx.execute(
            "UPDATE destinations SET last_backup_at = ?2 WHERE id = ?1",
            params![destination_id, now],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Demote a RUNNING job to INTERRUPTED. Calls against jobs in any
    /// other state are ignored.
    pub fn mark_job_interrupted(&self, id: i64) -> Result<(), BackupError> {
        let conn = self.lock();
        let now = fmt_ts(Utc::now());
        let changed = conn.execute(
            "UPDATE jobs SET status = 'INTERRUPTED', last_update = ?2
             WHERE id = ?1 AND status = 'RUNNING'",
            params![id, now],
        )?;
        if changed == 0 {
            warn!(job_id = id, "interrupt requested for a job that is not running");
        }
        Ok(())
    }

    pub fn increment_retry_count(&self, id: i64) -> Result<(), BackupError> {
        self.lock().execute(
            "UPDATE jobs SET retry_count = retry_count + 1, last_update = ?2 WHERE id = ?1",
            params![id, fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// The unique RUNNING job for a destination, if any.
    pub fn get_active_job(&self, destination_id: i64) -> Result<Option<Job>, BackupError> {
        Ok(self
            .lock()
            .query_row(
                &format!(
                    "{} WHERE destination_id = ?1 AND status = 'RUNNING'",
                    SELECT_JOB
                ),
                params![destination_id],
                job_from_row,
            )
            .optional()?)
    }

    /// RUNNING jobs whose `last_update` is older than the threshold. The
    /// sync tool writes at least once per stats interval, so silence past
    /// it means the writing process is gone.
    pub fn get_stale_jobs(&self, threshold_seconds: i64) -> Result<Vec<Job>, BackupError> {
        let cutoff = Utc::now() - Duration::seconds(threshold_seconds);
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{} WHERE status = 'RUNNING'", SELECT_JOB))?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<Result<Vec<Job>, _>>()?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.last_update < cutoff)
            .collect())
    }

    pub fn list_jobs(&self, destination_id: i64) -> Result<Vec<Job>, BackupError> {
        let conn = self.lock();
        let mut stmt = stmt_list_jobs(&conn)?;
        let jobs = stmt
            .query_map(params![destination_id], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Drop the job history for a destination; the destination row stays.
    pub fn reset_jobs(&self, destination_id: i64) -> Result<usize, BackupError> {
        let deleted = self.lock().execute(
            "DELETE FROM jobs WHERE destination_id = ?1",
            params![destination_id],
        )?;
        Ok(deleted)
    }

    /// Rewind a job's `last_update`, for exercising stale detection.
    #[cfg(test)]
    pub fn backdate_last_update_for_tests(&self, job_id: i64, seconds: i64) {
        let past = fmt_ts(Utc::now() - Duration::seconds(seconds));
        self.lock()
            .execute(
                "UPDATE jobs SET last_update = ?2 WHERE id = ?1",
                params![job_id, past],
            )
            .unwrap();
    }
}

const SELECT_JOB: &str = "SELECT id, destination_id, source_path, status, priority,
        bytes_total, bytes_transferred, files_total, files_transferred, transfer_speed,
        started_at, completed_at, last_update, error_message, retry_count, created_at
     FROM jobs";

fn stmt_list_jobs(conn: &Connection) -> rusqlite::Result<rusqlite::Statement<'_>> {
    conn.prepare(&format!(
        "{} WHERE destination_id = ?1 ORDER BY priority ASC, id ASC",
        SELECT_JOB
    ))
}

fn invalid_status(e: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(e),
    )
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}

fn destination_from_row(row: &Row<'_>) -> rusqlite::Result<Destination> {
    Ok(Destination {
        id: row.get(0)?,
        name: row.get(1)?,
        dest_type: row.get(2)?,
        bucket: row.get(3)?,
        remote_path: row.get(4)?,
        created_at: parse_ts(&row.get::<_, String>(5)?)?,
        last_backup_at: parse_ts_opt(row.get(6)?)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get(3)?;
    Ok(Job {
        id: row.get(0)?,
        destination_id: row.get(1)?,
        source_path: row.get(2)?,
        status: status.parse().map_err(invalid_status)?,
        priority: row.get(4)?,
        bytes_total: row.get(5)?,
        bytes_transferred: row.get(6)?,
        files_total: row.get(7)?,
        files_transferred: row.get(8)?,
        transfer_speed: row.get(9)?,
        started_at: parse_ts_opt(row.get(10)?)?,
        completed_at: parse_ts_opt(row.get(11)?)?,
        last_update: parse_ts(&row.get::<_, String>(12)?)?,
        error_message: row.get(13)?,
        retry_count: row.get(14)?,
        created_at: parse_ts(&row.get::<_, String>(15)?)?,
    })
}

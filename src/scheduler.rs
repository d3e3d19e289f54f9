// src/scheduler.rs
// Job scheduling: eligibility, stale detection, sequential execution of
// sync transfers, retry accounting.

use crate::dest::DestinationKind;
use crate::models::{Destination, Job, JobStatus, Progress};
use crate::rclone::{SyncOptions, SyncRunner};
use crate::store::Store;
use crate::BackupError;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Per-invocation behaviour switches, straight from the CLI flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub force: bool,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
}

/// Runs one destination's jobs to completion, one at a time, in
/// `(priority, id)` order. Owns no state of its own: everything that must
/// survive a crash lives in the store.
pub struct BackupScheduler<'a, S: SyncRunner> {
    store: &'a Store,
    driver: S,
    stats_interval_secs: i64,
    max_retries: i64,
}

impl<'a, S: SyncRunner> BackupScheduler<'a, S> {
    pub fn new(store: &'a Store, driver: S, stats_interval_secs: i64, max_retries: i64) -> Self {
        Self {
            store,
            driver,
            stats_interval_secs,
            max_retries,
        }
    }

    /// Create jobs for source paths that do not have one yet. Re-invoking
    /// the command never duplicates jobs.
    pub fn plan_jobs(
        &self,
        dest: &Destination,
        source_paths: &[(PathBuf, i64)],
    ) -> Result<usize, BackupError> {
        let mut planned = 0;
        for (path, priority) in source_paths {
            let source = path.to_string_lossy();
            if self.store.find_job(dest.id, &source)?.is_none() {
                let job_id = self.store.create_job(dest.id, &source, *priority)?;
                debug!(job_id, source = %source, priority, "job planned");
                planned += 1;
            }
        }
        Ok(planned)
    }

    /// Stale protection. A RUNNING job whose `last_update` is older than
    /// the stats interval has lost its writer. Without `--force` the run
    /// halts so the user can decide; with it, stale jobs are demoted to
    /// INTERRUPTED and the transfer resumes from rclone's partial state.
    pub fn handle_stale_jobs(&self, force: bool) -> Result<(), BackupError> {
        let stale = self.store.get_stale_jobs(self.stats_interval_secs)?;
        if stale.is_empty() {
            return Ok(());
        }

        if !force {
            return Err(BackupError::StaleJobs(stale));
        }

        for job in stale {
            warn!(job_id = job.id, source = %job.source_path, "force: demoting stale job to INTERRUPTED");
            self.store.mark_job_interrupted(job.id)?;
        }
        Ok(())
    }

    /// Jobs the scheduler may submit, in execution order.
    pub fn eligible_jobs(&self, destination_id: i64) -> Result<Vec<Job>, BackupError> {
        Ok(self
            .store
            .list_jobs(destination_id)?
            .into_iter()
            .filter(|job| job.is_eligible(self.max_retries))
            .collect())
    }

    /// Execute every eligible job for the destination, sequentially. Each
    /// job is attempted at most once per invocation; a sync failure marks
    /// it FAILED and the loop moves on. Store errors abort the run.
    pub async fn run(
        &self,
        dest: &Destination,
        options: RunOptions,
    ) -> Result<RunSummary, BackupError> {
        self.handle_stale_jobs(options.force)?;

        // A RUNNING job that is not stale belongs to a live process.
        if let Some(active) = self.store.get_active_job(dest.id)? {
            return Err(BackupError::StaleJobs(vec![active]));
        }

        let mut summary = RunSummary::default();
        let mut attempted: HashSet<i64> = HashSet::new();

        loop {
            let next = self
                .eligible_jobs(dest.id)?
                .into_iter()
                .find(|job| !attempted.contains(&job.id));
            let Some(job) = next else { break };
            attempted.insert(job.id);

            info!(
                job_id = job.id,
                source = %job.source_path,
                priority = job.priority,
                status = %job.status,
                dry_run = options.dry_run,
                "starting job"
            );

            match self.execute_job(dest, &job, options.dry_run).await {
                Ok(()) => summary.completed += 1,
                Err(e) if e.is_job_local() => {
                    error!(job_id = job.id, error = %e, "job failed, moving on");
                    summary.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            destination = %dest.name,
            completed = summary.completed,
            failed = summary.failed,
            "run finished"
        );
        Ok(summary)
    }

    /// Drive one job through the sync tool, translating its progress
    /// stream into store updates.
    async fn execute_job(
        &self,
        dest: &Destination,
        job: &Job,
        dry_run: bool,
    ) -> Result<(), BackupError> {
        let kind = DestinationKind::from_type_str(&dest.dest_type)?;
        let target = kind.backup_target(&dest.name);
        let source = Path::new(&job.source_path);

        if !source.is_dir() {
            let message = format!("source path '{}' does not exist", job.source_path);
            self.store
                .update_job(job.id, JobStatus::Failed, None, Some(&message))?;
            self.store.increment_retry_count(job.id)?;
            return Err(BackupError::SyncFailed(message));
        }

        // Prior counters carry over; the sync tool re-derives the real ones
        self.store.update_job(job.id, JobStatus::Running, None, None)?;

        let mut current = Progress {
            bytes_transferred: job.bytes_transferred,
            bytes_total: job.bytes_total,
            files_transferred: job.files_transferred,
            files_total: job.files_total,
            speed: 0.0,
            eta_seconds: None,
        };

        let sync_options = SyncOptions {
            dry_run,
            stats_interval_secs: self.stats_interval_secs,
        };
        let mut stream = self.driver.start_sync(source, &target, &sync_options);

        while let Some(event) = stream.recv().await {
            match event {
                Ok(progress) => {
                    merge_progress(&mut current, &progress);
                    // Best-effort: losing a datapoint is fine, losing the
                    // transfer is not
                    if let Err(e) =
                        self.store
                            .update_job(job.id, JobStatus::Running, Some(&current), None)
                    {
                        warn!(job_id = job.id, error = %e, "progress write failed, continuing");
                    }
                }
                Err(sync_error) => {
                    let message = sync_error.to_string();
                    self.store.update_job(
                        job.id,
                        JobStatus::Failed,
                        Some(&current),
                        Some(&message),
                    )?;
                    self.store.increment_retry_count(job.id)?;
                    return Err(sync_error);
                }
            }
        }

        // Stream closed without an error value: clean completion
        self.store
            .mark_job_completed(job.id, current.bytes_transferred, current.files_transferred)?;
        info!(
            job_id = job.id,
            bytes = current.bytes_transferred,
            files = current.files_transferred,
            "job completed"
        );
        Ok(())
    }
}

/// Fold one event into the running counters. rclone's textual file-count
/// lines carry no byte fields; zeroes never regress what we already know.
fn merge_progress(current: &mut Progress, event: &Progress) {
    if event.bytes_transferred > 0 {
        current.bytes_transferred = event.bytes_transferred;
    }
    if event.bytes_total > 0 {
        current.bytes_total = event.bytes_total;
    }
    if event.files_transferred > 0 {
        current.files_transferred = event.files_transferred;
    }
    if event.files_total > 0 {
        current.files_total = event.files_total;
    }
    if event.speed > 0.0 {
        current.speed = event.speed;
    }
    if event.eta_seconds.is_some() {
        current.eta_seconds = event.eta_seconds;
    }
}

/// Snapshot of one destination's jobs for the status report.
pub struct DestinationStatus {
    pub destination: Destination,
    pub jobs: Vec<Job>,
}

impl DestinationStatus {
    pub fn load(store: &Store, destination: Destination) -> Result<Self, BackupError> {
        let jobs = store.list_jobs(destination.id)?;
        Ok(Self { destination, jobs })
    }

    /// Share of jobs that have completed, by count.
    pub fn completion_percentage(&self) -> f64 {
        if self.jobs.is_empty() {
            return 0.0;
        }
        let completed = self
            .jobs
            .iter()
            .filter(|job| job.status == JobStatus::Completed)
            .count();
        (completed as f64 / self.jobs.len() as f64) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        !self.jobs.is_empty()
            && self
                .jobs
                .iter()
                .all(|job| job.status == JobStatus::Completed)
    }

    /// Human-readable report for `--status`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Destination: {} ({})", self.destination.name, self.destination.dest_type);
        let _ = writeln!(
            out,
            "Bucket:      {}{}",
            self.destination.bucket, self.destination.remote_path
        );
        let _ = writeln!(
            out,
            "Last backup: {}",
            self.destination
                .last_backup_at
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );
        let _ = writeln!(out);

        if self.jobs.is_empty() {
            let _ = writeln!(out, "No jobs planned yet. Run `backup` to plan and start one.");
            return out;
        }

        for job in &self.jobs {
            let _ = writeln!(
                out,
                "  [{:>2}] {:<12} {:<40} {:>6.1}%  {}/{} files  {:.1} MiB/s{}",
                job.priority,
                job.status.to_string(),
                job.source_path,
                job.progress_percent(),
                job.files_transferred,
                job.files_total,
                job.transfer_speed / (1024.0 * 1024.0),
                job.error_message
                    .as_deref()
                    .map(|e| format!("  error: {}", e))
                    .unwrap_or_default()
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Overall: {:.0}% complete", self.completion_percentage());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dest::DEST_TYPE_B2_CRYPT;
    use crate::rclone::ProgressStream;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Runner whose every invocation replays the next scripted event list.
    struct ScriptedRunner {
        script: Mutex<Vec<Vec<Result<Progress, BackupError>>>>,
    }

    impl ScriptedRunner {
        fn new(script: Vec<Vec<Result<Progress, BackupError>>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    impl SyncRunner for ScriptedRunner {
        fn start_sync(&self, _source: &Path, _target: &str, _options: &SyncOptions) -> ProgressStream {
            let events = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    Vec::new()
                } else {
                    script.remove(0)
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

    fn progress(bytes: i64, total: i64, files: i64, files_total: i64) -> Progress {
        Progress {
            bytes_transferred: bytes,
            bytes_total: total,
            files_transferred: files,
            files_total,
            speed: 1024.0,
            eta_seconds: None,
        }
    }

    /// Store + a real source directory so execute_job's existence check
    /// passes.
    fn fixture() -> (Store, Destination, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let id = store
            .create_destination("b2", DEST_TYPE_B2_CRYPT, "bkt", "/media")
            .unwrap();
        let dest = store.get_destination_by_id(id).unwrap();
        (store, dest, tmp)
    }

    fn source_dir(tmp: &TempDir, name: &str) -> String {
        let path = tmp.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_clean_run_completes_all_jobs() {
        let (store, dest, tmp) = fixture();
        for (name, priority) in [("library", 1), ("upload", 2), ("profile", 3)] {
            store
                .create_job(dest.id, &source_dir(&tmp, name), priority)
                .unwrap();
        }

        let runner = ScriptedRunner::new(vec![
            vec![Ok(progress(100, 100, 1, 1))],
            vec![Ok(progress(200, 200, 2, 2))],
            vec![Ok(progress(300, 300, 3, 3))],
        ]);
        let scheduler = BackupScheduler::new(&store, runner, 60, 3);

        let summary = scheduler.run(&dest, RunOptions::default()).await.unwrap();
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.failed, 0);

        let status = DestinationStatus::load(&store, store.get_destination("b2").unwrap()).unwrap();
        assert!(status.is_complete());
        assert_eq!(status.completion_percentage(), 100.0);
        assert!(status.destination.last_backup_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_marks_job_and_continues() {
        let (store, dest, tmp) = fixture();
        let failing = store
            .create_job(dest.id, &source_dir(&tmp, "library"), 1)
            .unwrap();
        let succeeding = store
            .create_job(dest.id, &source_dir(&tmp, "upload"), 2)
            .unwrap();

        let runner = ScriptedRunner::new(vec![
            vec![
                Ok(progress(50, 100, 0, 1)),
                Err(BackupError::SyncFailed("rclone exited with code 1".to_string())),
            ],
            vec![Ok(progress(200, 200, 2, 2))],
        ]);
        let scheduler = BackupScheduler::new(&store, runner, 60, 3);

        let summary = scheduler.run(&dest, RunOptions::default()).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);

        let failed = store.get_job(failing).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.error_message.unwrap().contains("code 1"));

        assert_eq!(store.get_job(succeeding).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_each_job_attempted_once_per_invocation() {
        let (store, dest, tmp) = fixture();
        let job_id = store
            .create_job(dest.id, &source_dir(&tmp, "library"), 1)
            .unwrap();

        // Only one scripted failure: a second attempt would complete and
        // expose a retry loop within the same invocation.
        let runner = ScriptedRunner::new(vec![vec![Err(BackupError::SyncFailed(
            "boom".to_string(),
        ))]]);
        let scheduler = BackupScheduler::new(&store, runner, 60, 3);

        let summary = scheduler.run(&dest, RunOptions::default()).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(store.get_job(job_id).unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_makes_job_terminal() {
        let (store, dest, tmp) = fixture();
        let job_id = store
            .create_job(dest.id, &source_dir(&tmp, "library"), 1)
            .unwrap();

        // max_retries = 2: falha inicial + duas recuperações, depois terminal
        for expected_retry in 1..=3 {
            let runner =
                ScriptedRunner::new(vec![vec![Err(BackupError::SyncFailed("boom".to_string()))]]);
            let scheduler = BackupScheduler::new(&store, runner, 60, 2);

            assert_eq!(
                scheduler.eligible_jobs(dest.id).unwrap().len(),
                1,
                "attempt {}",
                expected_retry
            );
            let summary = scheduler.run(&dest, RunOptions::default()).await.unwrap();
            assert_eq!(summary.failed, 1);
            assert_eq!(store.get_job(job_id).unwrap().retry_count, expected_retry);
        }

        let scheduler = BackupScheduler::new(&store, ScriptedRunner::new(vec![]), 60, 2);
        assert!(scheduler.eligible_jobs(dest.id).unwrap().is_empty());

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
    }

    #[tokio::test]
    async fn test_stale_protection_without_force_halts() {
        let (store, dest, tmp) = fixture();
        let job_id = store
            .create_job(dest.id, &source_dir(&tmp, "library"), 1)
            .unwrap();
        store.update_job(job_id, JobStatus::Running, None, None).unwrap();
        backdate(&store, job_id, 3600);

        let scheduler = BackupScheduler::new(&store, ScriptedRunner::new(vec![]), 60, 3);
        let err = scheduler
            .run(&dest, RunOptions { dry_run: false, force: false })
            .await
            .unwrap_err();

        match err {
            BackupError::StaleJobs(jobs) => assert_eq!(jobs[0].id, job_id),
            other => panic!("unexpected error: {:?}", other),
        }
        // Sem --force nada muda de estado
        assert_eq!(store.get_job(job_id).unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_force_demotes_stale_and_resumes() {
        let (store, dest, tmp) = fixture();
        let job_id = store
            .create_job(dest.id, &source_dir(&tmp, "library"), 1)
            .unwrap();
        store.update_job(job_id, JobStatus::Running, None, None).unwrap();
        let partial = progress(4_500_000, 10_000_000, 4, 10);
        store
            .update_job(job_id, JobStatus::Running, Some(&partial), None)
            .unwrap();
        backdate(&store, job_id, 3600);

        let runner = ScriptedRunner::new(vec![vec![Ok(progress(10_000_000, 10_000_000, 10, 10))]]);
        let scheduler = BackupScheduler::new(&store, runner, 60, 3);

        let summary = scheduler
            .run(&dest, RunOptions { dry_run: false, force: true })
            .await
            .unwrap();
        assert_eq!(summary.completed, 1);

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        // Contadores avançam monotonicamente do ponto interrompido
        assert_eq!(job.bytes_transferred, 10_000_000);
    }

    #[tokio::test]
    async fn test_fresh_running_job_blocks_run() {
        let (store, dest, tmp) = fixture();
        let job_id = store
            .create_job(dest.id, &source_dir(&tmp, "library"), 1)
            .unwrap();
        store.update_job(job_id, JobStatus::Running, None, None).unwrap();

        let scheduler = BackupScheduler::new(&store, ScriptedRunner::new(vec![]), 60, 3);
        let err = scheduler.run(&dest, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, BackupError::StaleJobs(_)));
    }

    #[tokio::test]
    async fn test_zero_fields_never_regress_counters() {
        let mut current = progress(1000, 2000, 1, 4);
        // Evento só com contagem de arquivos (linha textual do rclone)
        let files_only = Progress {
            files_transferred: 2,
            files_total: 4,
            ..Progress::default()
        };
        merge_progress(&mut current, &files_only);

        assert_eq!(current.bytes_transferred, 1000);
        assert_eq!(current.bytes_total, 2000);
        assert_eq!(current.files_transferred, 2);
    }

    fn backdate(store: &Store, job_id: i64, seconds: i64) {
        store.backdate_last_update_for_tests(job_id, seconds);
    }
}

// src/rclone.rs
// Wrapper for the rclone command: remote configuration, connectivity
// probes, and the streaming sync invocation.

use crate::models::Progress;
use crate::progress;
use crate::BackupError;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const INSTALL_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
pub const REMOTE_CONFIG_TIMEOUT: Duration = Duration::from_secs(60);
pub const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const TEST_WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// How many trailing output lines are kept for the error report when the
/// sync process dies.
const STDERR_TAIL_LINES: usize = 50;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub dry_run: bool,
    /// Seconds between stats lines; also the stale-detection threshold.
    pub stats_interval_secs: i64,
}

pub type ProgressStream = mpsc::Receiver<Result<Progress, BackupError>>;

/// The seam between the scheduler and the sync tool. The channel closing
/// without an error value signals clean completion; an `Err` value is the
/// final event of a failed run. Dropping the receiver cancels the
/// underlying transfer.
pub trait SyncRunner: Send + Sync {
    fn start_sync(&self, source: &Path, target: &str, options: &SyncOptions) -> ProgressStream;
}

/// Production sync driver: shells out to rclone.
#[derive(Debug, Clone, Default)]
pub struct RcloneDriver;

/// Run one rclone subcommand under a deadline. The child is spawned with
/// kill-on-drop, so deadline expiry (or caller cancellation) terminates it.
async fn run_rclone(
    args: &[String],
    deadline: Duration,
    what: &str,
) -> Result<std::process::Output, BackupError> {
    let mut cmd = Command::new("rclone");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = ?args, "invoking rclone");

    match tokio::time::timeout(deadline, cmd.output()).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(BackupError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("rclone {} timed out after {}s", what, deadline.as_secs()),
        ))),
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

impl RcloneDriver {
    pub async fn check_installed(&self) -> bool {
        self.version().await.is_ok()
    }

    /// First line of `rclone version`.
    pub async fn version(&self) -> Result<String, BackupError> {
        let output = run_rclone(&args(&["version"]), INSTALL_CHECK_TIMEOUT, "version")
            .await
            .map_err(|_| prerequisite_hint())?;

        if !output.status.success() {
            return Err(prerequisite_hint());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or("unknown version").to_string())
    }

    /// Names of the configured remotes, without the trailing colon.
    pub async fn list_remotes(&self) -> Result<Vec<String>, BackupError> {
        let output = run_rclone(&args(&["listremotes"]), INSTALL_CHECK_TIMEOUT, "listremotes").await?;
        if !output.status.success() {
            return Err(BackupError::PrerequisiteMissing(
                "rclone listremotes failed; is rclone configured for this user?".to_string(),
            ));
        }

        let remotes = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.trim().trim_end_matches(':').to_string())
            .collect();
        Ok(remotes)
    }

    /// Create a named remote. rclone has no safe create-or-replace, so the
    /// caller deletes any prior remote of the same name first.
    pub async fn configure_remote(
        &self,
        name: &str,
        remote_type: &str,
        options: &[(String, String)],
    ) -> Result<(), BackupError> {
        let mut cmd_args = args(&["config", "create", name, remote_type, "--non-interactive"]);
        for (key, value) in options {
            cmd_args.push(key.clone());
            cmd_args.push(value.clone());
        }

        let output = run_rclone(&cmd_args, REMOTE_CONFIG_TIMEOUT, "config create").await?;
        if !output.status.success() {
            return Err(BackupError::RemoteConfigurationFailed {
                remote: name.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(remote = name, remote_type, "remote configured");
        Ok(())
    }

    /// Delete a remote if it exists; deleting an unknown remote is a no-op.
    pub async fn delete_remote(&self, name: &str) -> Result<(), BackupError> {
        let output =
            run_rclone(&args(&["config", "delete", name]), REMOTE_CONFIG_TIMEOUT, "config delete")
                .await?;
        if !output.status.success() {
            return Err(BackupError::RemoteConfigurationFailed {
                remote: name.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// rclone stores crypt passwords in its obscured form; plain text is
    /// rejected by `config create`.
    pub async fn obscure(&self, secret: &str) -> Result<String, BackupError> {
        let output = run_rclone(
            &args(&["obscure", secret]),
            INSTALL_CHECK_TIMEOUT,
            "obscure",
        )
        .await?;
        if !output.status.success() {
            return Err(BackupError::RemoteConfigurationFailed {
                remote: "-".to_string(),
                message: "rclone obscure failed".to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// List the remote's root. Cheap reachability check.
    pub async fn test_connection(&self, remote: &str) -> Result<bool, BackupError> {
        let target = format!("{}:", remote);
        let result = run_rclone(
            &args(&["lsd", &target, "--max-depth", "1"]),
            CONNECTION_TEST_TIMEOUT,
            "lsd",
        )
        .await;

        match result {
            Ok(output) => Ok(output.status.success()),
            Err(BackupError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// End-to-end probe: write a small randomly named file through the
    /// remote, verify it lists, then delete it. Proves the encryption
    /// overlay is functional, not just reachable.
    pub async fn test_write(&self, remote: &str) -> Result<bool, BackupError> {
        let probe_name = format!("backup-probe-{}.txt", Uuid::new_v4());
        let target = format!("{}:{}", remote, probe_name);

        let mut cmd = Command::new("rclone");
        cmd.args(["rcat", &target])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let write_result = tokio::time::timeout(TEST_WRITE_TIMEOUT, async {
            let mut child = cmd.spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(b"backup connectivity probe\n").await?;
                drop(stdin);
            }
            child.wait().await
        })
        .await;

        match write_result {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(_)) | Err(_) => return Ok(false),
            Ok(Err(e)) => return Err(BackupError::Io(e)),
        }

        let listing = run_rclone(
            &args(&["lsf", &format!("{}:", remote), "--include", &probe_name]),
            CONNECTION_TEST_TIMEOUT,
            "lsf",
        )
        .await?;
        let listed = listing.status.success()
            && String::from_utf8_lossy(&listing.stdout).contains(&probe_name);

        // Best-effort cleanup; a leftover probe file is harmless
        if let Err(e) =
            run_rclone(&args(&["deletefile", &target]), CONNECTION_TEST_TIMEOUT, "deletefile").await
        {
            warn!(error = %e, probe = %probe_name, "failed to delete probe file");
        }

        Ok(listed)
    }
}

/// Arguments for the streaming sync invocation: structured JSON progress
/// on stderr, verbose mode, stats at the configured cadence.
fn sync_args(source: &Path, target: &str, options: &SyncOptions) -> Vec<String> {
    let mut cmd_args = vec![
        "sync".to_string(),
        source.to_string_lossy().into_owned(),
        target.to_string(),
        "--use-json-log".to_string(),
        "--log-level".to_string(),
        "INFO".to_string(),
        "-v".to_string(),
        "--stats".to_string(),
        format!("{}s", options.stats_interval_secs),
        "--stats-log-level".to_string(),
        "INFO".to_string(),
    ];
    if options.dry_run {
        cmd_args.push("--dry-run".to_string());
    }
    cmd_args
}

impl SyncRunner for RcloneDriver {
    fn start_sync(&self, source: &Path, target: &str, options: &SyncOptions) -> ProgressStream {
        let (tx, rx) = mpsc::channel(32);
        let cmd_args = sync_args(source, target, options);
        let target = target.to_string();

        tokio::spawn(async move {
            let mut cmd = Command::new("rclone");
            cmd.args(&cmd_args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    let _ = tx
                        .send(Err(BackupError::SyncFailed(format!(
                            "failed to spawn rclone: {}",
                            e
                        ))))
                        .await;
                    return;
                }
            };

            // rclone writes its log (and therefore all progress) to stderr
            let stderr = match child.stderr.take() {
                Some(stderr) => stderr,
                None => {
                    let _ = tx
                        .send(Err(BackupError::SyncFailed(
                            "failed to capture rclone stderr".to_string(),
                        )))
                        .await;
                    return;
                }
            };

            let mut lines = BufReader::new(stderr).lines();
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());

                if let Some(event) = progress::parse_line(&line) {
                    if tx.send(Ok(event)).await.is_err() {
                        // Consumer gone: kill the transfer and bail out
                        debug!(target = %target, "progress consumer dropped, terminating sync");
                        let _ = child.kill().await;
                        return;
                    }
                }
            }

            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(target = %target, "sync completed cleanly");
                }
                Ok(status) => {
                    error!(target = %target, code = status.code().unwrap_or(-1), "sync failed");
                    let stderr_tail: Vec<String> = tail.into_iter().collect();
                    let _ = tx
                        .send(Err(BackupError::SyncFailed(format!(
                            "rclone exited with code {}: {}",
                            status.code().unwrap_or(-1),
                            stderr_tail.join("\n")
                        ))))
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(BackupError::SyncFailed(format!(
                            "failed to wait for rclone: {}",
                            e
                        ))))
                        .await;
                }
            }
            // tx drops here; a clean close is the completion signal
        });

        rx
    }
}

fn prerequisite_hint() -> BackupError {
    BackupError::PrerequisiteMissing(
        "rclone is not installed or not in PATH (install it from https://rclone.org/install/)"
            .to_string(),
    )
}

use anyhow::Context;
use b2backup::config::Config;
use b2backup::logging;
use b2backup::rclone::RcloneDriver;
use b2backup::scheduler::{BackupScheduler, DestinationStatus, RunOptions};
use b2backup::setup::{self, SetupController};
use b2backup::sources;
use b2backup::store::Store;
use b2backup::BackupError;
use clap::Parser;
use tracing::info;

/// Encrypted, resumable offsite backup of an Immich data tree.
///
/// Without flags, plans any missing jobs and runs every eligible one. The
/// command is safe to re-invoke at any time: interrupted transfers resume
/// where rclone left off.
#[derive(Parser, Debug)]
#[command(name = "backup", version)]
struct Args {
    /// Run prerequisite diagnostics and exit
    #[arg(long)]
    check: bool,

    /// Run the setup wizard for the selected destination
    #[arg(long)]
    setup: bool,

    /// Print a status report for the selected destination
    #[arg(long)]
    status: bool,

    /// Delete the job history for the selected destination (asks first)
    #[arg(long)]
    reset: bool,

    /// Named destination to operate on
    #[arg(long, default_value = "b2")]
    to: String,

    /// Suppress stale-job protection: demote stale RUNNING jobs to
    /// INTERRUPTED and proceed
    #[arg(long)]
    force: bool,

    /// Have the sync tool report what would transfer without writing
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("backup: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = Config::load()?;
    let _guard = logging::init_logging(&config.log_path())?;

    let store = Store::open(&config.db_path())?;

    if args.check {
        return run_check(&store).await;
    }
    if args.setup {
        SetupController::new(&store).run(&args.to).await?;
        return Ok(());
    }
    if args.status {
        let dest = store.get_destination(&args.to)?;
        print!("{}", DestinationStatus::load(&store, dest)?.render());
        return Ok(());
    }
    if args.reset {
        return run_reset(&store, &args.to);
    }

    run_backup(&store, &config, &args).await
}

async fn run_check(store: &Store) -> anyhow::Result<()> {
    let controller = SetupController::new(store);
    let diagnostics = controller.diagnostics().await;

    let mut all_ok = true;
    for diagnostic in &diagnostics {
        let marker = if diagnostic.ok { "ok" } else { "FAIL" };
        println!("[{:>4}] {}: {}", marker, diagnostic.label, diagnostic.detail);
        all_ok &= diagnostic.ok;
    }

    if all_ok {
        Ok(())
    } else {
        anyhow::bail!("one or more prerequisite checks failed")
    }
}

fn run_reset(store: &Store, name: &str) -> anyhow::Result<()> {
    let dest = store.get_destination(name)?;
    let jobs = store.list_jobs(dest.id)?;
    if jobs.is_empty() {
        println!("No jobs to reset for destination '{}'.", name);
        return Ok(());
    }

    let prompt = format!(
        "Delete {} job(s) for destination '{}'? The next run plans from scratch.",
        jobs.len(),
        name
    );
    if !setup::confirm(&prompt) {
        println!("Reset aborted.");
        return Ok(());
    }

    let deleted = store.reset_jobs(dest.id)?;
    info!(destination = name, deleted, "job history reset");
    println!("Deleted {} job(s).", deleted);
    Ok(())
}

async fn run_backup(store: &Store, config: &Config, args: &Args) -> anyhow::Result<()> {
    let dest = match store.get_destination(&args.to) {
        Ok(dest) => dest,
        Err(BackupError::NotFound(_)) => anyhow::bail!(
            "destination '{}' is not configured; run `backup --setup --to {}` first",
            args.to,
            args.to
        ),
        Err(e) => return Err(e.into()),
    };

    let scheduler = BackupScheduler::new(
        store,
        RcloneDriver,
        config.stats_interval_secs,
        config.max_retries,
    );

    let planned = scheduler.plan_jobs(&dest, &sources::enumerate_sources(config))?;
    if planned > 0 {
        info!(planned, "new job(s) planned");
    }

    let options = RunOptions {
        dry_run: args.dry_run,
        force: args.force,
    };
    let summary = scheduler
        .run(&dest, options)
        .await
        .context("backup run aborted")?;

    println!(
        "Done: {} job(s) completed, {} failed.",
        summary.completed, summary.failed
    );
    if summary.failed > 0 {
        anyhow::bail!(
            "{} job(s) failed; see {} for details",
            summary.failed,
            config.log_path().display()
        );
    }
    Ok(())
}

//! Job management subcommands.
//!
//! Provides commands to:
//! - `list`: Show every stored job, newest first
//! - `logs`: Print (and optionally follow) a job's event log
//! - `delete`: Remove a job directory

use std::time::Duration;

use anyhow::Result;
use clap::Subcommand;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::core::{JobLock, JobStore};
use crate::domain::JobStatus;

/// Interval between re-reads of the event log with `--follow`
const FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

/// Job-related subcommands
#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// List all jobs
    List,

    /// Show the event log of a job
    Logs {
        /// Job ID (UUID)
        job_id: String,

        /// Keep printing new events until the job stops
        #[arg(short, long)]
        follow: bool,
    },

    /// Delete a job and all of its outputs
    Delete {
        /// Job ID (UUID)
        job_id: String,

        /// Delete even if the job appears to be running
        #[arg(long)]
        force: bool,
    },
}

/// Execute job subcommands
pub async fn execute(command: JobCommands, config: PipelineConfig, cancel: &CancellationToken) -> Result<()> {
    let store = JobStore::new(&config.jobs_dir);

    match command {
        JobCommands::List => list_jobs(&store).await,
        JobCommands::Logs { job_id, follow } => show_logs(&store, &job_id, follow, cancel).await,
        JobCommands::Delete { job_id, force } => {
            store.delete(&job_id, force).await?;
            println!("Deleted job {}", job_id);
            Ok(())
        }
    }
}

async fn list_jobs(store: &JobStore) -> Result<()> {
    let jobs = store.list().await?;

    if jobs.is_empty() {
        println!("No jobs found in {}", store.jobs_dir().display());
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<12} {:<20} {}",
        "JOB ID", "CREATED", "STATUS", "CURRENT STEP", "INPUT"
    );
    println!("{}", "-".repeat(110));

    for job in jobs {
        println!(
            "{:<38} {:<20} {:<12} {:<20} {}",
            job.id,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.status().to_string(),
            job.current_step.map(|s| s.as_str()).unwrap_or("-"),
            job.input_source
        );
    }

    Ok(())
}

/// Print the event log; with `follow`, poll for new lines until the job
/// stops (terminal status, or no process holds its lock) or the user
/// interrupts
async fn show_logs(store: &JobStore, job_id: &str, follow: bool, cancel: &CancellationToken) -> Result<()> {
    // Fails with a not-found error for unknown jobs
    let job = store.load(job_id).await?;
    let job_dir = store.job_dir(job.id);

    let mut printed = 0;
    loop {
        let events = store.read_events(job_id).await?;
        for event in events.iter().skip(printed) {
            println!("{}", event.render());
        }
        printed = printed.max(events.len());

        if !follow {
            return Ok(());
        }

        let job = store.load(job_id).await?;
        if job.status() != JobStatus::InProgress || !JobLock::is_locked(&job_dir) {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
        }
    }
}

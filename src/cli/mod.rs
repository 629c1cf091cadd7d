//! Command-line interface for fhirpipe.
//!
//! Provides commands for starting, resuming and inspecting pipeline jobs,
//! and for managing the job directory.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{self, PipelineConfig};
use crate::core::Orchestrator;
use crate::domain::{JobStatus, PipelineJob};
use crate::error::PipelineError;
use crate::steps::StepRegistry;

pub mod job;

/// fhirpipe - Resumable FHIR data pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "fhirpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: .fhirpipe/config.yaml searched upward)
    #[arg(long, global = true, env = "FHIRPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run and inspect pipeline jobs
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },

    /// Manage stored jobs
    Job {
        #[command(subcommand)]
        command: job::JobCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum PipelineCommands {
    /// Create a job for an input and run it
    Start {
        /// Local NDJSON directory or file, HTTP(S) URL, TORCH result URL or CRTDL file
        input: String,
    },

    /// Resume a job from its first unfinished step
    Continue {
        /// Job ID (UUID)
        job_id: String,
    },

    /// Show the status of a job
    Status {
        /// Job ID (UUID)
        job_id: String,
    },
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self, cancel: CancellationToken) -> Result<()> {
        let config = config::load(self.config.as_deref())?;

        match self.command {
            Commands::Pipeline { command } => execute_pipeline(command, config, &cancel).await,
            Commands::Job { command } => job::execute(command, config, &cancel).await,
        }
    }
}

/// Execute pipeline subcommands
async fn execute_pipeline(
    command: PipelineCommands,
    config: PipelineConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let orchestrator = Orchestrator::new(config, StepRegistry::standard()?);

    match command {
        PipelineCommands::Start { input } => {
            let mut job = orchestrator.create_job(&input).await?;
            eprintln!("Created job {}", job.id);

            orchestrator.run_job(&mut job, cancel).await?;
            print_job(&job);
            finish(&job)
        }
        PipelineCommands::Continue { job_id } => {
            let job = orchestrator.continue_job(&job_id, cancel).await?;
            print_job(&job);
            finish(&job)
        }
        PipelineCommands::Status { job_id } => {
            let job = orchestrator.status(&job_id).await?;
            print_job(&job);
            Ok(())
        }
    }
}

/// Turn a failed job into the classified error of its failed step
fn finish(job: &PipelineJob) -> Result<()> {
    match job.status() {
        JobStatus::Completed => {
            eprintln!("\n[Job {} completed successfully]", job.id);
            Ok(())
        }
        JobStatus::Failed => {
            let detail = job.steps.iter().find_map(|s| s.error.clone());
            let err = match detail {
                Some(detail) => PipelineError::from(detail),
                None => PipelineError::corrupted_state(
                    &job.id.to_string(),
                    "job is failed but no step recorded an error",
                ),
            };
            eprintln!("\n[Job {} failed; resume with: fhirpipe pipeline continue {}]", job.id, job.id);
            Err(err.into())
        }
        JobStatus::InProgress => {
            eprintln!("\n[Job {} in progress]", job.id);
            Ok(())
        }
    }
}

/// Print job details and the step table
pub fn print_job(job: &PipelineJob) {
    println!("Job ID: {}", job.id);
    println!("Input: {}", job.input_source);
    if let Some(resolved) = &job.resolved_input {
        println!("Resolved input: {}", resolved);
    }
    println!("Input type: {}", job.input_type);
    println!("Status: {}", job.status());
    println!(
        "Current step: {}",
        job.current_step.map(|s| s.as_str()).unwrap_or("-")
    );
    println!("Created: {}", job.created_at);
    println!("Updated: {}", job.updated_at);

    println!(
        "\n{:<20} {:<10} {:>8} {:>10} {:>10} {:>10}  {}",
        "STEP", "STATUS", "ATTEMPTS", "ENTRIES", "BYTES", "DURATION", "ERROR"
    );
    println!("{}", "-".repeat(90));

    for step in &job.steps {
        let duration = step
            .duration_ms()
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());
        let error = step
            .error
            .as_ref()
            .map(|e| format!("[{}] {}", e.category, e.message))
            .unwrap_or_default();
        println!(
            "{:<20} {:<10} {:>8} {:>10} {:>10} {:>10}  {}",
            step.name.as_str(),
            step.status.to_string(),
            step.attempts,
            step.metrics.entry_count,
            format_bytes(step.metrics.bytes_processed),
            duration,
            error
        );
    }
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Human-readable duration from milliseconds
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

//! File-based job persistence.
//!
//! Each job lives in `<jobs_dir>/<job_id>/`:
//!
//! ```text
//! state.json              job metadata and step statuses (atomic writes)
//! config.json             configuration snapshot taken at creation
//! events.jsonl            append-only job log
//! job.lock                present while a process owns the job
//! <step>.checkpoint.json  progress a step keeps across its own retries
//! import/ pseudonymized/  NDJSON outputs, one file per resource type
//! csv/ parquet/           converted outputs
//! validation-report.json  output of the validation step
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use fs2::FileExt;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::domain::{JobEvent, PipelineJob, StepName};
use crate::error::{classify, ErrorCategory, PipelineError};

use super::lock::JobLock;

pub const STATE_FILE: &str = "state.json";
pub const CONFIG_FILE: &str = "config.json";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const VALIDATION_REPORT: &str = "validation-report.json";

/// Job directories under a common root
#[derive(Debug, Clone)]
pub struct JobStore {
    jobs_dir: PathBuf,
}

impl JobStore {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
        }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    pub fn job_dir(&self, id: Uuid) -> PathBuf {
        self.jobs_dir.join(id.to_string())
    }

    pub fn state_path(&self, id: Uuid) -> PathBuf {
        self.job_dir(id).join(STATE_FILE)
    }

    pub fn config_path(&self, id: Uuid) -> PathBuf {
        self.job_dir(id).join(CONFIG_FILE)
    }

    pub fn events_path(&self, id: Uuid) -> PathBuf {
        self.job_dir(id).join(EVENTS_FILE)
    }

    /// Create the job directory and write the configuration snapshot and initial state
    pub async fn create(&self, job: &PipelineJob) -> Result<(), PipelineError> {
        let dir = self.job_dir(job.id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(e, format!("Failed to create job directory {}", dir.display())))?;

        let snapshot = serde_json::to_vec_pretty(&job.config).map_err(|e| {
            PipelineError::new(
                ErrorCategory::Configuration,
                format!("Configuration cannot be serialized: {}", e),
                false,
            )
        })?;
        write_atomic(dir.clone(), CONFIG_FILE, snapshot).await?;

        self.save(job).await?;
        debug!(job_id = %job.id, dir = %dir.display(), "Created job directory");
        Ok(())
    }

    /// Persist job state: temp file in the job directory, then rename over `state.json`
    pub async fn save(&self, job: &PipelineJob) -> Result<(), PipelineError> {
        let json = serde_json::to_vec_pretty(job).map_err(|e| {
            PipelineError::corrupted_state(&job.id.to_string(), format!("serialization failed: {}", e))
        })?;
        write_atomic(self.job_dir(job.id), STATE_FILE, json).await
    }

    /// Load a job and its configuration snapshot
    pub async fn load(&self, job_id: &str) -> Result<PipelineJob, PipelineError> {
        let id = parse_job_id(job_id)?;
        let state_path = self.state_path(id);

        let content = match fs::read(&state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::job_not_found(job_id));
            }
            Err(e) => {
                return Err(io_error(e, format!("Failed to read {}", state_path.display())));
            }
        };

        let mut job: PipelineJob = serde_json::from_slice(&content)
            .map_err(|e| PipelineError::corrupted_state(job_id, format!("state.json: {}", e)))?;
        if job.id != id {
            return Err(PipelineError::corrupted_state(
                job_id,
                format!("state.json belongs to job {}", job.id),
            ));
        }

        let config_path = self.config_path(id);
        let snapshot = fs::read(&config_path)
            .await
            .map_err(|e| PipelineError::corrupted_state(job_id, format!("config.json: {}", e)))?;
        job.config = serde_json::from_slice::<PipelineConfig>(&snapshot)
            .map_err(|e| PipelineError::corrupted_state(job_id, format!("config.json: {}", e)))?;

        Ok(job)
    }

    /// All readable jobs, newest first
    pub async fn list(&self) -> Result<Vec<PipelineJob>, PipelineError> {
        if !self.jobs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.jobs_dir).await.map_err(|e| {
            io_error(e, format!("Failed to list {}", self.jobs_dir.display()))
        })?;

        let mut jobs = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(io_error(e, format!("Failed to list {}", self.jobs_dir.display())))
                }
            };

            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if Uuid::parse_str(&name).is_err() {
                continue;
            }

            match self.load(&name).await {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(job_id = %name, error = %e, "Skipping unreadable job"),
            }
        }

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Remove a job directory; refuses while the job is locked unless `force`
    pub async fn delete(&self, job_id: &str, force: bool) -> Result<(), PipelineError> {
        let id = parse_job_id(job_id)?;
        let dir = self.job_dir(id);
        if !dir.is_dir() {
            return Err(PipelineError::job_not_found(job_id));
        }

        if JobLock::is_locked(&dir) && !force {
            return Err(PipelineError::job_locked(job_id)
                .with_guidance("Use `fhirpipe job delete --force` if the holder has crashed"));
        }

        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| io_error(e, format!("Failed to delete {}", dir.display())))?;
        debug!(job_id, "Deleted job directory");
        Ok(())
    }

    /// Take the job's exclusive lock
    pub fn lock(&self, id: Uuid, stale_after: Duration) -> Result<JobLock, PipelineError> {
        JobLock::acquire(&self.job_dir(id), &id.to_string(), stale_after)
    }

    /// Append one event to the job log under an exclusive file lock
    pub fn append_event(&self, event: &JobEvent) -> Result<(), PipelineError> {
        let path = self.events_path(event.job_id);
        append_line(&path, event).map_err(classify)
    }

    /// Read the job log; lines that fail to parse are skipped
    pub async fn read_events(&self, job_id: &str) -> Result<Vec<JobEvent>, PipelineError> {
        let id = parse_job_id(job_id)?;
        if !self.job_dir(id).is_dir() {
            return Err(PipelineError::job_not_found(job_id));
        }

        let path = self.events_path(id);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(e, format!("Failed to open {}", path.display()))),
        };

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => return Err(io_error(e, format!("Failed to read {}", path.display()))),
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JobEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(job_id, error = %e, "Skipping unparseable log line"),
            }
        }

        Ok(events)
    }

    /// Where a step writes its output (a directory, or the report file for validation)
    pub fn step_output_path(&self, id: Uuid, step: StepName) -> PathBuf {
        let dir = self.job_dir(id);
        match step.output_dir_name() {
            Some(name) => dir.join(name),
            None => dir.join(VALIDATION_REPORT),
        }
    }

    /// Output directory of a data-producing step
    pub fn step_output_dir(&self, id: Uuid, step: StepName) -> Option<PathBuf> {
        step.output_dir_name().map(|name| self.job_dir(id).join(name))
    }

    /// Scratch file a step may use to avoid repeating work on its retries
    pub fn step_checkpoint_path(&self, id: Uuid, step: StepName) -> PathBuf {
        self.job_dir(id).join(format!("{}.checkpoint.json", step.as_str()))
    }

    /// Discard whatever a previous execution of `step` left behind,
    /// including its checkpoint
    pub async fn reset_step_output(&self, id: Uuid, step: StepName) -> Result<(), PipelineError> {
        for path in [self.step_output_path(id, step), self.step_checkpoint_path(id, step)] {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path).await
            } else if path.exists() {
                fs::remove_file(&path).await
            } else {
                continue;
            };

            result.map_err(|e| io_error(e, format!("Failed to remove {}", path.display())))?;
            debug!(job_id = %id, step = %step, path = %path.display(), "Removed previous step output");
        }
        Ok(())
    }
}

fn parse_job_id(job_id: &str) -> Result<Uuid, PipelineError> {
    Uuid::parse_str(job_id.trim()).map_err(|_| PipelineError::job_not_found(job_id))
}

fn io_error(e: std::io::Error, context: String) -> PipelineError {
    classify(anyhow::Error::new(e).context(context))
}

/// Write `bytes` to `dir/name` through a temp file in the same directory
async fn write_atomic(dir: PathBuf, name: &'static str, bytes: Vec<u8>) -> Result<(), PipelineError> {
    let task = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let target = dir.join(name);
        let mut tmp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(&bytes)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("Failed to sync {}", target.display()))?;
        tmp.persist(&target)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {}", target.display()))?;
        Ok(())
    });

    match task.await {
        Ok(result) => result.map_err(classify),
        Err(e) => Err(PipelineError::new(
            ErrorCategory::State,
            format!("State write task failed: {}", e),
            false,
        )),
    }
}

fn append_line(path: &Path, event: &JobEvent) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open job log: {}", path.display()))?;

    file.lock_exclusive()
        .context("Failed to acquire file lock on events.jsonl")?;

    let json = serde_json::to_string(event).context("Failed to serialize event")?;
    writeln!(file, "{}", json).context("Failed to write event")?;
    file.flush().context("Failed to flush event")?;

    // Lock released when file is dropped
    Ok(())
}

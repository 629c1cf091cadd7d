//! Main orchestrator for pipeline jobs.
//!
//! Coordinates job creation, step execution, persistence, event logging,
//! retry handling and resumption.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::domain::{EventType, JobEvent, JobStatus, PipelineJob, StepMetrics, StepName, StepStatus};
use crate::error::PipelineError;
use crate::steps::{StepContext, StepRegistry};

use super::input::classify_input;
use super::job_store::JobStore;
use super::lock::JobLock;
use super::prerequisites::{PrerequisiteTable, Readiness};
use super::retry::with_retry_observed;

/// Main pipeline orchestrator
pub struct Orchestrator {
    /// Persistence for job state and logs
    store: JobStore,

    /// Configuration of this invocation; new jobs snapshot it
    config: Arc<PipelineConfig>,

    /// Step implementations
    registry: StepRegistry,

    /// Immutable prerequisite table
    prerequisites: PrerequisiteTable,
}

impl Orchestrator {
    /// Create an orchestrator storing jobs under `config.jobs_dir`
    pub fn new(config: PipelineConfig, registry: StepRegistry) -> Self {
        Self {
            store: JobStore::new(&config.jobs_dir),
            config: Arc::new(config),
            registry,
            prerequisites: PrerequisiteTable::default(),
        }
    }

    /// Replace the default prerequisite table
    pub fn with_prerequisites(mut self, prerequisites: PrerequisiteTable) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Classify the input, build the step list and persist a new job
    #[instrument(skip(self))]
    pub async fn create_job(&self, input_source: &str) -> Result<PipelineJob, PipelineError> {
        self.config.validate()?;

        let input_type = classify_input(input_source)?;
        let steps = self.config.resolve_steps(input_type)?;
        let mut job = PipelineJob::new(
            input_source.to_string(),
            input_type,
            &steps,
            (*self.config).clone(),
        );
        job.resolved_input = resolve_source(input_source).filter(|r| r != input_source);
        self.store.create(&job).await?;

        info!(job_id = %job.id, %input_type, steps = steps.len(), "Created job");
        self.record(JobEvent::new(
            job.id,
            None,
            EventType::JobCreated,
            format!(
                "Job created for {} input '{}' with steps [{}]",
                input_type,
                job.input_source,
                steps.iter().map(StepName::as_str).collect::<Vec<_>>().join(", ")
            ),
        ));
        Ok(job)
    }

    /// Create a job and run all of its steps.
    ///
    /// A step failure is recorded in the returned job (status Failed);
    /// errors are returned only when the job could not be run at all or was
    /// cancelled.
    pub async fn start(
        &self,
        input_source: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineJob, PipelineError> {
        let mut job = self.create_job(input_source).await?;
        self.run_job(&mut job, cancel).await?;
        Ok(job)
    }

    /// Run every step of a freshly created job under its lock
    pub async fn run_job(
        &self,
        job: &mut PipelineJob,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let _lock = self.lock(job)?;
        self.execute_locked(job, cancel).await
    }

    /// Resume a job from its first step that is not Completed or Skipped
    #[instrument(skip(self, cancel))]
    pub async fn continue_job(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineJob, PipelineError> {
        let job = self.store.load(job_id).await?;
        let _lock = self.lock(&job)?;

        // Reload now that no other writer can race us
        let mut job = self.store.load(job_id).await?;
        job.config.restore_secrets(&self.config);
        if job.status() == JobStatus::Completed {
            info!(job_id = %job.id, "Job already completed, nothing to resume");
            return Ok(job);
        }

        let first = job.first_unfinished().unwrap_or(job.steps.len());
        info!(job_id = %job.id, from_step = first, "Resuming job");
        self.record(JobEvent::new(
            job.id,
            job.steps.get(first).map(|s| s.name),
            EventType::JobResumed,
            "Job resumed".to_string(),
        ));

        self.reset_from(&mut job, first).await?;
        self.execute_locked(&mut job, cancel).await?;
        Ok(job)
    }

    /// Run one step: lock, check prerequisites, execute with retries, persist
    pub async fn run_step(
        &self,
        job: &mut PipelineJob,
        step: StepName,
        cancel: &CancellationToken,
    ) -> Result<StepMetrics, PipelineError> {
        let _lock = self.lock(job)?;
        self.run_step_locked(job, step, cancel).await
    }

    /// Load a job's current state
    pub async fn status(&self, job_id: &str) -> Result<PipelineJob, PipelineError> {
        self.store.load(job_id).await
    }

    /// All jobs, newest first
    pub async fn list_jobs(&self) -> Result<Vec<PipelineJob>, PipelineError> {
        self.store.list().await
    }

    /// Delete a job and all of its outputs
    pub async fn delete_job(&self, job_id: &str, force: bool) -> Result<(), PipelineError> {
        self.store.delete(job_id, force).await?;
        info!(job_id, "Deleted job");
        Ok(())
    }

    fn lock(&self, job: &PipelineJob) -> Result<JobLock, PipelineError> {
        let stale_after = Duration::from_secs(job.config.lock.stale_after_secs);
        self.store.lock(job.id, stale_after)
    }

    /// Reset every non-terminal step from `first` on and discard its output
    async fn reset_from(&self, job: &mut PipelineJob, first: usize) -> Result<(), PipelineError> {
        for index in first..job.steps.len() {
            let (name, status) = (job.steps[index].name, job.steps[index].status);
            if status.is_terminal_success() {
                continue;
            }

            if status != StepStatus::Pending {
                job.steps[index].transition(StepStatus::Pending)?;
                self.record(
                    JobEvent::new(
                        job.id,
                        Some(name),
                        EventType::StepReset,
                        format!("Step '{}' reset from {} to pending", name, status),
                    )
                    .with_status(StepStatus::Pending),
                );
            }
            self.store.reset_step_output(job.id, name).await?;
        }

        job.touch();
        self.store.save(job).await
    }

    /// Run remaining steps in order; the caller holds the lock
    async fn execute_locked(
        &self,
        job: &mut PipelineJob,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        for index in 0..job.steps.len() {
            if job.steps[index].status.is_terminal_success() {
                continue;
            }
            let step = job.steps[index].name;

            if let Err(err) = self.run_step_locked(job, step, cancel).await {
                if err.cancelled {
                    return Err(err);
                }
                // A step that never started (prerequisite, missing implementation)
                if job.steps[index].status != StepStatus::Failed {
                    return Err(err);
                }

                error!(job_id = %job.id, %step, "Pipeline halted");
                self.record(
                    JobEvent::new(
                        job.id,
                        Some(step),
                        EventType::JobFailed,
                        format!("Pipeline halted at step '{}'", step),
                    )
                    .with_error(err.to_string()),
                );
                return Ok(());
            }
        }

        info!(job_id = %job.id, "Job completed");
        self.record(JobEvent::new(
            job.id,
            None,
            EventType::JobCompleted,
            "All steps completed".to_string(),
        ));
        Ok(())
    }

    #[instrument(skip(self, job, step, cancel), fields(job_id = %job.id, step = %step))]
    async fn run_step_locked(
        &self,
        job: &mut PipelineJob,
        step: StepName,
        cancel: &CancellationToken,
    ) -> Result<StepMetrics, PipelineError> {
        let index = job
            .steps
            .iter()
            .position(|s| s.name == step)
            .ok_or_else(|| {
                PipelineError::invalid_input(format!("Step '{}' is not configured for this job", step))
            })?;

        if let Readiness::Blocked { prerequisite, status } = self.prerequisites.validate(job, step) {
            return Err(PipelineError::prerequisite_not_met(
                step.as_str(),
                prerequisite.as_str(),
                status,
            ));
        }

        let implementation = self.registry.get(step).ok_or_else(|| {
            PipelineError::invalid_config(format!("No implementation registered for step '{}'", step))
        })?;

        job.steps[index].transition(StepStatus::Running)?;
        job.current_step = Some(step);
        job.touch();
        self.store.save(job).await?;

        info!("Step started");
        self.record(
            JobEvent::new(job.id, Some(step), EventType::StepStarted, format!("Step '{}' started", step))
                .with_status(StepStatus::Running),
        );

        let started = Instant::now();
        let outcome = {
            let ctx = StepContext {
                cancel: cancel.clone(),
                job: &*job,
                config: &job.config,
                job_dir: self.store.job_dir(job.id),
                output: self.store.step_output_path(job.id, step),
                checkpoint: self.store.step_checkpoint_path(job.id, step),
            };
            let job_id = job.id;

            with_retry_observed(
                &job.config.retry,
                cancel,
                |_| implementation.execute(&ctx),
                |attempt, err, delay| {
                    self.record(
                        JobEvent::new(
                            job_id,
                            Some(step),
                            EventType::StepRetrying,
                            format!(
                                "Attempt {} failed, retrying in {}ms",
                                attempt,
                                delay.as_millis()
                            ),
                        )
                        .with_status(StepStatus::Running)
                        .with_attempt(attempt)
                        .with_error(err.to_string()),
                    );
                },
            )
            .await
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(retried) => {
                let metrics = retried.value;
                {
                    let state = &mut job.steps[index];
                    state.attempts += retried.attempts;
                    state.metrics = metrics;
                    state.transition(StepStatus::Completed)?;
                }
                job.touch();
                self.store.save(job).await?;

                info!(
                    entries = metrics.entry_count,
                    bytes = metrics.bytes_processed,
                    attempts = retried.attempts,
                    duration_ms,
                    "Step completed"
                );
                self.record(
                    JobEvent::new(
                        job.id,
                        Some(step),
                        EventType::StepCompleted,
                        format!(
                            "Step '{}' completed: {} entries, {} bytes",
                            step, metrics.entry_count, metrics.bytes_processed
                        ),
                    )
                    .with_status(StepStatus::Completed)
                    .with_attempt(retried.attempts)
                    .with_duration(duration_ms),
                );
                Ok(metrics)
            }
            Err(retry_err) if retry_err.is_cancelled() => {
                // Left Running so that `continue` re-runs it
                job.steps[index].attempts += retry_err.attempts();
                job.touch();
                self.store.save(job).await?;

                warn!(duration_ms, "Step cancelled");
                self.record(
                    JobEvent::new(
                        job.id,
                        Some(step),
                        EventType::StepCancelled,
                        format!("Step '{}' cancelled", step),
                    )
                    .with_status(StepStatus::Running)
                    .with_duration(duration_ms),
                );
                Err(retry_err.into_pipeline_error(step.as_str()))
            }
            Err(retry_err) => {
                let attempts = retry_err.attempts();
                let err = retry_err.into_pipeline_error(step.as_str());
                {
                    let state = &mut job.steps[index];
                    state.attempts += attempts;
                    state.error = Some(err.detail());
                    state.transition(StepStatus::Failed)?;
                }
                job.touch();
                self.store.save(job).await?;

                error!(attempts, error = %err, retryable = err.retryable, "Step failed");
                self.record(
                    JobEvent::new(
                        job.id,
                        Some(step),
                        EventType::StepFailed,
                        format!("Step '{}' failed after {} attempt(s)", step, attempts),
                    )
                    .with_status(StepStatus::Failed)
                    .with_attempt(attempts)
                    .with_duration(duration_ms)
                    .with_error(err.to_string()),
                );
                Err(err)
            }
        }
    }

    /// Append to the job log; a failing log write never fails the job
    fn record(&self, event: JobEvent) {
        if let Err(e) = self.store.append_event(&event) {
            warn!(job_id = %event.job_id, error = %e, "Failed to write job log");
        }
    }
}

/// Trimmed URL, or absolute form of an existing local path
fn resolve_source(input_source: &str) -> Option<String> {
    let trimmed = input_source.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Some(trimmed.to_string());
    }
    std::fs::canonicalize(trimmed)
        .ok()
        .map(|p| p.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_source_trims_urls_and_skips_missing_paths() {
        assert_eq!(
            resolve_source(" https://host/fhir/result/1 ").as_deref(),
            Some("https://host/fhir/result/1")
        );
        assert_eq!(resolve_source("/definitely/not/here"), None);
    }

    #[test]
    fn test_resolve_source_makes_paths_absolute() {
        let temp = tempfile::TempDir::new().unwrap();
        let resolved = resolve_source(temp.path().to_str().unwrap()).unwrap();
        assert!(std::path::Path::new(&resolved).is_absolute());
    }
}

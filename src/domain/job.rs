//! Job state.
//!
//! A [`PipelineJob`] is one end-to-end execution. Its overall status is
//! never stored; it is derived from the step statuses on demand.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PipelineConfig;

use super::step::{PipelineStep, StepName, StepStatus};

/// How the input token is imported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// Local directory (or file) of NDJSON
    Local,

    /// Plain HTTP(S) NDJSON download
    Http,

    /// URL of an already submitted TORCH extraction
    #[serde(rename = "torch_result_url")]
    TorchResultUrl,

    /// CRTDL query document to submit to TORCH
    Crtdl,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Http => "http",
            Self::TorchResultUrl => "torch_result_url",
            Self::Crtdl => "crtdl",
        };
        f.write_str(s)
    }
}

/// Overall status of a job, derived from its steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A pipeline job and its persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    /// Unique identifier for this job
    pub id: Uuid,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Input exactly as supplied by the user
    pub input_source: String,

    /// Absolute form of a local `input_source`, so `continue` works from any directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_input: Option<String>,

    /// Classification of `input_source`
    pub input_type: InputType,

    /// Step most recently started
    pub current_step: Option<StepName>,

    /// Steps in configured order; never reordered
    pub steps: Vec<PipelineStep>,

    /// Configuration used at creation time (persisted separately)
    #[serde(skip)]
    pub config: PipelineConfig,
}

impl PipelineJob {
    /// Create a job with every step Pending
    pub fn new(
        input_source: String,
        input_type: InputType,
        step_names: &[StepName],
        config: PipelineConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            input_source,
            resolved_input: None,
            input_type,
            current_step: None,
            steps: step_names.iter().copied().map(PipelineStep::new).collect(),
            config,
        }
    }

    /// Derived overall status.
    ///
    /// Any Failed step makes the job Failed; the job is Completed only when
    /// every step is Completed or Skipped; otherwise it is in progress.
    pub fn status(&self) -> JobStatus {
        if self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            JobStatus::Failed
        } else if self.steps.iter().all(|s| s.status.is_terminal_success()) {
            JobStatus::Completed
        } else {
            JobStatus::InProgress
        }
    }

    /// Input the steps read: the resolved form when there is one
    pub fn resolved_source(&self) -> &str {
        self.resolved_input.as_deref().unwrap_or(&self.input_source)
    }

    pub fn step(&self, name: StepName) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: StepName) -> Option<&mut PipelineStep> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// Index of the first step that still has to run
    pub fn first_unfinished(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| !s.status.is_terminal_success())
    }

    /// Bump `updated_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(steps: &[StepName]) -> PipelineJob {
        PipelineJob::new(
            "/data/in".to_string(),
            InputType::Local,
            steps,
            PipelineConfig::default(),
        )
    }

    #[test]
    fn test_new_job_is_in_progress() {
        let job = job(&[StepName::LocalImport, StepName::DeIdentify]);
        assert_eq!(job.status(), JobStatus::InProgress);
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(job.first_unfinished(), Some(0));
    }

    #[test]
    fn test_status_is_derived_from_steps() {
        let mut job = job(&[StepName::LocalImport, StepName::DeIdentify]);
        job.steps[0].status = StepStatus::Completed;
        assert_eq!(job.status(), JobStatus::InProgress);
        assert_eq!(job.first_unfinished(), Some(1));

        job.steps[1].status = StepStatus::Failed;
        assert_eq!(job.status(), JobStatus::Failed);

        job.steps[1].status = StepStatus::Skipped;
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.first_unfinished(), None);
    }

    #[test]
    fn test_failed_import_with_pending_rest_is_failed() {
        let mut job = job(&[StepName::LocalImport, StepName::DeIdentify]);
        job.steps[0].status = StepStatus::Failed;
        assert_eq!(job.status(), JobStatus::Failed);
    }

    #[test]
    fn test_state_serialization_skips_config() {
        let job = job(&[StepName::LocalImport]);
        let json = serde_json::to_value(&job).unwrap();
        assert!(json.get("config").is_none());
        assert_eq!(json["input_type"], "local");
        assert_eq!(json["steps"][0]["name"], "local_import");
        assert!(json.get("resolved_input").is_none());
    }

    #[test]
    fn test_resolved_source_falls_back_to_input() {
        let mut job = job(&[StepName::LocalImport]);
        assert_eq!(job.resolved_source(), "/data/in");

        job.input_source = "data/in/".to_string();
        job.resolved_input = Some("/srv/data/in".to_string());
        assert_eq!(job.resolved_source(), "/srv/data/in");
        assert_eq!(job.input_source, "data/in/");
    }
}

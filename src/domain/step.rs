//! Pipeline steps and their lifecycle.
//!
//! A job owns one [`PipelineStep`] per configured step, in configured order.
//! Status moves forward along Pending → Running → {Completed | Failed | Skipped};
//! the only backward edges are the explicit resets performed on resume.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorDetail, PipelineError};

use super::job::InputType;

/// Concrete step identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    /// Import via a TORCH extraction (CRTDL submission or result URL)
    TorchImport,

    /// Import NDJSON files from a local directory
    LocalImport,

    /// Import a single NDJSON document over HTTP(S)
    HttpImport,

    /// De-identification through the DIMP service
    #[serde(rename = "dimp")]
    DeIdentify,

    /// Structural validation of the imported resources
    #[serde(rename = "validation")]
    Validate,

    /// Conversion to CSV
    CsvConversion,

    /// Conversion to Parquet
    ParquetConversion,
}

impl StepName {
    pub const ALL: [StepName; 7] = [
        Self::TorchImport,
        Self::LocalImport,
        Self::HttpImport,
        Self::DeIdentify,
        Self::Validate,
        Self::CsvConversion,
        Self::ParquetConversion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TorchImport => "torch_import",
            Self::LocalImport => "local_import",
            Self::HttpImport => "http_import",
            Self::DeIdentify => "dimp",
            Self::Validate => "validation",
            Self::CsvConversion => "csv_conversion",
            Self::ParquetConversion => "parquet_conversion",
        }
    }

    /// The family this step belongs to
    pub fn kind(&self) -> StepKind {
        match self {
            Self::TorchImport | Self::LocalImport | Self::HttpImport => StepKind::Import,
            Self::DeIdentify => StepKind::DeIdentify,
            Self::Validate => StepKind::Validate,
            Self::CsvConversion => StepKind::CsvConversion,
            Self::ParquetConversion => StepKind::ParquetConversion,
        }
    }

    pub fn is_import(&self) -> bool {
        self.kind() == StepKind::Import
    }

    /// Import variant able to handle the given input type
    pub fn import_for(input_type: InputType) -> Self {
        match input_type {
            InputType::Local => Self::LocalImport,
            InputType::Http => Self::HttpImport,
            InputType::TorchResultUrl | InputType::Crtdl => Self::TorchImport,
        }
    }

    /// Directory (relative to the job directory) holding this step's output
    pub fn output_dir_name(&self) -> Option<&'static str> {
        match self.kind() {
            StepKind::Import => Some("import"),
            StepKind::DeIdentify => Some("pseudonymized"),
            StepKind::CsvConversion => Some("csv"),
            StepKind::ParquetConversion => Some("parquet"),
            StepKind::Validate => None,
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepName {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| PipelineError::invalid_config(format!("Unknown step name: '{}'", s)))
    }
}

/// Step family; all import variants share [`StepKind::Import`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Import,
    DeIdentify,
    Validate,
    CsvConversion,
    ParquetConversion,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Import => "import",
            Self::DeIdentify => "dimp",
            Self::Validate => "validation",
            Self::CsvConversion => "csv_conversion",
            Self::ParquetConversion => "parquet_conversion",
        };
        f.write_str(s)
    }
}

/// Status of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started
    #[default]
    Pending,

    /// Currently executing (or interrupted while executing)
    Running,

    /// Completed successfully
    Completed,

    /// Failed; terminal until resumed
    Failed,

    /// Deliberately not executed
    Skipped,
}

impl StepStatus {
    /// Completed or Skipped
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    fn can_transition_to(&self, to: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Skipped)
                // resume edges
                | (Failed, Pending)
                | (Running, Pending)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Result metrics reported by a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Number of records (FHIR resources) processed
    pub entry_count: u64,

    /// Number of bytes written or transferred
    pub bytes_processed: u64,
}

impl StepMetrics {
    pub fn new(entry_count: u64, bytes_processed: u64) -> Self {
        Self {
            entry_count,
            bytes_processed,
        }
    }

    /// Accumulate another set of metrics
    pub fn add(&mut self, other: StepMetrics) {
        self.entry_count += other.entry_count;
        self.bytes_processed += other.bytes_processed;
    }
}

/// One configured step of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub name: StepName,

    #[serde(default)]
    pub status: StepStatus,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metrics: StepMetrics,

    /// Executions of the step body over every run of the job; a reset keeps the count
    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl PipelineStep {
    pub fn new(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            metrics: StepMetrics::default(),
            attempts: 0,
            error: None,
        }
    }

    /// Move to a new status, rejecting edges the lifecycle does not allow
    pub fn transition(&mut self, to: StepStatus) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(to) {
            return Err(PipelineError::invalid_transition(
                self.name.as_str(),
                self.status,
                to,
            ));
        }

        let now = Utc::now();
        match to {
            StepStatus::Running => {
                self.started_at = Some(now);
                self.completed_at = None;
                self.error = None;
            }
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => {
                self.completed_at = Some(now);
            }
            StepStatus::Pending => {
                self.started_at = None;
                self.completed_at = None;
                self.metrics = StepMetrics::default();
                self.error = None;
            }
        }
        self.status = to;
        Ok(())
    }

    /// Wall-clock duration of the last execution, if finished
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

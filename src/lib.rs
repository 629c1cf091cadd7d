//! fhirpipe - Resumable FHIR data pipeline orchestrator
//!
//! Moves FHIR resources through a short, statically configured sequence of
//! steps: import (local NDJSON, HTTP download, or a TORCH extraction),
//! optional de-identification through DIMP, structural validation, and
//! conversion to CSV or Parquet.
//!
//! # Architecture
//!
//! - Every job lives in its own directory with `state.json` (atomically
//!   rewritten), a `config.json` snapshot and an append-only `events.jsonl`
//! - A job's overall status is derived from its step statuses
//! - Failed or interrupted jobs resume from the first unfinished step
//! - Transient failures are retried with capped exponential backoff
//!
//! # Modules
//!
//! - `config`: YAML configuration with environment overrides
//! - `error`: Classified errors with remediation guidance and exit codes
//! - `domain`: Data structures (PipelineJob, PipelineStep, JobEvent)
//! - `core`: Orchestration logic (Orchestrator, JobStore, retry, polling)
//! - `steps`: Step implementations talking to the outside world
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Import a directory of NDJSON and run the configured steps
//! fhirpipe pipeline start ./export
//!
//! # Check job status
//! fhirpipe pipeline status <job-id>
//!
//! # Resume a failed job
//! fhirpipe pipeline continue <job-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod steps;

// Re-export main types at crate root for convenience
pub use config::PipelineConfig;
pub use core::{JobStore, Orchestrator};
pub use domain::{EventType, InputType, JobEvent, JobStatus, PipelineJob, PipelineStep, StepMetrics, StepName, StepStatus};
pub use error::{ErrorCategory, PipelineError};
pub use steps::{Step, StepContext, StepRegistry};

//! Domain types for the pipeline orchestrator.
//!
//! This module contains the core data structures:
//! - Job: Pipeline execution state and input classification result
//! - Step: Step identity, lifecycle and metrics
//! - Events: Entries of the per-job log

pub mod events;
pub mod job;
pub mod step;

// Re-export commonly used types
pub use events::{EventType, JobEvent};
pub use job::{InputType, JobStatus, PipelineJob};
pub use step::{PipelineStep, StepKind, StepMetrics, StepName, StepStatus};

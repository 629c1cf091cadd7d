//! Core orchestration logic.
//!
//! This module contains:
//! - JobStore / JobLock: Per-job persistence and exclusive locking
//! - Retry / Poll: Backoff engine and the upstream poll loop
//! - Prerequisites: Step dependency table
//! - Input / Ndjson: Input classification and streaming record I/O
//! - Orchestrator: Main execution engine

pub mod input;
pub mod job_store;
pub mod lock;
pub mod ndjson;
pub mod orchestrator;
pub mod poll;
pub mod prerequisites;
pub mod retry;

// Re-export commonly used types
pub use input::classify_input;
pub use job_store::JobStore;
pub use lock::JobLock;
pub use ndjson::{NdjsonReader, NdjsonWriter, Record};
pub use orchestrator::Orchestrator;
pub use poll::{poll_until, PollSchedule, PollStatus};
pub use prerequisites::{PrerequisiteTable, Readiness};
pub use retry::{with_retry, with_retry_observed, Retried, RetryError, RetryPolicy};

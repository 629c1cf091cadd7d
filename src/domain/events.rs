//! Job log events.
//!
//! Every state transition of a job is recorded as one line in the job's
//! append-only `events.jsonl`. The log is for humans and `job logs`; the
//! authoritative state lives in `state.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::{StepName, StepStatus};

/// A single entry in a job's log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The job this event belongs to
    pub job_id: Uuid,

    /// Step the event refers to (if applicable)
    pub step: Option<StepName>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO secrets)
    pub summary: String,

    /// Step status after the event
    pub status: Option<StepStatus>,

    /// Attempt number (for step events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Time taken in milliseconds (for finished steps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    /// Create a new event with the current timestamp
    pub fn new(job_id: Uuid, step: Option<StepName>, event_type: EventType, summary: String) -> Self {
        Self {
            timestamp: Utc::now(),
            job_id,
            step,
            event_type,
            summary,
            status: None,
            attempt: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_status(mut self, status: StepStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// One-line rendering for `job logs`
    pub fn render(&self) -> String {
        let mut line = format!(
            "{} {:<16}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.event_type.as_str()
        );
        if let Some(step) = self.step {
            line.push_str(&format!(" [{}]", step));
        }
        line.push(' ');
        line.push_str(&self.summary);
        if let Some(error) = &self.error {
            line.push_str(&format!(" | error: {}", error));
        }
        line
    }
}

/// Types of events recorded in the job log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Job created and persisted
    JobCreated,

    /// A `continue` invocation picked the job up again
    JobResumed,

    /// Every step completed or was skipped
    JobCompleted,

    /// A step failed and the pipeline halted
    JobFailed,

    /// A step has started execution
    StepStarted,

    /// A step attempt failed and will be retried
    StepRetrying,

    /// A step completed successfully
    StepCompleted,

    /// A step failed terminally
    StepFailed,

    /// A step was interrupted by cancellation
    StepCancelled,

    /// A step was reset to Pending before re-running
    StepReset,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "job_created",
            Self::JobResumed => "job_resumed",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::StepStarted => "step_started",
            Self::StepRetrying => "step_retrying",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepCancelled => "step_cancelled",
            Self::StepReset => "step_reset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = JobEvent::new(
            Uuid::new_v4(),
            Some(StepName::DeIdentify),
            EventType::StepStarted,
            "Starting dimp".to_string(),
        )
        .with_status(StepStatus::Running)
        .with_attempt(1);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"step\":\"dimp\""));
        assert!(!json.contains("duration_ms"));

        let parsed: JobEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.status, Some(StepStatus::Running));
        assert_eq!(parsed.attempt, Some(1));
    }

    #[test]
    fn test_event_with_error_renders() {
        let event = JobEvent::new(
            Uuid::new_v4(),
            Some(StepName::LocalImport),
            EventType::StepFailed,
            "Import failed".to_string(),
        )
        .with_error("[FileSystem] Permission denied".to_string());

        let line = event.render();
        assert!(line.contains("step_failed"));
        assert!(line.contains("[local_import]"));
        assert!(line.contains("Permission denied"));
    }
}

//! Classified errors for pipeline execution.
//!
//! Every failure that leaves the core is a [`PipelineError`]: a category,
//! a human message, ordered remediation guidance and a retryable flag.
//! Step bodies are free to use `anyhow` internally; [`classify`] turns
//! whatever they return into a `PipelineError` before the orchestrator
//! decides between retrying and failing the step.
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | unclassified internal error |
//! | 2 | configuration error |
//! | 3 | validation error (input or data) |
//! | 4 | job state error (not found, corrupted, locked) |
//! | 5 | network or upstream service error |
//! | 6 | filesystem error |
//! | 130 | cancelled (Ctrl-C) |

use std::fmt;
use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Boxed cause kept for root-cause traceability
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Exit code for a run interrupted by the user
pub const EXIT_CANCELLED: i32 = 130;

/// Exit code for errors that never went through classification
pub const EXIT_INTERNAL: i32 = 1;

/// Broad failure category; drives retry policy and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    FileSystem,
    Validation,
    Service,
    Configuration,
    State,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "Network",
            Self::FileSystem => "FileSystem",
            Self::Validation => "Validation",
            Self::Service => "Service",
            Self::Configuration => "Configuration",
            Self::State => "State",
        }
    }

    /// Stable process exit code for this category
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration => 2,
            Self::Validation => 3,
            Self::State => 4,
            Self::Network | Self::Service => 5,
            Self::FileSystem => 6,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified pipeline error.
#[derive(Debug)]
pub struct PipelineError {
    /// Failure category
    pub category: ErrorCategory,

    /// Plain-language description of what went wrong
    pub message: String,

    /// Ordered remediation steps shown to the user
    pub guidance: Vec<String>,

    /// Whether retrying the same operation may succeed
    pub retryable: bool,

    /// HTTP status returned by an upstream service, if any
    pub http_status: Option<u16>,

    /// Set by the retry engine once every allowed attempt failed
    pub retries_exhausted: bool,

    /// Set when the operation was interrupted by cancellation
    pub cancelled: bool,

    /// Underlying cause
    pub source: Option<BoxError>,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl PipelineError {
    /// Create an error with explicit category and retryability
    pub fn new(category: ErrorCategory, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            category,
            message: message.into(),
            guidance: Vec::new(),
            retryable,
            http_status: None,
            retries_exhausted: false,
            cancelled: false,
            source: None,
        }
    }

    /// Append a remediation step
    pub fn with_guidance(mut self, step: impl Into<String>) -> Self {
        self.guidance.push(step.into());
        self
    }

    /// Attach the underlying cause
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Mark as the final error of an exhausted retry loop
    pub fn exhausted(mut self) -> Self {
        self.retries_exhausted = true;
        self
    }

    /// Exit code the CLI should terminate with
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_CANCELLED
        } else {
            self.category.exit_code()
        }
    }

    /// Multi-line message for the terminal.
    ///
    /// Always names the category, the cause and at least one remediation
    /// step. Retryable errors also say that resuming retries automatically.
    pub fn user_report(&self) -> String {
        let mut out = format!("Error [{}]: {}\n", self.category, self.message);

        if let Some(status) = self.http_status {
            out.push_str(&format!("HTTP status: {}\n", status));
        }
        if let Some(cause) = &self.source {
            out.push_str(&format!("Cause: {}\n", cause));
        }
        if self.retries_exhausted {
            out.push_str("All retry attempts were used up.\n");
        }

        out.push_str("What to do:\n");
        if self.guidance.is_empty() {
            out.push_str("  1. Check the job log with `fhirpipe job logs <job-id>` for details\n");
        } else {
            for (i, step) in self.guidance.iter().enumerate() {
                out.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        if self.retryable {
            out.push_str(
                "This failure is transient: `fhirpipe pipeline continue <job-id>` will retry it automatically.\n",
            );
        }
        out
    }

    /// Serializable snapshot for persisting on a failed step
    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail::from(self)
    }

    // ------------------------------------------------------------------
    // Canonical constructors
    // ------------------------------------------------------------------

    pub fn service_unreachable(service: &str, url: &str) -> Self {
        Self::new(
            ErrorCategory::Network,
            format!("Cannot reach {} at {}", service, url),
            true,
        )
        .with_guidance(format!("Check that the {} service is running", service))
        .with_guidance(format!("Verify the {} URL in the configuration", service))
        .with_guidance("Check network connectivity and proxy settings")
    }

    pub fn timeout(operation: &str, after: Duration) -> Self {
        let message = if after.is_zero() {
            format!("{} timed out", operation)
        } else {
            format!("{} timed out after {}s", operation, after.as_secs())
        };
        Self::new(ErrorCategory::Network, message, true)
            .with_guidance("The upstream service may be overloaded; try again later")
            .with_guidance("Increase the timeout in the configuration if this keeps happening")
    }

    pub fn file_not_found(path: &Path) -> Self {
        Self::new(
            ErrorCategory::FileSystem,
            format!("File or directory not found: {}", path.display()),
            false,
        )
        .with_guidance("Check that the path exists and is spelled correctly")
    }

    pub fn disk_full(path: &Path) -> Self {
        Self::new(
            ErrorCategory::FileSystem,
            format!("No space left on device while writing {}", path.display()),
            false,
        )
        .with_guidance("Free up disk space or point jobs_dir at a larger volume")
        .with_guidance("Delete finished jobs with `fhirpipe job delete <job-id>`")
    }

    pub fn permission_denied(path: &Path) -> Self {
        Self::new(
            ErrorCategory::FileSystem,
            format!("Permission denied: {}", path.display()),
            false,
        )
        .with_guidance("Check file and directory permissions for the current user")
    }

    pub fn malformed_line(source: &str, line: usize, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCategory::Validation,
            format!("Malformed NDJSON in {} at line {}: {}", source, line, reason),
            false,
        )
        .with_guidance("Each line must hold exactly one JSON object")
        .with_guidance(format!("Inspect line {} of {}", line, source))
    }

    pub fn line_too_long(source: &str, line: usize, limit: usize) -> Self {
        Self::new(
            ErrorCategory::Validation,
            format!(
                "Line {} of {} exceeds the maximum of {} bytes",
                line, source, limit
            ),
            false,
        )
        .with_guidance("Split oversized resources or check the file is really NDJSON")
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCategory::Validation,
            format!("Record is missing field '{}' or it has the wrong type", field),
            false,
        )
        .with_guidance(format!("Ensure every resource has a '{}' field", field))
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message, false)
            .with_guidance("Pass a directory, an NDJSON URL, a TORCH result URL or a CRTDL file")
    }

    /// Upstream service answered with an HTTP error status
    pub fn service_status(service: &str, status: u16, body: &str) -> Self {
        let retryable = status >= 500;
        let mut err = Self::new(
            ErrorCategory::Service,
            format!("{} returned HTTP {}: {}", service, status, truncate(body, 200)),
            retryable,
        )
        .with_http_status(status);

        err = if retryable {
            err.with_guidance(format!("{} reported a server-side problem; wait and retry", service))
                .with_guidance(format!("Check the {} service logs", service))
        } else {
            err.with_guidance("The request was rejected; check the input data and credentials")
                .with_guidance(format!("Verify the {} configuration", service))
        };
        err
    }

    pub fn missing_config(key: &str) -> Self {
        Self::new(
            ErrorCategory::Configuration,
            format!("Missing configuration value: {}", key),
            false,
        )
        .with_guidance(format!("Set '{}' in .fhirpipe/config.yaml", key))
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Configuration, message, false)
            .with_guidance("Fix the configuration file and start a new job")
    }

    pub fn job_not_found(job_id: &str) -> Self {
        Self::new(
            ErrorCategory::State,
            format!("Job not found: {}", job_id),
            false,
        )
        .with_guidance("List known jobs with `fhirpipe job list`")
        .with_guidance("Check that jobs_dir points at the same directory as before")
    }

    pub fn corrupted_state(job_id: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorCategory::State,
            format!("State file of job {} is corrupted: {}", job_id, reason),
            false,
        )
        .with_guidance("Inspect state.json in the job directory and repair it by hand")
        .with_guidance("Or delete the job and start a new one")
    }

    pub fn job_locked(job_id: &str) -> Self {
        Self::new(
            ErrorCategory::State,
            format!("Job {} is locked by another process", job_id),
            true,
        )
        .with_guidance("Wait for the other fhirpipe process to finish")
        .with_guidance("If no other process is running, the lock expires after the stale-lock timeout")
    }

    pub fn invalid_transition(step: &str, from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        Self::new(
            ErrorCategory::State,
            format!("Step '{}' cannot move from {:?} to {:?}", step, from, to),
            false,
        )
        .with_guidance("This is a bug or a hand-edited state file; inspect state.json")
    }

    pub fn prerequisite_not_met(step: &str, prerequisite: &str, status: impl fmt::Debug) -> Self {
        Self::new(
            ErrorCategory::State,
            format!(
                "Step '{}' requires '{}' to be completed (currently {:?})",
                step, prerequisite, status
            ),
            false,
        )
        .with_guidance(format!("Run or resume the job so that '{}' completes first", prerequisite))
    }

    pub fn cancelled(operation: &str) -> Self {
        let mut err = Self::new(
            ErrorCategory::State,
            format!("{} was cancelled", operation),
            true,
        )
        .with_guidance("Resume with `fhirpipe pipeline continue <job-id>`");
        err.cancelled = true;
        err
    }
}

/// Persistable form of a [`PipelineError`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default)]
    pub guidance: Vec<String>,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default)]
    pub retries_exhausted: bool,
}

impl From<&PipelineError> for ErrorDetail {
    fn from(err: &PipelineError) -> Self {
        Self {
            category: err.category,
            message: err.message.clone(),
            guidance: err.guidance.clone(),
            retryable: err.retryable,
            http_status: err.http_status,
            cause: err.source.as_ref().map(|s| s.to_string()),
            retries_exhausted: err.retries_exhausted,
        }
    }
}

/// Rebuild a reportable error from a persisted step failure
impl From<ErrorDetail> for PipelineError {
    fn from(detail: ErrorDetail) -> Self {
        Self {
            category: detail.category,
            message: detail.message,
            guidance: detail.guidance,
            retryable: detail.retryable,
            http_status: detail.http_status,
            retries_exhausted: detail.retries_exhausted,
            cancelled: false,
            source: detail.cause.map(BoxError::from),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// Classify an arbitrary error.
///
/// Already-classified errors pass through unchanged. Otherwise the cause
/// chain is inspected for `reqwest` and I/O errors, then the rendered text
/// is matched against known failure signatures. Anything unrecognized
/// becomes a non-retryable Validation error.
pub fn classify(err: anyhow::Error) -> PipelineError {
    let err = match err.downcast::<PipelineError>() {
        Ok(classified) => return classified,
        Err(err) => err,
    };

    let mut found = None;
    for cause in err.chain() {
        if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
            found = classify_reqwest(http);
        } else if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            found = classify_io(io_err);
        }
        if found.is_some() {
            break;
        }
    }

    let text = format!("{:#}", err);
    let classified = found.unwrap_or_else(|| classify_text(&text));
    classified.with_source(err)
}

fn classify_reqwest(err: &reqwest::Error) -> Option<PipelineError> {
    let url = err
        .url()
        .map(|u| u.to_string())
        .unwrap_or_else(|| "<unknown>".to_string());

    if let Some(status) = err.status() {
        return Some(PipelineError::service_status(&url, status.as_u16(), ""));
    }
    if err.is_timeout() {
        return Some(PipelineError::timeout(&format!("Request to {}", url), Duration::ZERO));
    }
    if err.is_connect() || err.is_request() {
        return Some(PipelineError::service_unreachable("upstream", &url));
    }
    None
}

// ENOSPC on Linux and macOS
const ENOSPC: i32 = 28;

fn classify_io(err: &io::Error) -> Option<PipelineError> {
    let path = Path::new("<unknown>");
    if err.raw_os_error() == Some(ENOSPC) {
        return Some(PipelineError::disk_full(path));
    }
    match err.kind() {
        io::ErrorKind::PermissionDenied => Some(PipelineError::permission_denied(path)),
        io::ErrorKind::NotFound => Some(PipelineError::file_not_found(path)),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => {
            Some(PipelineError::service_unreachable("upstream", "<unknown>"))
        }
        io::ErrorKind::TimedOut => Some(PipelineError::timeout("I/O operation", Duration::ZERO)),
        _ => None,
    }
}

const NETWORK_SIGNATURES: &[&str] = &[
    "connection refused",
    "connection reset",
    "no such host",
    "dns error",
    "network is unreachable",
    "host is unreachable",
    "broken pipe",
    "error trying to connect",
];

fn classify_text(text: &str) -> PipelineError {
    let lower = text.to_lowercase();
    let unknown = Path::new("<unknown>");

    if NETWORK_SIGNATURES.iter().any(|sig| lower.contains(sig)) {
        return PipelineError::service_unreachable("upstream", "<unknown>");
    }
    if lower.contains("timed out") || lower.contains("deadline exceeded") {
        return PipelineError::timeout("Operation", Duration::ZERO);
    }
    if lower.contains("no space left") || lower.contains("disk full") {
        return PipelineError::disk_full(unknown);
    }
    if lower.contains("permission denied") {
        return PipelineError::permission_denied(unknown);
    }
    if let Some(status) = extract_http_status(&lower) {
        return PipelineError::service_status("upstream service", status, "");
    }

    PipelineError::new(ErrorCategory::Validation, first_line(text), false)
        .with_guidance("Check the input data and the job log for details")
}

/// Find an HTTP status code mentioned after "http", "status" or "status code"
fn extract_http_status(lower: &str) -> Option<u16> {
    let tokens: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == ':' || c == '=' || c == '(' || c == ')')
        .filter(|t| !t.is_empty())
        .collect();

    tokens.windows(2).find_map(|pair| {
        let marker = pair[0];
        if marker == "http" || marker == "status" || marker == "code" {
            pair[1]
                .parse::<u16>()
                .ok()
                .filter(|code| (400..=599).contains(code))
        } else {
            None
        }
    })
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or(text).to_string()
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classified_error_passes_through() {
        let original = PipelineError::job_locked("abc");
        let classified = classify(anyhow::Error::new(original));

        assert_eq!(classified.category, ErrorCategory::State);
        assert!(classified.retryable);
        assert_eq!(classified.message, "Job abc is locked by another process");
    }

    #[test]
    fn test_classified_error_passes_through_context() {
        let err = anyhow::Error::new(PipelineError::service_status("DIMP", 503, "busy"))
            .context("while pseudonymizing Patient.ndjson");
        let classified = classify(err);

        assert_eq!(classified.category, ErrorCategory::Service);
        assert_eq!(classified.http_status, Some(503));
    }

    #[test]
    fn test_network_failure_is_retryable() {
        let err = anyhow::anyhow!("error sending request: Connection refused (os error 111)");
        let classified = classify(err);

        assert_eq!(classified.category, ErrorCategory::Network);
        assert!(classified.retryable);
    }

    #[test]
    fn test_io_errors() {
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        let classified = classify(anyhow::Error::new(denied).context("writing output"));
        assert_eq!(classified.category, ErrorCategory::FileSystem);
        assert!(!classified.retryable);

        let full = io::Error::from_raw_os_error(ENOSPC);
        let classified = classify(anyhow::Error::new(full));
        assert_eq!(classified.category, ErrorCategory::FileSystem);
        assert!(classified.message.contains("No space left"));
    }

    #[test]
    fn test_http_status_from_text() {
        let server = classify(anyhow::anyhow!("upstream answered with status 502"));
        assert_eq!(server.category, ErrorCategory::Service);
        assert!(server.retryable);
        assert_eq!(server.http_status, Some(502));

        let client = classify(anyhow::anyhow!("HTTP 404 for /fhir/result/x"));
        assert_eq!(client.category, ErrorCategory::Service);
        assert!(!client.retryable);
    }

    #[test]
    fn test_unknown_error_falls_back_to_validation() {
        let classified = classify(anyhow::anyhow!("something odd happened"));
        assert_eq!(classified.category, ErrorCategory::Validation);
        assert!(!classified.retryable);
        assert!(!classified.guidance.is_empty());
    }

    #[test]
    fn test_service_status_retryability() {
        assert!(PipelineError::service_status("TORCH", 500, "").retryable);
        assert!(PipelineError::service_status("TORCH", 503, "").retryable);
        assert!(!PipelineError::service_status("TORCH", 400, "").retryable);
        assert!(!PipelineError::service_status("TORCH", 499, "").retryable);
    }

    #[test]
    fn test_user_report_contents() {
        let report = PipelineError::service_status("DIMP", 503, "overloaded").user_report();
        assert!(report.contains("[Service]"));
        assert!(report.contains("1. "));
        assert!(report.contains("retry it automatically"));

        let report = PipelineError::missing_config("services.dimp.url").user_report();
        assert!(report.contains("[Configuration]"));
        assert!(!report.contains("retry it automatically"));
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(PipelineError::invalid_config("x").exit_code(), 2);
        assert_eq!(PipelineError::service_status("x", 503, "").exit_code(), 5);
        assert_eq!(PipelineError::cancelled("run").exit_code(), EXIT_CANCELLED);
    }

    #[test]
    fn test_detail_round_trip_keeps_cause() {
        let err = PipelineError::disk_full(Path::new("/jobs/x"))
            .with_source(io::Error::from_raw_os_error(ENOSPC));
        let detail = err.detail();
        assert_eq!(detail.category, ErrorCategory::FileSystem);
        assert!(detail.cause.is_some());
    }
}

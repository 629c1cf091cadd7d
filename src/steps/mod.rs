//! Step implementations.
//!
//! A step is the body the orchestrator runs for one configured pipeline
//! stage. It reads inputs from the job directory, writes its outputs into its
//! own output location and reports metrics. It never touches the job state;
//! the orchestrator applies the returned result.

pub mod convert;
pub mod dimp;
pub mod http_import;
pub mod local_import;
pub mod sink;
pub mod torch;
pub mod validate;

#[cfg(test)]
mod test_server;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::domain::{PipelineJob, StepKind, StepMetrics, StepName, StepStatus};
use crate::error::PipelineError;

pub use convert::{ConvertStep, OutputFormat};
pub use dimp::DimpStep;
pub use http_import::HttpImportStep;
pub use local_import::LocalImportStep;
pub use torch::TorchImportStep;
pub use validate::ValidateStep;

/// Name of the de-identified output directory
pub const PSEUDONYMIZED_DIR: &str = "pseudonymized";

/// Name of the imported output directory
pub const IMPORT_DIR: &str = "import";

/// Everything a step body may look at
pub struct StepContext<'a> {
    /// Cancelled on Ctrl-C
    pub cancel: CancellationToken,

    /// Read-only view of the job
    pub job: &'a PipelineJob,

    /// Configuration snapshot of the job
    pub config: &'a PipelineConfig,

    /// Root directory of the job
    pub job_dir: PathBuf,

    /// Where this step writes (directory, or report file for validation)
    pub output: PathBuf,

    /// Survives retries of the step within a run; removed when the step is reset
    pub checkpoint: PathBuf,
}

impl StepContext<'_> {
    /// Directory holding the most processed NDJSON data so far
    pub fn latest_data_dir(&self) -> PathBuf {
        let pseudonymized = self.config.enables(StepKind::DeIdentify)
            && self
                .job
                .steps
                .iter()
                .any(|s| s.name.kind() == StepKind::DeIdentify && s.status == StepStatus::Completed);

        if pseudonymized {
            self.job_dir.join(PSEUDONYMIZED_DIR)
        } else {
            self.job_dir.join(IMPORT_DIR)
        }
    }

    /// Recreate the output directory empty, discarding a previous attempt's files
    pub async fn prepare_output_dir(&self) -> Result<()> {
        if self.output.exists() {
            tokio::fs::remove_dir_all(&self.output)
                .await
                .with_context(|| format!("Failed to clear {}", self.output.display()))?;
        }
        tokio::fs::create_dir_all(&self.output)
            .await
            .with_context(|| format!("Failed to create {}", self.output.display()))?;
        Ok(())
    }

    /// Fail fast when cancellation was requested
    pub fn check_cancelled(&self, operation: &str) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::cancelled(operation));
        }
        Ok(())
    }
}

/// Trait for step bodies
#[async_trait]
pub trait Step: Send + Sync {
    /// Step this body implements
    fn name(&self) -> StepName;

    /// Run once; the orchestrator wraps this in the retry engine
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepMetrics>;
}

/// Lookup from step name to implementation
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<StepName, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the implementation of a step
    pub fn register(&mut self, step: impl Step + 'static) -> &mut Self {
        self.steps.insert(step.name(), Arc::new(step));
        self
    }

    pub fn get(&self, name: StepName) -> Option<Arc<dyn Step>> {
        self.steps.get(&name).cloned()
    }

    /// Registry with every built-in step
    pub fn standard() -> Result<Self, PipelineError> {
        let client = http_client()?;

        let mut registry = Self::new();
        registry
            .register(LocalImportStep)
            .register(HttpImportStep::new(client.clone()))
            .register(TorchImportStep::new(client.clone()))
            .register(DimpStep::new(client.clone()))
            .register(ValidateStep)
            .register(ConvertStep::new(client.clone(), OutputFormat::Csv))
            .register(ConvertStep::new(client, OutputFormat::Parquet));
        Ok(registry)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.steps.keys().map(StepName::as_str).collect();
        names.sort_unstable();
        f.debug_struct("StepRegistry").field("steps", &names).finish()
    }
}

/// Shared HTTP client for all service calls
pub fn http_client() -> Result<reqwest::Client, PipelineError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .user_agent(concat!("fhirpipe/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| {
            PipelineError::invalid_config(format!("Failed to build HTTP client: {}", e))
        })
}

/// Turn a non-success response into a classified Service error
pub async fn ensure_success(
    service: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, PipelineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PipelineError::service_status(service, status.as_u16(), &body))
}

/// Map a transport failure to a Network error naming the service
pub fn send_error(service: &str, url: &str, err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::timeout(&format!("Request to {}", service), Duration::ZERO).with_source(err)
    } else {
        PipelineError::service_unreachable(service, url).with_source(err)
    }
}

/// Stream a response body to `path`; returns bytes written
pub async fn download_to(
    response: reqwest::Response,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled("download").into());
        }
        let chunk = chunk.context("Failed to read response body")?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written += chunk.len() as u64;
    }
    file.flush().await.context("Failed to flush download")?;
    Ok(written)
}

/// Every `*.ndjson` file directly inside `dir`, sorted
pub fn ndjson_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("*.ndjson");
    let pattern = pattern
        .to_str()
        .with_context(|| format!("Non UTF-8 path: {}", dir.display()))?;

    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .context("Invalid glob pattern")?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();
    files.sort();
    Ok(files)
}

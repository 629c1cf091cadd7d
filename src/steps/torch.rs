//! Import via a TORCH extraction.
//!
//! For a CRTDL input the document is submitted as a FHIR `Parameters`
//! resource to `$extract-data`; TORCH answers `202 Accepted` with a
//! `Content-Location` status URL. The status URL is polled until it returns
//! `200` with a bulk-data style manifest, then every output file is
//! downloaded into `import/`. A result URL input skips the submission.
//!
//! The status URL is kept in the step checkpoint once TORCH accepted the
//! CRTDL. A retry of the step picks it up and resumes polling, so a failed
//! download never submits the same extraction twice.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TorchConfig;
use crate::core::input::is_crtdl;
use crate::core::poll::{poll_until, PollSchedule, PollStatus};
use crate::domain::{InputType, StepMetrics, StepName};
use crate::error::{ErrorCategory, PipelineError};

use super::sink::{ingest_file, ResourceSink};
use super::{download_to, ensure_success, send_error, Step, StepContext};

const SERVICE: &str = "TORCH";

/// Bulk-data style completion manifest
#[derive(Debug, Deserialize)]
pub struct ExtractionManifest {
    #[serde(default)]
    pub output: Vec<ManifestEntry>,

    #[serde(default)]
    pub error: Vec<ManifestEntry>,
}

/// Progress kept across retries of the step
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    status_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
    pub url: String,
}

pub struct TorchImportStep {
    client: reqwest::Client,
}

impl TorchImportStep {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn authed(&self, request: RequestBuilder, torch: &TorchConfig) -> RequestBuilder {
        match &torch.username {
            Some(user) => request.basic_auth(user, torch.password.as_deref()),
            None => request,
        }
    }

    /// Submit the CRTDL; returns the status URL
    async fn submit(&self, ctx: &StepContext<'_>, torch: &TorchConfig) -> Result<String> {
        let base = torch
            .base_url
            .as_deref()
            .ok_or_else(|| PipelineError::missing_config("services.torch.base_url"))?;

        let path = std::path::Path::new(ctx.job.resolved_source());
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::file_not_found(path).with_source(e),
                _ => crate::error::classify(anyhow::Error::new(e)),
            })?;
        let crtdl: Value = serde_json::from_slice(&raw).map_err(|e| {
            PipelineError::invalid_input(format!("CRTDL {} is not valid JSON: {}", path.display(), e))
        })?;
        if !is_crtdl(&crtdl) {
            return Err(PipelineError::missing_field("dataExtraction").into());
        }

        let url = format!("{}/fhir/$extract-data", base.trim_end_matches('/'));
        info!(url = %url, "Submitting CRTDL to TORCH");

        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/fhir+json")
            .json(&parameters_for(&raw));
        let response = self
            .authed(request, torch)
            .send()
            .await
            .map_err(|e| send_error(SERVICE, &url, e))?;
        let response = ensure_success(SERVICE, response).await?;

        let location = response
            .headers()
            .get(reqwest::header::CONTENT_LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                PipelineError::new(
                    ErrorCategory::Service,
                    "TORCH accepted the extraction but returned no Content-Location header",
                    false,
                )
            })?;

        Ok(resolve_url(base, location)?.to_string())
    }

    /// One status poll
    async fn poll(&self, status_url: &str, torch: &TorchConfig) -> Result<PollStatus<Vec<String>>> {
        let request = self.client.get(status_url);
        let response = self
            .authed(request, torch)
            .send()
            .await
            .map_err(|e| send_error(SERVICE, status_url, e))?;

        if response.status() == StatusCode::ACCEPTED {
            return Ok(PollStatus::Pending);
        }

        let response = ensure_success(SERVICE, response).await?;
        let manifest: ExtractionManifest = response
            .json()
            .await
            .context("Failed to parse TORCH extraction manifest")?;
        Ok(manifest_status(status_url, manifest))
    }
}

#[async_trait]
impl Step for TorchImportStep {
    fn name(&self) -> StepName {
        StepName::TorchImport
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepMetrics> {
        let torch = &ctx.config.services.torch;
        ctx.prepare_output_dir().await?;

        let status_url = match ctx.job.input_type {
            InputType::Crtdl => match read_checkpoint(&ctx.checkpoint).await {
                Some(checkpoint) => {
                    info!(status_url = %checkpoint.status_url, "Resuming submitted TORCH extraction");
                    checkpoint.status_url
                }
                None => {
                    let status_url = self.submit(ctx, torch).await?;
                    write_checkpoint(&ctx.checkpoint, &status_url).await?;
                    status_url
                }
            },
            InputType::TorchResultUrl => ctx.job.resolved_source().to_string(),
            other => {
                return Err(PipelineError::invalid_input(format!(
                    "torch_import cannot handle input of type '{}'",
                    other
                ))
                .into())
            }
        };

        let schedule = PollSchedule::from_torch(torch, ctx.config.retry.clone());
        let timeout = Duration::from_secs(torch.extraction_timeout_secs);
        let urls = poll_until(&ctx.cancel, &schedule, timeout, "TORCH extraction", || {
            self.poll(&status_url, torch)
        })
        .await?;
        info!(files = urls.len(), "TORCH extraction finished");

        let mut parts = Vec::with_capacity(urls.len());
        let mut transferred = 0u64;
        for (i, url) in urls.iter().enumerate() {
            ctx.check_cancelled("TORCH download")?;

            let request = self.client.get(url);
            let response = self
                .authed(request, torch)
                .send()
                .await
                .map_err(|e| send_error(SERVICE, url, e))?;
            let response = ensure_success(SERVICE, response).await?;

            let part = ctx.job_dir.join(format!("torch-{}.ndjson.part", i));
            transferred += download_to(response, &part, &ctx.cancel).await?;
            parts.push(part);
        }

        let mut metrics = ingest_parts(parts, ctx.output.clone(), ctx.cancel.clone()).await?;
        metrics.bytes_processed = transferred;

        remove_if_present(&ctx.checkpoint).await?;
        Ok(metrics)
    }
}

/// Split the downloaded files by resource type, then delete them
async fn ingest_parts(
    parts: Vec<PathBuf>,
    output: PathBuf,
    cancel: CancellationToken,
) -> Result<StepMetrics> {
    tokio::task::spawn_blocking(move || -> Result<StepMetrics> {
        let mut sink = ResourceSink::new(output);
        for part in &parts {
            let count = ingest_file(part, &mut sink, &cancel)?;
            debug!(file = %part.display(), records = count, "Imported TORCH output file");
            std::fs::remove_file(part)
                .with_context(|| format!("Failed to remove {}", part.display()))?;
        }
        Ok(sink.finish()?)
    })
    .await
    .context("TORCH import task panicked")?
}

async fn read_checkpoint(path: &Path) -> Option<Checkpoint> {
    let raw = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&raw) {
        Ok(checkpoint) => Some(checkpoint),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable TORCH checkpoint");
            None
        }
    }
}

async fn write_checkpoint(path: &Path, status_url: &str) -> Result<()> {
    let checkpoint = Checkpoint {
        status_url: status_url.to_string(),
    };
    let json = serde_json::to_vec(&checkpoint).context("Failed to serialize TORCH checkpoint")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("Failed to remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

/// FHIR `Parameters` resource carrying the base64 encoded CRTDL
pub fn parameters_for(crtdl: &[u8]) -> Value {
    json!({
        "resourceType": "Parameters",
        "parameter": [{
            "name": "crtdl",
            "valueBase64Binary": STANDARD.encode(crtdl),
        }]
    })
}

/// Map a completion manifest to a poll result, resolving relative URLs
pub fn manifest_status(status_url: &str, manifest: ExtractionManifest) -> PollStatus<Vec<String>> {
    if let Some(first) = manifest.error.first() {
        return PollStatus::Failed(
            PipelineError::new(
                ErrorCategory::Service,
                format!(
                    "TORCH extraction reported {} error file(s), first: {}",
                    manifest.error.len(),
                    first.url
                ),
                false,
            )
            .with_guidance("Inspect the TORCH error output and correct the CRTDL"),
        );
    }

    let mut urls = Vec::with_capacity(manifest.output.len());
    for entry in &manifest.output {
        match resolve_url(status_url, &entry.url) {
            Ok(url) => urls.push(url.to_string()),
            Err(e) => return PollStatus::Failed(e),
        }
    }
    PollStatus::Done(urls)
}

fn resolve_url(base: &str, url: &str) -> Result<Url, PipelineError> {
    Url::parse(base)
        .and_then(|base| base.join(url))
        .or_else(|_| Url::parse(url))
        .map_err(|e| {
            PipelineError::new(
                ErrorCategory::Service,
                format!("TORCH returned an invalid URL '{}': {}", url, e),
                false,
            )
        })
}

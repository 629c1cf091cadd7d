//! Import a single NDJSON document over HTTP(S).

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::domain::{StepMetrics, StepName};
use crate::error::PipelineError;

use super::sink::{ingest_file, ResourceSink};
use super::{download_to, ensure_success, send_error, Step, StepContext};

const SERVICE: &str = "NDJSON source";

/// Streams the input URL to disk, then splits it by resource type into `import/`
pub struct HttpImportStep {
    client: reqwest::Client,
}

impl HttpImportStep {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Step for HttpImportStep {
    fn name(&self) -> StepName {
        StepName::HttpImport
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepMetrics> {
        let url = ctx.job.resolved_source();
        ctx.prepare_output_dir().await?;

        info!(url, "Downloading NDJSON");
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/fhir+ndjson, application/x-ndjson")
            .send()
            .await
            .map_err(|e| send_error(SERVICE, url, e))?;
        let response = ensure_success(SERVICE, response).await?;

        let download = ctx.job_dir.join("download.ndjson.part");
        let bytes = download_to(response, &download, &ctx.cancel).await?;

        let output = ctx.output.clone();
        let cancel = ctx.cancel.clone();
        let source = download.clone();
        let mut metrics = tokio::task::spawn_blocking(move || -> Result<StepMetrics, PipelineError> {
            let mut sink = ResourceSink::new(output);
            ingest_file(&source, &mut sink, &cancel)?;
            sink.finish()
        })
        .await
        .context("Import task panicked")??;

        tokio::fs::remove_file(&download)
            .await
            .with_context(|| format!("Failed to remove {}", download.display()))?;

        // Report transferred bytes rather than re-serialized bytes
        metrics.bytes_processed = bytes;
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::core::retry::{with_retry, RetryPolicy};
    use crate::domain::{InputType, PipelineJob};
    use crate::error::ErrorCategory;
    use crate::steps::test_server::{context, Reply, TestServer};
    use tempfile::TempDir;

    const EXPORT: &str = "GET /export.ndjson";
    const BODY: &str = "{\"resourceType\":\"Patient\",\"id\":\"p1\"}\n{\"resourceType\":\"Observation\",\"id\":\"o1\"}\n";

    fn http_job(server: &TestServer) -> PipelineJob {
        let config = PipelineConfig {
            retry: RetryPolicy::new(3, 10, 20),
            ..Default::default()
        };
        PipelineJob::new(
            server.url("/export.ndjson"),
            InputType::Http,
            &[StepName::HttpImport],
            config,
        )
    }

    #[tokio::test]
    async fn test_download_is_split_by_resource_type() {
        let server = TestServer::start(vec![(EXPORT, vec![Reply::new(200, BODY)])]).await;
        let temp = TempDir::new().unwrap();
        let job = http_job(&server);
        let ctx = context(&job, &job.config, temp.path());

        let metrics = HttpImportStep::new(reqwest::Client::new())
            .execute(&ctx)
            .await
            .unwrap();

        assert_eq!(metrics.entry_count, 2);
        assert_eq!(metrics.bytes_processed, BODY.len() as u64);
        assert!(ctx.output.join("Patient.ndjson").is_file());
        assert!(ctx.output.join("Observation.ndjson").is_file());
        assert!(!temp.path().join("download.ndjson.part").exists());
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = TestServer::start(vec![(
            EXPORT,
            vec![Reply::new(503, "unavailable"), Reply::new(200, BODY)],
        )])
        .await;
        let temp = TempDir::new().unwrap();
        let job = http_job(&server);
        let ctx = context(&job, &job.config, temp.path());
        let step = HttpImportStep::new(reqwest::Client::new());

        let retried = with_retry(&job.config.retry, &ctx.cancel, |_| step.execute(&ctx))
            .await
            .unwrap();

        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.value.entry_count, 2);
        assert_eq!(server.hits(EXPORT), 2);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = TestServer::start(vec![(EXPORT, vec![Reply::new(404, "gone")])]).await;
        let temp = TempDir::new().unwrap();
        let job = http_job(&server);
        let ctx = context(&job, &job.config, temp.path());
        let step = HttpImportStep::new(reqwest::Client::new());

        let err = with_retry(&job.config.retry, &ctx.cancel, |_| step.execute(&ctx))
            .await
            .unwrap_err();

        assert_eq!(server.hits(EXPORT), 1);
        assert_eq!(err.attempts(), 1);
        let err = err.into_pipeline_error("http_import");
        assert_eq!(err.category, ErrorCategory::Service);
        assert_eq!(err.http_status, Some(404));
        assert!(!err.retryable);
    }
}

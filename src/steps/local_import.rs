//! Import NDJSON from the local filesystem.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::{StepMetrics, StepName};
use crate::error::PipelineError;

use super::sink::{ingest_file, ResourceSink};
use super::{ndjson_files, Step, StepContext};

/// Copies `*.ndjson` from a directory (or a single `.ndjson` file) into `import/`
pub struct LocalImportStep;

#[async_trait]
impl Step for LocalImportStep {
    fn name(&self) -> StepName {
        StepName::LocalImport
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepMetrics> {
        let source = PathBuf::from(ctx.job.resolved_source());
        let files = source_files(&source)?;
        info!(source = %source.display(), files = files.len(), "Importing local NDJSON");

        ctx.prepare_output_dir().await?;

        let output = ctx.output.clone();
        let cancel = ctx.cancel.clone();
        let metrics = tokio::task::spawn_blocking(move || -> Result<StepMetrics, PipelineError> {
            let mut sink = ResourceSink::new(output);
            for file in &files {
                let count = ingest_file(file, &mut sink, &cancel)?;
                debug!(file = %file.display(), records = count, "Imported file");
            }
            sink.finish()
        })
        .await
        .context("Import task panicked")??;

        Ok(metrics)
    }
}

fn source_files(source: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if source.is_dir() {
        let files = ndjson_files(source).map_err(|e| {
            PipelineError::invalid_input(format!("Cannot list {}: {:#}", source.display(), e))
        })?;
        if files.is_empty() {
            return Err(PipelineError::invalid_input(format!(
                "No .ndjson files found in {}",
                source.display()
            ))
            .with_guidance("Point the pipeline at a directory containing FHIR NDJSON exports"));
        }
        return Ok(files);
    }

    if source.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }

    Err(PipelineError::file_not_found(source))
}

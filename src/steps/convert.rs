//! CSV and Parquet conversion through the conversion service.
//!
//! Each `<ResourceType>.ndjson` file of the latest data directory is one
//! group. Groups are uploaded to `<conversion>/convert/{csv|parquet}` by a
//! bounded pool of workers; every worker writes its own
//! `<ResourceType>.{csv|parquet}`, so no two workers share an output file.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::core::ndjson::read_file;
use crate::domain::{StepMetrics, StepName};
use crate::error::PipelineError;

use super::{download_to, ensure_success, ndjson_files, send_error, Step, StepContext};

const SERVICE: &str = "conversion service";

/// Target format of a conversion step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
        }
    }

    pub fn step(&self) -> StepName {
        match self {
            Self::Csv => StepName::CsvConversion,
            Self::Parquet => StepName::ParquetConversion,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource type's NDJSON file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionGroup {
    pub resource_type: String,
    pub source: PathBuf,
}

pub struct ConvertStep {
    client: reqwest::Client,
    format: OutputFormat,
}

impl ConvertStep {
    pub fn new(client: reqwest::Client, format: OutputFormat) -> Self {
        Self { client, format }
    }

    async fn convert_group(
        &self,
        ctx: &StepContext<'_>,
        base: &str,
        group: ConversionGroup,
    ) -> Result<StepMetrics> {
        ctx.check_cancelled("conversion")?;

        let source = group.source.clone();
        let entries = tokio::task::spawn_blocking(move || read_file(&source, |_| Ok(())))
            .await
            .context("Conversion task panicked")??;

        let url = conversion_url(base, self.format, &group.resource_type);
        let file = tokio::fs::File::open(&group.source)
            .await
            .with_context(|| format!("Failed to open {}", group.source.display()))?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| send_error(SERVICE, &url, e))?;
        let response = ensure_success(SERVICE, response).await?;

        let target = ctx
            .output
            .join(format!("{}.{}", group.resource_type, self.format.as_str()));
        let bytes = download_to(response, &target, &ctx.cancel).await?;

        debug!(
            resource_type = %group.resource_type,
            entries,
            bytes,
            "Converted resource group"
        );
        Ok(StepMetrics::new(entries, bytes))
    }
}

#[async_trait]
impl Step for ConvertStep {
    fn name(&self) -> StepName {
        self.format.step()
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepMetrics> {
        let conversion = &ctx.config.services.conversion;
        let base = conversion
            .url
            .as_deref()
            .ok_or_else(|| PipelineError::missing_config("services.conversion.url"))?;

        let data_dir = ctx.latest_data_dir();
        let groups = conversion_groups(&data_dir)?;
        let workers = conversion.workers.max(1);
        info!(
            format = %self.format,
            groups = groups.len(),
            workers,
            "Converting resource groups"
        );

        ctx.prepare_output_dir().await?;

        stream::iter(groups)
            .map(|group| self.convert_group(ctx, base, group))
            .buffer_unordered(workers)
            .try_fold(StepMetrics::default(), |mut total, metrics| async move {
                total.add(metrics);
                Ok::<_, anyhow::Error>(total)
            })
            .await
    }
}

/// Endpoint for converting one resource type
pub fn conversion_url(base: &str, format: OutputFormat, resource_type: &str) -> String {
    format!(
        "{}/convert/{}?resourceType={}",
        base.trim_end_matches('/'),
        format.as_str(),
        resource_type
    )
}

/// One group per NDJSON file, named after the file stem
pub fn conversion_groups(data_dir: &Path) -> Result<Vec<ConversionGroup>> {
    let groups = ndjson_files(data_dir)?
        .into_iter()
        .filter_map(|source| {
            let resource_type = source.file_stem()?.to_str()?.to_string();
            Some(ConversionGroup {
                resource_type,
                source,
            })
        })
        .collect();
    Ok(groups)
}

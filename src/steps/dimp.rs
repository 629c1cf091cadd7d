//! De-identification through DIMP.
//!
//! Every imported resource is posted to `<dimp>/$de-identify`; the returned
//! pseudonymized resource is written to `pseudonymized/`. Each call runs
//! through the retry engine, so a transient DIMP hiccup costs one resource's
//! retry rather than a rerun of the whole step.
//!
//! File I/O runs on blocking threads: a reader feeds records into a bounded
//! channel, the async loop calls DIMP, and a writer drains the results into
//! the output sink.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::ndjson::{NdjsonReader, Record};
use crate::core::retry::with_retry;
use crate::domain::{StepMetrics, StepName};
use crate::error::PipelineError;

use super::sink::ResourceSink;
use super::{ensure_success, ndjson_files, send_error, Step, StepContext, IMPORT_DIR};

const SERVICE: &str = "DIMP";

/// Records buffered between the blocking threads and the DIMP calls
const CHANNEL_CAPACITY: usize = 64;

pub struct DimpStep {
    client: reqwest::Client,
}

impl DimpStep {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn deidentify(&self, url: &str, record: &Record) -> Result<Record> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/fhir+json")
            .json(record)
            .send()
            .await
            .map_err(|e| send_error(SERVICE, url, e))?;
        let response = ensure_success(SERVICE, response).await?;

        let body: Value = response
            .json()
            .await
            .context("Failed to parse DIMP response")?;
        Ok(Record::from_value(body)?)
    }
}

/// `$de-identify` endpoint under the configured base URL
pub fn deidentify_url(base: &str) -> String {
    format!("{}/$de-identify", base.trim_end_matches('/'))
}

#[async_trait]
impl Step for DimpStep {
    fn name(&self) -> StepName {
        StepName::DeIdentify
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepMetrics> {
        let base = ctx
            .config
            .services
            .dimp
            .url
            .as_deref()
            .ok_or_else(|| PipelineError::missing_config("services.dimp.url"))?;
        let url = deidentify_url(base);

        let input_dir = ctx.job_dir.join(IMPORT_DIR);
        let files = ndjson_files(&input_dir)?;
        info!(url = %url, files = files.len(), "De-identifying imported resources");

        ctx.prepare_output_dir().await?;

        let (records_tx, mut records_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let reader = spawn_reader(files, records_tx, ctx.cancel.clone());
        let writer = spawn_writer(ctx.output.clone(), out_rx);

        let mut failure = None;
        while let Some(record) = records_rx.recv().await {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            let pseudonymized = with_retry(&ctx.config.retry, &ctx.cancel, |_| {
                self.deidentify(&url, &record)
            })
            .await
            .map_err(|e| e.into_pipeline_error("de-identification"));

            match pseudonymized {
                Ok(retried) => {
                    if out_tx.send(retried.value).await.is_err() {
                        // Writer stopped; its error is reported below
                        break;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Unblock both threads before waiting for them
        drop(records_rx);
        drop(out_tx);
        let read = reader.await.context("DIMP reader task panicked")?;
        let written = writer.await.context("DIMP writer task panicked")?;

        if let Some(e) = failure {
            return Err(e.into());
        }
        read?;
        Ok(written?)
    }
}

/// Stream every record of `files` into `tx`; stops early when the receiver is gone
fn spawn_reader(
    files: Vec<PathBuf>,
    tx: mpsc::Sender<Result<Record, PipelineError>>,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), PipelineError>> {
    tokio::task::spawn_blocking(move || {
        for file in &files {
            let reader = NdjsonReader::open(file)?;
            for record in reader {
                if cancel.is_cancelled() {
                    return Err(PipelineError::cancelled("de-identification"));
                }
                let failed = record.is_err();
                if tx.blocking_send(record).is_err() || failed {
                    return Ok(());
                }
            }
            debug!(file = %file.display(), "Read imported file");
        }
        Ok(())
    })
}

/// Write received records into the output sink until the sender is dropped
fn spawn_writer(
    output: PathBuf,
    mut rx: mpsc::Receiver<Record>,
) -> JoinHandle<Result<StepMetrics, PipelineError>> {
    tokio::task::spawn_blocking(move || {
        let mut sink = ResourceSink::new(output);
        while let Some(record) = rx.blocking_recv() {
            sink.write(&record)?;
        }
        sink.finish()
    })
}

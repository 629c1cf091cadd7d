//! Per-resource-type NDJSON output.
//!
//! Data-producing steps write one `<ResourceType>.ndjson` file per FHIR
//! resource type into their output directory. Records without a
//! `resourceType` land in `Unknown.ndjson` so the validation step can report
//! them instead of the import dropping them silently.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::core::ndjson::{NdjsonReader, NdjsonWriter, Record};
use crate::domain::StepMetrics;
use crate::error::PipelineError;

const UNKNOWN_TYPE: &str = "Unknown";

/// Fan-out writer keyed by resource type
pub struct ResourceSink {
    dir: PathBuf,
    writers: BTreeMap<String, NdjsonWriter<BufWriter<File>>>,
}

impl ResourceSink {
    /// `dir` must exist
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writers: BTreeMap::new(),
        }
    }

    /// Append a record to its resource type's file; returns bytes written
    pub fn write(&mut self, record: &Record) -> Result<u64, PipelineError> {
        let resource_type = record
            .resource_type()
            .ok()
            .filter(|t| is_safe_file_stem(t))
            .unwrap_or(UNKNOWN_TYPE);

        if !self.writers.contains_key(resource_type) {
            let path = self.dir.join(format!("{}.ndjson", resource_type));
            let writer = NdjsonWriter::create(&path)?;
            self.writers.insert(resource_type.to_string(), writer);
        }

        match self.writers.get_mut(resource_type) {
            Some(writer) => writer.write(record),
            None => Ok(0),
        }
    }

    /// Flush every file and total the written records and bytes
    pub fn finish(self) -> Result<StepMetrics, PipelineError> {
        let mut metrics = StepMetrics::default();
        for (_, writer) in self.writers {
            metrics.add(StepMetrics::new(writer.records_written(), writer.bytes_written()));
            writer.into_inner()?;
        }
        Ok(metrics)
    }

    /// Resource types seen so far
    pub fn resource_types(&self) -> impl Iterator<Item = &str> {
        self.writers.keys().map(String::as_str)
    }
}

/// Stream every record of an NDJSON file into `sink`
pub fn ingest_file(
    path: &Path,
    sink: &mut ResourceSink,
    cancel: &CancellationToken,
) -> Result<u64, PipelineError> {
    let mut reader = NdjsonReader::open(path)?;
    for record in &mut reader {
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled("import"));
        }
        sink.write(&record?)?;
    }
    Ok(reader.records_read())
}

/// Resource types are used as file names
fn is_safe_file_stem(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric())
}

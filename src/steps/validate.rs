//! Structural validation of the latest NDJSON data.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::ndjson::NdjsonReader;
use crate::domain::{StepMetrics, StepName};
use crate::error::PipelineError;

use super::{ndjson_files, Step, StepContext};

/// Contents of `validation-report.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub files: Vec<FileReport>,
    pub total_records: u64,
    pub invalid_records: u64,
    pub first_invalid: Option<InvalidRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub file: String,
    pub records: u64,
    pub invalid: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidRecord {
    pub file: String,
    pub line: usize,
    pub reason: String,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.invalid_records == 0
    }
}

/// Checks every record carries string `resourceType` and `id` fields
pub struct ValidateStep;

#[async_trait]
impl Step for ValidateStep {
    fn name(&self) -> StepName {
        StepName::Validate
    }

    async fn execute(&self, ctx: &StepContext<'_>) -> Result<StepMetrics> {
        let data_dir = ctx.latest_data_dir();
        let files = ndjson_files(&data_dir)?;
        info!(dir = %data_dir.display(), files = files.len(), "Validating resources");

        let cancel = ctx.cancel.clone();
        let report = tokio::task::spawn_blocking(move || validate_files(&files, &cancel))
            .await
            .context("Validation task panicked")??;

        let json = serde_json::to_vec_pretty(&report).context("Failed to serialize validation report")?;
        tokio::fs::write(&ctx.output, &json)
            .await
            .with_context(|| format!("Failed to write {}", ctx.output.display()))?;

        if let Some(first) = &report.first_invalid {
            warn!(invalid = report.invalid_records, "Validation found invalid resources");
            return Err(PipelineError::invalid_input(format!(
                "{} of {} resources are invalid; first at line {} of {}: {}",
                report.invalid_records, report.total_records, first.line, first.file, first.reason
            ))
            .with_guidance(format!("See {} for the full report", ctx.output.display()))
            .into());
        }

        Ok(StepMetrics::new(report.total_records, json.len() as u64))
    }
}

/// Validate each file in turn, collecting a report
pub fn validate_files(files: &[PathBuf], cancel: &CancellationToken) -> Result<ValidationReport, PipelineError> {
    let mut report = ValidationReport::default();

    for file in files {
        let mut reader = NdjsonReader::open(file)?;
        let mut summary = FileReport {
            file: display_name(file),
            records: 0,
            invalid: 0,
        };

        while let Some(record) = reader.next() {
            if cancel.is_cancelled() {
                return Err(PipelineError::cancelled("validation"));
            }
            let record = record?;
            summary.records += 1;

            let problem = record.resource_type().and_then(|_| record.id()).err();
            if let Some(problem) = problem {
                summary.invalid += 1;
                if report.first_invalid.is_none() {
                    report.first_invalid = Some(InvalidRecord {
                        file: summary.file.clone(),
                        line: reader.line_number(),
                        reason: problem.message,
                    });
                }
            }
        }

        report.total_records += summary.records;
        report.invalid_records += summary.invalid;
        report.files.push(summary);
    }

    Ok(report)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reports_first_invalid_line() {
        let temp = TempDir::new().unwrap();
        let good = temp.path().join("Patient.ndjson");
        std::fs::write(&good, "{\"resourceType\":\"Patient\",\"id\":\"1\"}\n").unwrap();
        let bad = temp.path().join("Unknown.ndjson");
        std::fs::write(
            &bad,
            "{\"resourceType\":\"Observation\",\"id\":\"o\"}\n\n{\"resourceType\":\"Observation\"}\n{\"id\":7}\n",
        )
        .unwrap();

        let report = validate_files(&[good, bad], &CancellationToken::new()).unwrap();
        assert_eq!(report.total_records, 4);
        assert_eq!(report.invalid_records, 2);
        assert!(!report.is_valid());

        let first = report.first_invalid.unwrap();
        assert_eq!(first.file, "Unknown.ndjson");
        assert_eq!(first.line, 3);
        assert!(first.reason.contains("id"));
    }

    #[test]
    fn test_clean_data_is_valid() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("Patient.ndjson");
        std::fs::write(&file, "{\"resourceType\":\"Patient\",\"id\":\"1\"}\n").unwrap();

        let report = validate_files(&[file], &CancellationToken::new()).unwrap();
        assert!(report.is_valid());
        assert_eq!(report.files[0].records, 1);
    }
}

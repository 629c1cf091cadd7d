//! Input source classification.
//!
//! Decides which import strategy applies to the token a user passed to
//! `pipeline start`. Classification is deliberately permissive: anything
//! that is not recognisably a URL or a CRTDL document is treated as a local
//! path, and its existence is checked later by the import step.

use std::path::Path;

use serde_json::Value;

use crate::domain::InputType;
use crate::error::PipelineError;

/// Path segments identifying a TORCH extraction result URL
const TORCH_RESULT_SEGMENTS: &[&str] = &["/fhir/result/", "/fhir/extraction/", "/fhir/__status/"];

/// Top-level keys every CRTDL document carries
const CRTDL_COHORT_KEY: &str = "cohortDefinition";
const CRTDL_EXTRACTION_KEY: &str = "dataExtraction";

/// Upper bound for reading a candidate CRTDL file
const MAX_CRTDL_BYTES: u64 = 16 * 1024 * 1024;

/// Classify an input token (first match wins)
pub fn classify_input(token: &str) -> Result<InputType, PipelineError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(PipelineError::invalid_input("Input source must not be empty"));
    }

    if Path::new(token).is_dir() {
        return Ok(InputType::Local);
    }

    let lower = token.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        if TORCH_RESULT_SEGMENTS.iter().any(|seg| token.contains(seg)) {
            return Ok(InputType::TorchResultUrl);
        }
        return Ok(InputType::Http);
    }

    if (lower.ends_with(".crtdl") || lower.ends_with(".json")) && is_crtdl_file(Path::new(token)) {
        return Ok(InputType::Crtdl);
    }

    Ok(InputType::Local)
}

/// Whether the file parses as a CRTDL document
pub fn is_crtdl_file(path: &Path) -> bool {
    let within_limit = std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() <= MAX_CRTDL_BYTES)
        .unwrap_or(false);
    if !within_limit {
        return false;
    }

    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .map(|doc| is_crtdl(&doc))
        .unwrap_or(false)
}

/// A CRTDL is an object with cohort and extraction definitions that is not
/// a FHIR `Parameters` bundle wrapping one
pub fn is_crtdl(doc: &Value) -> bool {
    let Some(obj) = doc.as_object() else {
        return false;
    };
    if obj.get("resourceType").and_then(Value::as_str) == Some("Parameters") {
        return false;
    }
    obj.contains_key(CRTDL_COHORT_KEY) && obj.contains_key(CRTDL_EXTRACTION_KEY)
}

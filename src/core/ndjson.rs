//! Streaming NDJSON (newline-delimited JSON) reading and writing.
//!
//! [`NdjsonReader`] is a lazy, non-restartable sequence of records over any
//! `BufRead`. Lines are read into a bounded buffer: a line longer than the
//! cap is a Validation error, never an unbounded allocation. Blank lines are
//! skipped. The first failure ends the sequence and carries the 1-based line
//! number. To read again, reopen the source.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::iter::FusedIterator;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{classify, ErrorCategory, PipelineError};

/// Maximum accepted line length in bytes (excluding the newline)
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A single NDJSON record: one JSON object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Wrap a JSON value, which must be an object
    pub fn from_value(value: Value) -> Result<Self, PipelineError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(PipelineError::new(
                ErrorCategory::Validation,
                format!("Expected a JSON object, found {}", json_type(&other)),
                false,
            )),
        }
    }

    /// String field, failing if absent or not a string
    pub fn str_field(&self, name: &str) -> Result<&str, PipelineError> {
        self.0
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::missing_field(name))
    }

    pub fn object_field(&self, name: &str) -> Result<&Map<String, Value>, PipelineError> {
        self.0
            .get(name)
            .and_then(Value::as_object)
            .ok_or_else(|| PipelineError::missing_field(name))
    }

    pub fn array_field(&self, name: &str) -> Result<&Vec<Value>, PipelineError> {
        self.0
            .get(name)
            .and_then(Value::as_array)
            .ok_or_else(|| PipelineError::missing_field(name))
    }

    /// FHIR `resourceType`
    pub fn resource_type(&self) -> Result<&str, PipelineError> {
        self.str_field("resourceType")
    }

    /// FHIR logical `id`
    pub fn id(&self) -> Result<&str, PipelineError> {
        self.str_field("id")
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Lazy record sequence over a buffered reader
pub struct NdjsonReader<R> {
    reader: R,
    source: String,
    max_line_bytes: usize,
    buf: Vec<u8>,
    line: usize,
    records: u64,
    done: bool,
}

impl NdjsonReader<BufReader<File>> {
    /// Open an NDJSON file
    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelineError::file_not_found(path).with_source(e),
            std::io::ErrorKind::PermissionDenied => {
                PipelineError::permission_denied(path).with_source(e)
            }
            _ => classify(anyhow::Error::new(e)),
        })?;
        Ok(Self::new(BufReader::new(file), path.display().to_string()))
    }
}

impl<R: BufRead> NdjsonReader<R> {
    /// `source` names the input in error messages
    pub fn new(reader: R, source: impl Into<String>) -> Self {
        Self {
            reader,
            source: source.into(),
            max_line_bytes: MAX_LINE_BYTES,
            buf: Vec::new(),
            line: 0,
            records: 0,
            done: false,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Records yielded so far (blank lines excluded)
    pub fn records_read(&self) -> u64 {
        self.records
    }

    /// 1-based number of the line most recently read
    pub fn line_number(&self) -> usize {
        self.line
    }

    fn fail(&mut self, err: PipelineError) -> Option<Result<Record, PipelineError>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<R: BufRead> Iterator for NdjsonReader<R> {
    type Item = Result<Record, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            self.buf.clear();
            let limit = self.max_line_bytes as u64 + 1;
            let read = match (&mut self.reader).take(limit).read_until(b'\n', &mut self.buf) {
                Ok(n) => n,
                Err(e) => {
                    let line = self.line + 1;
                    let err = classify(
                        anyhow::Error::new(e)
                            .context(format!("reading line {} of {}", line, self.source)),
                    );
                    return self.fail(err);
                }
            };

            if read == 0 {
                self.done = true;
                return None;
            }
            self.line += 1;

            if self.buf.last() == Some(&b'\n') {
                self.buf.pop();
                if self.buf.last() == Some(&b'\r') {
                    self.buf.pop();
                }
            } else if self.buf.len() > self.max_line_bytes {
                let err = PipelineError::line_too_long(&self.source, self.line, self.max_line_bytes);
                return self.fail(err);
            }

            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return match serde_json::from_slice::<Record>(&self.buf) {
                Ok(record) => {
                    self.records += 1;
                    Some(Ok(record))
                }
                Err(e) => {
                    let err = PipelineError::malformed_line(&self.source, self.line, &e).with_source(e);
                    self.fail(err)
                }
            };
        }
    }
}

impl<R: BufRead> FusedIterator for NdjsonReader<R> {}

/// Feed every record of `reader` to `on_record`; returns the record count.
///
/// A parse failure or a callback failure aborts the scan; the error names the
/// 1-based line number.
pub fn read_ndjson<R, F>(reader: R, source: &str, mut on_record: F) -> Result<u64, PipelineError>
where
    R: BufRead,
    F: FnMut(Record) -> anyhow::Result<()>,
{
    let mut records = NdjsonReader::new(reader, source);
    while let Some(record) = records.next() {
        let record = record?;
        if let Err(e) = on_record(record) {
            let mut err = classify(e);
            err.message = format!(
                "{} (line {} of {})",
                err.message,
                records.line_number(),
                source
            );
            return Err(err);
        }
    }
    Ok(records.records_read())
}

/// [`read_ndjson`] over a file
pub fn read_file<F>(path: &Path, on_record: F) -> Result<u64, PipelineError>
where
    F: FnMut(Record) -> anyhow::Result<()>,
{
    let reader = NdjsonReader::open(path)?;
    let source = path.display().to_string();
    read_ndjson(reader.reader, &source, on_record)
}

/// Append-only NDJSON writer
pub struct NdjsonWriter<W: Write> {
    writer: W,
    records: u64,
    bytes: u64,
}

impl NdjsonWriter<BufWriter<File>> {
    /// Create (truncating) an NDJSON file
    pub fn create(path: &Path) -> Result<Self, PipelineError> {
        let file = File::create(path).map_err(|e| {
            classify(anyhow::Error::new(e).context(format!("creating {}", path.display())))
        })?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            records: 0,
            bytes: 0,
        }
    }

    /// Serialize one record followed by a newline; returns bytes written
    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<u64, PipelineError> {
        let mut line = serde_json::to_vec(record).map_err(|e| {
            PipelineError::new(
                ErrorCategory::Validation,
                format!("Record cannot be serialized: {}", e),
                false,
            )
        })?;
        line.push(b'\n');

        self.writer
            .write_all(&line)
            .map_err(|e| classify(anyhow::Error::new(e).context("writing NDJSON record")))?;

        self.records += 1;
        self.bytes += line.len() as u64;
        Ok(line.len() as u64)
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn flush(&mut self) -> Result<(), PipelineError> {
        self.writer
            .flush()
            .map_err(|e| classify(anyhow::Error::new(e).context("flushing NDJSON output")))
    }

    /// Flush and return the underlying writer
    pub fn into_inner(mut self) -> Result<W, PipelineError> {
        self.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_blank_lines_are_skipped() {
        let input = "{\"resourceType\":\"Patient\",\"id\":\"1\"}\n\n{\"resourceType\":\"Patient\",\"id\":\"2\"}\n   \n{\"resourceType\":\"Observation\",\"id\":\"3\"}\n";
        let mut calls = 0;
        let count = read_ndjson(Cursor::new(input), "test", |_| {
            calls += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(count, 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_last_line_without_newline() {
        let input = "{\"a\":1}\r\n{\"a\":2}";
        let records: Vec<_> = NdjsonReader::new(Cursor::new(input), "test")
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("a"), Some(&json!(2)));
    }

    #[test]
    fn test_parse_error_reports_line_and_stops() {
        let input = "{\"a\":1}\n\nnot json\n{\"a\":2}\n";
        let mut reader = NdjsonReader::new(Cursor::new(input), "Patient.ndjson");

        assert!(reader.next().unwrap().is_ok());
        let err = reader.next().unwrap().unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(err.message.contains("line 3"));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_non_object_line_is_rejected() {
        let err = read_ndjson(Cursor::new("[1,2,3]\n"), "test", |_| Ok(())).unwrap_err();
        assert!(err.message.contains("line 1"));
    }

    #[test]
    fn test_oversized_line_is_rejected() {
        let long = format!("{{\"data\":\"{}\"}}\n", "x".repeat(100));
        let err = NdjsonReader::new(Cursor::new(long), "big.ndjson")
            .with_max_line_bytes(64)
            .next()
            .unwrap()
            .unwrap_err();

        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(!err.retryable);
        assert!(err.message.contains("exceeds"));
    }

    #[test]
    fn test_line_at_limit_is_accepted() {
        let line = format!("{{\"d\":\"{}\"}}", "x".repeat(10));
        let limit = line.len();
        let input = format!("{}\n", line);
        let records: Vec<_> = NdjsonReader::new(Cursor::new(input), "t")
            .with_max_line_bytes(limit)
            .collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_ok());
    }

    #[test]
    fn test_callback_error_reports_line() {
        let input = "{\"id\":\"a\"}\n{\"id\":\"b\"}\n";
        let err = read_ndjson(Cursor::new(input), "ids.ndjson", |record| {
            if record.id()? == "b" {
                anyhow::bail!("rejected record b");
            }
            Ok(())
        })
        .unwrap_err();

        assert!(err.message.contains("line 2 of ids.ndjson"));
    }

    #[test]
    fn test_accessors_fail_with_validation_error() {
        let record =
            Record::from_value(json!({"resourceType": "Patient", "id": 7, "name": []})).unwrap();

        assert_eq!(record.resource_type().unwrap(), "Patient");
        assert_eq!(record.id().unwrap_err().category, ErrorCategory::Validation);
        assert!(record.array_field("name").unwrap().is_empty());
        assert!(record.object_field("name").is_err());
        assert!(Record::from_value(json!("text")).is_err());
    }

    #[test]
    fn test_writer_appends_lines() {
        let mut writer = NdjsonWriter::new(Vec::new());
        writer.write(&json!({"id": "1"})).unwrap();
        writer.write(&json!({"id": "2"})).unwrap();
        assert_eq!(writer.records_written(), 2);

        let bytes = writer.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "{\"id\":\"1\"}\n{\"id\":\"2\"}\n");
    }
}

//! Configuration for fhirpipe.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (FHIRPIPE_JOBS_DIR, FHIRPIPE_TORCH_URL, ...)
//! 2. Config file (explicit `--config` path, else `.fhirpipe/config.yaml`)
//! 3. Defaults (~/.fhirpipe/jobs, local import only)
//!
//! Config file discovery:
//! - Searches current directory and parents for .fhirpipe/config.yaml
//! - A relative `jobs_dir` is resolved against the directory containing `.fhirpipe/`
//!
//! The configuration is loaded once per invocation. A job keeps the snapshot
//! it was created with, so `continue` always runs with the original settings.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::domain::{InputType, StepKind, StepName};
use crate::error::PipelineError;

/// Full pipeline configuration (matches the YAML structure)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Ordered list of steps; the first must be an import step
    #[serde(default = "default_enabled_steps")]
    pub enabled_steps: Vec<StepSelector>,

    /// Upstream services
    #[serde(default)]
    pub services: ServicesConfig,

    /// Retry policy applied to every step
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Directory holding one sub-directory per job
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,

    /// Job lock settings
    #[serde(default)]
    pub lock: LockConfig,
}

fn default_enabled_steps() -> Vec<StepSelector> {
    vec![StepSelector::Import(ImportMarker::Import)]
}

fn default_jobs_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fhirpipe")
        .join("jobs")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled_steps: default_enabled_steps(),
            services: ServicesConfig::default(),
            retry: RetryPolicy::default(),
            jobs_dir: default_jobs_dir(),
            lock: LockConfig::default(),
        }
    }
}

/// Entry of `enabled_steps`
///
/// Supports two YAML forms:
/// - Generic: `import` (the variant is chosen from the input type)
/// - Concrete: `local_import`, `torch_import`, `dimp`, `csv_conversion`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepSelector {
    /// Import variant picked from the input classification
    Import(ImportMarker),

    /// A concrete step
    Step(StepName),
}

/// Marker for the generic `import` entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMarker {
    Import,
}

impl StepSelector {
    pub fn is_import(&self) -> bool {
        match self {
            Self::Import(_) => true,
            Self::Step(name) => name.is_import(),
        }
    }

    /// Resolve to a concrete step for a classified input
    pub fn resolve(&self, input_type: InputType) -> Result<StepName, PipelineError> {
        match self {
            Self::Import(_) => Ok(StepName::import_for(input_type)),
            Self::Step(name) if name.is_import() => {
                let expected = StepName::import_for(input_type);
                if *name != expected {
                    return Err(PipelineError::invalid_input(format!(
                        "Input of type '{}' cannot be imported by step '{}' (expected '{}')",
                        input_type, name, expected
                    )));
                }
                Ok(*name)
            }
            Self::Step(name) => Ok(*name),
        }
    }
}

/// Upstream service settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub torch: TorchConfig,

    #[serde(default)]
    pub dimp: DimpConfig,

    #[serde(default)]
    pub conversion: ConversionConfig,
}

/// TORCH extraction service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorchConfig {
    /// Base URL, e.g. `https://torch.example.org`
    pub base_url: Option<String>,

    pub username: Option<String>,

    /// Never written to the job snapshot; see [`PipelineConfig::restore_secrets`]
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// First poll interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Poll interval ceiling in milliseconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,

    /// Overall extraction timeout in seconds
    #[serde(default = "default_extraction_timeout")]
    pub extraction_timeout_secs: u64,
}

fn default_poll_interval() -> u64 {
    5_000
}
fn default_max_poll_interval() -> u64 {
    30_000
}
fn default_extraction_timeout() -> u64 {
    30 * 60
}

impl Default for TorchConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            username: None,
            password: None,
            poll_interval_ms: default_poll_interval(),
            max_poll_interval_ms: default_max_poll_interval(),
            extraction_timeout_secs: default_extraction_timeout(),
        }
    }
}

/// DIMP de-identification service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DimpConfig {
    /// Base URL; `$de-identify` is appended
    pub url: Option<String>,
}

/// CSV/Parquet conversion service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionConfig {
    pub url: Option<String>,

    /// Resource-type groups converted concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_workers() -> usize {
    4
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            url: None,
            workers: default_workers(),
        }
    }
}

/// Job lock settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// A lock file older than this is considered abandoned by a crashed process
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_stale_after() -> u64 {
    3600
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
        }
    }
}

impl PipelineConfig {
    /// Parse configuration from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse configuration YAML")
    }

    /// Check the configuration before any job is created
    pub fn validate(&self) -> Result<(), PipelineError> {
        let first = self
            .enabled_steps
            .first()
            .ok_or_else(|| PipelineError::missing_config("enabled_steps"))?;

        if !first.is_import() {
            return Err(PipelineError::invalid_config(
                "The first entry of enabled_steps must be an import step",
            ));
        }

        let imports = self.enabled_steps.iter().filter(|s| s.is_import()).count();
        if imports > 1 {
            return Err(PipelineError::invalid_config(
                "enabled_steps may contain only one import step",
            ));
        }

        let mut seen = HashSet::new();
        for selector in &self.enabled_steps {
            if let StepSelector::Step(name) = selector {
                if !seen.insert(name.kind()) {
                    return Err(PipelineError::invalid_config(format!(
                        "Step '{}' is listed more than once in enabled_steps",
                        name
                    )));
                }
            }
        }

        self.retry.validate()?;

        if self.enables(StepKind::DeIdentify) && self.services.dimp.url.is_none() {
            return Err(PipelineError::missing_config("services.dimp.url"));
        }
        let converts =
            self.enables(StepKind::CsvConversion) || self.enables(StepKind::ParquetConversion);
        if converts && self.services.conversion.url.is_none() {
            return Err(PipelineError::missing_config("services.conversion.url"));
        }
        if converts && self.services.conversion.workers == 0 {
            return Err(PipelineError::invalid_config(
                "services.conversion.workers must be at least 1",
            ));
        }
        if self.services.torch.poll_interval_ms > self.services.torch.max_poll_interval_ms {
            return Err(PipelineError::invalid_config(
                "services.torch.poll_interval_ms must not exceed max_poll_interval_ms",
            ));
        }

        Ok(())
    }

    /// Whether a step of the given kind is configured
    pub fn enables(&self, kind: StepKind) -> bool {
        self.enabled_steps.iter().any(|s| match s {
            StepSelector::Import(_) => kind == StepKind::Import,
            StepSelector::Step(name) => name.kind() == kind,
        })
    }

    /// Fill the secrets a job snapshot omits from the configuration of this invocation
    pub fn restore_secrets(&mut self, current: &PipelineConfig) {
        if self.services.torch.password.is_none() {
            self.services.torch.password = current.services.torch.password.clone();
        }
    }

    /// Concrete step list for a classified input
    pub fn resolve_steps(&self, input_type: InputType) -> Result<Vec<StepName>, PipelineError> {
        self.enabled_steps
            .iter()
            .map(|s| s.resolve(input_type))
            .collect()
    }

    /// Apply environment variable overrides
    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("FHIRPIPE_JOBS_DIR") {
            self.jobs_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("FHIRPIPE_TORCH_URL") {
            self.services.torch.base_url = Some(url);
        }
        if let Ok(user) = std::env::var("FHIRPIPE_TORCH_USERNAME") {
            self.services.torch.username = Some(user);
        }
        if let Ok(password) = std::env::var("FHIRPIPE_TORCH_PASSWORD") {
            self.services.torch.password = Some(password);
        }
        if let Ok(url) = std::env::var("FHIRPIPE_DIMP_URL") {
            self.services.dimp.url = Some(url);
        }
        if let Ok(url) = std::env::var("FHIRPIPE_CONVERSION_URL") {
            self.services.conversion.url = Some(url);
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".fhirpipe").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse a config file
fn load_config_file(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    PipelineConfig::from_yaml(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's project root
fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load configuration from all sources.
///
/// Parse failures are reported as Configuration errors.
pub fn load(explicit: Option<&Path>) -> Result<PipelineConfig, PipelineError> {
    let config_file = explicit.map(Path::to_path_buf).or_else(find_config_file);

    let mut config = match &config_file {
        Some(path) => {
            let mut config = load_config_file(path).map_err(|e| {
                PipelineError::invalid_config(format!("{:#}", e))
                    .with_guidance(format!("Check the YAML syntax of {}", path.display()))
            })?;

            // Project root is the parent of .fhirpipe/ for discovered files
            let base_dir = if explicit.is_some() {
                path.parent()
            } else {
                path.parent().and_then(|p| p.parent())
            }
            .unwrap_or(Path::new("."));
            config.jobs_dir = resolve_path(base_dir, &config.jobs_dir);
            config
        }
        None => PipelineConfig::default(),
    };

    config.apply_env();
    Ok(config)
}

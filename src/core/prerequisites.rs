//! Step prerequisite table and validation.
//!
//! The table maps each step family to the families that must be Completed
//! before it may run. It is built once and never mutated, so it can be
//! shared freely between readers.

use std::collections::HashMap;

use crate::domain::{PipelineJob, StepKind, StepName, StepStatus};

/// Outcome of a prerequisite check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// All configured prerequisites are Completed
    Ready,

    /// The first unmet prerequisite, in table order
    Blocked {
        prerequisite: StepName,
        status: StepStatus,
    },
}

impl Readiness {
    pub fn can_run(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Immutable prerequisite table
#[derive(Debug, Clone)]
pub struct PrerequisiteTable {
    entries: HashMap<StepKind, Vec<StepKind>>,
}

impl Default for PrerequisiteTable {
    fn default() -> Self {
        Self::from_entries([
            (StepKind::Import, vec![]),
            (StepKind::DeIdentify, vec![StepKind::Import]),
            (StepKind::Validate, vec![StepKind::Import]),
            (StepKind::CsvConversion, vec![StepKind::Import]),
            (StepKind::ParquetConversion, vec![StepKind::Import]),
        ])
    }
}

impl PrerequisiteTable {
    /// Build a table from explicit entries; missing kinds have no prerequisites
    pub fn from_entries(entries: impl IntoIterator<Item = (StepKind, Vec<StepKind>)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Prerequisites of a step, in table order
    pub fn prerequisites(&self, step: StepName) -> &[StepKind] {
        self.entries
            .get(&step.kind())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Check whether `step` may run in `job`.
    ///
    /// A prerequisite that is not configured in the job cannot block: a
    /// disabled step is trusted to be intentionally absent.
    pub fn validate(&self, job: &PipelineJob, step: StepName) -> Readiness {
        for prerequisite in self.prerequisites(step) {
            let configured = job.steps.iter().find(|s| s.name.kind() == *prerequisite);

            if let Some(configured) = configured {
                if configured.status != StepStatus::Completed {
                    return Readiness::Blocked {
                        prerequisite: configured.name,
                        status: configured.status,
                    };
                }
            }
        }
        Readiness::Ready
    }
}

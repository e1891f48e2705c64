//! Workflow outcome and error types.

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use edupanel_core::{Error, Record};

/// Step whose failure triggered a compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStage {
    Upload,
    Link,
}

impl fmt::Display for SagaStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaStage::Upload => f.write_str("upload"),
            SagaStage::Link => f.write_str("link"),
        }
    }
}

/// A resource a failed compensation may have left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Orphan {
    Record(Uuid),
    Attachment(String),
}

impl fmt::Display for Orphan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Orphan::Record(id) => write!(f, "record {}", id),
            Orphan::Attachment(reference) => write!(f, "attachment {}", reference),
        }
    }
}

fn list_orphans(orphans: &[Orphan]) -> String {
    orphans
        .iter()
        .map(Orphan::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error surfaced by a workflow.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum SagaError {
    /// Input rejected before or by the record store.
    #[error("validation failed: {detail}")]
    Validation { detail: String },

    /// Name collision or a delete blocked by dependent records.
    #[error("conflict: {detail}")]
    Conflict {
        detail: String,
        /// Known only when the guard counted dependents itself.
        dependent_count: Option<i64>,
    },

    #[error("record not found: {id}")]
    NotFound { id: Uuid },

    #[error("attachment upload failed: {detail}")]
    Upload { detail: String },

    #[error("attachment link failed: {detail}")]
    Link { detail: String },

    /// Compensation itself failed. Requires operator action.
    #[error(
        "compensation after {stage} failure did not complete ({cause}): {detail}; orphans: [{}]",
        list_orphans(.orphans)
    )]
    Compensation {
        stage: SagaStage,
        cause: String,
        detail: String,
        orphans: Vec<Orphan>,
    },

    /// Store unavailable or failed in an unclassified way.
    #[error("store error: {detail}")]
    Store { detail: String },

    #[error("cancelled before start")]
    Cancelled,

    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl SagaError {
    pub fn validation(detail: impl Into<String>) -> Self {
        SagaError::Validation {
            detail: detail.into(),
        }
    }

    pub fn conflict(detail: impl Into<String>, dependent_count: Option<i64>) -> Self {
        SagaError::Conflict {
            detail: detail.into(),
            dependent_count,
        }
    }

    /// Classify a store error. Errors with no specific meaning become
    /// `fallback(message)`.
    pub fn from_store(err: Error, fallback: fn(String) -> SagaError) -> Self {
        match err {
            Error::InvalidInput(detail) => SagaError::Validation { detail },
            Error::Conflict(detail) => SagaError::Conflict {
                detail,
                dependent_count: None,
            },
            Error::RecordNotFound(id) => SagaError::NotFound { id },
            other => fallback(other.to_string()),
        }
    }

    pub fn store(detail: String) -> Self {
        SagaError::Store { detail }
    }

    pub fn upload(detail: String) -> Self {
        SagaError::Upload { detail }
    }

    pub fn link(detail: String) -> Self {
        SagaError::Link { detail }
    }

    /// False for errors a plain retry cannot fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SagaError::Upload { .. }
                | SagaError::Link { .. }
                | SagaError::Store { .. }
                | SagaError::Cancelled
        )
    }

    pub fn is_compensation_failure(&self) -> bool {
        matches!(self, SagaError::Compensation { .. })
    }
}

/// Result of one saga run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SagaOutcome {
    /// Every step committed.
    Success { record: Record },
    /// The field update committed but the attachment step did not.
    PartialSuccess { record: Record, error: SagaError },
    /// Nothing committed when `compensated` is true; otherwise `error`
    /// lists what was left behind.
    Failed { error: SagaError, compensated: bool },
}

impl SagaOutcome {
    pub(crate) fn failed(error: SagaError) -> Self {
        SagaOutcome::Failed {
            error,
            compensated: true,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SagaOutcome::Success { .. })
    }

    /// Record as it stands after the run, if one exists.
    pub fn record(&self) -> Option<&Record> {
        match self {
            SagaOutcome::Success { record } | SagaOutcome::PartialSuccess { record, .. } => {
                Some(record)
            }
            SagaOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&SagaError> {
        match self {
            SagaOutcome::Success { .. } => None,
            SagaOutcome::PartialSuccess { error, .. } | SagaOutcome::Failed { error, .. } => {
                Some(error)
            }
        }
    }

    /// Collapse to a plain result. `PartialSuccess` counts as an error.
    pub fn into_result(self) -> Result<Record, SagaError> {
        match self {
            SagaOutcome::Success { record } => Ok(record),
            SagaOutcome::PartialSuccess { error, .. } | SagaOutcome::Failed { error, .. } => {
                Err(error)
            }
        }
    }
}

/// A sub-operation of a batch that failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    /// Parent id for associations, record id for deletions.
    pub target: Uuid,
    pub error: SagaError,
}

/// Aggregate of a batch. Both lists follow input order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<BatchFailure>,
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchResult<T> {
    /// Targets to resubmit.
    pub fn failed_targets(&self) -> Vec<Uuid> {
        self.failed.iter().map(|f| f.target).collect()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

//! Failure taxonomy for the classification-and-update pipeline.
//!
//! Every per-incident failure is represented here so the cycle loop can count
//! and log it without string matching. The split matters operationally:
//! classification failures skip one ticket, a missing vocabulary aborts the
//! whole cycle, and persistence failures are logged and discarded.

use std::path::PathBuf;

use thiserror::Error;

/// Why a single classification attempt failed.
#[derive(Debug, Error)]
pub enum ClassifyError {
    /// The incident carried no description text. No model call is made.
    #[error("empty description, nothing to classify")]
    EmptyInput,

    /// The model reply contained no decodable JSON object.
    #[error("model reply was not valid JSON: {0}")]
    MalformedOutput(String),

    /// The model chose a value outside the vocabulary supplied to it.
    /// The update must never be applied in this case.
    #[error("model returned invalid {field}: {value:?}")]
    InvalidEnumValue { field: &'static str, value: String },

    /// The completion request itself failed (network, HTTP status, timeout).
    #[error("inference request failed: {0}")]
    Inference(String),
}

impl ClassifyError {
    /// Stable lowercase code for log fields and summaries.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyInput => "empty_input",
            Self::MalformedOutput(_) => "malformed_output",
            Self::InvalidEnumValue { .. } => "invalid_enum_value",
            Self::Inference(_) => "inference_failure",
        }
    }

    /// True when the failure came out of the model itself rather than the
    /// transport. Model faults are worth sampling when tuning the prompt.
    pub fn is_model_fault(&self) -> bool {
        matches!(
            self,
            Self::MalformedOutput(_) | Self::InvalidEnumValue { .. }
        )
    }
}

/// A condition that aborts the whole cycle before per-ticket work starts.
#[derive(Debug, Error)]
pub enum CycleAbort {
    /// A required choice list (category, impact or urgency) came back empty.
    /// Classifying without it would make every result unvalidatable.
    #[error("required choice list {0:?} is empty, aborting cycle")]
    MissingVocabulary(&'static str),

    /// The incident fetch itself failed.
    #[error("incident fetch failed")]
    Fetch(#[from] anyhow::Error),
}

/// A persistence failure in the result feed or audit trail.
///
/// These are best-effort sinks: the orchestrator logs the error and keeps
/// processing the ticket. They must never fail the surrounding update.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to write {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl RecorderError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

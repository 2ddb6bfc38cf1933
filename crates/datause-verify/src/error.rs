//! Error types for the validation and evaluation engine
//!
//! Only structurally invalid requests surface as [`VerifyError`]. Per-sample
//! model failures (timeouts, transport errors, unparsable output) are recorded
//! as data on [`PredictionRecord`](crate::models::PredictionRecord) instead.

use crate::models::{SampleId, TextField};
use thiserror::Error;

/// Error type for engine operations
#[derive(Error, Debug)]
pub enum VerifyError {
    /// The strategy's required text field is absent or empty on the sample
    #[error("sample {sample_id} has no {field} text")]
    MissingField {
        /// Sample the prompt was being built for
        sample_id: SampleId,
        /// Text field the strategy consumes
        field: TextField,
    },

    /// No sample had both a prediction and a ground-truth label
    #[error("no eligible samples to evaluate for column '{column}'")]
    InsufficientData {
        /// Prediction column that was being scored
        column: String,
    },

    /// A correction referenced a sample id that does not exist
    #[error("unknown sample id: {0}")]
    UnknownSample(SampleId),

    /// A correction supplied a label outside the closed label set
    #[error("invalid label '{label}' for sample {sample_id}")]
    InvalidLabel {
        /// Sample the correction targets
        sample_id: SampleId,
        /// Label text as supplied
        label: String,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed tabular input
    #[error("invalid dataset: {0}")]
    Dataset(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML config parse error
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, VerifyError>;

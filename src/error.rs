//! Error types for u-labstat.
//!
//! Every failure inside the engine is captured per parameter and stored in
//! the `error` slot of the corresponding result; [`EngineError`] is the
//! typed form used while the failure travels up through `?`.

use thiserror::Error;

/// All errors produced by u-labstat operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Too few rows, groups or distinct values for the requested procedure.
    #[error("insufficient data: {context}")]
    InsufficientData { context: String },

    /// A pre-test (normality, variance homogeneity, sphericity) could not be computed.
    #[error("assumption could not be tested: {context}")]
    AssumptionUntestable { context: String },

    /// The requested test key does not name a known procedure.
    #[error("unsupported test '{key}'")]
    UnsupportedTest { key: String },

    /// The underlying numerical procedure failed.
    #[error("{message}")]
    StatisticalFit { message: String },

    /// Column not found in the dataset.
    #[error("column '{name}' not found")]
    ColumnNotFound { name: String },

    /// Dimension mismatch.
    #[error("expected {expected} elements, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A (subject, level) pair occurs more than once in long form.
    #[error("subject '{subject}' has more than one observation for '{level}'")]
    DuplicateObservation { subject: String, level: String },

    /// CSV parsing failed.
    #[error("CSV parse error at line {line}: {message}")]
    CsvParse { line: usize, message: String },

    /// I/O error during file reading.
    #[error("I/O error: {0}")]
    Io(String),
}

impl EngineError {
    /// Shorthand for [`EngineError::InsufficientData`].
    pub fn insufficient(context: impl Into<String>) -> Self {
        Self::InsufficientData {
            context: context.into(),
        }
    }

    /// Shorthand for [`EngineError::StatisticalFit`].
    pub fn fit(message: impl Into<String>) -> Self {
        Self::StatisticalFit {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

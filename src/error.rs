//! Error types for the fine-tuning preparation pipeline

use thiserror::Error;

/// Main error type for lorax-finetune operations
#[derive(Error, Debug)]
pub enum Error {
    /// A raw record lacks a required field
    #[error("Missing field '{field}' in record {index}")]
    MissingField {
        /// Name of the missing field
        field: &'static str,
        /// Position of the record in its source
        index: usize,
    },

    /// The tokenizer rejected its input or returned inconsistent batch shapes
    #[error("Tokenization error: {0}")]
    Tokenization(String),

    /// A ratio was requested over a zero denominator
    #[error("Division by zero: {0}")]
    DivisionByZero(String),

    /// None of the candidate configuration attributes yielded a value
    #[error("No configuration value found among {candidates:?}")]
    ConfigurationNotFound {
        /// Attribute names that were checked, in priority order
        candidates: Vec<&'static str>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Failure reported by the training-loop collaborator
    #[error("Training error: {0}")]
    Training(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for lorax-finetune operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a tokenization error
    pub fn tokenization(msg: impl Into<String>) -> Self {
        Self::Tokenization(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }
}

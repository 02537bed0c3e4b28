//! Common error types for FrameBatch
//!
//! This module defines all error types used across the FrameBatch crates.
//! Every error maps onto one of four categories so callers can decide
//! whether a failed submission is worth retrying.

use thiserror::Error;

/// Main error type for FrameBatch
#[derive(Error, Debug)]
pub enum FrameBatchError {
    /// Configuration errors (invalid option values, bad config files)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid execution parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Requested feature is not available for this model or mode
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// No free execution slot, allocation failure
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Native runtime call failures (blob access, reshape, load, dispatch)
    #[error("Device error: {0}")]
    Device(String),

    /// Model loading errors
    #[error("Model error: {0}")]
    Model(String),

    /// Tensor shape or conversion errors
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Invariant violations detected while demultiplexing a batch
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for FrameBatchError {
    fn from(err: config::ConfigError) -> Self {
        FrameBatchError::Config(err.to_string())
    }
}

/// Coarse error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad option values or parameters; fix the caller, do not retry
    Configuration,

    /// Transient shortage; the caller may resubmit later
    ResourceExhaustion,

    /// The runtime rejected a call for the current task
    Device,

    /// An internal invariant was broken
    Consistency,
}

impl FrameBatchError {
    /// Classify the error
    pub fn category(&self) -> ErrorCategory {
        match self {
            FrameBatchError::Config(_)
            | FrameBatchError::InvalidInput(_)
            | FrameBatchError::NotSupported(_)
            | FrameBatchError::Parse(_)
            | FrameBatchError::Yaml(_)
            | FrameBatchError::Serialization(_) => ErrorCategory::Configuration,
            FrameBatchError::ResourceExhausted(_) => ErrorCategory::ResourceExhaustion,
            FrameBatchError::Device(_)
            | FrameBatchError::Model(_)
            | FrameBatchError::Tensor(_)
            | FrameBatchError::Io(_) => ErrorCategory::Device,
            FrameBatchError::Consistency(_) | FrameBatchError::Internal(_) => {
                ErrorCategory::Consistency
            }
        }
    }

    /// Whether resubmitting the same work later can succeed
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::ResourceExhaustion
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        FrameBatchError::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        FrameBatchError::InvalidInput(msg.into())
    }

    /// Create a not supported error
    pub fn not_supported(msg: impl Into<String>) -> Self {
        FrameBatchError::NotSupported(msg.into())
    }

    /// Create a resource exhausted error
    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        FrameBatchError::ResourceExhausted(msg.into())
    }

    /// Create a device error
    pub fn device(msg: impl Into<String>) -> Self {
        FrameBatchError::Device(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        FrameBatchError::Model(msg.into())
    }

    /// Create a tensor error
    pub fn tensor(msg: impl Into<String>) -> Self {
        FrameBatchError::Tensor(msg.into())
    }

    /// Create a consistency error
    pub fn consistency(msg: impl Into<String>) -> Self {
        FrameBatchError::Consistency(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        FrameBatchError::Internal(msg.into())
    }
}

/// Result type alias for FrameBatch operations
pub type Result<T> = std::result::Result<T, FrameBatchError>;

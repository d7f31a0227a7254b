//! Error types for the factor hedge orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, HedgeError>;

#[derive(Error, Debug)]
pub enum HedgeError {

    // =============================
    // Core Pipeline Errors
    // =============================

    /// No JSON object or array could be recovered from knowledge-source text
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// External call failed (network, rate limit, non-success status)
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Invalid registry: {0}")]
    InvalidRegistry(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl HedgeError {
    /// True for failures of an external round trip, as opposed to bad content
    pub fn is_transport(&self) -> bool {
        matches!(self, HedgeError::TransportError(_) | HedgeError::HttpError(_))
    }
}

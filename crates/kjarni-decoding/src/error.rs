//! Error types for the decoding engine.

use thiserror::Error;

/// Errors that abort a generation call.
///
/// None of these are retried internally. A failed call leaves no partial
/// output behind.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Malformed or contradictory generation configuration.
    #[error("Invalid generation config: {0}")]
    Configuration(String),

    /// The model's single-step compute failed.
    #[error("Step compute failed at step {step}: {source}")]
    Compute {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    /// The caller supplied zero input tokens.
    #[error("Input contains no tokens")]
    EmptyInput,

    /// Cancellation was requested between two steps.
    #[error("Generation was cancelled")]
    Cancelled,

    /// Cache bookkeeping went out of sync with the beams.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Token timestamps could not be derived from the collected attentions.
    #[error("Timestamp alignment failed: {0}")]
    Alignment(String),

    /// A generation config file could not be read or parsed.
    #[error("Failed to load generation config: {0}")]
    ConfigLoad(#[from] anyhow::Error),
}

impl GenerationError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        GenerationError::Configuration(msg.into())
    }

    pub(crate) fn cache(msg: impl Into<String>) -> Self {
        GenerationError::Cache(msg.into())
    }

    /// True for errors raised before any compute call was made.
    pub fn is_rejected_input(&self) -> bool {
        matches!(
            self,
            GenerationError::Configuration(_) | GenerationError::EmptyInput
        )
    }
}

/// Result type for decoding operations.
pub type GenerationResult<T> = Result<T, GenerationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_error_keeps_source() {
        let err = GenerationError::Compute {
            step: 3,
            source: anyhow::anyhow!("backend exploded"),
        };
        let msg = err.to_string();
        assert!(msg.contains("step 3"));
        assert!(msg.contains("backend exploded"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_rejected_input() {
        assert!(GenerationError::EmptyInput.is_rejected_input());
        assert!(GenerationError::config("bad").is_rejected_input());
        assert!(!GenerationError::Cancelled.is_rejected_input());
    }
}

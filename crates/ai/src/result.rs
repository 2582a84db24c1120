use thiserror::Error;

/// Failure reported by the generation boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AiError {
    /// The generator has no credential and cannot be called.
    #[error("generator not configured: {0}")]
    NotConfigured(String),

    #[error("invalid generation input: {0}")]
    InvalidInput(String),

    /// Transport failure or non-success status from the remote service.
    #[error("generation failed: {0}")]
    InferenceFailed(String),

    /// The service answered, but the answer could not be used even after repair.
    #[error("malformed generation output: {0}")]
    MalformedOutput(String),
}

impl AiError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedOutput(msg.into())
    }
}

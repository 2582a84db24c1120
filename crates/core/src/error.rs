//! Errors for caller-supplied values.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Rejected caller input: malformed identifiers and blank references.
///
/// Storage and collaborator failures have their own error types in `coachq-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// `field` was empty or whitespace only.
    pub fn blank(field: &str) -> Self {
        Self::Validation(format!("{field} must not be blank"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_names_the_field() {
        assert_eq!(
            DomainError::blank("session reference").to_string(),
            "validation failed: session reference must not be blank"
        );
    }
}

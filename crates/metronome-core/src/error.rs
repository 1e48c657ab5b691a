//! Unified error types for Metronome.

use thiserror::Error;

/// Result type alias using MetronomeError.
pub type Result<T> = std::result::Result<T, MetronomeError>;

#[derive(Error, Debug)]
pub enum MetronomeError {
    // Validation errors
    #[error("Invalid schedule expression: {0}")]
    InvalidExpression(String),

    // Store errors
    #[error("Duplicate job name '{name}' in group '{group}'")]
    DuplicateName { name: String, group: String },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job is pending deletion: {0}")]
    PendingDeletion(String),

    #[error("Concurrent modification of job {0}, retry the operation")]
    ConcurrencyConflict(String),

    #[error("Store error: {0}")]
    Store(String),

    // Engine / projection errors
    #[error("Handler not registered: {0}")]
    HandlerNotFound(String),

    #[error("Job not registered in engine: {0}")]
    NotRegistered(String),

    #[error("Projection error: {0}")]
    Projection(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl MetronomeError {
    pub fn invalid_expression(msg: impl Into<String>) -> Self {
        Self::InvalidExpression(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn projection(msg: impl Into<String>) -> Self {
        Self::Projection(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MetronomeError::InvalidExpression("bad field".into());
        assert!(err.to_string().contains("bad field"));

        let err = MetronomeError::DuplicateName {
            name: "backup".into(),
            group: "daily".into(),
        };
        assert!(err.to_string().contains("backup"));
        assert!(err.to_string().contains("daily"));
    }

    #[test]
    fn test_error_constructors() {
        let e1 = MetronomeError::invalid_expression("test");
        assert!(matches!(e1, MetronomeError::InvalidExpression(_)));

        let e2 = MetronomeError::store("test");
        assert!(matches!(e2, MetronomeError::Store(_)));

        let e3 = MetronomeError::projection("test");
        assert!(matches!(e3, MetronomeError::Projection(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: MetronomeError = io_err.into();
        assert!(matches!(err, MetronomeError::Io(_)));
    }
}

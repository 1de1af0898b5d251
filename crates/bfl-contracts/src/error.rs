use thiserror::Error;

/// Failures a node invocation reports to its caller instead of masking
/// behind the placeholder image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FluxError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
    #[error("invalid input '{field}': {reason}")]
    InvalidInput { field: String, reason: String },
}

impl FluxError {
    pub fn invalid_input(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type FluxResult<T> = std::result::Result<T, FluxError>;

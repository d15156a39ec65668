use thiserror::Error;

#[derive(Error, Debug)]
pub enum FramelinkError {
    #[error("{kind} message is missing required field '{field}'")]
    Validation {
        kind: &'static str,
        field: &'static str,
    },

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("invalid resource pattern '{0}'")]
    Pattern(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("client is closed")]
    Closed,
}

impl FramelinkError {
    /// Shorthand for a validation failure naming the missing field.
    pub fn missing(kind: &'static str, field: &'static str) -> Self {
        FramelinkError::Validation { kind, field }
    }
}

pub type Result<T> = std::result::Result<T, FramelinkError>;

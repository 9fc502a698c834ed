use thiserror::Error;

/// Convenience type alias for Results with [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Unified error taxonomy for the coordination core.
///
/// Every component maps its failures onto one of these variants so that the
/// HTTP surface and the internal retry logic can treat them uniformly.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Illegal state transition, lock held by another agent, duplicate entity.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Unknown id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Bad input shape, unknown action, malformed configuration value.
    #[error("validation error: {0}")]
    Validation(String),

    /// Sandbox or other pool capacity exceeded.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Network/remote I/O error, retried internally per component budget.
    #[error("transient error: {0}")]
    Transient(String),

    /// Invariant violation. The affected task or agent is marked failed/offline
    /// and an escalation is created by the caller.
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(#[from] config::ConfigError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Status code this error should surface as on the HTTP boundary, per the
    /// taxonomy in the coordination spec.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Conflict(_) => 409,
            CoreError::NotFound(_) => 404,
            CoreError::Validation(_) => 400,
            CoreError::Capacity(_) => 429,
            CoreError::Transient(_) => 503,
            CoreError::Fatal(_) => 500,
            CoreError::Serialization(_) => 400,
            CoreError::Configuration(_) => 500,
            CoreError::Http(_) => 503,
            CoreError::Internal(_) => 500,
        }
    }
}

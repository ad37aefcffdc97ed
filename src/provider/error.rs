use thiserror::Error;

use crate::error::ErrorClass;

/// Failures reported by a session provider or one of its pages.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Navigation or element wait exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The session or page went away underneath us.
    #[error("session detached: {0}")]
    Detached(String),

    /// Provider at its own concurrency limit.
    #[error("provider exhausted: {0}")]
    Exhausted(String),

    /// The provider answered with something we cannot interpret.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Timeout(_) | ProviderError::Detached(_) | ProviderError::Http(_) => {
                ErrorClass::Transient
            }
            ProviderError::Exhausted(_) => ErrorClass::ResourceExhausted,
            ProviderError::Protocol(_) => ErrorClass::Structural,
        }
    }

    /// Whether the session that produced this error can be handed out again.
    pub fn session_is_healthy(&self) -> bool {
        matches!(self, ProviderError::Timeout(_))
    }
}

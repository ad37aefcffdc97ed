use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::provider::ProviderError;
use crate::recorder::RecorderError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("No jobs found in {0}")]
    NoJobs(String),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("Session provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Outcome recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Classifies an attempt failure for retry and circuit-breaker decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network hiccup, element not rendered yet, session timeout. Retryable.
    Transient,
    /// The form no longer matches what the strategy understands. Terminal.
    Structural,
    /// Already applied, position closed, unanswered required question. Terminal, not a failure.
    Policy,
    /// CAPTCHA or anti-bot challenge. Terminal, weighs heavier on the breaker.
    AntiBot,
    /// Pool at capacity or bucket empty. Scheduling backpressure, never recorded on an attempt.
    ResourceExhausted,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "Transient"),
            ErrorClass::Structural => write!(f, "Structural"),
            ErrorClass::Policy => write!(f, "Policy"),
            ErrorClass::AntiBot => write!(f, "AntiBot"),
            ErrorClass::ResourceExhausted => write!(f, "ResourceExhausted"),
        }
    }
}

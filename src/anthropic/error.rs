//! Error type for the Anthropic Messages client used by the answer generator.

use thiserror::Error;

/// Failures talking to the Messages API.
///
/// - [`RateLimited`](AnthropicError::RateLimited): HTTP 429
/// - [`ApiError`](AnthropicError::ApiError): any other non-2xx status
/// - [`NetworkError`](AnthropicError::NetworkError): transport failure
/// - [`EmptyResponse`](AnthropicError::EmptyResponse): 2xx with no text block
#[derive(Debug, Error)]
pub enum AnthropicError {
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("response contained no text")]
    EmptyResponse,
}

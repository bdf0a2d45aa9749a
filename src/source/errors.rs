//! HTTP Source Error Types
//!
//! Maps HTTP status codes and transport failures to specific error variants
//! for retry decisions.

/// HTTP range source error types
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),
}

impl HttpError {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HttpError::RateLimited
                | HttpError::Timeout
                | HttpError::Network(_)
                | HttpError::Server(_, _)
        )
    }

    /// Create an HttpError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => HttpError::Unauthorized(body.to_string()),
            403 => HttpError::Forbidden(body.to_string()),
            404 => HttpError::NotFound(body.to_string()),
            408 => HttpError::Timeout,
            416 => HttpError::RangeNotSatisfiable(body.to_string()),
            429 => HttpError::RateLimited,
            500..=599 => HttpError::Server(status, body.to_string()),
            _ => HttpError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HttpError::Timeout
        } else if e.is_connect() {
            HttpError::Network(e.to_string())
        } else {
            HttpError::Request(e.to_string())
        }
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("agent error: {0}")]
    Agent(String),

    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        Error::Provider(err)
    }
}

/// Coarse classification of a provider failure, independent of the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorCode {
    Timeout,
    RateLimited,
    Unavailable,
    Auth,
    BadRequest,
    MalformedResponse,
    Network,
    Unknown,
}

impl ProviderErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Auth => "auth",
            Self::BadRequest => "bad_request",
            Self::MalformedResponse => "malformed_response",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

/// Normalized `{status, code, message}` failure surfaced by every provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    pub status: Option<u16>,
    pub code: ProviderErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: None,
            code,
            message: message.into(),
        }
    }

    /// Map an HTTP status and response body into a normalized error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let code = match status {
            408 => ProviderErrorCode::Timeout,
            429 => ProviderErrorCode::RateLimited,
            401 | 403 => ProviderErrorCode::Auth,
            400 | 404 | 413 | 422 => ProviderErrorCode::BadRequest,
            500..=599 => ProviderErrorCode::Unavailable,
            _ => ProviderErrorCode::Unknown,
        };
        Self {
            status: Some(status),
            code,
            message: body.into(),
        }
    }

    pub fn timeout(after_ms: u64) -> Self {
        Self::new(
            ProviderErrorCode::Timeout,
            format!("request timed out after {after_ms}ms"),
        )
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorCode::MalformedResponse, message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            ProviderErrorCode::Timeout
                | ProviderErrorCode::RateLimited
                | ProviderErrorCode::Unavailable
                | ProviderErrorCode::Network
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "{} (status={status}): {}",
                self.code.as_str(),
                self.message
            ),
            None => write!(f, "{}: {}", self.code.as_str(), self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_codes() {
        assert_eq!(
            ProviderError::from_status(429, "slow down").code,
            ProviderErrorCode::RateLimited
        );
        assert_eq!(
            ProviderError::from_status(503, "overloaded").code,
            ProviderErrorCode::Unavailable
        );
        assert_eq!(
            ProviderError::from_status(401, "bad key").code,
            ProviderErrorCode::Auth
        );
        assert_eq!(
            ProviderError::from_status(400, "bad request").code,
            ProviderErrorCode::BadRequest
        );
    }

    #[test]
    fn retryable_only_for_transient_codes() {
        assert!(ProviderError::from_status(500, "").is_retryable());
        assert!(ProviderError::timeout(10).is_retryable());
        assert!(!ProviderError::from_status(401, "").is_retryable());
        assert!(!ProviderError::malformed("bad json").is_retryable());
    }

    #[test]
    fn display_includes_status() {
        let err = Error::from(ProviderError::from_status(503, "overloaded"));
        assert_eq!(
            err.to_string(),
            "provider error: unavailable (status=503): overloaded"
        );
    }
}

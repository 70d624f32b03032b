//! Error types for media-broker
//!
//! This module provides error handling for the broker, including:
//! - Request-scoped errors (validation, quota, external tool failures)
//! - HTTP status code mapping for the API layer
//! - Structured error responses with machine-readable error codes
//!
//! Diagnostic text captured from external tools stays inside the error value so it
//! can be logged; it is replaced by a generic message before reaching a client.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for media-broker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-broker
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "retention.sweep_interval")
        key: Option<String>,
    },

    /// The fetch request is malformed
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// Projected transfer size exceeds the per-request budget
    #[error("projected size of {projected} bytes exceeds the limit of {limit} bytes")]
    QuotaExceeded {
        /// Aggregate byte projection for the request
        projected: u64,
        /// Configured maximum request size in bytes
        limit: u64,
    },

    /// Not enough free space in the output directory
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required (projection plus reserve)
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// Metadata probe exited non-zero
    #[error("metadata probe failed: {0}")]
    Probe(String),

    /// Fetch tool exited non-zero or produced no usable artifact
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Archive tool exited non-zero
    #[error("bundle failed: {0}")]
    Bundle(String),

    /// Dynamic DNS publish was rejected or could not be sent
    #[error("publish failed: {0}")]
    Publish(String),

    /// External tool could not be executed at all (missing binary, spawn failure, timeout)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Rules a fetch request can violate
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// No `url` parameter was supplied
    #[error("at least one url is required")]
    MissingUrl,

    /// A `url` parameter is not an absolute URL
    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl {
        /// The offending value as received
        url: String,
        /// Parser diagnostic
        reason: String,
    },

    /// The `format` parameter is not one of the supported formats
    #[error("unsupported format {0:?}, expected one of: audio, video")]
    UnsupportedFormat(String),
}

impl ValidationError {
    /// Machine-readable name of the violated rule
    pub fn rule(&self) -> &'static str {
        match self {
            ValidationError::MissingUrl => "missing_url",
            ValidationError::InvalidUrl { .. } => "invalid_url",
            ValidationError::UnsupportedFormat(_) => "unsupported_format",
        }
    }
}

/// API error response format
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "quota_exceeded",
///     "message": "projected size of 30000000000 bytes exceeds the limit of 20000000000 bytes",
///     "details": {
///       "projected_bytes": 30000000000,
///       "limit_bytes": 20000000000
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "validation_error", "quota_exceeded")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an API error with additional details
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    /// Create an "internal server error"
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed request
            Error::Validation(_) => 400,

            // 403 Forbidden - over the per-request budget
            Error::QuotaExceeded { .. } => 403,

            // 507 Insufficient Storage
            Error::InsufficientSpace { .. } => 507,

            // 502 Bad Gateway - upstream endpoint errors
            Error::Network(_) | Error::Publish(_) => 502,

            // 500 Internal Server Error - everything operational
            Error::Probe(_)
            | Error::Fetch(_)
            | Error::Bundle(_)
            | Error::ExternalTool(_)
            | Error::Config { .. }
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::ApiServerError(_)
            | Error::Other(_) => 500,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Validation(_) => "validation_error",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::InsufficientSpace { .. } => "insufficient_space",
            Error::Probe(_) => "probe_failed",
            Error::Fetch(_) => "fetch_failed",
            Error::Bundle(_) => "bundle_failed",
            Error::Publish(_) => "publish_failed",
            Error::ExternalTool(_) => "external_tool_error",
            Error::Io(_) => "io_error",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

/// Usage line returned alongside validation errors
pub const USAGE: &str = "usage: GET /?url=<url>[&url=<url>...][&format=audio|video]";

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();

        match &error {
            Error::Validation(e) => ApiError::with_details(
                code,
                format!("{}; {}", e, USAGE),
                serde_json::json!({ "rule": e.rule() }),
            ),
            Error::QuotaExceeded { projected, limit } => ApiError::with_details(
                code,
                error.to_string(),
                serde_json::json!({
                    "projected_bytes": projected,
                    "limit_bytes": limit,
                }),
            ),
            Error::InsufficientSpace {
                required,
                available,
            } => ApiError::with_details(
                code,
                error.to_string(),
                serde_json::json!({
                    "required_bytes": required,
                    "available_bytes": available,
                }),
            ),
            // Tool output and filesystem details stay in the server log
            _ => ApiError::new(code, "the request could not be completed"),
        }
    }
}

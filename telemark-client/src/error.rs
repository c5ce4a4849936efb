//! Error types for the Telemark clients

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when talking to the job runner or the mail relay
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// No connection is configured under the requested id
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a server error (5xx status)
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if *status >= 500)
    }

    /// Whether sending the same request again could succeed
    ///
    /// Configuration problems (unknown connection, rejected request) will
    /// fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed(_) | Self::ParseError(_) => true,
            Self::ApiError { status, .. } => self.is_server_error() || *status == 429,
            Self::UnknownConnection(_) | Self::InvalidRequest(_) => false,
        }
    }
}

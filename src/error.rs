use thiserror::Error;

/// Type alias for Result with JanitorError
pub type Result<T> = std::result::Result<T, JanitorError>;

/// Error types for the email janitor
#[derive(Error, Debug)]
pub enum JanitorError {
    /// The collector never produced a batch for this run
    #[error("No emails found: the collector produced no batch for this run")]
    MissingBatch,

    /// The batch exists but cannot be iterated
    #[error("Invalid email batch: {0}")]
    InvalidBatch(String),

    /// The classification model failed to respond
    #[error("Model error: {0}")]
    ModelError(String),

    /// Gmail API returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Message payload could not be interpreted
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Label-related errors
    #[error("Label error: {0}")]
    LabelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Run state could not be read or written
    #[error("State error: {0}")]
    StateError(String),

    /// Classification history database errors
    #[cfg(feature = "history")]
    #[error("History database error: {0}")]
    HistoryError(#[from] rusqlite::Error),

    #[error("Classification not found: {0}")]
    ClassificationNotFound(i64),
}

impl JanitorError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JanitorError::RateLimitExceeded { .. }
                | JanitorError::ServerError { .. }
                | JanitorError::NetworkError(_)
        )
    }

    /// Errors that end the run instead of a single email
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            JanitorError::MissingBatch | JanitorError::InvalidBatch(_) | JanitorError::StateError(_)
        )
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// Accepts delay-seconds or an HTTP date. Falls back to 5 seconds when the
/// header is missing, malformed, or in the past.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    let Some(value) = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
    else {
        return DEFAULT_RETRY_AFTER;
    };

    if let Ok(seconds) = value.parse::<u64>() {
        return seconds;
    }

    httpdate::parse_http_date(value)
        .ok()
        .and_then(|when| when.duration_since(std::time::SystemTime::now()).ok())
        .map(|d| d.as_secs())
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

impl From<google_gmail1::Error> for JanitorError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    429 => JanitorError::RateLimitExceeded {
                        retry_after: parse_retry_after_header(response),
                    },
                    404 => JanitorError::MessageNotFound("Resource not found".to_string()),
                    400 => JanitorError::BadRequest(message),
                    401 => JanitorError::AuthError(message),
                    403 => JanitorError::Forbidden(message),
                    500..=599 => JanitorError::ServerError {
                        status: status_code,
                        message,
                    },
                    _ => JanitorError::ApiError(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => JanitorError::BadRequest(err.to_string()),
            google_gmail1::Error::HttpError(ref err) => {
                JanitorError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => JanitorError::NetworkError(err.to_string()),
            _ => JanitorError::ApiError(error.to_string()),
        }
    }
}

//! Error types for veilq

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Coordination Errors ===
    #[error("coordination store unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("not leader: current leader is {0}")]
    NotLeader(String),

    #[error("no leader elected")]
    NoLeader,

    // === Transfer Errors ===
    #[error("transfer to leader failed: {0}")]
    TransferFailed(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // === Gateway Errors ===
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("unknown survey: {0}")]
    UnknownSurvey(uuid::Uuid),

    #[error("anonymization unavailable: {0}")]
    Anonymization(String),

    // === Config Errors ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::CoordinationUnavailable(_)
                | Error::TransferFailed(_)
                | Error::Http(_)
                | Error::NotLeader(_)
                | Error::NoLeader
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::UnknownSurvey(_) => StatusCode::NOT_FOUND,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NotLeader(_) | Error::NoLeader | Error::CoordinationUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

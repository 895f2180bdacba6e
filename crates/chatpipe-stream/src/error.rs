//! Error types for chatpipe-stream

use std::time::Duration;

use thiserror::Error;

/// Result type alias using chatpipe-stream Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving a chat stream
#[derive(Error, Debug)]
pub enum Error {
    /// Connection or fetch failure before or during the response body
    #[error("Network error: {0}")]
    Network(String),

    /// Server answered with a non-2xx status that is not a server fault
    #[error("HTTP error: status {status}, detail: {detail}")]
    Http { status: u16, detail: String },

    /// Server answered with a 5xx status
    #[error("Server error: status {status}, detail: {detail}")]
    ServerRetryable { status: u16, detail: String },

    /// A frame or JSON payload could not be interpreted
    #[error("Parse error: {0}")]
    Parse(String),

    /// No activity on the stream for longer than the allowed window
    #[error("Connection timed out: no response from server for {0:?}")]
    StallTimeout(Duration),

    /// The interaction record could not be built from the final snapshot
    #[error("Reconstruction error: {0}")]
    Reconstruction(String),

    /// The caller abandoned the request
    #[error("Request cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl Error {
    /// Build the error for a non-2xx response status
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if (500..600).contains(&status) {
            Error::ServerRetryable { status, detail }
        } else {
            Error::Http { status, detail }
        }
    }

    /// Check if a fresh attempt may succeed where this one failed.
    ///
    /// Client-side statuses still consume the outer retry budget, so they
    /// count as retryable here; only local conditions do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::ServerRetryable { .. } | Error::Http { .. } => true,
            Error::Parse(_)
            | Error::StallTimeout(_)
            | Error::Reconstruction(_)
            | Error::Cancelled
            | Error::InvalidConfig(_) => false,
        }
    }

    /// Status code carried by HTTP failures
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } | Error::ServerRetryable { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_splits_server_faults() {
        assert!(matches!(
            Error::from_status(500, "boom"),
            Error::ServerRetryable { status: 500, .. }
        ));
        assert!(matches!(
            Error::from_status(503, ""),
            Error::ServerRetryable { status: 503, .. }
        ));
        assert!(matches!(
            Error::from_status(404, "missing"),
            Error::Http { status: 404, .. }
        ));
    }

    #[test]
    fn test_retryable_variants() {
        assert!(Error::Network("connection reset".into()).is_retryable());
        assert!(Error::from_status(500, "").is_retryable());
        assert!(Error::from_status(400, "bad").is_retryable());
    }

    #[test]
    fn test_not_retryable_local_conditions() {
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::StallTimeout(Duration::from_secs(600)).is_retryable());
        assert!(!Error::Parse("bad json".into()).is_retryable());
        assert!(!Error::InvalidConfig("empty url".into()).is_retryable());
    }

    #[test]
    fn test_status_accessor() {
        assert_eq!(Error::from_status(502, "").status(), Some(502));
        assert_eq!(Error::Network("x".into()).status(), None);
    }
}

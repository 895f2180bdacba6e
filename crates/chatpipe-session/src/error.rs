//! Error types for chatpipe-session

use thiserror::Error;

/// Result type alias using chatpipe-session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the event service
#[derive(Error, Debug)]
pub enum Error {
    /// The event connection could not be opened or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether reconnecting may help
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::InvalidConfig(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Connection("reset".into()).is_retryable());
        assert!(!Error::InvalidConfig("x".into()).is_retryable());
    }
}

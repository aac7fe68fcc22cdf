use std::io;
use std::time::Duration;

use rowlink_core::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Release failed: {0}")]
    ReleaseFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    // Programming errors
    #[error("An exchange is already in progress on this session")]
    ExchangeInProgress,

    #[error("No exchange is in progress on this session")]
    NoExchange,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Handle is closed")]
    HandleClosed,

    #[error("Session is lent to a child handle")]
    SessionLent,

    #[error("Registry is closed")]
    RegistryClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

impl From<CodecError> for DriverError {
    fn from(err: CodecError) -> Self {
        DriverError::Protocol(err.to_string())
    }
}

impl DriverError {
    /// Worth one more attempt on a fresh session.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Io(_))
    }

    /// Leaves the session unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Protocol(_) | DriverError::Io(_) | DriverError::Timeout(_)
        )
    }
}

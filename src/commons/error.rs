//! Defines all errors raised by the connection manager.

use std::{fmt, io};

use crate::commons::util::httpclient;

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // System Issues
    //-----------------------------------------------------------------
    IoError(io::Error),

    JsonError(serde_json::Error),

    HttpClientError(httpclient::Error),

    SignerError(String),

    // Vault answered, but not with what we asked for.
    VaultError(String),

    //-----------------------------------------------------------------
    // Collaborator Issues
    //-----------------------------------------------------------------
    Remote {
        op: String,
        cause: String,
    },

    RetriesExhausted {
        op: String,
        attempts: u32,
        last: Box<Error>,
    },

    ControlChannel(String),

    //-----------------------------------------------------------------
    // State Machine Issues
    //-----------------------------------------------------------------
    SnapshotError(String),

    UnsupportedEvent(String),

    MissingData(String),

    //-----------------------------------------------------------------
    // If we really don't know any more...
    //-----------------------------------------------------------------
    Custom(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(e) => e.fmt(f),
            Error::JsonError(e) => write!(f, "Invalid JSON: {}", e),
            Error::HttpClientError(e) => e.fmt(f),
            Error::SignerError(e) => write!(f, "Signing issue: {}", e),
            Error::VaultError(e) => write!(f, "Vault issue: {}", e),
            Error::Remote { op, cause } => write!(f, "Remote call '{}' failed: {}", op, cause),
            Error::RetriesExhausted { op, attempts, last } => {
                write!(f, "Gave up on '{}' after {} attempts, last error: {}", op, attempts, last)
            }
            Error::ControlChannel(e) => write!(f, "Control channel issue: {}", e),
            Error::SnapshotError(e) => write!(f, "Cannot handle persisted state: {}", e),
            Error::UnsupportedEvent(e) => write!(f, "Unsupported event: {}", e),
            Error::MissingData(e) => write!(f, "Missing data: {}", e),
            Error::Custom(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonError(e)
    }
}

impl From<httpclient::Error> for Error {
    fn from(e: httpclient::Error) -> Self {
        Error::HttpClientError(e)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::SignerError(e.to_string())
    }
}

impl Error {
    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::Custom(msg.to_string())
    }

    pub fn remote(op: impl fmt::Display, cause: impl fmt::Display) -> Self {
        Error::Remote {
            op: op.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn vault(msg: impl fmt::Display) -> Self {
        Error::VaultError(msg.to_string())
    }

    pub fn missing(what: impl fmt::Display) -> Self {
        Error::MissingData(what.to_string())
    }

    pub fn snapshot(msg: impl fmt::Display) -> Self {
        Error::SnapshotError(msg.to_string())
    }

    /// Returns whether the error came from the HTTP layer with a 404 status.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::HttpClientError(e) if e.is_not_found())
    }
}

//------------ Tests ---------------------------------------------------------

use serde::{Deserialize, Serialize};

use crate::connection::ConnId;

/// Errors carried inside `return` payloads. These cross the wire and are raised to the caller
/// when the payload is read.
#[derive(thiserror::Error, Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum CallError {
    #[error("Function already registered - {0}")]
    FunctionAlreadyRegistered(String),

    #[error("Function not registered - {0}")]
    FunctionNotRegistered(String),

    #[error("No response")]
    NoResponse,

    #[error("Invalid arguments - {0}")]
    InvalidArguments(String),

    #[error("Function not known - {0}")]
    FunctionNotKnown(String),

    #[error("Function failed - {0}")]
    Failed(String),
}

impl CallError {
    /// Error raised from within a registered function
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

impl From<serde_json::Error> for CallError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidArguments(value.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Call failed - {0}")]
    Call(#[from] CallError),

    #[error("Function already locally registered - {0}")]
    AlreadyRegisteredLocally(String),

    #[error("Registration rejected by broker - {0}")]
    RegistrationRejected(serde_json::Value),

    #[error("Loop is already running")]
    AlreadyRunning,

    #[error("Loop is not running")]
    NotRunning,

    #[error("No response within timeout")]
    NoResponse,

    #[error("Connection disconnected")]
    Disconnected,

    #[error("Unknown connection - {0}")]
    UnknownConnection(ConnId),

    #[error("Failed to encode payload - {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO Error - {0}")]
    IO(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the underlying connection can no longer be used
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Disconnected | Error::IO(_))
    }
}

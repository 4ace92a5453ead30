//! Client error taxonomy.
//!
//! `Timeout` and `Validation` are local and recoverable. `TransportFailure`
//! is terminal for the channel that raised it. `ProtocolViolation` is fatal
//! to its owning channel and is stored there as a transport failure.

use std::time::Duration;

use pairspeed_types::PayloadError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{0}")]
    Validation(#[from] ValidationError),
}

/// Pairing input problems. Shown to the user verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid identifier.")]
    InvalidIdentifier,

    #[error("You cannot connect to yourself.")]
    SelfPairing,

    #[error("No peer with that identifier.")]
    UnknownPeer,
}

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::TransportFailure(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// Form stored as a channel's sticky failure.
    pub fn into_fatal(self) -> Self {
        match self {
            Self::ProtocolViolation(msg) => {
                Self::TransportFailure(format!("protocol violation: {}", msg))
            }
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<PayloadError> for Error {
    fn from(e: PayloadError) -> Self {
        Self::ProtocolViolation(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::ProtocolViolation(e.to_string())
    }
}

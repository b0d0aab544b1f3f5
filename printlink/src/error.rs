//! Errors surfaced by a device connection. All of them are scoped to one device.

use printlink_core::chunk::ChunkError;
use printlink_core::protocol::BodyError;
use printlink_core::{PacketEncodeError, StateError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Socket or HTTP-level failure. The connection returns to Closed; retry by reconnecting.
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication denied by device")]
    AuthenticationDenied,
    #[error("timed out waiting for authorization on the touchscreen")]
    AuthenticationTimedOut,
    /// Device reported failure or the exchange broke down mid-transfer.
    #[error("transfer failed: {0}")]
    TransferFailed(String),
    #[error("device busy")]
    Busy,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    State(StateError),
}

impl Error {
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<StateError> for Error {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Busy => Error::Busy,
            other => Error::State(other),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<PacketEncodeError> for Error {
    fn from(e: PacketEncodeError) -> Self {
        Error::TransferFailed(e.to_string())
    }
}

impl From<BodyError> for Error {
    fn from(e: BodyError) -> Self {
        Error::Transport(format!("malformed message: {}", e))
    }
}

impl From<ChunkError> for Error {
    fn from(e: ChunkError) -> Self {
        Error::TransferFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ABOUTME: Manager-interface client error types shared by the client, dongle operations and manager
// ABOUTME: Separates transport-fatal failures from per-operation failures that leave the session intact

use crate::codec::CodecError;
use std::io;
use thiserror::Error;

/// Error type for manager-interface operations
///
/// Only [`AmiError::ConnectionClosed`], [`AmiError::Connection`] and
/// non-recoverable codec errors end a session. Everything else is local to the
/// operation that produced it.
#[derive(Debug, Error)]
pub enum AmiError {
    /// I/O error during network operations (connect, read, write)
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// Wire format error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Login was refused by the peer
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The peer answered but reported failure; carries the peer's message text
    #[error("Command rejected: {0}")]
    Rejected(String),

    /// No reply arrived before the deadline
    #[error("Timeout waiting for {action} response")]
    Timeout { action: String },

    /// The peer ended the stream
    #[error("Connection closed")]
    ConnectionClosed,

    /// No live client exists
    #[error("Manager interface client is not connected")]
    NotConnected,

    /// Caller-supplied data failed validation before any I/O
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The peer replied with something that could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Every bounded connection attempt failed
    #[error("Failed to connect after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<AmiError> },
}

/// Result type alias for manager-interface operations
pub type AmiResult<T> = Result<T, AmiError>;

impl AmiError {
    /// Whether this error means the session is gone and must be replaced.
    pub fn is_fatal(&self) -> bool {
        match self {
            AmiError::Connection(_) | AmiError::ConnectionClosed => true,
            AmiError::Codec(e) => !e.is_recoverable(),
            _ => false,
        }
    }

    pub(crate) fn timeout(action: &str) -> Self {
        AmiError::Timeout {
            action: action.to_string(),
        }
    }
}

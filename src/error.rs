//! Error types for the lockstep lock service.
//!
//! This module provides a unified error type [`LockstepError`] for both the
//! server and the client library, along with a convenient [`Result`] alias.
//!
//! The lock-state errors (`LockingTimeout`, `UnknownLock`, `NotOwner`,
//! `InvalidRequest`) cross the wire as `{name, message}` payloads;
//! [`LockstepError::wire_name`] and [`LockstepError::from_wire`] map them in
//! both directions.

use std::io;
use thiserror::Error;

/// Main error type for lockstep operations.
#[derive(Error, Debug)]
pub enum LockstepError {
    // Lock manager errors
    #[error("Lock acquisition timed out")]
    LockingTimeout,

    #[error("Unknown lock: {0}")]
    UnknownLock(String),

    #[error("Not the owner of lock: {0}")]
    NotOwner(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request cancelled")]
    Cancelled,

    // Network errors
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    // A server-side error that does not map to a known kind.
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LockstepError {
    /// Name used in wire error payloads.
    pub fn wire_name(&self) -> &str {
        match self {
            LockstepError::LockingTimeout => "LockingTimeout",
            LockstepError::UnknownLock(_) => "UnknownLock",
            LockstepError::NotOwner(_) => "NotOwner",
            LockstepError::InvalidRequest(_) => "InvalidRequest",
            LockstepError::Cancelled => "Cancelled",
            LockstepError::ConnectionLost => "ConnectionLost",
            LockstepError::Remote { name, .. } => name,
            _ => "Internal",
        }
    }

    /// Detail string for wire error payloads. For variants whose `Display`
    /// prepends a prefix this is the inner detail only, so rebuilding the
    /// error on the other side does not stack prefixes.
    pub fn wire_message(&self) -> String {
        match self {
            LockstepError::UnknownLock(detail)
            | LockstepError::NotOwner(detail)
            | LockstepError::InvalidRequest(detail)
            | LockstepError::Internal(detail) => detail.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a wire error payload.
    pub fn from_wire(name: &str, message: &str) -> Self {
        match name {
            "LockingTimeout" => LockstepError::LockingTimeout,
            "UnknownLock" => LockstepError::UnknownLock(message.to_string()),
            "NotOwner" => LockstepError::NotOwner(message.to_string()),
            "InvalidRequest" => LockstepError::InvalidRequest(message.to_string()),
            "ConnectionLost" => LockstepError::ConnectionLost,
            _ => LockstepError::Remote {
                name: name.to_string(),
                message: message.to_string(),
            },
        }
    }

    /// Check if the error was caused by the transport rather than lock state.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            LockstepError::ConnectionLost
                | LockstepError::ConnectionFailed(_)
                | LockstepError::Network(_)
                | LockstepError::Io(_)
        )
    }
}

impl From<serde_json::Error> for LockstepError {
    fn from(e: serde_json::Error) -> Self {
        LockstepError::Serialization(e.to_string())
    }
}

/// Result type alias for lockstep operations.
pub type Result<T> = std::result::Result<T, LockstepError>;

//! Domain-specific error types for the videophone core.
//!
//! All fallible operations return `Result<T, VpError>`.
//! Caller and logic errors are returned to the caller in the same stack
//! frame; nothing crosses a queue boundary as an error value.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the videophone core.
#[derive(Debug, Error)]
pub enum VpError {
    // ── Caller / logic errors ────────────────────────────────────
    /// An argument was empty, malformed or out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The configured number of concurrent calls is already in use.
    #[error("too many calls: limit is {max}")]
    TooManyCalls { max: usize },

    /// The call was neither negotiated as transferable nor remotely originated.
    #[error("call is not transferable")]
    NotTransferable,

    /// The operation is not valid in the current state.
    #[error("invalid state for {operation}: {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// No call matched the request.
    #[error("no matching call")]
    NoCall,

    /// The negotiated media or collaborator does not support the operation.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The component is already running.
    #[error("already running")]
    AlreadyRunning,

    // ── Protocol errors ──────────────────────────────────────────
    /// Authentication handshake failed.
    #[error("authentication failed: {0}")]
    Authentication(&'static str),

    /// A framed tag could not be interpreted.
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// The XML inside a tag unit could not be parsed.
    #[error("xml error: {0}")]
    Xml(String),

    /// The protocol version offered by the peer is not supported.
    #[error("unsupported api version: {0}")]
    UnsupportedVersion(String),

    /// A message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A textual value did not map to any known enum variant.
    #[error("unknown {type_name}: {value}")]
    UnknownVariant {
        type_name: &'static str,
        value: String,
    },

    /// The peer answered a command with `<{command}Fail>`.
    #[error("{command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    /// A property could not be read or written.
    #[error("setting error: {0}")]
    Setting(String),

    // ── Connection errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl VpError {
    /// Helper for building an [`VpError::InvalidState`] from any displayable state.
    pub fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        VpError::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Short reason text carried in negative VRCL acknowledgements.
    pub fn reason(&self) -> String {
        match self {
            VpError::TooManyCalls { .. } => "TooManyCalls".to_string(),
            VpError::NotTransferable => "NotTransferable".to_string(),
            VpError::NoCall => "NoCall".to_string(),
            VpError::InvalidParameter(_) => "InvalidParameter".to_string(),
            VpError::InvalidState { .. } => "InvalidState".to_string(),
            VpError::NotSupported(_) => "NotSupported".to_string(),
            other => other.to_string(),
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for VpError {
    fn from(s: String) -> Self {
        VpError::Other(s)
    }
}

impl From<&str> for VpError {
    fn from(s: &str) -> Self {
        VpError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for VpError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        VpError::ChannelClosed
    }
}

impl From<quick_xml::Error> for VpError {
    fn from(e: quick_xml::Error) -> Self {
        VpError::Xml(e.to_string())
    }
}

//! Error types for discovery, sessions and audio streaming

use thiserror::Error;

use crate::capability::Denied;
use crate::device::TransportKind;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an outbound connection attempt did not produce a link
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Permission denied: {0}")]
    PermissionDenied(Denied),

    #[error("Device unreachable: {0}")]
    DeviceUnreachable(String),

    #[error("Timed out waiting for the peer")]
    Timeout,

    #[error("Peer is busy with another session")]
    Busy,

    #[error("Peer rejected the connection")]
    Rejected,

    /// Both sides called each other at once and the peer's call won
    #[error("Peer is calling us at the same time")]
    Crossed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Transport subsystem errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Permission denied: {0}")]
    PermissionDenied(Denied),

    #[error("{kind} transport unavailable: {reason}")]
    Unavailable { kind: TransportKind, reason: String },

    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Accept failed: {0}")]
    AcceptFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Link is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Session state machine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Permission denied: {0}")]
    PermissionDenied(Denied),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("No pending connection request")]
    NoPendingRequest,

    #[error("No active session")]
    NoActiveSession,

    #[error("No peer to switch to on the {0} transport")]
    NoSwitchTarget(TransportKind),

    #[error("No peer found")]
    NoPeerFound,

    #[error("Session superseded by another connection")]
    Superseded,

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Audio(#[from] AudioError),
}

impl SessionError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            SessionError::PermissionDenied(_)
                | SessionError::Transport(TransportError::PermissionDenied(_))
                | SessionError::Transport(TransportError::Connect(ConnectError::PermissionDenied(_)))
                | SessionError::Audio(AudioError::PermissionDenied(_))
        )
    }
}

impl From<ConnectError> for SessionError {
    fn from(err: ConnectError) -> Self {
        SessionError::Transport(TransportError::Connect(err))
    }
}

/// Audio pipeline errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(Denied),

    #[error("Failed to spawn audio thread: {0}")]
    Thread(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

//! Session state, per-transport connection state and the events the
//! manager publishes

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::device::{Device, TransportKind};
use crate::error::SessionError;

/// Top-level session state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    Discovering,
    /// Outbound attempt in flight
    AwaitingPeerResponse { peer: Device },
    /// Inbound request held for an accept/reject decision
    PendingInboundDecision { requester: Device },
    Connected { session_id: Uuid, peer: Device },
    /// Old session closed, looking for the peer on the other transport
    SwitchingTransport {
        session_id: Uuid,
        from: TransportKind,
        to: TransportKind,
    },
    /// Parked until acknowledged
    Error { reason: SessionError },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Discovering => "discovering",
            SessionState::AwaitingPeerResponse { .. } => "awaiting peer response",
            SessionState::PendingInboundDecision { .. } => "pending inbound decision",
            SessionState::Connected { .. } => "connected",
            SessionState::SwitchingTransport { .. } => "switching transport",
            SessionState::Error { .. } => "error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected { .. })
    }

    /// States from which a new outbound attempt or discovery may start
    pub(crate) fn is_at_rest(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Discovering | SessionState::Error { .. }
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::AwaitingPeerResponse { peer } => write!(f, "awaiting {}", peer),
            SessionState::PendingInboundDecision { requester } => {
                write!(f, "request from {}", requester)
            }
            SessionState::Connected { peer, .. } => write!(f, "connected to {}", peer),
            SessionState::SwitchingTransport { from, to, .. } => {
                write!(f, "switching {} -> {}", from, to)
            }
            SessionState::Error { reason } => write!(f, "error: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Per-transport link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Immutable view published after every transition
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    connection: [ConnectionState; 2],
    pub discovering: bool,
    pub talking: bool,
}

impl SessionSnapshot {
    pub(crate) fn new(
        state: SessionState,
        connection: [ConnectionState; 2],
        discovering: bool,
        talking: bool,
    ) -> Self {
        Self {
            state,
            connection,
            discovering,
            talking,
        }
    }

    pub fn connection(&self, kind: TransportKind) -> ConnectionState {
        self.connection[kind.index()]
    }
}

/// Why an inbound request was turned away without asking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRejectReason {
    /// A session is active or being switched
    SessionActive,
    /// Another request is already awaiting a decision
    RequestPending,
}

/// Notifications from the session manager
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(Arc<SessionSnapshot>),
    IncomingRequest(Device),
    AutoRejected {
        requester: Device,
        reason: AutoRejectReason,
    },
    Failed(SessionError),
}

//! Session state machine and the active session handle

pub mod handle;
pub mod manager;
pub mod state;

pub use handle::{Session, SessionFault, SessionStats};
pub use manager::SessionManager;
pub use state::{AutoRejectReason, ConnectionState, SessionEvent, SessionSnapshot, SessionState};

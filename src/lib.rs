//! # Walkie Link
//!
//! Peer discovery, session negotiation and live duplex audio between two
//! devices over either a Bluetooth-style stream link or a UDP datagram
//! link, with a mid-call switch between the two.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        SessionManager (session)                      │
//! │                                                                      │
//! │   Idle ─► Discovering ─► AwaitingPeerResponse ─► Connected ◄─┐      │
//! │     ▲                                               │         │      │
//! │     └──── PendingInboundDecision ◄── inbound        ▼         │      │
//! │                                             SwitchingTransport┘      │
//! │                                                                      │
//! │  ┌────────────────────┐   ┌──────────────┐   ┌─────────────────────┐ │
//! │  │ DiscoveryAggregator│   │CapabilityGate│   │ AudioPipeline       │ │
//! │  │  (discovery)       │   │ (capability) │   │  capture ─► queue   │ │
//! │  │  roster, events    │   │  checked     │   │    ─► send thread   │ │
//! │  └─────────┬──────────┘   │  before every│   │  receive ─► playback│ │
//! │            │              │  transport   │   └──────────┬──────────┘ │
//! │            │              │  call        │              │ Session    │
//! └────────────┼──────────────┴──────────────┴──────────────┼────────────┘
//!              │                                            │
//!              ▼                                            ▼
//!  ┌────────────────────────────┐          ┌────────────────────────────┐
//!  │ StreamTransport (Bluetooth)│          │ DatagramTransport (Network)│
//!  │  reliable, ordered bytes   │          │  one UDP socket, ASCII     │
//!  │  hello + decision byte     │          │  control literals + audio  │
//!  └────────────────────────────┘          └────────────────────────────┘
//! ```

pub mod audio;
pub mod capability;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transport;

pub use capability::{CapabilityGate, OperationFamily, Permission};
pub use config::AppConfig;
pub use device::{Device, PeerStatus, TransportKind};
pub use error::{Error, Result};
pub use session::{Session, SessionEvent, SessionManager, SessionState};
pub use transport::{Transport, Transports};

/// Application-wide constants
pub mod constants {
    /// Default UDP port shared by discovery, control and audio
    pub const DEFAULT_UDP_PORT: u16 = 8888;

    /// Default TCP port of the stream transport's listener
    pub const DEFAULT_STREAM_PORT: u16 = 8889;

    /// How long the device stays discoverable once a scan starts
    pub const DISCOVERABLE_DURATION_SECS: u64 = 300;

    /// Default sample rate of captured PCM
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Default channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default capture chunk size in bytes
    pub const DEFAULT_CHUNK_SIZE: usize = 3584;

    /// Chunks buffered between capture and send
    pub const CHUNK_QUEUE_CAPACITY: usize = 256;

    /// Consecutive send failures tolerated before a session is torn down
    pub const DEFAULT_MAX_SEND_FAILURES: u32 = 8;

    /// Largest UDP payload
    pub const MAX_DATAGRAM_SIZE: usize = 65507;
}

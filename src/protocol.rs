//! Wire protocol constants
//!
//! The network transport multiplexes control and audio on one UDP socket.
//! Control datagrams are fixed ASCII literals; a datagram that is
//! byte-for-byte equal to one of them is control traffic and is never handed
//! to playback. Peers also announce their display name in a datagram of the
//! form `WALKIE_TALKIE_NAME:<utf-8 name>`, sent right after every probe,
//! probe reply and connection request. Everything else is an opaque,
//! self-contained audio chunk.
//!
//! The stream transport carries a two-step handshake before raw audio:
//!
//! ```text
//! connector -> acceptor : [name_len: u8][name: utf-8]
//! acceptor  -> connector: [decision: u8]   0x01 accept, 0x00 reject, 0x02 busy
//! ```

use uuid::Uuid;

use crate::error::ConnectError;

/// Discovery probe / response literal
pub const DISCOVERY_MARKER: &[u8] = b"WALKIE_TALKIE_DISCOVERY";

const CONNECT_MARKER: &[u8] = b"WALKIE_TALKIE_CONNECT";
const ACCEPT_MARKER: &[u8] = b"WALKIE_TALKIE_ACCEPT";
const REJECT_MARKER: &[u8] = b"WALKIE_TALKIE_REJECT";
const BUSY_MARKER: &[u8] = b"WALKIE_TALKIE_BUSY";
const HANGUP_MARKER: &[u8] = b"WALKIE_TALKIE_HANGUP";

/// Prefix of a name announcement
pub const NAME_PREFIX: &[u8] = b"WALKIE_TALKIE_NAME:";

/// Service name registered by the stream transport's listener
pub const SERVICE_NAME: &str = "WalkieTalkie";

/// Serial Port Profile service class
pub const SPP_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5F9B_34FB);

/// Longest name carried in a stream hello
pub const MAX_HELLO_NAME: usize = u8::MAX as usize;

/// Control datagrams understood by the network transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlMessage {
    Discovery,
    Connect,
    Accept,
    Reject,
    Busy,
    Hangup,
}

impl ControlMessage {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            ControlMessage::Discovery => DISCOVERY_MARKER,
            ControlMessage::Connect => CONNECT_MARKER,
            ControlMessage::Accept => ACCEPT_MARKER,
            ControlMessage::Reject => REJECT_MARKER,
            ControlMessage::Busy => BUSY_MARKER,
            ControlMessage::Hangup => HANGUP_MARKER,
        }
    }

    /// Classify a datagram. Only exact matches are control traffic.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        [
            ControlMessage::Discovery,
            ControlMessage::Connect,
            ControlMessage::Accept,
            ControlMessage::Reject,
            ControlMessage::Busy,
            ControlMessage::Hangup,
        ]
        .into_iter()
        .find(|msg| msg.as_bytes() == datagram)
    }

    /// The decision carried by a reply datagram
    pub fn decision(self) -> Option<Decision> {
        match self {
            ControlMessage::Accept => Some(Decision::Accept),
            ControlMessage::Reject => Some(Decision::Reject),
            ControlMessage::Busy => Some(Decision::Busy),
            _ => None,
        }
    }
}

/// Answer to an inbound connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Accept,
    Reject,
    /// Automatic rejection because a session or request is already active
    Busy,
}

impl Decision {
    pub fn to_byte(self) -> u8 {
        match self {
            Decision::Reject => 0x00,
            Decision::Accept => 0x01,
            Decision::Busy => 0x02,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Decision::Reject),
            0x01 => Some(Decision::Accept),
            0x02 => Some(Decision::Busy),
            _ => None,
        }
    }

    pub fn control(self) -> ControlMessage {
        match self {
            Decision::Accept => ControlMessage::Accept,
            Decision::Reject => ControlMessage::Reject,
            Decision::Busy => ControlMessage::Busy,
        }
    }

    /// What the connecting side makes of the answer
    pub fn into_result(self) -> Result<(), ConnectError> {
        match self {
            Decision::Accept => Ok(()),
            Decision::Reject => Err(ConnectError::Rejected),
            Decision::Busy => Err(ConnectError::Busy),
        }
    }
}

/// Cut `name` to at most [`MAX_HELLO_NAME`] bytes on a character boundary
fn truncate_name(name: &str) -> &str {
    let mut end = name.len().min(MAX_HELLO_NAME);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Encode the stream hello. Names longer than [`MAX_HELLO_NAME`] bytes are
/// cut at a character boundary.
pub fn encode_hello(name: &str) -> Vec<u8> {
    let name = truncate_name(name).as_bytes();

    let mut out = Vec::with_capacity(1 + name.len());
    out.push(name.len() as u8);
    out.extend_from_slice(name);
    out
}

/// Encode a datagram name announcement
pub fn encode_name_announcement(name: &str) -> Vec<u8> {
    let name = truncate_name(name).as_bytes();
    let mut out = Vec::with_capacity(NAME_PREFIX.len() + name.len());
    out.extend_from_slice(NAME_PREFIX);
    out.extend_from_slice(name);
    out
}

/// The name carried by `datagram` if it is a name announcement. Empty,
/// oversized or non-UTF-8 names are not announcements.
pub fn parse_name_announcement(datagram: &[u8]) -> Option<&str> {
    let name = datagram.strip_prefix(NAME_PREFIX)?;
    if name.is_empty() || name.len() > MAX_HELLO_NAME {
        return None;
    }
    std::str::from_utf8(name).ok()
}

//! Peer devices and the transports they are reached over

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Display name used when a transport reports no name for a peer
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// The two peer-to-peer substrates a session can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Stream-oriented short-range radio link (RFCOMM-like)
    Bluetooth,
    /// Datagram-oriented local network link (UDP / WiFi-Direct-like)
    NetworkP2P,
}

impl TransportKind {
    pub const ALL: [TransportKind; 2] = [TransportKind::Bluetooth, TransportKind::NetworkP2P];

    /// The transport a switchover moves to
    pub fn other(self) -> Self {
        match self {
            TransportKind::Bluetooth => TransportKind::NetworkP2P,
            TransportKind::NetworkP2P => TransportKind::Bluetooth,
        }
    }

    /// Whether byte order is preserved end-to-end on this transport
    pub fn is_reliable(self) -> bool {
        matches!(self, TransportKind::Bluetooth)
    }

    pub(crate) fn index(self) -> usize {
        match self {
            TransportKind::Bluetooth => 0,
            TransportKind::NetworkP2P => 1,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Bluetooth => f.write_str("bluetooth"),
            TransportKind::NetworkP2P => f.write_str("network"),
        }
    }
}

/// Peer status as reported by the network transport's peer list.
/// The Bluetooth transport has no equivalent and always reports `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Available,
    Invited,
    Connected,
    Failed,
    #[default]
    Unknown,
}

/// Roster key: addresses are only unique within one transport's namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub transport: TransportKind,
    pub address: String,
}

/// A discovered or connected peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Display name
    pub name: String,
    /// MAC for Bluetooth, `ip:port` for the network transport
    pub address: String,
    pub transport: TransportKind,
    pub status: PeerStatus,
    /// Received signal strength (dBm) when the radio reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i16>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    /// Create a device, falling back to [`UNKNOWN_DEVICE_NAME`] for a missing
    /// or blank name. Bluetooth addresses are normalized to upper case.
    pub fn new(name: Option<&str>, address: impl Into<String>, transport: TransportKind) -> Self {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(UNKNOWN_DEVICE_NAME)
            .to_string();

        let mut address = address.into().trim().to_string();
        if transport == TransportKind::Bluetooth {
            address = address.to_ascii_uppercase();
        }

        Self {
            name,
            address,
            transport,
            status: PeerStatus::Unknown,
            signal: None,
            last_seen: Utc::now(),
        }
    }

    pub fn bluetooth(name: Option<&str>, address: impl Into<String>) -> Self {
        Self::new(name, address, TransportKind::Bluetooth)
    }

    pub fn network(name: Option<&str>, address: impl Into<String>) -> Self {
        Self::new(name, address, TransportKind::NetworkP2P)
    }

    pub fn with_status(mut self, status: PeerStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_signal(mut self, signal: i16) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            transport: self.transport,
            address: self.address.clone(),
        }
    }

    /// Whether this device carries the same identity as `key`
    pub fn matches(&self, key: &DeviceKey) -> bool {
        self.transport == key.transport && self.address == key.address
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.name, self.transport, self.address)
    }
}

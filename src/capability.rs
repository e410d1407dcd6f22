//! Capability gate
//!
//! A read-only view of the permissions the host platform has granted.
//! Every transport operation family is checked here once before the
//! transport is touched; a missing identifier fails fast with a [`Denied`]
//! and no transport call is made. The gate never requests permissions and
//! has no retry logic; the platform layer updates it with [`grant`] and
//! [`revoke`] when the user changes settings.
//!
//! [`grant`]: CapabilityGate::grant
//! [`revoke`]: CapabilityGate::revoke

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::device::TransportKind;

/// Platform permission identifiers the core depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Microphone capture
    RecordAudio,
    /// Read network / WiFi state
    NetworkStateRead,
    /// Change network / WiFi state
    NetworkStateWrite,
    /// Local peer discovery on the network transport
    NearbyDevices,
    BluetoothScan,
    BluetoothConnect,
    BluetoothAdvertise,
    /// Proximity / location, required by platforms for radio scanning
    FineLocation,
}

impl Permission {
    pub const ALL: [Permission; 8] = [
        Permission::RecordAudio,
        Permission::NetworkStateRead,
        Permission::NetworkStateWrite,
        Permission::NearbyDevices,
        Permission::BluetoothScan,
        Permission::BluetoothConnect,
        Permission::BluetoothAdvertise,
        Permission::FineLocation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::RecordAudio => "record_audio",
            Permission::NetworkStateRead => "network_state_read",
            Permission::NetworkStateWrite => "network_state_write",
            Permission::NearbyDevices => "nearby_devices",
            Permission::BluetoothScan => "bluetooth_scan",
            Permission::BluetoothConnect => "bluetooth_connect",
            Permission::BluetoothAdvertise => "bluetooth_advertise",
            Permission::FineLocation => "fine_location",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Groups of transport operations that share one permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationFamily {
    Discover,
    Connect,
    Accept,
    Send,
}

impl fmt::Display for OperationFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationFamily::Discover => "discover",
            OperationFamily::Connect => "connect",
            OperationFamily::Accept => "accept",
            OperationFamily::Send => "send",
        };
        f.write_str(name)
    }
}

/// Permissions an operation family needs on a transport
pub fn required(family: OperationFamily, kind: TransportKind) -> &'static [Permission] {
    use OperationFamily::*;
    use Permission::*;

    match (family, kind) {
        (Discover, TransportKind::Bluetooth) => &[BluetoothScan, BluetoothAdvertise, FineLocation],
        (Discover, TransportKind::NetworkP2P) => {
            &[NetworkStateRead, NetworkStateWrite, NearbyDevices, FineLocation]
        }
        (Connect | Accept, TransportKind::Bluetooth) => &[BluetoothConnect],
        (Connect | Accept, TransportKind::NetworkP2P) => &[NetworkStateRead, NetworkStateWrite],
        (Send, _) => &[RecordAudio],
    }
}

/// A failed gate check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied {
    pub family: OperationFamily,
    pub transport: TransportKind,
    pub missing: Vec<Permission>,
}

impl fmt::Display for Denied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} requires ", self.family, self.transport)?;
        for (i, permission) in self.missing.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", permission)?;
        }
        Ok(())
    }
}

impl std::error::Error for Denied {}

/// Shared, mutable-by-platform set of granted permissions
#[derive(Debug)]
pub struct CapabilityGate {
    granted: RwLock<BTreeSet<Permission>>,
}

impl CapabilityGate {
    pub fn new(granted: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            granted: RwLock::new(granted.into_iter().collect()),
        }
    }

    /// Gate with every permission granted
    pub fn all_granted() -> Self {
        Self::new(Permission::ALL)
    }

    /// Gate with nothing granted
    pub fn none_granted() -> Self {
        Self::new([])
    }

    pub fn grant(&self, permission: Permission) {
        if self.granted.write().insert(permission) {
            tracing::debug!("Permission granted: {}", permission);
        }
    }

    pub fn revoke(&self, permission: Permission) {
        if self.granted.write().remove(&permission) {
            tracing::info!("Permission revoked: {}", permission);
        }
    }

    /// Replace the whole granted set
    pub fn replace(&self, granted: impl IntoIterator<Item = Permission>) {
        *self.granted.write() = granted.into_iter().collect();
    }

    pub fn is_granted(&self, permission: Permission) -> bool {
        self.granted.read().contains(&permission)
    }

    /// Check an operation family against the granted set
    pub fn check(&self, family: OperationFamily, kind: TransportKind) -> Result<(), Denied> {
        let granted = self.granted.read();
        let missing: Vec<Permission> = required(family, kind)
            .iter()
            .copied()
            .filter(|p| !granted.contains(p))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Denied {
                family,
                transport: kind,
                missing,
            })
        }
    }

    /// Currently granted permissions, sorted
    pub fn granted(&self) -> Vec<Permission> {
        self.granted.read().iter().copied().collect()
    }
}

impl Default for CapabilityGate {
    fn default() -> Self {
        Self::all_granted()
    }
}

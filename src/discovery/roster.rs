//! Device roster
//!
//! Devices in first-discovery order, unique by `(transport, address)`.

use std::sync::Arc;

use crate::device::{Device, DeviceKey, TransportKind};

/// Outcome of [`Roster::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    devices: Vec<Device>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, or refresh the entry with the same key in place.
    ///
    /// A refresh takes the latest name and status. A report without signal
    /// strength keeps the last known one.
    pub fn upsert(&mut self, device: Device) -> Upsert {
        match self
            .devices
            .iter_mut()
            .find(|d| d.transport == device.transport && d.address == device.address)
        {
            Some(existing) => {
                existing.name = device.name;
                existing.status = device.status;
                existing.last_seen = device.last_seen;
                if device.signal.is_some() {
                    existing.signal = device.signal;
                }
                Upsert::Updated
            }
            None => {
                self.devices.push(device);
                Upsert::Inserted
            }
        }
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&Device> {
        self.devices.iter().find(|d| d.matches(key))
    }

    /// First device on `kind` announcing `name`
    pub fn find_by_name(&self, kind: TransportKind, name: &str) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| d.transport == kind && d.name == name)
    }

    /// Device with the strongest signal. Devices without a reading rank
    /// below any with one; ties go to the earliest discovered.
    pub fn strongest(&self) -> Option<&Device> {
        let mut best: Option<&Device> = None;
        for device in &self.devices {
            best = match best {
                None => Some(device),
                Some(current) if device.signal > current.signal => Some(device),
                keep => keep,
            };
        }
        best
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Immutable copy for publishing
    pub fn snapshot(&self) -> Arc<[Device]> {
        Arc::from(self.devices.as_slice())
    }
}

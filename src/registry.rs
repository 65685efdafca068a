//! Device Registry
//!
//! Tracks which devices are currently connected, their declared firmware
//! digest and their user-assigned labels. Connection and disconnection are
//! driven by transport presence events, never polled. Committed labels
//! survive disconnects: lookup is by [`DeviceId`], not by connection slot,
//! so a device that reconnects keeps its name without re-running the naming
//! handshake.
//!
//! Every snapshot carries a monotonically increasing `state_id` so that a
//! consumer holding a stale snapshot can detect and discard it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{DeviceId, FirmwareDigest, PortId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device {0} is not connected")]
    NotConnected(DeviceId),
    #[error("device {0} already announced on another port")]
    AlreadyConnected(DeviceId),
}

/// Naming half of the per-device state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingState {
    /// Connected, no committed label
    Unnamed,
    /// A candidate label is staged for device-local confirmation
    Previewed(String),
    /// Label committed
    Named(String),
}

struct DeviceEntry {
    port: PortId,
    firmware_digest: FirmwareDigest,
    naming: NamingState,
}

/// Public view of one connected device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub label: Option<String>,
    pub firmware_digest: FirmwareDigest,
    pub latest_known_digest: FirmwareDigest,
}

/// Versioned snapshot of the connected device set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceListSnapshot {
    pub state_id: u64,
    pub devices: Vec<Device>,
}

/// State transitions worth telling the rest of the system about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Connected { id: DeviceId },
    NeedsName { id: DeviceId },
    NamePreviewed { id: DeviceId, name: String },
    Named { id: DeviceId, name: String },
    Disconnected { id: DeviceId },
}

/// Exclusive owner of all Device records
pub struct DeviceRegistry {
    connected: HashMap<DeviceId, DeviceEntry>,
    /// Committed labels, independent of connection lifetime
    labels: HashMap<DeviceId, String>,
    by_port: HashMap<PortId, Vec<DeviceId>>,
    /// Digest of the newest firmware the coordinator knows about
    latest_firmware: FirmwareDigest,
    state_id: u64,
}

impl DeviceRegistry {
    pub fn new(latest_firmware: FirmwareDigest) -> Self {
        DeviceRegistry {
            connected: HashMap::new(),
            labels: HashMap::new(),
            by_port: HashMap::new(),
            latest_firmware,
            state_id: 0,
        }
    }

    /// Seed committed labels loaded from persistent storage
    pub fn load_labels(&mut self, labels: impl IntoIterator<Item = (DeviceId, String)>) {
        self.labels.extend(labels);
        self.bump();
    }

    fn bump(&mut self) -> u64 {
        self.state_id += 1;
        self.state_id
    }

    /// A device announced itself on a port.
    ///
    /// Yields `Connected` plus either `Named` (label already committed from a
    /// previous connection) or `NeedsName`.
    pub fn announce(
        &mut self,
        id: DeviceId,
        port: PortId,
        firmware_digest: FirmwareDigest,
    ) -> Result<Vec<RegistryChange>, RegistryError> {
        if self.connected.contains_key(&id) {
            return Err(RegistryError::AlreadyConnected(id));
        }

        let naming = match self.labels.get(&id) {
            Some(label) => NamingState::Named(label.clone()),
            None => NamingState::Unnamed,
        };
        let mut changes = vec![RegistryChange::Connected { id }];
        match &naming {
            NamingState::Named(name) => {
                changes.push(RegistryChange::Named {
                    id,
                    name: name.clone(),
                });
            }
            _ => changes.push(RegistryChange::NeedsName { id }),
        }

        self.connected.insert(
            id,
            DeviceEntry {
                port: port.clone(),
                firmware_digest,
                naming,
            },
        );
        self.by_port.entry(port.clone()).or_default().push(id);
        self.bump();
        info!(device = %id, %port, "device announced");
        Ok(changes)
    }

    /// Stage a candidate label without committing it
    pub fn update_name_preview(
        &mut self,
        id: DeviceId,
        name: &str,
    ) -> Result<RegistryChange, RegistryError> {
        let entry = self
            .connected
            .get_mut(&id)
            .ok_or(RegistryError::NotConnected(id))?;
        entry.naming = NamingState::Previewed(name.to_string());
        self.bump();
        debug!(device = %id, name, "name preview staged");
        Ok(RegistryChange::NamePreviewed {
            id,
            name: name.to_string(),
        })
    }

    /// Commit a label; it survives disconnects from here on
    pub fn finish_naming(
        &mut self,
        id: DeviceId,
        name: &str,
    ) -> Result<RegistryChange, RegistryError> {
        let entry = self
            .connected
            .get_mut(&id)
            .ok_or(RegistryError::NotConnected(id))?;
        entry.naming = NamingState::Named(name.to_string());
        self.labels.insert(id, name.to_string());
        self.bump();
        info!(device = %id, name, "device named");
        Ok(RegistryChange::Named {
            id,
            name: name.to_string(),
        })
    }

    /// A port went away; evict every device that announced on it
    pub fn disconnect_port(&mut self, port: &PortId) -> Vec<RegistryChange> {
        let ids = self.by_port.remove(port).unwrap_or_default();
        let mut changes = Vec::new();
        for id in ids {
            if self.connected.remove(&id).is_some() {
                info!(device = %id, %port, "device disconnected");
                changes.push(RegistryChange::Disconnected { id });
            }
        }
        if !changes.is_empty() {
            self.bump();
        }
        changes
    }

    pub fn is_connected(&self, id: &DeviceId) -> bool {
        self.connected.contains_key(id)
    }

    pub fn connected_devices(&self) -> BTreeSet<DeviceId> {
        self.connected.keys().copied().collect()
    }

    pub fn port_of(&self, id: &DeviceId) -> Option<&PortId> {
        self.connected.get(id).map(|e| &e.port)
    }

    pub fn committed_label(&self, id: &DeviceId) -> Option<&str> {
        self.labels.get(id).map(String::as_str)
    }

    pub fn naming_state(&self, id: &DeviceId) -> Option<&NamingState> {
        self.connected.get(id).map(|e| &e.naming)
    }

    /// Connected devices whose announced firmware lags the latest known digest
    pub fn devices_needing_upgrade(&self) -> BTreeSet<DeviceId> {
        self.connected
            .iter()
            .filter(|(_, e)| e.firmware_digest != self.latest_firmware)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn state_id(&self) -> u64 {
        self.state_id
    }

    /// Consistent, versioned view of the connected set
    pub fn snapshot(&self) -> DeviceListSnapshot {
        let mut devices: Vec<Device> = self
            .connected
            .iter()
            .map(|(id, entry)| Device {
                id: *id,
                label: match &entry.naming {
                    NamingState::Named(name) => Some(name.clone()),
                    _ => None,
                },
                firmware_digest: entry.firmware_digest,
                latest_known_digest: self.latest_firmware,
            })
            .collect();
        devices.sort_by_key(|d| d.id);
        DeviceListSnapshot {
            state_id: self.state_id,
            devices,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(n: u8) -> DeviceId {
        DeviceId([n; 33])
    }

    fn digest(n: u8) -> FirmwareDigest {
        FirmwareDigest([n; 32])
    }

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(digest(0xff))
    }

    #[test]
    fn test_announce_then_name_then_reconnect_keeps_label() {
        let mut reg = registry();
        let a = device(1);
        let port = PortId::from("ttyA");

        let changes = reg.announce(a, port.clone(), digest(1)).unwrap();
        assert!(changes.contains(&RegistryChange::NeedsName { id: a }));

        reg.update_name_preview(a, "Alice").unwrap();
        assert_eq!(
            reg.naming_state(&a),
            Some(&NamingState::Previewed("Alice".into()))
        );
        reg.finish_naming(a, "Alice").unwrap();

        // disconnect evicts the record but not the committed label
        let changes = reg.disconnect_port(&port);
        assert_eq!(changes, vec![RegistryChange::Disconnected { id: a }]);
        assert!(!reg.is_connected(&a));
        assert_eq!(reg.committed_label(&a), Some("Alice"));

        // reconnect: Named without re-running the handshake
        let changes = reg.announce(a, port, digest(1)).unwrap();
        assert!(changes.contains(&RegistryChange::Named {
            id: a,
            name: "Alice".into()
        }));
        assert_eq!(reg.snapshot().devices[0].label, Some("Alice".into()));
    }

    #[test]
    fn test_state_id_increases_on_every_change() {
        let mut reg = registry();
        let before = reg.state_id();
        reg.announce(device(1), PortId::from("ttyA"), digest(1))
            .unwrap();
        let after_announce = reg.state_id();
        assert!(after_announce > before);

        reg.finish_naming(device(1), "one").unwrap();
        assert!(reg.state_id() > after_announce);

        // snapshot carries the current version
        assert_eq!(reg.snapshot().state_id, reg.state_id());
    }

    #[test]
    fn test_naming_requires_connection() {
        let mut reg = registry();
        assert_eq!(
            reg.update_name_preview(device(9), "ghost"),
            Err(RegistryError::NotConnected(device(9)))
        );
    }

    #[test]
    fn test_port_disconnect_evicts_all_devices_on_port() {
        let mut reg = registry();
        let port = PortId::from("ttyA");
        // daisy-chained devices share one port
        reg.announce(device(1), port.clone(), digest(1)).unwrap();
        reg.announce(device(2), port.clone(), digest(1)).unwrap();
        reg.announce(device(3), PortId::from("ttyB"), digest(1))
            .unwrap();

        let changes = reg.disconnect_port(&port);
        assert_eq!(changes.len(), 2);
        assert_eq!(reg.connected_devices(), [device(3)].into());
    }

    #[test]
    fn test_devices_needing_upgrade() {
        let mut reg = registry();
        reg.announce(device(1), PortId::from("a"), digest(0xff))
            .unwrap();
        reg.announce(device(2), PortId::from("b"), digest(0x01))
            .unwrap();
        assert_eq!(reg.devices_needing_upgrade(), [device(2)].into());
    }
}

//! Key Store
//!
//! Exclusive owner of completed threshold keys and of the per-device nonce
//! inventories. Keys are immutable once registered; only their display name
//! can change. Nonces follow a strict reserve / consume / release discipline
//! so that one can never be spent by two signing sessions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{DeviceId, FrostKey, KeyId, SessionId};

/// Default inventory level below which replenishment is requested
pub const DEFAULT_NONCE_LOW_WATER: usize = 8;
/// Default inventory level replenishment tops up to
pub const DEFAULT_NONCE_TARGET: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyStoreError {
    #[error("key {0} already exists")]
    KeyExists(KeyId),
    #[error("no key with id {0}")]
    UnknownKey(KeyId),
    #[error("device {0} has no signing nonces left")]
    NonceExhausted(DeviceId),
    #[error("device {0} has nonce reservations in flight")]
    ReplenishBusy(DeviceId),
    #[error("device {0} is not replenishing")]
    NotReplenishing(DeviceId),
}

/// One pre-committed signing nonce
///
/// The index is monotone per device and never reused, which is what makes
/// nonce reuse detectable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceCommitment {
    pub index: u64,
    pub commitment: Vec<u8>,
}

#[derive(Debug, Default)]
struct NonceInventory {
    available: VecDeque<NonceCommitment>,
    /// Next index to assign to an incoming commitment
    next_index: u64,
    /// Total nonces ever consumed, persisted as the device's nonce counter
    consumed: u64,
}

/// Keys and nonce inventories
pub struct KeyStore {
    keys: BTreeMap<KeyId, FrostKey>,
    inventories: HashMap<DeviceId, NonceInventory>,
    /// Nonces pulled out of inventories for a signing session, returned on
    /// cancel, dropped on completion
    reservations: HashMap<SessionId, Vec<(DeviceId, NonceCommitment)>>,
    /// Devices currently minting fresh nonces; single writer per inventory
    replenishing: HashSet<DeviceId>,
    low_water: usize,
    target: usize,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::with_watermarks(DEFAULT_NONCE_LOW_WATER, DEFAULT_NONCE_TARGET)
    }

    pub fn with_watermarks(low_water: usize, target: usize) -> Self {
        KeyStore {
            keys: BTreeMap::new(),
            inventories: HashMap::new(),
            reservations: HashMap::new(),
            replenishing: HashSet::new(),
            low_water,
            target,
        }
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    /// Insert the immutable key produced by a successful keygen session
    pub fn register_key(&mut self, key: FrostKey) -> Result<(), KeyStoreError> {
        if self.keys.contains_key(&key.key_id) {
            return Err(KeyStoreError::KeyExists(key.key_id));
        }
        info!(key = %key.key_id, threshold = key.threshold, participants = key.participants.len(), "registered key");
        self.keys.insert(key.key_id, key);
        Ok(())
    }

    pub fn get_key(&self, key_id: &KeyId) -> Result<&FrostKey, KeyStoreError> {
        self.keys
            .get(key_id)
            .ok_or(KeyStoreError::UnknownKey(*key_id))
    }

    /// Rename display metadata only; the key itself never changes
    pub fn rename_key(&mut self, key_id: &KeyId, name: &str) -> Result<(), KeyStoreError> {
        let key = self
            .keys
            .get_mut(key_id)
            .ok_or(KeyStoreError::UnknownKey(*key_id))?;
        key.display_name = name.to_string();
        Ok(())
    }

    pub fn keys_snapshot(&self) -> Vec<FrostKey> {
        self.keys.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Nonce inventories
    // ------------------------------------------------------------------

    /// Append fresh commitments from a device's nonce batch
    pub fn add_nonces(&mut self, device: DeviceId, commitments: Vec<Vec<u8>>) {
        let inventory = self.inventories.entry(device).or_default();
        for commitment in commitments {
            let index = inventory.next_index;
            inventory.next_index += 1;
            inventory.available.push_back(NonceCommitment { index, commitment });
        }
        debug!(device = %device, available = inventory.available.len(), "nonce inventory updated");
    }

    pub fn nonces_available(&self, device: &DeviceId) -> usize {
        self.inventories
            .get(device)
            .map(|i| i.available.len())
            .unwrap_or(0)
    }

    /// Persisted consumed-nonce counter for a device
    pub fn nonce_counter(&self, device: &DeviceId) -> u64 {
        self.inventories.get(device).map(|i| i.consumed).unwrap_or(0)
    }

    /// Restore a device's counter from persistent storage
    pub fn restore_nonce_counter(&mut self, device: DeviceId, counter: u64) {
        let inventory = self.inventories.entry(device).or_default();
        inventory.consumed = counter;
        inventory.next_index = inventory.next_index.max(counter);
    }

    /// Reserve one nonce per participant, all-or-nothing.
    ///
    /// Fails fast with `NonceExhausted` naming the first depleted device
    /// rather than stalling a session that could never finalize.
    pub fn reserve_nonces(
        &mut self,
        session: SessionId,
        participants: &BTreeSet<DeviceId>,
    ) -> Result<BTreeMap<DeviceId, NonceCommitment>, KeyStoreError> {
        for device in participants {
            if self.nonces_available(device) == 0 {
                return Err(KeyStoreError::NonceExhausted(*device));
            }
        }

        let mut reserved = BTreeMap::new();
        let entry = self.reservations.entry(session).or_default();
        for device in participants {
            let inventory = self
                .inventories
                .get_mut(device)
                .expect("checked above");
            let nonce = inventory.available.pop_front().expect("checked above");
            entry.push((*device, nonce.clone()));
            reserved.insert(*device, nonce);
        }
        debug!(%session, count = reserved.len(), "reserved nonces");
        Ok(reserved)
    }

    /// Re-establish a reservation from a persisted session description.
    ///
    /// The nonces were pulled from inventories before the restart, so this
    /// only records the reservation; inventories are untouched.
    pub fn restore_reservation(
        &mut self,
        session: SessionId,
        nonces: impl IntoIterator<Item = (DeviceId, NonceCommitment)>,
    ) {
        let entry = self.reservations.entry(session).or_default();
        entry.extend(nonces);
        debug!(%session, count = entry.len(), "restored nonce reservation");
    }

    /// Return a cancelled session's nonces to their inventories
    pub fn release_session(&mut self, session: &SessionId) -> usize {
        let reserved = self.reservations.remove(session).unwrap_or_default();
        let count = reserved.len();
        for (device, nonce) in reserved {
            // back to the front so ordering stays roughly stable
            self.inventories
                .entry(device)
                .or_default()
                .available
                .push_front(nonce);
        }
        if count > 0 {
            debug!(%session, count, "released reserved nonces");
        }
        count
    }

    /// Permanently consume a completed session's nonces
    pub fn consume_session(&mut self, session: &SessionId) -> usize {
        let reserved = self.reservations.remove(session).unwrap_or_default();
        let count = reserved.len();
        for (device, _) in &reserved {
            self.inventories.entry(*device).or_default().consumed += 1;
        }
        if count > 0 {
            debug!(%session, count, "consumed nonces");
        }
        count
    }

    fn has_reservation(&self, device: &DeviceId) -> bool {
        self.reservations
            .values()
            .any(|nonces| nonces.iter().any(|(d, _)| d == device))
    }

    /// Whether inventory has fallen under the low-water mark
    pub fn needs_replenishment(&self, device: &DeviceId) -> bool {
        self.nonces_available(device) < self.low_water && !self.replenishing.contains(device)
    }

    /// Start a replenishment round for a device.
    ///
    /// Refused while the device has reservations in flight: the inventory has
    /// a single writer at a time.
    pub fn begin_replenish(&mut self, device: DeviceId) -> Result<u32, KeyStoreError> {
        if self.has_reservation(&device) {
            return Err(KeyStoreError::ReplenishBusy(device));
        }
        if !self.replenishing.insert(device) {
            return Err(KeyStoreError::ReplenishBusy(device));
        }
        let want = self.target.saturating_sub(self.nonces_available(&device));
        Ok(want as u32)
    }

    /// Complete a replenishment round with the device's fresh batch
    pub fn finish_replenish(
        &mut self,
        device: DeviceId,
        commitments: Vec<Vec<u8>>,
    ) -> Result<(), KeyStoreError> {
        if !self.replenishing.remove(&device) {
            warn!(device = %device, "unsolicited nonce batch");
            return Err(KeyStoreError::NotReplenishing(device));
        }
        self.add_nonces(device, commitments);
        Ok(())
    }

    pub fn abort_replenish(&mut self, device: &DeviceId) {
        self.replenishing.remove(device);
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

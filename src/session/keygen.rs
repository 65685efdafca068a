//! Key Generation Session
//!
//! Distributed key generation over every named participant. Unlike signing,
//! keygen has no quorum shortcut: all participants must contribute a share
//! and then acknowledge the resulting session digest, which is the value
//! each device shows on its screen for the user to compare.

use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::{ProtocolError, SessionStatus};
use crate::transport::wire::CoordinatorToDevice;
use crate::types::{validate_participants, DeviceId, FrostKey, SessionId};

/// What applying one keygen message did to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeygenOutcome {
    /// Share counted, more participants still owe theirs
    Accepted,
    /// Idempotent redelivery
    Duplicate,
    /// Every share is in; devices must now ack this digest
    AwaitingAcks([u8; 32]),
    /// Ack counted, more outstanding
    Acked,
    /// All acks in; the finished key
    KeyReady(FrostKey),
}

pub struct KeyGenSession {
    session_id: SessionId,
    threshold: u16,
    key_name: String,
    participants: BTreeSet<DeviceId>,
    /// Digest over the announced parameters; devices echo it with each share
    /// so contributions to a superseded announcement are detectable
    params_digest: [u8; 32],
    shares: BTreeMap<DeviceId, Vec<u8>>,
    acks: BTreeSet<DeviceId>,
    /// Digest over parameters plus all shares, fixed once collection is done
    session_digest: Option<[u8; 32]>,
    status: SessionStatus,
    result: Option<FrostKey>,
}

impl KeyGenSession {
    pub fn new(
        threshold: u16,
        devices: &[DeviceId],
        key_name: String,
    ) -> Result<Self, ProtocolError> {
        let participants = validate_participants(threshold, devices)?;
        let session_id = SessionId::random();
        let params_digest = Self::params_digest(session_id, threshold, &participants, &key_name);
        info!(
            session = %session_id,
            threshold,
            participants = participants.len(),
            key_name,
            "keygen session announced"
        );
        Ok(KeyGenSession {
            session_id,
            threshold,
            key_name,
            participants,
            params_digest,
            shares: BTreeMap::new(),
            acks: BTreeSet::new(),
            session_digest: None,
            status: SessionStatus::Announced,
            result: None,
        })
    }

    fn params_digest(
        session_id: SessionId,
        threshold: u16,
        participants: &BTreeSet<DeviceId>,
        key_name: &str,
    ) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"frost-coordinator/keygen-params");
        hasher.update(session_id.to_string().as_bytes());
        hasher.update(threshold.to_le_bytes());
        for device in participants {
            hasher.update(device.as_bytes());
        }
        hasher.update(key_name.as_bytes());
        hasher.finalize().into()
    }

    /// Opaque group public material derived from the ordered contributions
    fn public_material(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(b"frost-coordinator/group-material");
        hasher.update(self.params_digest);
        for (device, share) in &self.shares {
            hasher.update(device.as_bytes());
            hasher.update((share.len() as u32).to_le_bytes());
            hasher.update(share);
        }
        hasher.finalize().to_vec()
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn result(&self) -> Option<&FrostKey> {
        self.result.as_ref()
    }

    pub fn announce_digest(&self) -> [u8; 32] {
        self.params_digest
    }

    /// Fixed once every share is in; `None` while still collecting
    pub fn session_digest(&self) -> Option<[u8; 32]> {
        self.session_digest
    }

    pub fn participants(&self) -> &BTreeSet<DeviceId> {
        &self.participants
    }

    pub fn pending_shares(&self) -> BTreeSet<DeviceId> {
        self.participants
            .iter()
            .filter(|d| !self.shares.contains_key(*d))
            .copied()
            .collect()
    }

    pub fn announce_messages(&self) -> Vec<(DeviceId, CoordinatorToDevice)> {
        let message = CoordinatorToDevice::StartKeygen {
            session_id: self.session_id,
            threshold: self.threshold,
            participants: self.participants.iter().copied().collect(),
            key_name: self.key_name.clone(),
            params_digest: self.params_digest,
        };
        self.participants
            .iter()
            .map(|d| (*d, message.clone()))
            .collect()
    }

    /// Apply one participant's share.
    ///
    /// Keygen needs every participant, so an empty or mangled share does not
    /// discard the device; it just has to send a usable one.
    pub fn apply_share(
        &mut self,
        from: DeviceId,
        session: SessionId,
        echoed_digest: [u8; 32],
        share: Vec<u8>,
    ) -> Result<KeygenOutcome, ProtocolError> {
        if self.status.is_terminal() {
            return Err(ProtocolError::NotCollecting(self.status));
        }
        if session != self.session_id {
            return Err(ProtocolError::StaleContribution {
                expected: self.session_id,
                got: session,
            });
        }
        if echoed_digest != self.params_digest {
            return Err(ProtocolError::TaskDigestMismatch(from));
        }
        if !self.participants.contains(&from) {
            return Err(ProtocolError::NotAParticipant(from));
        }
        if self.session_digest.is_some() {
            // collection already closed, the digest is fixed
            return Err(ProtocolError::NotCollecting(self.status));
        }
        if share.is_empty() {
            warn!(session = %self.session_id, device = %from, "empty keygen share ignored");
            return Err(ProtocolError::MalformedContribution(from));
        }
        if let Some(existing) = self.shares.get(&from) {
            if *existing == share {
                return Ok(KeygenOutcome::Duplicate);
            }
            return Err(ProtocolError::ConflictingContribution(from));
        }

        if self.status == SessionStatus::Announced {
            self.transition(SessionStatus::Collecting);
        }
        self.shares.insert(from, share);
        debug!(
            session = %self.session_id,
            device = %from,
            got = self.shares.len(),
            need = self.participants.len(),
            "keygen share collected"
        );

        if self.shares.len() < self.participants.len() {
            return Ok(KeygenOutcome::Accepted);
        }

        // all shares in; fix the digest devices must confirm on-screen
        let mut hasher = Sha256::new();
        hasher.update(b"frost-coordinator/keygen-session");
        hasher.update(self.params_digest);
        hasher.update(self.public_material());
        let digest: [u8; 32] = hasher.finalize().into();
        self.session_digest = Some(digest);
        self.transition(SessionStatus::Finalizing);
        Ok(KeygenOutcome::AwaitingAcks(digest))
    }

    /// Apply one participant's on-device confirmation of the session digest
    pub fn apply_ack(
        &mut self,
        from: DeviceId,
        session: SessionId,
        digest: [u8; 32],
    ) -> Result<KeygenOutcome, ProtocolError> {
        if self.status.is_terminal() {
            return Err(ProtocolError::NotCollecting(self.status));
        }
        if session != self.session_id {
            return Err(ProtocolError::StaleContribution {
                expected: self.session_id,
                got: session,
            });
        }
        let expected = match self.session_digest {
            Some(d) => d,
            // acks before all shares are in are out of order
            None => return Err(ProtocolError::NotCollecting(self.status)),
        };
        if digest != expected {
            return Err(ProtocolError::TaskDigestMismatch(from));
        }
        if !self.participants.contains(&from) {
            return Err(ProtocolError::NotAParticipant(from));
        }
        if !self.acks.insert(from) {
            return Ok(KeygenOutcome::Duplicate);
        }
        debug!(
            session = %self.session_id,
            device = %from,
            acks = self.acks.len(),
            need = self.participants.len(),
            "keygen digest acknowledged"
        );

        if self.acks.len() < self.participants.len() {
            return Ok(KeygenOutcome::Acked);
        }

        let key = FrostKey::new(
            self.threshold,
            self.participants.clone(),
            self.public_material(),
            self.key_name.clone(),
        )?;
        info!(session = %self.session_id, key = %key.key_id, "keygen complete");
        self.result = Some(key.clone());
        self.transition(SessionStatus::Complete);
        Ok(KeygenOutcome::KeyReady(key))
    }

    /// Cancel the session; returns the devices that should be told
    pub fn cancel(&mut self) -> BTreeSet<DeviceId> {
        if self.status.is_terminal() {
            return BTreeSet::new();
        }
        self.transition(SessionStatus::Cancelled);
        self.participants.clone()
    }

    fn transition(&mut self, to: SessionStatus) {
        if self.status != to {
            debug!(session = %self.session_id, from = %self.status, to = %to, "keygen transition");
            self.status = to;
        }
    }
}

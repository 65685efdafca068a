//! Session Layer
//!
//! Multi-round device protocols: key generation, signing and firmware
//! upgrade. Each protocol is its own state machine; [`SessionCoordinator`]
//! multiplexes them, routes device messages to the right one and settles
//! nonce reservations when a signing session reaches a terminal state.
//!
//! At most one session per protocol class is active. Starting a new one
//! supersedes the old: the previous session is cancelled, its participants
//! are notified and, for signing, its nonces go back to the inventory.

mod firmware;
mod keygen;
mod signing;

pub use firmware::{FirmwareUpgradeSession, UpgradeOutcome, FIRMWARE_CHUNK_LEN};
pub use keygen::{KeyGenSession, KeygenOutcome};
pub use signing::{PersistedSigning, ShareOutcome, SigningSession, SigningSnapshot};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};

use crate::frost::{CombineError, ShareCombiner};
use crate::keystore::{KeyStore, KeyStoreError};
use crate::transport::wire::{CoordinatorToDevice, DeviceToCoordinator};
use crate::types::{DeviceId, FrostKey, KeyId, SessionId, SignTask, ValidationError};

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("no active {0} session")]
    NoActiveSession(&'static str),
    #[error("contribution for session {got}, active session is {expected}")]
    StaleContribution { expected: SessionId, got: SessionId },
    #[error("digest mismatch in contribution from {0}")]
    TaskDigestMismatch(DeviceId),
    #[error("device {0} is not part of this session")]
    NotAParticipant(DeviceId),
    #[error("device {0} already had its contribution discarded")]
    AlreadyDiscarded(DeviceId),
    #[error("device {0} sent conflicting contributions")]
    ConflictingContribution(DeviceId),
    #[error("malformed contribution from {0}")]
    MalformedContribution(DeviceId),
    #[error("session is {0} and not accepting contributions")]
    NotCollecting(SessionStatus),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
    #[error(transparent)]
    Combine(#[from] CombineError),
}

/// Lifecycle of one session; Idle is represented by no session at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Announced,
    Collecting,
    Finalizing,
    Complete,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Complete | SessionStatus::Cancelled | SessionStatus::Failed
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Announced => "announced",
            SessionStatus::Collecting => "collecting",
            SessionStatus::Finalizing => "finalizing",
            SessionStatus::Complete => "complete",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where a downstream message should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Device(DeviceId),
    Devices(BTreeSet<DeviceId>),
}

/// One message the transport layer must deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: Destination,
    pub message: CoordinatorToDevice,
}

impl Outgoing {
    fn to_device(device: DeviceId, message: CoordinatorToDevice) -> Self {
        Outgoing {
            to: Destination::Device(device),
            message,
        }
    }

    fn to_devices(devices: BTreeSet<DeviceId>, message: CoordinatorToDevice) -> Self {
        Outgoing {
            to: Destination::Devices(devices),
            message,
        }
    }
}

/// Observable protocol progress, published on the event bus
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Signing(SigningSnapshot),
    Keygen {
        session_id: SessionId,
        status: SessionStatus,
        got: usize,
        need: usize,
    },
    UpgradeProgress {
        session_id: SessionId,
        progress: f32,
    },
    KeyGenerated(FrostKey),
    SignatureReady {
        session_id: SessionId,
        key_id: KeyId,
        signature: Vec<u8>,
    },
}

/// Multiplexer over the per-protocol state machines
#[derive(Default)]
pub struct SessionCoordinator {
    signing: Option<SigningSession>,
    keygen: Option<KeyGenSession>,
    upgrade: Option<FirmwareUpgradeSession>,
}

impl SessionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signing_snapshot(&self) -> Option<SigningSnapshot> {
        self.signing.as_ref().map(|s| s.snapshot())
    }

    pub fn active_signing(&self) -> Option<&SigningSession> {
        self.signing.as_ref().filter(|s| !s.status().is_terminal())
    }

    // ------------------------------------------------------------------
    // Starting and cancelling sessions
    // ------------------------------------------------------------------

    /// Announce a keygen session, superseding any active one
    pub fn start_keygen(
        &mut self,
        threshold: u16,
        devices: &[DeviceId],
        key_name: String,
    ) -> Result<(SessionId, Vec<Outgoing>), ProtocolError> {
        let mut outgoing = self.cancel_keygen();
        let session = KeyGenSession::new(threshold, devices, key_name)?;
        let session_id = session.session_id();
        for (device, message) in session.announce_messages() {
            outgoing.push(Outgoing::to_device(device, message));
        }
        self.keygen = Some(session);
        Ok((session_id, outgoing))
    }

    /// Announce a signing session, superseding any active one.
    ///
    /// Nonces for the signer set are reserved here, all-or-nothing, before
    /// any device hears about the session.
    pub fn start_signing(
        &mut self,
        key: &FrostKey,
        task: SignTask,
        signers: BTreeSet<DeviceId>,
        keystore: &mut KeyStore,
    ) -> Result<(SessionId, Vec<Outgoing>), ProtocolError> {
        let mut outgoing = self.cancel_signing(keystore);
        let session_id = SessionId::random();
        // session id is fixed before reservation so release can find it
        let commitments = keystore.reserve_nonces(session_id, &signers)?;
        let session = match SigningSession::new_with_id(session_id, key, task, signers, commitments)
        {
            Ok(session) => session,
            Err(e) => {
                // a rejected signer set gives its reservation straight back
                keystore.release_session(&session_id);
                return Err(e);
            }
        };
        for (device, message) in session.announce_messages() {
            outgoing.push(Outgoing::to_device(device, message));
        }
        self.signing = Some(session);
        Ok((session_id, outgoing))
    }

    /// Announce a firmware upgrade, superseding any active one
    pub fn start_upgrade(
        &mut self,
        image: Vec<u8>,
        targets: BTreeSet<DeviceId>,
    ) -> Result<(SessionId, Vec<Outgoing>), ProtocolError> {
        let mut outgoing = self.cancel_upgrade();
        let session = FirmwareUpgradeSession::new(image, targets)?;
        let session_id = session.session_id();
        for (device, message) in session.announce_messages() {
            outgoing.push(Outgoing::to_device(device, message));
        }
        self.upgrade = Some(session);
        Ok((session_id, outgoing))
    }

    /// Resume a persisted signing session after a restart.
    ///
    /// Idempotent with respect to devices that already contributed: only the
    /// devices still owing a share are re-announced, and their reservations
    /// are re-established from the persisted commitments.
    pub fn restore_signing(
        &mut self,
        record: PersistedSigning,
        key: &FrostKey,
        keystore: &mut KeyStore,
    ) -> Result<(SessionId, Vec<Outgoing>), ProtocolError> {
        let mut outgoing = self.cancel_signing(keystore);
        keystore.restore_reservation(
            record.session_id,
            record.commitments.iter().map(|(d, n)| (*d, n.clone())),
        );
        let session = SigningSession::from_persisted(record, key)?;
        let session_id = session.session_id();
        for (device, message) in session.announce_messages() {
            outgoing.push(Outgoing::to_device(device, message));
        }
        self.signing = Some(session);
        Ok((session_id, outgoing))
    }

    /// Cancel the active signing session and return its nonces
    pub fn cancel_signing(&mut self, keystore: &mut KeyStore) -> Vec<Outgoing> {
        let Some(session) = self.signing.as_mut() else {
            return Vec::new();
        };
        let notified = session.cancel();
        if notified.is_empty() {
            return Vec::new();
        }
        let released = keystore.release_session(&session.session_id());
        info!(session = %session.session_id(), released, "signing session cancelled");
        vec![Outgoing::to_devices(notified, CoordinatorToDevice::Cancel)]
    }

    pub fn cancel_keygen(&mut self) -> Vec<Outgoing> {
        let Some(session) = self.keygen.as_mut() else {
            return Vec::new();
        };
        let notified = session.cancel();
        if notified.is_empty() {
            return Vec::new();
        }
        info!(session = %session.session_id(), "keygen session cancelled");
        vec![Outgoing::to_devices(notified, CoordinatorToDevice::Cancel)]
    }

    pub fn cancel_upgrade(&mut self) -> Vec<Outgoing> {
        let Some(session) = self.upgrade.as_mut() else {
            return Vec::new();
        };
        let notified = session.cancel();
        if notified.is_empty() {
            return Vec::new();
        }
        info!(session = %session.session_id(), "upgrade session cancelled");
        vec![Outgoing::to_devices(notified, CoordinatorToDevice::Cancel)]
    }

    /// Cancel everything, for shutdown or a global user abort
    pub fn cancel_all(&mut self, keystore: &mut KeyStore) -> Vec<Outgoing> {
        let mut outgoing = self.cancel_signing(keystore);
        outgoing.extend(self.cancel_keygen());
        outgoing.extend(self.cancel_upgrade());
        outgoing
    }

    // ------------------------------------------------------------------
    // Incoming protocol messages
    // ------------------------------------------------------------------

    /// Route one protocol message to its session.
    ///
    /// Transport-level messages (announce, naming, nonce batches) are not
    /// session business and return nothing.
    pub fn handle_message(
        &mut self,
        message: &DeviceToCoordinator,
        keystore: &mut KeyStore,
        combiner: &dyn ShareCombiner,
    ) -> Result<(Vec<Outgoing>, Vec<SessionEvent>), ProtocolError> {
        match message {
            DeviceToCoordinator::KeygenShare {
                device_id,
                session_id,
                session_digest,
                share,
            } => self.on_keygen_share(*device_id, *session_id, *session_digest, share.clone()),
            DeviceToCoordinator::KeygenAck {
                device_id,
                session_id,
                session_digest,
            } => self.on_keygen_ack(*device_id, *session_id, *session_digest, keystore),
            DeviceToCoordinator::SignatureShare {
                device_id,
                session_id,
                task_digest,
                share,
            } => self.on_signature_share(
                *device_id,
                *session_id,
                *task_digest,
                share.clone(),
                keystore,
                combiner,
            ),
            DeviceToCoordinator::UpgradeAck { device_id, digest } => {
                self.on_upgrade_ack(*device_id, *digest)
            }
            _ => Ok((Vec::new(), Vec::new())),
        }
    }

    fn on_keygen_share(
        &mut self,
        from: DeviceId,
        session_id: SessionId,
        digest: [u8; 32],
        share: Vec<u8>,
    ) -> Result<(Vec<Outgoing>, Vec<SessionEvent>), ProtocolError> {
        let session = self
            .keygen
            .as_mut()
            .ok_or(ProtocolError::NoActiveSession("keygen"))?;
        let outcome = session.apply_share(from, session_id, digest, share)?;
        let mut outgoing = Vec::new();
        let events = vec![SessionEvent::Keygen {
            session_id: session.session_id(),
            status: session.status(),
            got: session.participants().len() - session.pending_shares().len(),
            need: session.participants().len(),
        }];
        if let KeygenOutcome::AwaitingAcks(session_digest) = outcome {
            outgoing.push(Outgoing::to_devices(
                session.participants().clone(),
                CoordinatorToDevice::FinishKeygen {
                    session_id: session.session_id(),
                    session_digest,
                },
            ));
        }
        Ok((outgoing, events))
    }

    fn on_keygen_ack(
        &mut self,
        from: DeviceId,
        session_id: SessionId,
        digest: [u8; 32],
        keystore: &mut KeyStore,
    ) -> Result<(Vec<Outgoing>, Vec<SessionEvent>), ProtocolError> {
        let session = self
            .keygen
            .as_mut()
            .ok_or(ProtocolError::NoActiveSession("keygen"))?;
        let outcome = session.apply_ack(from, session_id, digest)?;
        let mut events = vec![SessionEvent::Keygen {
            session_id: session.session_id(),
            status: session.status(),
            got: session.participants().len() - session.pending_shares().len(),
            need: session.participants().len(),
        }];
        if let KeygenOutcome::KeyReady(key) = outcome {
            keystore.register_key(key.clone())?;
            events.push(SessionEvent::KeyGenerated(key));
        }
        Ok((Vec::new(), events))
    }

    fn on_signature_share(
        &mut self,
        from: DeviceId,
        session_id: SessionId,
        task_digest: [u8; 32],
        share: Vec<u8>,
        keystore: &mut KeyStore,
        combiner: &dyn ShareCombiner,
    ) -> Result<(Vec<Outgoing>, Vec<SessionEvent>), ProtocolError> {
        let session = self
            .signing
            .as_mut()
            .ok_or(ProtocolError::NoActiveSession("signing"))?;
        let key = keystore.get_key(&session.key_id())?.clone();
        let outcome = session.apply_share(from, session_id, task_digest, share, &key, combiner)?;

        let mut events = vec![SessionEvent::Signing(session.snapshot())];
        match outcome {
            ShareOutcome::Finalized(signature) => {
                // nonces used by this session are spent for good
                keystore.consume_session(&session.session_id());
                events.push(SessionEvent::SignatureReady {
                    session_id: session.session_id(),
                    key_id: session.key_id(),
                    signature,
                });
            }
            ShareOutcome::Failed => {
                // devices that signed already burned their nonces
                keystore.consume_session(&session.session_id());
                warn!(session = %session.session_id(), "signing session failed");
            }
            _ => {}
        }
        Ok((Vec::new(), events))
    }

    fn on_upgrade_ack(
        &mut self,
        from: DeviceId,
        digest: crate::types::FirmwareDigest,
    ) -> Result<(Vec<Outgoing>, Vec<SessionEvent>), ProtocolError> {
        let session = self
            .upgrade
            .as_mut()
            .ok_or(ProtocolError::NoActiveSession("upgrade"))?;
        let outcome = session.apply_ack(from, digest)?;
        let mut outgoing = Vec::new();
        let mut events = Vec::new();
        if outcome == UpgradeOutcome::TransferReady {
            // daisy-chained targets share one bus, so chunks go to all
            let targets = session.targets().clone();
            while let Some(chunk) = session.next_chunk() {
                outgoing.push(Outgoing::to_devices(targets.clone(), chunk));
                events.push(SessionEvent::UpgradeProgress {
                    session_id: session.session_id(),
                    progress: session.progress(),
                });
            }
        } else {
            events.push(SessionEvent::UpgradeProgress {
                session_id: session.session_id(),
                progress: 0.0,
            });
        }
        Ok((outgoing, events))
    }
}

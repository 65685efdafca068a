//! Signing Session
//!
//! One-round threshold signing against pre-committed nonces. The session is
//! announced to a chosen signer set, collects signature shares, and combines
//! them the moment a quorum of valid shares is present. Shares are never
//! combined early and a bad share costs only that device's contribution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::{ProtocolError, SessionStatus};
use crate::frost::{CombineError, ShareCombiner};
use crate::keystore::NonceCommitment;
use crate::transport::wire::CoordinatorToDevice;
use crate::types::{DeviceId, FrostKey, KeyId, SessionId, SignTask, ValidationError};

/// What applying one signature share did to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    /// Counted toward quorum, still collecting
    Accepted,
    /// Idempotent redelivery of a share already counted
    Duplicate,
    /// The share was invalid; its device is out, collection continues
    Discarded(DeviceId),
    /// Quorum reached and the final signature produced
    Finalized(Vec<u8>),
    /// Too few honest participants remain to ever reach quorum
    Failed,
}

/// Serializable description of a signing session, complete enough to resume
/// from after a crash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSigning {
    pub session_id: SessionId,
    pub key_id: KeyId,
    pub task: SignTask,
    pub required: BTreeSet<DeviceId>,
    pub commitments: BTreeMap<DeviceId, NonceCommitment>,
    pub collected: BTreeMap<DeviceId, Vec<u8>>,
    pub discarded: BTreeSet<DeviceId>,
    pub started_at: DateTime<Utc>,
}

/// Observable state, published on every transition
#[derive(Debug, Clone, Serialize)]
pub struct SigningSnapshot {
    pub session_id: SessionId,
    pub key_id: KeyId,
    pub status: SessionStatus,
    pub threshold: u16,
    pub required: BTreeSet<DeviceId>,
    pub got_shares: BTreeSet<DeviceId>,
    pub task_kind: &'static str,
    pub started_at: DateTime<Utc>,
}

pub struct SigningSession {
    session_id: SessionId,
    key_id: KeyId,
    threshold: u16,
    task: SignTask,
    task_digest: [u8; 32],
    required: BTreeSet<DeviceId>,
    /// One reserved nonce per required device
    commitments: BTreeMap<DeviceId, NonceCommitment>,
    collected: BTreeMap<DeviceId, Vec<u8>>,
    discarded: BTreeSet<DeviceId>,
    status: SessionStatus,
    signature: Option<Vec<u8>>,
    started_at: DateTime<Utc>,
}

impl SigningSession {
    /// Announce a new session over a signer subset of the key's participants.
    ///
    /// The subset may be larger than the threshold; any `threshold` of them
    /// finishing is enough.
    pub fn new(
        key: &FrostKey,
        task: SignTask,
        signers: BTreeSet<DeviceId>,
        commitments: BTreeMap<DeviceId, NonceCommitment>,
    ) -> Result<Self, ProtocolError> {
        Self::new_with_id(SessionId::random(), key, task, signers, commitments)
    }

    /// Announce with a caller-chosen session id, so nonce reservations can be
    /// keyed before the session exists
    pub fn new_with_id(
        session_id: SessionId,
        key: &FrostKey,
        task: SignTask,
        signers: BTreeSet<DeviceId>,
        commitments: BTreeMap<DeviceId, NonceCommitment>,
    ) -> Result<Self, ProtocolError> {
        if let Some(stranger) = signers.iter().find(|d| !key.participants.contains(d)) {
            return Err(ProtocolError::NotAParticipant(*stranger));
        }
        if signers.len() < key.threshold as usize {
            return Err(ProtocolError::Validation(ValidationError::ThresholdTooHigh {
                threshold: key.threshold,
                participants: signers.len(),
            }));
        }

        let task_digest = task.digest();
        info!(
            session = %session_id,
            key = %key.key_id,
            signers = signers.len(),
            threshold = key.threshold,
            task = task.kind(),
            "signing session announced"
        );
        Ok(SigningSession {
            session_id,
            key_id: key.key_id,
            threshold: key.threshold,
            task,
            task_digest,
            required: signers,
            commitments,
            collected: BTreeMap::new(),
            discarded: BTreeSet::new(),
            status: SessionStatus::Announced,
            signature: None,
            started_at: Utc::now(),
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Devices that still owe a share
    pub fn pending_devices(&self) -> BTreeSet<DeviceId> {
        self.required
            .iter()
            .filter(|d| !self.collected.contains_key(*d) && !self.discarded.contains(*d))
            .copied()
            .collect()
    }

    /// Per-device announcement messages, each naming the nonce that device
    /// must spend
    pub fn announce_messages(&self) -> Vec<(DeviceId, CoordinatorToDevice)> {
        self.pending_devices()
            .into_iter()
            .filter_map(|device| {
                let nonce = self.commitments.get(&device)?;
                Some((
                    device,
                    CoordinatorToDevice::RequestSign {
                        session_id: self.session_id,
                        key_id: self.key_id,
                        task_digest: self.task_digest,
                        nonce_index: nonce.index,
                    },
                ))
            })
            .collect()
    }

    /// Apply one signature share.
    ///
    /// Combination is attempted exactly when the quorum is first reached,
    /// never before. An invalid share discards only that device; the session
    /// keeps collecting while enough participants remain.
    pub fn apply_share(
        &mut self,
        from: DeviceId,
        session: SessionId,
        task_digest: [u8; 32],
        share: Vec<u8>,
        key: &FrostKey,
        combiner: &dyn ShareCombiner,
    ) -> Result<ShareOutcome, ProtocolError> {
        if self.status.is_terminal() {
            return Err(ProtocolError::NotCollecting(self.status));
        }
        if session != self.session_id {
            return Err(ProtocolError::StaleContribution {
                expected: self.session_id,
                got: session,
            });
        }
        if task_digest != self.task_digest {
            return Err(ProtocolError::TaskDigestMismatch(from));
        }
        if !self.required.contains(&from) {
            return Err(ProtocolError::NotAParticipant(from));
        }
        if self.discarded.contains(&from) {
            return Err(ProtocolError::AlreadyDiscarded(from));
        }
        if let Some(existing) = self.collected.get(&from) {
            if *existing == share {
                return Ok(ShareOutcome::Duplicate);
            }
            return Err(ProtocolError::ConflictingContribution(from));
        }

        if let Err(e) = combiner.validate_share(key, from, &share) {
            warn!(session = %self.session_id, device = %from, error = %e, "discarding invalid share");
            return Ok(self.discard(from));
        }

        if self.status == SessionStatus::Announced {
            self.transition(SessionStatus::Collecting);
        }
        self.collected.insert(from, share);
        debug!(
            session = %self.session_id,
            device = %from,
            got = self.collected.len(),
            need = self.threshold,
            "share collected"
        );

        if self.collected.len() < self.threshold as usize {
            return Ok(ShareOutcome::Accepted);
        }
        self.try_finalize(key, combiner)
    }

    fn try_finalize(
        &mut self,
        key: &FrostKey,
        combiner: &dyn ShareCombiner,
    ) -> Result<ShareOutcome, ProtocolError> {
        self.transition(SessionStatus::Finalizing);
        let commitment_blobs: BTreeMap<DeviceId, Vec<u8>> = self
            .collected
            .keys()
            .filter_map(|d| Some((*d, self.commitments.get(d)?.commitment.clone())))
            .collect();

        match combiner.combine(key, &self.task_digest, &self.collected, &commitment_blobs) {
            Ok(signature) => {
                self.signature = Some(signature.clone());
                self.transition(SessionStatus::Complete);
                info!(session = %self.session_id, key = %self.key_id, "signature produced");
                Ok(ShareOutcome::Finalized(signature))
            }
            Err(CombineError::MalformedShare(culprit))
            | Err(CombineError::MalformedCommitment(culprit)) => {
                warn!(session = %self.session_id, device = %culprit, "share rejected during combination");
                self.collected.remove(&culprit);
                Ok(self.discard(culprit))
            }
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "combination failed");
                self.transition(SessionStatus::Failed);
                Ok(ShareOutcome::Failed)
            }
        }
    }

    /// Drop a device's contribution; fail the session if quorum is now out
    /// of reach
    fn discard(&mut self, device: DeviceId) -> ShareOutcome {
        self.discarded.insert(device);
        let reachable = self.collected.len() + self.pending_devices().len();
        if reachable < self.threshold as usize {
            self.transition(SessionStatus::Failed);
            ShareOutcome::Failed
        } else {
            if self.status != SessionStatus::Announced {
                self.transition(SessionStatus::Collecting);
            }
            ShareOutcome::Discarded(device)
        }
    }

    /// Cancel the session; returns the devices that should be told
    pub fn cancel(&mut self) -> BTreeSet<DeviceId> {
        if self.status.is_terminal() {
            return BTreeSet::new();
        }
        self.transition(SessionStatus::Cancelled);
        self.required.clone()
    }

    fn transition(&mut self, to: SessionStatus) {
        if self.status != to {
            debug!(session = %self.session_id, from = %self.status, to = %to, "signing transition");
            self.status = to;
        }
    }

    pub fn snapshot(&self) -> SigningSnapshot {
        SigningSnapshot {
            session_id: self.session_id,
            key_id: self.key_id,
            status: self.status,
            threshold: self.threshold,
            required: self.required.clone(),
            got_shares: self.collected.keys().copied().collect(),
            task_kind: self.task.kind(),
            started_at: self.started_at,
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub fn to_persisted(&self) -> PersistedSigning {
        PersistedSigning {
            session_id: self.session_id,
            key_id: self.key_id,
            task: self.task.clone(),
            required: self.required.clone(),
            commitments: self.commitments.clone(),
            collected: self.collected.clone(),
            discarded: self.discarded.clone(),
            started_at: self.started_at,
        }
    }

    /// Rebuild a session from its persisted description.
    ///
    /// Already-collected shares are kept, so devices that answered before the
    /// crash are not asked again; the rest get a fresh announcement.
    pub fn from_persisted(record: PersistedSigning, key: &FrostKey) -> Result<Self, ProtocolError> {
        let task_digest = record.task.digest();
        let status = if record.collected.is_empty() {
            SessionStatus::Announced
        } else {
            SessionStatus::Collecting
        };
        info!(
            session = %record.session_id,
            key = %record.key_id,
            restored_shares = record.collected.len(),
            "signing session restored"
        );
        Ok(SigningSession {
            session_id: record.session_id,
            key_id: record.key_id,
            threshold: key.threshold,
            task: record.task,
            task_digest,
            required: record.required,
            commitments: record.commitments,
            collected: record.collected,
            discarded: record.discarded,
            status,
            signature: None,
            started_at: record.started_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{key_of, DigestCombiner, BAD_SHARE};

    fn device(n: u8) -> DeviceId {
        DeviceId([n; 33])
    }

    fn commitments_for(devices: &[DeviceId]) -> BTreeMap<DeviceId, NonceCommitment> {
        devices
            .iter()
            .enumerate()
            .map(|(i, d)| {
                (
                    *d,
                    NonceCommitment {
                        index: i as u64,
                        commitment: vec![i as u8; 4],
                    },
                )
            })
            .collect()
    }

    fn two_of_three() -> (FrostKey, SigningSession) {
        let devices = [device(1), device(2), device(3)];
        let key = key_of(2, &devices);
        let session = SigningSession::new(
            &key,
            SignTask::Message {
                message: "pay rent".into(),
            },
            devices.into(),
            commitments_for(&devices),
        )
        .unwrap();
        (key, session)
    }

    #[test]
    fn test_finalizes_at_quorum_not_before() {
        let (key, mut session) = two_of_three();
        let combiner = DigestCombiner;
        let digest = session.task_digest;

        let outcome = session
            .apply_share(device(1), session.session_id(), digest, vec![1], &key, &combiner)
            .unwrap();
        assert_eq!(outcome, ShareOutcome::Accepted);
        assert_eq!(session.status(), SessionStatus::Collecting);
        assert!(session.signature().is_none());

        let outcome = session
            .apply_share(device(2), session.session_id(), digest, vec![2], &key, &combiner)
            .unwrap();
        assert!(matches!(outcome, ShareOutcome::Finalized(_)));
        assert_eq!(session.status(), SessionStatus::Complete);
        assert!(session.signature().is_some());
    }

    #[test]
    fn test_stale_session_id_rejected_without_state_change() {
        let (key, mut session) = two_of_three();
        let digest = session.task_digest;
        let err = session
            .apply_share(device(1), SessionId::random(), digest, vec![1], &key, &DigestCombiner)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::StaleContribution { .. }));
        assert_eq!(session.status(), SessionStatus::Announced);
    }

    #[test]
    fn test_task_digest_mismatch_rejected() {
        let (key, mut session) = two_of_three();
        let err = session
            .apply_share(device(1), session.session_id(), [0; 32], vec![1], &key, &DigestCombiner)
            .unwrap_err();
        assert_eq!(err, ProtocolError::TaskDigestMismatch(device(1)));
    }

    #[test]
    fn test_bad_share_discards_device_and_keeps_collecting() {
        let (key, mut session) = two_of_three();
        let digest = session.task_digest;
        let sid = session.session_id();

        let outcome = session
            .apply_share(device(1), sid, digest, BAD_SHARE.to_vec(), &key, &DigestCombiner)
            .unwrap();
        assert_eq!(outcome, ShareOutcome::Discarded(device(1)));
        assert_eq!(session.status(), SessionStatus::Announced);

        // the discarded device cannot try again
        let err = session
            .apply_share(device(1), sid, digest, vec![1], &key, &DigestCombiner)
            .unwrap_err();
        assert_eq!(err, ProtocolError::AlreadyDiscarded(device(1)));

        // the remaining two still reach quorum
        session
            .apply_share(device(2), sid, digest, vec![2], &key, &DigestCombiner)
            .unwrap();
        let outcome = session
            .apply_share(device(3), sid, digest, vec![3], &key, &DigestCombiner)
            .unwrap();
        assert!(matches!(outcome, ShareOutcome::Finalized(_)));
    }

    /// Combiner that lets every share through validation and only rejects
    /// the marked one when combining, the way aggregation surfaces a signer
    /// that signed the wrong message
    struct LateCulpritCombiner;

    impl ShareCombiner for LateCulpritCombiner {
        fn validate_share(
            &self,
            _key: &FrostKey,
            _from: DeviceId,
            _share: &[u8],
        ) -> Result<(), CombineError> {
            Ok(())
        }

        fn combine(
            &self,
            _key: &FrostKey,
            _task_digest: &[u8; 32],
            shares: &BTreeMap<DeviceId, Vec<u8>>,
            _commitments: &BTreeMap<DeviceId, Vec<u8>>,
        ) -> Result<Vec<u8>, CombineError> {
            for (device, share) in shares {
                if share == BAD_SHARE {
                    return Err(CombineError::MalformedShare(*device));
                }
            }
            Ok(b"sig".to_vec())
        }
    }

    #[test]
    fn test_combine_time_culprit_discarded_and_collection_continues() {
        let (key, mut session) = two_of_three();
        let digest = session.task_digest;
        let sid = session.session_id();
        let combiner = LateCulpritCombiner;

        // the bad share survives validation and counts toward quorum
        let outcome = session
            .apply_share(device(1), sid, digest, BAD_SHARE.to_vec(), &key, &combiner)
            .unwrap();
        assert_eq!(outcome, ShareOutcome::Accepted);

        // quorum reached, combination pins device 1; the session drops its
        // share and keeps collecting instead of failing
        let outcome = session
            .apply_share(device(2), sid, digest, vec![2], &key, &combiner)
            .unwrap();
        assert_eq!(outcome, ShareOutcome::Discarded(device(1)));
        assert_eq!(session.status(), SessionStatus::Collecting);

        let outcome = session
            .apply_share(device(3), sid, digest, vec![3], &key, &combiner)
            .unwrap();
        assert!(matches!(outcome, ShareOutcome::Finalized(_)));
    }

    #[test]
    fn test_too_many_bad_shares_fails_session() {
        let (key, mut session) = two_of_three();
        let digest = session.task_digest;
        let sid = session.session_id();

        session
            .apply_share(device(1), sid, digest, BAD_SHARE.to_vec(), &key, &DigestCombiner)
            .unwrap();
        let outcome = session
            .apply_share(device(2), sid, digest, BAD_SHARE.to_vec(), &key, &DigestCombiner)
            .unwrap();
        assert_eq!(outcome, ShareOutcome::Failed);
        assert_eq!(session.status(), SessionStatus::Failed);
    }

    #[test]
    fn test_duplicate_share_is_idempotent() {
        let (key, mut session) = two_of_three();
        let digest = session.task_digest;
        let sid = session.session_id();

        session
            .apply_share(device(1), sid, digest, vec![1], &key, &DigestCombiner)
            .unwrap();
        let outcome = session
            .apply_share(device(1), sid, digest, vec![1], &key, &DigestCombiner)
            .unwrap();
        assert_eq!(outcome, ShareOutcome::Duplicate);

        // a different blob from the same device is a protocol violation
        let err = session
            .apply_share(device(1), sid, digest, vec![9], &key, &DigestCombiner)
            .unwrap_err();
        assert_eq!(err, ProtocolError::ConflictingContribution(device(1)));
    }

    #[test]
    fn test_persist_and_restore_keeps_collected_shares() {
        let (key, mut session) = two_of_three();
        let digest = session.task_digest;
        let sid = session.session_id();
        session
            .apply_share(device(1), sid, digest, vec![1], &key, &DigestCombiner)
            .unwrap();

        let record = session.to_persisted();
        let mut restored = SigningSession::from_persisted(record, &key).unwrap();
        assert_eq!(restored.status(), SessionStatus::Collecting);
        assert_eq!(restored.pending_devices(), [device(2), device(3)].into());

        // only one more share needed after restore
        let outcome = restored
            .apply_share(device(2), sid, digest, vec![2], &key, &DigestCombiner)
            .unwrap();
        assert!(matches!(outcome, ShareOutcome::Finalized(_)));
    }

    #[test]
    fn test_cancel_notifies_all_required() {
        let (_, mut session) = two_of_three();
        let notified = session.cancel();
        assert_eq!(notified.len(), 3);
        assert_eq!(session.status(), SessionStatus::Cancelled);
        // cancelling twice is a no-op
        assert!(session.cancel().is_empty());
    }
}

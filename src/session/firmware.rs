//! Firmware Upgrade Session
//!
//! Same announce / collect / finalize shape as the crypto protocols, but the
//! "finalize" phase is a chunked image transfer. Every target device must
//! enter upgrade mode and confirm the image digest before the first chunk
//! goes out; chunks are broadcast because daisy-chained devices share the
//! same bus.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::{ProtocolError, SessionStatus};
use crate::transport::wire::CoordinatorToDevice;
use crate::types::{DeviceId, FirmwareDigest, SessionId};

/// Bytes per transfer chunk
pub const FIRMWARE_CHUNK_LEN: usize = 4096;

/// What applying one upgrade ack did to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Ack counted, more devices still preparing
    Acked,
    /// Idempotent redelivery
    Duplicate,
    /// All devices ready; chunk transfer may begin
    TransferReady,
}

pub struct FirmwareUpgradeSession {
    session_id: SessionId,
    digest: FirmwareDigest,
    image: Vec<u8>,
    targets: BTreeSet<DeviceId>,
    acks: BTreeSet<DeviceId>,
    /// Bytes already handed out as chunks
    sent: usize,
    status: SessionStatus,
}

impl FirmwareUpgradeSession {
    pub fn new(image: Vec<u8>, targets: BTreeSet<DeviceId>) -> Result<Self, ProtocolError> {
        if targets.is_empty() {
            return Err(ProtocolError::Validation(
                crate::types::ValidationError::EmptyParticipants,
            ));
        }
        let digest = FirmwareDigest(Sha256::digest(&image).into());
        let session_id = SessionId::random();
        info!(
            session = %session_id,
            %digest,
            image_len = image.len(),
            targets = targets.len(),
            "firmware upgrade announced"
        );
        Ok(FirmwareUpgradeSession {
            session_id,
            digest,
            image,
            targets,
            acks: BTreeSet::new(),
            sent: 0,
            status: SessionStatus::Announced,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn digest(&self) -> FirmwareDigest {
        self.digest
    }

    pub fn targets(&self) -> &BTreeSet<DeviceId> {
        &self.targets
    }

    pub fn announce_messages(&self) -> Vec<(DeviceId, CoordinatorToDevice)> {
        let message = CoordinatorToDevice::EnterUpgradeMode {
            digest: self.digest,
            image_len: self.image.len() as u32,
        };
        self.targets.iter().map(|d| (*d, message.clone())).collect()
    }

    /// A device reports it entered upgrade mode for the named image
    pub fn apply_ack(
        &mut self,
        from: DeviceId,
        digest: FirmwareDigest,
    ) -> Result<UpgradeOutcome, ProtocolError> {
        if self.status.is_terminal() || self.status == SessionStatus::Finalizing {
            return Err(ProtocolError::NotCollecting(self.status));
        }
        if digest != self.digest {
            warn!(session = %self.session_id, device = %from, "upgrade ack for wrong image");
            return Err(ProtocolError::TaskDigestMismatch(from));
        }
        if !self.targets.contains(&from) {
            return Err(ProtocolError::NotAParticipant(from));
        }
        if !self.acks.insert(from) {
            return Ok(UpgradeOutcome::Duplicate);
        }

        if self.status == SessionStatus::Announced {
            self.transition(SessionStatus::Collecting);
        }
        debug!(
            session = %self.session_id,
            device = %from,
            acks = self.acks.len(),
            need = self.targets.len(),
            "device in upgrade mode"
        );

        if self.acks.len() < self.targets.len() {
            return Ok(UpgradeOutcome::Acked);
        }
        self.transition(SessionStatus::Finalizing);
        Ok(UpgradeOutcome::TransferReady)
    }

    /// Next chunk to broadcast, or `None` when the whole image is out.
    ///
    /// Marks the session complete when the final chunk is handed over.
    pub fn next_chunk(&mut self) -> Option<CoordinatorToDevice> {
        if self.status != SessionStatus::Finalizing {
            return None;
        }
        if self.sent >= self.image.len() {
            return None;
        }
        let offset = self.sent;
        let end = (offset + FIRMWARE_CHUNK_LEN).min(self.image.len());
        let bytes = self.image[offset..end].to_vec();
        self.sent = end;
        if self.sent == self.image.len() {
            info!(session = %self.session_id, digest = %self.digest, "firmware image fully sent");
            self.transition(SessionStatus::Complete);
        }
        Some(CoordinatorToDevice::FirmwareChunk {
            offset: offset as u32,
            bytes,
        })
    }

    /// Fraction of the image already sent, for progress reporting
    pub fn progress(&self) -> f32 {
        if self.image.is_empty() {
            return 1.0;
        }
        self.sent as f32 / self.image.len() as f32
    }

    /// Cancel the session; returns the devices that should be told
    pub fn cancel(&mut self) -> BTreeSet<DeviceId> {
        if self.status.is_terminal() {
            return BTreeSet::new();
        }
        self.transition(SessionStatus::Cancelled);
        self.targets.clone()
    }

    fn transition(&mut self, to: SessionStatus) {
        if self.status != to {
            debug!(session = %self.session_id, from = %self.status, to = %to, "upgrade transition");
            self.status = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(n: u8) -> DeviceId {
        DeviceId([n; 33])
    }

    #[test]
    fn test_transfer_waits_for_every_ack() {
        let image = vec![0xabu8; FIRMWARE_CHUNK_LEN + 100];
        let mut session =
            FirmwareUpgradeSession::new(image, [device(1), device(2)].into()).unwrap();
        let digest = session.digest();

        assert_eq!(
            session.apply_ack(device(1), digest).unwrap(),
            UpgradeOutcome::Acked
        );
        // no chunks until everyone is in upgrade mode
        assert!(session.next_chunk().is_none());

        assert_eq!(
            session.apply_ack(device(2), digest).unwrap(),
            UpgradeOutcome::TransferReady
        );

        let first = session.next_chunk().unwrap();
        match first {
            CoordinatorToDevice::FirmwareChunk { offset, bytes } => {
                assert_eq!(offset, 0);
                assert_eq!(bytes.len(), FIRMWARE_CHUNK_LEN);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
        assert!(session.progress() < 1.0);

        let second = session.next_chunk().unwrap();
        match second {
            CoordinatorToDevice::FirmwareChunk { offset, bytes } => {
                assert_eq!(offset as usize, FIRMWARE_CHUNK_LEN);
                assert_eq!(bytes.len(), 100);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
        assert_eq!(session.status(), SessionStatus::Complete);
        assert_eq!(session.progress(), 1.0);
        assert!(session.next_chunk().is_none());
    }

    #[test]
    fn test_ack_for_wrong_image_rejected() {
        let mut session =
            FirmwareUpgradeSession::new(vec![1, 2, 3], [device(1)].into()).unwrap();
        let err = session
            .apply_ack(device(1), FirmwareDigest([0; 32]))
            .unwrap_err();
        assert_eq!(err, ProtocolError::TaskDigestMismatch(device(1)));
    }

    #[test]
    fn test_cancel_stops_transfer() {
        let mut session =
            FirmwareUpgradeSession::new(vec![9u8; 64], [device(1)].into()).unwrap();
        let digest = session.digest();
        session.apply_ack(device(1), digest).unwrap();
        assert_eq!(session.cancel(), [device(1)].into());
        assert!(session.next_chunk().is_none());
        assert_eq!(session.status(), SessionStatus::Cancelled);
    }
}

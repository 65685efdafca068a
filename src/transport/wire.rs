//! Device Wire Codec
//!
//! Messages exchanged with devices over the byte transport. Frames are
//! length-prefixed bincode: a 4-byte little-endian length followed by the
//! serialized message. The codec tolerates partial reads by buffering until
//! a whole frame is available.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DeviceId, FirmwareDigest, KeyId, SessionId};

/// Frames larger than this are treated as corruption, not messages
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame length {0} exceeds maximum")]
    FrameTooLarge(u32),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Messages a device sends upstream to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceToCoordinator {
    /// First message after a port opens; declares identity and firmware
    Announce {
        device_id: DeviceId,
        firmware_digest: FirmwareDigest,
    },
    /// Device has no committed label and wants the naming handshake
    NeedName { device_id: DeviceId },
    /// Device confirmed a label on its own screen
    SetName { device_id: DeviceId, name: String },
    /// Key-generation round contribution
    KeygenShare {
        device_id: DeviceId,
        session_id: SessionId,
        session_digest: [u8; 32],
        share: Vec<u8>,
    },
    /// Acknowledgement that the device displays the same session digest
    KeygenAck {
        device_id: DeviceId,
        session_id: SessionId,
        session_digest: [u8; 32],
    },
    /// Signature share for an announced signing session
    SignatureShare {
        device_id: DeviceId,
        session_id: SessionId,
        task_digest: [u8; 32],
        share: Vec<u8>,
    },
    /// Fresh nonce commitments for the device's inventory
    NonceBatch {
        device_id: DeviceId,
        commitments: Vec<Vec<u8>>,
    },
    /// Device entered upgrade mode and is ready for the image
    UpgradeAck {
        device_id: DeviceId,
        digest: FirmwareDigest,
    },
}

impl DeviceToCoordinator {
    pub fn device_id(&self) -> DeviceId {
        match self {
            DeviceToCoordinator::Announce { device_id, .. }
            | DeviceToCoordinator::NeedName { device_id }
            | DeviceToCoordinator::SetName { device_id, .. }
            | DeviceToCoordinator::KeygenShare { device_id, .. }
            | DeviceToCoordinator::KeygenAck { device_id, .. }
            | DeviceToCoordinator::SignatureShare { device_id, .. }
            | DeviceToCoordinator::NonceBatch { device_id, .. }
            | DeviceToCoordinator::UpgradeAck { device_id, .. } => *device_id,
        }
    }

    /// Short description for logging
    pub fn gist(&self) -> &'static str {
        match self {
            DeviceToCoordinator::Announce { .. } => "announce",
            DeviceToCoordinator::NeedName { .. } => "need_name",
            DeviceToCoordinator::SetName { .. } => "set_name",
            DeviceToCoordinator::KeygenShare { .. } => "keygen_share",
            DeviceToCoordinator::KeygenAck { .. } => "keygen_ack",
            DeviceToCoordinator::SignatureShare { .. } => "signature_share",
            DeviceToCoordinator::NonceBatch { .. } => "nonce_batch",
            DeviceToCoordinator::UpgradeAck { .. } => "upgrade_ack",
        }
    }
}

/// Messages the coordinator sends down to devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorToDevice {
    AnnounceAck,
    /// Stage a candidate label for on-device confirmation
    NamePreview { name: String },
    /// Commit the label
    NameFinish { name: String },
    StartKeygen {
        session_id: SessionId,
        threshold: u16,
        participants: Vec<DeviceId>,
        key_name: String,
        /// Digest of these parameters; devices echo it with every share
        params_digest: [u8; 32],
    },
    /// All keygen shares are in; devices must display and ack this digest
    FinishKeygen {
        session_id: SessionId,
        session_digest: [u8; 32],
    },
    RequestSign {
        session_id: SessionId,
        key_id: KeyId,
        task_digest: [u8; 32],
        /// Index of the pre-committed nonce the device must use
        nonce_index: u64,
    },
    /// Ask the device to mint this many fresh nonce commitments
    ReplenishNonces { count: u32 },
    EnterUpgradeMode {
        digest: FirmwareDigest,
        image_len: u32,
    },
    /// One slice of a firmware image, broadcast to upgrading devices
    FirmwareChunk { offset: u32, bytes: Vec<u8> },
    /// Abort whatever protocol the device is participating in
    Cancel,
}

impl CoordinatorToDevice {
    pub fn gist(&self) -> &'static str {
        match self {
            CoordinatorToDevice::AnnounceAck => "announce_ack",
            CoordinatorToDevice::NamePreview { .. } => "name_preview",
            CoordinatorToDevice::NameFinish { .. } => "name_finish",
            CoordinatorToDevice::StartKeygen { .. } => "start_keygen",
            CoordinatorToDevice::FinishKeygen { .. } => "finish_keygen",
            CoordinatorToDevice::RequestSign { .. } => "request_sign",
            CoordinatorToDevice::ReplenishNonces { .. } => "replenish_nonces",
            CoordinatorToDevice::EnterUpgradeMode { .. } => "enter_upgrade_mode",
            CoordinatorToDevice::FirmwareChunk { .. } => "firmware_chunk",
            CoordinatorToDevice::Cancel => "cancel",
        }
    }
}

/// Encode one message as a length-prefixed frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(message).map_err(|e| WireError::Encode(e.to_string()))?;
    let len = body.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental frame decoder for a byte stream
#[derive(Debug, Default)]
pub struct FrameCodec {
    buf: Vec<u8>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes read from the port
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to decode the next complete frame, if one is buffered
    pub fn try_decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, WireError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(len));
        }
        let total = 4 + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let message = bincode::deserialize(&self.buf[4..total])
            .map_err(|e| WireError::Decode(e.to_string()))?;
        self.buf.drain(..total);
        Ok(Some(message))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

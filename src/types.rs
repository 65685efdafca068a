//! Core Identifier and Task Types
//!
//! Identifiers are fixed-length and opaque: devices are known by the 33-byte
//! identity they announce, keys by a digest of their public material. All of
//! them serialize as hex strings so they are readable in logs, JSON payloads
//! and sqlite rows.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Validation errors raised before any device is contacted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("threshold must be at least 1, got {0}")]
    ThresholdTooLow(u16),
    #[error("threshold {threshold} exceeds participant count {participants}")]
    ThresholdTooHigh { threshold: u16, participants: usize },
    #[error("participant set is empty")]
    EmptyParticipants,
    #[error("duplicate device in participant set: {0}")]
    DuplicateDevice(DeviceId),
}

macro_rules! hex_id {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // short form for log readability
                write!(f, concat!(stringify!($name), "({}..)"), &self.to_hex()[..8])
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s).map_err(|e| e.to_string())?;
                let arr: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| format!("expected {} bytes", $len))?;
                Ok($name(arr))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

hex_id!(
    DeviceId,
    33,
    "Identity a physical signing device announces; stable across reconnects"
);
hex_id!(KeyId, 32, "Content-derived identifier of a completed threshold key");
hex_id!(FirmwareDigest, 32, "SHA-256 digest of a firmware image");

impl KeyId {
    /// Derive the key identifier from the key's public material.
    ///
    /// Deterministic, so the same completed keygen always yields the same id.
    pub fn from_public_material(polynomial_identifier: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"frost-coordinator/key-id");
        hasher.update(polynomial_identifier);
        KeyId(hasher.finalize().into())
    }
}

/// Token identifying one outstanding port request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Identifier of one run of a multi-round protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn random() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Serial-number style identifier of a virtualized port channel
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortId(pub String);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PortId {
    fn from(s: &str) -> Self {
        PortId(s.to_string())
    }
}

/// What a signing session is asked to sign
///
/// Tagged union rather than trait objects: every variant shares the same
/// round protocol and digest scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignTask {
    /// Raw transaction payload prepared by the wallet layer
    Transaction { payload: Vec<u8> },
    /// Free-form message signing
    Message { message: String },
    /// Nostr event signing (serialized event JSON)
    NostrEvent { event_json: String },
}

impl SignTask {
    /// Domain-separated digest devices commit to in their shares.
    ///
    /// Two sessions for different tasks can never exchange contributions
    /// because this digest is checked on every incoming share.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        match self {
            SignTask::Transaction { payload } => {
                hasher.update(b"task/transaction");
                hasher.update(payload);
            }
            SignTask::Message { message } => {
                hasher.update(b"task/message");
                hasher.update(message.as_bytes());
            }
            SignTask::NostrEvent { event_json } => {
                hasher.update(b"task/nostr");
                hasher.update(event_json.as_bytes());
            }
        }
        hasher.finalize().into()
    }

    /// Short label for logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            SignTask::Transaction { .. } => "transaction",
            SignTask::Message { .. } => "message",
            SignTask::NostrEvent { .. } => "nostr_event",
        }
    }
}

/// A completed threshold key
///
/// Created atomically at the end of a successful key-generation session and
/// never mutated afterwards; renaming only touches `display_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrostKey {
    pub key_id: KeyId,
    pub threshold: u16,
    pub participants: BTreeSet<DeviceId>,
    /// Serialized public key material the scheme backend understands
    pub polynomial_identifier: Vec<u8>,
    pub display_name: String,
}

impl FrostKey {
    pub fn new(
        threshold: u16,
        participants: BTreeSet<DeviceId>,
        polynomial_identifier: Vec<u8>,
        display_name: String,
    ) -> Result<Self, ValidationError> {
        if threshold == 0 {
            return Err(ValidationError::ThresholdTooLow(threshold));
        }
        if participants.is_empty() {
            return Err(ValidationError::EmptyParticipants);
        }
        if threshold as usize > participants.len() {
            return Err(ValidationError::ThresholdTooHigh {
                threshold,
                participants: participants.len(),
            });
        }
        Ok(FrostKey {
            key_id: KeyId::from_public_material(&polynomial_identifier),
            threshold,
            participants,
            polynomial_identifier,
            display_name,
        })
    }
}

/// Validate a participant list before any device is contacted.
///
/// Rejects empty sets, duplicates and thresholds outside `1..=n`.
pub fn validate_participants(
    threshold: u16,
    devices: &[DeviceId],
) -> Result<BTreeSet<DeviceId>, ValidationError> {
    if devices.is_empty() {
        return Err(ValidationError::EmptyParticipants);
    }
    let mut set = BTreeSet::new();
    for device in devices {
        if !set.insert(*device) {
            return Err(ValidationError::DuplicateDevice(*device));
        }
    }
    if threshold == 0 {
        return Err(ValidationError::ThresholdTooLow(threshold));
    }
    if threshold as usize > set.len() {
        return Err(ValidationError::ThresholdTooHigh {
            threshold,
            participants: set.len(),
        });
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(n: u8) -> DeviceId {
        DeviceId([n; 33])
    }

    #[test]
    fn test_device_id_hex_round_trip() {
        let id = device(0xab);
        let parsed: DeviceId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_key_id_is_deterministic() {
        let a = KeyId::from_public_material(b"material");
        let b = KeyId::from_public_material(b"material");
        let c = KeyId::from_public_material(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_task_digest_separates_kinds() {
        let tx = SignTask::Transaction {
            payload: b"hello".to_vec(),
        };
        let msg = SignTask::Message {
            message: "hello".to_string(),
        };
        assert_ne!(tx.digest(), msg.digest());
    }

    #[test]
    fn test_validate_participants_rejects_bad_input() {
        let devices = [device(1), device(2), device(3)];
        assert!(validate_participants(2, &devices).is_ok());
        assert_eq!(
            validate_participants(0, &devices),
            Err(ValidationError::ThresholdTooLow(0))
        );
        assert_eq!(
            validate_participants(4, &devices),
            Err(ValidationError::ThresholdTooHigh {
                threshold: 4,
                participants: 3
            })
        );
        assert_eq!(
            validate_participants(1, &[]),
            Err(ValidationError::EmptyParticipants)
        );
        assert_eq!(
            validate_participants(1, &[device(1), device(1)]),
            Err(ValidationError::DuplicateDevice(device(1)))
        );
    }

    #[test]
    fn test_frost_key_invariants() {
        let participants: BTreeSet<_> = [device(1), device(2)].into();
        let key = FrostKey::new(2, participants.clone(), vec![1, 2, 3], "vault".into()).unwrap();
        assert_eq!(key.key_id, KeyId::from_public_material(&[1, 2, 3]));
        assert!(FrostKey::new(3, participants, vec![], "x".into()).is_err());
    }
}

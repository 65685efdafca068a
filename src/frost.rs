//! Signature Scheme Seam
//!
//! The coordinator treats the threshold-signature math as a black box: it
//! validates and combines opaque share blobs through the [`ShareCombiner`]
//! trait and never looks inside them. [`FrostCombiner`] is the production
//! implementation on top of `frost-secp256k1-tr`.

use frost_secp256k1_tr as frost;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::types::{DeviceId, FrostKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CombineError {
    #[error("malformed share from {0}")]
    MalformedShare(DeviceId),
    #[error("malformed nonce commitment for {0}")]
    MalformedCommitment(DeviceId),
    #[error("device {0} is not a participant of this key")]
    NotAParticipant(DeviceId),
    #[error("key public material is unreadable: {0}")]
    BadKeyMaterial(String),
    #[error("aggregation failed: {0}")]
    Aggregation(String),
}

/// Black-box capability to validate and combine signature shares
pub trait ShareCombiner: Send + Sync {
    /// Cheap integrity check of a single share blob before it counts toward
    /// quorum. Must identify the contributing device on failure so the
    /// session can discard exactly that response.
    fn validate_share(&self, key: &FrostKey, from: DeviceId, share: &[u8])
        -> Result<(), CombineError>;

    /// Combine a quorum of validated shares into the final signature.
    ///
    /// `commitments` are the nonce commitments the session reserved for the
    /// responding devices.
    fn combine(
        &self,
        key: &FrostKey,
        task_digest: &[u8; 32],
        shares: &BTreeMap<DeviceId, Vec<u8>>,
        commitments: &BTreeMap<DeviceId, Vec<u8>>,
    ) -> Result<Vec<u8>, CombineError>;
}

/// FROST/secp256k1-Taproot implementation
///
/// Participant identifiers are derived from each device's rank within the
/// key's participant set, so every party computes the same mapping without
/// negotiation.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrostCombiner;

impl FrostCombiner {
    pub fn new() -> Self {
        FrostCombiner
    }

    /// 1-based FROST identifier of a device within the key's participant set
    pub fn identifier_of(key: &FrostKey, device: DeviceId) -> Result<frost::Identifier, CombineError> {
        let rank = key
            .participants
            .iter()
            .position(|d| *d == device)
            .ok_or(CombineError::NotAParticipant(device))?;
        frost::Identifier::try_from((rank + 1) as u16)
            .map_err(|e| CombineError::Aggregation(e.to_string()))
    }

    /// Inverse of [`Self::identifier_of`] over the key's participant set
    pub fn device_of(key: &FrostKey, identifier: frost::Identifier) -> Option<DeviceId> {
        key.participants
            .iter()
            .copied()
            .find(|d| Self::identifier_of(key, *d).map_or(false, |i| i == identifier))
    }
}

impl ShareCombiner for FrostCombiner {
    fn validate_share(
        &self,
        _key: &FrostKey,
        from: DeviceId,
        share: &[u8],
    ) -> Result<(), CombineError> {
        frost::round2::SignatureShare::deserialize(share)
            .map(|_| ())
            .map_err(|_| CombineError::MalformedShare(from))
    }

    fn combine(
        &self,
        key: &FrostKey,
        task_digest: &[u8; 32],
        shares: &BTreeMap<DeviceId, Vec<u8>>,
        commitments: &BTreeMap<DeviceId, Vec<u8>>,
    ) -> Result<Vec<u8>, CombineError> {
        let public_key_package =
            frost::keys::PublicKeyPackage::deserialize(&key.polynomial_identifier)
                .map_err(|e| CombineError::BadKeyMaterial(e.to_string()))?;

        let mut commitment_map: BTreeMap<frost::Identifier, frost::round1::SigningCommitments> =
            BTreeMap::new();
        let mut share_map: BTreeMap<frost::Identifier, frost::round2::SignatureShare> =
            BTreeMap::new();

        for (device, share) in shares {
            let identifier = Self::identifier_of(key, *device)?;
            let commitment_blob = commitments
                .get(device)
                .ok_or(CombineError::MalformedCommitment(*device))?;
            let commitment = frost::round1::SigningCommitments::deserialize(commitment_blob)
                .map_err(|_| CombineError::MalformedCommitment(*device))?;
            let share = frost::round2::SignatureShare::deserialize(share)
                .map_err(|_| CombineError::MalformedShare(*device))?;
            commitment_map.insert(identifier, commitment);
            share_map.insert(identifier, share);
        }

        let signing_package = frost::SigningPackage::new(commitment_map, task_digest);
        let signature = frost::aggregate(&signing_package, &share_map, &public_key_package)
            .map_err(|e| {
                // aggregation names the misbehaving signer, so only that
                // device's contribution is charged
                if let frost::Error::InvalidSignatureShare { culprit } = &e {
                    if let Some(device) = Self::device_of(key, *culprit) {
                        return CombineError::MalformedShare(device);
                    }
                }
                CombineError::Aggregation(e.to_string())
            })?;

        signature
            .serialize()
            .map_err(|e| CombineError::Aggregation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frost::keys::IdentifierList;
    use rand::rngs::OsRng;
    use std::collections::BTreeSet;

    fn device(n: u8) -> DeviceId {
        DeviceId([n; 33])
    }

    /// Full dealer-based 2-of-2 flow: the combiner aggregates real shares
    #[test]
    fn test_combine_real_shares() {
        let mut rng = OsRng;
        let (secret_shares, pubkey_package) =
            frost::keys::generate_with_dealer(2, 2, IdentifierList::Default, &mut rng)
                .expect("dealer keygen");

        let devices = [device(1), device(2)];
        let participants: BTreeSet<_> = devices.into();
        let key = FrostKey::new(
            2,
            participants,
            pubkey_package.serialize().unwrap(),
            "test".into(),
        )
        .unwrap();

        // key packages in identifier order match device rank order
        let mut key_packages = Vec::new();
        for (_, secret_share) in secret_shares {
            key_packages.push(frost::keys::KeyPackage::try_from(secret_share).unwrap());
        }
        key_packages.sort_by_key(|kp| *kp.identifier());

        let task_digest = [0x42u8; 32];

        // each "device" pre-commits a nonce
        let mut nonces = Vec::new();
        let mut commitments = BTreeMap::new();
        for (i, kp) in key_packages.iter().enumerate() {
            let (nonce, commitment) = frost::round1::commit(kp.signing_share(), &mut rng);
            commitments.insert(devices[i], commitment.serialize().unwrap());
            nonces.push((nonce, commitment));
        }

        // devices sign against the announced commitment set
        let mut commitment_map = BTreeMap::new();
        for (kp, (_, commitment)) in key_packages.iter().zip(&nonces) {
            commitment_map.insert(*kp.identifier(), *commitment);
        }
        let signing_package = frost::SigningPackage::new(commitment_map, &task_digest);

        let mut shares = BTreeMap::new();
        for (i, (kp, (nonce, _))) in key_packages.iter().zip(&nonces).enumerate() {
            let share = frost::round2::sign(&signing_package, nonce, kp).unwrap();
            shares.insert(devices[i], share.serialize());
        }

        let combiner = FrostCombiner::new();
        for (d, s) in &shares {
            combiner.validate_share(&key, *d, s).unwrap();
        }
        let signature = combiner
            .combine(&key, &task_digest, &shares, &commitments)
            .unwrap();
        assert!(!signature.is_empty());
    }

    /// A share over the wrong message deserializes and passes validation;
    /// aggregation must still pin it on the signer that produced it
    #[test]
    fn test_combine_names_the_culprit_device() {
        let mut rng = OsRng;
        let (secret_shares, pubkey_package) =
            frost::keys::generate_with_dealer(2, 2, IdentifierList::Default, &mut rng)
                .expect("dealer keygen");

        let devices = [device(1), device(2)];
        let key = FrostKey::new(
            2,
            devices.into(),
            pubkey_package.serialize().unwrap(),
            "test".into(),
        )
        .unwrap();

        let mut key_packages = Vec::new();
        for (_, secret_share) in secret_shares {
            key_packages.push(frost::keys::KeyPackage::try_from(secret_share).unwrap());
        }
        key_packages.sort_by_key(|kp| *kp.identifier());

        let task_digest = [0x42u8; 32];

        let mut nonces = Vec::new();
        let mut commitments = BTreeMap::new();
        let mut commitment_map = BTreeMap::new();
        for (i, kp) in key_packages.iter().enumerate() {
            let (nonce, commitment) = frost::round1::commit(kp.signing_share(), &mut rng);
            commitments.insert(devices[i], commitment.serialize().unwrap());
            commitment_map.insert(*kp.identifier(), commitment);
            nonces.push(nonce);
        }

        let announced = frost::SigningPackage::new(commitment_map.clone(), &task_digest);
        let diverged = frost::SigningPackage::new(commitment_map, &[0x13u8; 32]);

        // the second signer signs a different message
        let mut shares = BTreeMap::new();
        let share = frost::round2::sign(&announced, &nonces[0], &key_packages[0]).unwrap();
        shares.insert(devices[0], share.serialize());
        let share = frost::round2::sign(&diverged, &nonces[1], &key_packages[1]).unwrap();
        shares.insert(devices[1], share.serialize());

        let combiner = FrostCombiner::new();
        for (d, s) in &shares {
            combiner.validate_share(&key, *d, s).unwrap();
        }
        let err = combiner
            .combine(&key, &task_digest, &shares, &commitments)
            .unwrap_err();
        assert_eq!(err, CombineError::MalformedShare(device(2)));
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let key = FrostKey::new(
            1,
            [device(1)].into(),
            vec![0u8; 8],
            "k".into(),
        )
        .unwrap();
        let err = FrostCombiner::new()
            .validate_share(&key, device(1), b"not a share")
            .unwrap_err();
        assert_eq!(err, CombineError::MalformedShare(device(1)));
    }

    #[test]
    fn test_identifier_mapping_is_rank_based() {
        let key = FrostKey::new(
            1,
            [device(3), device(1), device(2)].into(),
            vec![0u8; 8],
            "k".into(),
        )
        .unwrap();
        // BTreeSet orders by id, so device(1) has rank 1
        let id1 = FrostCombiner::identifier_of(&key, device(1)).unwrap();
        assert_eq!(id1, frost::Identifier::try_from(1u16).unwrap());
        assert!(FrostCombiner::identifier_of(&key, device(9)).is_err());
    }
}

//! Public key bundles and the peer key cache.
//!
//! A bundle carries a device's X25519 agreement key and Ed25519 verifying key,
//! plus a signature by that verifying key over the device id and both keys.
//! Wire form is standard base64 of `agreement (32) || verifying (32) || signature (64)`.
//!
//! Bundles are self-signed, so the cache pins the first verifying key it
//! accepts for a device id. Later bundles must be signed by that same key;
//! a rotated agreement key is accepted only under the pinned signer.

use crate::error::{CryptoError, CryptoResult};
use crate::identity::{fingerprint, DeviceIdentity};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use hybridmesh_core::DeviceId;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};
use x25519_dalek::PublicKey as X25519PublicKey;

const KEY_LEN: usize = 32;
const SIGNATURE_LEN: usize = 64;
const BUNDLE_LEN: usize = KEY_LEN * 2 + SIGNATURE_LEN;
const BUNDLE_CONTEXT: &[u8] = b"hybridmesh-key-bundle-v1";

/// Signed public key material advertised by one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBundle {
    agreement: [u8; KEY_LEN],
    verifying: [u8; KEY_LEN],
    signature: [u8; SIGNATURE_LEN],
}

impl KeyBundle {
    pub(crate) fn sign(device_id: &str, identity: &DeviceIdentity) -> Self {
        let agreement = identity.agreement_public().to_bytes();
        let verifying = identity.verifying_key().to_bytes();
        let signature = identity
            .sign(&signed_bytes(device_id, &agreement, &verifying))
            .to_bytes();
        Self {
            agreement,
            verifying,
            signature,
        }
    }

    /// Base64 wire form.
    pub fn encode(&self) -> String {
        let mut bytes = Vec::with_capacity(BUNDLE_LEN);
        bytes.extend_from_slice(&self.agreement);
        bytes.extend_from_slice(&self.verifying);
        bytes.extend_from_slice(&self.signature);
        STANDARD.encode(bytes)
    }

    /// Parse the base64 wire form. Does not verify the signature.
    pub fn decode(encoded: &str) -> CryptoResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        if bytes.len() != BUNDLE_LEN {
            return Err(CryptoError::MalformedKey(format!(
                "key bundle length {} (expected {})",
                bytes.len(),
                BUNDLE_LEN
            )));
        }

        let mut agreement = [0u8; KEY_LEN];
        let mut verifying = [0u8; KEY_LEN];
        let mut signature = [0u8; SIGNATURE_LEN];
        agreement.copy_from_slice(&bytes[..KEY_LEN]);
        verifying.copy_from_slice(&bytes[KEY_LEN..KEY_LEN * 2]);
        signature.copy_from_slice(&bytes[KEY_LEN * 2..]);
        Ok(Self {
            agreement,
            verifying,
            signature,
        })
    }

    /// Check that the bundle was signed by its own verifying key for `device_id`.
    pub fn verify(&self, device_id: &str) -> CryptoResult<()> {
        let verifying_key = VerifyingKey::from_bytes(&self.verifying)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
        let signature = Signature::from_bytes(&self.signature);
        verifying_key
            .verify(
                &signed_bytes(device_id, &self.agreement, &self.verifying),
                &signature,
            )
            .map_err(|_| CryptoError::Signature(format!("key bundle for {}", device_id)))
    }

    /// X25519 agreement key.
    pub fn agreement_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.agreement)
    }

    /// Ed25519 verifying key bytes.
    pub fn verifying_key_bytes(&self) -> [u8; KEY_LEN] {
        self.verifying
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.agreement)
    }
}

fn signed_bytes(device_id: &str, agreement: &[u8], verifying: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(BUNDLE_CONTEXT.len() + device_id.len() + KEY_LEN * 2);
    msg.extend_from_slice(BUNDLE_CONTEXT);
    msg.extend_from_slice(device_id.as_bytes());
    msg.extend_from_slice(agreement);
    msg.extend_from_slice(verifying);
    msg
}

/// Verified peer keys indexed by device id.
#[derive(Debug, Default)]
pub struct PeerKeyCache {
    keys: RwLock<HashMap<DeviceId, KeyBundle>>,
}

impl PeerKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode, verify and cache a bundle received from `device_id`.
    ///
    /// Returns `true` when the cached key changed.
    pub fn insert_encoded(&self, device_id: &str, encoded: &str) -> CryptoResult<bool> {
        let bundle = KeyBundle::decode(encoded)?;
        if let Err(e) = bundle.verify(device_id) {
            warn!(device_id = %device_id, "Rejected key bundle: {}", e);
            return Err(e);
        }
        self.insert(device_id, bundle)
    }

    /// Cache an already verified bundle, subject to the pinned verifying key.
    ///
    /// Returns `true` when the cached key changed and
    /// [`CryptoError::KeyConflict`] when `bundle` was signed by a different
    /// key than the one already pinned for `device_id`.
    pub fn insert(&self, device_id: &str, bundle: KeyBundle) -> CryptoResult<bool> {
        let mut keys = match self.keys.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match keys.get(device_id) {
            Some(pinned) if *pinned == bundle => return Ok(false),
            Some(pinned) if pinned.verifying != bundle.verifying => {
                warn!(
                    device_id = %device_id,
                    pinned = %pinned.fingerprint(),
                    offered = %bundle.fingerprint(),
                    "Refused key bundle signed by an unpinned key"
                );
                return Err(CryptoError::KeyConflict {
                    device_id: device_id.to_string(),
                });
            }
            _ => {}
        }
        debug!(
            device_id = %device_id,
            fingerprint = %bundle.fingerprint(),
            "Cached peer public key"
        );
        keys.insert(device_id.to_string(), bundle);
        Ok(true)
    }

    /// Agreement key for `device_id`, or [`CryptoError::NoKey`].
    pub fn agreement_key(&self, device_id: &str) -> CryptoResult<X25519PublicKey> {
        self.get(device_id)
            .map(|bundle| bundle.agreement_key())
            .ok_or_else(|| CryptoError::NoKey {
                device_id: device_id.to_string(),
            })
    }

    pub fn get(&self, device_id: &str) -> Option<KeyBundle> {
        let keys = match self.keys.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        keys.get(device_id).cloned()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }

    pub fn remove(&self, device_id: &str) -> Option<KeyBundle> {
        let mut keys = match self.keys.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        keys.remove(device_id)
    }

    pub fn clear(&self) {
        let mut keys = match self.keys.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        keys.clear();
    }

    pub fn len(&self) -> usize {
        match self.keys.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! End-to-end envelope encryption between mesh devices.
//!
//! `encrypt` performs X25519 agreement between the local identity and the
//! recipient, expands the shared secret with HKDF-SHA256 (info binds both
//! public keys) and seals the payload with ChaCha20-Poly1305. The timestamp
//! and both public keys are authenticated as associated data.
//!
//! Relays never touch envelopes: they forward the serialized form unchanged.

use crate::error::{CryptoError, CryptoResult};
use crate::identity::{fingerprint, DeviceIdentity};
use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use hkdf::Hkdf;
use hybridmesh_core::current_timestamp_ms;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, warn};
use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::Zeroizing;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits).
pub const TAG_SIZE: usize = 16;

const KEY_LEN: usize = 32;
const HKDF_INFO_LABEL: &[u8] = b"hybridmesh-envelope-v1";

/// Self-describing ciphertext blob carried in a message's content field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
    #[serde(with = "b64")]
    pub sender_public_key: Vec<u8>,
    #[serde(with = "b64")]
    pub recipient_public_key: Vec<u8>,
    /// Sealing time (Unix epoch milliseconds)
    pub timestamp: u64,
}

impl EncryptedEnvelope {
    /// Serialize to the JSON form stored in `Message::content`.
    pub fn to_json(&self) -> CryptoResult<String> {
        serde_json::to_string(self).map_err(|e| CryptoError::Envelope(e.to_string()))
    }

    /// Parse the JSON form.
    pub fn from_json(content: &str) -> CryptoResult<Self> {
        serde_json::from_str(content).map_err(|e| CryptoError::Envelope(e.to_string()))
    }

    fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(8 + KEY_LEN * 2);
        aad.extend_from_slice(&self.timestamp.to_le_bytes());
        aad.extend_from_slice(&self.sender_public_key);
        aad.extend_from_slice(&self.recipient_public_key);
        aad
    }
}

/// Seals and opens envelopes with the local device identity.
#[derive(Debug, Clone)]
pub struct EncryptionEngine {
    identity: Arc<DeviceIdentity>,
}

impl EncryptionEngine {
    pub fn new(identity: Arc<DeviceIdentity>) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Encrypt `plaintext` for the holder of `recipient`.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        recipient: &X25519PublicKey,
    ) -> CryptoResult<EncryptedEnvelope> {
        let sender = self.identity.agreement_public();

        let mut iv = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut iv);

        let mut envelope = EncryptedEnvelope {
            ciphertext: plaintext.to_vec(),
            iv: iv.to_vec(),
            tag: Vec::new(),
            sender_public_key: sender.as_bytes().to_vec(),
            recipient_public_key: recipient.as_bytes().to_vec(),
            timestamp: current_timestamp_ms(),
        };

        let cipher = self.cipher_for(recipient, sender.as_bytes(), recipient.as_bytes())?;
        let aad = envelope.associated_data();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), &aad, &mut envelope.ciphertext)
            .map_err(|_| CryptoError::Envelope("encryption failed".to_string()))?;
        envelope.tag = tag.to_vec();

        debug!(
            recipient = %fingerprint(recipient.as_bytes()),
            bytes = plaintext.len(),
            "Sealed envelope"
        );
        Ok(envelope)
    }

    /// Authenticate and decrypt an envelope sent to or by this identity.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> CryptoResult<Vec<u8>> {
        let sender = public_key_from(&envelope.sender_public_key)?;
        let recipient = public_key_from(&envelope.recipient_public_key)?;
        if envelope.iv.len() != NONCE_SIZE {
            return Err(CryptoError::Envelope(format!(
                "iv length {} (expected {})",
                envelope.iv.len(),
                NONCE_SIZE
            )));
        }
        if envelope.tag.len() != TAG_SIZE {
            return Err(CryptoError::Envelope(format!(
                "tag length {} (expected {})",
                envelope.tag.len(),
                TAG_SIZE
            )));
        }

        let local = self.identity.agreement_public();
        let counterpart = if recipient == local {
            sender
        } else if sender == local {
            recipient
        } else {
            return Err(CryptoError::Envelope(
                "envelope is not addressed to this device".to_string(),
            ));
        };

        let cipher = self.cipher_for(&counterpart, sender.as_bytes(), recipient.as_bytes())?;
        let mut buffer = envelope.ciphertext.clone();
        let result = cipher.decrypt_in_place_detached(
            Nonce::from_slice(&envelope.iv),
            &envelope.associated_data(),
            &mut buffer,
            Tag::from_slice(&envelope.tag),
        );
        if result.is_err() {
            warn!(
                sender = %fingerprint(sender.as_bytes()),
                "Envelope failed authentication"
            );
            return Err(CryptoError::Authentication);
        }
        Ok(buffer)
    }

    /// Encrypt a UTF-8 payload and serialize the envelope to JSON.
    pub fn seal_str(&self, plaintext: &str, recipient: &X25519PublicKey) -> CryptoResult<String> {
        self.encrypt(plaintext.as_bytes(), recipient)?.to_json()
    }

    /// Parse a JSON envelope and decrypt it to a UTF-8 string.
    pub fn open_str(&self, content: &str) -> CryptoResult<String> {
        let envelope = EncryptedEnvelope::from_json(content)?;
        let plaintext = self.decrypt(&envelope)?;
        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Envelope("plaintext is not UTF-8".to_string()))
    }

    fn cipher_for(
        &self,
        counterpart: &X25519PublicKey,
        sender: &[u8],
        recipient: &[u8],
    ) -> CryptoResult<ChaCha20Poly1305> {
        let shared = self.identity.diffie_hellman(counterpart);
        if !shared.was_contributory() {
            return Err(CryptoError::MalformedKey(
                "low-order public key".to_string(),
            ));
        }

        let mut info = Vec::with_capacity(HKDF_INFO_LABEL.len() + KEY_LEN * 2);
        info.extend_from_slice(HKDF_INFO_LABEL);
        info.extend_from_slice(sender);
        info.extend_from_slice(recipient);

        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        hkdf.expand(&info, &mut key[..])
            .map_err(|e| CryptoError::Envelope(e.to_string()))?;

        Ok(ChaCha20Poly1305::new(Key::from_slice(&key[..])))
    }
}

fn public_key_from(bytes: &[u8]) -> CryptoResult<X25519PublicKey> {
    let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
        CryptoError::MalformedKey(format!("public key length {} (expected {})", bytes.len(), KEY_LEN))
    })?;
    Ok(X25519PublicKey::from(array))
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> EncryptionEngine {
        EncryptionEngine::new(Arc::new(DeviceIdentity::generate()))
    }

    #[test]
    fn test_encrypt_decrypt() {
        let alice = engine();
        let bob = engine();

        let envelope = alice
            .encrypt(b"meet at the north gate", &bob.identity().agreement_public())
            .unwrap();
        assert_ne!(envelope.ciphertext, b"meet at the north gate");
        assert_eq!(envelope.iv.len(), NONCE_SIZE);
        assert_eq!(envelope.tag.len(), TAG_SIZE);

        let plaintext = bob.decrypt(&envelope).unwrap();
        assert_eq!(plaintext, b"meet at the north gate");
    }

    #[test]
    fn test_sender_can_reopen_own_envelope() {
        let alice = engine();
        let bob = engine();

        let sealed = alice
            .seal_str("hello bob", &bob.identity().agreement_public())
            .unwrap();
        assert_eq!(alice.open_str(&sealed).unwrap(), "hello bob");
    }

    #[test]
    fn test_third_party_cannot_decrypt() {
        let alice = engine();
        let bob = engine();
        let eve = engine();

        let envelope = alice
            .encrypt(b"secret", &bob.identity().agreement_public())
            .unwrap();
        assert!(matches!(eve.decrypt(&envelope), Err(CryptoError::Envelope(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let alice = engine();
        let bob = engine();

        let mut envelope = alice
            .encrypt(b"secret", &bob.identity().agreement_public())
            .unwrap();
        envelope.ciphertext[0] ^= 0xFF;
        assert!(matches!(bob.decrypt(&envelope), Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_tampered_timestamp_fails_authentication() {
        let alice = engine();
        let bob = engine();

        let mut envelope = alice
            .encrypt(b"secret", &bob.identity().agreement_public())
            .unwrap();
        envelope.timestamp += 1;
        assert!(matches!(bob.decrypt(&envelope), Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_malformed_key_rejected() {
        let alice = engine();
        let bob = engine();

        let mut envelope = alice
            .encrypt(b"secret", &bob.identity().agreement_public())
            .unwrap();
        envelope.sender_public_key.truncate(7);
        assert!(matches!(bob.decrypt(&envelope), Err(CryptoError::MalformedKey(_))));
    }

    #[test]
    fn test_low_order_key_rejected() {
        let alice = engine();
        let zero = X25519PublicKey::from([0u8; 32]);
        assert!(matches!(
            alice.encrypt(b"secret", &zero),
            Err(CryptoError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_json_form_is_base64() {
        let alice = engine();
        let bob = engine();

        let json = alice
            .seal_str("payload", &bob.identity().agreement_public())
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for field in ["ciphertext", "iv", "tag", "sender_public_key", "recipient_public_key"] {
            assert!(value[field].is_string(), "{} should be a base64 string", field);
        }
        assert!(value["timestamp"].is_u64());
        assert!(matches!(
            EncryptedEnvelope::from_json("{not json"),
            Err(CryptoError::Envelope(_))
        ));
    }
}

#[cfg(test)]
mod properties {
    use super::*;
    use proptest::prelude::*;
    use proptest::sample::Index;

    fn pair() -> (EncryptionEngine, EncryptionEngine) {
        (
            EncryptionEngine::new(Arc::new(DeviceIdentity::generate())),
            EncryptionEngine::new(Arc::new(DeviceIdentity::generate())),
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// The recipient recovers every payload exactly.
        #[test]
        fn prop_decrypt_inverts_encrypt(plaintext in prop::collection::vec(any::<u8>(), 0..2048)) {
            let (alice, bob) = pair();
            let envelope = alice
                .encrypt(&plaintext, &bob.identity().agreement_public())
                .unwrap();
            prop_assert_eq!(bob.decrypt(&envelope).unwrap(), plaintext.clone());
            prop_assert_eq!(alice.decrypt(&envelope).unwrap(), plaintext);
        }

        /// Any single flipped ciphertext bit is caught by the tag.
        #[test]
        fn prop_flipped_bit_fails_authentication(
            plaintext in prop::collection::vec(any::<u8>(), 1..512),
            position in any::<Index>(),
            bit in 0u8..8,
        ) {
            let (alice, bob) = pair();
            let mut envelope = alice
                .encrypt(&plaintext, &bob.identity().agreement_public())
                .unwrap();
            let index = position.index(envelope.ciphertext.len());
            envelope.ciphertext[index] ^= 1 << bit;
            prop_assert!(matches!(bob.decrypt(&envelope), Err(CryptoError::Authentication)));
        }
    }
}

//! Cryptographic primitives for the HybridMesh messaging engine.
//!
//! # Core Capabilities
//!
//! - **Device Identity**: long-lived X25519 agreement key and Ed25519 signing key
//! - **Key Bundles**: signed public key advertisements exchanged over the mesh
//! - **Envelope Encryption**: X25519 + HKDF-SHA256 + ChaCha20-Poly1305
//!
//! # Security Principles
//!
//! - Private keys never leave [`DeviceIdentity`] and are zeroized on drop
//! - Peer keys are cached only after their bundle signature verifies
//! - Secrets are never logged; public keys appear only as BLAKE3 fingerprints
//! - A missing peer key is an error, never a plaintext fallback

pub mod envelope;
pub mod error;
pub mod identity;
pub mod keys;

pub use envelope::{EncryptedEnvelope, EncryptionEngine, NONCE_SIZE, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use identity::{fingerprint, DeviceIdentity};
pub use keys::{KeyBundle, PeerKeyCache};
pub use x25519_dalek::PublicKey as AgreementPublicKey;

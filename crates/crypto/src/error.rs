//! Error types for HybridMesh cryptographic operations.

use thiserror::Error;

/// Errors that can occur in key management and envelope encryption.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No public key is cached for the peer
    #[error("No public key known for device: {device_id}")]
    NoKey { device_id: String },

    /// Key bytes could not be decoded or are not a usable point
    #[error("Malformed key: {0}")]
    MalformedKey(String),

    /// AEAD tag mismatch
    #[error("Authentication failed: ciphertext or associated data was tampered with")]
    Authentication,

    /// Ed25519 signature did not verify
    #[error("Signature verification failed: {0}")]
    Signature(String),

    /// Envelope could not be parsed or is not addressed to this identity
    #[error("Invalid envelope: {0}")]
    Envelope(String),

    /// Bundle is signed by a different key than the one pinned for the device
    #[error("Key conflict for device {device_id}: bundle signed by an unpinned key")]
    KeyConflict { device_id: String },

    /// Identity file could not be read or written
    #[error("Key storage error: {0}")]
    KeyStorage(String),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

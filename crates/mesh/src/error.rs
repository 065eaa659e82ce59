//! Error types for HybridMesh mesh operations.
//!
//! Transient delivery conditions (no route, unreachable destination, transport
//! failure) are handled inside the delivery pipeline and never surface here.

use hybridmesh_crypto::CryptoError;
use thiserror::Error;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// No public key is cached for the recipient; a key request has been queued
    #[error("No public key for device: {device_id}")]
    NoKey { device_id: String },

    /// Cryptographic errors, including authentication failures
    #[error("Crypto error: {0}")]
    Crypto(CryptoError),

    /// Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport send failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message rejected before it entered the pipeline
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A blocking task panicked or was cancelled
    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl MeshError {
    /// Whether this is an AEAD authentication failure.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, MeshError::Crypto(CryptoError::Authentication))
    }
}

impl From<CryptoError> for MeshError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::NoKey { device_id } => MeshError::NoKey { device_id },
            other => MeshError::Crypto(other),
        }
    }
}

impl From<rusqlite::Error> for MeshError {
    fn from(err: rusqlite::Error) -> Self {
        MeshError::Storage(err.to_string())
    }
}

impl From<hybridmesh_core::CoreError> for MeshError {
    fn from(err: hybridmesh_core::CoreError) -> Self {
        MeshError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for MeshError {
    fn from(err: tokio::task::JoinError) -> Self {
        MeshError::TaskJoin(err.to_string())
    }
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

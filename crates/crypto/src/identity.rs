//! Long-lived device identity.
//!
//! Every device owns one X25519 key pair for envelope key agreement and one
//! Ed25519 key pair that signs the public key bundle it advertises. Both
//! secrets stay inside [`DeviceIdentity`]; only public material leaves it.
//!
//! # Storage format
//!
//! `load_or_generate` keeps both secrets in a single hex file
//! (`agreement_secret || signing_secret`, 64 bytes). On Unix the file is
//! created with `0600` permissions.

use crate::error::{CryptoError, CryptoResult};
use crate::keys::KeyBundle;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};
use x25519_dalek::{PublicKey as X25519PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

const SECRET_LEN: usize = 32;

/// Local device key material. Secrets are zeroized on drop.
pub struct DeviceIdentity {
    agreement_secret: StaticSecret,
    agreement_public: X25519PublicKey,
    signing_key: SigningKey,
}

impl DeviceIdentity {
    /// Generate a fresh identity from the OS entropy source.
    pub fn generate() -> Self {
        let agreement_secret = StaticSecret::random_from_rng(OsRng);
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_parts(agreement_secret, signing_key)
    }

    /// Rebuild an identity from raw secret bytes.
    ///
    /// The input arrays are zeroized before returning.
    pub fn from_secret_bytes(
        mut agreement: [u8; SECRET_LEN],
        mut signing: [u8; SECRET_LEN],
    ) -> Self {
        let agreement_secret = StaticSecret::from(agreement);
        let signing_key = SigningKey::from_bytes(&signing);
        agreement.zeroize();
        signing.zeroize();
        Self::from_parts(agreement_secret, signing_key)
    }

    fn from_parts(agreement_secret: StaticSecret, signing_key: SigningKey) -> Self {
        let agreement_public = X25519PublicKey::from(&agreement_secret);
        Self {
            agreement_secret,
            agreement_public,
            signing_key,
        }
    }

    /// Load the identity stored at `path`, creating and persisting a new one
    /// if the file does not exist.
    pub fn load_or_generate<P: AsRef<Path>>(path: P) -> CryptoResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            let identity = Self::load(path)?;
            debug!(
                path = %path.display(),
                fingerprint = %identity.fingerprint(),
                "Loaded device identity"
            );
            return Ok(identity);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!(
            path = %path.display(),
            fingerprint = %identity.fingerprint(),
            "Generated new device identity"
        );
        Ok(identity)
    }

    /// Read an identity file.
    pub fn load<P: AsRef<Path>>(path: P) -> CryptoResult<Self> {
        let encoded = Zeroizing::new(
            fs::read_to_string(path.as_ref())
                .map_err(|e| CryptoError::KeyStorage(e.to_string()))?,
        );
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| CryptoError::KeyStorage(format!("invalid identity file: {}", e)))?,
        );
        if bytes.len() != SECRET_LEN * 2 {
            return Err(CryptoError::KeyStorage(format!(
                "invalid identity file length: {} (expected {})",
                bytes.len(),
                SECRET_LEN * 2
            )));
        }

        let mut agreement = [0u8; SECRET_LEN];
        let mut signing = [0u8; SECRET_LEN];
        agreement.copy_from_slice(&bytes[..SECRET_LEN]);
        signing.copy_from_slice(&bytes[SECRET_LEN..]);
        Ok(Self::from_secret_bytes(agreement, signing))
    }

    /// Write the identity to `path`, replacing any existing file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> CryptoResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| CryptoError::KeyStorage(e.to_string()))?;
            }
        }

        let mut secret = Zeroizing::new(Vec::with_capacity(SECRET_LEN * 2));
        secret.extend_from_slice(&self.agreement_secret.to_bytes());
        secret.extend_from_slice(&self.signing_key.to_bytes());
        let encoded = Zeroizing::new(hex::encode(secret.as_slice()));

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(path)
            .map_err(|e| CryptoError::KeyStorage(e.to_string()))?;
        file.write_all(encoded.as_bytes())
            .map_err(|e| CryptoError::KeyStorage(e.to_string()))?;
        Ok(())
    }

    /// X25519 public key used for envelope key agreement.
    pub fn agreement_public(&self) -> X25519PublicKey {
        self.agreement_public
    }

    /// Ed25519 verifying key used for bundle signatures.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign arbitrary bytes with the identity key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// X25519 Diffie-Hellman with a peer's agreement key.
    pub fn diffie_hellman(&self, peer: &X25519PublicKey) -> SharedSecret {
        self.agreement_secret.diffie_hellman(peer)
    }

    /// Signed public key bundle advertised to peers as `device_id`.
    pub fn key_bundle(&self, device_id: &str) -> KeyBundle {
        KeyBundle::sign(device_id, self)
    }

    /// Short BLAKE3 fingerprint of the agreement public key, safe to log.
    pub fn fingerprint(&self) -> String {
        fingerprint(self.agreement_public.as_bytes())
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// First 16 hex characters of the BLAKE3 hash of `public_key`.
pub fn fingerprint(public_key: &[u8]) -> String {
    let hash = blake3::hash(public_key);
    hash.to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn test_generate_distinct_identities() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        assert_ne!(a.agreement_public().as_bytes(), b.agreement_public().as_bytes());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_shared_secret_agrees() {
        let alice = DeviceIdentity::generate();
        let bob = DeviceIdentity::generate();

        let ab = alice.diffie_hellman(&bob.agreement_public());
        let ba = bob.diffie_hellman(&alice.agreement_public());
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_sign_verify() {
        let identity = DeviceIdentity::generate();
        let signature = identity.sign(b"routing update");
        assert!(identity
            .verifying_key()
            .verify(b"routing update", &signature)
            .is_ok());
        assert!(identity
            .verifying_key()
            .verify(b"tampered update", &signature)
            .is_err());
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = DeviceIdentity::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = DeviceIdentity::load_or_generate(&path).unwrap();

        assert_eq!(
            first.agreement_public().as_bytes(),
            second.agreement_public().as_bytes()
        );
        assert_eq!(first.verifying_key(), second.verifying_key());
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        DeviceIdentity::load_or_generate(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        fs::write(&path, "abcd").unwrap();

        assert!(matches!(
            DeviceIdentity::load(&path),
            Err(CryptoError::KeyStorage(_))
        ));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let identity = DeviceIdentity::generate();
        let debug = format!("{:?}", identity);
        assert!(debug.contains(&identity.fingerprint()));
        assert!(!debug.contains(&hex::encode(identity.agreement_secret.to_bytes())));
    }
}

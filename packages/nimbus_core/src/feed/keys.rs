//! Feed identity keys
//!
//! A feed is identified by an Ed25519 public key. The writable copy of a
//! feed also holds the matching signing key, which signs every entry hash.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::FeedError;

/// Public identity of a feed.
///
/// Ordering is lexicographic over the key bytes; the ledger relies on this
/// as its deterministic tie-break between writers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedPublicKey([u8; 32]);

impl FeedPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, FeedError> {
        let bytes = hex::decode(s).map_err(|e| FeedError::KeyError(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FeedError::KeyError("feed key must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }

    /// Short form used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Check an Ed25519 signature made by this key.
    ///
    /// Returns `false` if the key bytes are not a valid curve point.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        match VerifyingKey::from_bytes(&self.0) {
            Ok(key) => key.verify(message, signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl fmt::Debug for FeedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedPublicKey({})", self.short())
    }
}

impl fmt::Display for FeedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// On-disk keystore form. Zeroized on drop.
#[derive(Serialize, Deserialize)]
struct FeedKeyStore {
    public_key: String,
    secret_key_bytes: [u8; 32],
}

impl Drop for FeedKeyStore {
    fn drop(&mut self) {
        self.secret_key_bytes.zeroize();
    }
}

/// Signing keypair of a writable feed.
pub struct FeedKeypair {
    signing_key: SigningKey,
}

impl FeedKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> FeedPublicKey {
        FeedPublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Load from a JSON keystore file.
    pub fn load(path: &Path) -> Result<Self, FeedError> {
        let data = std::fs::read(path).map_err(|e| FeedError::IoError(e.to_string()))?;
        let store: FeedKeyStore = serde_json::from_slice(&data)
            .map_err(|e| FeedError::SerializationError(e.to_string()))?;

        let keypair = Self::from_secret_bytes(&store.secret_key_bytes);
        if keypair.public_key().to_hex() != store.public_key {
            return Err(FeedError::KeyError(format!(
                "keystore {} does not match its public key",
                path.display()
            )));
        }
        Ok(keypair)
    }

    /// Persist to a JSON keystore file.
    pub fn save(&self, path: &Path) -> Result<(), FeedError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FeedError::IoError(e.to_string()))?;
        }

        let store = FeedKeyStore {
            public_key: self.public_key().to_hex(),
            secret_key_bytes: self.signing_key.to_bytes(),
        };
        let json = serde_json::to_string_pretty(&store)
            .map_err(|e| FeedError::SerializationError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| FeedError::IoError(e.to_string()))
    }
}

impl Clone for FeedKeypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
        }
    }
}

impl fmt::Debug for FeedKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedKeypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

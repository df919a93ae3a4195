//! AES-256-GCM AEAD wrapper and master-key management for the CMDB's
//! credential table (`spec.md` §2.1, §4.6). Grounded on the teacher
//! workspace's existing `ring` dependency (used there for DPoP proof
//! signing; extended here to `ring::aead` for at-rest encryption, since no
//! repository in the retrieval pack implements AEAD sealing directly).

#![warn(missing_docs, clippy::all)]

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use ring::aead::{self, BoundKey, NonceSequence, OpeningKey, SealingKey, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Length in bytes of an AES-256-GCM key.
pub const KEY_LEN: usize = 32;
/// Length in bytes of an AES-256-GCM nonce.
pub const NONCE_LEN: usize = 12;

/// Errors raised by keystore operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The master key file could not be read or written.
    #[error("key file error: {0}")]
    KeyFile(#[from] std::io::Error),
    /// The master key file did not contain exactly [`KEY_LEN`] bytes.
    #[error("master key must be exactly {KEY_LEN} bytes, found {0}")]
    BadKeyLength(usize),
    /// Encryption failed (should only happen on an OS RNG failure).
    #[error("encryption failed")]
    SealFailed,
    /// Decryption failed: wrong key, corrupted ciphertext, or tampering.
    #[error("decryption failed")]
    OpenFailed,
}

/// A single AEAD-sealed blob: ciphertext, the nonce used to produce it, and
/// the authentication tag (`ring` appends the tag to the ciphertext; we
/// split it back out at the call site so the CMDB's `iv`/`tag` columns,
/// per `spec.md` §4.6, stay independently addressable).
#[derive(Debug, Clone)]
pub struct SealedBlob {
    /// Nonce (IV) used for this encryption.
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the GCM authentication tag appended.
    pub ciphertext: Vec<u8>,
}

struct OneShotNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for OneShotNonce {
    fn advance(&mut self) -> Result<aead::Nonce, ring::error::Unspecified> {
        let bytes = self.0.take().ok_or(ring::error::Unspecified)?;
        Ok(aead::Nonce::assume_unique_for_key(bytes))
    }
}

/// Decrypts/encrypts credential blobs with a single process-scoped master
/// key. The key is never logged and lives only as long as this value.
pub struct Keystore {
    key_bytes: [u8; KEY_LEN],
    rng: SystemRandom,
}

impl Keystore {
    /// Build a keystore from raw key bytes (used for in-memory tests and
    /// for holding the "new" key during rotation before it is persisted).
    pub fn from_key_bytes(key_bytes: [u8; KEY_LEN]) -> Self {
        Self {
            key_bytes,
            rng: SystemRandom::new(),
        }
    }

    /// Generate a fresh random master key.
    pub fn generate_key() -> Result<[u8; KEY_LEN], CryptoError> {
        let rng = SystemRandom::new();
        let mut key = [0u8; KEY_LEN];
        rng.fill(&mut key).map_err(|_| CryptoError::SealFailed)?;
        Ok(key)
    }

    /// Load the master key from `path`, creating a new random one (with
    /// `0600` permissions) if the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            let bytes = fs::read(path)?;
            if bytes.len() != KEY_LEN {
                return Err(CryptoError::BadKeyLength(bytes.len()));
            }
            let mut key_bytes = [0u8; KEY_LEN];
            key_bytes.copy_from_slice(&bytes);
            Ok(Self::from_key_bytes(key_bytes))
        } else {
            let key_bytes = Self::generate_key()?;
            Self::persist_key(path, &key_bytes)?;
            Ok(Self::from_key_bytes(key_bytes))
        }
    }

    /// Write `key_bytes` to `path` with owner-only permissions.
    pub fn persist_key(path: &Path, key_bytes: &[u8; KEY_LEN]) -> Result<(), CryptoError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(key_bytes)?;
        Ok(())
    }

    /// Encrypt `plaintext`, returning a fresh random nonce plus ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedBlob, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::SealFailed)?;

        let unbound = UnboundKey::new(&aead::AES_256_GCM, &self.key_bytes)
            .map_err(|_| CryptoError::SealFailed)?;
        let mut sealing = SealingKey::new(unbound, OneShotNonce(Some(nonce_bytes)));

        let mut in_out = plaintext.to_vec();
        sealing
            .seal_in_place_append_tag(aead::Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::SealFailed)?;

        Ok(SealedBlob {
            nonce: nonce_bytes,
            ciphertext: in_out,
        })
    }

    /// Decrypt a blob produced by [`Keystore::seal`] with the same key.
    pub fn open(&self, blob: &SealedBlob) -> Result<Vec<u8>, CryptoError> {
        let unbound = UnboundKey::new(&aead::AES_256_GCM, &self.key_bytes)
            .map_err(|_| CryptoError::OpenFailed)?;
        let mut opening = OpeningKey::new(unbound, OneShotNonce(Some(blob.nonce)));

        let mut in_out = blob.ciphertext.clone();
        let plaintext = opening
            .open_in_place(aead::Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::OpenFailed)?;
        Ok(plaintext.to_vec())
    }

    /// Re-encrypt a blob sealed under this keystore's key so it can be
    /// opened by `new_key` instead. Used by `Store::rotate_key` to re-wrap
    /// every credential atomically without ever persisting plaintext.
    pub fn reseal_for(&self, blob: &SealedBlob, new_key: &Keystore) -> Result<SealedBlob, CryptoError> {
        let plaintext = self.open(blob)?;
        let resealed = new_key.seal(&plaintext)?;
        // Defensive zeroing: plaintext lived only in this local Vec.
        let mut plaintext = plaintext;
        plaintext.iter_mut().for_each(|b| *b = 0);
        Ok(resealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let key = Keystore::from_key_bytes(Keystore::generate_key().unwrap());
        let blob = key.seal(b"hunter2").unwrap();
        assert_ne!(blob.ciphertext, b"hunter2");
        let opened = key.open(&blob).unwrap();
        assert_eq!(opened, b"hunter2");
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let key_a = Keystore::from_key_bytes(Keystore::generate_key().unwrap());
        let key_b = Keystore::from_key_bytes(Keystore::generate_key().unwrap());
        let blob = key_a.seal(b"secret").unwrap();
        assert!(key_b.open(&blob).is_err());
    }

    #[test]
    fn ciphertext_shares_no_long_substring_with_plaintext() {
        let key = Keystore::from_key_bytes(Keystore::generate_key().unwrap());
        let plaintext = b"this-is-a-very-recognizable-password-string";
        let blob = key.seal(plaintext).unwrap();
        let hex: String = blob.ciphertext.iter().map(|b| format!("{b:02x}")).collect();
        let plaintext_str = String::from_utf8_lossy(plaintext);
        for window in plaintext_str.as_bytes().windows(8) {
            let needle = String::from_utf8_lossy(window);
            assert!(!hex.contains(needle.as_ref()));
        }
    }

    #[test]
    fn rotation_allows_new_key_to_decrypt() {
        let old_key = Keystore::from_key_bytes(Keystore::generate_key().unwrap());
        let new_key = Keystore::from_key_bytes(Keystore::generate_key().unwrap());
        let blob = old_key.seal(b"rotate-me").unwrap();
        let resealed = old_key.reseal_for(&blob, &new_key).unwrap();
        assert_eq!(new_key.open(&resealed).unwrap(), b"rotate-me");
        assert!(old_key.open(&resealed).is_err());
    }

    #[test]
    fn load_or_create_persists_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmdb_key");
        let ks1 = Keystore::load_or_create(&path).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        let ks2 = Keystore::load_or_create(&path).unwrap();
        let blob = ks1.seal(b"x").unwrap();
        assert_eq!(ks2.open(&blob).unwrap(), b"x");
    }
}

//! # Cryptographic Operations
//!
//! This module provides the primitives the engine builds on:
//! - Ed25519 node identity, used to recognise the same device across connections
//! - BLAKE3 content hashing for chunks and whole files
//! - Convergent chunk encryption (ChaCha20-Poly1305) keyed by a folder's content key
//!
//! Chunk encryption is deterministic: the nonce is a keyed hash of the
//! plaintext, so equal plaintext always yields equal ciphertext and the same
//! chunk address. That keeps deduplication working across peers and lets
//! Encrypted-level peers verify and relay chunks they cannot read.

use anyhow::Result;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::SyncError;

/// BLAKE3 digest used for chunk addresses and file content hashes.
pub type Hash = [u8; 32];

const NONCE_SIZE: usize = 12;
const CTX_CHUNK_NONCE: &str = "lvlt 2024-05 chunk nonce";

/// Cryptographic identity of this node.
///
/// Independent from folder secrets: it names the device, so two connections
/// to the same device (or a connection to ourselves) can be recognised.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: [u8; 32],
}

impl Identity {
    pub fn generate() -> Result<Self> {
        let mut csprng = OsRng {};
        let signing_key = SigningKey::generate(&mut csprng);

        Ok(Self { signing_key })
    }

    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate()?;
            identity.save(path)?;
            Ok(identity)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let identity_file: IdentityFile = toml::from_str(&content)?;

        let signing_key = SigningKey::from_bytes(&identity_file.secret_key);

        Ok(Self { signing_key })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let identity_file = IdentityFile {
            secret_key: self.signing_key.to_bytes(),
        };

        let content = toml::to_string_pretty(&identity_file)?;
        std::fs::write(path, content)?;

        // Set restrictive permissions
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    /// Node id: the public key bytes.
    pub fn node_id(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn node_id_hex(&self) -> String {
        hex::encode(self.node_id())
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(data, signature).is_ok()
    }
}

pub fn hash(data: &[u8]) -> Hash {
    blake3::hash(data).into()
}

pub fn hash_to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// Encrypt one chunk for storage and transfer.
///
/// Output layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
pub fn encrypt_chunk(content_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, SyncError> {
    let nonce_key = blake3::derive_key(CTX_CHUNK_NONCE, content_key);
    let nonce_source = blake3::keyed_hash(&nonce_key, plaintext);
    let nonce = Nonce::from_slice(&nonce_source.as_bytes()[..NONCE_SIZE]);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(content_key));
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SyncError::Protocol("chunk encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a chunk produced by [`encrypt_chunk`].
pub fn decrypt_chunk(content_key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, SyncError> {
    if data.len() < NONCE_SIZE {
        return Err(SyncError::Protocol("encrypted chunk is truncated".into()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(content_key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| SyncError::Protocol("chunk failed authentication".into()))
}

/// Verify an ed25519 signature made with a folder's signing key.
pub fn verify_signature(public_key: &VerifyingKey, data: &[u8], signature: &[u8]) -> bool {
    let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    public_key.verify(data, &Signature::from_bytes(&bytes)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_generation() {
        let identity = Identity::generate().unwrap();

        // Ed25519 public keys are 32 bytes = 64 hex chars
        assert_eq!(identity.node_id_hex().len(), 64);
    }

    #[test]
    fn test_identity_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("identity.key");

        let original_identity = Identity::generate().unwrap();
        original_identity.save(&key_path).unwrap();

        let loaded_identity = Identity::load(&key_path).unwrap();
        assert_eq!(original_identity.node_id(), loaded_identity.node_id());
    }

    #[test]
    fn test_identity_load_or_generate_new() {
        let temp_dir = TempDir::new().unwrap();
        let key_path = temp_dir.path().join("nested").join("identity.key");

        let identity = Identity::load_or_generate(&key_path).unwrap();
        assert!(key_path.exists());

        let again = Identity::load_or_generate(&key_path).unwrap();
        assert_eq!(identity.node_id(), again.node_id());
    }

    #[test]
    fn test_signing_and_verification() {
        let identity = Identity::generate().unwrap();
        let signature = identity.sign(b"hello");

        assert!(identity.verify(b"hello", &signature));
        assert!(!identity.verify(b"other", &signature));
        assert!(verify_signature(&identity.public_key(), b"hello", &signature.to_bytes()));
        assert!(!verify_signature(&identity.public_key(), b"hello", &[0u8; 12]));
    }

    #[test]
    fn test_hash_deterministic() {
        let a = hash(b"test data for hashing");
        assert_eq!(a, hash(b"test data for hashing"));
        assert_ne!(a, hash(b"different test data"));
        assert_eq!(hash_to_hex(&[0u8; 32]), "0".repeat(64));
    }

    #[test]
    fn test_chunk_encryption_is_convergent() {
        let key = [7u8; 32];
        let a = encrypt_chunk(&key, b"same plaintext").unwrap();
        let b = encrypt_chunk(&key, b"same plaintext").unwrap();
        assert_eq!(a, b);
        assert_ne!(&a[NONCE_SIZE..], b"same plaintext");

        let other_key = encrypt_chunk(&[8u8; 32], b"same plaintext").unwrap();
        assert_ne!(a, other_key);

        assert_eq!(decrypt_chunk(&key, &a).unwrap(), b"same plaintext");
    }

    #[test]
    fn test_chunk_decryption_rejects_tampering() {
        let key = [1u8; 32];
        let mut data = encrypt_chunk(&key, b"payload").unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;

        assert!(decrypt_chunk(&key, &data).is_err());
        assert!(decrypt_chunk(&[2u8; 32], &encrypt_chunk(&key, b"payload").unwrap()).is_err());
        assert!(decrypt_chunk(&key, &[0u8; 4]).is_err());
    }
}

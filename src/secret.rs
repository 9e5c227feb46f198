//! # Secret and Capability Model
//!
//! A folder is rooted in one [`Secret`]. The Secret exists in four forms, each
//! deterministically derivable from the stronger ones and never the other way
//! around:
//!
//! | Level | Payload | Can |
//! |---|---|---|
//! | Owner | 32-byte seed | everything, mint ReadWrite secrets |
//! | ReadWrite | ed25519 signing key | fetch and push (sign entries) |
//! | ReadOnly | public key + content key | fetch and decrypt |
//! | Encrypted | public key | store and relay ciphertext |
//!
//! Every form maps to the same [`FolderId`], computed from the public key, so
//! peers holding different levels still find each other as the same folder.
//!
//! Secrets are exchanged as text: a level letter followed by URL-safe base64 of
//! the payload and a 4-byte checksum. A link is the text form prefixed with
//! `lvlt:`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SyncError};

/// URI scheme for shareable folder links.
pub const LINK_PREFIX: &str = "lvlt:";

const CTX_SIGNING_KEY: &str = "lvlt 2024-05 owner seed to signing key";
const CTX_CONTENT_KEY: &str = "lvlt 2024-05 signing key to content key";
const CTX_FOLDER_ID: &str = "lvlt 2024-05 public key to folder id";
const CTX_AUTH_OWNER: &str = "lvlt 2024-05 owner session auth";
const CTX_AUTH_READ_WRITE: &str = "lvlt 2024-05 read-write session auth";
const CTX_AUTH_READ_ONLY: &str = "lvlt 2024-05 read-only session auth";
const CTX_AUTH_ENCRYPTED: &str = "lvlt 2024-05 encrypted session auth";

const CHECKSUM_LEN: usize = 4;

/// Capability level, ordered `Owner > ReadWrite > ReadOnly > Encrypted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    Encrypted,
    ReadOnly,
    ReadWrite,
    Owner,
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Owner, Level::ReadWrite, Level::ReadOnly, Level::Encrypted];

    fn letter(self) -> char {
        match self {
            Level::Owner => 'A',
            Level::ReadWrite => 'B',
            Level::ReadOnly => 'C',
            Level::Encrypted => 'D',
        }
    }

    fn from_letter(c: char) -> Option<Self> {
        match c {
            'A' => Some(Level::Owner),
            'B' => Some(Level::ReadWrite),
            'C' => Some(Level::ReadOnly),
            'D' => Some(Level::Encrypted),
            _ => None,
        }
    }

    /// Whether this level may read plaintext content.
    pub fn can_read(self) -> bool {
        self >= Level::ReadOnly
    }

    /// Whether this level may sign new entries.
    pub fn can_write(self) -> bool {
        self >= Level::ReadWrite
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Owner => "owner",
            Level::ReadWrite => "read-write",
            Level::ReadOnly => "read-only",
            Level::Encrypted => "encrypted",
        };
        f.write_str(name)
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Ok(Level::Owner),
            "read-write" | "readwrite" | "rw" => Ok(Level::ReadWrite),
            "read-only" | "readonly" | "ro" => Ok(Level::ReadOnly),
            "encrypted" | "enc" => Ok(Level::Encrypted),
            other => Err(format!("unknown capability level: {}", other)),
        }
    }
}

/// Stable folder identifier shared by every form of one Secret.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FolderId(pub [u8; 32]);

impl FolderId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for FolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderId({})", self.short())
    }
}

impl FromStr for FolderId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(FolderId(bytes))
    }
}

/// Root credential of a folder in one of its four forms.
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    Owner([u8; 32]),
    ReadWrite([u8; 32]),
    ReadOnly { public_key: [u8; 32], content_key: [u8; 32] },
    Encrypted([u8; 32]),
}

impl Secret {
    /// Mint a fresh Owner secret.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Secret::Owner(seed)
    }

    pub fn level(&self) -> Level {
        match self {
            Secret::Owner(_) => Level::Owner,
            Secret::ReadWrite(_) => Level::ReadWrite,
            Secret::ReadOnly { .. } => Level::ReadOnly,
            Secret::Encrypted(_) => Level::Encrypted,
        }
    }

    /// Derive a strictly weaker form of this secret.
    pub fn derive(&self, target: Level) -> Result<Secret> {
        let from = self.level();
        if target >= from {
            return Err(SyncError::UnsupportedDowngrade { from, to: target });
        }

        let mut current = self.clone();
        while current.level() > target {
            current = current.step_down();
        }
        Ok(current)
    }

    fn step_down(&self) -> Secret {
        match self {
            Secret::Owner(seed) => Secret::ReadWrite(blake3::derive_key(CTX_SIGNING_KEY, seed)),
            Secret::ReadWrite(signing) => Secret::ReadOnly {
                public_key: SigningKey::from_bytes(signing).verifying_key().to_bytes(),
                content_key: blake3::derive_key(CTX_CONTENT_KEY, signing),
            },
            Secret::ReadOnly { public_key, .. } => Secret::Encrypted(*public_key),
            Secret::Encrypted(public_key) => Secret::Encrypted(*public_key),
        }
    }

    /// Same form at `level`, or a derived weaker one.
    pub fn at_level(&self, level: Level) -> Option<Secret> {
        if level == self.level() {
            Some(self.clone())
        } else {
            self.derive(level).ok()
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        match self {
            Secret::Encrypted(pk) => *pk,
            Secret::ReadOnly { public_key, .. } => *public_key,
            other => match other.step_down() {
                Secret::ReadOnly { public_key, .. } => public_key,
                deeper => deeper.public_key_bytes(),
            },
        }
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.public_key_bytes())
            .map_err(|_| SyncError::Protocol("secret carries an invalid public key".into()))
    }

    /// Signing key, available to Owner and ReadWrite forms only.
    pub fn signing_key(&self) -> Option<SigningKey> {
        match self {
            Secret::Owner(_) => self.step_down().signing_key(),
            Secret::ReadWrite(signing) => Some(SigningKey::from_bytes(signing)),
            _ => None,
        }
    }

    /// Chunk encryption key, available to ReadOnly and stronger.
    pub fn content_key(&self) -> Option<[u8; 32]> {
        match self {
            Secret::ReadOnly { content_key, .. } => Some(*content_key),
            Secret::Encrypted(_) => None,
            other => other.step_down().content_key(),
        }
    }

    pub fn fingerprint(&self) -> FolderId {
        FolderId(blake3::derive_key(CTX_FOLDER_ID, &self.public_key_bytes()))
    }

    /// Key proving possession of `level` during a handshake. Only holders of
    /// `level` or a stronger form can compute it.
    pub fn auth_key(&self, level: Level) -> Option<[u8; 32]> {
        let form = self.at_level(level)?;
        let key = match &form {
            Secret::Owner(seed) => blake3::derive_key(CTX_AUTH_OWNER, seed),
            Secret::ReadWrite(signing) => blake3::derive_key(CTX_AUTH_READ_WRITE, signing),
            Secret::ReadOnly { content_key, .. } => blake3::derive_key(CTX_AUTH_READ_ONLY, content_key),
            Secret::Encrypted(public_key) => blake3::derive_key(CTX_AUTH_ENCRYPTED, public_key),
        };
        Some(key)
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            Secret::Owner(bytes) | Secret::ReadWrite(bytes) | Secret::Encrypted(bytes) => bytes.to_vec(),
            Secret::ReadOnly { public_key, content_key } => {
                let mut payload = public_key.to_vec();
                payload.extend_from_slice(content_key);
                payload
            }
        }
    }

    /// Shareable `lvlt:` link for this form.
    pub fn to_link(&self) -> String {
        format!("{}{}", LINK_PREFIX, self)
    }

    /// Parse a `lvlt:` link. Any malformed input reports `Wrong link format`.
    pub fn from_link(link: &str) -> Result<Secret> {
        let encoded = link
            .trim()
            .strip_prefix(LINK_PREFIX)
            .ok_or(SyncError::WrongLinkFormat)?;
        encoded.parse().map_err(|_| SyncError::WrongLinkFormat)
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = self.payload();
        let checksum = blake3::hash(&bytes);
        bytes.extend_from_slice(&checksum.as_bytes()[..CHECKSUM_LEN]);
        write!(f, "{}{}", self.level().letter(), URL_SAFE_NO_PAD.encode(bytes))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("level", &self.level())
            .field("folder", &self.fingerprint())
            .finish()
    }
}

impl FromStr for Secret {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        let level = chars
            .next()
            .and_then(Level::from_letter)
            .ok_or(SyncError::WrongLinkFormat)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(chars.as_str())
            .map_err(|_| SyncError::WrongLinkFormat)?;

        if bytes.len() < CHECKSUM_LEN {
            return Err(SyncError::WrongLinkFormat);
        }
        let (payload, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if blake3::hash(payload).as_bytes()[..CHECKSUM_LEN] != *checksum {
            return Err(SyncError::WrongLinkFormat);
        }

        let key = |range: std::ops::Range<usize>| -> [u8; 32] {
            let mut out = [0u8; 32];
            out.copy_from_slice(&payload[range]);
            out
        };

        let secret = match (level, payload.len()) {
            (Level::Owner, 32) => Secret::Owner(key(0..32)),
            (Level::ReadWrite, 32) => Secret::ReadWrite(key(0..32)),
            (Level::ReadOnly, 64) => Secret::ReadOnly {
                public_key: key(0..32),
                content_key: key(32..64),
            },
            (Level::Encrypted, 32) => Secret::Encrypted(key(0..32)),
            _ => return Err(SyncError::WrongLinkFormat),
        };

        // Weak forms carry a raw public key; reject ones that are not curve points.
        secret.verifying_key().map_err(|_| SyncError::WrongLinkFormat)?;
        Ok(secret)
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

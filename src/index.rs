//! # Content Index
//!
//! Per-folder, content-addressed description of every path the folder knows:
//! relative path → [`FileEntry`] (content hash, ordered chunk manifest,
//! modification time and a per-path revision counter).
//!
//! Entries are signed with the folder's signing key, so only Owner and
//! ReadWrite holders can produce them and every peer can verify them.
//!
//! ## Ordering rules
//!
//! - Revision counters only increase. A higher revision always wins,
//!   whatever the wall clocks of the peers say.
//! - At equal revisions, equal content hashes are `Identical` and different
//!   ones are a `Conflict`.
//! - Conflicts resolve to the entry with the lexicographically larger
//!   content hash. A losing file survives as a conflict copy whose path is
//!   derived from its own hash. Picking a maximum and collecting a union of
//!   copies is commutative and associative, so any number of peers converge
//!   on the same pair of files whatever order they meet in.

use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::crypto::{self, Hash};
use crate::error::{Result, SyncError};
use crate::secret::Secret;

/// Fixed chunk size for file content.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Per-folder system directory holding the index, chunks and archive.
pub const SYSTEM_DIR: &str = ".lvlt";

const DIRECTORY_HASH_INPUT: &[u8] = b"lvlt:directory";
const DELETED_HASH: Hash = [0u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Deleted,
}

/// One chunk of a file: the address of its encrypted form and where its
/// plaintext sits in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRef {
    pub hash: Hash,
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub kind: EntryKind,
    pub revision: u64,
    pub content_hash: Hash,
    pub size: u64,
    pub chunks: Vec<ChunkRef>,
    pub modified_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    path: &'a str,
    kind: EntryKind,
    revision: u64,
    content_hash: &'a Hash,
    size: u64,
    chunks: &'a [ChunkRef],
    modified_at_ms: i64,
}

impl FileEntry {
    /// Build and sign a file entry from its full content.
    pub fn file(
        path: &str,
        content: &[u8],
        revision: u64,
        modified_at: DateTime<Utc>,
        secret: &Secret,
    ) -> Result<FileEntry> {
        let signing_key = writer_key(secret)?;
        let content_key = secret
            .content_key()
            .ok_or(SyncError::WriteNotPermitted(secret.level()))?;

        let mut chunks = Vec::with_capacity(content.len().div_ceil(CHUNK_SIZE));
        for (i, plaintext) in content.chunks(CHUNK_SIZE).enumerate() {
            let encrypted = crypto::encrypt_chunk(&content_key, plaintext)?;
            chunks.push(ChunkRef {
                hash: crypto::hash(&encrypted),
                offset: (i * CHUNK_SIZE) as u64,
                length: plaintext.len() as u32,
            });
        }

        let mut entry = FileEntry {
            path: path.to_string(),
            kind: EntryKind::File,
            revision,
            content_hash: crypto::hash(content),
            size: content.len() as u64,
            chunks,
            modified_at: truncate_millis(modified_at),
            signature: Vec::new(),
        };
        entry.sign(&signing_key)?;
        Ok(entry)
    }

    pub fn directory(path: &str, revision: u64, secret: &Secret) -> Result<FileEntry> {
        Self::bodiless(path, EntryKind::Directory, revision, secret)
    }

    /// Tombstone recording that `path` no longer exists.
    pub fn deleted(path: &str, revision: u64, secret: &Secret) -> Result<FileEntry> {
        Self::bodiless(path, EntryKind::Deleted, revision, secret)
    }

    fn bodiless(path: &str, kind: EntryKind, revision: u64, secret: &Secret) -> Result<FileEntry> {
        let signing_key = writer_key(secret)?;
        let content_hash = match kind {
            EntryKind::Directory => crypto::hash(DIRECTORY_HASH_INPUT),
            _ => DELETED_HASH,
        };
        let mut entry = FileEntry {
            path: path.to_string(),
            kind,
            revision,
            content_hash,
            size: 0,
            chunks: Vec::new(),
            // Bodiless entries carry no time so that equal decisions on different peers are byte-identical.
            modified_at: epoch(),
            signature: Vec::new(),
        };
        entry.sign(&signing_key)?;
        Ok(entry)
    }

    fn signed_bytes(&self) -> Result<Vec<u8>> {
        let fields = SignedFields {
            path: &self.path,
            kind: self.kind,
            revision: self.revision,
            content_hash: &self.content_hash,
            size: self.size,
            chunks: &self.chunks,
            modified_at_ms: self.modified_at.timestamp_millis(),
        };
        Ok(bincode::serialize(&fields)?)
    }

    pub fn sign(&mut self, signing_key: &SigningKey) -> Result<()> {
        use ed25519_dalek::Signer;
        let bytes = self.signed_bytes()?;
        self.signature = signing_key.sign(&bytes).to_bytes().to_vec();
        Ok(())
    }

    pub fn verify(&self, public_key: &VerifyingKey) -> bool {
        match self.signed_bytes() {
            Ok(bytes) => crypto::verify_signature(public_key, &bytes, &self.signature),
            Err(_) => false,
        }
    }

    pub fn summary(&self) -> SummaryEntry {
        SummaryEntry {
            path: self.path.clone(),
            revision: self.revision,
            content_hash: self.content_hash,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

fn writer_key(secret: &Secret) -> Result<SigningKey> {
    secret
        .signing_key()
        .ok_or(SyncError::WriteNotPermitted(secret.level()))
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(at.timestamp_millis())
        .single()
        .unwrap_or_else(epoch)
}

/// Compact per-path state exchanged before any chunk transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub path: String,
    pub revision: u64,
    pub content_hash: Hash,
}

pub type IndexSummary = Vec<SummaryEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaKind {
    LocalNewer,
    RemoteNewer,
    Conflict,
    Identical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDelta {
    pub path: String,
    pub kind: DeltaKind,
    pub local: Option<SummaryEntry>,
    pub remote: Option<SummaryEntry>,
}

/// Compare two versions of one path.
pub fn compare(local: Option<&SummaryEntry>, remote: Option<&SummaryEntry>) -> DeltaKind {
    match (local, remote) {
        (Some(_), None) => DeltaKind::LocalNewer,
        (None, Some(_)) => DeltaKind::RemoteNewer,
        (None, None) => DeltaKind::Identical,
        (Some(l), Some(r)) => {
            if l.revision > r.revision {
                DeltaKind::LocalNewer
            } else if l.revision < r.revision {
                DeltaKind::RemoteNewer
            } else if l.content_hash == r.content_hash {
                DeltaKind::Identical
            } else {
                DeltaKind::Conflict
            }
        }
    }
}

/// Per-path comparison of two index summaries, ordered by path.
pub fn diff(local: &[SummaryEntry], remote: &[SummaryEntry]) -> Vec<FileDelta> {
    let mut paths: BTreeMap<&str, (Option<&SummaryEntry>, Option<&SummaryEntry>)> = BTreeMap::new();
    for entry in local {
        paths.entry(&entry.path).or_default().0 = Some(entry);
    }
    for entry in remote {
        paths.entry(&entry.path).or_default().1 = Some(entry);
    }

    paths
        .into_iter()
        .map(|(path, (l, r))| FileDelta {
            path: path.to_string(),
            kind: compare(l, r),
            local: l.cloned(),
            remote: r.cloned(),
        })
        .collect()
}

/// Whether `candidate` should replace `current` for the same path.
pub fn wins(candidate: &SummaryEntry, current: Option<&SummaryEntry>) -> bool {
    match current {
        None => true,
        Some(current) => {
            (candidate.revision, candidate.content_hash) > (current.revision, current.content_hash)
        }
    }
}

/// Path a losing file is preserved under: `dir/name (conflict 1a2b3c4d).ext`.
pub fn conflict_copy_path(path: &str, loser_hash: &Hash) -> String {
    let tag = format!(" (conflict {})", hex::encode(&loser_hash[..4]));
    let (dir, name) = match path.rfind('/') {
        Some(idx) => (&path[..=idx], &path[idx + 1..]),
        None => ("", path),
    };
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}{}{}{}", dir, &name[..dot], tag, &name[dot..]),
        _ => format!("{}{}{}", dir, name, tag),
    }
}

/// Conflict copy entry for a losing file. Ed25519 signatures are
/// deterministic, so every writer derives a byte-identical copy.
pub fn make_conflict_copy(loser: &FileEntry, secret: &Secret) -> Result<Option<FileEntry>> {
    if !loser.is_file() {
        return Ok(None);
    }
    let signing_key = writer_key(secret)?;
    let mut copy = loser.clone();
    copy.path = conflict_copy_path(&loser.path, &loser.content_hash);
    copy.sign(&signing_key)?;
    Ok(Some(copy))
}

/// Local filesystem observation backing an entry. Never signed or sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub size: u64,
    pub mtime_ms: i64,
}

impl Observation {
    pub fn of(metadata: &std::fs::Metadata) -> Observation {
        let mtime_ms = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        Observation {
            size: metadata.len(),
            mtime_ms,
        }
    }
}

/// Entry counts reported to the shell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStatus {
    pub files: usize,
    pub directories: usize,
    pub deleted: usize,
    pub total_size: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct IndexFile {
    entries: Vec<FileEntry>,
    observed: BTreeMap<String, Observation>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentIndex {
    entries: BTreeMap<String, FileEntry>,
    observed: HashMap<String, Observation>,
}

impl ContentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a persisted index; a missing file yields an empty index.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read(path)?;
        let file: IndexFile = serde_json::from_slice(&data)?;
        Ok(Self {
            entries: file.entries.into_iter().map(|e| (e.path.clone(), e)).collect(),
            observed: file.observed.into_iter().collect(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| SyncError::Protocol("index path has no parent".into()))?;
        std::fs::create_dir_all(dir)?;

        let file = IndexFile {
            entries: self.entries.values().cloned().collect(),
            observed: self.observed.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec(&file)?)?;
        tmp.persist(path).map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> IndexSummary {
        self.entries.values().map(FileEntry::summary).collect()
    }

    pub fn status(&self) -> IndexStatus {
        let mut status = IndexStatus::default();
        for entry in self.entries.values() {
            match entry.kind {
                EntryKind::File => {
                    status.files += 1;
                    status.total_size += entry.size;
                }
                EntryKind::Directory => status.directories += 1,
                EntryKind::Deleted => status.deleted += 1,
            }
        }
        status
    }

    /// Index new local content for `path`. The revision always increases.
    /// Touches nothing but this index.
    pub fn apply_local_change(
        &mut self,
        path: &str,
        content: &[u8],
        modified_at: DateTime<Utc>,
        secret: &Secret,
    ) -> Result<FileEntry> {
        let revision = self.next_revision(path);
        let entry = FileEntry::file(path, content, revision, modified_at, secret)?;
        debug!("Indexed {} rev={} chunks={}", path, revision, entry.chunks.len());
        self.entries.insert(path.to_string(), entry.clone());
        Ok(entry)
    }

    pub fn apply_local_directory(&mut self, path: &str, secret: &Secret) -> Result<Option<FileEntry>> {
        if matches!(self.entries.get(path), Some(e) if e.kind == EntryKind::Directory) {
            return Ok(None);
        }
        let entry = FileEntry::directory(path, self.next_revision(path), secret)?;
        self.entries.insert(path.to_string(), entry.clone());
        Ok(Some(entry))
    }

    /// Record that `path` vanished locally. No-op for unknown or already deleted paths.
    pub fn apply_local_deletion(&mut self, path: &str, secret: &Secret) -> Result<Option<FileEntry>> {
        match self.entries.get(path) {
            Some(e) if e.kind != EntryKind::Deleted => {}
            _ => return Ok(None),
        }
        let entry = FileEntry::deleted(path, self.next_revision(path), secret)?;
        self.entries.insert(path.to_string(), entry.clone());
        self.observed.remove(path);
        Ok(Some(entry))
    }

    fn next_revision(&self, path: &str) -> u64 {
        self.entries.get(path).map(|e| e.revision + 1).unwrap_or(1)
    }

    /// Accept a remote entry if its signature verifies and it beats the current one.
    pub fn put_remote(&mut self, entry: FileEntry, public_key: &VerifyingKey) -> Result<bool> {
        validate_relative_path(&entry.path)?;
        if !entry.verify(public_key) {
            return Err(SyncError::InvalidSignature(entry.path));
        }
        let current = self.entries.get(&entry.path).map(FileEntry::summary);
        if !wins(&entry.summary(), current.as_ref()) {
            return Ok(false);
        }
        self.entries.insert(entry.path.clone(), entry);
        Ok(true)
    }

    /// Insert an entry created locally (e.g. a conflict copy) without the win check.
    pub fn insert_local(&mut self, entry: FileEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    pub fn record_observation(&mut self, path: &str, observation: Observation) {
        self.observed.insert(path.to_string(), observation);
    }

    pub fn forget_observation(&mut self, path: &str) {
        self.observed.remove(path);
    }

    pub fn observation(&self, path: &str) -> Option<Observation> {
        self.observed.get(path).copied()
    }

    /// First file entry whose manifest contains the chunk.
    pub fn containing_chunk(&self, hash: &Hash) -> Option<(&FileEntry, ChunkRef)> {
        self.entries
            .values()
            .filter(|e| e.is_file())
            .find_map(|e| e.chunks.iter().find(|c| &c.hash == hash).map(|c| (e, *c)))
    }

    pub fn contains_chunk(&self, hash: &Hash) -> bool {
        self.containing_chunk(hash).is_some()
    }

    /// Merge a scan into this index, returning the entries that changed.
    pub fn apply_scan(&mut self, outcome: ScanOutcome) -> Vec<FileEntry> {
        for (path, observation) in outcome.observations {
            self.observed.insert(path, observation);
        }
        for entry in &outcome.changed {
            self.entries.insert(entry.path.clone(), entry.clone());
        }
        outcome.changed
    }
}

/// Glob-based ignore rules. The system directory is always ignored.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    patterns: Vec<glob::Pattern>,
}

impl IgnoreList {
    pub fn new(patterns: &[String]) -> anyhow::Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| glob::Pattern::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        if rel_path == SYSTEM_DIR || rel_path.starts_with(&format!("{}/", SYSTEM_DIR)) {
            return true;
        }
        let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        self.patterns
            .iter()
            .any(|p| p.matches(rel_path) || p.matches(name))
    }
}

/// Normalised relative path (`/`-separated) of `abs` under `root`.
pub fn relative_path(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Reject paths that could escape the folder root.
pub fn validate_relative_path(path: &str) -> Result<()> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|c| c.is_empty() || c == "." || c == "..");
    if bad {
        return Err(SyncError::Protocol(format!("unsafe entry path: {:?}", path)));
    }
    Ok(())
}

/// Absolute location of an entry path inside `root`.
pub fn resolve_path(root: &Path, path: &str) -> Result<PathBuf> {
    validate_relative_path(path)?;
    Ok(path.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part)))
}

/// Result of a full rescan: entries whose state changed plus fresh observations.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub changed: Vec<FileEntry>,
    pub observations: Vec<(String, Observation)>,
    pub unchanged: usize,
}

/// Full rebuild of a folder's state from the filesystem.
///
/// Unchanged files (same size and mtime as last observed, or same content
/// hash) keep their entry. Changed content gets `revision + 1`, vanished
/// paths become tombstones. Requires a writer secret.
pub fn scan(root: &Path, secret: &Secret, previous: &ContentIndex, ignore: &IgnoreList) -> Result<ScanOutcome> {
    writer_key(secret)?;
    let mut outcome = ScanOutcome::default();
    let mut seen = std::collections::HashSet::new();
    scan_dir(root, root, secret, previous, ignore, &mut seen, &mut outcome)?;

    for entry in previous.entries() {
        if entry.kind == EntryKind::Deleted || seen.contains(&entry.path) || ignore.is_ignored(&entry.path) {
            continue;
        }
        let tombstone = FileEntry::deleted(&entry.path, entry.revision + 1, secret)?;
        info!("Detected removal of {}", entry.path);
        outcome.changed.push(tombstone);
    }
    Ok(outcome)
}

fn scan_dir(
    root: &Path,
    dir: &Path,
    secret: &Secret,
    previous: &ContentIndex,
    ignore: &IgnoreList,
    seen: &mut std::collections::HashSet<String>,
    outcome: &mut ScanOutcome,
) -> Result<()> {
    for dir_entry in std::fs::read_dir(dir)? {
        let dir_entry = dir_entry?;
        let abs = dir_entry.path();
        let Some(rel) = relative_path(root, &abs) else {
            continue;
        };
        if ignore.is_ignored(&rel) {
            continue;
        }

        let metadata = match std::fs::symlink_metadata(&abs) {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to stat {}: {}", abs.display(), e);
                continue;
            }
        };

        if metadata.is_dir() {
            seen.insert(rel.clone());
            match previous.get(&rel) {
                Some(e) if e.kind == EntryKind::Directory => outcome.unchanged += 1,
                prev => {
                    let revision = prev.map(|e| e.revision + 1).unwrap_or(1);
                    outcome.changed.push(FileEntry::directory(&rel, revision, secret)?);
                }
            }
            scan_dir(root, &abs, secret, previous, ignore, seen, outcome)?;
        } else if metadata.is_file() {
            seen.insert(rel.clone());
            let observation = Observation::of(&metadata);
            let prev = previous.get(&rel);

            if matches!(prev, Some(e) if e.is_file()) && previous.observation(&rel) == Some(observation) {
                outcome.unchanged += 1;
                continue;
            }

            let content = match std::fs::read(&abs) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to read {}: {}", abs.display(), e);
                    continue;
                }
            };
            outcome.observations.push((rel.clone(), observation));

            if matches!(prev, Some(e) if e.is_file() && e.content_hash == crypto::hash(&content)) {
                outcome.unchanged += 1;
                continue;
            }

            let revision = prev.map(|e| e.revision + 1).unwrap_or(1);
            let modified_at = Utc
                .timestamp_millis_opt(observation.mtime_ms)
                .single()
                .unwrap_or_else(Utc::now);
            outcome
                .changed
                .push(FileEntry::file(&rel, &content, revision, modified_at, secret)?);
        } else {
            debug!("Skipping unsupported file type: {}", abs.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::Level;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn summary(path: &str, revision: u64, hash_byte: u8) -> SummaryEntry {
        SummaryEntry {
            path: path.to_string(),
            revision,
            content_hash: [hash_byte; 32],
        }
    }

    #[test]
    fn test_apply_local_change_bumps_revision() {
        let secret = Secret::generate();
        let mut index = ContentIndex::new();

        let first = index.apply_local_change("a.txt", b"one", Utc::now(), &secret).unwrap();
        let second = index.apply_local_change("a.txt", b"one", Utc::now(), &secret).unwrap();
        let third = index.apply_local_change("a.txt", b"two", Utc::now(), &secret).unwrap();

        assert_eq!(first.revision, 1);
        assert!(second.revision > first.revision);
        assert!(third.revision > second.revision);
        assert_eq!(index.get("a.txt").unwrap().revision, 3);
    }

    #[test]
    fn test_apply_local_change_requires_writer() {
        let read_only = Secret::generate().derive(Level::ReadOnly).unwrap();
        let mut index = ContentIndex::new();

        let err = index.apply_local_change("a.txt", b"x", Utc::now(), &read_only).unwrap_err();
        assert!(matches!(err, SyncError::WriteNotPermitted(Level::ReadOnly)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_file_entry_chunking() {
        let secret = Secret::generate();
        let content = vec![3u8; CHUNK_SIZE * 2 + 10];
        let entry = FileEntry::file("big.bin", &content, 1, Utc::now(), &secret).unwrap();

        assert_eq!(entry.chunks.len(), 3);
        assert_eq!(entry.chunks[2].offset, (CHUNK_SIZE * 2) as u64);
        assert_eq!(entry.chunks[2].length, 10);
        // Identical plaintext chunks share one address
        assert_eq!(entry.chunks[0].hash, entry.chunks[1].hash);
        assert_eq!(entry.size, content.len() as u64);
    }

    #[test]
    fn test_signature_verification() {
        let secret = Secret::generate();
        let other = Secret::generate();
        let mut entry = FileEntry::file("a.txt", b"data", 1, Utc::now(), &secret).unwrap();
        let key = secret.verifying_key().unwrap();

        assert!(entry.verify(&key));
        assert!(!entry.verify(&other.verifying_key().unwrap()));

        entry.revision = 99;
        assert!(!entry.verify(&key));
    }

    #[test]
    fn test_put_remote_rejects_forged_and_older() {
        let secret = Secret::generate();
        let key = secret.verifying_key().unwrap();
        let forger = Secret::generate();
        let mut index = ContentIndex::new();

        let v2 = FileEntry::file("a.txt", b"v2", 2, Utc::now(), &secret).unwrap();
        assert!(index.put_remote(v2.clone(), &key).unwrap());

        let v1 = FileEntry::file("a.txt", b"v1", 1, Utc::now(), &secret).unwrap();
        assert!(!index.put_remote(v1, &key).unwrap());

        let forged = FileEntry::file("a.txt", b"evil", 10, Utc::now(), &forger).unwrap();
        assert!(matches!(index.put_remote(forged, &key), Err(SyncError::InvalidSignature(_))));
        assert_eq!(index.get("a.txt").unwrap(), &v2);
    }

    #[test]
    fn test_put_remote_rejects_unsafe_paths() {
        let secret = Secret::generate();
        let key = secret.verifying_key().unwrap();
        let mut index = ContentIndex::new();

        for path in ["../escape", "/etc/passwd", "a//b", "a/./b"] {
            let entry = FileEntry::file(path, b"x", 1, Utc::now(), &secret).unwrap();
            assert!(index.put_remote(entry, &key).is_err(), "{}", path);
        }
    }

    #[test]
    fn test_diff_classification() {
        let local = vec![
            summary("both-same", 2, 1),
            summary("local-newer", 3, 1),
            summary("remote-newer", 1, 1),
            summary("conflict", 4, 1),
            summary("local-only", 1, 1),
        ];
        let remote = vec![
            summary("both-same", 2, 1),
            summary("local-newer", 2, 9),
            summary("remote-newer", 2, 1),
            summary("conflict", 4, 2),
            summary("remote-only", 1, 1),
        ];

        let kinds: Vec<(String, DeltaKind)> = diff(&local, &remote)
            .into_iter()
            .map(|d| (d.path, d.kind))
            .collect();

        assert_eq!(
            kinds,
            vec![
                ("both-same".to_string(), DeltaKind::Identical),
                ("conflict".to_string(), DeltaKind::Conflict),
                ("local-newer".to_string(), DeltaKind::LocalNewer),
                ("local-only".to_string(), DeltaKind::LocalNewer),
                ("remote-newer".to_string(), DeltaKind::RemoteNewer),
                ("remote-only".to_string(), DeltaKind::RemoteNewer),
            ]
        );
    }

    #[test]
    fn test_higher_revision_wins_regardless_of_time() {
        let secret = Secret::generate();
        let past = Utc.timestamp_millis_opt(0).single().unwrap();
        let future = Utc::now() + chrono::Duration::days(365);

        let newer = FileEntry::file("a", b"x", 5, past, &secret).unwrap().summary();
        let older = FileEntry::file("a", b"y", 4, future, &secret).unwrap().summary();

        assert_eq!(compare(Some(&newer), Some(&older)), DeltaKind::LocalNewer);
        assert!(wins(&newer, Some(&older)));
        assert!(!wins(&older, Some(&newer)));
    }

    #[test]
    fn test_conflict_copy_path() {
        let hash = [0xab; 32];
        assert_eq!(conflict_copy_path("a.txt", &hash), "a (conflict abababab).txt");
        assert_eq!(conflict_copy_path("dir/sub/notes.md", &hash), "dir/sub/notes (conflict abababab).md");
        assert_eq!(conflict_copy_path("Makefile", &hash), "Makefile (conflict abababab)");
        assert_eq!(conflict_copy_path(".bashrc", &hash), ".bashrc (conflict abababab)");
        assert_eq!(conflict_copy_path("v1.2/readme", &hash), "v1.2/readme (conflict abababab)");
    }

    #[test]
    fn test_conflict_copy_is_deterministic() {
        let owner = Secret::generate();
        let rw = owner.derive(Level::ReadWrite).unwrap();
        let at = Utc::now();
        let loser = FileEntry::file("a.txt", b"loser", 3, at, &owner).unwrap();

        let copy_a = make_conflict_copy(&loser, &owner).unwrap().unwrap();
        let copy_b = make_conflict_copy(&loser, &rw).unwrap().unwrap();

        assert_eq!(copy_a, copy_b);
        assert_eq!(copy_a.revision, 3);
        assert_eq!(copy_a.content_hash, loser.content_hash);
        assert!(copy_a.verify(&owner.verifying_key().unwrap()));

        let tombstone = FileEntry::deleted("a.txt", 3, &owner).unwrap();
        assert!(make_conflict_copy(&tombstone, &owner).unwrap().is_none());
    }

    #[test]
    fn test_deleted_never_wins_tie_against_file() {
        let secret = Secret::generate();
        let file = FileEntry::file("a", b"content", 2, Utc::now(), &secret).unwrap().summary();
        let tomb = FileEntry::deleted("a", 2, &secret).unwrap().summary();

        assert_eq!(compare(Some(&file), Some(&tomb)), DeltaKind::Conflict);
        assert!(wins(&file, Some(&tomb)));
    }

    #[test]
    fn test_ignore_list() {
        let ignore = IgnoreList::new(&["*.tmp".to_string(), "build/*".to_string()]).unwrap();
        assert!(ignore.is_ignored(".lvlt"));
        assert!(ignore.is_ignored(".lvlt/index.json"));
        assert!(ignore.is_ignored("notes.tmp"));
        assert!(ignore.is_ignored("deep/dir/x.tmp"));
        assert!(ignore.is_ignored("build/out.o"));
        assert!(!ignore.is_ignored("src/main.rs"));
        assert!(!ignore.is_ignored(".lvltrc"));
    }

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/data/folder");
        assert_eq!(resolve_path(root, "a/b.txt").unwrap(), root.join("a").join("b.txt"));
        assert!(resolve_path(root, "../x").is_err());
        assert!(resolve_path(root, "").is_err());
    }

    #[test]
    fn test_scan_detects_changes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let secret = Secret::generate();
        let ignore = IgnoreList::default();

        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::create_dir(root.join("docs")).unwrap();
        std::fs::write(root.join("docs").join("b.txt"), b"beta").unwrap();
        std::fs::create_dir(root.join(SYSTEM_DIR)).unwrap();
        std::fs::write(root.join(SYSTEM_DIR).join("index.json"), b"{}").unwrap();

        let mut index = ContentIndex::new();
        let outcome = scan(root, &secret, &index, &ignore).unwrap();
        let changed = index.apply_scan(outcome);
        assert_eq!(changed.len(), 3);
        assert_eq!(index.status(), IndexStatus { files: 2, directories: 1, deleted: 0, total_size: 9 });

        // Nothing changed: no new entries
        let outcome = scan(root, &secret, &index, &ignore).unwrap();
        assert!(outcome.changed.is_empty());

        // Modify one, delete another
        std::fs::write(root.join("a.txt"), b"alpha, longer now").unwrap();
        std::fs::remove_file(root.join("docs").join("b.txt")).unwrap();
        let outcome = scan(root, &secret, &index, &ignore).unwrap();
        index.apply_scan(outcome);

        assert_eq!(index.get("a.txt").unwrap().revision, 2);
        let b = index.get("docs/b.txt").unwrap();
        assert_eq!(b.kind, EntryKind::Deleted);
        assert_eq!(b.revision, 2);
    }

    #[test]
    fn test_scan_same_content_new_mtime_keeps_revision() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let secret = Secret::generate();
        let ignore = IgnoreList::default();
        std::fs::write(root.join("a.txt"), b"same").unwrap();

        let mut index = ContentIndex::new();
        let outcome = scan(root, &secret, &index, &ignore).unwrap();
        index.apply_scan(outcome);
        index.forget_observation("a.txt");

        let outcome = scan(root, &secret, &index, &ignore).unwrap();
        assert!(outcome.changed.is_empty());
        assert_eq!(outcome.observations.len(), 1);
    }

    #[test]
    fn test_index_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(SYSTEM_DIR).join("index.json");
        let secret = Secret::generate();

        let mut index = ContentIndex::new();
        index.apply_local_change("x/y.txt", b"payload", Utc::now(), &secret).unwrap();
        index.record_observation("x/y.txt", Observation { size: 7, mtime_ms: 42 });
        index.save(&path).unwrap();

        let loaded = ContentIndex::load(&path).unwrap();
        assert_eq!(loaded.get("x/y.txt"), index.get("x/y.txt"));
        assert_eq!(loaded.observation("x/y.txt"), Some(Observation { size: 7, mtime_ms: 42 }));
        assert!(ContentIndex::load(&dir.path().join("missing.json")).unwrap().is_empty());
    }

    #[test]
    fn test_containing_chunk() {
        let secret = Secret::generate();
        let mut index = ContentIndex::new();
        let entry = index.apply_local_change("f", b"abc", Utc::now(), &secret).unwrap();

        let (found, chunk) = index.containing_chunk(&entry.chunks[0].hash).unwrap();
        assert_eq!(found.path, "f");
        assert_eq!(chunk.length, 3);
        assert!(!index.contains_chunk(&[9u8; 32]));
    }

    proptest! {
        #[test]
        fn prop_equal_hash_is_identical_in_both_orders(rev in 0u64..1000, byte in any::<u8>()) {
            let a = summary("p", rev, byte);
            let b = summary("p", rev, byte);
            prop_assert_eq!(compare(Some(&a), Some(&b)), DeltaKind::Identical);
            prop_assert_eq!(compare(Some(&b), Some(&a)), DeltaKind::Identical);
        }

        #[test]
        fn prop_diff_is_mirror_symmetric(
            l_rev in 0u64..5, r_rev in 0u64..5, l_hash in 0u8..4, r_hash in 0u8..4
        ) {
            let local = vec![summary("p", l_rev, l_hash)];
            let remote = vec![summary("p", r_rev, r_hash)];
            let forward = diff(&local, &remote)[0].kind;
            let backward = diff(&remote, &local)[0].kind;
            let mirrored = match forward {
                DeltaKind::LocalNewer => DeltaKind::RemoteNewer,
                DeltaKind::RemoteNewer => DeltaKind::LocalNewer,
                other => other,
            };
            prop_assert_eq!(backward, mirrored);
        }

        #[test]
        fn prop_winner_is_order_independent(entries in proptest::collection::vec((0u64..4, 0u8..6), 3..8)) {
            let summaries: Vec<SummaryEntry> = entries.iter().map(|(r, h)| summary("p", *r, *h)).collect();
            let pick = |order: &[SummaryEntry]| {
                let mut current: Option<SummaryEntry> = None;
                for candidate in order {
                    if wins(candidate, current.as_ref()) {
                        current = Some(candidate.clone());
                    }
                }
                current
            };
            let mut reversed = summaries.clone();
            reversed.reverse();
            prop_assert_eq!(pick(&summaries), pick(&reversed));
        }
    }
}

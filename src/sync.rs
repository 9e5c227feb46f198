//! # Sync Engine
//!
//! Per-folder executor for reconciliation plans. Owns the folder's index,
//! chunk store and archive, and is the single writer for all of them.
//!
//! ## Applying remote entries
//!
//! 1. The peer's signed entry is verified against the folder public key
//! 2. Missing chunks are fetched through the [`TransferScheduler`]; chunks
//!    already in the store or present in other local files are reused, so an
//!    interrupted transfer resumes where it stopped
//! 3. Under the folder's apply lock the entry is re-admitted, the chunks are
//!    decrypted and assembled, and the whole-file hash is checked
//! 4. Only then is the old file archived and the new one renamed into place
//!
//! A failed hash check leaves the previous revision untouched and surfaces
//! a warning on the folder.

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::archive::{Archive, ArchivePolicy};
use crate::crypto::{self, Hash};
use crate::error::{Result, SyncError};
use crate::index::{
    self, compare, make_conflict_copy, resolve_path, wins, ContentIndex, DeltaKind, EntryKind, FileEntry,
    IgnoreList, IndexSummary, Observation, SummaryEntry, SYSTEM_DIR,
};
use crate::protocol::{RequestBody, ResponseBody};
use crate::reconcile::{self, Action, Plan};
use crate::scheduler::TransferScheduler;
use crate::secret::{Level, Secret};
use crate::session::SessionHandle;
use crate::storage::{ChunkBitfield, ChunkStore};

const PARALLEL_FILES: usize = 4;
const MAX_WARNINGS: usize = 20;

/// The remote side of a reconciliation.
#[async_trait]
pub trait RemotePeer: Send + Sync {
    /// Stable id used for queueing and deprioritization.
    fn peer_id(&self) -> String;

    async fn fetch_entry(&self, path: &str) -> Result<Option<FileEntry>>;

    /// Encrypted chunk bytes; callers verify the hash.
    async fn fetch_chunk(&self, hash: &Hash) -> Result<Vec<u8>>;

    async fn offer(&self, entry: FileEntry) -> Result<()>;
}

#[async_trait]
impl RemotePeer for SessionHandle {
    fn peer_id(&self) -> String {
        hex::encode(self.remote_node_id())
    }

    async fn fetch_entry(&self, path: &str) -> Result<Option<FileEntry>> {
        self.request_entry(path).await
    }

    async fn fetch_chunk(&self, hash: &Hash) -> Result<Vec<u8>> {
        self.request_chunk(hash).await
    }

    async fn offer(&self, entry: FileEntry) -> Result<()> {
        SessionHandle::offer(self, entry).await
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub fetched: usize,
    pub offered: usize,
    pub conflicts: usize,
    pub unchanged: usize,
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Outcome {
    Fetched,
    Offered,
    Resolved,
    Unchanged,
}

pub struct SyncEngine {
    root: PathBuf,
    secret: Secret,
    public_key: VerifyingKey,
    index: RwLock<ContentIndex>,
    apply_lock: tokio::sync::Mutex<()>,
    store: ChunkStore,
    archive: Archive,
    ignore: IgnoreList,
    scheduler: Arc<TransferScheduler>,
    pending: Mutex<HashMap<String, FileEntry>>,
    warnings: Mutex<Vec<String>>,
}

impl SyncEngine {
    pub async fn open(
        root: &Path,
        secret: Secret,
        ignore: IgnoreList,
        archive: ArchivePolicy,
        scheduler: Arc<TransferScheduler>,
    ) -> Result<Self> {
        let system_dir = root.join(SYSTEM_DIR);
        tokio::fs::create_dir_all(system_dir.join("tmp")).await?;

        let index = ContentIndex::load(&system_dir.join("index.json"))?;
        let store = ChunkStore::open(system_dir.clone()).await?;
        debug!(
            "Opened folder {} with {} entries and {} stored chunks",
            root.display(),
            index.len(),
            store.get_stats().total_chunks
        );

        Ok(Self {
            root: root.to_path_buf(),
            public_key: secret.verifying_key()?,
            secret,
            index: RwLock::new(index),
            apply_lock: tokio::sync::Mutex::new(()),
            store,
            archive: Archive::new(root, archive),
            ignore,
            scheduler,
            pending: Mutex::new(HashMap::new()),
            warnings: Mutex::new(Vec::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn level(&self) -> Level {
        self.secret.level()
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn scheduler(&self) -> &Arc<TransferScheduler> {
        &self.scheduler
    }

    pub fn ignore(&self) -> &IgnoreList {
        &self.ignore
    }

    pub fn summary(&self) -> IndexSummary {
        self.index.read().summary()
    }

    pub fn entry(&self, path: &str) -> Option<FileEntry> {
        self.index.read().get(path).cloned()
    }

    pub fn index_status(&self) -> index::IndexStatus {
        self.index.read().status()
    }

    pub fn with_index<T>(&self, f: impl FnOnce(&ContentIndex) -> T) -> T {
        f(&self.index.read())
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn clear_warnings(&self) {
        self.warnings.lock().clear();
    }

    /// Surface a problem on the folder status.
    pub fn add_warning(&self, message: String) {
        warn!("{}", message);
        let mut warnings = self.warnings.lock();
        warnings.push(message);
        if warnings.len() > MAX_WARNINGS {
            warnings.remove(0);
        }
    }

    /// Number of entries with a transfer in progress or interrupted.
    pub fn pending_transfers(&self) -> usize {
        self.pending.lock().len()
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(SYSTEM_DIR).join("index.json")
    }

    pub fn save_index(&self) -> Result<()> {
        let snapshot = self.index.read().clone();
        snapshot.save(&self.index_path())
    }

    fn still_wins(&self, target: &SummaryEntry) -> bool {
        let index = self.index.read();
        wins(target, index.get(&target.path).map(FileEntry::summary).as_ref())
    }

    /// Reconcile against a peer's summary at the session's effective capability.
    pub async fn reconcile(&self, peer: &dyn RemotePeer, remote: &IndexSummary, effective: Level) -> SyncReport {
        let plan = reconcile::plan(&self.summary(), remote, self.level(), effective);
        if plan.is_empty() {
            return SyncReport {
                unchanged: plan.identical,
                ..Default::default()
            };
        }
        debug!(
            "Reconciling {} with {}: {} actions, {} skipped",
            self.root.display(),
            peer.peer_id(),
            plan.actions.len(),
            plan.skipped
        );
        self.execute(plan, peer).await
    }

    pub async fn execute(&self, plan: Plan, peer: &dyn RemotePeer) -> SyncReport {
        let mut report = SyncReport {
            unchanged: plan.identical,
            ..Default::default()
        };

        let results: Vec<(String, Result<Outcome>)> = futures::stream::iter(plan.actions)
            .map(|action| async move {
                let path = action.path().to_string();
                (path, self.run_action(action, peer).await)
            })
            .buffer_unordered(PARALLEL_FILES)
            .collect()
            .await;

        for (path, result) in results {
            match result {
                Ok(Outcome::Fetched) => report.fetched += 1,
                Ok(Outcome::Offered) => report.offered += 1,
                Ok(Outcome::Resolved) => report.conflicts += 1,
                Ok(Outcome::Unchanged) => report.unchanged += 1,
                Err(SyncError::Superseded(_)) => report.unchanged += 1,
                Err(e) => {
                    debug!("Action on {} failed: {}", path, e);
                    report.failed.push((path, e.to_string()));
                }
            }
        }

        if report.fetched + report.conflicts > 0 {
            info!(
                "Synced {} with {}: {} fetched, {} conflicts resolved, {} offered",
                self.root.display(),
                peer.peer_id(),
                report.fetched,
                report.conflicts,
                report.offered
            );
        }
        report
    }

    async fn run_action(&self, action: Action, peer: &dyn RemotePeer) -> Result<Outcome> {
        match action {
            Action::Fetch { target, .. } => {
                let entry = peer
                    .fetch_entry(&target.path)
                    .await?
                    .ok_or_else(|| SyncError::ChunkUnavailable(format!("peer no longer has {}", target.path)))?;
                match self.apply_remote(peer, entry).await? {
                    true => Ok(Outcome::Fetched),
                    false => Ok(Outcome::Unchanged),
                }
            }
            Action::Offer { entry } => match self.entry(&entry.path) {
                Some(full) => {
                    peer.offer(full).await?;
                    Ok(Outcome::Offered)
                }
                None => Ok(Outcome::Unchanged),
            },
            Action::ResolveConflict { local, remote, .. } => {
                let Some(theirs) = peer.fetch_entry(&remote.path).await? else {
                    return Ok(Outcome::Unchanged);
                };
                self.verify_entry(&theirs)?;
                let Some(ours) = self.entry(&local.path) else {
                    return Ok(Outcome::Unchanged);
                };
                match compare(Some(&ours.summary()), Some(&theirs.summary())) {
                    DeltaKind::Conflict => {
                        self.resolve_conflict(peer, ours, theirs).await?;
                        Ok(Outcome::Resolved)
                    }
                    DeltaKind::RemoteNewer => match self.apply_remote(peer, theirs).await? {
                        true => Ok(Outcome::Fetched),
                        false => Ok(Outcome::Unchanged),
                    },
                    _ => Ok(Outcome::Unchanged),
                }
            }
        }
    }

    fn verify_entry(&self, entry: &FileEntry) -> Result<()> {
        index::validate_relative_path(&entry.path)?;
        if self.ignore.is_ignored(&entry.path) {
            return Err(SyncError::Protocol(format!("entry path {} is reserved", entry.path)));
        }
        if !entry.verify(&self.public_key) {
            return Err(SyncError::InvalidSignature(entry.path.clone()));
        }
        Ok(())
    }

    /// Handle a `Have` announcement from a writer.
    pub async fn handle_offer(&self, peer: &dyn RemotePeer, entry: FileEntry) -> Result<bool> {
        self.verify_entry(&entry)?;
        let ours = self.entry(&entry.path);
        match compare(ours.as_ref().map(FileEntry::summary).as_ref(), Some(&entry.summary())) {
            DeltaKind::RemoteNewer => self.apply_remote(peer, entry).await,
            DeltaKind::Conflict => match ours {
                Some(ours) if self.level().can_write() => {
                    self.resolve_conflict(peer, ours, entry).await?;
                    Ok(true)
                }
                _ if self.still_wins(&entry.summary()) => self.apply_remote(peer, entry).await,
                _ => Ok(false),
            },
            _ => Ok(false),
        }
    }

    /// Fetch the chunks of a verified entry and apply it. Returns false if
    /// the local index already holds something that wins.
    pub async fn apply_remote(&self, peer: &dyn RemotePeer, entry: FileEntry) -> Result<bool> {
        self.verify_entry(&entry)?;
        if !self.still_wins(&entry.summary()) {
            return Ok(false);
        }

        if entry.is_file() {
            self.pending.lock().insert(entry.path.clone(), entry.clone());
            self.fetch_chunks(peer, &entry).await?;
        }

        let _guard = self.apply_lock.lock().await;
        self.apply_locked(&entry).await
    }

    /// Bring every chunk of `entry` into the store, skipping ones already held.
    async fn fetch_chunks(&self, peer: &dyn RemotePeer, entry: &FileEntry) -> Result<()> {
        let bitfield = ChunkBitfield::for_entry(entry, &self.store);
        if bitfield.is_complete() {
            return Ok(());
        }
        let missing = bitfield.missing_chunks();
        debug!(
            "Fetching {} of {} chunks for {} ({:.0}% already held)",
            missing.len(),
            entry.chunks.len(),
            entry.path,
            bitfield.completion_percentage()
        );

        let target = entry.summary();
        let admit = || self.still_wins(&target);
        for i in missing {
            let chunk = entry.chunks[i];
            if self.store.has_chunk(&chunk.hash) {
                continue;
            }
            if let Some(data) = self.read_local_chunk(&chunk.hash).await {
                self.store.store_chunk(chunk.hash, &data).await?;
                continue;
            }
            let data = self.scheduler.fetch_chunk(peer, chunk.hash, &admit).await?;
            self.store.store_chunk(chunk.hash, &data).await?;
        }
        Ok(())
    }

    /// Apply a verified entry whose chunks are all stored. Caller holds the apply lock.
    async fn apply_locked(&self, entry: &FileEntry) -> Result<bool> {
        if !self.still_wins(&entry.summary()) {
            self.pending.lock().remove(&entry.path);
            return Ok(false);
        }
        let staged = self.stage(entry).await?;
        self.commit(entry, staged).await
    }

    /// Assemble and verify the body of a readable file entry into the folder's
    /// temp dir. Nothing under the root is touched, so a failure here leaves the
    /// previous revision in place.
    async fn stage(&self, entry: &FileEntry) -> Result<Option<tempfile::NamedTempFile>> {
        if !entry.is_file() || !self.level().can_read() {
            return Ok(None);
        }
        let content = match self.assemble(entry).await {
            Ok(content) => content,
            Err(e) => {
                self.pending.lock().remove(&entry.path);
                if let SyncError::ChunkIntegrityViolation { path } = &e {
                    self.add_warning(format!("Integrity check failed for {}, kept previous revision", path));
                    self.discard_chunks(entry).await;
                }
                return Err(e);
            }
        };

        let mut tmp = tempfile::NamedTempFile::new_in(self.root.join(SYSTEM_DIR).join("tmp"))?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;
        Ok(Some(tmp))
    }

    /// Move a staged entry into place and record it in the index.
    async fn commit(&self, entry: &FileEntry, staged: Option<tempfile::NamedTempFile>) -> Result<bool> {
        if !self.level().can_read() {
            // Encrypted folders keep ciphertext and signed entries only.
            self.index.write().put_remote(entry.clone(), &self.public_key)?;
            self.pending.lock().remove(&entry.path);
            self.save_index()?;
            return Ok(true);
        }

        let target = resolve_path(&self.root, &entry.path)?;
        let now = Utc::now();
        match entry.kind {
            EntryKind::File => {
                let tmp = staged.ok_or_else(|| SyncError::Protocol(format!("{} was not staged", entry.path)))?;
                if target.is_dir() {
                    std::fs::remove_dir(&target)?;
                }
                self.archive.archive_file(&entry.path, now)?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                tmp.persist(&target).map_err(|e| SyncError::Io(e.error))?;
            }
            EntryKind::Directory => {
                if target.is_file() {
                    self.archive.archive_file(&entry.path, now)?;
                }
                std::fs::create_dir_all(&target)?;
            }
            EntryKind::Deleted => {
                if target.is_file() {
                    self.archive.archive_file(&entry.path, now)?;
                } else if target.is_dir() {
                    if let Err(e) = std::fs::remove_dir(&target) {
                        debug!("Left non-empty directory {} in place: {}", entry.path, e);
                    }
                }
            }
        }

        {
            let mut index = self.index.write();
            index.put_remote(entry.clone(), &self.public_key)?;
            match (entry.kind, std::fs::metadata(&target)) {
                (EntryKind::File, Ok(metadata)) => index.record_observation(&entry.path, Observation::of(&metadata)),
                _ => index.forget_observation(&entry.path),
            }
        }
        self.pending.lock().remove(&entry.path);
        self.save_index()?;
        self.discard_chunks(entry).await;

        info!("Applied {} rev={} ({:?})", entry.path, entry.revision, entry.kind);
        Ok(true)
    }

    /// Decrypt and concatenate the chunks of `entry`, checking the whole-file hash.
    async fn assemble(&self, entry: &FileEntry) -> Result<Vec<u8>> {
        let content_key = self
            .secret
            .content_key()
            .ok_or(SyncError::WriteNotPermitted(self.level()))?;
        let violation = || SyncError::ChunkIntegrityViolation {
            path: entry.path.clone(),
        };

        let mut content = Vec::with_capacity(entry.size as usize);
        for chunk in &entry.chunks {
            let encrypted = self.store.get_chunk(&chunk.hash).await?;
            let plaintext = crypto::decrypt_chunk(&content_key, &encrypted).map_err(|_| violation())?;
            if plaintext.len() != chunk.length as usize || content.len() as u64 != chunk.offset {
                return Err(violation());
            }
            content.extend_from_slice(&plaintext);
        }

        if content.len() as u64 != entry.size || crypto::hash(&content) != entry.content_hash {
            return Err(violation());
        }
        Ok(content)
    }

    /// Drop staged chunks of `entry` that no pending transfer still needs.
    async fn discard_chunks(&self, entry: &FileEntry) {
        if !self.level().can_read() {
            return;
        }
        for chunk in &entry.chunks {
            let still_needed = self
                .pending
                .lock()
                .values()
                .any(|p| p.chunks.iter().any(|c| c.hash == chunk.hash));
            if !still_needed {
                let _ = self.store.remove_chunk(&chunk.hash).await;
            }
        }
    }

    /// Equal revisions, different content: the larger hash keeps the path and
    /// the loser is preserved as a conflict copy. Both sides compute the same pair.
    async fn resolve_conflict(&self, peer: &dyn RemotePeer, ours: FileEntry, theirs: FileEntry) -> Result<()> {
        if theirs.content_hash > ours.content_hash {
            if theirs.is_file() {
                self.pending.lock().insert(theirs.path.clone(), theirs.clone());
                self.fetch_chunks(peer, &theirs).await?;
            }

            let _guard = self.apply_lock.lock().await;
            if self.entry(&ours.path).as_ref() != Some(&ours) {
                self.pending.lock().remove(&theirs.path);
                return Err(SyncError::Superseded(ours.path));
            }
            // The winner is verified before the loser moves, so a corrupt winner
            // leaves our file where it was.
            let staged = self.stage(&theirs).await?;
            if let Some(copy) = make_conflict_copy(&ours, &self.secret)? {
                self.move_to_conflict_copy(&ours, &copy)?;
            }
            info!("Conflict on {}: remote version wins", ours.path);
            self.commit(&theirs, staged).await?;
        } else {
            info!("Conflict on {}: local version wins", ours.path);
            if let Some(copy) = make_conflict_copy(&theirs, &self.secret)? {
                self.apply_remote(peer, copy).await?;
            }
        }
        Ok(())
    }

    /// Rename our losing file to its conflict-copy path and index it there.
    fn move_to_conflict_copy(&self, loser: &FileEntry, copy: &FileEntry) -> Result<()> {
        let from = resolve_path(&self.root, &loser.path)?;
        let to = resolve_path(&self.root, &copy.path)?;

        if self.entry(&copy.path).as_ref() == Some(copy) {
            // Copy already materialized from another peer
            self.archive.archive_file(&loser.path, Utc::now())?;
            return Ok(());
        }
        if from.is_file() {
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&from, &to)?;
        }

        let mut index = self.index.write();
        index.put_remote(copy.clone(), &self.public_key)?;
        if let Ok(metadata) = std::fs::metadata(&to) {
            index.record_observation(&copy.path, Observation::of(&metadata));
        }
        index.forget_observation(&loser.path);
        Ok(())
    }

    /// Plaintext range of a local file, re-encrypted, if it still matches `hash`.
    async fn read_local_chunk(&self, hash: &Hash) -> Option<Vec<u8>> {
        let content_key = self.secret.content_key()?;
        let (path, chunk) = {
            let index = self.index.read();
            let (entry, chunk) = index.containing_chunk(hash)?;
            (entry.path.clone(), chunk)
        };

        let mut file = tokio::fs::File::open(resolve_path(&self.root, &path).ok()?).await.ok()?;
        file.seek(std::io::SeekFrom::Start(chunk.offset)).await.ok()?;
        let mut plaintext = vec![0u8; chunk.length as usize];
        file.read_exact(&mut plaintext).await.ok()?;

        let encrypted = crypto::encrypt_chunk(&content_key, &plaintext).ok()?;
        (crypto::hash(&encrypted) == *hash).then_some(encrypted)
    }

    /// Answer a peer's request.
    pub async fn serve(&self, request: RequestBody) -> ResponseBody {
        match request {
            RequestBody::Entry { path } => ResponseBody::Entry(self.entry(&path)),
            RequestBody::Chunk { hash } => {
                if let Ok(data) = self.store.get_chunk(&hash).await {
                    return ResponseBody::Chunk { hash, data };
                }
                match self.read_local_chunk(&hash).await {
                    Some(data) => ResponseBody::Chunk { hash, data },
                    None => ResponseBody::Unavailable(hex::encode(hash)),
                }
            }
        }
    }

    /// Index a change the watcher saw at `rel_path`. Returns the entries that changed.
    pub async fn record_local_change(&self, rel_path: &str) -> Result<Vec<FileEntry>> {
        if !self.level().can_write() || self.ignore.is_ignored(rel_path) {
            return Ok(Vec::new());
        }
        let _guard = self.apply_lock.lock().await;
        let abs = resolve_path(&self.root, rel_path)?;

        let changed = match tokio::fs::symlink_metadata(&abs).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut index = self.index.write();
                let prefix = format!("{}/", rel_path);
                let doomed: Vec<String> = index
                    .entries()
                    .filter(|e| e.kind != EntryKind::Deleted && (e.path == rel_path || e.path.starts_with(&prefix)))
                    .map(|e| e.path.clone())
                    .collect();
                let mut changed = Vec::new();
                for path in doomed {
                    if let Some(tombstone) = index.apply_local_deletion(&path, &self.secret)? {
                        changed.push(tombstone);
                    }
                }
                changed
            }
            Err(e) => return Err(e.into()),
            Ok(metadata) if metadata.is_dir() => self
                .index
                .write()
                .apply_local_directory(rel_path, &self.secret)?
                .into_iter()
                .collect(),
            Ok(metadata) if metadata.is_file() => {
                let observation = Observation::of(&metadata);
                let current = self.entry(rel_path);
                let known = current.as_ref().map(|e| e.is_file()).unwrap_or(false);
                if known && self.index.read().observation(rel_path) == Some(observation) {
                    return Ok(Vec::new());
                }

                let content = tokio::fs::read(&abs).await?;
                let mut index = self.index.write();
                index.record_observation(rel_path, observation);
                if known && current.as_ref().map(|e| e.content_hash) == Some(crypto::hash(&content)) {
                    Vec::new()
                } else {
                    let modified_at = metadata.modified().map(chrono::DateTime::from).unwrap_or_else(|_| Utc::now());
                    vec![index.apply_local_change(rel_path, &content, modified_at, &self.secret)?]
                }
            }
            Ok(_) => Vec::new(),
        };

        self.save_index()?;
        for entry in &changed {
            debug!("Local change: {} rev={} ({:?})", entry.path, entry.revision, entry.kind);
        }
        Ok(changed)
    }

    /// Full rescan of the folder root. Writers only.
    pub async fn rescan(&self) -> Result<Vec<FileEntry>> {
        if !self.level().can_write() {
            return Ok(Vec::new());
        }
        let _guard = self.apply_lock.lock().await;

        let snapshot = self.index.read().clone();
        let (root, secret, ignore) = (self.root.clone(), self.secret.clone(), self.ignore.clone());
        let outcome = tokio::task::spawn_blocking(move || index::scan(&root, &secret, &snapshot, &ignore))
            .await
            .map_err(|e| SyncError::Protocol(format!("scan task failed: {}", e)))??;

        let changed = self.index.write().apply_scan(outcome);
        self.save_index()?;
        if !changed.is_empty() {
            info!("Rescan of {} found {} changes", self.root.display(), changed.len());
        }
        Ok(changed)
    }

    /// Purge expired archive entries and chunks nothing references.
    pub async fn housekeeping(&self) -> Result<()> {
        self.archive.purge_expired(Utc::now())?;
        let keep_indexed = !self.level().can_read();
        let referenced = |hash: &Hash| {
            (keep_indexed && self.index.read().contains_chunk(hash))
                || self.pending.lock().values().any(|p| p.chunks.iter().any(|c| c.hash == *hash))
        };
        self.store.cleanup(referenced).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// In-process peer backed by another engine.
    struct EnginePeer {
        engine: Arc<SyncEngine>,
        chunk_calls: AtomicUsize,
    }

    #[async_trait]
    impl RemotePeer for EnginePeer {
        fn peer_id(&self) -> String {
            "engine-peer".into()
        }

        async fn fetch_entry(&self, path: &str) -> Result<Option<FileEntry>> {
            Ok(self.engine.entry(path))
        }

        async fn fetch_chunk(&self, hash: &Hash) -> Result<Vec<u8>> {
            self.chunk_calls.fetch_add(1, Ordering::SeqCst);
            match self.engine.serve(RequestBody::Chunk { hash: *hash }).await {
                ResponseBody::Chunk { data, .. } => Ok(data),
                _ => Err(SyncError::ChunkUnavailable(hex::encode(hash))),
            }
        }

        async fn offer(&self, _entry: FileEntry) -> Result<()> {
            Ok(())
        }
    }

    /// Serves another engine's chunks but labels its entries with a content
    /// hash those chunks do not produce, validly signed.
    struct MislabeledPeer {
        inner: EnginePeer,
        secret: Secret,
    }

    impl MislabeledPeer {
        fn entry(&self, path: &str) -> FileEntry {
            let mut entry = self.inner.engine.entry(path).unwrap();
            entry.content_hash = [0xff; 32];
            entry.sign(&self.secret.signing_key().unwrap()).unwrap();
            entry
        }
    }

    #[async_trait]
    impl RemotePeer for MislabeledPeer {
        fn peer_id(&self) -> String {
            "mislabeled-peer".into()
        }

        async fn fetch_entry(&self, path: &str) -> Result<Option<FileEntry>> {
            Ok(Some(self.entry(path)))
        }

        async fn fetch_chunk(&self, hash: &Hash) -> Result<Vec<u8>> {
            self.inner.fetch_chunk(hash).await
        }

        async fn offer(&self, _entry: FileEntry) -> Result<()> {
            Ok(())
        }
    }

    async fn engine(dir: &TempDir, secret: Secret) -> Arc<SyncEngine> {
        Arc::new(
            SyncEngine::open(
                dir.path(),
                secret,
                IgnoreList::default(),
                ArchivePolicy::default(),
                Arc::new(TransferScheduler::new(SchedulerConfig::default())),
            )
            .await
            .unwrap(),
        )
    }

    fn peer(engine: &Arc<SyncEngine>) -> EnginePeer {
        EnginePeer {
            engine: engine.clone(),
            chunk_calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn test_fetch_new_file() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let owner = Secret::generate();
        let a = engine(&da, owner.clone()).await;
        let b = engine(&db, owner.derive(Level::ReadOnly).unwrap()).await;

        std::fs::write(da.path().join("hello.txt"), b"hello world").unwrap();
        a.record_local_change("hello.txt").await.unwrap();

        let report = b.reconcile(&peer(&a), &a.summary(), Level::ReadOnly).await;
        assert_eq!(report.fetched, 1, "{:?}", report);
        assert_eq!(std::fs::read(db.path().join("hello.txt")).unwrap(), b"hello world");
        assert_eq!(b.entry("hello.txt"), a.entry("hello.txt"));
        assert_eq!(b.store().get_stats().total_chunks, 0);
    }

    #[tokio::test]
    async fn test_remote_update_archives_previous_version() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let owner = Secret::generate();
        let a = engine(&da, owner.clone()).await;
        let b = engine(&db, owner).await;

        std::fs::write(da.path().join("f.txt"), b"v1").unwrap();
        a.record_local_change("f.txt").await.unwrap();
        b.reconcile(&peer(&a), &a.summary(), Level::Owner).await;

        std::fs::write(da.path().join("f.txt"), b"version two").unwrap();
        a.record_local_change("f.txt").await.unwrap();
        b.reconcile(&peer(&a), &a.summary(), Level::Owner).await;

        assert_eq!(std::fs::read(db.path().join("f.txt")).unwrap(), b"version two");
        assert_eq!(b.entry("f.txt").unwrap().revision, 2);
        let archived = b.archive().list().unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(std::fs::read(&archived[0]).unwrap(), b"v1");

        // The applied file is not picked up again as a local change
        assert!(b.record_local_change("f.txt").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deletion_propagates() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let owner = Secret::generate();
        let a = engine(&da, owner.clone()).await;
        let b = engine(&db, owner).await;

        std::fs::write(da.path().join("gone.txt"), b"bye").unwrap();
        a.record_local_change("gone.txt").await.unwrap();
        b.reconcile(&peer(&a), &a.summary(), Level::Owner).await;
        assert!(db.path().join("gone.txt").exists());

        std::fs::remove_file(da.path().join("gone.txt")).unwrap();
        let changed = a.record_local_change("gone.txt").await.unwrap();
        assert_eq!(changed[0].kind, EntryKind::Deleted);

        b.reconcile(&peer(&a), &a.summary(), Level::Owner).await;
        assert!(!db.path().join("gone.txt").exists());
        assert_eq!(b.entry("gone.txt").unwrap().kind, EntryKind::Deleted);
    }

    #[tokio::test]
    async fn test_forged_entry_rejected() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let owner = Secret::generate();
        let a = engine(&da, Secret::generate()).await; // different signing key, same paths
        let b = engine(&db, owner).await;

        std::fs::write(da.path().join("x.txt"), b"evil").unwrap();
        a.record_local_change("x.txt").await.unwrap();

        let report = b.reconcile(&peer(&a), &a.summary(), Level::ReadWrite).await;
        assert_eq!(report.fetched, 0);
        assert_eq!(report.failed.len(), 1);
        assert!(!db.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_encrypted_folder_stores_ciphertext_only() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let owner = Secret::generate();
        let a = engine(&da, owner.clone()).await;
        let relay = engine(&db, owner.derive(Level::Encrypted).unwrap()).await;

        std::fs::write(da.path().join("secret.txt"), b"plaintext payload").unwrap();
        a.record_local_change("secret.txt").await.unwrap();

        let report = relay.reconcile(&peer(&a), &a.summary(), Level::Encrypted).await;
        assert_eq!(report.fetched, 1);
        assert!(!db.path().join("secret.txt").exists());
        let entry = relay.entry("secret.txt").unwrap();
        assert!(relay.store().has_chunk(&entry.chunks[0].hash));

        // A third, readable peer can pull the file through the relay.
        let dc = TempDir::new().unwrap();
        let reader = engine(&dc, owner.derive(Level::ReadOnly).unwrap()).await;
        let report = reader.reconcile(&peer(&relay), &relay.summary(), Level::Encrypted).await;
        assert_eq!(report.fetched, 1);
        assert_eq!(std::fs::read(dc.path().join("secret.txt")).unwrap(), b"plaintext payload");
    }

    #[tokio::test]
    async fn test_conflict_resolution_converges() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let owner = Secret::generate();
        let a = engine(&da, owner.clone()).await;
        let b = engine(&db, owner).await;

        std::fs::write(da.path().join("a.txt"), b"from a").unwrap();
        a.record_local_change("a.txt").await.unwrap();
        std::fs::write(db.path().join("a.txt"), b"from b").unwrap();
        b.record_local_change("a.txt").await.unwrap();

        let mut conflicts = 0;
        for _ in 0..2 {
            conflicts += a.reconcile(&peer(&b), &b.summary(), Level::Owner).await.conflicts;
            conflicts += b.reconcile(&peer(&a), &a.summary(), Level::Owner).await.conflicts;
        }
        assert!(conflicts >= 1);

        assert_eq!(a.summary(), b.summary());
        assert_eq!(a.summary().len(), 2);
        let winner = std::fs::read(da.path().join("a.txt")).unwrap();
        assert_eq!(winner, std::fs::read(db.path().join("a.txt")).unwrap());
    }

    #[tokio::test]
    async fn test_integrity_violation_keeps_previous_revision() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let owner = Secret::generate();
        let a = engine(&da, owner.clone()).await;
        let b = engine(&db, owner.derive(Level::ReadOnly).unwrap()).await;

        std::fs::write(da.path().join("f.txt"), b"v1").unwrap();
        a.record_local_change("f.txt").await.unwrap();
        b.reconcile(&peer(&a), &a.summary(), Level::ReadOnly).await;

        std::fs::write(da.path().join("f.txt"), b"version two").unwrap();
        a.record_local_change("f.txt").await.unwrap();
        let bad = MislabeledPeer {
            inner: peer(&a),
            secret: owner,
        };
        let err = b.handle_offer(&bad, bad.entry("f.txt")).await.unwrap_err();
        assert!(matches!(err, SyncError::ChunkIntegrityViolation { .. }));

        assert_eq!(std::fs::read(db.path().join("f.txt")).unwrap(), b"v1");
        assert_eq!(b.entry("f.txt").unwrap().revision, 1);
        assert_eq!(b.pending_transfers(), 0);
        assert!(b.archive().list().unwrap().is_empty());
        assert!(b.warnings().iter().any(|w| w.contains("Integrity check failed for f.txt")));

        // The genuine revision still applies afterwards.
        b.reconcile(&peer(&a), &a.summary(), Level::ReadOnly).await;
        assert_eq!(std::fs::read(db.path().join("f.txt")).unwrap(), b"version two");
    }

    #[tokio::test]
    async fn test_corrupt_conflict_winner_leaves_local_file() {
        let (da, db) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let owner = Secret::generate();
        let a = engine(&da, owner.clone()).await;
        let b = engine(&db, owner.clone()).await;

        std::fs::write(da.path().join("a.txt"), b"from a").unwrap();
        a.record_local_change("a.txt").await.unwrap();
        std::fs::write(db.path().join("a.txt"), b"from b").unwrap();
        b.record_local_change("a.txt").await.unwrap();
        let ours = a.entry("a.txt").unwrap();

        let bad = MislabeledPeer {
            inner: peer(&b),
            secret: owner,
        };
        let theirs = bad.entry("a.txt");
        assert_eq!(theirs.revision, ours.revision);
        let err = a.handle_offer(&bad, theirs).await.unwrap_err();
        assert!(matches!(err, SyncError::ChunkIntegrityViolation { .. }));

        assert_eq!(std::fs::read(da.path().join("a.txt")).unwrap(), b"from a");
        assert_eq!(a.entry("a.txt"), Some(ours));
        assert_eq!(a.summary().len(), 1);
        assert!(a.rescan().await.unwrap().is_empty());
        assert_eq!(a.entry("a.txt").unwrap().kind, EntryKind::File);
    }

    #[tokio::test]
    async fn test_serve_chunk_from_disk() {
        let da = TempDir::new().unwrap();
        let owner = Secret::generate();
        let a = engine(&da, owner).await;

        std::fs::write(da.path().join("f.bin"), vec![9u8; 100]).unwrap();
        let entry = a.record_local_change("f.bin").await.unwrap().remove(0);
        let hash = entry.chunks[0].hash;

        match a.serve(RequestBody::Chunk { hash }).await {
            ResponseBody::Chunk { data, .. } => assert_eq!(crypto::hash(&data), hash),
            other => panic!("unexpected {:?}", other),
        }

        std::fs::write(da.path().join("f.bin"), vec![1u8; 100]).unwrap();
        assert!(matches!(
            a.serve(RequestBody::Chunk { hash }).await,
            ResponseBody::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_rescan_and_read_only_local_changes() {
        let da = TempDir::new().unwrap();
        let owner = Secret::generate();
        let a = engine(&da, owner.derive(Level::ReadOnly).unwrap()).await;

        std::fs::write(da.path().join("local.txt"), b"x").unwrap();
        assert!(a.record_local_change("local.txt").await.unwrap().is_empty());
        assert!(a.rescan().await.unwrap().is_empty());

        let db = TempDir::new().unwrap();
        let w = engine(&db, owner).await;
        std::fs::create_dir(db.path().join("dir")).unwrap();
        std::fs::write(db.path().join("dir/one.txt"), b"1").unwrap();
        let changed = w.rescan().await.unwrap();
        assert_eq!(changed.len(), 2);
        assert_eq!(w.index_status().files, 1);
        assert_eq!(w.index_status().directories, 1);
    }
}

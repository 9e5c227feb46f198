//! # Folder
//!
//! A synchronized folder: its [`SyncEngine`] (index, chunk store, archive),
//! its live peer sessions, and the background tasks that keep the index in
//! step with the filesystem. Implements [`SessionHost`] so every session of
//! this folder funnels through one engine.
//!
//! Reconciliation is serialized per session: while one pass for a session
//! runs, newer summaries from that session replace each other and only the
//! latest is processed next. Index mutations from all sessions, the watcher
//! and rescans meet at the engine's apply lock.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FolderConfig;
use crate::index::{FileEntry, IgnoreList, IndexStatus, IndexSummary};
use crate::protocol::{RequestBody, ResponseBody};
use crate::scheduler::TransferScheduler;
use crate::secret::{FolderId, Level, Secret};
use crate::session::{SessionHandle, SessionHost, SessionInfo};
use crate::sync::SyncEngine;
use crate::watcher::{FolderWatcher, WatcherConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FolderStatus {
    Indexing,
    Syncing,
    Idle,
}

impl fmt::Display for FolderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FolderStatus::Indexing => "Indexing",
            FolderStatus::Syncing => "Syncing",
            FolderStatus::Idle => "Idle",
        };
        f.write_str(s)
    }
}

/// Read-only view of a folder for the shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderSnapshot {
    pub id: String,
    pub path: PathBuf,
    pub level: Level,
    pub status: FolderStatus,
    pub warnings: Vec<String>,
    pub index: IndexStatus,
    pub pending_transfers: usize,
    pub peers: Vec<SessionInfo>,
}

/// Marks the folder busy for as long as it is held.
struct Busy<'a>(&'a AtomicUsize);

impl<'a> Busy<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Folder {
    id: FolderId,
    config: FolderConfig,
    engine: SyncEngine,
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    peer_slots: Mutex<HashMap<Uuid, OwnedSemaphorePermit>>,
    /// Sessions with a reconcile pass running, and the newest summary waiting behind it.
    reconciling: Mutex<HashMap<Uuid, Option<IndexSummary>>>,
    indexing: AtomicUsize,
    syncing: AtomicUsize,
    removed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Folder {
    /// Open the folder's engine, creating the root if needed.
    pub async fn open(config: FolderConfig, scheduler: Arc<TransferScheduler>) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&config.path)
            .await
            .with_context(|| format!("Cannot create folder {}", config.path.display()))?;
        let root = config
            .path
            .canonicalize()
            .with_context(|| format!("Cannot access folder {}", config.path.display()))?;
        let ignore = IgnoreList::new(&config.ignore_paths)?;

        let engine = SyncEngine::open(&root, config.secret.clone(), ignore, config.archive_policy(), scheduler)
            .await
            .with_context(|| format!("Cannot open folder state in {}", root.display()))?;

        info!(
            "Opened folder {} at {} ({})",
            config.folder_id().short(),
            root.display(),
            config.secret.level()
        );
        Ok(Arc::new(Self {
            id: config.folder_id(),
            config,
            engine,
            sessions: RwLock::new(HashMap::new()),
            peer_slots: Mutex::new(HashMap::new()),
            reconciling: Mutex::new(HashMap::new()),
            indexing: AtomicUsize::new(0),
            syncing: AtomicUsize::new(0),
            removed: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start the periodic rescan and, if `watch` is set, the filesystem watcher.
    pub fn start(self: &Arc<Self>, watch: bool) -> Result<()> {
        let rescan_task = {
            let folder = Arc::downgrade(self);
            let period = self.config.full_rescan_interval();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                    let Some(folder) = folder.upgrade() else { break };
                    if let Err(e) = folder.rescan().await {
                        folder.engine.add_warning(format!("Indexing stalled: {}", e));
                    }
                    if let Err(e) = folder.engine.housekeeping().await {
                        debug!("Housekeeping for {} failed: {}", folder.id.short(), e);
                    }
                }
            })
        };
        self.tasks.lock().push(rescan_task);

        if watch && self.level().can_write() {
            let (watcher, mut batches) =
                FolderWatcher::start(self.root(), self.engine.ignore().clone(), WatcherConfig::default())?;
            let folder = Arc::downgrade(self);
            let mut shutdown = self.shutdown.subscribe();
            let watch_task = tokio::spawn(async move {
                loop {
                    let batch = tokio::select! {
                        batch = batches.recv() => batch,
                        _ = shutdown.changed() => None,
                    };
                    let (Some(batch), Some(folder)) = (batch, folder.upgrade()) else { break };
                    for event in batch {
                        folder.local_change(&event.path).await;
                    }
                }
                let _ = watcher.shutdown().await;
            });
            self.tasks.lock().push(watch_task);
        }
        Ok(())
    }

    pub fn id(&self) -> FolderId {
        self.id
    }

    pub fn config(&self) -> &FolderConfig {
        &self.config
    }

    pub fn secret(&self) -> &Secret {
        self.engine.secret()
    }

    pub fn level(&self) -> Level {
        self.engine.level()
    }

    pub fn root(&self) -> &Path {
        self.engine.root()
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> FolderStatus {
        if self.indexing.load(Ordering::SeqCst) > 0 {
            FolderStatus::Indexing
        } else if self.syncing.load(Ordering::SeqCst) > 0 {
            FolderStatus::Syncing
        } else {
            FolderStatus::Idle
        }
    }

    pub fn snapshot(&self) -> FolderSnapshot {
        FolderSnapshot {
            id: self.id.to_string(),
            path: self.root().to_path_buf(),
            level: self.level(),
            status: self.status(),
            warnings: self.engine.warnings(),
            index: self.engine.index_status(),
            pending_transfers: self.engine.pending_transfers(),
            peers: self.sessions().iter().map(SessionHandle::info).collect(),
        }
    }

    /// Track a session established for this folder. Returns false, closing
    /// the session, if the folder is gone or has no free peer slot.
    pub fn attach(&self, session: SessionHandle) -> bool {
        if self.is_removed() {
            tokio::spawn(async move { session.close().await });
            return false;
        }
        let Some(slot) = self.engine.scheduler().try_acquire_peer() else {
            info!(
                "Folder {} is at its limit of {} peers, refusing {:?}",
                self.id.short(),
                self.engine.scheduler().config().max_concurrent_peers,
                session
            );
            tokio::spawn(async move { session.close().await });
            return false;
        };

        debug!("Folder {} attached session {:?}", self.id.short(), session);
        self.peer_slots.lock().insert(session.id(), slot);
        self.sessions.write().insert(session.id(), session.clone());
        if !session.is_open() {
            self.detach(&session);
        }
        true
    }

    /// Stop tracking a session and free its peer slot.
    pub fn detach(&self, session: &SessionHandle) {
        self.sessions.write().remove(&session.id());
        self.peer_slots.lock().remove(&session.id());
        self.reconciling.lock().remove(&session.id());
        if self.session_with(&session.remote_node_id()).is_none() {
            self.engine.scheduler().forget_peer(&hex::encode(session.remote_node_id()));
        }
    }

    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions.read().values().filter(|s| s.is_open()).cloned().collect()
    }

    pub fn has_peer(&self, node_id: &[u8; 32]) -> bool {
        self.session_with(node_id).is_some()
    }

    /// The open session with a node, if any.
    pub fn session_with(&self, node_id: &[u8; 32]) -> Option<SessionHandle> {
        self.sessions
            .read()
            .values()
            .find(|s| s.is_open() && s.remote_node_id() == *node_id)
            .cloned()
    }

    /// Re-index one path after a filesystem event and advertise the result.
    pub async fn local_change(&self, rel_path: &str) {
        match self.engine.record_local_change(rel_path).await {
            Ok(changed) if !changed.is_empty() => self.announce().await,
            Ok(_) => {}
            Err(e) => warn!("Failed to index {}: {}", rel_path, e),
        }
    }

    /// Full rescan of the root. Returns the number of changed entries.
    pub async fn rescan(&self) -> crate::error::Result<usize> {
        let changed = {
            let _busy = Busy::enter(&self.indexing);
            self.engine.rescan().await?
        };
        if !changed.is_empty() {
            self.announce().await;
        }
        Ok(changed.len())
    }

    /// Send the current summary to every open session.
    pub async fn announce(&self) {
        let summary = self.engine.summary();
        for session in self.sessions() {
            if let Err(e) = session.send_summary(summary.clone()).await {
                debug!("Could not announce to {:?}: {}", session, e);
            }
        }
    }

    /// Stop syncing: close sessions and stop background tasks. Files stay on disk.
    pub async fn shutdown(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let sessions: Vec<SessionHandle> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
        self.peer_slots.lock().clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.engine.save_index() {
            warn!("Failed to save index for {}: {}", self.id.short(), e);
        }
        info!("Stopped folder {} at {}", self.id.short(), self.root().display());
    }

    async fn reconcile_loop(&self, session: SessionHandle, summary: IndexSummary) {
        let id = session.id();
        {
            let mut running = self.reconciling.lock();
            if let Some(waiting) = running.get_mut(&id) {
                *waiting = Some(summary);
                return;
            }
            running.insert(id, None);
        }

        let mut next = Some(summary);
        while let Some(summary) = next.take() {
            if self.is_removed() || !session.is_open() {
                break;
            }
            let report = {
                let _busy = Busy::enter(&self.syncing);
                self.engine.reconcile(&session, &summary, session.effective_level()).await
            };
            if !report.is_clean() {
                debug!("Reconcile with {:?} left {} failures", session, report.failed.len());
            }
            if report.fetched + report.conflicts > 0 {
                self.announce().await;
            }

            let mut running = self.reconciling.lock();
            next = running.get_mut(&id).and_then(Option::take);
            if next.is_none() {
                running.remove(&id);
            }
        }
        self.reconciling.lock().remove(&id);
    }
}

#[async_trait]
impl SessionHost for Folder {
    async fn local_summary(&self) -> IndexSummary {
        self.engine.summary()
    }

    async fn on_remote_summary(&self, session: SessionHandle, summary: IndexSummary) {
        self.reconcile_loop(session, summary).await;
    }

    async fn on_remote_offer(&self, session: SessionHandle, entry: FileEntry) {
        if self.is_removed() {
            return;
        }
        let path = entry.path.clone();
        let applied = {
            let _busy = Busy::enter(&self.syncing);
            self.engine.handle_offer(&session, entry).await
        };
        match applied {
            Ok(true) => self.announce().await,
            Ok(false) => {}
            Err(e) => debug!("Offer of {} from {:?} not applied: {}", path, session, e),
        }
    }

    async fn serve(&self, request: RequestBody) -> ResponseBody {
        self.engine.serve(request).await
    }

    fn on_session_closed(&self, session: &SessionHandle) {
        self.detach(session);
    }
}

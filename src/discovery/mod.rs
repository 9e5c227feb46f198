//! # Peer Discovery
//!
//! Three independent channels produce `(address, folder)` candidates:
//!
//! - [`dht::DhtDiscovery`]: a Kademlia-style table over UDP keyed by folder id
//! - [`local::LocalDiscovery`]: UDP broadcast on the local network
//! - [`global::GlobalDiscovery`]: an HTTP rendezvous service, by default
//!   only for folders that neither of the other channels has found peers for
//!
//! Each channel runs as its own supervised task and writes into one shared
//! fan-in queue. A failing channel is logged and restarted with backoff; the
//! other channels keep running. Candidates are only hints: nothing about a
//! peer is kept until a session with it is established.

pub mod dht;
pub mod global;
pub mod local;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::secret::FolderId;

const CANDIDATE_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiscoveryKind {
    Dht,
    Local,
    Global,
}

impl DiscoveryKind {
    pub const ALL: [DiscoveryKind; 3] = [DiscoveryKind::Dht, DiscoveryKind::Local, DiscoveryKind::Global];
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscoveryKind::Dht => "dht",
            DiscoveryKind::Local => "local",
            DiscoveryKind::Global => "global",
        };
        f.write_str(s)
    }
}

impl FromStr for DiscoveryKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dht" => Ok(DiscoveryKind::Dht),
            "local" | "lan" => Ok(DiscoveryKind::Local),
            "global" => Ok(DiscoveryKind::Global),
            other => anyhow::bail!("Unknown discovery channel '{}' (expected dht, local or global)", other),
        }
    }
}

/// A possible peer for a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub folder_id: FolderId,
    pub source: DiscoveryKind,
}

/// What this node announces: its node id, listening port and folders.
#[derive(Debug)]
pub struct Announcement {
    node_id: [u8; 32],
    listen_port: AtomicU16,
    folders: RwLock<BTreeSet<FolderId>>,
    changed: Notify,
}

impl Announcement {
    pub fn new(node_id: [u8; 32], listen_port: u16) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            listen_port: AtomicU16::new(listen_port),
            folders: RwLock::new(BTreeSet::new()),
            changed: Notify::new(),
        })
    }

    pub fn node_id(&self) -> [u8; 32] {
        self.node_id
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::SeqCst)
    }

    pub fn folders(&self) -> Vec<FolderId> {
        self.folders.read().iter().copied().collect()
    }

    pub fn has_folder(&self, id: &FolderId) -> bool {
        self.folders.read().contains(id)
    }

    /// Resolves the next time the folder set or port changes.
    pub async fn changed(&self) {
        self.changed.notified().await
    }

    fn notify(&self) {
        self.changed.notify_waiters();
    }
}

/// Where a channel delivers what it finds.
#[derive(Clone)]
pub struct CandidateSink {
    kind: DiscoveryKind,
    tx: mpsc::Sender<Candidate>,
    stats: Arc<Mutex<HashMap<DiscoveryKind, ChannelStatus>>>,
    /// Last DHT or local candidate per folder.
    found: Arc<Mutex<HashMap<FolderId, Instant>>>,
}

impl CandidateSink {
    pub fn emit(&self, addr: SocketAddr, folder_id: FolderId) {
        let candidate = Candidate {
            addr,
            folder_id,
            source: self.kind,
        };
        match self.tx.try_send(candidate) {
            Ok(()) => {
                if let Some(status) = self.stats.lock().get_mut(&self.kind) {
                    status.candidates += 1;
                }
                if self.kind != DiscoveryKind::Global {
                    self.found.lock().insert(folder_id, Instant::now());
                }
            }
            Err(e) => debug!("Dropped {} candidate {}: {}", self.kind, addr, e),
        }
    }

    /// Whether DHT or local discovery produced a candidate for the folder within `window`.
    pub fn found_elsewhere(&self, folder_id: &FolderId, window: Duration) -> bool {
        self.found
            .lock()
            .get(folder_id)
            .map(|at| at.elapsed() < window)
            .unwrap_or(false)
    }
}

/// One discovery mechanism. `run` returns only on error or when `shutdown` fires.
#[async_trait]
pub trait DiscoveryChannel: Send + Sync + 'static {
    fn kind(&self) -> DiscoveryKind;

    async fn run(
        &self,
        announcement: Arc<Announcement>,
        sink: CandidateSink,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()>;

    /// Channel-specific detail for status output, e.g. known DHT nodes.
    fn detail(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub enabled: bool,
    pub running: bool,
    pub candidates: u64,
    pub restarts: u32,
    pub last_error: Option<String>,
    pub detail: Option<String>,
}

struct RunningChannel {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Fan-in of all discovery channels with per-channel supervision and toggles.
pub struct DiscoveryHub {
    announcement: Arc<Announcement>,
    tx: mpsc::Sender<Candidate>,
    channels: HashMap<DiscoveryKind, Arc<dyn DiscoveryChannel>>,
    running: Mutex<HashMap<DiscoveryKind, RunningChannel>>,
    stats: Arc<Mutex<HashMap<DiscoveryKind, ChannelStatus>>>,
    found: Arc<Mutex<HashMap<FolderId, Instant>>>,
}

impl DiscoveryHub {
    pub fn new(announcement: Arc<Announcement>) -> (Self, mpsc::Receiver<Candidate>) {
        let (tx, rx) = mpsc::channel(CANDIDATE_QUEUE);
        (
            Self {
                announcement,
                tx,
                channels: HashMap::new(),
                running: Mutex::new(HashMap::new()),
                stats: Arc::new(Mutex::new(HashMap::new())),
                found: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    pub fn register(&mut self, channel: Arc<dyn DiscoveryChannel>) {
        let kind = channel.kind();
        self.stats.lock().entry(kind).or_default();
        self.channels.insert(kind, channel);
    }

    pub fn announcement(&self) -> &Arc<Announcement> {
        &self.announcement
    }

    pub fn add_folder(&self, id: FolderId) {
        if self.announcement.folders.write().insert(id) {
            self.announcement.notify();
        }
    }

    pub fn remove_folder(&self, id: &FolderId) {
        if self.announcement.folders.write().remove(id) {
            self.announcement.notify();
        }
        self.found.lock().remove(id);
    }

    /// The sink a channel of `kind` writes into.
    pub fn sink(&self, kind: DiscoveryKind) -> CandidateSink {
        CandidateSink {
            kind,
            tx: self.tx.clone(),
            stats: self.stats.clone(),
            found: self.found.clone(),
        }
    }

    pub fn set_listen_port(&self, port: u16) {
        self.announcement.listen_port.store(port, Ordering::SeqCst);
        self.announcement.notify();
    }

    pub fn is_enabled(&self, kind: DiscoveryKind) -> bool {
        self.running.lock().contains_key(&kind)
    }

    /// Start or stop a channel. Unregistered channels are reported as an error.
    pub fn set_enabled(&self, kind: DiscoveryKind, enabled: bool) -> anyhow::Result<()> {
        let channel = self
            .channels
            .get(&kind)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Discovery channel {} is not available", kind))?;

        let mut running = self.running.lock();
        if !enabled {
            if let Some(stopped) = running.remove(&kind) {
                stopped.shutdown.send_replace(true);
                stopped.task.abort();
                info!("Disabled {} discovery", kind);
            }
            if let Some(status) = self.stats.lock().get_mut(&kind) {
                status.enabled = false;
                status.running = false;
            }
            return Ok(());
        }
        if running.contains_key(&kind) {
            return Ok(());
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            channel,
            self.announcement.clone(),
            self.sink(kind),
            shutdown_rx,
            self.stats.clone(),
        ));
        running.insert(kind, RunningChannel { shutdown, task });
        if let Some(status) = self.stats.lock().get_mut(&kind) {
            status.enabled = true;
        }
        info!("Enabled {} discovery", kind);
        Ok(())
    }

    pub fn status(&self) -> HashMap<DiscoveryKind, ChannelStatus> {
        let mut stats = self.stats.lock().clone();
        for (kind, status) in stats.iter_mut() {
            status.detail = self.channels.get(kind).and_then(|c| c.detail());
        }
        stats
    }

    pub fn shutdown(&self) {
        for (_, channel) in self.running.lock().drain() {
            channel.shutdown.send_replace(true);
            channel.task.abort();
        }
    }
}

impl Drop for DiscoveryHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn supervise(
    channel: Arc<dyn DiscoveryChannel>,
    announcement: Arc<Announcement>,
    sink: CandidateSink,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<HashMap<DiscoveryKind, ChannelStatus>>>,
) {
    let kind = channel.kind();
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_secs(1))
        .with_max_interval(Duration::from_secs(300))
        .with_max_elapsed_time(None)
        .build();
    let set_status = |f: &dyn Fn(&mut ChannelStatus)| {
        if let Some(status) = stats.lock().get_mut(&kind) {
            f(status);
        }
    };

    loop {
        set_status(&|s| s.running = true);
        let started = Instant::now();
        let result = channel.run(announcement.clone(), sink.clone(), shutdown.clone()).await;
        set_status(&|s| s.running = false);

        if *shutdown.borrow() {
            break;
        }
        let error = match result {
            Ok(()) => "channel stopped".to_string(),
            Err(e) => e.to_string(),
        };
        if started.elapsed() > Duration::from_secs(600) {
            backoff.reset();
        }
        let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(300));
        warn!("{} discovery failed: {}; restarting in {:?}", kind, error, delay);
        set_status(&|s| {
            s.restarts += 1;
            s.last_error = Some(error.clone());
        });

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("{} discovery supervisor exiting", kind);
}

/// Suppresses repeated candidates so each `(folder, address)` pair is tried
/// at most once per window.
pub struct CandidateTracker {
    window: Duration,
    seen: HashMap<(FolderId, SocketAddr), Instant>,
}

impl CandidateTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// True if the candidate should be acted on now.
    pub fn admit(&mut self, candidate: &Candidate) -> bool {
        let now = Instant::now();
        self.seen.retain(|_, at| now.duration_since(*at) < self.window);
        match self.seen.entry((candidate.folder_id, candidate.addr)) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn forget(&mut self, folder_id: &FolderId, addr: &SocketAddr) {
        self.seen.remove(&(*folder_id, *addr));
    }
}

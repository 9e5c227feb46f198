//! # Registry
//!
//! The process-wide owner of everything the daemon runs: the open folders,
//! the QUIC transport, the gateway port mapping and the discovery hub. Each
//! folder gets its own transfer scheduler.
//! Shell commands (add/remove folder, open link, change port, toggle a
//! discovery channel) go through it and are persisted to the config file.
//!
//! The CLI talks to a running daemon through files: commands edit
//! `config.toml`, which the daemon reloads on every heartbeat, and the daemon
//! writes a [`RegistrySnapshot`] to `data/state.json` for `status` and
//! `peers` to read.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, FolderConfig};
use crate::crypto::Identity;
use crate::discovery::dht::DhtDiscovery;
use crate::discovery::global::GlobalDiscovery;
use crate::discovery::local::LocalDiscovery;
use crate::discovery::{Announcement, ChannelStatus, DiscoveryHub, DiscoveryKind};
use crate::folder::{Folder, FolderSnapshot};
use crate::p2p::{FolderMap, P2PService};
use crate::portmap::{PortMapStatus, PortMapper};
use crate::scheduler::{ReconnectTracker, SchedulerConfig, SchedulerStats, TransferScheduler};
use crate::secret::{FolderId, Secret};
use crate::session::SessionInfo;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub kind: DiscoveryKind,
    pub status: ChannelStatus,
}

/// Everything the shell shows, written by the daemon on every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub node_id: String,
    pub listen_port: u16,
    pub updated_at: DateTime<Utc>,
    pub folders: Vec<FolderSnapshot>,
    pub discovery: Vec<ChannelReport>,
    pub transfers: SchedulerStats,
    #[serde(default)]
    pub port_mapping: PortMapStatus,
}

impl RegistrySnapshot {
    pub fn peers(&self) -> impl Iterator<Item = (&FolderSnapshot, &SessionInfo)> {
        self.folders.iter().flat_map(|f| f.peers.iter().map(move |p| (f, p)))
    }

    /// Aggregate (upload, download) rate in bytes per second.
    pub fn transfer_rates(&self) -> (f64, f64) {
        self.peers().fold((0.0, 0.0), |(up, down), (_, peer)| {
            (up + peer.traffic.all.upload_rate, down + peer.traffic.all.download_rate)
        })
    }

    /// A snapshot older than a few heartbeats means the daemon is gone.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.updated_at);
        age.to_std().map(|age| age > HEARTBEAT_INTERVAL * 3).unwrap_or(false)
    }

    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Create `path` if needed and check that it is a writable directory.
pub fn prepare_folder_path(path: &Path) -> Result<PathBuf> {
    if path.exists() && !path.is_dir() {
        anyhow::bail!("{} is not a directory", path.display());
    }
    std::fs::create_dir_all(path).with_context(|| format!("Cannot create folder {}", path.display()))?;
    tempfile::NamedTempFile::new_in(path)
        .with_context(|| format!("Cannot write to {}: permission denied", path.display()))?;
    Ok(path.canonicalize()?)
}

pub struct Registry {
    config: tokio::sync::Mutex<Config>,
    node_id: [u8; 32],
    folders: FolderMap,
    transfer: SchedulerConfig,
    p2p: Arc<P2PService>,
    discovery: DiscoveryHub,
    port_map: PortMapper,
    watch: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Registry {
    /// Open every configured folder, start the transport and the enabled discovery channels.
    /// `watch` starts filesystem watchers; without it folders rely on periodic rescans.
    pub async fn start(config: Config, identity: Identity, watch: bool) -> Result<Arc<Self>> {
        let transfer = config.transfer.scheduler_config();
        let folders: FolderMap = Arc::new(RwLock::new(HashMap::new()));
        let p2p = P2PService::start(
            &identity,
            config.listen_port,
            folders.clone(),
            config.transfer.session_config(),
            Arc::new(config.transfer.limiter()),
            ReconnectTracker::new(transfer.reconnect_base, transfer.reconnect_max),
        )?;

        let (mut discovery, candidates) = DiscoveryHub::new(Announcement::new(identity.node_id(), p2p.local_port()));
        register_channels(&mut discovery, &config);
        p2p.spawn_candidate_loop(candidates);
        let port_map = PortMapper::upnp();
        if config.discovery.port_mapping {
            port_map.start(p2p.local_port());
        }

        let registry = Arc::new(Self {
            config: tokio::sync::Mutex::new(config.clone()),
            node_id: identity.node_id(),
            folders,
            transfer,
            p2p,
            discovery,
            port_map,
            watch,
            tasks: Mutex::new(Vec::new()),
        });

        for folder in config.folders() {
            if let Err(e) = registry.open_folder(folder.clone()).await {
                warn!("Folder {} at {} not started: {:#}", folder.folder_id().short(), folder.path.display(), e);
            }
        }
        for kind in DiscoveryKind::ALL {
            if config.discovery.enabled(kind) {
                if let Err(e) = registry.discovery.set_enabled(kind, true) {
                    warn!("{}", e);
                }
            }
        }

        info!(
            "Registry started with {} folder(s) on port {}",
            registry.folders.read().len(),
            registry.p2p.local_port()
        );
        Ok(registry)
    }

    pub fn node_id(&self) -> [u8; 32] {
        self.node_id
    }

    pub fn listen_port(&self) -> u16 {
        self.p2p.local_port()
    }

    pub fn folders(&self) -> Vec<Arc<Folder>> {
        let mut folders: Vec<Arc<Folder>> = self.folders.read().values().cloned().collect();
        folders.sort_by(|a, b| a.root().cmp(b.root()));
        folders
    }

    pub fn folder(&self, id: &FolderId) -> Option<Arc<Folder>> {
        self.folders.read().get(id).cloned()
    }

    /// Every open session, with the folder it belongs to.
    pub fn peers(&self) -> Vec<(FolderId, SessionInfo)> {
        self.folders()
            .iter()
            .flat_map(|f| f.sessions().into_iter().map(move |s| (f.id(), s.info())))
            .collect()
    }

    pub async fn config(&self) -> Config {
        self.config.lock().await.clone()
    }

    /// Start syncing a local folder, with a fresh Owner secret unless one is given.
    pub async fn add_folder(&self, path: &Path, secret: Option<Secret>) -> Result<FolderId> {
        let path = prepare_folder_path(path)?;
        let folder = FolderConfig::new(secret.unwrap_or_else(Secret::generate), path);

        let mut config = self.config.lock().await;
        let id = config.add_folder(folder.clone())?;
        if let Err(e) = self.open_folder(folder).await {
            config.remove_folder(&id)?;
            return Err(e);
        }
        config.save().await?;
        Ok(id)
    }

    /// Join a folder from an `lvlt:` link.
    pub async fn open_link(&self, link: &str, path: &Path) -> Result<FolderId> {
        let secret = Secret::from_link(link)?;
        self.add_folder(path, Some(secret)).await
    }

    /// Stop syncing a folder. Its files stay where they are.
    pub async fn remove_folder(&self, id: &FolderId) -> Result<()> {
        let mut config = self.config.lock().await;
        config.remove_folder(id)?;
        config.save().await?;
        drop(config);
        self.close_folder(id).await;
        Ok(())
    }

    /// Rebind the transport; `None` picks a random port. Returns the bound port.
    pub async fn set_listening_port(&self, port: Option<u16>) -> Result<u16> {
        let mut config = self.config.lock().await;
        let bound = self.p2p.set_listen_port(port)?;
        self.discovery.set_listen_port(bound);
        self.port_map.set_port(bound);
        config.listen_port = port;
        config.save().await?;
        Ok(bound)
    }

    pub async fn set_discovery(&self, kind: DiscoveryKind, enabled: bool) -> Result<()> {
        let mut config = self.config.lock().await;
        self.discovery.set_enabled(kind, enabled)?;
        config.discovery.set_enabled(kind, enabled);
        config.save().await?;
        Ok(())
    }

    /// Dial a known address for a folder directly, bypassing discovery.
    pub fn connect_peer(&self, addr: SocketAddr, folder_id: FolderId) {
        self.p2p.connect(addr, folder_id);
    }

    /// Apply changes another process made to the config file.
    pub async fn reload(&self) -> Result<()> {
        let mut config = self.config.lock().await;
        let fresh = Config::load_from(config.config_path()).await?;

        for folder in fresh.folders() {
            if !self.folders.read().contains_key(&folder.folder_id()) {
                info!("Config added folder {}", folder.path.display());
                if let Err(e) = self.open_folder(folder.clone()).await {
                    warn!("Folder {} not started: {:#}", folder.path.display(), e);
                }
            }
        }
        let removed: Vec<FolderId> = self
            .folders
            .read()
            .keys()
            .filter(|id| fresh.folder(id).is_none())
            .copied()
            .collect();
        for id in removed {
            info!("Config removed folder {}", id.short());
            self.close_folder(&id).await;
        }

        if fresh.listen_port != config.listen_port {
            let bound = self.p2p.set_listen_port(fresh.listen_port)?;
            self.discovery.set_listen_port(bound);
            self.port_map.set_port(bound);
        }
        if fresh.discovery.port_mapping != config.discovery.port_mapping {
            if fresh.discovery.port_mapping {
                self.port_map.start(self.p2p.local_port());
            } else {
                self.port_map.stop().await;
            }
        }
        for kind in DiscoveryKind::ALL {
            if fresh.discovery.enabled(kind) != config.discovery.enabled(kind) {
                self.discovery.set_enabled(kind, fresh.discovery.enabled(kind))?;
            }
        }

        *config = fresh;
        Ok(())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut discovery: Vec<ChannelReport> = self
            .discovery
            .status()
            .into_iter()
            .map(|(kind, status)| ChannelReport { kind, status })
            .collect();
        discovery.sort_by_key(|r| r.kind);
        RegistrySnapshot {
            node_id: hex::encode(self.node_id),
            listen_port: self.p2p.local_port(),
            updated_at: Utc::now(),
            folders: self.folders().iter().map(|f| f.snapshot()).collect(),
            discovery,
            transfers: self
                .folders()
                .iter()
                .map(|f| f.engine().scheduler().stats())
                .fold(SchedulerStats::default(), |total, stats| total + stats),
            port_mapping: self.port_map.status(),
        }
    }

    /// Periodically pick up config edits and publish the state snapshot.
    pub fn start_heartbeat(self: &Arc<Self>, state_path: PathBuf) {
        let registry = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else { break };
                if let Err(e) = registry.reload().await {
                    warn!("Failed to reload configuration: {:#}", e);
                }
                if let Err(e) = registry.snapshot().save(&state_path).await {
                    warn!("Failed to write state snapshot: {:#}", e);
                }
            }
        });
        self.tasks.lock().push(task);
    }

    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.discovery.shutdown();
        self.port_map.stop().await;
        let folders: Vec<Arc<Folder>> = self.folders.write().drain().map(|(_, f)| f).collect();
        for folder in folders {
            folder.shutdown().await;
        }
        self.p2p.shutdown();
        info!("Registry stopped");
    }

    async fn open_folder(&self, config: FolderConfig) -> Result<Arc<Folder>> {
        let scheduler = Arc::new(TransferScheduler::new(self.transfer.clone()));
        let folder = Folder::open(config, scheduler).await?;
        folder.start(self.watch)?;
        self.folders.write().insert(folder.id(), folder.clone());
        self.discovery.add_folder(folder.id());
        debug!("Folder {} registered", folder.id().short());
        Ok(folder)
    }

    async fn close_folder(&self, id: &FolderId) {
        self.discovery.remove_folder(id);
        let folder = self.folders.write().remove(id);
        if let Some(folder) = folder {
            folder.shutdown().await;
        }
    }
}

fn register_channels(hub: &mut DiscoveryHub, config: &Config) {
    let discovery = &config.discovery;
    let interval = discovery.announce_interval();

    hub.register(Arc::new(DhtDiscovery::new(
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
        discovery.dht_routers.clone(),
        Some(config.dht_session_path()),
        interval,
    )));
    hub.register(Arc::new(LocalDiscovery::broadcast(discovery.local_port, interval)));
    if !discovery.global_url.is_empty() {
        match GlobalDiscovery::new(&discovery.global_url, interval) {
            Ok(global) => hub.register(Arc::new(global.fallback_only(discovery.global_fallback_only))),
            Err(e) => warn!("Global discovery unavailable: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConfig, TransferConfig};
    use crate::secret::Level;
    use tempfile::TempDir;

    fn offline_config(dir: &TempDir) -> Config {
        Config {
            node_id: String::new(),
            listen_port: None,
            discovery: DiscoveryConfig {
                dht: false,
                local: false,
                global: false,
                global_url: "http://127.0.0.1:1".to_string(),
                port_mapping: false,
                ..DiscoveryConfig::default()
            },
            transfer: TransferConfig::default(),
            folders: Vec::new(),
            config_file_path: dir.path().join("config/config.toml"),
        }
    }

    async fn start(dir: &TempDir) -> Arc<Registry> {
        Registry::start(offline_config(dir), Identity::generate().unwrap(), false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_remove_folder() {
        let dir = TempDir::new().unwrap();
        let registry = start(&dir).await;
        let root = dir.path().join("docs");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();

        let id = registry.add_folder(&root, None).await.unwrap();
        assert_eq!(registry.folder(&id).unwrap().level(), Level::Owner);
        let saved = Config::load_from(&dir.path().join("config/config.toml")).await.unwrap();
        assert_eq!(saved.folders().len(), 1);

        let duplicate = registry.add_folder(&root, None).await.unwrap_err();
        assert!(duplicate.to_string().contains("already synchronized"));

        registry.remove_folder(&id).await.unwrap();
        assert!(registry.folder(&id).is_none());
        assert!(root.join("a.txt").exists());
        let saved = Config::load_from(&dir.path().join("config/config.toml")).await.unwrap();
        assert!(saved.folders().is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_each_folder_has_its_own_scheduler() {
        let dir = TempDir::new().unwrap();
        let mut config = offline_config(&dir);
        config.transfer.max_concurrent_peers = 3;
        let registry = Registry::start(config, Identity::generate().unwrap(), false)
            .await
            .unwrap();

        let a = registry.add_folder(&dir.path().join("a"), None).await.unwrap();
        let b = registry.add_folder(&dir.path().join("b"), None).await.unwrap();
        let (a, b) = (registry.folder(&a).unwrap(), registry.folder(&b).unwrap());

        assert!(!Arc::ptr_eq(a.engine().scheduler(), b.engine().scheduler()));
        assert_eq!(a.engine().scheduler().config().max_concurrent_peers, 3);
        assert_eq!(registry.snapshot().transfers, SchedulerStats::default());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_link() {
        let dir = TempDir::new().unwrap();
        let registry = start(&dir).await;

        let err = registry.open_link("http://nope", &dir.path().join("x")).await.unwrap_err();
        assert_eq!(err.to_string(), "Wrong link format");

        let secret = Secret::generate().derive(Level::ReadOnly).unwrap();
        let id = registry.open_link(&secret.to_link(), &dir.path().join("shared")).await.unwrap();
        assert_eq!(id, secret.fingerprint());
        assert_eq!(registry.folder(&id).unwrap().level(), Level::ReadOnly);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_folder_rejects_file_path() {
        let dir = TempDir::new().unwrap();
        let registry = start(&dir).await;
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();

        let err = registry.add_folder(&file, None).await.unwrap_err();
        assert!(err.to_string().contains("is not a directory"));
        assert!(registry.folders().is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_port_and_discovery_commands_persist() {
        let dir = TempDir::new().unwrap();
        let registry = start(&dir).await;
        let free = std::net::UdpSocket::bind("0.0.0.0:0").unwrap().local_addr().unwrap().port();

        assert_eq!(registry.set_listening_port(Some(free)).await.unwrap(), free);
        assert_eq!(registry.listen_port(), free);

        registry.set_discovery(DiscoveryKind::Global, true).await.unwrap();
        let saved = Config::load_from(&dir.path().join("config/config.toml")).await.unwrap();
        assert_eq!(saved.listen_port, Some(free));
        assert!(saved.discovery.global);
        assert!(registry
            .snapshot()
            .discovery
            .iter()
            .any(|r| r.kind == DiscoveryKind::Global && r.status.enabled));

        registry.set_discovery(DiscoveryKind::Global, false).await.unwrap();
        assert!(!registry.config().await.discovery.global);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_applies_config_edits() {
        let dir = TempDir::new().unwrap();
        let registry = start(&dir).await;
        registry.config().await.save().await.unwrap();

        let mut edited = Config::load_from(&dir.path().join("config/config.toml")).await.unwrap();
        let root = prepare_folder_path(&dir.path().join("later")).unwrap();
        let id = edited.add_folder(FolderConfig::new(Secret::generate(), root)).unwrap();
        edited.save().await.unwrap();

        registry.reload().await.unwrap();
        assert!(registry.folder(&id).is_some());

        edited.remove_folder(&id).unwrap();
        edited.save().await.unwrap();
        registry.reload().await.unwrap();
        assert!(registry.folder(&id).is_none());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshot_file() {
        let dir = TempDir::new().unwrap();
        let registry = start(&dir).await;
        registry.add_folder(&dir.path().join("f"), None).await.unwrap();
        let path = dir.path().join("data/state.json");

        assert_eq!(RegistrySnapshot::load(&path).await.unwrap(), None);
        let snapshot = registry.snapshot();
        snapshot.save(&path).await.unwrap();

        let loaded = RegistrySnapshot::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.folders.len(), 1);
        assert_eq!(loaded.node_id, hex::encode(registry.node_id()));
        assert!(!loaded.is_stale(Utc::now()));
        assert!(loaded.is_stale(Utc::now() + chrono::Duration::seconds(60)));
        assert_eq!(loaded.transfer_rates(), (0.0, 0.0));
        assert_eq!(loaded.port_mapping, PortMapStatus::default());
        registry.shutdown().await;
    }
}

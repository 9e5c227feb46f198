//! # Configuration Management
//!
//! Persisted state the engine consumes at startup:
//! - node settings (listening port, transfer limits, timeouts)
//! - discovery channel toggles and endpoints
//! - synchronized folders with their Secrets and local roots
//!
//! The configuration is TOML in a platform-appropriate directory
//! (e.g. `~/.config/lvlt/` on Linux), overridable with `LVLT_CONFIG_DIR`.
//! The node identity key, the daemon's state snapshot and the DHT session
//! live next to it.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::{ArchiveMode, ArchivePolicy, DEFAULT_TIMESTAMP_COUNT, DEFAULT_TRASH_TTL_DAYS};
use crate::bandwidth::BandwidthLimiter;
use crate::discovery::DiscoveryKind;
use crate::scheduler::SchedulerConfig;
use crate::secret::{FolderId, Secret};
use crate::session::SessionConfig;

pub const CONFIG_DIR_ENV: &str = "LVLT_CONFIG_DIR";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    /// `None` binds a random port.
    pub listen_port: Option<u16>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub folders: Vec<FolderConfig>,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub dht: bool,
    pub local: bool,
    pub global: bool,
    /// Only use the rendezvous service for folders DHT and local discovery have not found.
    pub global_fallback_only: bool,
    /// Bootstrap nodes for the DHT, `host:port`.
    pub dht_routers: Vec<String>,
    pub global_url: String,
    pub local_port: u16,
    pub announce_interval_secs: u64,
    /// Ask the LAN gateway (UPnP) to forward the listen port.
    pub port_mapping: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            dht: true,
            local: true,
            global: true,
            global_fallback_only: true,
            dht_routers: Vec::new(),
            global_url: "https://rendezvous.lvlt.net/v1".to_string(),
            local_port: 3838,
            announce_interval_secs: 30,
            port_mapping: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn enabled(&self, kind: DiscoveryKind) -> bool {
        match kind {
            DiscoveryKind::Dht => self.dht,
            DiscoveryKind::Local => self.local,
            DiscoveryKind::Global => self.global,
        }
    }

    pub fn set_enabled(&mut self, kind: DiscoveryKind, enabled: bool) {
        match kind {
            DiscoveryKind::Dht => self.dht = enabled,
            DiscoveryKind::Local => self.local = enabled,
            DiscoveryKind::Global => self.global = enabled,
        }
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub max_concurrent_transfers: usize,
    pub max_concurrent_peers: usize,
    pub peer_queue_bound: usize,
    pub max_chunk_retries: u32,
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub reconnect_base_secs: u64,
    pub reconnect_max_secs: u64,
    /// Bytes per second; absent means unlimited.
    pub bandwidth_limit_up: Option<u64>,
    pub bandwidth_limit_down: Option<u64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        let session = SessionConfig::default();
        Self {
            max_concurrent_transfers: scheduler.max_concurrent_transfers,
            max_concurrent_peers: scheduler.max_concurrent_peers,
            peer_queue_bound: scheduler.peer_queue_bound,
            max_chunk_retries: scheduler.max_chunk_retries,
            handshake_timeout_secs: session.handshake_timeout.as_secs(),
            idle_timeout_secs: session.idle_timeout.as_secs(),
            reconnect_base_secs: scheduler.reconnect_base.as_secs(),
            reconnect_max_secs: scheduler.reconnect_max.as_secs(),
            bandwidth_limit_up: None,
            bandwidth_limit_down: None,
        }
    }
}

impl TransferConfig {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_transfers: self.max_concurrent_transfers.max(1),
            max_concurrent_peers: self.max_concurrent_peers.max(1),
            peer_queue_bound: self.peer_queue_bound.max(1),
            max_chunk_retries: self.max_chunk_retries,
            reconnect_base: Duration::from_secs(self.reconnect_base_secs.max(1)),
            reconnect_max: Duration::from_secs(self.reconnect_max_secs.max(self.reconnect_base_secs).max(1)),
            ..SchedulerConfig::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
            ..SessionConfig::default()
        }
    }

    pub fn limiter(&self) -> BandwidthLimiter {
        BandwidthLimiter::new(self.bandwidth_limit_up, self.bandwidth_limit_down)
    }
}

/// A synchronized folder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FolderConfig {
    pub secret: Secret,
    pub path: PathBuf,
    #[serde(default)]
    pub ignore_paths: Vec<String>,
    /// What happens to files that sync overwrites or deletes.
    #[serde(default)]
    pub archive: ArchiveMode,
    /// Days a trashed version is kept.
    #[serde(default = "default_trash_ttl")]
    pub archive_trash_ttl_days: u32,
    /// Versions kept per path in timestamp mode; 0 keeps all.
    #[serde(default = "default_timestamp_count")]
    pub archive_timestamp_count: u32,
    #[serde(default = "default_rescan_interval")]
    pub full_rescan_interval_secs: u64,
}

fn default_trash_ttl() -> u32 {
    DEFAULT_TRASH_TTL_DAYS
}

fn default_timestamp_count() -> u32 {
    DEFAULT_TIMESTAMP_COUNT
}

fn default_rescan_interval() -> u64 {
    600
}

impl FolderConfig {
    pub fn new(secret: Secret, path: PathBuf) -> Self {
        Self {
            secret,
            path,
            ignore_paths: Vec::new(),
            archive: ArchiveMode::default(),
            archive_trash_ttl_days: default_trash_ttl(),
            archive_timestamp_count: default_timestamp_count(),
            full_rescan_interval_secs: default_rescan_interval(),
        }
    }

    pub fn folder_id(&self) -> FolderId {
        self.secret.fingerprint()
    }

    pub fn full_rescan_interval(&self) -> Duration {
        Duration::from_secs(self.full_rescan_interval_secs.max(1))
    }

    pub fn archive_policy(&self) -> ArchivePolicy {
        ArchivePolicy {
            mode: self.archive,
            trash_ttl: Duration::from_secs(u64::from(self.archive_trash_ttl_days) * 24 * 60 * 60),
            timestamp_count: self.archive_timestamp_count as usize,
        }
    }
}

impl Config {
    pub async fn init() -> Result<Self> {
        let config_dir = Self::config_dir()?;
        tokio::fs::create_dir_all(&config_dir).await?;

        let config = Self {
            node_id: String::new(), // set from the node identity
            listen_port: None,
            discovery: DiscoveryConfig::default(),
            transfer: TransferConfig::default(),
            folders: Vec::new(),
            config_file_path: config_dir.join("config.toml"),
        };
        config.save().await?;
        Ok(config)
    }

    pub async fn load() -> Result<Self> {
        let config_file = Self::config_dir()?.join("config.toml");
        if !config_file.exists() {
            anyhow::bail!("lvlt is not initialized. Run 'lvlt init' first.");
        }
        Self::load_from(&config_file).await
    }

    pub async fn load_from(config_file: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(config_file).await?;
        let mut config: Config = toml::from_str(&content)?;
        config.config_file_path = config_file.to_path_buf();
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content).await?;
        Ok(())
    }

    /// Register a folder. Fails if the folder or the path is already synced.
    pub fn add_folder(&mut self, folder: FolderConfig) -> Result<FolderId> {
        let id = folder.folder_id();
        if self.folder(&id).is_some() {
            anyhow::bail!("Folder {} is already synchronized", id.short());
        }
        if let Some(existing) = self.folders.iter().find(|f| f.path == folder.path) {
            anyhow::bail!(
                "{} is already synchronized as folder {}",
                folder.path.display(),
                existing.folder_id().short()
            );
        }
        self.folders.push(folder);
        Ok(id)
    }

    pub fn remove_folder(&mut self, id: &FolderId) -> Result<FolderConfig> {
        let position = self
            .folders
            .iter()
            .position(|f| f.folder_id() == *id)
            .ok_or_else(|| anyhow::anyhow!("No folder with id {}", id.short()))?;
        Ok(self.folders.remove(position))
    }

    pub fn folder(&self, id: &FolderId) -> Option<&FolderConfig> {
        self.folders.iter().find(|f| f.folder_id() == *id)
    }

    pub fn folders(&self) -> &[FolderConfig] {
        &self.folders
    }

    /// Look a folder up by a unique prefix of its hex id.
    pub fn find_folder(&self, prefix: &str) -> Result<&FolderConfig> {
        let prefix = prefix.to_lowercase();
        let mut matches = self
            .folders
            .iter()
            .filter(|f| f.folder_id().to_string().starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (Some(folder), None) => Ok(folder),
            (Some(_), Some(_)) => anyhow::bail!("Folder id prefix '{}' is ambiguous", prefix),
            (None, _) => anyhow::bail!("No folder matches '{}'", prefix),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    fn base_dir(&self) -> PathBuf {
        self.config_file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn identity_path(&self) -> PathBuf {
        self.base_dir().join("identity.key")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base_dir().join("data")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir().join("state.json")
    }

    pub fn dht_session_path(&self) -> PathBuf {
        self.data_dir().join("dht_session.json")
    }

    pub fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("lvlt");
        Ok(config_dir)
    }
}

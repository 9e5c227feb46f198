//! # Command Line Interface
//!
//! The command-line shell for lvlt: argument parsing, command definitions
//! and command implementations.
//!
//! ## Commands
//!
//! - `init` - Create the configuration and the node identity
//! - `add` - Start synchronizing a local folder
//! - `remove` - Stop synchronizing a folder (files are kept)
//! - `open` - Join a folder from an `lvlt:` link
//! - `link` - Print the links of a folder
//! - `status` - Show folder status as reported by the daemon
//! - `peers` - List connected peers
//! - `port` - Change the listening port
//! - `discovery` - Toggle a discovery channel
//! - `daemon` - Run the sync engine
//!
//! Everything except `daemon` works on the configuration file; a running
//! daemon picks edits up on its next heartbeat and reports back through its
//! state snapshot.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;

use crate::config::{Config, FolderConfig};
use crate::crypto::Identity;
use crate::discovery::DiscoveryKind;
use crate::registry::{prepare_folder_path, Registry, RegistrySnapshot};
use crate::secret::{Level, Secret};

/// Command-line interface structure for lvlt.
#[derive(Parser)]
#[command(name = "lvlt")]
#[command(about = "Decentralized folder synchronization with capability secrets")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create the configuration and generate the node identity
    Init,

    /// Start synchronizing a local folder
    Add {
        /// Path to the folder to synchronize
        path: PathBuf,
        /// Use an existing secret instead of generating a new Owner secret
        #[arg(short, long)]
        secret: Option<Secret>,
    },

    /// Stop synchronizing a folder; its files stay on disk
    Remove {
        /// Folder id or a unique prefix of it
        folder: String,
    },

    /// Join a folder from an lvlt: link
    Open {
        /// The link received from another peer
        link: String,
        /// Local path where the folder will be synchronized
        path: PathBuf,
    },

    /// Print the links that share a folder
    Link {
        /// Folder id or a unique prefix of it
        folder: String,
        /// Only print the link for this level
        #[arg(short, long)]
        level: Option<Level>,
    },

    /// Show the status of all folders
    Status,

    /// List connected peers
    Peers,

    /// Set the listening port
    Port {
        /// A port number, or "random"
        port: PortChoice,
    },

    /// Turn a discovery channel on or off
    Discovery {
        /// dht, local or global
        channel: DiscoveryKind,
        /// on or off
        state: Toggle,
    },

    /// Run the sync engine in the foreground
    Daemon {
        /// Rely on periodic rescans instead of filesystem notifications
        #[arg(long)]
        no_watch: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChoice {
    Fixed(u16),
    Random,
}

impl PortChoice {
    pub fn as_option(self) -> Option<u16> {
        match self {
            PortChoice::Fixed(port) => Some(port),
            PortChoice::Random => None,
        }
    }
}

impl FromStr for PortChoice {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("random") {
            return Ok(PortChoice::Random);
        }
        match s.parse::<u16>() {
            Ok(0) => Ok(PortChoice::Random),
            Ok(port) => Ok(PortChoice::Fixed(port)),
            Err(_) => Err(format!("'{}' is neither a port number nor \"random\"", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    pub fn enabled(self) -> bool {
        self == Toggle::On
    }
}

impl FromStr for Toggle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" | "enable" | "true" => Ok(Toggle::On),
            "off" | "disable" | "false" => Ok(Toggle::Off),
            other => Err(format!("expected on or off, got '{}'", other)),
        }
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.enabled() { "on" } else { "off" })
    }
}

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init => init().await,
        Commands::Add { path, secret } => add_folder(path, secret).await,
        Commands::Remove { folder } => remove_folder(&folder).await,
        Commands::Open { link, path } => open_link(&link, path).await,
        Commands::Link { folder, level } => show_links(&folder, level).await,
        Commands::Status => show_status().await,
        Commands::Peers => show_peers().await,
        Commands::Port { port } => set_port(port).await,
        Commands::Discovery { channel, state } => set_discovery(channel, state).await,
        Commands::Daemon { no_watch } => run_daemon(!no_watch).await,
    }
}

/// Create the configuration directory, the config file and the node identity.
pub async fn init() -> Result<()> {
    info!("Initializing lvlt...");

    let mut config = if Config::config_dir()?.join("config.toml").exists() {
        println!("Already initialized; keeping the existing configuration.");
        Config::load().await?
    } else {
        Config::init().await?
    };
    let identity = Identity::load_or_generate(&config.identity_path())?;
    config.node_id = identity.node_id_hex();
    config.save().await?;
    info!("Configuration initialized at: {}", config.config_path().display());

    println!("✅ lvlt initialized");
    println!("Node ID: {}", identity.node_id_hex());
    println!("Config:  {}", config.config_path().display());
    Ok(())
}

/// Register a folder, with a fresh Owner secret unless one is given.
pub async fn add_folder(path: PathBuf, secret: Option<Secret>) -> Result<()> {
    let mut config = Config::load().await?;
    let path = prepare_folder_path(&path)?;
    let secret = secret.unwrap_or_else(Secret::generate);
    let level = secret.level();
    let id = config.add_folder(FolderConfig::new(secret, path.clone()))?;
    config.save().await?;

    println!("✅ Added folder: {}", path.display());
    println!("   Folder ID: {}", id);
    println!("   Access:    {}", level);
    println!("\n💡 Share it with: lvlt link {}", id.short());
    Ok(())
}

pub async fn remove_folder(prefix: &str) -> Result<()> {
    let mut config = Config::load().await?;
    let id = config.find_folder(prefix)?.folder_id();
    let removed = config.remove_folder(&id)?;
    config.save().await?;

    println!("🗑️  Stopped synchronizing {}", removed.path.display());
    println!("   Files were left in place.");
    Ok(())
}

/// Join a folder from a link.
pub async fn open_link(link: &str, path: PathBuf) -> Result<()> {
    let secret = Secret::from_link(link)?;
    let mut config = Config::load().await?;
    let path = prepare_folder_path(&path)?;
    let level = secret.level();
    let id = config.add_folder(FolderConfig::new(secret, path.clone()))?;
    config.save().await?;

    println!("✅ Joined folder {} at {}", id.short(), path.display());
    println!("   Access: {}", level);
    if level == Level::Encrypted {
        println!("   This node stores encrypted data only and cannot read the files.");
    }
    Ok(())
}

/// Print the links a folder can hand out: its own level and every weaker one.
pub async fn show_links(prefix: &str, level: Option<Level>) -> Result<()> {
    let config = Config::load().await?;
    let folder = config.find_folder(prefix)?;

    let levels: Vec<Level> = match level {
        Some(level) => vec![level],
        None => [Level::Owner, Level::ReadWrite, Level::ReadOnly, Level::Encrypted]
            .into_iter()
            .filter(|l| folder.secret.at_level(*l).is_some())
            .collect(),
    };

    println!("🔗 Links for {} ({})\n", folder.folder_id().short(), folder.path.display());
    for level in levels {
        let secret = folder
            .secret
            .derive(level)
            .with_context(|| format!("This folder cannot produce a {} link", level))?;
        println!("  {:<11} {}", level, secret.to_link());
    }
    Ok(())
}

pub async fn set_port(port: PortChoice) -> Result<()> {
    let mut config = Config::load().await?;
    config.listen_port = port.as_option();
    config.save().await?;

    match port {
        PortChoice::Fixed(port) => println!("✅ Listening port set to {}", port),
        PortChoice::Random => println!("✅ Listening port set to random"),
    }
    Ok(())
}

pub async fn set_discovery(kind: DiscoveryKind, state: Toggle) -> Result<()> {
    let mut config = Config::load().await?;
    config.discovery.set_enabled(kind, state.enabled());
    config.save().await?;

    println!("✅ {} discovery turned {}", kind, state);
    Ok(())
}

fn abbrev(id: &str) -> &str {
    id.get(..16).unwrap_or(id)
}

/// Read the daemon's snapshot; `None` when no daemon is reporting.
async fn live_snapshot(config: &Config) -> Result<Option<RegistrySnapshot>> {
    let snapshot = RegistrySnapshot::load(&config.state_path()).await?;
    Ok(snapshot.filter(|s| !s.is_stale(chrono::Utc::now())))
}

pub async fn show_status() -> Result<()> {
    let config = Config::load().await?;

    if config.folders().is_empty() {
        println!("No folders being synchronized.");
        println!("Add a folder with: lvlt add <path>");
        return Ok(());
    }

    let Some(snapshot) = live_snapshot(&config).await? else {
        println!("{}\n", "Daemon is not running; showing configured folders.".yellow());
        for folder in config.folders() {
            println!("  {} {}", folder.folder_id().short(), folder.path.display());
            println!("    Access: {}", folder.secret.level());
        }
        return Ok(());
    };

    println!("📂 Sync Status (node {}, port {})\n", abbrev(&snapshot.node_id), snapshot.listen_port);
    for folder in &snapshot.folders {
        println!("  {} {}", abbrev(&folder.id), folder.path.display());
        println!("    Status: {}", folder.status);
        println!("    Access: {}", folder.level);
        println!(
            "    Files: {}  Directories: {}  Size: {} bytes",
            folder.index.files, folder.index.directories, folder.index.total_size
        );
        println!("    Peers: {} connected", folder.peers.len());
        if folder.pending_transfers > 0 {
            println!("    Pending transfers: {}", folder.pending_transfers);
        }
        for warning in &folder.warnings {
            println!("    {} {}", "⚠".yellow(), warning);
        }
        println!();
    }

    let (up, down) = snapshot.transfer_rates();
    println!("Transfer: ↑ {:.0} B/s  ↓ {:.0} B/s", up, down);
    for report in &snapshot.discovery {
        let state = match (report.status.enabled, report.status.running) {
            (true, true) => "on".green(),
            (true, false) => "restarting".yellow(),
            (false, _) => "off".normal(),
        };
        print!("Discovery {}: {}", report.kind, state);
        if let Some(error) = &report.status.last_error {
            print!(" ({})", error);
        }
        println!();
    }
    let mapping = &snapshot.port_mapping;
    match (&mapping.external, &mapping.last_error) {
        (Some(external), _) => println!("Port mapping: {} {}", "on".green(), external),
        (None, Some(error)) => println!("Port mapping: {} ({})", "failing".yellow(), error),
        (None, None) if mapping.enabled => println!("Port mapping: {}", "searching".yellow()),
        (None, None) => println!("Port mapping: off"),
    }
    Ok(())
}

pub async fn show_peers() -> Result<()> {
    let config = Config::load().await?;
    let Some(snapshot) = live_snapshot(&config).await? else {
        println!("Daemon is not running. Start it with: lvlt daemon");
        return Ok(());
    };

    let peers: Vec<_> = snapshot.peers().collect();
    if peers.is_empty() {
        println!("No peers connected.");
        println!("💡 Tips:");
        println!("  - Make sure other lvlt nodes share a folder with this one");
        println!("  - Check that at least one discovery channel is on (lvlt status)");
        return Ok(());
    }

    println!("🌐 {} peer(s):\n", peers.len());
    for (i, (folder, peer)) in peers.iter().enumerate() {
        println!("{}. 📡 {}", i + 1, abbrev(&peer.node_id));
        println!("   Folder:  {}", abbrev(&folder.id));
        if let Some(address) = peer.address {
            println!("   Address: {}", address);
        }
        println!("   Access:  {} (session {})", peer.remote_level, peer.effective_level);
        println!(
            "   Speed:   ↑ {:.0} B/s  ↓ {:.0} B/s",
            peer.traffic.all.upload_rate, peer.traffic.all.download_rate
        );
        println!();
    }
    Ok(())
}

pub async fn run_daemon(watch: bool) -> Result<()> {
    info!("Starting lvlt daemon...");

    let config = Config::load().await?;
    let identity = Identity::load_or_generate(&config.identity_path())?;
    let state_path = config.state_path();
    let folder_count = config.folders().len();

    let registry = Registry::start(config, identity, watch).await?;
    registry.start_heartbeat(state_path.clone());
    registry.snapshot().save(&state_path).await?;

    println!("🚀 lvlt daemon running");
    println!("Node ID: {}", hex::encode(registry.node_id()));
    println!("Listening on port: {}", registry.listen_port());
    println!("📂 Synchronizing {} folder(s). Press Ctrl+C to stop.", folder_count);

    tokio::signal::ctrl_c().await?;

    println!("\n🛑 lvlt daemon stopping...");
    registry.shutdown().await;
    if let Err(e) = tokio::fs::remove_file(&state_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    Ok(())
}

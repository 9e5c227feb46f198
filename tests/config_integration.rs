//! Integration tests for configuration management and the commands that edit it.
//!
//! These tests point `LVLT_CONFIG_DIR` at a temp dir, so they run serially.

use serial_test::serial;
use std::path::Path;
use tempfile::TempDir;

use lvlt::cli::{self, PortChoice, Toggle};
use lvlt::config::{Config, CONFIG_DIR_ENV};
use lvlt::discovery::DiscoveryKind;
use lvlt::{Identity, Level, Secret};

struct ConfigDir(TempDir);

impl ConfigDir {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::env::set_var(CONFIG_DIR_ENV, dir.path().join("config"));
        Self(dir)
    }

    fn path(&self) -> &Path {
        self.0.path()
    }
}

impl Drop for ConfigDir {
    fn drop(&mut self) {
        std::env::remove_var(CONFIG_DIR_ENV);
    }
}

#[tokio::test]
#[serial]
async fn test_init_creates_config_and_identity() {
    let dir = ConfigDir::new();

    cli::init().await.unwrap();
    let config = Config::load().await.unwrap();
    assert_eq!(config.config_path(), dir.path().join("config/config.toml"));
    assert!(config.identity_path().exists());

    let identity = Identity::load(&config.identity_path()).unwrap();
    assert_eq!(config.node_id, identity.node_id_hex());

    // A second init keeps the existing identity and folders.
    cli::add_folder(dir.path().join("docs"), None).await.unwrap();
    cli::init().await.unwrap();
    let again = Config::load().await.unwrap();
    assert_eq!(again.node_id, config.node_id);
    assert_eq!(again.folders().len(), 1);
}

#[tokio::test]
#[serial]
async fn test_load_without_init_fails() {
    let _dir = ConfigDir::new();
    let err = Config::load().await.unwrap_err();
    assert!(err.to_string().contains("lvlt init"));
}

#[tokio::test]
#[serial]
async fn test_folder_commands() {
    let dir = ConfigDir::new();
    cli::init().await.unwrap();

    let docs = dir.path().join("docs");
    cli::add_folder(docs.clone(), None).await.unwrap();
    assert!(docs.is_dir());

    let config = Config::load().await.unwrap();
    let folder = &config.folders()[0];
    assert_eq!(folder.secret.level(), Level::Owner);
    assert_eq!(folder.path, docs.canonicalize().unwrap());

    // Same path twice is refused.
    assert!(cli::add_folder(docs.clone(), None).await.is_err());

    // A link for the same folder is refused too, even at another level.
    let read_only = folder.secret.derive(Level::ReadOnly).unwrap();
    let err = cli::open_link(&read_only.to_link(), dir.path().join("copy")).await.unwrap_err();
    assert!(err.to_string().contains("already synchronized"));

    let prefix = folder.folder_id().to_string()[..8].to_string();
    cli::show_links(&prefix, None).await.unwrap();
    cli::show_links(&prefix, Some(Level::Encrypted)).await.unwrap();

    cli::remove_folder(&prefix).await.unwrap();
    assert!(Config::load().await.unwrap().folders().is_empty());
    assert!(docs.is_dir());
    assert!(cli::remove_folder(&prefix).await.is_err());
}

#[tokio::test]
#[serial]
async fn test_open_link() {
    let dir = ConfigDir::new();
    cli::init().await.unwrap();

    let err = cli::open_link("https://example.com/x", dir.path().join("x")).await.unwrap_err();
    assert_eq!(err.to_string(), "Wrong link format");
    assert!(!dir.path().join("x").exists());

    let secret = Secret::generate().derive(Level::Encrypted).unwrap();
    cli::open_link(&secret.to_link(), dir.path().join("relay")).await.unwrap();
    let config = Config::load().await.unwrap();
    assert_eq!(config.folders()[0].secret, secret);

    // An encrypted folder has no readable links to hand out.
    let prefix = secret.fingerprint().to_string();
    assert!(cli::show_links(&prefix, Some(Level::ReadOnly)).await.is_err());
}

#[tokio::test]
#[serial]
async fn test_port_and_discovery_commands() {
    let _dir = ConfigDir::new();
    cli::init().await.unwrap();

    cli::set_port(PortChoice::Fixed(45123)).await.unwrap();
    assert_eq!(Config::load().await.unwrap().listen_port, Some(45123));
    cli::set_port(PortChoice::Random).await.unwrap();
    assert_eq!(Config::load().await.unwrap().listen_port, None);

    cli::set_discovery(DiscoveryKind::Dht, Toggle::Off).await.unwrap();
    cli::set_discovery(DiscoveryKind::Local, Toggle::Off).await.unwrap();
    let discovery = Config::load().await.unwrap().discovery;
    assert!(!discovery.dht);
    assert!(!discovery.local);
    assert!(discovery.global);
}

#[tokio::test]
#[serial]
async fn test_status_and_peers_without_daemon() {
    let dir = ConfigDir::new();
    cli::init().await.unwrap();
    cli::show_status().await.unwrap();
    cli::add_folder(dir.path().join("docs"), None).await.unwrap();
    cli::show_status().await.unwrap();
    cli::show_peers().await.unwrap();
}

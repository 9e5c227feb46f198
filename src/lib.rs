//! # lvlt
//!
//! Decentralized folder synchronization driven by a single shared Secret.
//!
//! A folder is identified by the fingerprint of its Secret. Whoever holds a
//! form of the Secret can find the other holders (DHT, local broadcast or a
//! rendezvous service) and synchronize with them directly. The form held
//! decides what a node may do:
//!
//! - **Owner**: full control, can hand out every weaker form
//! - **ReadWrite**: reads and signs changes
//! - **ReadOnly**: reads, never changes anyone else's copy
//! - **Encrypted**: stores and relays ciphertext without being able to read it
//!
//! ## Core Modules
//!
//! - [`secret`] - capability hierarchy, derivation and `lvlt:` links
//! - [`index`] - signed content index, scanning and conflict resolution
//! - [`storage`], [`archive`] - content-addressed chunk store and trash
//! - [`session`], [`protocol`] - peer sessions and their wire messages
//! - [`reconcile`], [`sync`] - deciding and executing what to exchange
//! - [`scheduler`], [`bandwidth`] - transfer admission and throughput
//! - [`discovery`] - DHT, local and global peer discovery
//! - [`p2p`], [`portmap`] - QUIC transport and gateway port forwarding
//! - [`folder`], [`registry`] - open folders and the process-wide registry
//! - [`cli`], [`config`] - command-line shell and persisted configuration
//!
//! ## Quick Start
//!
//! ```bash
//! lvlt init
//! lvlt add ~/Documents
//! lvlt link <folder-id> --level read-only
//! lvlt daemon
//! ```

pub mod archive;
pub mod bandwidth;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod debounce;
pub mod discovery;
pub mod error;
pub mod folder;
pub mod index;
pub mod p2p;
pub mod portmap;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod requests;
pub mod scheduler;
pub mod secret;
pub mod session;
pub mod storage;
pub mod sync;
pub mod watcher;

pub use config::Config;
pub use crypto::Identity;
pub use error::{Result, SyncError};
pub use folder::Folder;
pub use registry::Registry;
pub use secret::{FolderId, Level, Secret};

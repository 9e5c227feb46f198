//! # P2P Networking Module
//!
//! QUIC transport for peer sessions. Every session runs on its own
//! bidirectional stream: the connecting side opens a stream and starts the
//! handshake; the accepting side reads the peer's `Hello`, routes the stream
//! to the folder it names and answers.
//!
//! ## Features
//!
//! - **Secure transport**: QUIC with TLS; peers are authenticated by the
//!   folder handshake, not by certificates
//! - **Routing**: incoming streams are dispatched to folders by folder id
//! - **Duplicate suppression**: one session per (folder, node); when both
//!   nodes dial each other the session opened by the smaller node id wins
//! - **Reconnect**: failed outgoing sessions are retried with capped
//!   exponential backoff
//! - **Port changes**: the endpoint can be rebound to a new port at runtime

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use quinn::{Connection, Endpoint, RecvStream, SendStream, VarInt};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bandwidth::BandwidthLimiter;
use crate::crypto::Identity;
use crate::discovery::{Candidate, CandidateTracker};
use crate::error::SyncError;
use crate::folder::Folder;
use crate::protocol::{read_message, write_message, Message};
use crate::scheduler::ReconnectTracker;
use crate::secret::FolderId;
use crate::session::{self, SessionConfig, SessionEnd, SessionHandle, SessionParams, SessionState};

pub const ALPN: &[u8] = b"lvlt/1";
const SERVER_NAME: &str = "localhost";
const MAX_CONNECT_FAILURES: u32 = 6;
const CANDIDATE_WINDOW: Duration = Duration::from_secs(120);
const QUIC_KEEP_ALIVE: Duration = Duration::from_secs(10);

/// Folders reachable by id, shared with the registry.
pub type FolderMap = Arc<RwLock<HashMap<FolderId, Arc<Folder>>>>;

pub struct P2PService {
    node_id: [u8; 32],
    endpoint: Endpoint,
    folders: FolderMap,
    session_config: SessionConfig,
    limiter: Arc<BandwidthLimiter>,
    reconnect: ReconnectTracker,
    /// Outgoing (folder, address) pairs with a live connect or session task.
    dialing: Mutex<HashSet<(FolderId, SocketAddr)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl P2PService {
    pub fn start(
        identity: &Identity,
        listen_port: Option<u16>,
        folders: FolderMap,
        session_config: SessionConfig,
        limiter: Arc<BandwidthLimiter>,
        reconnect: ReconnectTracker,
    ) -> Result<Arc<Self>> {
        let (cert_der, key_der) = generate_self_signed_cert(identity)?;
        let server_config = configure_server(cert_der, key_der)?;
        let client_config = configure_client()?;

        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, listen_port.unwrap_or(0)));
        let mut endpoint = Endpoint::server(server_config, bind_addr)?;
        endpoint.set_default_client_config(client_config);
        info!("P2P service listening on {}", endpoint.local_addr()?);

        let service = Arc::new(Self {
            node_id: identity.node_id(),
            endpoint,
            folders,
            session_config,
            limiter,
            reconnect,
            dialing: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let accept_task = {
            let service = service.clone();
            tokio::spawn(async move {
                while let Some(connecting) = service.endpoint.accept().await {
                    let service = service.clone();
                    tokio::spawn(async move {
                        match connecting.await {
                            Ok(connection) => service.handle_connection(connection).await,
                            Err(e) => warn!("Failed to accept connection: {}", e),
                        }
                    });
                }
                debug!("P2P endpoint stopped accepting");
            })
        };
        service.tasks.lock().push(accept_task);
        Ok(service)
    }

    pub fn local_port(&self) -> u16 {
        self.endpoint.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Move the endpoint to another port (`None` picks a random one). Returns the bound port.
    pub fn set_listen_port(&self, port: Option<u16>) -> Result<u16> {
        let socket = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port.unwrap_or(0)))?;
        self.endpoint.rebind(socket)?;
        let bound = self.local_port();
        info!("P2P service now listening on port {}", bound);
        Ok(bound)
    }

    /// Dial every admitted discovery candidate in the background.
    pub fn spawn_candidate_loop(self: &Arc<Self>, mut candidates: mpsc::Receiver<Candidate>) {
        let service = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut tracker = CandidateTracker::new(CANDIDATE_WINDOW);
            while let Some(candidate) = candidates.recv().await {
                let Some(service) = service.upgrade() else { break };
                if tracker.admit(&candidate) {
                    debug!(
                        "Candidate {} for folder {} from {} discovery",
                        candidate.addr,
                        candidate.folder_id.short(),
                        candidate.source
                    );
                    service.connect(candidate.addr, candidate.folder_id);
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Keep a session to `addr` for `folder_id` alive, reconnecting with backoff.
    /// Does nothing if such a task is already running.
    pub fn connect(self: &Arc<Self>, addr: SocketAddr, folder_id: FolderId) {
        if !self.dialing.lock().insert((folder_id, addr)) {
            return;
        }
        let service = self.clone();
        let task = tokio::spawn(async move {
            service.maintain(addr, folder_id).await;
            service.dialing.lock().remove(&(folder_id, addr));
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub fn shutdown(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn folder(&self, id: &FolderId) -> Option<Arc<Folder>> {
        self.folders.read().get(id).filter(|f| !f.is_removed()).cloned()
    }

    fn params(&self, folder: &Folder, remote: SocketAddr) -> SessionParams {
        SessionParams {
            secret: folder.secret().clone(),
            node_id: self.node_id,
            listen_port: Some(self.local_port()),
            remote_addr: Some(remote),
            config: self.session_config.clone(),
            limiter: self.limiter.clone(),
        }
    }

    async fn maintain(&self, addr: SocketAddr, folder_id: FolderId) {
        let mut failures = 0;
        loop {
            let Some(folder) = self.folder(&folder_id) else { return };

            match self.open_session(addr, &folder).await {
                Ok((handle, driver, connection)) => {
                    self.reconnect.record_success(&addr);
                    failures = 0;
                    if !self.adopt(&folder, handle, true) {
                        connection.close(VarInt::from_u32(0), b"duplicate");
                        return;
                    }
                    let end = driver.await;
                    connection.close(VarInt::from_u32(0), b"session ended");
                    match end {
                        Ok(SessionEnd {
                            state: SessionState::Failed,
                            error: Some(e),
                        }) if e.is_retryable() => {
                            debug!("Session to {} failed ({}), reconnecting", addr, e);
                        }
                        _ => return,
                    }
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures >= MAX_CONNECT_FAILURES {
                        info!("Giving up on {} for folder {}: {}", addr, folder_id.short(), e);
                        return;
                    }
                    debug!("Connecting to {} failed: {}", addr, e);
                }
                Err(e) => {
                    debug!("Not connecting to {} for folder {}: {}", addr, folder_id.short(), e);
                    return;
                }
            }

            let delay = self.reconnect.record_failure(addr);
            tokio::time::sleep(delay).await;
        }
    }

    async fn open_session(
        &self,
        addr: SocketAddr,
        folder: &Arc<Folder>,
    ) -> crate::error::Result<(SessionHandle, JoinHandle<SessionEnd>, Connection)> {
        let connecting = self.endpoint.connect(addr, SERVER_NAME).map_err(transport)?;
        let connection = tokio::time::timeout(self.session_config.handshake_timeout, connecting)
            .await
            .map_err(|_| SyncError::Timeout("connect"))?
            .map_err(transport)?;
        let (send, recv) = connection.open_bi().await.map_err(transport)?;

        match session::start(recv, send, self.params(folder, addr), None, folder.clone()).await {
            Ok((handle, driver)) => Ok((handle, driver, connection)),
            Err(e) => {
                connection.close(VarInt::from_u32(1), b"handshake failed");
                Err(e)
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, connection: Connection) {
        let remote = connection.remote_address();
        debug!("Accepted connection from {}", remote);
        loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let service = self.clone();
                    let connection = connection.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.accept_session(send, recv, remote, connection).await {
                            debug!("Incoming session from {} rejected: {}", remote, e);
                        }
                    });
                }
                Err(e) => {
                    debug!("Connection from {} closed: {}", remote, e);
                    break;
                }
            }
        }
    }

    async fn accept_session(
        &self,
        mut send: SendStream,
        mut recv: RecvStream,
        remote: SocketAddr,
        connection: Connection,
    ) -> crate::error::Result<()> {
        let first = tokio::time::timeout(self.session_config.handshake_timeout, read_message(&mut recv))
            .await
            .map_err(|_| SyncError::Timeout("hello"))??;
        let hello = match first {
            Some((Message::Hello(hello), _)) => hello,
            Some((other, _)) => return Err(SyncError::Protocol(format!("expected hello, got {}", other.kind()))),
            None => return Err(SyncError::Transport("stream closed before hello".into())),
        };

        let Some(folder) = self.folder(&hello.folder_id) else {
            let _ = write_message(&mut send, &Message::Bye).await;
            return Err(SyncError::Protocol(format!("unknown folder {}", hello.folder_id.short())));
        };

        let (handle, driver) = session::start(recv, send, self.params(&folder, remote), Some(hello), folder.clone()).await?;
        if self.adopt(&folder, handle, false) {
            let _ = driver.await;
            connection.close(VarInt::from_u32(0), b"session ended");
        }
        Ok(())
    }

    /// Attach a fresh session unless it duplicates a preferred one or the folder
    /// is out of peer slots. Returns false if it was closed.
    fn adopt(&self, folder: &Arc<Folder>, handle: SessionHandle, outgoing: bool) -> bool {
        let remote = handle.remote_node_id();
        let initiator = if outgoing { self.node_id } else { remote };
        let preferred = self.node_id.min(remote);

        if let Some(existing) = folder.session_with(&remote) {
            if initiator != preferred {
                debug!("Duplicate session with {}, closing {}", hex::encode(&remote[..4]), handle.id());
                tokio::spawn(async move { handle.close().await });
                return false;
            }
            debug!("Duplicate session with {}, replacing {}", hex::encode(&remote[..4]), existing.id());
            folder.detach(&existing);
            tokio::spawn(async move { existing.close().await });
        }
        folder.attach(handle)
    }
}

fn transport<E: std::fmt::Display>(e: E) -> SyncError {
    SyncError::Transport(e.to_string())
}

// Self-signed certificate; peers are authenticated by the folder handshake.
fn generate_self_signed_cert(identity: &Identity) -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate()?;
    let mut params = rcgen::CertificateParams::default();

    let node_id = identity.node_id_hex();
    params.subject_alt_names = vec![
        rcgen::SanType::DnsName(SERVER_NAME.to_string().try_into()?),
        rcgen::SanType::DnsName(format!("{}.lvlt.local", &node_id[..16]).try_into()?),
    ];
    let mut distinguished_name = rcgen::DistinguishedName::new();
    distinguished_name.push(rcgen::DnType::CommonName, format!("lvlt-{}", &node_id[..8]));
    params.distinguished_name = distinguished_name;

    let cert = params.self_signed(&key_pair)?;
    Ok((cert.der().to_vec(), key_pair.serialize_der()))
}

fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(QUIC_KEEP_ALIVE));
    Arc::new(transport)
}

fn configure_server(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<quinn::ServerConfig> {
    let mut crypto = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![rustls::Certificate(cert_der)], rustls::PrivateKey(key_der))?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(transport_config());
    Ok(server_config)
}

fn configure_client() -> Result<quinn::ClientConfig> {
    let mut crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(transport_config());
    Ok(client_config)
}

struct SkipServerVerification;

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

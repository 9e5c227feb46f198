//! # Peer Session
//!
//! One connection to one peer for one folder:
//!
//! ```text
//! Connecting → Handshaking → CapabilityNegotiated → IndexExchange → Syncing → Closed
//!                                                                          ↘ Failed
//! ```
//!
//! The handshake exchanges [`Hello`]s, fixes the session capability at
//! `min(local level, remote level)` and has each side prove that level with a
//! MAC only holders of the matching Secret form can compute. After that the
//! session runs three tasks: a writer fed by a channel, a reader dispatching
//! frames, and a ticker for keepalives and periodic summary re-exchange.
//!
//! Sessions are generic over `AsyncRead`/`AsyncWrite`, so the same code runs
//! on QUIC streams and on in-memory pipes.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bandwidth::{BandwidthLimiter, PeerTraffic, TrafficSnapshot};
use crate::crypto::{self, Hash};
use crate::error::{Result, SyncError};
use crate::index::{FileEntry, IndexSummary};
use crate::protocol::{
    proof_mac, read_message, write_message, Hello, Message, RequestBody, ResponseBody, PROTOCOL_VERSION,
};
use crate::requests::RequestManager;
use crate::secret::{FolderId, Level, Secret};

const OUTGOING_QUEUE: usize = 256;
const MAX_CONCURRENT_SERVES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SessionState {
    Connecting,
    Handshaking,
    CapabilityNegotiated,
    IndexExchange,
    Syncing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Allowed forward transitions; any live state may end in `Closed` or `Failed`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Closed)
                | (_, Failed)
                | (Connecting, Handshaking)
                | (Handshaking, CapabilityNegotiated)
                | (CapabilityNegotiated, IndexExchange)
                | (IndexExchange, Syncing)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub summary_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            summary_interval: Duration::from_secs(60),
        }
    }
}

/// What the local side presents when opening a session.
#[derive(Clone)]
pub struct SessionParams {
    pub secret: Secret,
    pub node_id: [u8; 32],
    pub listen_port: Option<u16>,
    pub remote_addr: Option<SocketAddr>,
    pub config: SessionConfig,
    pub limiter: Arc<BandwidthLimiter>,
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub folder_id: FolderId,
    pub remote_node_id: [u8; 32],
    pub remote_level: Level,
    pub effective: Level,
    pub remote_listen_port: Option<u16>,
}

/// The folder side of a session: supplies local state and receives remote events.
#[async_trait]
pub trait SessionHost: Send + Sync + 'static {
    async fn local_summary(&self) -> IndexSummary;

    /// Called on a spawned task; may issue requests back through `session`.
    async fn on_remote_summary(&self, session: SessionHandle, summary: IndexSummary);

    /// A writer announced a newer entry.
    async fn on_remote_offer(&self, session: SessionHandle, entry: FileEntry);

    async fn serve(&self, request: RequestBody) -> ResponseBody;

    fn on_session_closed(&self, _session: &SessionHandle) {}
}

/// Why and how a session ended.
#[derive(Debug)]
pub struct SessionEnd {
    pub state: SessionState,
    pub error: Option<SyncError>,
}

struct SessionShared {
    id: Uuid,
    negotiated: Negotiated,
    remote_addr: Option<SocketAddr>,
    outgoing: mpsc::Sender<Message>,
    requests: RequestManager,
    state: watch::Sender<SessionState>,
    shutdown: watch::Sender<bool>,
    failure: Mutex<Option<SyncError>>,
    traffic: Arc<PeerTraffic>,
    request_timeout: Duration,
}

impl SessionShared {
    fn transition(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!("Session {} {} -> {}", self.id, current, next);
                *current = next;
                true
            } else {
                false
            }
        });
    }

    fn fail(&self, error: SyncError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(error);
        }
        drop(failure);
        self.shutdown.send_replace(true);
    }
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("remote", &hex::encode(&self.shared.negotiated.remote_node_id[..4]))
            .field("effective", &self.shared.negotiated.effective)
            .finish()
    }
}

/// Point-in-time description of a session for the shell.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub node_id: String,
    pub address: Option<SocketAddr>,
    pub remote_level: Level,
    pub effective_level: Level,
    pub state: SessionState,
    pub traffic: TrafficSnapshot,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn folder_id(&self) -> FolderId {
        self.shared.negotiated.folder_id
    }

    pub fn remote_node_id(&self) -> [u8; 32] {
        self.shared.negotiated.remote_node_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote_addr
    }

    pub fn remote_level(&self) -> Level {
        self.shared.negotiated.remote_level
    }

    /// Port the peer accepts connections on, as announced in its hello.
    pub fn remote_listen_port(&self) -> Option<u16> {
        self.shared.negotiated.remote_listen_port
    }

    pub fn effective_level(&self) -> Level {
        self.shared.negotiated.effective
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        !self.state().is_terminal()
    }

    pub fn traffic(&self) -> Arc<PeerTraffic> {
        self.shared.traffic.clone()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id(),
            node_id: hex::encode(self.remote_node_id()),
            address: self.remote_addr(),
            remote_level: self.remote_level(),
            effective_level: self.effective_level(),
            state: self.state(),
            traffic: self.shared.traffic.snapshot(),
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.shared.outgoing.send(message).await.map_err(|_| SyncError::Closed)
    }

    pub async fn send_summary(&self, summary: IndexSummary) -> Result<()> {
        self.send(Message::IndexSummary(summary)).await
    }

    /// Announce a newer entry. Only meaningful on sessions with write capability.
    pub async fn offer(&self, entry: FileEntry) -> Result<()> {
        if !self.effective_level().can_write() {
            return Err(SyncError::WriteNotPermitted(self.effective_level()));
        }
        self.send(Message::Have(entry)).await
    }

    async fn request(&self, body: RequestBody) -> Result<ResponseBody> {
        let outgoing = self.shared.outgoing.clone();
        self.shared
            .requests
            .send_request(
                body,
                |id, body| async move {
                    outgoing
                        .send(Message::Request { id, body })
                        .await
                        .map_err(|_| SyncError::Closed)
                },
                self.shared.request_timeout,
            )
            .await
    }

    pub async fn request_entry(&self, path: &str) -> Result<Option<FileEntry>> {
        match self.request(RequestBody::Entry { path: path.to_string() }).await? {
            ResponseBody::Entry(entry) => Ok(entry),
            ResponseBody::Unavailable(reason) => Err(SyncError::ChunkUnavailable(reason)),
            other => Err(SyncError::Protocol(format!("unexpected response to entry request: {:?}", other))),
        }
    }

    /// Fetch an encrypted chunk and check it hashes to its address.
    pub async fn request_chunk(&self, hash: &Hash) -> Result<Vec<u8>> {
        match self.request(RequestBody::Chunk { hash: *hash }).await? {
            ResponseBody::Chunk { hash: got, data } => {
                if got != *hash || crypto::hash(&data) != *hash {
                    return Err(SyncError::HashMismatch(hex::encode(hash)));
                }
                Ok(data)
            }
            ResponseBody::Unavailable(reason) => Err(SyncError::ChunkUnavailable(reason)),
            other => Err(SyncError::Protocol(format!("unexpected response to chunk request: {:?}", other))),
        }
    }

    /// Send `Bye` and stop the session.
    pub async fn close(&self) {
        if self.is_open() {
            let _ = self.send(Message::Bye).await;
        }
        self.shared.shutdown.send_replace(true);
    }

    /// Wait until the session reaches a terminal state.
    pub async fn closed(&self) -> SessionState {
        let mut rx = self.shared.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }
}

/// Run the handshake on a fresh transport.
///
/// `received_hello` carries the peer's `Hello` when the caller already read
/// it to route the connection to a folder.
pub async fn handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    params: &SessionParams,
    received_hello: Option<Hello>,
) -> Result<Negotiated>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(
        params.config.handshake_timeout,
        exchange_proofs(reader, writer, params, received_hello),
    )
    .await
    .map_err(|_| SyncError::Timeout("handshake"))?
}

async fn exchange_proofs<R, W>(
    reader: &mut R,
    writer: &mut W,
    params: &SessionParams,
    received_hello: Option<Hello>,
) -> Result<Negotiated>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let secret = &params.secret;
    let folder_id = secret.fingerprint();
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ours = Hello {
        version: PROTOCOL_VERSION,
        folder_id,
        node_id: params.node_id,
        level: secret.level(),
        nonce,
        listen_port: params.listen_port,
    };
    write_message(writer, &Message::Hello(ours)).await?;

    let theirs = match received_hello {
        Some(hello) => hello,
        None => match read_message(reader).await? {
            Some((Message::Hello(hello), _)) => hello,
            Some((other, _)) => {
                return Err(SyncError::Protocol(format!("expected hello, got {}", other.kind())));
            }
            None => return Err(SyncError::Transport("connection closed during handshake".into())),
        },
    };

    if theirs.version != PROTOCOL_VERSION {
        return Err(SyncError::Protocol(format!("unsupported protocol version {}", theirs.version)));
    }
    if theirs.folder_id != folder_id {
        let _ = write_message(writer, &Message::Bye).await;
        return Err(SyncError::CapabilityMismatch {
            local: folder_id,
            remote: theirs.folder_id,
        });
    }
    if theirs.node_id == params.node_id {
        return Err(SyncError::Protocol("connected to self".into()));
    }

    let effective = secret.level().min(theirs.level);
    let auth_key = secret
        .auth_key(effective)
        .ok_or(SyncError::AuthenticationFailed(effective))?;

    let mac = proof_mac(&auth_key, &theirs.nonce, &nonce, &params.node_id);
    write_message(writer, &Message::Proof { mac }).await?;

    let their_mac = match read_message(reader).await? {
        Some((Message::Proof { mac }, _)) => mac,
        Some((Message::Bye, _)) | None => {
            return Err(SyncError::AuthenticationFailed(effective));
        }
        Some((other, _)) => {
            return Err(SyncError::Protocol(format!("expected proof, got {}", other.kind())));
        }
    };
    let expected = proof_mac(&auth_key, &nonce, &theirs.nonce, &theirs.node_id);
    // blake3::Hash compares in constant time
    if blake3::Hash::from(their_mac) != blake3::Hash::from(expected) {
        let _ = write_message(writer, &Message::Bye).await;
        return Err(SyncError::AuthenticationFailed(effective));
    }

    Ok(Negotiated {
        folder_id,
        remote_node_id: theirs.node_id,
        remote_level: theirs.level,
        effective,
        remote_listen_port: theirs.listen_port,
    })
}

/// Handshake, then start the session tasks.
///
/// Returns the handle and a join handle resolving when the session ends.
pub async fn start<R, W>(
    mut reader: R,
    mut writer: W,
    params: SessionParams,
    received_hello: Option<Hello>,
    host: Arc<dyn SessionHost>,
) -> Result<(SessionHandle, JoinHandle<SessionEnd>)>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (state_tx, _) = watch::channel(SessionState::Connecting);
    state_tx.send_replace(SessionState::Handshaking);

    let negotiated = handshake(&mut reader, &mut writer, &params, received_hello).await?;
    info!(
        "Session with {} for folder {} negotiated at {} (remote holds {})",
        hex::encode(&negotiated.remote_node_id[..4]),
        negotiated.folder_id.short(),
        negotiated.effective,
        negotiated.remote_level
    );

    let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
    let (shutdown, _) = watch::channel(false);
    let shared = Arc::new(SessionShared {
        id: Uuid::new_v4(),
        negotiated,
        remote_addr: params.remote_addr,
        outgoing,
        requests: RequestManager::new(),
        state: state_tx,
        shutdown,
        failure: Mutex::new(None),
        traffic: PeerTraffic::new(),
        request_timeout: params.config.request_timeout,
    });
    shared.transition(SessionState::CapabilityNegotiated);

    let handle = SessionHandle { shared: shared.clone() };

    let writer_task = tokio::spawn(write_loop(writer, outgoing_rx, shared.clone(), params.limiter.clone()));

    handle.send_summary(host.local_summary().await).await?;
    shared.transition(SessionState::IndexExchange);

    let ticker_task = tokio::spawn(tick_loop(handle.clone(), host.clone(), params.config.clone()));

    let driver = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let (state, error) = read_loop(reader, handle.clone(), host.clone(), params).await;

            shared.shutdown.send_replace(true);
            shared.requests.cancel_all();
            ticker_task.abort();
            let mut writer_task = writer_task;
            if tokio::time::timeout(Duration::from_secs(1), &mut writer_task).await.is_err() {
                debug!("Writer for session {} did not drain in time", shared.id);
                writer_task.abort();
            }

            shared.transition(state);
            host.on_session_closed(&handle);
            match &error {
                Some(e) => warn!("Session {} failed: {}", shared.id, e),
                None => info!("Session {} closed", shared.id),
            }
            SessionEnd { state, error }
        })
    };

    Ok((handle, driver))
}

async fn write_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::Receiver<Message>,
    shared: Arc<SessionShared>,
    limiter: Arc<BandwidthLimiter>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outgoing.recv().await {
        let size = match write_message(&mut writer, &message).await {
            Ok(size) => size as u64,
            Err(e) => {
                shared.fail(e);
                return;
            }
        };
        limiter.request_upload_quota(size).await;
        shared.traffic.all.record(size, true);
        if let Message::Response {
            body: ResponseBody::Chunk { data, .. },
            ..
        } = &message
        {
            shared.traffic.chunks.record(data.len() as u64, true);
        }
        if matches!(message, Message::Bye) {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn tick_loop(handle: SessionHandle, host: Arc<dyn SessionHost>, config: SessionConfig) {
    let start = tokio::time::Instant::now();
    let mut keepalive = tokio::time::interval_at(start + config.keepalive_interval, config.keepalive_interval);
    let mut summary = tokio::time::interval_at(start + config.summary_interval, config.summary_interval);

    loop {
        let message = tokio::select! {
            _ = keepalive.tick() => Message::Ping,
            _ = summary.tick() => Message::IndexSummary(host.local_summary().await),
        };
        if handle.send(message).await.is_err() {
            break;
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    handle: SessionHandle,
    host: Arc<dyn SessionHost>,
    params: SessionParams,
) -> (SessionState, Option<SyncError>)
where
    R: AsyncRead + Unpin,
{
    let shared = handle.shared.clone();
    let mut shutdown = shared.shutdown.subscribe();
    let serve_slots = Arc::new(Semaphore::new(MAX_CONCURRENT_SERVES));
    let effective = shared.negotiated.effective;

    let ended = |shared: &SessionShared| match shared.failure.lock().take() {
        Some(e) => (SessionState::Failed, Some(e)),
        None => (SessionState::Closed, None),
    };

    loop {
        if *shutdown.borrow() {
            return ended(&shared);
        }

        let next = tokio::select! {
            _ = shutdown.changed() => return ended(&shared),
            r = tokio::time::timeout(params.config.idle_timeout, read_message(&mut reader)) => r,
        };

        let (message, size) = match next {
            Err(_) => return (SessionState::Failed, Some(SyncError::Timeout("idle session"))),
            Ok(Err(e)) => return (SessionState::Failed, Some(e)),
            Ok(Ok(None)) => {
                return (
                    SessionState::Failed,
                    Some(SyncError::Transport("connection closed by peer".into())),
                )
            }
            Ok(Ok(Some(frame))) => frame,
        };
        params.limiter.request_download_quota(size as u64).await;
        shared.traffic.all.record(size as u64, false);

        match message {
            Message::IndexSummary(summary) => {
                shared.transition(SessionState::Syncing);
                let (host, handle) = (host.clone(), handle.clone());
                tokio::spawn(async move { host.on_remote_summary(handle, summary).await });
            }
            Message::Have(entry) => {
                if effective.can_write() {
                    let (host, handle) = (host.clone(), handle.clone());
                    tokio::spawn(async move { host.on_remote_offer(handle, entry).await });
                } else {
                    debug!("Ignoring offer for {} on a {} session", entry.path, effective);
                }
            }
            Message::Request { id, body } => {
                let (host, outgoing, slots) = (host.clone(), shared.outgoing.clone(), serve_slots.clone());
                tokio::spawn(async move {
                    let Ok(_permit) = slots.acquire_owned().await else {
                        return;
                    };
                    let body = host.serve(body).await;
                    let _ = outgoing.send(Message::Response { id, body }).await;
                });
            }
            Message::Response { id, body } => {
                if let ResponseBody::Chunk { data, .. } = &body {
                    shared.traffic.chunks.record(data.len() as u64, false);
                }
                shared.requests.handle_response(id, body);
            }
            Message::Ping => {}
            Message::Bye => return (SessionState::Closed, None),
            Message::Hello(_) | Message::Proof { .. } => {
                return (
                    SessionState::Failed,
                    Some(SyncError::Protocol("handshake message after negotiation".into())),
                );
            }
        }
    }
}

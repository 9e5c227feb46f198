//! Kademlia-style DHT used to find peers for a folder anywhere on the
//! internet.
//!
//! Nodes exchange small JSON packets over UDP. A folder is published under an
//! info hash derived from its [`FolderId`], so the DHT never carries folder
//! ids directly. Announcing means an iterative `get_peers` lookup towards the
//! info hash followed by `announce_peer` to the closest nodes that answered,
//! using the write token each of them handed out.
//!
//! The node id and a sample of known nodes are kept in `dht_session.json`
//! so a restarted daemon rejoins without touching the bootstrap routers.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

use super::{Announcement, CandidateSink, DiscoveryChannel, DiscoveryKind};
use crate::secret::FolderId;

/// Bucket size and lookup width.
pub const K: usize = 8;
const ALPHA: usize = 3;
const MAX_LOOKUP_ROUNDS: usize = 8;
const MAX_FAILURES: u32 = 3;
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const PEER_TTL: Duration = Duration::from_secs(30 * 60);
const MAX_PEERS_PER_HASH: usize = 64;
const MAX_INFO_HASHES: usize = 4096;
const SESSION_NODES: usize = 64;
const MAX_PACKET: usize = 64 * 1024;
const INFO_HASH_CONTEXT: &str = "lvlt 2024 dht folder info hash";

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub [u8; 32]);

impl NodeKey {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeKey(bytes)
    }

    pub fn distance(&self, other: &NodeKey) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bucket index for `other` relative to `self`: the length of the common
    /// prefix. `None` for the same key.
    pub fn bucket_index(&self, other: &NodeKey) -> Option<usize> {
        let distance = self.distance(other);
        let mut prefix = 0;
        for byte in distance {
            if byte == 0 {
                prefix += 8;
                continue;
            }
            prefix += byte.leading_zeros() as usize;
            return Some(prefix);
        }
        None
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", hex::encode(&self.0[..4]))
    }
}

impl Serialize for NodeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for NodeKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(NodeKey(bytes))
    }
}

/// Key a folder is published under.
pub fn info_hash(folder_id: &FolderId) -> NodeKey {
    NodeKey(blake3::derive_key(INFO_HASH_CONTEXT, folder_id.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContact {
    pub id: NodeKey,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub tx: u64,
    pub id: NodeKey,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Ping,
    Pong,
    FindNode { target: NodeKey },
    Nodes { nodes: Vec<NodeContact> },
    GetPeers { info_hash: NodeKey },
    Peers { token: String, peers: Vec<SocketAddr>, nodes: Vec<NodeContact> },
    AnnouncePeer { info_hash: NodeKey, port: u16, token: String },
    Ack,
    Error { message: String },
}

impl Body {
    fn is_response(&self) -> bool {
        matches!(
            self,
            Body::Pong | Body::Nodes { .. } | Body::Peers { .. } | Body::Ack | Body::Error { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct Entry {
    contact: NodeContact,
    failures: u32,
}

/// 256 k-buckets indexed by common-prefix length with the local id.
#[derive(Debug)]
pub struct RoutingTable {
    own: NodeKey,
    buckets: Vec<Vec<Entry>>,
}

impl RoutingTable {
    pub fn new(own: NodeKey) -> Self {
        Self {
            own,
            buckets: vec![Vec::new(); 256],
        }
    }

    /// Insert or refresh a contact. A full bucket only admits a newcomer in
    /// place of an entry that has failed to answer.
    pub fn insert(&mut self, contact: NodeContact) -> bool {
        let Some(index) = self.own.bucket_index(&contact.id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.iter().position(|e| e.contact.id == contact.id) {
            bucket.remove(pos);
            bucket.push(Entry { contact, failures: 0 });
            return true;
        }
        if bucket.len() >= K {
            match bucket.iter().position(|e| e.failures > 0) {
                Some(pos) => {
                    bucket.remove(pos);
                }
                None => return false,
            }
        }
        bucket.push(Entry { contact, failures: 0 });
        true
    }

    pub fn mark_failed(&mut self, addr: &SocketAddr) {
        for bucket in &mut self.buckets {
            bucket.retain_mut(|e| {
                if &e.contact.addr == addr {
                    e.failures += 1;
                }
                e.failures < MAX_FAILURES
            });
        }
    }

    pub fn closest(&self, target: &NodeKey, count: usize) -> Vec<NodeContact> {
        let mut all: Vec<NodeContact> = self.buckets.iter().flatten().map(|e| e.contact).collect();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(count);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Announced peers per info hash, expiring after [`PEER_TTL`].
///
/// At most [`MAX_INFO_HASHES`] hashes are tracked; a new hash past the cap
/// evicts the one announced least recently.
#[derive(Debug)]
pub struct PeerStore {
    peers: HashMap<NodeKey, HashMap<SocketAddr, Instant>>,
    ttl: Duration,
    max_hashes: usize,
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new(PEER_TTL, MAX_INFO_HASHES)
    }
}

impl PeerStore {
    pub fn new(ttl: Duration, max_hashes: usize) -> Self {
        Self {
            peers: HashMap::new(),
            ttl,
            max_hashes: max_hashes.max(1),
        }
    }

    pub fn add(&mut self, info_hash: NodeKey, addr: SocketAddr) {
        let now = Instant::now();
        if !self.peers.contains_key(&info_hash) && self.peers.len() >= self.max_hashes {
            self.prune(now);
            if self.peers.len() >= self.max_hashes {
                let stalest = self
                    .peers
                    .iter()
                    .min_by_key(|(_, entry)| entry.values().max().copied())
                    .map(|(hash, _)| *hash);
                if let Some(hash) = stalest {
                    self.peers.remove(&hash);
                }
            }
        }

        let entry = self.peers.entry(info_hash).or_default();
        if entry.len() >= MAX_PEERS_PER_HASH && !entry.contains_key(&addr) {
            if let Some(oldest) = entry.iter().min_by_key(|(_, at)| **at).map(|(a, _)| *a) {
                entry.remove(&oldest);
            }
        }
        entry.insert(addr, now);
    }

    pub fn get(&mut self, info_hash: &NodeKey) -> Vec<SocketAddr> {
        let now = Instant::now();
        let ttl = self.ttl;
        let Some(entry) = self.peers.get_mut(info_hash) else {
            return Vec::new();
        };
        entry.retain(|_, at| now.duration_since(*at) < ttl);
        let peers: Vec<SocketAddr> = entry.keys().copied().collect();
        if peers.is_empty() {
            self.peers.remove(info_hash);
        }
        peers
    }

    /// Drop expired announcements and the hashes left without any.
    pub fn prune(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.peers.retain(|_, entry| {
            entry.retain(|_, at| now.duration_since(*at) < ttl);
            !entry.is_empty()
        });
    }

    pub fn tracked_hashes(&self) -> usize {
        self.peers.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNode {
    pub ip: IpAddr,
    pub port: u16,
}

/// Persisted node id and known nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtSession {
    pub id: NodeKey,
    pub nodes: Vec<SessionNode>,
}

impl DhtSession {
    pub async fn load(path: &Path) -> Option<Self> {
        let content = tokio::fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Ignoring unreadable DHT session {}: {}", path.display(), e);
                None
            }
        }
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LookupResult {
    peers: HashSet<SocketAddr>,
    /// Closest responders with the write token they issued.
    responders: Vec<(NodeContact, String)>,
}

struct DhtNode {
    id: NodeKey,
    socket: UdpSocket,
    table: Mutex<RoutingTable>,
    store: Mutex<PeerStore>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Packet>>>,
    next_tx: AtomicU64,
    token_secret: [u8; 32],
}

impl DhtNode {
    fn new(id: NodeKey, socket: UdpSocket) -> Self {
        let mut token_secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token_secret);
        Self {
            id,
            socket,
            table: Mutex::new(RoutingTable::new(id)),
            store: Mutex::new(PeerStore::default()),
            pending: Mutex::new(HashMap::new()),
            next_tx: AtomicU64::new(1),
            token_secret,
        }
    }

    fn token_for(&self, ip: IpAddr) -> String {
        let hash = blake3::keyed_hash(&self.token_secret, ip.to_string().as_bytes());
        hex::encode(&hash.as_bytes()[..16])
    }

    async fn send(&self, addr: SocketAddr, packet: &Packet) -> anyhow::Result<()> {
        let data = serde_json::to_vec(packet)?;
        self.socket.send_to(&data, addr).await?;
        Ok(())
    }

    async fn query(&self, addr: SocketAddr, body: Body) -> anyhow::Result<Packet> {
        let tx = self.next_tx.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(tx, reply_tx);

        let result = async {
            self.send(addr, &Packet { tx, id: self.id, body }).await?;
            match timeout(QUERY_TIMEOUT, reply_rx).await {
                Ok(Ok(packet)) => Ok(packet),
                Ok(Err(_)) => Err(anyhow::anyhow!("query to {} dropped", addr)),
                Err(_) => Err(anyhow::anyhow!("query to {} timed out", addr)),
            }
        }
        .await;

        self.pending.lock().remove(&tx);
        if result.is_err() {
            self.table.lock().mark_failed(&addr);
        }
        result
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    debug!("DHT receive error: {}", e);
                    continue;
                }
            };
            match serde_json::from_slice::<Packet>(&buf[..len]) {
                Ok(packet) => {
                    if let Err(e) = self.handle(packet, from).await {
                        debug!("Failed to answer DHT packet from {}: {}", from, e);
                    }
                }
                Err(e) => debug!("Ignoring malformed DHT packet from {}: {}", from, e),
            }
        }
    }

    async fn handle(&self, packet: Packet, from: SocketAddr) -> anyhow::Result<()> {
        if packet.id == self.id {
            return Ok(());
        }
        self.table.lock().insert(NodeContact { id: packet.id, addr: from });

        if packet.body.is_response() {
            if let Some(waiter) = self.pending.lock().remove(&packet.tx) {
                let _ = waiter.send(packet);
            }
            return Ok(());
        }

        let body = match packet.body {
            Body::Ping => Body::Pong,
            Body::FindNode { target } => Body::Nodes {
                nodes: self.table.lock().closest(&target, K),
            },
            Body::GetPeers { info_hash } => Body::Peers {
                token: self.token_for(from.ip()),
                peers: self.store.lock().get(&info_hash),
                nodes: self.table.lock().closest(&info_hash, K),
            },
            Body::AnnouncePeer { info_hash, port, token } => {
                if token == self.token_for(from.ip()) {
                    self.store.lock().add(info_hash, SocketAddr::new(from.ip(), port));
                    Body::Ack
                } else {
                    Body::Error {
                        message: "invalid token".to_string(),
                    }
                }
            }
            _ => return Ok(()),
        };
        self.send(from, &Packet { tx: packet.tx, id: self.id, body }).await
    }

    async fn bootstrap(&self, seeds: &[SocketAddr]) {
        let replies = join_all(seeds.iter().map(|addr| self.query(*addr, Body::FindNode { target: self.id }))).await;
        let mut table = self.table.lock();
        for reply in replies.into_iter().flatten() {
            if let Body::Nodes { nodes } = reply.body {
                for node in nodes {
                    table.insert(node);
                }
            }
        }
    }

    async fn lookup(&self, target: NodeKey) -> LookupResult {
        let mut shortlist: BTreeMap<[u8; 32], NodeContact> = self
            .table
            .lock()
            .closest(&target, K)
            .into_iter()
            .map(|c| (c.id.distance(&target), c))
            .collect();
        let mut queried: HashSet<SocketAddr> = HashSet::new();
        let mut result = LookupResult::default();

        for _ in 0..MAX_LOOKUP_ROUNDS {
            let batch: Vec<NodeContact> = shortlist
                .values()
                .take(K)
                .filter(|c| !queried.contains(&c.addr))
                .take(ALPHA)
                .copied()
                .collect();
            if batch.is_empty() {
                break;
            }
            queried.extend(batch.iter().map(|c| c.addr));

            let replies = join_all(batch.iter().map(|c| self.query(c.addr, Body::GetPeers { info_hash: target }))).await;
            for (contact, reply) in batch.into_iter().zip(replies) {
                let Ok(packet) = reply else {
                    shortlist.remove(&contact.id.distance(&target));
                    continue;
                };
                if let Body::Peers { token, peers, nodes } = packet.body {
                    result.peers.extend(peers);
                    result.responders.push((NodeContact { id: packet.id, addr: contact.addr }, token));
                    for node in nodes.into_iter().filter(|n| n.id != self.id) {
                        shortlist.entry(node.id.distance(&target)).or_insert(node);
                    }
                }
            }
        }

        result.responders.sort_by_key(|(c, _)| c.id.distance(&target));
        result.responders.truncate(K);
        result
    }

    async fn announce(&self, info_hash: NodeKey, port: u16, responders: &[(NodeContact, String)]) -> usize {
        let acks = join_all(responders.iter().map(|(contact, token)| {
            self.query(
                contact.addr,
                Body::AnnouncePeer {
                    info_hash,
                    port,
                    token: token.clone(),
                },
            )
        }))
        .await;
        acks.into_iter()
            .filter(|r| matches!(r, Ok(Packet { body: Body::Ack, .. })))
            .count()
    }

    fn session(&self) -> DhtSession {
        let nodes = self
            .table
            .lock()
            .closest(&self.id, SESSION_NODES)
            .into_iter()
            .map(|c| SessionNode {
                ip: c.addr.ip(),
                port: c.addr.port(),
            })
            .collect();
        DhtSession { id: self.id, nodes }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct DhtDiscovery {
    bind: SocketAddr,
    routers: Vec<String>,
    session_path: Option<PathBuf>,
    interval: Duration,
    known_nodes: Arc<AtomicUsize>,
}

impl DhtDiscovery {
    pub fn new(bind: SocketAddr, routers: Vec<String>, session_path: Option<PathBuf>, interval: Duration) -> Self {
        Self {
            bind,
            routers,
            session_path,
            interval,
            known_nodes: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn seeds(&self, session_nodes: &[SessionNode]) -> Vec<SocketAddr> {
        let mut seeds: Vec<SocketAddr> = session_nodes.iter().map(|n| SocketAddr::new(n.ip, n.port)).collect();
        for router in &self.routers {
            match tokio::net::lookup_host(router.as_str()).await {
                Ok(addrs) => seeds.extend(addrs.filter(|a| a.is_ipv4() == self.bind.is_ipv4())),
                Err(e) => warn!("Failed to resolve DHT router {}: {}", router, e),
            }
        }
        seeds.sort();
        seeds.dedup();
        seeds
    }

    async fn round(&self, node: &DhtNode, announcement: &Announcement, sink: &CandidateSink, session_nodes: &[SessionNode]) {
        node.store.lock().prune(Instant::now());
        if node.table.lock().len() < K {
            let seeds = self.seeds(session_nodes).await;
            node.bootstrap(&seeds).await;
        }

        for folder_id in announcement.folders() {
            let hash = info_hash(&folder_id);
            let found = node.lookup(hash).await;
            for peer in &found.peers {
                sink.emit(*peer, folder_id);
            }
            let acked = node.announce(hash, announcement.listen_port(), &found.responders).await;
            debug!(
                "DHT announce for folder {}: {} peers found, {} nodes stored us",
                folder_id.short(),
                found.peers.len(),
                acked
            );
        }

        self.known_nodes.store(node.table.lock().len(), Ordering::Relaxed);
        if let Some(path) = &self.session_path {
            if let Err(e) = node.session().save(path).await {
                warn!("Failed to save DHT session: {}", e);
            }
        }
    }
}

#[async_trait]
impl DiscoveryChannel for DhtDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Dht
    }

    async fn run(
        &self,
        announcement: Arc<Announcement>,
        sink: CandidateSink,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let session = match &self.session_path {
            Some(path) => DhtSession::load(path).await,
            None => None,
        };
        let (id, session_nodes) = match session {
            Some(session) => (session.id, session.nodes),
            None => (NodeKey::random(), Vec::new()),
        };

        let socket = UdpSocket::bind(self.bind).await?;
        info!("DHT node {:?} listening on {}", id, socket.local_addr()?);
        let node = Arc::new(DhtNode::new(id, socket));
        let mut receiver = AbortOnDrop(tokio::spawn(node.clone().receive_loop()));

        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.round(&node, &announcement, &sink, &session_nodes).await,
                _ = announcement.changed() => self.round(&node, &announcement, &sink, &session_nodes).await,
                result = &mut receiver.0 => anyhow::bail!("DHT receive loop ended: {:?}", result),
                _ = shutdown.changed() => {
                    if let Some(path) = &self.session_path {
                        node.session().save(path).await?;
                    }
                    return Ok(());
                }
            }
        }
    }

    fn detail(&self) -> Option<String> {
        Some(format!("{} nodes", self.known_nodes.load(Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryHub;
    use tempfile::TempDir;

    fn key(first: u8) -> NodeKey {
        let mut bytes = [0u8; 32];
        bytes[0] = first;
        NodeKey(bytes)
    }

    fn contact(first: u8, port: u16) -> NodeContact {
        NodeContact {
            id: key(first),
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    fn free_udp_addr() -> SocketAddr {
        std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
    }

    #[test]
    fn test_bucket_index() {
        let own = key(0);
        assert_eq!(own.bucket_index(&own), None);
        assert_eq!(own.bucket_index(&key(0x80)), Some(0));
        assert_eq!(own.bucket_index(&key(0x01)), Some(7));
        let mut far = [0u8; 32];
        far[31] = 1;
        assert_eq!(own.bucket_index(&NodeKey(far)), Some(255));
    }

    #[test]
    fn test_routing_table_orders_by_distance() {
        let mut table = RoutingTable::new(key(0));
        for (i, first) in [0x80u8, 0x40, 0x20, 0x10].iter().enumerate() {
            assert!(table.insert(contact(*first, 1000 + i as u16)));
        }
        let closest = table.closest(&key(0x11), 2);
        assert_eq!(closest[0].id, key(0x10));
        assert_eq!(closest[1].id, key(0x20));
        assert!(!table.insert(contact(0, 999)));
    }

    #[test]
    fn test_peer_store_drops_expired_hashes() {
        let mut store = PeerStore::new(Duration::from_millis(20), 16);
        let peer = SocketAddr::from(([10, 0, 0, 1], 4000));
        store.add(key(1), peer);
        store.add(key(2), peer);
        assert_eq!(store.get(&key(1)), vec![peer]);

        std::thread::sleep(Duration::from_millis(40));
        assert!(store.get(&key(1)).is_empty());
        assert_eq!(store.tracked_hashes(), 1);
        store.prune(Instant::now());
        assert_eq!(store.tracked_hashes(), 0);
    }

    #[test]
    fn test_peer_store_caps_tracked_hashes() {
        let mut store = PeerStore::new(PEER_TTL, 4);
        let peer = SocketAddr::from(([10, 0, 0, 1], 4000));
        for i in 0..4u8 {
            store.add(key(i), peer);
            std::thread::sleep(Duration::from_millis(2));
        }
        store.add(key(1), SocketAddr::from(([10, 0, 0, 2], 4000)));
        store.add(key(9), peer);

        assert_eq!(store.tracked_hashes(), 4);
        assert!(store.get(&key(0)).is_empty());
        assert_eq!(store.get(&key(1)).len(), 2);
        assert_eq!(store.get(&key(9)), vec![peer]);
    }

    #[test]
    fn test_full_bucket_replaces_failed_entries() {
        let mut table = RoutingTable::new(key(0));
        for i in 0..K as u8 {
            assert!(table.insert(contact(0x80 | i, 2000 + i as u16)));
        }
        assert!(!table.insert(contact(0xf0, 3000)));

        table.mark_failed(&SocketAddr::from(([127, 0, 0, 1], 2000)));
        assert!(table.insert(contact(0xf0, 3000)));
        assert_eq!(table.len(), K);

        for _ in 0..MAX_FAILURES {
            table.mark_failed(&SocketAddr::from(([127, 0, 0, 1], 2001)));
        }
        assert_eq!(table.len(), K - 1);
    }

    #[test]
    fn test_packet_wire_format() {
        let packet = Packet {
            tx: 7,
            id: key(1),
            body: Body::GetPeers { info_hash: key(2) },
        };
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["body"]["type"], "get_peers");
        assert_eq!(json["id"].as_str().unwrap().len(), 64);
        let back: Packet = serde_json::from_value(json).unwrap();
        assert_eq!(back.body, packet.body);
    }

    #[test]
    fn test_info_hash_hides_folder_id() {
        let folder = FolderId([4; 32]);
        assert_ne!(info_hash(&folder).0, folder.0);
        assert_eq!(info_hash(&folder), info_hash(&FolderId([4; 32])));
    }

    #[tokio::test]
    async fn test_session_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/dht_session.json");
        let session = DhtSession {
            id: key(9),
            nodes: vec![SessionNode {
                ip: "10.1.2.3".parse().unwrap(),
                port: 6881,
            }],
        };
        session.save(&path).await.unwrap();
        assert_eq!(DhtSession::load(&path).await, Some(session));

        tokio::fs::write(&path, b"not json").await.unwrap();
        assert_eq!(DhtSession::load(&path).await, None);
    }

    #[tokio::test]
    async fn test_announce_requires_valid_token() {
        let node = DhtNode::new(key(1), UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let from: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let token = node.token_for(from.ip());
        assert_eq!(token, node.token_for(from.ip()));
        assert_ne!(token, node.token_for("127.0.0.2".parse().unwrap()));

        let announce = |token: String| Packet {
            tx: 1,
            id: key(2),
            body: Body::AnnouncePeer {
                info_hash: key(3),
                port: 4000,
                token,
            },
        };
        node.handle(announce("bogus".into()), from).await.unwrap();
        assert!(node.store.lock().get(&key(3)).is_empty());

        node.handle(announce(token), from).await.unwrap();
        assert_eq!(node.store.lock().get(&key(3)), vec!["127.0.0.1:4000".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_peers_meet_through_router() {
        let dir = TempDir::new().unwrap();
        let router_addr = free_udp_addr();
        let routers = vec![router_addr.to_string()];
        let folder = FolderId([7; 32]);
        let tick = Duration::from_millis(200);

        let (mut router_hub, _router_rx) = DiscoveryHub::new(Announcement::new([1; 32], 0));
        router_hub.register(Arc::new(DhtDiscovery::new(router_addr, Vec::new(), None, tick)));
        router_hub.set_enabled(DiscoveryKind::Dht, true).unwrap();

        let (mut hub_a, _rx_a) = DiscoveryHub::new(Announcement::new([2; 32], 5002));
        let session_a = dir.path().join("a/dht_session.json");
        hub_a.register(Arc::new(DhtDiscovery::new(
            free_udp_addr(),
            routers.clone(),
            Some(session_a.clone()),
            tick,
        )));
        hub_a.add_folder(folder);
        hub_a.set_enabled(DiscoveryKind::Dht, true).unwrap();

        let (mut hub_b, mut rx_b) = DiscoveryHub::new(Announcement::new([3; 32], 5003));
        hub_b.register(Arc::new(DhtDiscovery::new(free_udp_addr(), routers, None, tick)));
        hub_b.add_folder(folder);
        hub_b.set_enabled(DiscoveryKind::Dht, true).unwrap();

        let expected: SocketAddr = "127.0.0.1:5002".parse().unwrap();
        let found = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let candidate = rx_b.recv().await.unwrap();
                if candidate.addr == expected {
                    return candidate;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(found.folder_id, folder);
        assert_eq!(found.source, DiscoveryKind::Dht);

        let saved = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match DhtSession::load(&session_a).await {
                    Some(session) if !session.nodes.is_empty() => return session,
                    _ => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            }
        })
        .await
        .unwrap();
        assert!(saved.nodes.iter().any(|n| n.port == router_addr.port()));

        router_hub.shutdown();
        hub_a.shutdown();
        hub_b.shutdown();
    }
}

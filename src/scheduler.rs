//! # Transfer Scheduler
//!
//! Bounds how much chunk I/O a folder does at once and decides who to ask:
//!
//! - each live session holds a peer slot, so a folder talks to at most
//!   `max_concurrent_peers` peers
//! - a fair semaphore caps concurrent chunk transfers, so waiting requests
//!   are served in arrival order
//! - each peer has a queue of requests waiting for a slot; once it reaches
//!   the configured bound the peer is throttled until the queue drains
//! - every request is re-admitted against the latest local index right
//!   before it goes out
//! - chunks that arrive corrupted are re-requested up to a retry limit,
//!   after which the source peer is deprioritized for a while
//! - failed connections are retried with capped exponential backoff

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::crypto::{self, Hash};
use crate::error::{Result, SyncError};
use crate::sync::RemotePeer;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_transfers: usize,
    pub max_concurrent_peers: usize,
    pub peer_queue_bound: usize,
    pub max_chunk_retries: u32,
    pub deprioritize_for: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 8,
            max_concurrent_peers: 16,
            peer_queue_bound: 64,
            max_chunk_retries: 3,
            deprioritize_for: Duration::from_secs(120),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(300),
        }
    }
}

struct PeerQueue {
    queued: watch::Sender<usize>,
    throttled: bool,
}

impl PeerQueue {
    fn new() -> Self {
        Self {
            queued: watch::channel(0).0,
            throttled: false,
        }
    }
}

/// Place in a peer's queue; leaving it on drop.
struct QueueSlot<'a> {
    scheduler: &'a TransferScheduler,
    peer_id: String,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let mut queues = self.scheduler.queues.lock();
        if let Some(queue) = queues.get_mut(&self.peer_id) {
            queue.queued.send_modify(|n| *n = n.saturating_sub(1));
            if *queue.queued.borrow() == 0 && queue.throttled {
                queue.throttled = false;
                debug!("Peer {} drained, throttle lifted", self.peer_id);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerStats {
    pub connected_peers: usize,
    pub active_transfers: usize,
    pub queued_requests: usize,
    pub throttled_peers: usize,
    pub deprioritized_peers: usize,
}

impl std::ops::Add for SchedulerStats {
    type Output = SchedulerStats;

    fn add(self, other: SchedulerStats) -> SchedulerStats {
        SchedulerStats {
            connected_peers: self.connected_peers + other.connected_peers,
            active_transfers: self.active_transfers + other.active_transfers,
            queued_requests: self.queued_requests + other.queued_requests,
            throttled_peers: self.throttled_peers + other.throttled_peers,
            deprioritized_peers: self.deprioritized_peers + other.deprioritized_peers,
        }
    }
}

/// Transfer admission for one folder.
pub struct TransferScheduler {
    config: SchedulerConfig,
    transfers: Arc<Semaphore>,
    peers: Arc<Semaphore>,
    queues: Mutex<HashMap<String, PeerQueue>>,
    retries: Mutex<HashMap<(String, Hash), u32>>,
    deprioritized: Mutex<HashMap<String, Instant>>,
}

impl TransferScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            transfers: Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1))),
            peers: Arc::new(Semaphore::new(config.max_concurrent_peers.max(1))),
            queues: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            deprioritized: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Reserve a peer slot; `None` when the folder is at its peer limit.
    pub fn try_acquire_peer(&self) -> Option<OwnedSemaphorePermit> {
        self.peers.clone().try_acquire_owned().ok()
    }

    pub fn is_throttled(&self, peer_id: &str) -> bool {
        self.queues.lock().get(peer_id).map(|q| q.throttled).unwrap_or(false)
    }

    pub fn is_deprioritized(&self, peer_id: &str) -> bool {
        let mut deprioritized = self.deprioritized.lock();
        match deprioritized.get(peer_id) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                deprioritized.remove(peer_id);
                false
            }
            None => false,
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let queues = self.queues.lock();
        SchedulerStats {
            connected_peers: self.config.max_concurrent_peers.max(1) - self.peers.available_permits(),
            active_transfers: self.config.max_concurrent_transfers.max(1) - self.transfers.available_permits(),
            queued_requests: queues.values().map(|q| *q.queued.borrow()).sum(),
            throttled_peers: queues.values().filter(|q| q.throttled).count(),
            deprioritized_peers: self
                .deprioritized
                .lock()
                .values()
                .filter(|until| **until > Instant::now())
                .count(),
        }
    }

    /// Peers with queue or retry state.
    pub fn tracked_peers(&self) -> usize {
        let mut ids: Vec<String> = self.queues.lock().keys().cloned().collect();
        ids.extend(self.retries.lock().keys().map(|(peer, _)| peer.clone()));
        ids.sort();
        ids.dedup();
        ids.len()
    }

    /// Forget queue and retry state of a peer whose session ended.
    pub fn forget_peer(&self, peer_id: &str) {
        self.queues.lock().remove(peer_id);
        self.retries.lock().retain(|(peer, _), _| peer != peer_id);
    }

    async fn enqueue(&self, peer_id: &str) -> QueueSlot<'_> {
        loop {
            let mut drained = {
                let mut queues = self.queues.lock();
                let queue = queues.entry(peer_id.to_string()).or_insert_with(PeerQueue::new);
                if !queue.throttled {
                    queue.queued.send_modify(|n| *n += 1);
                    if *queue.queued.borrow() >= self.config.peer_queue_bound.max(1) {
                        queue.throttled = true;
                        debug!("Peer {} queue full, throttling", peer_id);
                    }
                    return QueueSlot {
                        scheduler: self,
                        peer_id: peer_id.to_string(),
                    };
                }
                queue.queued.subscribe()
            };
            let _ = drained.wait_for(|n| *n == 0).await;
        }
    }

    /// Fetch one chunk from `peer` through the worker pool.
    ///
    /// `admit` is consulted after a worker slot is granted and before the
    /// request is sent; a `false` aborts with [`SyncError::Superseded`].
    pub async fn fetch_chunk<P>(&self, peer: &P, hash: Hash, admit: &(dyn Fn() -> bool + Send + Sync)) -> Result<Vec<u8>>
    where
        P: RemotePeer + ?Sized,
    {
        let peer_id = peer.peer_id();
        if self.is_deprioritized(&peer_id) {
            return Err(SyncError::ChunkUnavailable(format!("peer {} is deprioritized", peer_id)));
        }

        loop {
            let slot = self.enqueue(&peer_id).await;
            let _permit = self
                .transfers
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| SyncError::Closed)?;
            drop(slot);

            if !admit() {
                return Err(SyncError::Superseded(hex::encode(hash)));
            }

            let outcome = match peer.fetch_chunk(&hash).await {
                Ok(data) if crypto::hash(&data) == hash => Ok(data),
                Ok(_) => Err(SyncError::HashMismatch(hex::encode(hash))),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(data) => {
                    self.retries.lock().remove(&(peer_id.clone(), hash));
                    return Ok(data);
                }
                Err(SyncError::HashMismatch(h)) => {
                    let attempts = {
                        let mut retries = self.retries.lock();
                        let count = retries.entry((peer_id.clone(), hash)).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if attempts > self.config.max_chunk_retries {
                        warn!(
                            "Chunk {} from {} failed verification {} times, deprioritizing peer",
                            &h[..8],
                            peer_id,
                            attempts
                        );
                        self.deprioritized
                            .lock()
                            .insert(peer_id.clone(), Instant::now() + self.config.deprioritize_for);
                        self.retries.lock().remove(&(peer_id.clone(), hash));
                        return Err(SyncError::HashMismatch(h));
                    }
                    debug!("Chunk {} failed verification, re-requesting (attempt {})", &h[..8], attempts);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Per-address reconnect schedule with capped exponential backoff.
pub struct ReconnectTracker {
    base: Duration,
    max: Duration,
    entries: Mutex<HashMap<SocketAddr, (ExponentialBackoff, Instant)>>,
}

impl ReconnectTracker {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base)
            .with_max_interval(self.max)
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Whether an attempt to `addr` is due.
    pub fn ready(&self, addr: &SocketAddr) -> bool {
        self.entries
            .lock()
            .get(addr)
            .map(|(_, next)| Instant::now() >= *next)
            .unwrap_or(true)
    }

    /// Record a failed attempt, returning the delay before the next one.
    pub fn record_failure(&self, addr: SocketAddr) -> Duration {
        let mut entries = self.entries.lock();
        let (backoff, next) = entries.entry(addr).or_insert_with(|| (self.backoff(), Instant::now()));
        let delay = backoff.next_backoff().unwrap_or(self.max).min(self.max);
        *next = Instant::now() + delay;
        delay
    }

    pub fn record_success(&self, addr: &SocketAddr) {
        self.entries.lock().remove(addr);
    }
}

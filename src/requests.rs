//! # Request/Response Correlation
//!
//! Matches responses arriving on a session's reader loop to the tasks that
//! issued the requests:
//!
//! 1. Each outgoing request gets a fresh id and a pending oneshot slot
//! 2. The caller's send function puts the frame on the wire
//! 3. The reader loop hands incoming responses to [`RequestManager::handle_response`]
//! 4. The caller wakes with the body, or times out and the slot is dropped
//!
//! When a session ends, [`RequestManager::cancel_all`] fails every waiting
//! request at once so no task waits on a dead connection.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::protocol::{RequestBody, ResponseBody};

const STALE_AFTER: Duration = Duration::from_secs(300);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RequestManager {
    pending_requests: Arc<RwLock<HashMap<Uuid, PendingRequest>>>,
}

#[derive(Debug)]
struct PendingRequest {
    kind: &'static str,
    response_sender: oneshot::Sender<ResponseBody>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestManager {
    /// Must be called inside a tokio runtime: starts the stale-request sweeper.
    pub fn new() -> Self {
        let manager = Self {
            pending_requests: Arc::new(RwLock::new(HashMap::new())),
        };
        manager.start_cleanup_task();
        manager
    }

    /// Register a request, send it with `send_fn`, and wait for its response.
    pub async fn send_request<F, Fut>(
        &self,
        body: RequestBody,
        send_fn: F,
        timeout_duration: Duration,
    ) -> Result<ResponseBody>
    where
        F: FnOnce(Uuid, RequestBody) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let request_id = Uuid::new_v4();
        let (response_tx, response_rx) = oneshot::channel();
        let kind = match &body {
            RequestBody::Entry { .. } => "entry response",
            RequestBody::Chunk { .. } => "chunk response",
        };

        self.pending_requests.write().insert(
            request_id,
            PendingRequest {
                kind,
                response_sender: response_tx,
                created_at: chrono::Utc::now(),
            },
        );

        if let Err(e) = send_fn(request_id, body).await {
            self.pending_requests.write().remove(&request_id);
            return Err(e);
        }

        match timeout(timeout_duration, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending_requests.write().remove(&request_id);
                Err(SyncError::Closed)
            }
            Err(_) => {
                let expired = self.pending_requests.write().remove(&request_id);
                let kind = expired.map(|p| p.kind).unwrap_or(kind);
                debug!("Request {} timed out waiting for {}", request_id, kind);
                Err(SyncError::Timeout(kind))
            }
        }
    }

    /// Deliver a response. Returns false for unknown or already expired ids.
    pub fn handle_response(&self, request_id: Uuid, body: ResponseBody) -> bool {
        let pending = self.pending_requests.write().remove(&request_id);
        match pending {
            Some(pending) => {
                debug!("Received {} for request {}", pending.kind, request_id);
                if pending.response_sender.send(body).is_err() {
                    debug!("Requester for {} went away before its response", request_id);
                }
                true
            }
            None => {
                warn!("Received response for unknown request: {}", request_id);
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending_requests.read().len()
    }

    /// Fail every waiting request; their callers see `SyncError::Closed`.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.pending_requests.write().drain().collect();
        if !drained.is_empty() {
            debug!("Cancelled {} pending requests", drained.len());
        }
    }

    fn start_cleanup_task(&self) {
        let pending_requests: Weak<RwLock<HashMap<Uuid, PendingRequest>>> = Arc::downgrade(&self.pending_requests);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let Some(pending_requests) = pending_requests.upgrade() else {
                    break;
                };

                let cutoff = chrono::Utc::now() - chrono::Duration::from_std(STALE_AFTER).unwrap_or_default();
                let mut requests = pending_requests.write();
                let before = requests.len();
                requests.retain(|_, req| req.created_at >= cutoff);
                if requests.len() < before {
                    warn!("Dropped {} stale requests", before - requests.len());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_request_manager_creation() {
        let manager = RequestManager::new();
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_chunk_request_response() {
        let manager = RequestManager::new();
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();

        let request_task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .send_request(
                        RequestBody::Chunk { hash: [1; 32] },
                        |id, body| async move {
                            sent_tx.send((id, body)).map_err(|_| SyncError::Closed)
                        },
                        Duration::from_secs(1),
                    )
                    .await
            })
        };

        let (id, body) = sent_rx.recv().await.unwrap();
        assert_eq!(body, RequestBody::Chunk { hash: [1; 32] });
        assert_eq!(manager.pending_count(), 1);

        assert!(manager.handle_response(
            id,
            ResponseBody::Chunk {
                hash: [1; 32],
                data: vec![1, 2, 3, 4]
            }
        ));

        let result = request_task.await.unwrap().unwrap();
        assert_eq!(
            result,
            ResponseBody::Chunk {
                hash: [1; 32],
                data: vec![1, 2, 3, 4]
            }
        );
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let manager = RequestManager::new();

        let result = manager
            .send_request(
                RequestBody::Entry { path: "a.txt".into() },
                |_, _| async { Ok(()) },
                Duration::from_millis(100),
            )
            .await;

        assert_matches!(result, Err(SyncError::Timeout("entry response")));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure() {
        let manager = RequestManager::new();

        let result = manager
            .send_request(
                RequestBody::Chunk { hash: [1; 32] },
                |_, _| async { Err(SyncError::Transport("send failed".into())) },
                Duration::from_secs(1),
            )
            .await;

        assert_matches!(result, Err(SyncError::Transport(_)));
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_response() {
        let manager = RequestManager::new();
        assert!(!manager.handle_response(Uuid::new_v4(), ResponseBody::Unavailable("x".into())));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let manager = RequestManager::new();

        let request_task = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .send_request(
                        RequestBody::Chunk { hash: [1; 32] },
                        |_, _| async { Ok(()) },
                        Duration::from_secs(10),
                    )
                    .await
            })
        };

        while manager.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        manager.cancel_all();

        let result = request_task.await.unwrap();
        assert_matches!(result, Err(SyncError::Closed));
        assert_eq!(manager.pending_count(), 0);
    }
}

//! Shared helpers for the integration tests: folders on temp dirs joined by
//! in-memory sessions.

#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lvlt::bandwidth::BandwidthLimiter;
use lvlt::config::FolderConfig;
use lvlt::scheduler::{SchedulerConfig, TransferScheduler};
use lvlt::session::{self, SessionConfig, SessionHandle, SessionParams};
use lvlt::{Folder, Secret};

pub async fn open_folder(root: &Path, secret: Secret) -> Arc<Folder> {
    Folder::open(
        FolderConfig::new(secret, root.to_path_buf()),
        Arc::new(TransferScheduler::new(SchedulerConfig::default())),
    )
    .await
    .unwrap()
}

fn params(folder: &Folder) -> SessionParams {
    SessionParams {
        secret: folder.secret().clone(),
        node_id: rand::random(),
        listen_port: None,
        remote_addr: None,
        config: SessionConfig::default(),
        limiter: Arc::new(BandwidthLimiter::unlimited()),
    }
}

/// Join two folders with a session over an in-memory pipe.
pub async fn connect(a: &Arc<Folder>, b: &Arc<Folder>) -> (SessionHandle, SessionHandle) {
    let (left, right) = tokio::io::duplex(1 << 20);
    let (lr, lw) = tokio::io::split(left);
    let (rr, rw) = tokio::io::split(right);
    let (ra, rb) = tokio::join!(
        session::start(lr, lw, params(a), None, a.clone()),
        session::start(rr, rw, params(b), None, b.clone()),
    );
    let (ha, _) = ra.unwrap();
    let (hb, _) = rb.unwrap();
    a.attach(ha.clone());
    b.attach(hb.clone());
    (ha, hb)
}

/// Poll `check` until it holds, failing the test after ten seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub fn read(root: &Path, rel: &str) -> Option<Vec<u8>> {
    std::fs::read(root.join(rel)).ok()
}

//! # File Change Debouncing
//!
//! Editors and copy tools produce bursts of events for a single logical
//! change. The debouncer merges events per relative path and releases a path
//! only after it has been quiet for `debounce_delay` (or has been pending
//! longer than `max_event_age`), delivering released paths in batches over a
//! channel.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Types of file change events for debouncing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileChangeType {
    Created,
    Modified,
    Removed,
}

/// A debounced change to one folder-relative path
#[derive(Debug, Clone)]
pub struct DebouncedFileEvent {
    pub path: String,
    pub change_type: FileChangeType,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub event_count: u32,
}

impl DebouncedFileEvent {
    fn new(path: String, change_type: FileChangeType) -> Self {
        let now = Instant::now();
        Self {
            path,
            change_type,
            first_seen: now,
            last_seen: now,
            event_count: 1,
        }
    }

    fn update(&mut self, change_type: FileChangeType) {
        self.last_seen = Instant::now();
        self.event_count += 1;
        self.change_type = change_type;
    }

    fn should_process(&self, config: &DebouncerConfig) -> bool {
        self.last_seen.elapsed() >= config.debounce_delay || self.first_seen.elapsed() > config.max_event_age
    }
}

#[derive(Debug, Clone, Default)]
pub struct DebounceStats {
    pub events_received: u64,
    pub events_processed: u64,
    /// Events merged into an already pending one
    pub events_debounced: u64,
    pub batches_delivered: u64,
    pub current_pending_events: usize,
}

#[derive(Debug, Clone)]
pub struct DebouncerConfig {
    /// How long a path must stay quiet before it is released
    pub debounce_delay: Duration,
    /// Pending paths beyond this force an immediate flush
    pub max_pending_events: usize,
    /// How often to check for quiet paths
    pub cleanup_interval: Duration,
    /// Maximum time a path can remain pending under continuous churn
    pub max_event_age: Duration,
}

impl Default for DebouncerConfig {
    fn default() -> Self {
        Self {
            debounce_delay: Duration::from_millis(100),
            max_pending_events: 1000,
            cleanup_interval: Duration::from_millis(50),
            max_event_age: Duration::from_secs(5),
        }
    }
}

pub struct FileChangeDebouncer {
    config: DebouncerConfig,
    pending_events: Arc<RwLock<HashMap<String, DebouncedFileEvent>>>,
    stats: Arc<RwLock<DebounceStats>>,
    output: mpsc::Sender<Vec<DebouncedFileEvent>>,
    shutdown: watch::Sender<bool>,
}

impl FileChangeDebouncer {
    /// Start the debouncer; released batches are sent to `output`.
    /// Must be called inside a tokio runtime.
    pub fn start(config: DebouncerConfig, output: mpsc::Sender<Vec<DebouncedFileEvent>>) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let debouncer = Self {
            config: config.clone(),
            pending_events: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(DebounceStats::default())),
            output: output.clone(),
            shutdown,
        };

        let pending_events = debouncer.pending_events.clone();
        let stats = debouncer.stats.clone();
        tokio::spawn(async move {
            let mut cleanup_interval = interval(config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = cleanup_interval.tick() => {
                        let expired = take_events(&pending_events, |e| e.should_process(&config));
                        if !expired.is_empty() && deliver(&output, &stats, expired).await.is_err() {
                            debug!("Debouncer output closed");
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        debug!("File change debouncer started with {:?} delay", debouncer.config.debounce_delay);
        debouncer
    }

    pub async fn handle_event(&self, path: &str, change_type: FileChangeType) -> Result<()> {
        self.stats.write().events_received += 1;

        let overflowing = {
            let mut pending = self.pending_events.write();
            match pending.get_mut(path) {
                Some(existing) => {
                    existing.update(change_type);
                    self.stats.write().events_debounced += 1;
                }
                None => {
                    pending.insert(path.to_string(), DebouncedFileEvent::new(path.to_string(), change_type));
                }
            }
            pending.len() >= self.config.max_pending_events
        };

        if overflowing {
            warn!("Max pending events reached ({}), forcing processing", self.config.max_pending_events);
            self.force_process_all().await?;
        }
        Ok(())
    }

    /// Release every pending path now.
    pub async fn force_process_all(&self) -> Result<()> {
        let events = take_events(&self.pending_events, |_| true);
        if !events.is_empty() {
            deliver(&self.output, &self.stats, events).await?;
        }
        Ok(())
    }

    pub fn get_stats(&self) -> DebounceStats {
        DebounceStats {
            current_pending_events: self.pending_events.read().len(),
            ..self.stats.read().clone()
        }
    }

    /// Stop the background task and flush what is still pending.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        self.force_process_all().await?;
        info!("File change debouncer stopped. Stats: {:?}", self.get_stats());
        Ok(())
    }
}

fn take_events(
    pending_events: &RwLock<HashMap<String, DebouncedFileEvent>>,
    ready: impl Fn(&DebouncedFileEvent) -> bool,
) -> Vec<DebouncedFileEvent> {
    let mut pending = pending_events.write();
    let paths: Vec<String> = pending.values().filter(|e| ready(e)).map(|e| e.path.clone()).collect();
    let mut events: Vec<DebouncedFileEvent> = paths.iter().filter_map(|p| pending.remove(p)).collect();
    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}

async fn deliver(
    output: &mpsc::Sender<Vec<DebouncedFileEvent>>,
    stats: &RwLock<DebounceStats>,
    events: Vec<DebouncedFileEvent>,
) -> Result<()> {
    let count = events.len() as u64;
    output
        .send(events)
        .await
        .map_err(|_| anyhow::anyhow!("debounced event receiver dropped"))?;
    let mut stats = stats.write();
    stats.events_processed += count;
    stats.batches_delivered += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    fn fast_config() -> DebouncerConfig {
        DebouncerConfig {
            debounce_delay: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_rapid_events_are_merged() {
        let (tx, mut rx) = mpsc::channel(16);
        let debouncer = FileChangeDebouncer::start(fast_config(), tx);

        for _ in 0..5 {
            debouncer.handle_event("a.txt", FileChangeType::Modified).await.unwrap();
        }
        debouncer.handle_event("a.txt", FileChangeType::Removed).await.unwrap();

        let batch = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path, "a.txt");
        assert_eq!(batch[0].change_type, FileChangeType::Removed);
        assert_eq!(batch[0].event_count, 6);

        let stats = debouncer.get_stats();
        assert_eq!(stats.events_received, 6);
        assert_eq!(stats.events_debounced, 5);
        assert_eq!(stats.events_processed, 1);
    }

    #[tokio::test]
    async fn test_paths_held_until_quiet() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = DebouncerConfig {
            debounce_delay: Duration::from_millis(200),
            cleanup_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let debouncer = FileChangeDebouncer::start(config, tx);

        debouncer.handle_event("b.txt", FileChangeType::Created).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(debouncer.get_stats().current_pending_events, 1);

        let batch = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(batch[0].path, "b.txt");
    }

    #[tokio::test]
    async fn test_force_process_and_overflow() {
        let (tx, mut rx) = mpsc::channel(16);
        let config = DebouncerConfig {
            debounce_delay: Duration::from_secs(60),
            max_pending_events: 3,
            ..Default::default()
        };
        let debouncer = FileChangeDebouncer::start(config, tx);

        debouncer.handle_event("1", FileChangeType::Created).await.unwrap();
        debouncer.handle_event("2", FileChangeType::Created).await.unwrap();
        debouncer.handle_event("3", FileChangeType::Created).await.unwrap();

        let batch = rx.recv().await.unwrap();
        let paths: Vec<_> = batch.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["1", "2", "3"]);

        debouncer.handle_event("4", FileChangeType::Modified).await.unwrap();
        debouncer.shutdown().await.unwrap();
        assert_eq!(rx.recv().await.unwrap()[0].path, "4");
    }
}

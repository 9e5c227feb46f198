//! # Bandwidth Accounting and Limits
//!
//! - **Token bucket**: smooth rate limiting with short bursts, shared by all
//!   sessions of the process when upload/download limits are configured.
//! - **Throughput counters**: per-peer byte totals and rates over a sliding
//!   window, kept twice: once for all traffic and once for chunk payloads
//!   only, so the shell can show both.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Token bucket rate limiter for bandwidth throttling
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: RwLock<f64>,
    refill_rate: f64, // tokens per second
    last_refill: RwLock<Instant>,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let capacity = rate_bytes_per_sec.max(1024); // Minimum 1KB burst
        Self {
            capacity,
            tokens: RwLock::new(capacity as f64),
            refill_rate: rate_bytes_per_sec.max(1) as f64,
            last_refill: RwLock::new(Instant::now()),
        }
    }

    /// Take tokens for `bytes`, waiting until they are available.
    pub async fn consume(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        // Requests larger than the bucket drain it fully and wait for the remainder.
        let mut remaining = bytes as f64;

        loop {
            self.refill();

            {
                let mut tokens = self.tokens.write();
                let take = tokens.min(remaining);
                *tokens -= take;
                remaining -= take;
                if remaining <= 0.0 {
                    return;
                }
            }

            let wait_time = Duration::from_secs_f64(remaining / self.refill_rate);
            debug!("Waiting {:?} for {} bytes bandwidth quota", wait_time, bytes);
            sleep(wait_time.min(Duration::from_millis(100))).await;
        }
    }

    fn refill(&self) {
        let now = Instant::now();
        let mut last_refill = self.last_refill.write();
        let elapsed = now.duration_since(*last_refill);

        if elapsed >= Duration::from_millis(10) {
            let new_tokens = elapsed.as_secs_f64() * self.refill_rate;
            let mut tokens = self.tokens.write();
            *tokens = (*tokens + new_tokens).min(self.capacity as f64);
            *last_refill = now;
        }
    }

    pub fn available_tokens(&self) -> u64 {
        self.refill();
        *self.tokens.read() as u64
    }
}

/// Optional process-wide upload and download limits.
#[derive(Debug, Default)]
pub struct BandwidthLimiter {
    upload: Option<TokenBucket>,
    download: Option<TokenBucket>,
}

impl BandwidthLimiter {
    /// Limits in bytes per second; `None` or `0` disables that direction.
    pub fn new(upload_limit: Option<u64>, download_limit: Option<u64>) -> Self {
        let bucket = |limit: Option<u64>| limit.filter(|l| *l > 0).map(TokenBucket::new);
        let limiter = Self {
            upload: bucket(upload_limit),
            download: bucket(download_limit),
        };
        if limiter.upload.is_some() || limiter.download.is_some() {
            info!(
                "Bandwidth limits: up={:?} down={:?} bytes/sec",
                upload_limit, download_limit
            );
        }
        limiter
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub async fn request_upload_quota(&self, bytes: u64) {
        if let Some(bucket) = &self.upload {
            bucket.consume(bytes).await;
        }
    }

    pub async fn request_download_quota(&self, bytes: u64) {
        if let Some(bucket) = &self.download {
            bucket.consume(bytes).await;
        }
    }

    pub fn upload_available(&self) -> u64 {
        self.upload.as_ref().map(|b| b.available_tokens()).unwrap_or(u64::MAX)
    }

    pub fn download_available(&self) -> u64 {
        self.download.as_ref().map(|b| b.available_tokens()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BandwidthStats {
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub upload_rate: f64, // bytes per second over the rate window
    pub download_rate: f64,
}

/// Byte totals and recent rates for one direction pair.
#[derive(Debug, Default)]
pub struct ThroughputCounter {
    inner: RwLock<CounterState>,
}

#[derive(Debug, Default)]
struct CounterState {
    bytes_uploaded: u64,
    bytes_downloaded: u64,
    window: Vec<(Instant, u64, bool)>, // (time, bytes, is_upload)
}

impl ThroughputCounter {
    pub fn record(&self, bytes: u64, is_upload: bool) {
        let now = Instant::now();
        let mut state = self.inner.write();
        if is_upload {
            state.bytes_uploaded += bytes;
        } else {
            state.bytes_downloaded += bytes;
        }
        state.window.push((now, bytes, is_upload));
        prune(&mut state.window, now);
    }

    pub fn stats(&self) -> BandwidthStats {
        let now = Instant::now();
        let mut state = self.inner.write();
        prune(&mut state.window, now);

        let (up, down) = state.window.iter().fold((0u64, 0u64), |(up, down), (_, bytes, is_upload)| {
            if *is_upload {
                (up + bytes, down)
            } else {
                (up, down + bytes)
            }
        });
        let window = RATE_WINDOW.as_secs_f64();
        BandwidthStats {
            bytes_uploaded: state.bytes_uploaded,
            bytes_downloaded: state.bytes_downloaded,
            upload_rate: up as f64 / window,
            download_rate: down as f64 / window,
        }
    }
}

fn prune(window: &mut Vec<(Instant, u64, bool)>, now: Instant) {
    if let Some(cutoff) = now.checked_sub(RATE_WINDOW) {
        window.retain(|(time, _, _)| *time > cutoff);
    }
}

/// Per-peer traffic: every frame, and chunk payloads on their own.
#[derive(Debug, Default)]
pub struct PeerTraffic {
    pub all: ThroughputCounter,
    pub chunks: ThroughputCounter,
}

impl PeerTraffic {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            all: self.all.stats(),
            chunks: self.chunks.stats(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub all: BandwidthStats,
    pub chunks: BandwidthStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_bucket_basic() {
        let bucket = TokenBucket::new(1000); // 1000 bytes/sec, 1024 burst

        bucket.consume(1024).await;

        let start = Instant::now();
        bucket.consume(500).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed <= Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_token_bucket_oversized_request_completes() {
        let bucket = TokenBucket::new(100_000);
        let start = Instant::now();
        bucket.consume(150_000).await;
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unlimited_bandwidth() {
        let limiter = BandwidthLimiter::new(None, Some(0));

        let start = Instant::now();
        limiter.request_upload_quota(1_000_000).await;
        limiter.request_download_quota(1_000_000).await;

        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(limiter.upload_available(), u64::MAX);
        assert_eq!(limiter.download_available(), u64::MAX);
    }

    #[test]
    fn test_limiter_configuration() {
        let limiter = BandwidthLimiter::new(Some(1000), None);
        assert!(limiter.upload_available() <= 1024);
        assert_eq!(limiter.download_available(), u64::MAX);
    }

    #[test]
    fn test_peer_traffic_separates_chunks() {
        let traffic = PeerTraffic::new();
        traffic.all.record(100, true);
        traffic.all.record(70_000, false);
        traffic.chunks.record(65_536, false);

        let snapshot = traffic.snapshot();
        assert_eq!(snapshot.all.bytes_uploaded, 100);
        assert_eq!(snapshot.all.bytes_downloaded, 70_000);
        assert_eq!(snapshot.chunks.bytes_uploaded, 0);
        assert_eq!(snapshot.chunks.bytes_downloaded, 65_536);
        assert!(snapshot.chunks.download_rate > 0.0);
    }
}

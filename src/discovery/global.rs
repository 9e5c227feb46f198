//! Global discovery through an HTTP rendezvous service.
//!
//! For every shared folder the node posts `{folder_id, node_id, port}` to
//! `{url}/announce`; the service records the public address it saw the
//! request from and answers with the other nodes registered for the folder.
//!
//! In fallback mode (the default) a folder is only announced while neither
//! DHT nor local discovery has produced a candidate for it in the last two
//! announce intervals.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

use super::{Announcement, CandidateSink, DiscoveryChannel, DiscoveryKind};
use crate::secret::FolderId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub folder_id: FolderId,
    pub node_id: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendezvousPeer {
    pub addr: SocketAddr,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnounceResponse {
    #[serde(default)]
    pub peers: Vec<RendezvousPeer>,
}

pub struct GlobalDiscovery {
    client: Client,
    url: String,
    interval: Duration,
    fallback_only: bool,
}

impl GlobalDiscovery {
    pub fn new(url: &str, interval: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("lvlt/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            interval,
            fallback_only: true,
        })
    }

    /// Announce every folder, not only the ones the other channels miss.
    pub fn fallback_only(mut self, enabled: bool) -> Self {
        self.fallback_only = enabled;
        self
    }

    /// Register one folder and return the peers the service knows for it.
    pub async fn announce(&self, request: &AnnounceRequest) -> anyhow::Result<Vec<RendezvousPeer>> {
        let response = self
            .client
            .post(format!("{}/announce", self.url))
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        let body: AnnounceResponse = response.json().await?;
        Ok(body
            .peers
            .into_iter()
            .filter(|peer| peer.node_id.as_deref() != Some(request.node_id.as_str()))
            .collect())
    }

    async fn announce_all(&self, announcement: &Announcement, sink: &CandidateSink) -> anyhow::Result<()> {
        let node_id = hex::encode(announcement.node_id());
        for folder_id in announcement.folders() {
            if self.fallback_only && sink.found_elsewhere(&folder_id, self.interval * 2) {
                debug!("Folder {} has nearby peers, skipping rendezvous", folder_id.short());
                continue;
            }
            let request = AnnounceRequest {
                folder_id,
                node_id: node_id.clone(),
                port: announcement.listen_port(),
            };
            let peers = self.announce(&request).await?;
            debug!("Rendezvous returned {} peers for folder {}", peers.len(), folder_id.short());
            for peer in peers {
                sink.emit(peer.addr, folder_id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryChannel for GlobalDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Global
    }

    async fn run(
        &self,
        announcement: Arc<Announcement>,
        sink: CandidateSink,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        info!("Global discovery announcing to {}", self.url);
        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.announce_all(&announcement, &sink).await?,
                _ = announcement.changed() => self.announce_all(&announcement, &sink).await?,
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    fn detail(&self) -> Option<String> {
        Some(self.url.clone())
    }
}

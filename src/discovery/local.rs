//! Local network discovery over UDP broadcast.
//!
//! Every node periodically broadcasts a small JSON announcement with its node
//! id, listening port and the folders it shares. A node hearing an
//! announcement for a folder it also shares emits a candidate and answers
//! with a unicast reply, so two nodes on the same LAN find each other within
//! one round trip rather than one announce interval.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::{Announcement, CandidateSink, DiscoveryChannel, DiscoveryKind};
use crate::secret::FolderId;

const MAX_DATAGRAM: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAnnounce {
    pub node_id: String,
    pub port: u16,
    pub folders: Vec<FolderId>,
    /// Set on unicast answers; replies are never answered.
    #[serde(default)]
    pub reply: bool,
}

pub struct LocalDiscovery {
    bind: SocketAddr,
    targets: Vec<SocketAddr>,
    interval: Duration,
}

impl LocalDiscovery {
    pub fn new(bind: SocketAddr, targets: Vec<SocketAddr>, interval: Duration) -> Self {
        Self { bind, targets, interval }
    }

    /// Listen on `port` on all interfaces and broadcast to the same port.
    pub fn broadcast(port: u16, interval: Duration) -> Self {
        Self::new(
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            vec![SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port))],
            interval,
        )
    }

    fn message(announcement: &Announcement, reply: bool) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&LocalAnnounce {
            node_id: hex::encode(announcement.node_id()),
            port: announcement.listen_port(),
            folders: announcement.folders(),
            reply,
        })?)
    }

    async fn announce(&self, socket: &UdpSocket, announcement: &Announcement) -> anyhow::Result<()> {
        if announcement.folders().is_empty() {
            return Ok(());
        }
        let data = Self::message(announcement, false)?;
        for target in &self.targets {
            match socket.send_to(&data, target).await {
                Ok(_) => debug!("Sent local announce to {}", target),
                Err(e) => warn!("Failed to send local announce to {}: {}", target, e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryChannel for LocalDiscovery {
    fn kind(&self) -> DiscoveryKind {
        DiscoveryKind::Local
    }

    async fn run(
        &self,
        announcement: Arc<Announcement>,
        sink: CandidateSink,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(self.bind).await?;
        socket.set_broadcast(true)?;
        info!("Local discovery listening on {}", socket.local_addr()?);

        let own_id = hex::encode(announcement.node_id());
        let mut ticker = interval(self.interval);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut answered: HashSet<(String, SocketAddr)> = HashSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => self.announce(&socket, &announcement).await?,
                _ = announcement.changed() => {
                    answered.clear();
                    self.announce(&socket, &announcement).await?;
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            debug!("Local discovery receive error: {}", e);
                            continue;
                        }
                    };
                    let message: LocalAnnounce = match serde_json::from_slice(&buf[..len]) {
                        Ok(message) => message,
                        Err(e) => {
                            debug!("Ignoring malformed local announce from {}: {}", from, e);
                            continue;
                        }
                    };
                    if message.node_id == own_id {
                        continue;
                    }

                    let peer = SocketAddr::new(from.ip(), message.port);
                    let mut shared = false;
                    for folder in message.folders.iter().filter(|f| announcement.has_folder(f)) {
                        sink.emit(peer, *folder);
                        shared = true;
                    }
                    if shared && !message.reply && answered.insert((message.node_id.clone(), from)) {
                        let data = Self::message(&announcement, true)?;
                        if let Err(e) = socket.send_to(&data, from).await {
                            debug!("Failed to answer local announce from {}: {}", from, e);
                        }
                    }
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

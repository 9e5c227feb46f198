//! # Port Mapping
//!
//! Asks the LAN gateway to forward the QUIC port so peers outside the NAT
//! can dial in. [`UpnpGateway`] speaks UPnP IGD through `igd-next`; the
//! [`PortMapper`] task keeps the lease alive, follows listen port changes
//! and removes the mapping when it stops.

use async_trait::async_trait;
use igd_next::aio::tokio::search_gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_LEASE: Duration = Duration::from_secs(3600);
const RETRY_INTERVAL: Duration = Duration::from_secs(300);
const SEARCH_TIMEOUT: Duration = Duration::from_secs(5);
const DESCRIPTION: &str = "lvlt";

/// What `status` shows about the mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapStatus {
    pub enabled: bool,
    /// Address peers outside the NAT can reach us on.
    pub external: Option<SocketAddr>,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Forward UDP `port` on the gateway to the same port here; returns the public address.
    async fn map(&self, port: u16, lease: Duration) -> anyhow::Result<SocketAddr>;

    async fn unmap(&self, port: u16) -> anyhow::Result<()>;
}

/// A UPnP Internet Gateway Device found by SSDP search on every call.
#[derive(Debug, Default)]
pub struct UpnpGateway;

#[async_trait]
impl Gateway for UpnpGateway {
    async fn map(&self, port: u16, lease: Duration) -> anyhow::Result<SocketAddr> {
        let gateway = search_gateway(SearchOptions {
            timeout: Some(SEARCH_TIMEOUT),
            ..Default::default()
        })
        .await?;

        // The interface that routes to the gateway is the one it must forward to.
        let route = UdpSocket::bind("0.0.0.0:0").await?;
        route.connect(gateway.addr).await?;
        let local = SocketAddr::new(route.local_addr()?.ip(), port);

        let lease_secs = u32::try_from(lease.as_secs()).unwrap_or(u32::MAX);
        gateway
            .add_port(PortMappingProtocol::UDP, port, local, lease_secs, DESCRIPTION)
            .await?;
        let external_ip = gateway.get_external_ip().await?;
        Ok(SocketAddr::new(external_ip, port))
    }

    async fn unmap(&self, port: u16) -> anyhow::Result<()> {
        let gateway = search_gateway(SearchOptions {
            timeout: Some(SEARCH_TIMEOUT),
            ..Default::default()
        })
        .await?;
        gateway.remove_port(PortMappingProtocol::UDP, port).await?;
        Ok(())
    }
}

struct Running {
    port: watch::Sender<u16>,
    task: JoinHandle<()>,
}

pub struct PortMapper {
    gateway: Arc<dyn Gateway>,
    lease: Duration,
    retry: Duration,
    status: Arc<Mutex<PortMapStatus>>,
    running: Mutex<Option<Running>>,
}

impl PortMapper {
    pub fn new(gateway: Arc<dyn Gateway>, lease: Duration) -> Self {
        Self {
            gateway,
            lease: lease.max(Duration::from_secs(2)),
            retry: RETRY_INTERVAL,
            status: Arc::new(Mutex::new(PortMapStatus::default())),
            running: Mutex::new(None),
        }
    }

    pub fn upnp() -> Self {
        Self::new(Arc::new(UpnpGateway), DEFAULT_LEASE)
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start mapping `port`. Does nothing when already running.
    pub fn start(&self, port: u16) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        let (port_tx, port_rx) = watch::channel(port);
        self.status.lock().enabled = true;
        let task = tokio::spawn(maintain(
            self.gateway.clone(),
            self.lease,
            self.retry,
            port_rx,
            self.status.clone(),
        ));
        *running = Some(Running { port: port_tx, task });
    }

    /// Move the mapping to a new listen port.
    pub fn set_port(&self, port: u16) {
        if let Some(running) = self.running.lock().as_ref() {
            running.port.send_replace(port);
        }
    }

    /// Stop renewing and remove the current mapping from the gateway.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else { return };
        running.task.abort();
        let mapped = {
            let mut status = self.status.lock();
            status.enabled = false;
            status.last_error = None;
            status.external.take()
        };
        if let Some(external) = mapped {
            match self.gateway.unmap(external.port()).await {
                Ok(()) => info!("Removed port mapping {}", external),
                Err(e) => debug!("Failed to remove port mapping {}: {:#}", external, e),
            }
        }
    }

    pub fn status(&self) -> PortMapStatus {
        self.status.lock().clone()
    }
}

async fn maintain(
    gateway: Arc<dyn Gateway>,
    lease: Duration,
    retry: Duration,
    mut port_rx: watch::Receiver<u16>,
    status: Arc<Mutex<PortMapStatus>>,
) {
    loop {
        let port = *port_rx.borrow_and_update();
        let stale = status.lock().external.filter(|external| external.port() != port);
        if let Some(stale) = stale {
            if let Err(e) = gateway.unmap(stale.port()).await {
                debug!("Failed to remove port mapping {}: {:#}", stale, e);
            }
            status.lock().external = None;
        }

        let wait = match gateway.map(port, lease).await {
            Ok(external) => {
                let mut status = status.lock();
                if status.external != Some(external) {
                    info!("Gateway forwards {} to port {}", external, port);
                }
                status.external = Some(external);
                status.last_error = None;
                lease / 2
            }
            Err(e) => {
                warn!("Port mapping for {} failed: {:#}", port, e);
                let mut status = status.lock();
                status.external = None;
                status.last_error = Some(e.to_string());
                retry
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = port_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

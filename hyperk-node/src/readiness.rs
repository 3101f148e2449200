//! Network readiness polling for freshly started guests.
//!
//! Two phases share one fixed interval: wait for a DHCP lease, then wait for
//! the management port on the leased address to accept a TCP connection.
//! Both phases wait forever unless a deadline is configured, and both stop
//! as soon as the job is cancelled.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use hyperk_hypervisor::Hypervisor;

use crate::error::{OrchestratorError, Result};
use crate::jobs::CancelToken;

/// Single reachability check of a guest port.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Whether `addr` accepted a connection.
    async fn probe(&self, addr: SocketAddr) -> bool;
}

/// Plain TCP connect with a per-attempt timeout.
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl PortProbe for TcpProbe {
    async fn probe(&self, addr: SocketAddr) -> bool {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "Port not reachable yet");
                false
            }
            Err(_) => {
                debug!(addr = %addr, "Connect attempt timed out");
                false
            }
        }
    }
}

/// Waits until a domain has an address and an open management port.
pub struct ReadinessPoller {
    hypervisor: Arc<dyn Hypervisor>,
    probe: Arc<dyn PortProbe>,
    interval: Duration,
    deadline: Option<Duration>,
    port: u16,
}

impl ReadinessPoller {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        probe: Arc<dyn PortProbe>,
        interval: Duration,
        port: u16,
    ) -> Self {
        Self {
            hypervisor,
            probe,
            interval,
            deadline: None,
            port,
        }
    }

    /// Give up after `deadline` with `ReadinessTimeout`.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Block until the domain is reachable; returns its address.
    #[instrument(skip(self, cancel), fields(vm_id = %id))]
    pub async fn wait_ready(&self, id: Uuid, cancel: &CancelToken) -> Result<IpAddr> {
        let started = Instant::now();

        let ip = self.wait_for_lease(id, cancel, started).await?;
        info!(ip = %ip, "Lease observed");

        let addr = SocketAddr::new(ip, self.port);
        self.wait_for_port(addr, cancel, started).await?;
        info!(addr = %addr, "Management port reachable");

        Ok(ip)
    }

    async fn wait_for_lease(&self, id: Uuid, cancel: &CancelToken, started: Instant) -> Result<IpAddr> {
        loop {
            cancel.check()?;
            let leases = self.hypervisor.lease_addresses(id).await?;
            if let Some(lease) = leases.first() {
                return Ok(lease.addr);
            }
            self.pause(cancel, started, "DHCP lease").await?;
        }
    }

    async fn wait_for_port(&self, addr: SocketAddr, cancel: &CancelToken, started: Instant) -> Result<()> {
        loop {
            cancel.check()?;
            if self.probe.probe(addr).await {
                return Ok(());
            }
            self.pause(cancel, started, "management port").await?;
        }
    }

    /// Sleep one interval, cut short by cancellation or the deadline.
    async fn pause(&self, cancel: &CancelToken, started: Instant, waiting_for: &str) -> Result<()> {
        let sleep_for = match self.deadline {
            Some(deadline) => {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    return Err(OrchestratorError::ReadinessTimeout(format!(
                        "{} after {}s",
                        waiting_for,
                        deadline.as_secs()
                    )));
                }
                self.interval.min(deadline - elapsed)
            }
            None => self.interval,
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => Ok(()),
            _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
        }
    }
}

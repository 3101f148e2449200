//! Core hypervisor abstraction trait.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::*;

/// Capabilities supported by a hypervisor backend.
#[derive(Debug, Clone)]
pub struct HypervisorCapabilities {
    /// Name of the hypervisor (e.g., "libvirt/QEMU", "mock")
    pub name: String,
    /// Version string
    pub version: String,
    /// Access mode of the connection
    pub mode: ConnectionMode,
}

/// Connection to a hypervisor daemon.
///
/// One value of this trait owns the process-wide connection. Everything else
/// borrows it (usually through an `Arc<dyn Hypervisor>`) and must never
/// reconnect or close it; only the shutdown path calls [`Hypervisor::close`].
///
/// Implementations must be safe for concurrent callers without extra locking
/// on the caller side.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Connection
    // =========================================================================

    /// URI this connection was opened with.
    fn uri(&self) -> &str;

    /// Access mode this connection was opened with.
    fn mode(&self) -> ConnectionMode;

    /// Get hypervisor capabilities.
    async fn capabilities(&self) -> Result<HypervisorCapabilities>;

    /// Check if the hypervisor connection is healthy.
    async fn health_check(&self) -> Result<bool>;

    /// Release the connection. Idempotent; later calls on the connection
    /// fail with `ConnectionFailed`.
    async fn close(&self) -> Result<()>;

    // =========================================================================
    // Lookup & definition
    // =========================================================================

    /// Look up a domain by name.
    async fn lookup_by_name(&self, name: &str) -> Result<DomainRef>;

    /// Look up a domain by UUID.
    async fn lookup_by_id(&self, id: Uuid) -> Result<DomainRef>;

    /// List all domains, active and inactive.
    async fn list_all(&self) -> Result<Vec<DomainRef>>;

    /// Register a persistent domain from an XML descriptor (does not start it).
    ///
    /// Fails with `PermissionDenied` on a read-only connection and with
    /// `InvalidDescriptor` when the hypervisor rejects the XML.
    async fn define_domain(&self, xml: &str) -> Result<DomainRef>;

    // =========================================================================
    // Raw state queries
    // =========================================================================

    /// Basic domain info: state, configured maximums, vCPU count.
    async fn domain_info(&self, id: Uuid) -> Result<DomainInfo>;

    /// Maximum vCPUs of a running domain.
    async fn max_vcpus(&self, id: Uuid) -> Result<u32>;

    /// Maximum memory (KiB) of a domain.
    async fn max_memory_kib(&self, id: Uuid) -> Result<u64>;

    /// Interface addresses sourced from the hypervisor's DHCP leases.
    ///
    /// An empty list is the normal state right after boot.
    async fn lease_addresses(&self, id: Uuid) -> Result<Vec<InterfaceAddress>>;

    /// Whether the domain has a managed-save image.
    async fn has_managed_save(&self, id: Uuid) -> Result<bool>;

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Boot a defined domain, restoring its managed-save image if present.
    async fn start(&self, id: Uuid) -> Result<()>;

    /// Force power-off (no guest shutdown).
    async fn destroy(&self, id: Uuid) -> Result<()>;

    /// Suspend a running domain and save its memory to disk.
    async fn managed_save(&self, id: Uuid) -> Result<()>;
}

//! Libvirt backend implementation.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::{Hypervisor, HypervisorCapabilities};
use crate::types::*;

/// Libvirt/QEMU hypervisor backend.
///
/// Owns the single process-wide libvirt connection. The handle sits behind a
/// lock only so that `close` can take it out; libvirt itself serializes
/// concurrent callers on one connection.
pub struct LibvirtBackend {
    uri: String,
    mode: ConnectionMode,
    connection: RwLock<Option<Connect>>,
}

impl LibvirtBackend {
    /// Connect to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn connect(uri: &str, mode: ConnectionMode) -> Result<Self> {
        info!(uri = %uri, ?mode, "Connecting to libvirt");

        let connection = match mode {
            ConnectionMode::ReadOnly => Connect::open_read_only(Some(uri)),
            ConnectionMode::ReadWrite => Connect::open(Some(uri)),
        }
        .map_err(|e| HypervisorError::ConnectionFailed(format!("{}: {}", uri, e)))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            mode,
            connection: RwLock::new(Some(connection)),
        })
    }

    /// Run `f` against the open connection.
    fn with_conn<T>(&self, f: impl FnOnce(&Connect) -> Result<T>) -> Result<T> {
        let guard = self.connection.read().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        let conn = guard.as_ref().ok_or_else(|| {
            HypervisorError::ConnectionFailed("Connection is closed".to_string())
        })?;
        f(conn)
    }

    /// Run `f` against a domain looked up by UUID.
    fn with_domain<T>(&self, id: Uuid, f: impl FnOnce(&Domain) -> Result<T>) -> Result<T> {
        self.with_conn(|conn| {
            let domain = Domain::lookup_by_uuid_string(conn, &id.to_string())
                .map_err(|e| HypervisorError::DomainNotFound(format!("{}: {}", id, e)))?;
            f(&domain)
        })
    }

    fn ensure_writable(&self, op: &str) -> Result<()> {
        if !self.mode.is_writable() {
            return Err(HypervisorError::PermissionDenied(
                format!("{} requires a read-write connection", op)
            ));
        }
        Ok(())
    }

    fn domain_ref(domain: &Domain) -> Result<DomainRef> {
        let uuid = domain.get_uuid_string()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        let id = Uuid::parse_str(&uuid)
            .map_err(|e| HypervisorError::Internal(format!("Invalid domain UUID {}: {}", uuid, e)))?;
        let name = domain.get_name()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        Ok(DomainRef { id, name })
    }

    /// Convert libvirt domain state to RawDomainState.
    fn state_from_libvirt(state: sys::virDomainState) -> RawDomainState {
        match state {
            sys::VIR_DOMAIN_RUNNING => RawDomainState::Running,
            sys::VIR_DOMAIN_BLOCKED => RawDomainState::Blocked,
            sys::VIR_DOMAIN_PAUSED => RawDomainState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => RawDomainState::Shutdown,
            sys::VIR_DOMAIN_SHUTOFF => RawDomainState::Shutoff,
            sys::VIR_DOMAIN_CRASHED => RawDomainState::Crashed,
            sys::VIR_DOMAIN_PMSUSPENDED => RawDomainState::PmSuspended,
            _ => RawDomainState::NoState,
        }
    }
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn mode(&self) -> ConnectionMode {
        self.mode
    }

    #[instrument(skip(self))]
    async fn capabilities(&self) -> Result<HypervisorCapabilities> {
        let version = self.with_conn(|conn| {
            conn.get_lib_version()
                .map_err(|e| HypervisorError::Internal(e.to_string()))
        })?;

        let major = version / 1000000;
        let minor = (version / 1000) % 1000;
        let micro = version % 1000;

        Ok(HypervisorCapabilities {
            name: "libvirt/QEMU".to_string(),
            version: format!("{}.{}.{}", major, minor, micro),
            mode: self.mode,
        })
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<bool> {
        match self.with_conn(|conn| conn.is_alive().map_err(|e| HypervisorError::Internal(e.to_string()))) {
            Ok(alive) => Ok(alive),
            Err(_) => Ok(false),
        }
    }

    #[instrument(skip(self))]
    async fn close(&self) -> Result<()> {
        let mut guard = self.connection.write().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;

        if let Some(mut conn) = guard.take() {
            if let Err(e) = conn.close() {
                warn!(error = %e, "Error closing libvirt connection");
            }
            info!(uri = %self.uri, "Libvirt connection closed");
        }
        Ok(())
    }

    async fn lookup_by_name(&self, name: &str) -> Result<DomainRef> {
        self.with_conn(|conn| {
            let domain = Domain::lookup_by_name(conn, name)
                .map_err(|e| HypervisorError::DomainNotFound(format!("{}: {}", name, e)))?;
            Self::domain_ref(&domain)
        })
    }

    async fn lookup_by_id(&self, id: Uuid) -> Result<DomainRef> {
        self.with_domain(id, Self::domain_ref)
    }

    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<DomainRef>> {
        self.with_conn(|conn| {
            let domains = conn.list_all_domains(0)
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;
            domains.iter().map(Self::domain_ref).collect()
        })
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<DomainRef> {
        self.ensure_writable("define")?;
        debug!(xml = %xml, "Defining domain");

        let domain_ref = self.with_conn(|conn| {
            let domain = Domain::define_xml(conn, xml)
                .map_err(|e| HypervisorError::InvalidDescriptor(e.to_string()))?;
            Self::domain_ref(&domain)
        })?;

        info!(vm_id = %domain_ref.id, vm_name = %domain_ref.name, "Domain defined");
        Ok(domain_ref)
    }

    async fn domain_info(&self, id: Uuid) -> Result<DomainInfo> {
        self.with_domain(id, |domain| {
            let info = domain.get_info()
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;
            Ok(DomainInfo {
                state: Self::state_from_libvirt(info.state),
                max_mem_kib: info.max_mem,
                memory_kib: info.memory,
                nr_virt_cpu: info.nr_virt_cpu,
                cpu_time_ns: info.cpu_time,
            })
        })
    }

    async fn max_vcpus(&self, id: Uuid) -> Result<u32> {
        self.with_domain(id, |domain| {
            domain.get_max_vcpus()
                .map(|n| n as u32)
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))
        })
    }

    async fn max_memory_kib(&self, id: Uuid) -> Result<u64> {
        self.with_domain(id, |domain| {
            domain.get_max_memory()
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))
        })
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    async fn lease_addresses(&self, id: Uuid) -> Result<Vec<InterfaceAddress>> {
        self.with_domain(id, |domain| {
            let interfaces = domain
                .interface_addresses(sys::VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

            let mut addresses = Vec::new();
            for iface in interfaces {
                for addr in iface.addrs {
                    match addr.addr.parse::<IpAddr>() {
                        Ok(ip) => addresses.push(InterfaceAddress {
                            interface: iface.name.clone(),
                            hwaddr: Some(iface.hwaddr.clone()).filter(|h| !h.is_empty()),
                            addr: ip,
                            prefix: addr.prefix,
                        }),
                        Err(_) => debug!(addr = %addr.addr, "Skipping unparseable lease address"),
                    }
                }
            }
            Ok(addresses)
        })
    }

    async fn has_managed_save(&self, id: Uuid) -> Result<bool> {
        self.with_domain(id, |domain| {
            domain.has_managed_save(0)
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))
        })
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    async fn start(&self, id: Uuid) -> Result<()> {
        self.ensure_writable("start")?;
        info!("Starting domain");

        self.with_domain(id, |domain| {
            domain.create()
                .map(|_| ())
                .map_err(|e| HypervisorError::OperationFailed(e.to_string()))
        })?;

        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    async fn destroy(&self, id: Uuid) -> Result<()> {
        self.ensure_writable("destroy")?;
        info!("Force stopping domain");

        self.with_domain(id, |domain| {
            domain.destroy()
                .map_err(|e| HypervisorError::OperationFailed(e.to_string()))
        })?;

        info!("Domain destroyed");
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    async fn managed_save(&self, id: Uuid) -> Result<()> {
        self.ensure_writable("managed-save")?;
        info!("Saving domain");

        self.with_domain(id, |domain| {
            domain.managed_save(0)
                .map(|_| ())
                .map_err(|e| HypervisorError::OperationFailed(e.to_string()))
        })?;

        info!("Domain saved");
        Ok(())
    }
}

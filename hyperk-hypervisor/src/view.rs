//! Normalized instance view derived from raw hypervisor state.
//!
//! Views are recomputed on every read and never cached or persisted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::traits::Hypervisor;
use crate::types::DomainRef;

/// User-facing power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Off,
    Paused,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Running => "running",
            PowerState::Off => "off",
            PowerState::Paused => "paused",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime status of a domain.
///
/// A running domain reports its live maximums and, once a DHCP lease has been
/// observed, its address. Stopped and paused domains report configured
/// maximums and never an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainStatus {
    Running {
        vcpu: u32,
        ram_kib: u64,
        ip: Option<IpAddr>,
    },
    Off {
        max_vcpu: u32,
        max_ram_kib: u64,
    },
    Paused {
        max_vcpu: u32,
        max_ram_kib: u64,
    },
}

impl DomainStatus {
    pub fn power_state(&self) -> PowerState {
        match self {
            DomainStatus::Running { .. } => PowerState::Running,
            DomainStatus::Off { .. } => PowerState::Off,
            DomainStatus::Paused { .. } => PowerState::Paused,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            DomainStatus::Running { ip, .. } => *ip,
            _ => None,
        }
    }

    pub fn vcpu(&self) -> u32 {
        match self {
            DomainStatus::Running { vcpu, .. } => *vcpu,
            DomainStatus::Off { max_vcpu, .. } | DomainStatus::Paused { max_vcpu, .. } => *max_vcpu,
        }
    }

    pub fn ram_kib(&self) -> u64 {
        match self {
            DomainStatus::Running { ram_kib, .. } => *ram_kib,
            DomainStatus::Off { max_ram_kib, .. } | DomainStatus::Paused { max_ram_kib, .. } => *max_ram_kib,
        }
    }
}

/// Snapshot of one instance as shown to users.
///
/// Serializes flat as `{id, name, ip, vcpu, ram, state}`; `ip` is an empty
/// string when unknown and `ram` is in KiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "InstanceViewWire")]
pub struct InstanceView {
    pub id: Uuid,
    pub name: String,
    pub status: DomainStatus,
}

impl InstanceView {
    /// Replace the domain name with the user-facing display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn state(&self) -> PowerState {
        self.status.power_state()
    }
}

/// Wire form of [`InstanceView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceViewWire {
    pub id: Uuid,
    pub name: String,
    pub ip: String,
    pub vcpu: u32,
    pub ram: u64,
    pub state: PowerState,
}

impl From<InstanceView> for InstanceViewWire {
    fn from(view: InstanceView) -> Self {
        Self {
            id: view.id,
            ip: view.status.ip().map(|ip| ip.to_string()).unwrap_or_default(),
            vcpu: view.status.vcpu(),
            ram: view.status.ram_kib(),
            state: view.status.power_state(),
            name: view.name,
        }
    }
}

/// Build the view of `domain` from live hypervisor queries.
///
/// A running domain without a lease yet gets `ip: None`; that is the normal
/// state right after boot. The paused state comes from the hypervisor's own
/// suspended state or managed-save flag.
#[instrument(skip(hv, domain), fields(vm_id = %domain.id, vm_name = %domain.name))]
pub async fn translate(hv: &dyn Hypervisor, domain: &DomainRef) -> Result<InstanceView> {
    let info = hv.domain_info(domain.id).await?;

    let status = if info.state.is_running() {
        let vcpu = hv.max_vcpus(domain.id).await?;
        let ram_kib = hv.max_memory_kib(domain.id).await?;
        let ip = hv.lease_addresses(domain.id).await?
            .into_iter()
            .next()
            .map(|lease| lease.addr);
        DomainStatus::Running { vcpu, ram_kib, ip }
    } else if info.state.is_suspended() || hv.has_managed_save(domain.id).await? {
        DomainStatus::Paused {
            max_vcpu: info.nr_virt_cpu,
            max_ram_kib: info.max_mem_kib,
        }
    } else {
        DomainStatus::Off {
            max_vcpu: info.nr_virt_cpu,
            max_ram_kib: info.max_mem_kib,
        }
    };

    debug!(raw_state = ?info.state, state = %status.power_state(), "Translated domain state");

    Ok(InstanceView {
        id: domain.id,
        name: domain.name.clone(),
        status,
    })
}

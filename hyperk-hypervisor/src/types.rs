//! Type definitions for domain handles, raw hypervisor state and sizing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{HypervisorError, Result};

// =============================================================================
// CONNECTION
// =============================================================================

/// Access mode of a hypervisor connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Lookups and queries only.
    ReadOnly,
    /// Required for domain definition and state transitions.
    ReadWrite,
}

impl ConnectionMode {
    pub fn is_writable(&self) -> bool {
        matches!(self, ConnectionMode::ReadWrite)
    }
}

impl Default for ConnectionMode {
    fn default() -> Self {
        Self::ReadWrite
    }
}

// =============================================================================
// DOMAINS
// =============================================================================

/// Handle to a domain known by the hypervisor.
///
/// The UUID is the stable identity; the name is what the domain was
/// defined with and may differ from the user-facing display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRef {
    pub id: Uuid,
    pub name: String,
}

/// Raw domain state as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RawDomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl RawDomainState {
    /// Whether the guest is executing (libvirt counts `Blocked` as running).
    pub fn is_running(&self) -> bool {
        matches!(self, RawDomainState::Running | RawDomainState::Blocked)
    }

    /// Whether the hypervisor reports the guest as suspended in memory.
    pub fn is_suspended(&self) -> bool {
        matches!(self, RawDomainState::Paused | RawDomainState::PmSuspended)
    }
}

/// Basic domain info (mirrors `virDomainInfo`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub state: RawDomainState,
    /// Configured maximum memory in KiB
    pub max_mem_kib: u64,
    /// Current memory in KiB
    pub memory_kib: u64,
    /// Number of configured vCPUs
    pub nr_virt_cpu: u32,
    /// CPU time consumed (nanoseconds)
    pub cpu_time_ns: u64,
}

/// An address observed on one of the domain's interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    /// Interface name on the host side (e.g. `vnet0`)
    pub interface: String,
    /// MAC address of the interface
    pub hwaddr: Option<String>,
    pub addr: IpAddr,
    pub prefix: u32,
}

// =============================================================================
// SIZING
// =============================================================================

/// Memory unit accepted in creation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RamUnit {
    KiB,
    MiB,
    GiB,
}

impl RamUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            RamUnit::KiB => "KiB",
            RamUnit::MiB => "MiB",
            RamUnit::GiB => "GiB",
        }
    }

    /// Number of KiB in one unit.
    pub fn kib_factor(&self) -> u64 {
        match self {
            RamUnit::KiB => 1,
            RamUnit::MiB => 1024,
            RamUnit::GiB => 1024 * 1024,
        }
    }

    /// Normalize `value` of this unit to KiB. `None` on overflow.
    pub fn to_kib(&self, value: u64) -> Option<u64> {
        value.checked_mul(self.kib_factor())
    }
}

impl fmt::Display for RamUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RamUnit {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "KiB" => Ok(RamUnit::KiB),
            "MiB" => Ok(RamUnit::MiB),
            "GiB" => Ok(RamUnit::GiB),
            other => Err(HypervisorError::InvalidConfig(
                format!("Unknown memory unit: {}", other)
            )),
        }
    }
}

/// Parse a memory quantity such as `"16GiB"` or `"512MiB"` into KiB.
pub fn parse_memory_kib(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| HypervisorError::InvalidConfig(
            format!("Memory quantity needs a unit (KiB, MiB, GiB): {}", s)
        ))?;

    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse()
        .map_err(|_| HypervisorError::InvalidConfig(format!("Invalid memory quantity: {}", s)))?;
    let unit: RamUnit = unit.trim().parse()?;

    unit.to_kib(value)
        .ok_or_else(|| HypervisorError::InvalidConfig(format!("Memory quantity overflows: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_unit_normalization() {
        assert_eq!(RamUnit::KiB.to_kib(512), Some(512));
        assert_eq!(RamUnit::MiB.to_kib(2), Some(2048));
        assert_eq!(RamUnit::GiB.to_kib(2), Some(2 * 1024 * 1024));
        assert_eq!(RamUnit::GiB.to_kib(u64::MAX), None);
    }

    #[test]
    fn test_ram_unit_parse() {
        assert_eq!("GiB".parse::<RamUnit>().unwrap(), RamUnit::GiB);
        assert!("gb".parse::<RamUnit>().is_err());
        assert_eq!(
            serde_json::from_str::<RamUnit>("\"MiB\"").unwrap(),
            RamUnit::MiB
        );
    }

    #[test]
    fn test_parse_memory_kib() {
        assert_eq!(parse_memory_kib("16GiB").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_memory_kib(" 512MiB ").unwrap(), 512 * 1024);
        assert!(parse_memory_kib("16").is_err());
        assert!(parse_memory_kib("GiB").is_err());
        assert!(parse_memory_kib("16TB").is_err());
    }

    #[test]
    fn test_raw_state_classification() {
        assert!(RawDomainState::Blocked.is_running());
        assert!(!RawDomainState::Paused.is_running());
        assert!(RawDomainState::PmSuspended.is_suspended());
        assert!(!RawDomainState::Shutoff.is_suspended());
    }
}

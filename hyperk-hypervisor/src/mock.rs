//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{HypervisorError, Result};
use crate::traits::{Hypervisor, HypervisorCapabilities};
use crate::types::*;
use crate::xml::summarize_descriptor;

/// URI scheme accepted by [`MockBackend::connect`].
pub const MOCK_URI_SCHEME: &str = "mock://";

/// Mock hypervisor backend for testing.
///
/// This backend simulates a libvirt connection in memory without requiring
/// an actual hypervisor. Useful for:
/// - Unit and integration testing
/// - Development without libvirt installed
///
/// Running domains get an address on `192.168.122.0/24` after a configurable
/// number of lease polls.
pub struct MockBackend {
    uri: String,
    mode: ConnectionMode,
    domains: RwLock<HashMap<Uuid, MockDomain>>,
    lease_delay: u32,
    next_host: AtomicU32,
    closed: AtomicBool,
    reject_definitions: AtomicBool,
    fail_starts: AtomicBool,
    mutations: AtomicUsize,
}

struct MockDomain {
    name: String,
    memory_kib: u64,
    vcpu: u32,
    mac: Option<String>,
    state: RawDomainState,
    managed_save: bool,
    ip: Ipv4Addr,
    polls_until_lease: u32,
    cpu_time_ns: u64,
}

impl MockBackend {
    /// Create a new read-write mock backend.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self::with_mode("mock:///default", ConnectionMode::ReadWrite)
    }

    /// Open a mock connection. Only `mock://` URIs are accepted.
    pub fn connect(uri: &str, mode: ConnectionMode) -> Result<Self> {
        if !uri.starts_with(MOCK_URI_SCHEME) {
            return Err(HypervisorError::ConnectionFailed(
                format!("Unsupported URI for mock backend: {}", uri)
            ));
        }
        info!(uri = %uri, ?mode, "Opening mock hypervisor connection");
        Ok(Self::with_mode(uri, mode))
    }

    fn with_mode(uri: &str, mode: ConnectionMode) -> Self {
        Self {
            uri: uri.to_string(),
            mode,
            domains: RwLock::new(HashMap::new()),
            lease_delay: 0,
            next_host: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            reject_definitions: AtomicBool::new(false),
            fail_starts: AtomicBool::new(false),
            mutations: AtomicUsize::new(0),
        }
    }

    /// Number of empty lease polls a freshly started domain returns before
    /// its address shows up.
    pub fn with_lease_delay(mut self, polls: u32) -> Self {
        self.lease_delay = polls;
        self
    }

    /// Make every subsequent `define_domain` fail with `InvalidDescriptor`.
    pub fn set_reject_definitions(&self, reject: bool) {
        self.reject_definitions.store(reject, Ordering::SeqCst);
    }

    /// Make every subsequent `start` fail with `OperationFailed`.
    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Force the raw state of a domain, bypassing transition rules.
    pub fn set_raw_state(&self, id: Uuid, state: RawDomainState) -> Result<()> {
        let mut domains = self.domains.write().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        let dom = domains.get_mut(&id)
            .ok_or_else(|| HypervisorError::DomainNotFound(id.to_string()))?;
        dom.state = state;
        Ok(())
    }

    /// Number of mutating calls (define, start, destroy, managed-save)
    /// received, including rejected ones.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of defined domains.
    pub fn domain_count(&self) -> usize {
        self.domains.read().map(|d| d.len()).unwrap_or(0)
    }

    /// MAC address a domain was defined with.
    pub fn mac_of(&self, id: Uuid) -> Option<String> {
        self.domains.read().ok()?.get(&id)?.mac.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(HypervisorError::ConnectionFailed(
                "Connection is closed".to_string()
            ));
        }
        Ok(())
    }

    fn ensure_writable(&self, op: &str) -> Result<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        if !self.mode.is_writable() {
            return Err(HypervisorError::PermissionDenied(
                format!("{} requires a read-write connection", op)
            ));
        }
        Ok(())
    }

    fn allocate_ip(&self) -> Ipv4Addr {
        let n = self.next_host.fetch_add(1, Ordering::SeqCst);
        Ipv4Addr::new(192, 168, 122, (10 + n % 240) as u8)
    }

    fn with_domain<T>(&self, id: Uuid, f: impl FnOnce(&MockDomain) -> Result<T>) -> Result<T> {
        self.ensure_open()?;
        let domains = self.domains.read().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        let dom = domains.get(&id)
            .ok_or_else(|| HypervisorError::DomainNotFound(id.to_string()))?;
        f(dom)
    }

    fn with_domain_mut<T>(&self, id: Uuid, f: impl FnOnce(&mut MockDomain) -> Result<T>) -> Result<T> {
        let mut domains = self.domains.write().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        let dom = domains.get_mut(&id)
            .ok_or_else(|| HypervisorError::DomainNotFound(id.to_string()))?;
        f(dom)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn mode(&self) -> ConnectionMode {
        self.mode
    }

    async fn capabilities(&self) -> Result<HypervisorCapabilities> {
        self.ensure_open()?;
        Ok(HypervisorCapabilities {
            name: "mock".to_string(),
            version: "1.0.0".to_string(),
            mode: self.mode,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(!self.is_closed())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(uri = %self.uri, "Mock hypervisor connection closed");
        }
        Ok(())
    }

    async fn lookup_by_name(&self, name: &str) -> Result<DomainRef> {
        self.ensure_open()?;
        let domains = self.domains.read().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        domains.iter()
            .find(|(_, d)| d.name == name)
            .map(|(id, d)| DomainRef { id: *id, name: d.name.clone() })
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))
    }

    async fn lookup_by_id(&self, id: Uuid) -> Result<DomainRef> {
        self.with_domain(id, |d| Ok(DomainRef { id, name: d.name.clone() }))
    }

    async fn list_all(&self) -> Result<Vec<DomainRef>> {
        self.ensure_open()?;
        let domains = self.domains.read().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        let mut refs: Vec<DomainRef> = domains.iter()
            .map(|(id, d)| DomainRef { id: *id, name: d.name.clone() })
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<DomainRef> {
        self.ensure_writable("define")?;

        if self.reject_definitions.load(Ordering::SeqCst) {
            return Err(HypervisorError::InvalidDescriptor(
                "Definition rejected by mock hypervisor".to_string()
            ));
        }

        let summary = summarize_descriptor(xml)?;

        let mut domains = self.domains.write().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;

        if domains.values().any(|d| d.name == summary.name) {
            return Err(HypervisorError::InvalidDescriptor(
                format!("domain '{}' already exists", summary.name)
            ));
        }

        let id = Uuid::new_v4();
        domains.insert(id, MockDomain {
            name: summary.name.clone(),
            memory_kib: summary.memory_kib,
            vcpu: summary.vcpu,
            mac: summary.mac,
            state: RawDomainState::Shutoff,
            managed_save: false,
            ip: self.allocate_ip(),
            polls_until_lease: 0,
            cpu_time_ns: 0,
        });

        info!(vm_id = %id, vm_name = %summary.name, "Mock domain defined");
        Ok(DomainRef { id, name: summary.name })
    }

    async fn domain_info(&self, id: Uuid) -> Result<DomainInfo> {
        self.with_domain(id, |d| Ok(DomainInfo {
            state: d.state,
            max_mem_kib: d.memory_kib,
            memory_kib: if d.state.is_running() { d.memory_kib } else { 0 },
            nr_virt_cpu: d.vcpu,
            cpu_time_ns: d.cpu_time_ns,
        }))
    }

    async fn max_vcpus(&self, id: Uuid) -> Result<u32> {
        self.with_domain(id, |d| {
            // libvirt only answers this for active domains
            if !d.state.is_running() {
                return Err(HypervisorError::QueryFailed(
                    "domain is not running".to_string()
                ));
            }
            Ok(d.vcpu)
        })
    }

    async fn max_memory_kib(&self, id: Uuid) -> Result<u64> {
        self.with_domain(id, |d| Ok(d.memory_kib))
    }

    async fn lease_addresses(&self, id: Uuid) -> Result<Vec<InterfaceAddress>> {
        self.ensure_open()?;
        self.with_domain_mut(id, |d| {
            if !d.state.is_running() {
                return Ok(Vec::new());
            }
            if d.polls_until_lease > 0 {
                d.polls_until_lease -= 1;
                debug!(vm_id = %id, remaining = d.polls_until_lease, "No lease yet");
                return Ok(Vec::new());
            }
            Ok(vec![InterfaceAddress {
                interface: "vnet0".to_string(),
                hwaddr: d.mac.clone(),
                addr: IpAddr::V4(d.ip),
                prefix: 24,
            }])
        })
    }

    async fn has_managed_save(&self, id: Uuid) -> Result<bool> {
        self.with_domain(id, |d| Ok(d.managed_save))
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    async fn start(&self, id: Uuid) -> Result<()> {
        self.ensure_writable("start")?;
        let fail = self.fail_starts.load(Ordering::SeqCst);
        let lease_delay = self.lease_delay;

        self.with_domain_mut(id, |d| {
            if fail {
                return Err(HypervisorError::OperationFailed(
                    "Start rejected by mock hypervisor".to_string()
                ));
            }
            if d.state.is_running() {
                return Err(HypervisorError::OperationFailed(
                    "Requested operation is not valid: domain is already running".to_string()
                ));
            }
            let restored = d.managed_save;
            d.state = RawDomainState::Running;
            d.managed_save = false;
            d.polls_until_lease = lease_delay;
            info!(restored, "Mock domain started");
            Ok(())
        })
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    async fn destroy(&self, id: Uuid) -> Result<()> {
        self.ensure_writable("destroy")?;
        self.with_domain_mut(id, |d| {
            if !d.state.is_running() && !d.state.is_suspended() {
                return Err(HypervisorError::OperationFailed(
                    "Requested operation is not valid: domain is not running".to_string()
                ));
            }
            d.state = RawDomainState::Shutoff;
            info!("Mock domain destroyed");
            Ok(())
        })
    }

    #[instrument(skip(self), fields(vm_id = %id))]
    async fn managed_save(&self, id: Uuid) -> Result<()> {
        self.ensure_writable("managed-save")?;
        self.with_domain_mut(id, |d| {
            if !d.state.is_running() && !d.state.is_suspended() {
                return Err(HypervisorError::OperationFailed(
                    "Requested operation is not valid: domain is not running".to_string()
                ));
            }
            d.state = RawDomainState::Shutoff;
            d.managed_save = true;
            info!("Mock domain saved");
            Ok(())
        })
    }
}

//! Configuration management for the Node Daemon.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hyperk_hypervisor::{parse_memory_kib, ConnectionMode, DomainTemplate, ImageCatalog, DEFAULT_IMAGES_DIR};

use crate::cli::Args;
use crate::repository::User;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hyperk/node.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// REST API server configuration
    pub server: ServerConfig,
    /// Hypervisor backend configuration
    pub hypervisor: HypervisorConfig,
    /// Instance disk storage
    pub storage: StorageConfig,
    /// Creation pipeline tuning
    pub provisioning: ProvisioningConfig,
    /// Sizing limits for creation requests
    pub limits: LimitsConfig,
    /// Base images keyed by OS key
    pub images: ImageCatalog,
    /// Instance/user record storage
    pub database: DatabaseConfig,
    /// API tokens and seeded users
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).with_context(|| "Failed to parse config file")
    }

    /// Defaults plus CLI overrides, for running without a config file.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.server.listen_address = listen.clone();
        }

        if let Some(ref uri) = args.libvirt_uri {
            self.hypervisor.libvirt_uri = uri.clone();
            self.hypervisor.backend = HypervisorBackend::Libvirt;
        }

        if args.dev {
            self.hypervisor.backend = HypervisorBackend::Mock;
        }

        self
    }

    /// Check limits and load the domain template. Run once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_vcpus == 0 {
            anyhow::bail!("limits.max_vcpus must be at least 1");
        }
        self.limits.max_ram_kib()?;

        if self.provisioning.max_concurrent_jobs == 0 {
            anyhow::bail!("provisioning.max_concurrent_jobs must be at least 1");
        }
        if self.provisioning.poll_interval_secs == 0 {
            anyhow::bail!("provisioning.poll_interval_secs must be at least 1");
        }

        self.provisioning.domain_template()?;

        for (token, user_id) in &self.auth.tokens {
            if token.is_empty() {
                anyhow::bail!("auth.tokens contains an empty token (user {})", user_id);
            }
        }

        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on for the REST API
    pub listen_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Backend type
    pub backend: HypervisorBackend,
    /// Libvirt connection URI
    pub libvirt_uri: String,
    /// Open the connection read-only (lookups only)
    pub read_only: bool,
}

impl HypervisorConfig {
    pub fn mode(&self) -> ConnectionMode {
        if self.read_only {
            ConnectionMode::ReadOnly
        } else {
            ConnectionMode::ReadWrite
        }
    }
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: HypervisorBackend::Mock,
            libvirt_uri: "qemu:///system".to_string(),
            read_only: false,
        }
    }
}

/// Hypervisor backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorBackend {
    /// Mock backend for testing/development
    #[default]
    Mock,
    /// Libvirt/QEMU backend
    Libvirt,
}

/// Instance disk storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory new instance disks are written to
    pub images_dir: PathBuf,
    /// qemu-img binary
    pub qemu_img_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            qemu_img_path: PathBuf::from("qemu-img"),
        }
    }
}

/// Creation pipeline tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Custom domain XML template (built-in template if unset)
    pub domain_template: Option<PathBuf>,
    /// Libvirt network new instances attach to
    pub network: String,
    /// Interval between lease and port polls
    pub poll_interval_secs: u64,
    /// Give up waiting for readiness after this long (wait forever if unset)
    pub readiness_timeout_secs: Option<u64>,
    /// Guest management (SSH) port
    pub management_port: u16,
    /// Timeout of a single TCP connect attempt
    pub connect_timeout_secs: u64,
    /// Jobs running at once; further jobs wait in the queue
    pub max_concurrent_jobs: usize,
    /// ansible-playbook binary
    pub ansible_playbook_path: PathBuf,
    /// Playbook run against new guests
    pub playbook: PathBuf,
    /// Extra arguments passed to ansible-playbook
    pub ansible_extra_args: Vec<String>,
    /// How long finished job records stay queryable
    pub job_retention_secs: u64,
}

impl ProvisioningConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }

    /// Load the configured template, or the built-in one.
    pub fn domain_template(&self) -> Result<DomainTemplate> {
        match &self.domain_template {
            Some(path) => DomainTemplate::from_file(path)
                .with_context(|| format!("Invalid domain template {}", path.display())),
            None => Ok(DomainTemplate::builtin()),
        }
    }
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            domain_template: None,
            network: "default".to_string(),
            poll_interval_secs: 5,
            readiness_timeout_secs: None,
            management_port: 22,
            connect_timeout_secs: 5,
            max_concurrent_jobs: 4,
            ansible_playbook_path: PathBuf::from("ansible-playbook"),
            playbook: PathBuf::from("/etc/hyperk/playbooks/configure-guest.yml"),
            ansible_extra_args: Vec::new(),
            job_retention_secs: 24 * 60 * 60,
        }
    }
}

/// Sizing limits for creation requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_vcpus: u32,
    /// Memory ceiling with unit, e.g. `16GiB`
    pub max_ram: String,
}

impl LimitsConfig {
    pub fn max_ram_kib(&self) -> Result<u64> {
        parse_memory_kib(&self.max_ram)
            .with_context(|| format!("Invalid limits.max_ram: {}", self.max_ram))
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_vcpus: 8,
            max_ram: "16GiB".to_string(),
        }
    }
}

/// Instance/user record storage.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// JSON snapshot file; records are memory-only if unset
    pub state_file: Option<PathBuf>,
}

/// API tokens and seeded users.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token → user id
    pub tokens: HashMap<String, i64>,
    /// Users created at startup if missing
    pub bootstrap_users: Vec<User>,
}

//! Guest configuration through an external ansible-playbook run.

use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{error, info, instrument};

use crate::error::{OrchestratorError, Result};

/// Bytes of combined output kept for diagnostics.
const OUTPUT_TAIL_BYTES: usize = 8 * 1024;

/// What a configuration run applies to a new guest.
#[derive(Clone)]
pub struct GuestSettings {
    pub ip: IpAddr,
    /// Root password baked into the base image
    pub default_password: String,
    /// Root password requested by the user
    pub new_password: String,
    pub hostname: String,
}

impl std::fmt::Debug for GuestSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestSettings")
            .field("ip", &self.ip)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// Applies hostname and credentials to a reachable guest.
#[async_trait]
pub trait GuestConfigurator: Send + Sync {
    async fn configure(&self, settings: &GuestSettings) -> Result<()>;
}

#[derive(Serialize)]
struct ExtraVars<'a> {
    newhost: String,
    defaultpass: &'a str,
    newpassword: &'a str,
    newhostname: &'a str,
    ansible_user: &'a str,
    ansible_password: &'a str,
}

/// Runs `ansible-playbook` against a one-host inline inventory.
///
/// Variables go through a private JSON extra-vars file, so passwords never
/// appear in the process list.
pub struct AnsibleConfigurator {
    program: PathBuf,
    playbook: PathBuf,
    extra_args: Vec<String>,
}

impl AnsibleConfigurator {
    pub fn new(program: impl Into<PathBuf>, playbook: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            playbook: playbook.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    fn write_vars(settings: &GuestSettings) -> Result<tempfile::NamedTempFile> {
        let vars = ExtraVars {
            newhost: settings.ip.to_string(),
            defaultpass: &settings.default_password,
            newpassword: &settings.new_password,
            newhostname: &settings.hostname,
            ansible_user: "root",
            ansible_password: &settings.default_password,
        };

        let mut file = tempfile::Builder::new()
            .prefix("hyperk-vars-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| OrchestratorError::Internal(format!("Failed to create vars file: {}", e)))?;
        serde_json::to_writer(&mut file, &vars)
            .map_err(|e| OrchestratorError::Internal(format!("Failed to write vars file: {}", e)))?;
        file.flush()
            .map_err(|e| OrchestratorError::Internal(format!("Failed to write vars file: {}", e)))?;
        Ok(file)
    }
}

#[async_trait]
impl GuestConfigurator for AnsibleConfigurator {
    #[instrument(skip(self, settings), fields(ip = %settings.ip, hostname = %settings.hostname))]
    async fn configure(&self, settings: &GuestSettings) -> Result<()> {
        let vars = Self::write_vars(settings)?;

        info!(playbook = %self.playbook.display(), "Running guest configuration");

        let output = Command::new(&self.program)
            .arg("-i")
            .arg(format!("{},", settings.ip))
            .arg("-e")
            .arg(format!("@{}", vars.path().display()))
            .args(&self.extra_args)
            .arg(&self.playbook)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| OrchestratorError::ConfigurationFailed {
                status: "spawn failed".to_string(),
                output: format!("{}: {}", self.program.display(), e),
            })?;

        if !output.status.success() {
            let mut combined = output.stdout;
            combined.extend_from_slice(&output.stderr);
            let tail = output_tail(&combined, OUTPUT_TAIL_BYTES);
            error!(status = %output.status, "Guest configuration failed");
            return Err(OrchestratorError::ConfigurationFailed {
                status: output.status.to_string(),
                output: tail,
            });
        }

        info!("Guest configured");
        Ok(())
    }
}

/// Last `limit` bytes of `bytes` as lossy UTF-8.
fn output_tail(bytes: &[u8], limit: usize) -> String {
    let start = bytes.len().saturating_sub(limit);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

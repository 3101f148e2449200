//! Daemon assembly and lifecycle.
//!
//! Opens the one hypervisor connection, builds the repository, pipeline and
//! controller around it, and serves the REST API. On Ctrl+C or SIGTERM the
//! API stops accepting requests, in-flight jobs are cancelled and awaited,
//! and the connection is closed exactly once.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use hyperk_hypervisor::{Hypervisor, ImageProvisioner, MockBackend};

use crate::config::{Config, HypervisorBackend, HypervisorConfig};
use crate::configurator::AnsibleConfigurator;
use crate::http_server::{run_http_server, AppState};
use crate::jobs::{run_workers, JobQueue};
use crate::lifecycle::{InstanceController, Limits};
use crate::pipeline::{PipelineComponents, ProvisioningPipeline};
use crate::readiness::{ReadinessPoller, TcpProbe};
use crate::repository::{InstanceRepository, MemoryRepository};

/// Run the daemon until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let hypervisor = connect_hypervisor(&config.hypervisor).await?;

    // Check hypervisor health
    match hypervisor.health_check().await {
        Ok(true) => {
            if let Ok(caps) = hypervisor.capabilities().await {
                info!(
                    name = %caps.name,
                    version = %caps.version,
                    mode = ?caps.mode,
                    "Hypervisor capabilities"
                );
            }
        }
        Ok(false) => warn!(uri = %hypervisor.uri(), "Hypervisor connection reports unhealthy"),
        Err(e) => warn!(error = %e, "Hypervisor health check failed"),
    }

    let repository = open_repository(&config).await?;
    let template = config.provisioning.domain_template()?;
    let max_ram_kib = config.limits.max_ram_kib()?;

    let provisioner = ImageProvisioner::new(&config.storage.images_dir, config.images.clone())
        .with_qemu_img(&config.storage.qemu_img_path);
    match provisioner.check_qemu_img() {
        Ok(version) => info!(version = %version, "qemu-img available"),
        Err(e) => warn!(error = %e, "qemu-img unavailable, instance creation will fail"),
    }
    info!(
        images = ?config.images.keys().collect::<Vec<_>>(),
        images_dir = %config.storage.images_dir.display(),
        "Image catalogue loaded"
    );

    let (queue, receiver) = JobQueue::with_retention(config.provisioning.job_retention());

    let readiness = ReadinessPoller::new(
        hypervisor.clone(),
        Arc::new(TcpProbe::new(config.provisioning.connect_timeout())),
        config.provisioning.poll_interval(),
        config.provisioning.management_port,
    )
    .with_deadline(config.provisioning.readiness_timeout());

    let configurator = AnsibleConfigurator::new(
        &config.provisioning.ansible_playbook_path,
        &config.provisioning.playbook,
    )
    .with_extra_args(config.provisioning.ansible_extra_args.clone());

    let pipeline = Arc::new(ProvisioningPipeline::new(
        PipelineComponents {
            hypervisor: hypervisor.clone(),
            disks: Arc::new(provisioner),
            catalog: config.images.clone(),
            template,
            network: config.provisioning.network.clone(),
            readiness,
            configurator: Arc::new(configurator),
            repository: repository.clone(),
        },
        queue.clone(),
    ));

    let controller = Arc::new(InstanceController::new(
        hypervisor.clone(),
        repository.clone(),
        queue.clone(),
        config.images.clone(),
        Limits {
            max_vcpus: config.limits.max_vcpus,
            max_ram_kib,
        },
    ));

    // Start provisioning workers
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let workers = tokio::spawn(run_workers(
        queue.clone(),
        receiver,
        pipeline,
        config.provisioning.max_concurrent_jobs,
        shutdown_tx.subscribe(),
    ));

    let addr: SocketAddr = config.server.listen_address.parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let state = Arc::new(AppState {
        controller,
        repository,
        tokens: config.auth.tokens.clone(),
    });

    let served = run_http_server(addr, state, shutdown_signal()).await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP API server failed");
    }

    info!(active_jobs = queue.active_count(), "Shutting down");
    let _ = shutdown_tx.send(());
    if let Err(e) = workers.await {
        warn!(error = %e, "Provisioning workers ended abnormally");
    }

    if let Err(e) = hypervisor.close().await {
        warn!(error = %e, "Failed to close hypervisor connection");
    }
    info!("Shutdown complete");

    served
}

/// Open the process-wide hypervisor connection.
async fn connect_hypervisor(config: &HypervisorConfig) -> Result<Arc<dyn Hypervisor>> {
    match config.backend {
        HypervisorBackend::Mock => {
            info!(mode = ?config.mode(), "Using mock hypervisor backend");
            Ok(Arc::new(MockBackend::connect("mock:///default", config.mode())?))
        }
        HypervisorBackend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                info!(uri = %config.libvirt_uri, mode = ?config.mode(), "Connecting to libvirt");
                let backend = hyperk_hypervisor::LibvirtBackend::connect(&config.libvirt_uri, config.mode()).await?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "libvirt"))]
            {
                anyhow::bail!(
                    "Libvirt backend requested for {} but this build has no libvirt support \
                     (rebuild with --features libvirt, or run with --dev)",
                    config.libvirt_uri
                )
            }
        }
    }
}

/// Build the record store and seed bootstrap users.
async fn open_repository(config: &Config) -> Result<Arc<dyn InstanceRepository>> {
    let repository = match &config.database.state_file {
        Some(path) => {
            info!(path = %path.display(), "Using persistent record store");
            MemoryRepository::with_persistence(path)?
        }
        None => {
            warn!("No database.state_file configured, records are kept in memory only");
            MemoryRepository::new()
        }
    };

    for user in &config.auth.bootstrap_users {
        if repository.get_user_by_username(&user.username).await.is_ok() {
            debug!(username = %user.username, "Bootstrap user already present");
            continue;
        }
        repository.create_user(user.clone()).await?;
        info!(username = %user.username, admin = user.is_admin, "Bootstrap user created");
    }

    Ok(Arc::new(repository))
}

/// Resolve on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::User;

    #[tokio::test]
    async fn test_mock_backend_honours_read_only() {
        let config = HypervisorConfig {
            read_only: true,
            ..Default::default()
        };
        let hv = connect_hypervisor(&config).await.unwrap();
        assert!(!hv.mode().is_writable());
    }

    #[cfg(not(feature = "libvirt"))]
    #[tokio::test]
    async fn test_libvirt_without_feature_is_an_error() {
        let config = HypervisorConfig {
            backend: HypervisorBackend::Libvirt,
            ..Default::default()
        };
        assert!(connect_hypervisor(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_users_seeded_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.state_file = Some(dir.path().join("records.json"));
        config.auth.bootstrap_users = vec![User {
            id: 1,
            username: "admin".into(),
            realname: "Administrator".into(),
            is_admin: true,
        }];

        let repo = open_repository(&config).await.unwrap();
        assert!(repo.get_user_by_id(1).await.unwrap().is_admin);
        drop(repo);

        // Reopening over the same state file must not fail on the existing user
        let repo = open_repository(&config).await.unwrap();
        assert_eq!(repo.get_user_by_username("admin").await.unwrap().id, 1);
    }
}

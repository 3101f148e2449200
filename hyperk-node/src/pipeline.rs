//! The instance creation pipeline.
//!
//! A job runs its stages strictly in order: materialize the disk, define the
//! domain, start it, wait for network readiness, configure the guest and
//! finally persist the instance record. The record is the only thing that
//! makes the instance visible; a failure at any stage leaves earlier side
//! effects (disk, defined or running domain) in place and persists nothing.

use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use hyperk_hypervisor::{
    DiskProvisioner, DomainTemplate, DomainXmlBuilder, Hypervisor, ImageCatalog, MacAddress,
};

use crate::configurator::{GuestConfigurator, GuestSettings};
use crate::error::{OrchestratorError, Result};
use crate::jobs::{CancelToken, JobQueue, ProvisioningJob, Stage};
use crate::readiness::ReadinessPoller;
use crate::repository::{Instance, InstanceRepository};

/// Everything a pipeline needs besides the job queue.
pub struct PipelineComponents {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub disks: Arc<dyn DiskProvisioner>,
    pub catalog: ImageCatalog,
    pub template: DomainTemplate,
    /// Libvirt network new domains attach to
    pub network: String,
    pub readiness: ReadinessPoller,
    pub configurator: Arc<dyn GuestConfigurator>,
    pub repository: Arc<dyn InstanceRepository>,
}

/// Runs provisioning jobs and reports their progress to the queue.
pub struct ProvisioningPipeline {
    hypervisor: Arc<dyn Hypervisor>,
    disks: Arc<dyn DiskProvisioner>,
    catalog: ImageCatalog,
    template: DomainTemplate,
    network: String,
    readiness: ReadinessPoller,
    configurator: Arc<dyn GuestConfigurator>,
    repository: Arc<dyn InstanceRepository>,
    queue: Arc<JobQueue>,
}

impl ProvisioningPipeline {
    pub fn new(components: PipelineComponents, queue: Arc<JobQueue>) -> Self {
        Self {
            hypervisor: components.hypervisor,
            disks: components.disks,
            catalog: components.catalog,
            template: components.template,
            network: components.network,
            readiness: components.readiness,
            configurator: components.configurator,
            repository: components.repository,
            queue,
        }
    }

    /// Run one job to completion. The outcome goes to the job record.
    #[instrument(skip(self, job, cancel), fields(job_id = %job.job_id, name = %job.name))]
    pub async fn run(&self, job: ProvisioningJob, cancel: CancelToken) {
        let mut stage = Stage::Queued;

        match self.execute(&job, &cancel, &mut stage).await {
            Ok(instance) => {
                info!(instance_id = %instance.id, "Instance provisioned");
                self.queue.complete(job.job_id, instance.id);
            }
            Err(e) => {
                error!(
                    stage = %stage,
                    name = %job.name,
                    job_id = %job.job_id,
                    error = %e,
                    "Provisioning failed"
                );
                self.queue.fail(job.job_id, stage, e.to_string());
            }
        }
    }

    async fn execute(
        &self,
        job: &ProvisioningJob,
        cancel: &CancelToken,
        stage: &mut Stage,
    ) -> Result<Instance> {
        self.enter(job, cancel, stage, Stage::Materialize)?;
        let disk_path = {
            let disks = self.disks.clone();
            let (os, name, size) = (job.os.clone(), job.name.clone(), job.disk_size_gib);
            tokio::task::spawn_blocking(move || disks.materialize(&os, &name, size))
                .await
                .map_err(|e| OrchestratorError::Internal(format!("Disk task failed: {}", e)))??
        };

        self.enter(job, cancel, stage, Stage::Define)?;
        let xml = DomainXmlBuilder::new(&self.template)
            .name(job.name.as_str())
            .vcpu(job.vcpu)
            .memory(job.ram, job.ram_unit)
            .mac(MacAddress::generate())
            .disk_path(disk_path)
            .network(self.network.as_str())
            .build();
        let domain = self.hypervisor.define_domain(&xml).await?;
        debug!(vm_id = %domain.id, "Domain defined");

        self.enter(job, cancel, stage, Stage::Start)?;
        self.hypervisor.start(domain.id).await?;

        self.enter(job, cancel, stage, Stage::Readiness)?;
        let ip = self.readiness.wait_ready(domain.id, cancel).await?;

        self.enter(job, cancel, stage, Stage::Configure)?;
        let base = self.catalog.get(&job.os)
            .ok_or_else(|| OrchestratorError::UnknownImage(job.os.clone()))?;
        let settings = GuestSettings {
            ip,
            default_password: base.root_password.clone(),
            new_password: job.root_password.clone(),
            hostname: job.hostname().to_string(),
        };
        self.configurator.configure(&settings).await?;

        self.enter(job, cancel, stage, Stage::Persist)?;
        self.repository.create_instance(domain.id, &job.name, job.owner).await
    }

    /// Move to `next` unless the job has been cancelled.
    fn enter(
        &self,
        job: &ProvisioningJob,
        cancel: &CancelToken,
        stage: &mut Stage,
        next: Stage,
    ) -> Result<()> {
        cancel.check()?;
        *stage = next;
        self.queue.set_stage(job.job_id, next);
        debug!(stage = %next, "Entering stage");
        Ok(())
    }
}

//! Instance lifecycle controller.
//!
//! Entry point for everything a caller can do with instances: list, inspect,
//! rename, change power state and submit new creations. Views are always
//! derived from live hypervisor state; the repository only stores identity,
//! display name and owner.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use hyperk_hypervisor::{translate, Hypervisor, ImageCatalog, InstanceView, PowerState, RamUnit};

use crate::error::{OrchestratorError, Result};
use crate::jobs::{JobId, JobQueue, JobRecord, ProvisioningJob};
use crate::repository::{validate_name, Instance, InstanceRepository};

// =============================================================================
// TYPES
// =============================================================================

/// Power state a caller can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Start,
    Poweroff,
    Pause,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Start => "start",
            TargetState::Poweroff => "poweroff",
            TargetState::Pause => "pause",
        }
    }

    /// Whether an instance in `from` can be moved toward this target.
    pub fn allowed_from(&self, from: PowerState) -> bool {
        match self {
            TargetState::Start => matches!(from, PowerState::Off | PowerState::Paused),
            TargetState::Poweroff | TargetState::Pause => from == PowerState::Running,
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetState {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(TargetState::Start),
            "poweroff" => Ok(TargetState::Poweroff),
            "pause" => Ok(TargetState::Pause),
            other => Err(OrchestratorError::UnknownState(other.to_string())),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    pub is_admin: bool,
}

impl Caller {
    /// Owners and admins may modify an instance.
    pub fn can_manage(&self, instance: &Instance) -> bool {
        self.is_admin || instance.user_id == self.user_id
    }
}

/// Body of a creation request.
#[derive(Clone, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    /// Base image key
    pub os: String,
    pub vcpu: u32,
    pub ram: u64,
    pub ram_unit: RamUnit,
    /// Disk size in GiB
    pub size: u64,
    pub root_password: String,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl fmt::Debug for CreateInstanceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateInstanceRequest")
            .field("name", &self.name)
            .field("os", &self.os)
            .field("vcpu", &self.vcpu)
            .field("ram", &self.ram)
            .field("ram_unit", &self.ram_unit)
            .field("size", &self.size)
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// Returned when a creation has been queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobAccepted {
    pub job_id: JobId,
}

/// Resource ceilings for new instances.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_vcpus: u32,
    pub max_ram_kib: u64,
}

// =============================================================================
// CONTROLLER
// =============================================================================

pub struct InstanceController {
    hypervisor: Arc<dyn Hypervisor>,
    repository: Arc<dyn InstanceRepository>,
    queue: Arc<JobQueue>,
    catalog: ImageCatalog,
    limits: Limits,
}

impl InstanceController {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        repository: Arc<dyn InstanceRepository>,
        queue: Arc<JobQueue>,
        catalog: ImageCatalog,
        limits: Limits,
    ) -> Self {
        Self {
            hypervisor,
            repository,
            queue,
            catalog,
            limits,
        }
    }

    /// Stream the views of every instance the caller can see.
    ///
    /// Admins see all tracked instances, everyone else their own. Each item
    /// is translated lazily; a per-item error does not end the stream.
    pub async fn list_instances(
        &self,
        caller: Caller,
    ) -> Result<BoxStream<'static, Result<InstanceView>>> {
        let records = if caller.is_admin {
            self.repository.list_all_instances().await?
        } else {
            self.repository.list_instances_for_user(caller.user_id).await?
        };

        let hypervisor = self.hypervisor.clone();
        Ok(stream::iter(records)
            .then(move |record| {
                let hypervisor = hypervisor.clone();
                async move { view_of(hypervisor.as_ref(), &record).await }
            })
            .boxed())
    }

    /// Current view of one instance. Instances the caller may not manage are
    /// reported as missing.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn get_instance(&self, id: Uuid, caller: Caller) -> Result<InstanceView> {
        let record = self.repository.get_instance_by_id(id).await?;
        if !caller.can_manage(&record) {
            return Err(OrchestratorError::NotFound(format!("instance {}", id)));
        }
        view_of(self.hypervisor.as_ref(), &record).await
    }

    /// Change the display name. The domain itself keeps its name.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn rename_instance(&self, id: Uuid, new_name: &str, caller: Caller) -> Result<Instance> {
        let record = self.repository.get_instance_by_id(id).await?;
        authorize(&record, caller)?;
        validate_name(new_name)?;

        let updated = self.repository.update_instance_name(id, new_name).await?;
        info!(old = %record.name, new = %updated.name, "Instance renamed");
        Ok(updated)
    }

    /// Move an instance toward `target` (`start`, `poweroff` or `pause`).
    ///
    /// The current state is read through the translator first; a target that
    /// is not reachable from it fails without touching the hypervisor.
    /// `start` resumes only a managed-saved instance; a guest suspended by the
    /// hypervisor itself is still active and cannot be started.
    #[instrument(skip(self), fields(vm_id = %id))]
    pub async fn set_instance_state(&self, id: Uuid, target: &str, caller: Caller) -> Result<TargetState> {
        let record = self.repository.get_instance_by_id(id).await?;
        authorize(&record, caller)?;
        let target: TargetState = target.parse()?;

        let domain = self.hypervisor.lookup_by_id(id).await?;
        let current = translate(self.hypervisor.as_ref(), &domain).await?.state();
        let resumable = match (target, current) {
            (TargetState::Start, PowerState::Paused) => self.hypervisor.has_managed_save(id).await?,
            _ => true,
        };
        if !target.allowed_from(current) || !resumable {
            return Err(OrchestratorError::InvalidTransition { from: current, target });
        }

        match target {
            TargetState::Start => self.hypervisor.start(id).await?,
            TargetState::Poweroff => self.hypervisor.destroy(id).await?,
            TargetState::Pause => self.hypervisor.managed_save(id).await?,
        }

        info!(from = %current, target = %target, "Instance state changed");
        Ok(target)
    }

    /// Validate a creation request and queue it. Never waits on the job.
    #[instrument(skip(self, request), fields(name = %request.name, os = %request.os))]
    pub async fn submit_creation(&self, caller: Caller, request: CreateInstanceRequest) -> Result<JobAccepted> {
        self.validate_creation(&request)?;
        self.repository.get_user_by_id(caller.user_id).await
            .map_err(|_| OrchestratorError::Unauthorized(format!("unknown user {}", caller.user_id)))?;

        let job = ProvisioningJob {
            job_id: Uuid::new_v4(),
            name: request.name,
            os: request.os,
            vcpu: request.vcpu,
            ram: request.ram,
            ram_unit: request.ram_unit,
            disk_size_gib: request.size,
            root_password: request.root_password,
            hostname: request.hostname,
            owner: caller.user_id,
        };
        let job_id = self.queue.enqueue(job)?;

        info!(job_id = %job_id, "Creation accepted");
        Ok(JobAccepted { job_id })
    }

    /// Status of a creation job submitted by the caller.
    pub fn job_status(&self, job_id: JobId, caller: Caller) -> Result<JobRecord> {
        self.queue.get(job_id)
            .filter(|record| caller.is_admin || record.owner == caller.user_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", job_id)))
    }

    /// Cancel a queued or running creation job.
    ///
    /// A running job stops at its next stage boundary, or at once while it
    /// waits for readiness. Work already done is left in place.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub fn cancel_job(&self, job_id: JobId, caller: Caller) -> Result<JobRecord> {
        let record = self.job_status(job_id, caller)?;
        if !record.status.is_active() || !self.queue.cancel(job_id) {
            return Err(OrchestratorError::JobFinished(job_id.to_string()));
        }
        self.job_status(job_id, caller)
    }

    fn validate_creation(&self, request: &CreateInstanceRequest) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(OrchestratorError::InvalidRequest(msg)) };

        if !self.catalog.contains(&request.os) {
            return invalid(format!("Unknown OS: {}", request.os));
        }
        validate_name(&request.name)?;
        if request.name.chars().any(char::is_whitespace) {
            return invalid("Name can't contain whitespace".to_string());
        }
        if request.name.contains(['{', '}']) {
            return invalid(format!("Name can't contain braces: {}", request.name));
        }
        if request.name.contains(['/', '\\']) || request.name == "." || request.name == ".." {
            return invalid(format!("Name is not a valid file name: {}", request.name));
        }
        if let Some(hostname) = &request.hostname {
            if hostname.is_empty() || hostname.chars().any(char::is_whitespace) {
                return invalid(format!("Invalid hostname: {:?}", hostname));
            }
        }
        if request.vcpu == 0 || request.vcpu > self.limits.max_vcpus {
            return invalid(format!("vCPU count must be between 1 and {}", self.limits.max_vcpus));
        }
        match request.ram_unit.to_kib(request.ram) {
            Some(kib) if kib > 0 && kib <= self.limits.max_ram_kib => {}
            _ => {
                return invalid(format!(
                    "RAM must be between 1 KiB and {} KiB",
                    self.limits.max_ram_kib
                ))
            }
        }
        if request.size == 0 {
            return invalid("Disk size must be at least 1 GiB".to_string());
        }
        if request.root_password.is_empty() {
            return invalid("Root password can't be empty".to_string());
        }
        Ok(())
    }
}

fn authorize(record: &Instance, caller: Caller) -> Result<()> {
    if !caller.can_manage(record) {
        return Err(OrchestratorError::Unauthorized(
            "only the owner or an admin can modify this instance".to_string()
        ));
    }
    Ok(())
}

async fn view_of(hypervisor: &dyn Hypervisor, record: &Instance) -> Result<InstanceView> {
    let domain = hypervisor.lookup_by_id(record.id).await?;
    Ok(translate(hypervisor, &domain).await?.with_name(record.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobReceiver, JobStatus};
    use crate::repository::{MemoryRepository, User};
    use futures::TryStreamExt;
    use hyperk_hypervisor::{BaseImage, DomainTemplate, DomainXmlBuilder, MockBackend, RawDomainState};
    use std::path::PathBuf;

    const OWNER: Caller = Caller { user_id: 1, is_admin: false };
    const OTHER: Caller = Caller { user_id: 2, is_admin: false };
    const ADMIN: Caller = Caller { user_id: 3, is_admin: true };

    struct Fixture {
        hv: Arc<MockBackend>,
        repo: Arc<MemoryRepository>,
        queue: Arc<JobQueue>,
        _rx: JobReceiver,
        controller: InstanceController,
    }

    async fn fixture() -> Fixture {
        let hv = Arc::new(MockBackend::new());
        let repo = Arc::new(MemoryRepository::new());
        for (id, name, is_admin) in [(1, "alice", false), (2, "bob", false), (3, "root", true)] {
            repo.create_user(User { id, username: name.into(), realname: String::new(), is_admin })
                .await
                .unwrap();
        }
        let (queue, rx) = JobQueue::new();

        let mut catalog = ImageCatalog::new();
        catalog.insert("ubuntu22", BaseImage {
            path: PathBuf::from("/srv/images/ubuntu22.qcow2"),
            root_password: "ubuntu".into(),
        });

        let controller = InstanceController::new(
            hv.clone(),
            repo.clone(),
            queue.clone(),
            catalog,
            Limits { max_vcpus: 8, max_ram_kib: 16 * 1024 * 1024 },
        );
        Fixture { hv, repo, queue, _rx: rx, controller }
    }

    /// Define and start a domain and track it as owned by `owner`.
    async fn seed(f: &Fixture, name: &str, owner: i64) -> Uuid {
        let template = DomainTemplate::builtin();
        let xml = DomainXmlBuilder::new(&template)
            .name(name)
            .vcpu(2)
            .memory(1, RamUnit::GiB)
            .disk_path(format!("/var/lib/libvirt/images/{}", name))
            .build();
        let domain = f.hv.define_domain(&xml).await.unwrap();
        f.hv.start(domain.id).await.unwrap();
        f.repo.create_instance(domain.id, name, owner).await.unwrap();
        domain.id
    }

    fn request(name: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: name.to_string(),
            os: "ubuntu22".to_string(),
            vcpu: 2,
            ram: 2,
            ram_unit: RamUnit::GiB,
            size: 20,
            root_password: "s3cret".to_string(),
            hostname: None,
        }
    }

    #[test]
    fn test_target_state_parse() {
        assert_eq!("pause".parse::<TargetState>().unwrap(), TargetState::Pause);
        assert!(matches!(
            "reboot".parse::<TargetState>(),
            Err(OrchestratorError::UnknownState(_))
        ));
        assert!(TargetState::Start.allowed_from(PowerState::Paused));
        assert!(!TargetState::Start.allowed_from(PowerState::Running));
        assert!(!TargetState::Pause.allowed_from(PowerState::Off));
    }

    #[tokio::test]
    async fn test_get_is_stable_and_hidden_from_others() {
        let f = fixture().await;
        let id = seed(&f, "web", 1).await;

        let first = f.controller.get_instance(id, OWNER).await.unwrap();
        let second = f.controller.get_instance(id, OWNER).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.name, "web");

        assert!(matches!(
            f.controller.get_instance(id, OTHER).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(f.controller.get_instance(id, ADMIN).await.is_ok());
        assert!(matches!(
            f.controller.get_instance(Uuid::new_v4(), ADMIN).await,
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_requires_owner_or_admin() {
        let f = fixture().await;
        let id = seed(&f, "web", 1).await;

        assert!(matches!(
            f.controller.rename_instance(id, "stolen", OTHER).await,
            Err(OrchestratorError::Unauthorized(_))
        ));
        assert_eq!(f.repo.get_instance_by_id(id).await.unwrap().name, "web");

        let renamed = f.controller.rename_instance(id, "frontend", OWNER).await.unwrap();
        assert_eq!(renamed.name, "frontend");
        f.controller.rename_instance(id, "frontend-2", ADMIN).await.unwrap();

        // Display name only; the domain keeps its own name
        assert_eq!(f.hv.lookup_by_id(id).await.unwrap().name, "web");
        assert_eq!(f.controller.get_instance(id, OWNER).await.unwrap().name, "frontend-2");
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let f = fixture().await;
        let id = seed(&f, "db", 1).await;

        let before = f.hv.mutation_count();
        assert!(matches!(
            f.controller.set_instance_state(id, "start", OWNER).await,
            Err(OrchestratorError::InvalidTransition { from: PowerState::Running, target: TargetState::Start })
        ));
        assert_eq!(f.hv.mutation_count(), before);

        assert_eq!(f.controller.set_instance_state(id, "pause", OWNER).await.unwrap(), TargetState::Pause);
        assert_eq!(f.controller.get_instance(id, OWNER).await.unwrap().state(), PowerState::Paused);

        f.controller.set_instance_state(id, "start", OWNER).await.unwrap();
        assert_eq!(f.controller.get_instance(id, OWNER).await.unwrap().state(), PowerState::Running);

        f.controller.set_instance_state(id, "poweroff", ADMIN).await.unwrap();
        let view = f.controller.get_instance(id, OWNER).await.unwrap();
        assert_eq!(view.state(), PowerState::Off);
        assert_eq!(view.status.ip(), None);
        assert_eq!(view.status.ram_kib(), 1024 * 1024);

        assert!(matches!(
            f.controller.set_instance_state(id, "pause", OWNER).await,
            Err(OrchestratorError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_refuses_hypervisor_suspended_guest() {
        let f = fixture().await;
        let id = seed(&f, "db", 1).await;
        f.hv.set_raw_state(id, RawDomainState::Paused).unwrap();
        assert_eq!(f.controller.get_instance(id, OWNER).await.unwrap().state(), PowerState::Paused);

        let before = f.hv.mutation_count();
        assert!(matches!(
            f.controller.set_instance_state(id, "start", OWNER).await,
            Err(OrchestratorError::InvalidTransition { from: PowerState::Paused, target: TargetState::Start })
        ));
        assert_eq!(f.hv.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_state_change_checks_caller_first() {
        let f = fixture().await;
        let id = seed(&f, "db", 1).await;
        let before = f.hv.mutation_count();

        assert!(matches!(
            f.controller.set_instance_state(id, "poweroff", OTHER).await,
            Err(OrchestratorError::Unauthorized(_))
        ));
        assert!(matches!(
            f.controller.set_instance_state(id, "hibernate", OWNER).await,
            Err(OrchestratorError::UnknownState(_))
        ));
        assert_eq!(f.hv.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_list_scoped_to_caller() {
        let f = fixture().await;
        seed(&f, "a1", 1).await;
        seed(&f, "a2", 1).await;
        seed(&f, "b1", 2).await;

        let mine: Vec<InstanceView> = f.controller.list_instances(OWNER).await.unwrap()
            .try_collect()
            .await
            .unwrap();
        let mut names: Vec<_> = mine.iter().map(|v| v.name.as_str()).collect();
        names.sort();
        assert_eq!(names, ["a1", "a2"]);

        let all: Vec<InstanceView> = f.controller.list_instances(ADMIN).await.unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let f = fixture().await;

        let bad = vec![
            CreateInstanceRequest { os: "windows".into(), ..request("x") },
            request("has space"),
            request(""),
            request("../etc"),
            request("web{network}"),
            CreateInstanceRequest { vcpu: 0, ..request("x") },
            CreateInstanceRequest { vcpu: 9, ..request("x") },
            CreateInstanceRequest { ram: 17, ..request("x") },
            CreateInstanceRequest { ram: u64::MAX, ..request("x") },
            CreateInstanceRequest { size: 0, ..request("x") },
            CreateInstanceRequest { hostname: Some("my host".into()), ..request("x") },
        ];

        for req in bad {
            let label = format!("{:?}", req);
            assert!(
                matches!(f.controller.submit_creation(OWNER, req).await, Err(OrchestratorError::InvalidRequest(_))),
                "accepted {}",
                label
            );
        }
        assert_eq!(f.queue.active_count(), 0);
        assert_eq!(f.hv.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_queues_without_running() {
        let f = fixture().await;
        let accepted = f.controller.submit_creation(OWNER, request("new-vm")).await.unwrap();

        let record = f.controller.job_status(accepted.job_id, OWNER).unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.owner, 1);
        assert_eq!(f.hv.mutation_count(), 0);

        assert!(matches!(
            f.controller.job_status(accepted.job_id, OTHER),
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(f.controller.job_status(accepted.job_id, ADMIN).is_ok());

        assert!(matches!(
            f.controller.cancel_job(accepted.job_id, OTHER),
            Err(OrchestratorError::NotFound(_))
        ));
        f.controller.cancel_job(accepted.job_id, OWNER).unwrap();
        f.queue.fail(accepted.job_id, crate::jobs::Stage::Queued, "Job cancelled");
        assert!(matches!(
            f.controller.cancel_job(accepted.job_id, ADMIN),
            Err(OrchestratorError::JobFinished(_))
        ));

        let stranger = Caller { user_id: 99, is_admin: false };
        assert!(matches!(
            f.controller.submit_creation(stranger, request("other-vm")).await,
            Err(OrchestratorError::Unauthorized(_))
        ));
    }
}

//! Common test utilities for hyperk-node integration tests
//!
//! Builds a complete daemon (controller, pipeline, workers, router) over the
//! mock hypervisor, with fakes for disk provisioning, guest configuration
//! and port probing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tower::ServiceExt; // for `oneshot`

use hyperk_hypervisor::{BaseImage, DiskProvisioner, DomainTemplate, HypervisorError, ImageCatalog, MockBackend};
use hyperk_node::configurator::{GuestConfigurator, GuestSettings};
use hyperk_node::http_server::{build_router, AppState};
use hyperk_node::jobs::{run_workers, JobQueue};
use hyperk_node::pipeline::{PipelineComponents, ProvisioningPipeline};
use hyperk_node::readiness::{PortProbe, ReadinessPoller};
use hyperk_node::repository::{InstanceRepository, MemoryRepository, User};
use hyperk_node::{InstanceController, Limits, OrchestratorError};

pub const ALICE: &str = "alice-token";
pub const BOB: &str = "bob-token";
pub const ADMIN: &str = "admin-token";

// =============================================================================
// FAKES
// =============================================================================

/// Records requested disks; refuses a name it has already created.
#[derive(Default)]
pub struct FakeDisks {
    pub created: Mutex<Vec<String>>,
}

impl DiskProvisioner for FakeDisks {
    fn materialize(&self, key: &str, target_name: &str, _size_gib: u64) -> hyperk_hypervisor::error::Result<PathBuf> {
        if key != "ubuntu22" {
            return Err(HypervisorError::UnknownImage(key.to_string()));
        }
        let mut created = self.created.lock().unwrap();
        if created.iter().any(|n| n == target_name) {
            return Err(HypervisorError::ProvisioningFailed(format!("Disk image already exists: {}", target_name)));
        }
        created.push(target_name.to_string());
        Ok(PathBuf::from("/var/lib/libvirt/images").join(target_name))
    }
}

/// Guest configurator that records its runs.
///
/// With a gate, each run waits for one permit before finishing.
pub struct FakeConfigurator {
    pub runs: Mutex<Vec<GuestSettings>>,
    pub delay: Duration,
    pub gate: Option<Arc<Semaphore>>,
    pub fail: bool,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

#[async_trait]
impl GuestConfigurator for FakeConfigurator {
    async fn configure(&self, settings: &GuestSettings) -> hyperk_node::Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.runs.lock().unwrap().push(settings.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            return Err(OrchestratorError::ConfigurationFailed {
                status: "exit status: 2".to_string(),
                output: "fatal: [192.168.122.10]: UNREACHABLE!".to_string(),
            });
        }
        Ok(())
    }
}

/// Port probe with a fixed answer.
pub struct FixedProbe(pub bool);

#[async_trait]
impl PortProbe for FixedProbe {
    async fn probe(&self, _addr: SocketAddr) -> bool {
        self.0
    }
}

// =============================================================================
// APP
// =============================================================================

pub struct Options {
    pub max_jobs: usize,
    pub lease_delay: u32,
    /// Whether the guest management port ever opens
    pub port_open: bool,
    pub configure_delay: Duration,
    pub gated: bool,
    pub fail_configure: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_jobs: 4,
            lease_delay: 2,
            port_open: true,
            configure_delay: Duration::ZERO,
            gated: false,
            fail_configure: false,
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub hv: Arc<MockBackend>,
    pub repo: Arc<MemoryRepository>,
    pub queue: Arc<JobQueue>,
    pub disks: Arc<FakeDisks>,
    pub configurator: Arc<FakeConfigurator>,
    pub gate: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
    workers: Option<JoinHandle<()>>,
}

impl TestApp {
    /// Stop the workers and wait for them, as the daemon does on shutdown.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(workers) = self.workers.take() {
            tokio::time::timeout(Duration::from_secs(5), workers)
                .await
                .expect("workers did not stop")
                .unwrap();
        }
    }
}

pub async fn spawn_app(options: Options) -> TestApp {
    let hv = Arc::new(MockBackend::new().with_lease_delay(options.lease_delay));
    let repo = Arc::new(MemoryRepository::new());
    for (id, username, is_admin) in [(1, "alice", false), (2, "bob", false), (3, "admin", true)] {
        repo.create_user(User { id, username: username.into(), realname: String::new(), is_admin })
            .await
            .unwrap();
    }

    let mut catalog = ImageCatalog::new();
    catalog.insert("ubuntu22", BaseImage {
        path: PathBuf::from("/srv/base/ubuntu22.qcow2"),
        root_password: "ubuntu".to_string(),
    });

    let gate = Arc::new(Semaphore::new(0));
    let disks = Arc::new(FakeDisks::default());
    let configurator = Arc::new(FakeConfigurator {
        runs: Mutex::new(Vec::new()),
        delay: options.configure_delay,
        gate: options.gated.then(|| gate.clone()),
        fail: options.fail_configure,
        running: AtomicUsize::new(0),
        max_running: AtomicUsize::new(0),
    });

    let (queue, receiver) = JobQueue::new();
    let readiness = ReadinessPoller::new(
        hv.clone(),
        Arc::new(FixedProbe(options.port_open)),
        Duration::from_millis(10),
        22,
    );

    let pipeline = Arc::new(ProvisioningPipeline::new(
        PipelineComponents {
            hypervisor: hv.clone(),
            disks: disks.clone(),
            catalog: catalog.clone(),
            template: DomainTemplate::builtin(),
            network: "default".to_string(),
            readiness,
            configurator: configurator.clone(),
            repository: repo.clone(),
        },
        queue.clone(),
    ));

    let controller = Arc::new(InstanceController::new(
        hv.clone(),
        repo.clone(),
        queue.clone(),
        catalog,
        Limits { max_vcpus: 8, max_ram_kib: 16 * 1024 * 1024 },
    ));

    let (shutdown, _) = broadcast::channel(1);
    let workers = tokio::spawn(run_workers(
        queue.clone(),
        receiver,
        pipeline,
        options.max_jobs,
        shutdown.subscribe(),
    ));

    let tokens = HashMap::from([
        (ALICE.to_string(), 1),
        (BOB.to_string(), 2),
        (ADMIN.to_string(), 3),
        ("ghost-token".to_string(), 99),
    ]);
    let repository: Arc<dyn InstanceRepository> = repo.clone();
    let router = build_router(Arc::new(AppState { controller, repository, tokens }));

    TestApp {
        router,
        hv,
        repo,
        queue,
        disks,
        configurator,
        gate,
        shutdown,
        workers: Some(workers),
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Send a request and decode the JSON response (Null for an empty body).
pub async fn send(
    app: &TestApp,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, json)
}

pub fn create_body(name: &str) -> Value {
    serde_json::json!({
        "name": name,
        "os": "ubuntu22",
        "vcpu": 2,
        "ram": 2,
        "ram_unit": "GiB",
        "size": 20,
        "root_password": "s3cret",
    })
}

/// Submit a creation and return its job id.
pub async fn submit(app: &TestApp, token: &str, name: &str) -> String {
    let (status, body) = send(app, "POST", "/api/v1/instances/create", Some(token), Some(create_body(name))).await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
    assert_eq!(body["status"], "accepted");
    body["job_id"].as_str().unwrap().to_string()
}

/// Poll a job until it leaves the queued/processing states.
pub async fn wait_for_job(app: &TestApp, token: &str, job_id: &str) -> Value {
    let uri = format!("/api/v1/jobs/{}", job_id);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, body) = send(app, "GET", &uri, Some(token), None).await;
            assert_eq!(status, StatusCode::OK, "{}", body);
            if body["status"] != "QUEUED" && body["status"] != "PROCESSING" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job did not finish")
}

/// Poll a job until it reports `stage` while processing.
pub async fn wait_for_stage(app: &TestApp, token: &str, job_id: &str, stage: &str) {
    let uri = format!("/api/v1/jobs/{}", job_id);
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (_, body) = send(app, "GET", &uri, Some(token), None).await;
            if body["status"] == "PROCESSING" && body["stage"] == stage {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job never reached stage")
}

/// Create an instance end to end and return its id.
pub async fn provision(app: &TestApp, token: &str, name: &str) -> String {
    let job_id = submit(app, token, name).await;
    let job = wait_for_job(app, token, &job_id).await;
    assert_eq!(job["status"], "COMPLETED", "{}", job);
    job["instance_id"].as_str().unwrap().to_string()
}

//! Provisioning job queue, status registry, and worker pool.
//!
//! Creation requests become [`ProvisioningJob`]s on an unbounded queue. A
//! dispatcher drains the queue and runs each job on its own task, with at
//! most `max_concurrent_jobs` running at once. Every job has a
//! [`JobRecord`] that callers can poll; records and jobs are in memory only.
//! Finished records are kept for a retention period and swept whenever a new
//! job is queued.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use hyperk_hypervisor::RamUnit;

use crate::error::{OrchestratorError, Result};
use crate::pipeline::ProvisioningPipeline;

pub type JobId = Uuid;

/// How long finished job records stay visible by default.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// CANCELLATION
// =============================================================================

/// Receiving side of a job's cancel flag.
#[derive(Debug, Clone)]
pub struct CancelToken(watch::Receiver<bool>);

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Dropping the sender leaves the flag false forever.
        drop(tx);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once the job is cancelled. Never resolves if the sender is
    /// gone without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Error out if the job has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        Ok(())
    }
}

/// Create a linked cancel sender and token.
pub fn cancel_pair() -> (watch::Sender<bool>, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (tx, CancelToken(rx))
}

// =============================================================================
// JOBS
// =============================================================================

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Materialize,
    Define,
    Start,
    Readiness,
    Configure,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Queued => "queued",
            Stage::Materialize => "materialize",
            Stage::Define => "define",
            Stage::Start => "start",
            Stage::Readiness => "readiness",
            Stage::Configure => "configure",
            Stage::Persist => "persist",
        };
        f.write_str(s)
    }
}

/// One creation request, validated and ready to run.
#[derive(Clone)]
pub struct ProvisioningJob {
    pub job_id: JobId,
    pub name: String,
    pub os: String,
    pub vcpu: u32,
    pub ram: u64,
    pub ram_unit: RamUnit,
    pub disk_size_gib: u64,
    pub root_password: String,
    pub hostname: Option<String>,
    pub owner: i64,
}

impl ProvisioningJob {
    /// Guest hostname; defaults to the instance name.
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Debug for ProvisioningJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningJob")
            .field("job_id", &self.job_id)
            .field("name", &self.name)
            .field("os", &self.os)
            .field("vcpu", &self.vcpu)
            .field("ram", &self.ram)
            .field("ram_unit", &self.ram_unit)
            .field("disk_size_gib", &self.disk_size_gib)
            .field("root_password", &"<redacted>")
            .field("hostname", &self.hostname)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Observable job status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Processing { stage: Stage },
    Completed { instance_id: Uuid },
    Failed { stage: Stage, error: String },
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing { .. })
    }
}

/// Status record of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub name: String,
    pub owner: i64,
    #[serde(flatten)]
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

struct QueuedJob {
    job: ProvisioningJob,
    cancel: CancelToken,
}

/// Receiving end of the job queue, consumed by [`run_workers`].
pub struct JobReceiver(mpsc::UnboundedReceiver<QueuedJob>);

// =============================================================================
// QUEUE
// =============================================================================

/// Job queue and status registry.
pub struct JobQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    records: RwLock<HashMap<JobId, JobRecord>>,
    cancels: RwLock<HashMap<JobId, watch::Sender<bool>>>,
    retention: Duration,
}

impl JobQueue {
    pub fn new() -> (Arc<Self>, JobReceiver) {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }

    /// Queue whose finished records are dropped once older than `retention`.
    pub fn with_retention(retention: Duration) -> (Arc<Self>, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            tx,
            records: RwLock::new(HashMap::new()),
            cancels: RwLock::new(HashMap::new()),
            retention,
        });
        (queue, JobReceiver(rx))
    }

    /// Queue a job. Fails if another active job targets the same name.
    pub fn enqueue(&self, job: ProvisioningJob) -> Result<JobId> {
        let job_id = job.job_id;
        let (cancel_tx, cancel) = cancel_pair();

        {
            let mut records = self.records.write().map_err(|_| {
                OrchestratorError::Internal("Lock poisoned".to_string())
            })?;

            if records.values().any(|r| r.name == job.name && r.status.is_active()) {
                return Err(OrchestratorError::InvalidRequest(
                    format!("An instance named {} is already being created", job.name)
                ));
            }

            let now = Utc::now();
            let before = records.len();
            records.retain(|_, r| r.status.is_active() || !self.expired(r, now));
            if records.len() < before {
                debug!(swept = before - records.len(), "Expired job records removed");
            }

            records.insert(job_id, JobRecord {
                job_id,
                name: job.name.clone(),
                owner: job.owner,
                status: JobStatus::Queued,
                submitted_at: now,
                updated_at: now,
            });
        }

        if let Ok(mut cancels) = self.cancels.write() {
            cancels.insert(job_id, cancel_tx);
        }

        if self.tx.send(QueuedJob { job, cancel }).is_err() {
            self.fail(job_id, Stage::Queued, "Job queue is closed");
            return Err(OrchestratorError::Internal("Job queue is closed".to_string()));
        }

        debug!(job_id = %job_id, "Job queued");
        Ok(job_id)
    }

    pub fn get(&self, job_id: JobId) -> Option<JobRecord> {
        self.records.read().ok()?.get(&job_id).cloned()
    }

    /// Number of queued or running jobs.
    pub fn active_count(&self) -> usize {
        self.records.read()
            .map(|r| r.values().filter(|r| r.status.is_active()).count())
            .unwrap_or(0)
    }

    pub fn set_stage(&self, job_id: JobId, stage: Stage) {
        self.update(job_id, JobStatus::Processing { stage });
    }

    pub fn complete(&self, job_id: JobId, instance_id: Uuid) {
        self.update(job_id, JobStatus::Completed { instance_id });
        self.forget_cancel(job_id);
    }

    pub fn fail(&self, job_id: JobId, stage: Stage, error: impl Into<String>) {
        self.update(job_id, JobStatus::Failed { stage, error: error.into() });
        self.forget_cancel(job_id);
    }

    /// Request cancellation of a queued or running job.
    pub fn cancel(&self, job_id: JobId) -> bool {
        let cancels = match self.cancels.read() {
            Ok(c) => c,
            Err(_) => return false,
        };
        match cancels.get(&job_id) {
            Some(tx) => {
                info!(job_id = %job_id, "Cancelling job");
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Cancel every job that has not finished.
    pub fn cancel_all(&self) {
        if let Ok(cancels) = self.cancels.read() {
            for tx in cancels.values() {
                tx.send_replace(true);
            }
            if !cancels.is_empty() {
                info!(count = cancels.len(), "Cancelled outstanding jobs");
            }
        }
    }

    fn expired(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        match (now - record.updated_at).to_std() {
            Ok(age) => age >= self.retention,
            Err(_) => false,
        }
    }

    fn update(&self, job_id: JobId, status: JobStatus) {
        if let Ok(mut records) = self.records.write() {
            if let Some(record) = records.get_mut(&job_id) {
                record.status = status;
                record.updated_at = Utc::now();
            }
        }
    }

    fn forget_cancel(&self, job_id: JobId) {
        if let Ok(mut cancels) = self.cancels.write() {
            cancels.remove(&job_id);
        }
    }
}

// =============================================================================
// WORKERS
// =============================================================================

/// Drain the queue, running at most `max_concurrent` jobs at once.
///
/// Returns after `shutdown` fires and every started job has finished. Jobs
/// still waiting in the queue at that point are marked failed.
pub async fn run_workers(
    queue: Arc<JobQueue>,
    receiver: JobReceiver,
    pipeline: Arc<ProvisioningPipeline>,
    max_concurrent: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let JobReceiver(mut rx) = receiver;
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut running = JoinSet::new();

    info!(max_concurrent, "Provisioning workers started");

    loop {
        let next = tokio::select! {
            next = rx.recv() => next,
            _ = shutdown.recv() => break,
        };
        let Some(QueuedJob { job, cancel }) = next else { break };

        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
            _ = shutdown.recv() => {
                queue.fail(job.job_id, Stage::Queued, OrchestratorError::Cancelled.to_string());
                break;
            }
        };

        let pipeline = pipeline.clone();
        running.spawn(async move {
            pipeline.run(job, cancel).await;
            drop(permit);
        });

        // Reap finished tasks so the set does not grow without bound.
        while let Some(joined) = running.try_join_next() {
            if let Err(e) = joined {
                warn!(error = %e, "Provisioning task panicked");
            }
        }
    }

    rx.close();
    while let Ok(QueuedJob { job, .. }) = rx.try_recv() {
        queue.fail(job.job_id, Stage::Queued, OrchestratorError::Cancelled.to_string());
    }

    queue.cancel_all();
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Provisioning task panicked");
        }
    }

    info!("Provisioning workers stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str) -> ProvisioningJob {
        ProvisioningJob {
            job_id: Uuid::new_v4(),
            name: name.to_string(),
            os: "ubuntu22".to_string(),
            vcpu: 1,
            ram: 1,
            ram_unit: RamUnit::GiB,
            disk_size_gib: 10,
            root_password: "hunter2".to_string(),
            hostname: None,
            owner: 1,
        }
    }

    #[test]
    fn test_enqueue_records_queued() {
        let (queue, _rx) = JobQueue::new();
        let id = queue.enqueue(job("a")).unwrap();

        let record = queue.get(id).unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.name, "a");
        assert_eq!(queue.active_count(), 1);
    }

    #[test]
    fn test_duplicate_active_name_rejected() {
        let (queue, _rx) = JobQueue::new();
        let first = queue.enqueue(job("dup")).unwrap();

        assert!(matches!(
            queue.enqueue(job("dup")),
            Err(OrchestratorError::InvalidRequest(_))
        ));

        // Once the first job is done the name is free again
        queue.fail(first, Stage::Materialize, "disk full");
        assert!(queue.enqueue(job("dup")).is_ok());
    }

    #[test]
    fn test_status_transitions() {
        let (queue, _rx) = JobQueue::new();
        let id = queue.enqueue(job("b")).unwrap();

        queue.set_stage(id, Stage::Readiness);
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Processing { stage: Stage::Readiness });

        let instance = Uuid::new_v4();
        queue.complete(id, instance);
        assert_eq!(queue.get(id).unwrap().status, JobStatus::Completed { instance_id: instance });
        assert!(!queue.cancel(id));
        assert_eq!(queue.active_count(), 0);
    }

    #[test]
    fn test_finished_records_expire_on_next_enqueue() {
        let (queue, _rx) = JobQueue::with_retention(Duration::ZERO);
        let done = queue.enqueue(job("old-1")).unwrap();
        let failed = queue.enqueue(job("old-2")).unwrap();
        let running = queue.enqueue(job("busy")).unwrap();
        queue.complete(done, Uuid::new_v4());
        queue.fail(failed, Stage::Define, "rejected");
        queue.set_stage(running, Stage::Start);

        let fresh = queue.enqueue(job("new")).unwrap();

        assert!(queue.get(done).is_none());
        assert!(queue.get(failed).is_none());
        assert!(queue.get(running).is_some());
        assert!(queue.get(fresh).is_some());
    }

    #[test]
    fn test_finished_records_kept_within_retention() {
        let (queue, _rx) = JobQueue::new();
        let done = queue.enqueue(job("a")).unwrap();
        queue.complete(done, Uuid::new_v4());
        queue.enqueue(job("b")).unwrap();
        assert!(queue.get(done).is_some());
    }

    #[test]
    fn test_record_wire_form() {
        let (queue, _rx) = JobQueue::new();
        let id = queue.enqueue(job("c")).unwrap();
        queue.fail(id, Stage::Configure, "exit status 2");

        let json = serde_json::to_value(queue.get(id).unwrap()).unwrap();
        assert_eq!(json["status"], "FAILED");
        assert_eq!(json["stage"], "configure");
        assert_eq!(json["error"], "exit status 2");
        assert_eq!(json["name"], "c");
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", job("d"));
        assert!(!rendered.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_cancel_token() {
        let (queue, _rx) = JobQueue::new();
        let (tx, token) = cancel_pair();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(token.check(), Err(OrchestratorError::Cancelled)));

        // Unknown jobs cannot be cancelled
        assert!(!queue.cancel(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_never_token_does_not_resolve() {
        let token = CancelToken::never();
        let result = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(result.is_err());
    }
}

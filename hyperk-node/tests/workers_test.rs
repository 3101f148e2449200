//! Integration tests for the provisioning worker pool
//!
//! Concurrency limits and shutdown behaviour of queued and in-flight jobs.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{send, spawn_app, submit, wait_for_job, wait_for_stage, Options, ALICE};
use hyperk_node::repository::InstanceRepository;

#[tokio::test]
async fn test_concurrent_jobs_are_bounded() {
    let app = spawn_app(Options {
        max_jobs: 2,
        configure_delay: Duration::from_millis(50),
        ..Default::default()
    })
    .await;

    let mut jobs = Vec::new();
    for i in 0..5 {
        jobs.push(submit(&app, ALICE, &format!("batch-{}", i)).await);
    }
    for job_id in &jobs {
        let job = wait_for_job(&app, ALICE, job_id).await;
        assert_eq!(job["status"], "COMPLETED", "{}", job);
    }

    assert_eq!(app.configurator.runs.lock().unwrap().len(), 5);
    assert!(app.configurator.max_running.load(Ordering::SeqCst) <= 2);
    assert_eq!(app.repo.list_all_instances().await.unwrap().len(), 5);
    assert_eq!(app.hv.domain_count(), 5);
}

#[tokio::test]
async fn test_generated_macs_are_not_deduplicated() {
    // Every domain gets a fresh random MAC with the QEMU prefix; collisions
    // with existing domains are not checked.
    let app = spawn_app(Options::default()).await;
    let first = submit(&app, ALICE, "mac-1").await;
    let second = submit(&app, ALICE, "mac-2").await;

    for job_id in [&first, &second] {
        let job = wait_for_job(&app, ALICE, job_id).await;
        let id = job["instance_id"].as_str().unwrap().parse().unwrap();
        let mac = app.hv.mac_of(id).unwrap();
        assert!(mac.starts_with("52:54:00:"), "{}", mac);
    }
}

#[tokio::test]
async fn test_shutdown_cancels_running_and_queued_jobs() {
    // Guest port never opens, so the first job waits in readiness forever
    let mut app = spawn_app(Options {
        max_jobs: 1,
        port_open: false,
        ..Default::default()
    })
    .await;

    let running = submit(&app, ALICE, "stuck-1").await;
    wait_for_stage(&app, ALICE, &running, "readiness").await;
    let queued = submit(&app, ALICE, "stuck-2").await;

    app.shutdown().await;

    let (_, job) = send(&app, "GET", &format!("/api/v1/jobs/{}", running), Some(ALICE), None).await;
    assert_eq!(job["status"], "FAILED");
    assert_eq!(job["stage"], "readiness");
    assert_eq!(job["error"], "Job cancelled");

    let (_, job) = send(&app, "GET", &format!("/api/v1/jobs/{}", queued), Some(ALICE), None).await;
    assert_eq!(job["status"], "FAILED");
    assert_eq!(job["stage"], "queued");

    assert_eq!(app.queue.active_count(), 0);
    assert!(app.repo.list_all_instances().await.unwrap().is_empty());
    // Only the first job got as far as defining a domain
    assert_eq!(app.hv.domain_count(), 1);
}

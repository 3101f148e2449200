//! # hyperk Node Daemon
//!
//! Provisions virtual machines from base images on a single libvirt host and
//! manages their power state for their owners.
//!
//! ## Components
//! - [`lifecycle::InstanceController`]: list, inspect, rename, power control
//!   and creation requests
//! - [`jobs`]: creation queue, job status registry and bounded worker pool
//! - [`pipeline::ProvisioningPipeline`]: disk, domain, boot, readiness,
//!   guest configuration and record, in that order
//! - [`http_server`]: REST API under `/api/v1`

pub mod cli;
pub mod config;
pub mod configurator;
pub mod error;
pub mod http_server;
pub mod jobs;
pub mod lifecycle;
pub mod pipeline;
pub mod readiness;
pub mod repository;
pub mod server;

pub use error::{OrchestratorError, Result};
pub use lifecycle::{Caller, CreateInstanceRequest, InstanceController, JobAccepted, Limits, TargetState};

//! Error types for the orchestrator and their HTTP mapping.

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use hyperk_hypervisor::{HypervisorError, PowerState};

use crate::lifecycle::TargetState;

/// Errors surfaced by the lifecycle controller and the creation pipeline.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Hypervisor unreachable or connection closed.
    #[error("Hypervisor connection error: {0}")]
    Connection(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Write attempted on a read-only hypervisor connection.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Caller is neither the owner nor an admin.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid disk size: {0}")]
    InvalidSize(String),

    #[error("Unknown base image: {0}")]
    UnknownImage(String),

    #[error("Cannot {target} an instance that is {from}")]
    InvalidTransition {
        from: PowerState,
        target: TargetState,
    },

    #[error("Unknown state: {0}")]
    UnknownState(String),

    /// A hypervisor call failed (start, destroy, query).
    #[error("Hypervisor operation failed: {0}")]
    Hypervisor(String),

    /// Disk or domain creation failed.
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Guest configuration failed ({status}): {output}")]
    ConfigurationFailed { status: String, output: String },

    #[error("Timed out waiting for {0}")]
    ReadinessTimeout(String),

    #[error("Job cancelled")]
    Cancelled,

    /// Cancellation requested for a job that already finished.
    #[error("Job already finished: {0}")]
    JobFinished(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl From<HypervisorError> for OrchestratorError {
    fn from(err: HypervisorError) -> Self {
        match err {
            HypervisorError::ConnectionFailed(msg) => OrchestratorError::Connection(msg),
            HypervisorError::DomainNotFound(msg) => OrchestratorError::NotFound(msg),
            HypervisorError::PermissionDenied(msg) => OrchestratorError::PermissionDenied(msg),
            HypervisorError::UnknownImage(msg) => OrchestratorError::UnknownImage(msg),
            HypervisorError::InvalidSize(msg) => OrchestratorError::InvalidSize(msg),
            HypervisorError::InvalidDescriptor(msg) | HypervisorError::ProvisioningFailed(msg) => {
                OrchestratorError::Provisioning(msg)
            }
            HypervisorError::OperationFailed(msg) | HypervisorError::QueryFailed(msg) => {
                OrchestratorError::Hypervisor(msg)
            }
            HypervisorError::InvalidConfig(msg) | HypervisorError::Internal(msg) => {
                OrchestratorError::Internal(msg)
            }
        }
    }
}

impl From<JsonRejection> for OrchestratorError {
    fn from(rejection: JsonRejection) -> Self {
        OrchestratorError::InvalidRequest(rejection.body_text())
    }
}

impl From<PathRejection> for OrchestratorError {
    fn from(rejection: PathRejection) -> Self {
        OrchestratorError::InvalidRequest(rejection.body_text())
    }
}

impl OrchestratorError {
    /// Short machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Connection(_) => "hypervisor_unavailable",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::PermissionDenied(_) => "permission_denied",
            OrchestratorError::Unauthorized(_) => "unauthorized",
            OrchestratorError::InvalidRequest(_) => "invalid_request",
            OrchestratorError::InvalidSize(_) => "invalid_size",
            OrchestratorError::UnknownImage(_) => "unknown_image",
            OrchestratorError::InvalidTransition { .. } => "invalid_transition",
            OrchestratorError::UnknownState(_) => "unknown_state",
            OrchestratorError::Hypervisor(_) => "hypervisor_error",
            OrchestratorError::Provisioning(_) => "provisioning_failed",
            OrchestratorError::ConfigurationFailed { .. } => "configuration_failed",
            OrchestratorError::ReadinessTimeout(_) => "readiness_timeout",
            OrchestratorError::Cancelled => "cancelled",
            OrchestratorError::JobFinished(_) => "job_finished",
            OrchestratorError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            OrchestratorError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            OrchestratorError::InvalidRequest(_)
            | OrchestratorError::InvalidSize(_)
            | OrchestratorError::UnknownImage(_)
            | OrchestratorError::UnknownState(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::InvalidTransition { .. } | OrchestratorError::JobFinished(_) => {
                StatusCode::CONFLICT
            }
            OrchestratorError::Connection(_) | OrchestratorError::Hypervisor(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::Provisioning(_)
            | OrchestratorError::ConfigurationFailed { .. }
            | OrchestratorError::ReadinessTimeout(_)
            | OrchestratorError::Cancelled
            | OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON error body returned by the REST API.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ApiError::new(self.code(), &self.to_string());
        (status, Json(body)).into_response()
    }
}

//! Error types for the hypervisor abstraction layer.

use thiserror::Error;

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor, or the connection was closed.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// Domain was not found by name or UUID.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// A write operation was attempted on a read-only connection.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The hypervisor rejected a domain descriptor.
    #[error("Invalid domain descriptor: {0}")]
    InvalidDescriptor(String),

    /// Base image key is not in the catalogue.
    #[error("Unknown base image: {0}")]
    UnknownImage(String),

    /// Requested disk size is smaller than the base image.
    #[error("Invalid disk size: {0}")]
    InvalidSize(String),

    /// Disk materialization (copy or resize) failed.
    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// A lifecycle operation (start, destroy, managed-save) failed.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// Query failed.
    #[error("Failed to query: {0}")]
    QueryFailed(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

//! # hyperk Hypervisor
//!
//! Hypervisor abstraction layer for provisioning and controlling virtual
//! machines on a single libvirt host.
//!
//! This crate provides:
//! - **Hypervisor trait** over one shared connection, with a libvirt/QEMU
//!   backend (feature `libvirt`) and an in-memory mock
//! - **Domain descriptors** rendered from a template with a generated MAC
//! - **Image provisioning** from a catalogue of base images via `qemu-img`
//! - **State translation** from raw domain state to user-facing views
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Hypervisor Trait               │
//! │ (lookup, define, start, destroy, save)  │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │  LibvirtBackend   │     │    MockBackend    │
//! │   (via libvirt)   │     │    (in memory)    │
//! └───────────────────┘     └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hyperk_hypervisor::{translate, DomainTemplate, DomainXmlBuilder, Hypervisor, MockBackend, RamUnit};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MockBackend::new();
//!     let template = DomainTemplate::builtin();
//!
//!     let xml = DomainXmlBuilder::new(&template)
//!         .name("my-vm")
//!         .vcpu(2)
//!         .memory(2, RamUnit::GiB)
//!         .disk_path("/var/lib/libvirt/images/my-vm")
//!         .build();
//!
//!     let domain = backend.define_domain(&xml).await.unwrap();
//!     backend.start(domain.id).await.unwrap();
//!     let view = translate(&backend, &domain).await.unwrap();
//! }
//! ```

pub mod error;
pub mod traits;
pub mod types;
pub mod mock;
pub mod libvirt;
pub mod storage;
pub mod view;
pub mod xml;

pub use error::HypervisorError;
pub use traits::{Hypervisor, HypervisorCapabilities};
pub use types::*;
pub use mock::MockBackend;
pub use storage::{BaseImage, DiskInfo, DiskProvisioner, ImageCatalog, ImageProvisioner, DEFAULT_IMAGES_DIR};
pub use view::{translate, DomainStatus, InstanceView, PowerState};
pub use xml::{DomainTemplate, DomainXmlBuilder, MacAddress};

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;

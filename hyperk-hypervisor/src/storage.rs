//! Instance disk provisioning from base images.
//!
//! New instance disks are full copies of a catalogue base image, grown to the
//! requested size with `qemu-img resize`. All calls block; run them off the
//! async executor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};

/// Default directory for instance disks.
pub const DEFAULT_IMAGES_DIR: &str = "/var/lib/libvirt/images";

const GIB: u64 = 1024 * 1024 * 1024;

/// A template disk image new instances are cloned from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseImage {
    /// Path to the template image
    pub path: PathBuf,
    /// Root password baked into the template
    pub root_password: String,
}

/// Base images keyed by OS key (e.g. `ubuntu22`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageCatalog(BTreeMap<String, BaseImage>);

impl ImageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, image: BaseImage) {
        self.0.insert(key.into(), image);
    }

    pub fn get(&self, key: &str) -> Option<&BaseImage> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Information about a disk image.
#[derive(Debug, Clone)]
pub struct DiskInfo {
    /// Disk format (qcow2, raw, etc.)
    pub format: String,
    /// Virtual size in bytes
    pub virtual_size: u64,
    /// Actual size on disk in bytes
    pub actual_size: u64,
}

impl DiskInfo {
    /// Virtual size in GiB, rounded up.
    pub fn virtual_size_gib(&self) -> u64 {
        self.virtual_size.div_ceil(GIB)
    }
}

/// Produces the disk of a new instance.
///
/// Implementations block; callers run them on a blocking thread.
pub trait DiskProvisioner: Send + Sync {
    /// Create the disk for `target_name` from base image `key`, sized
    /// `size_gib`, and return its path.
    fn materialize(&self, key: &str, target_name: &str, size_gib: u64) -> Result<PathBuf>;
}

/// Materializes instance disks from the image catalogue.
#[derive(Debug, Clone)]
pub struct ImageProvisioner {
    images_dir: PathBuf,
    qemu_img_path: PathBuf,
    catalog: ImageCatalog,
}

impl ImageProvisioner {
    pub fn new(images_dir: impl Into<PathBuf>, catalog: ImageCatalog) -> Self {
        Self {
            images_dir: images_dir.into(),
            qemu_img_path: PathBuf::from("qemu-img"),
            catalog,
        }
    }

    /// Set the qemu-img binary path.
    pub fn with_qemu_img(mut self, path: impl Into<PathBuf>) -> Self {
        self.qemu_img_path = path.into();
        self
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn catalog(&self) -> &ImageCatalog {
        &self.catalog
    }

    /// Disk path for an instance named `target_name`.
    pub fn target_path(&self, target_name: &str) -> Result<PathBuf> {
        if target_name.is_empty()
            || target_name == "."
            || target_name == ".."
            || target_name.contains(['/', '\\'])
        {
            return Err(HypervisorError::ProvisioningFailed(
                format!("Invalid disk name: {:?}", target_name)
            ));
        }
        Ok(self.images_dir.join(target_name))
    }

    /// Copy base image `key` to the instance path and grow it to `size_gib`.
    ///
    /// The size is checked against the base image before anything is written.
    /// An existing target file is never overwritten. Nothing is cleaned up on
    /// failure.
    #[instrument(skip(self), fields(os = %key, name = %target_name, size_gib = size_gib))]
    pub fn materialize(&self, key: &str, target_name: &str, size_gib: u64) -> Result<PathBuf> {
        let base = self.catalog.get(key)
            .ok_or_else(|| HypervisorError::UnknownImage(key.to_string()))?;
        let target = self.target_path(target_name)?;

        let base_info = self.image_info(&base.path)?;
        if size_gib.saturating_mul(GIB) < base_info.virtual_size {
            return Err(HypervisorError::InvalidSize(format!(
                "requested {} GiB is smaller than base image {} ({} GiB)",
                size_gib,
                key,
                base_info.virtual_size_gib()
            )));
        }

        if target.exists() {
            return Err(HypervisorError::ProvisioningFailed(
                format!("Disk image already exists: {}", target.display())
            ));
        }

        if !self.images_dir.exists() {
            std::fs::create_dir_all(&self.images_dir)
                .map_err(|e| HypervisorError::ProvisioningFailed(
                    format!("Failed to create images directory: {}", e)
                ))?;
        }

        info!(base = %base.path.display(), target = %target.display(), "Copying base image");
        std::fs::copy(&base.path, &target)
            .map_err(|e| HypervisorError::ProvisioningFailed(format!(
                "Failed to copy {} to {}: {}",
                base.path.display(),
                target.display(),
                e
            )))?;

        self.resize(&target, size_gib)?;

        info!(path = %target.display(), "Instance disk ready");
        Ok(target)
    }

    /// Resize a disk image.
    #[instrument(skip(self), fields(path = %path.display(), new_size_gib = %new_size_gib))]
    pub fn resize(&self, path: &Path, new_size_gib: u64) -> Result<()> {
        let size = format!("{}G", new_size_gib);

        let output = Command::new(&self.qemu_img_path)
            .arg("resize")
            .arg(path)
            .arg(&size)
            .output()
            .map_err(|e| HypervisorError::ProvisioningFailed(
                format!("Failed to execute qemu-img: {}", e)
            ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::ProvisioningFailed(
                format!("qemu-img resize failed: {}", stderr.trim())
            ));
        }

        info!(size = %size, "Disk image resized");
        Ok(())
    }

    /// Get information about a disk image.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn image_info(&self, path: &Path) -> Result<DiskInfo> {
        debug!("Getting disk info");

        if !path.exists() {
            return Err(HypervisorError::ProvisioningFailed(
                format!("Disk image does not exist: {}", path.display())
            ));
        }

        let output = Command::new(&self.qemu_img_path)
            .args(["info", "--output=json"])
            .arg(path)
            .output()
            .map_err(|e| HypervisorError::ProvisioningFailed(
                format!("Failed to execute qemu-img: {}", e)
            ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::ProvisioningFailed(
                format!("qemu-img info failed: {}", stderr.trim())
            ));
        }

        let info: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| HypervisorError::ProvisioningFailed(
                format!("Failed to parse qemu-img output: {}", e)
            ))?;

        Ok(DiskInfo {
            format: info["format"].as_str().unwrap_or("unknown").to_string(),
            virtual_size: info["virtual-size"].as_u64().unwrap_or(0),
            actual_size: info["actual-size"].as_u64().unwrap_or(0),
        })
    }

    /// Check if qemu-img is available; returns its version line.
    pub fn check_qemu_img(&self) -> Result<String> {
        let output = Command::new(&self.qemu_img_path)
            .arg("--version")
            .output()
            .map_err(|e| HypervisorError::InvalidConfig(
                format!("qemu-img not found or not executable: {}", e)
            ))?;

        if !output.status.success() {
            return Err(HypervisorError::InvalidConfig(
                "qemu-img version check failed".to_string()
            ));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        Ok(version.lines().next().unwrap_or("unknown").to_string())
    }
}

impl DiskProvisioner for ImageProvisioner {
    fn materialize(&self, key: &str, target_name: &str, size_gib: u64) -> Result<PathBuf> {
        ImageProvisioner::materialize(self, key, target_name, size_gib)
    }
}

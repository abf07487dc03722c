use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

use crate::model::VolumeFormat;
use crate::Result;

/// Disk image manipulation (qemu-img style).
#[async_trait]
pub trait DiskToolClient: Send + Sync {
    /// Full block-level conversion of `src` into a new image at `dst`.
    async fn convert(
        &self,
        src_format: VolumeFormat,
        dst_format: VolumeFormat,
        src: &Path,
        dst: &Path,
    ) -> Result<()>;

    /// Like `convert`, but reads the state of an internal snapshot of `src`.
    async fn convert_snapshot(
        &self,
        src_format: VolumeFormat,
        dst_format: VolumeFormat,
        src: &Path,
        snapshot: &str,
        dst: &Path,
    ) -> Result<()>;

    /// Create `dst` as a copy-on-write overlay backed by `backing`.
    async fn clone_from_backing(
        &self,
        backing_format: VolumeFormat,
        format: VolumeFormat,
        backing: &Path,
        dst: &Path,
    ) -> Result<()>;

    async fn resize(&self, path: &Path, size_gb: u64) -> Result<()>;
    async fn snapshot_create(&self, path: &Path, name: &str) -> Result<()>;
    async fn snapshot_delete(&self, path: &Path, name: &str) -> Result<()>;
}

/// Offline guest disk mutation (virt-customize style).
#[async_trait]
pub trait GuestCustomizeClient: Send + Sync {
    async fn validate_disk_path(&self, path: &Path) -> Result<()>;
    async fn reset_passwords(
        &self,
        path: &Path,
        passwords: &BTreeMap<String, String>,
    ) -> Result<()>;
}

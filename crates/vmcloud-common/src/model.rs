//! Resource records tracked by the control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::hypervisor::DomainState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    Paused,
    Failed,
    Terminated,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Paused => "paused",
            InstanceState::Failed => "failed",
            InstanceState::Terminated => "terminated",
        }
    }

    /// Map the hypervisor's native vocabulary onto instance states.
    /// Anything without a direct counterpart is reported as pending.
    pub fn from_domain_state(state: DomainState) -> Self {
        match state {
            DomainState::Running => InstanceState::Running,
            DomainState::ShutOff => InstanceState::Stopped,
            DomainState::ShuttingDown => InstanceState::Stopping,
            DomainState::Paused => InstanceState::Paused,
            DomainState::Crashed => InstanceState::Failed,
            _ => InstanceState::Pending,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub node: String,
    pub state: InstanceState,
    pub image_id: Option<String>,
    pub volume_id: Option<String>,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub key_name: Option<String>,
    /// Opaque hypervisor identity of the backing domain.
    pub domain_uuid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Available,
    InUse,
    Attaching,
    Detaching,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    #[default]
    Qcow2,
    Raw,
}

impl VolumeFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeFormat::Qcow2 => "qcow2",
            VolumeFormat::Raw => "raw",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// File name a resource identity maps to inside its pool.
    pub fn file_name(&self, id: &str) -> String {
        format!("{id}.{}", self.extension())
    }
}

impl fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    pub id: String,
    pub node: String,
    pub pool: String,
    pub path: PathBuf,
    /// Size the caller asked for.
    pub size_gb: u64,
    /// Virtual capacity reported by the hypervisor after materialization.
    pub capacity_bytes: u64,
    pub format: VolumeFormat,
    pub state: VolumeState,
    pub attached_to: Option<String>,
    pub device: Option<String>,
    pub source_image_id: Option<String>,
    pub source_snapshot_id: Option<String>,
    pub backing_file: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

impl Volume {
    pub fn file_name(&self) -> String {
        self.format.file_name(&self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub node: String,
    pub pool: String,
    pub path: PathBuf,
    pub size_gb: u64,
    pub format: VolumeFormat,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Image {
    /// Pool volume name backing this image.
    pub fn volume_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.format.file_name(&self.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub node: String,
    pub pool: String,
    pub path: PathBuf,
    pub format: VolumeFormat,
    pub state: SnapshotState,
    pub size_gb: u64,
    pub description: Option<String>,
    pub copied_from: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyPair {
    pub id: String,
    pub name: String,
    pub fingerprint: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateStatus {
    Pending,
    Available,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub node: String,
    pub pool: String,
    pub volume_name: String,
    pub os_type: String,
    pub os_version: Option<String>,
    pub arch: String,
    pub features: BTreeMap<String, bool>,
    pub size_gb: u64,
    pub status: TemplateStatus,
    pub source_url: Option<String>,
    pub download_task_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

/// Identity of a download destination, used to deduplicate transfers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationKey {
    pub node: String,
    pub pool: String,
    pub volume: String,
}

impl DestinationKey {
    pub fn new(node: impl Into<String>, pool: impl Into<String>, volume: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            pool: pool.into(),
            volume: volume.into(),
        }
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.pool, self.volume)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadTask {
    pub id: String,
    pub destination: DestinationKey,
    pub url: String,
    pub status: DownloadStatus,
    pub error: Option<String>,
    pub bytes: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_state_mapping() {
        let cases = [
            (DomainState::Running, InstanceState::Running),
            (DomainState::ShutOff, InstanceState::Stopped),
            (DomainState::ShuttingDown, InstanceState::Stopping),
            (DomainState::Paused, InstanceState::Paused),
            (DomainState::Crashed, InstanceState::Failed),
            (DomainState::Blocked, InstanceState::Pending),
            (DomainState::PmSuspended, InstanceState::Pending),
            (DomainState::NoState, InstanceState::Pending),
        ];
        for (domain, expected) in cases {
            assert_eq!(InstanceState::from_domain_state(domain), expected);
        }
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&VolumeState::InUse).unwrap();
        assert_eq!(json, "\"in-use\"");

        let json = serde_json::to_string(&InstanceState::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");

        assert_eq!(VolumeFormat::Qcow2.file_name("vol-1"), "vol-1.qcow2");
        assert_eq!(VolumeFormat::Raw.file_name("vol-1"), "vol-1.raw");
    }
}

//! Control plane for a small VM cloud: volumes, instances, images, snapshots,
//! templates and key pairs on top of a per-node hypervisor binding.

// Re-export common types so consumers need a single dependency
pub use vmcloud_common as common;
pub use vmcloud_common::{CloudError, Result};

pub mod cloud_init;
pub mod command;
pub mod config;
pub mod connection;
pub mod context;
pub mod customize;
pub mod disk_tool;
pub mod download;
pub mod image;
pub mod instance;
pub mod keypair;
pub mod password;
pub mod persistence;
pub mod provisioning;
pub mod snapshot;
pub mod template;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{CloudConfig, NetworkConfig, NodeConfig};
pub use connection::{ConnectionManager, Connector};
pub use context::{CloudContext, Collaborators};
pub use download::{DownloadManager, Fetcher, HttpFetcher, InlineRunner, TaskRunner, TokioRunner};
pub use image::{ImageService, RegisterImageRequest};
pub use instance::{
    BatchOutcome, InstanceAttribute, InstanceManager, InstanceStateChange, ModifyInstanceAttributes,
    ModifyReport, RunInstanceRequest,
};
pub use keypair::{GeneratedKeyPair, KeyPairService};
pub use password::{PasswordResetCoordinator, PasswordResetOutcome, PasswordResetRequest, ResetPath};
pub use persistence::{MemoryStore, Record, Repository};
pub use provisioning::{choose_strategy, MaterializeStrategy, ProvisioningEngine};
pub use snapshot::SnapshotService;
pub use template::{RegisterTemplateRequest, TemplateService, TemplateUpdate};

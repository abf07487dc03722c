// Re-export dependencies used in public interfaces of common types

use thiserror::Error;

pub use serde::{Deserialize, Serialize};
pub use uuid;

pub mod hypervisor;
pub mod model;
pub mod store;
pub mod tools;

pub use hypervisor::{
    CloudInitSeed, CommandOutput, DomainDisk, DomainInfo, DomainSpec, DomainState,
    HypervisorClient, NetworkAttachment, NetworkKind, StoragePoolInfo, VolumeInfo, VolumeSpec,
    GIB,
};
pub use model::*;
pub use store::{Filter, ResourceKind, Store, StoredDocument};
pub use tools::{DiskToolClient, GuestCustomizeClient};

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Invalid State: {0}")]
    InvalidState(String),

    #[error("Invalid Argument: {0}")]
    InvalidArgument(String),

    #[error("Storage Pool Unavailable: {0}")]
    PoolUnavailable(String),

    #[error("Capability Unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Tool Failure: {0}")]
    ToolFailure(String),

    #[error("Partial Batch Failure: {failed} of {total} operations failed")]
    PartialBatchFailure { failed: usize, total: usize },

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    pub fn tool(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        CloudError::ToolFailure(format!("{context}: {err}"))
    }
}

impl From<serde_json::Error> for CloudError {
    fn from(err: serde_json::Error) -> Self {
        CloudError::Storage(err.to_string())
    }
}

// Define the primary Result type for control plane operations
pub type Result<T> = std::result::Result<T, CloudError>;

/// Generate an identity of the form `<prefix>-<17 hex chars>`.
pub fn new_id(prefix: &str) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..17])
}

pub mod id_prefix {
    pub const INSTANCE: &str = "i";
    pub const VOLUME: &str = "vol";
    pub const IMAGE: &str = "img";
    pub const SNAPSHOT: &str = "snap";
    pub const TEMPLATE: &str = "tmpl";
    pub const KEY_PAIR: &str = "key";
    pub const TASK: &str = "task";
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use vmcloud_common::{CloudError, NetworkKind};

/// Control plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub default_node: String,
    pub nodes: Vec<NodeConfig>,
    /// Image used by RunInstance when the request names none.
    pub default_image_id: Option<String>,
    pub default_pool: String,
    pub snapshot_pool: String,
    pub default_volume_size_gb: u64,
    pub default_memory_mb: u64,
    pub default_vcpus: u32,
    pub network: NetworkConfig,
    pub stop_timeout_secs: u64,
    pub stop_poll_interval_ms: u64,
    pub download_task_ttl_secs: u64,
    pub qemu_img_bin: PathBuf,
    pub virt_customize_bin: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub name: String,
    pub uri: String,
    /// Set for nodes reached over SSH.
    pub ssh_host: Option<String>,
}

impl NodeConfig {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: "qemu:///system".to_string(),
            ssh_host: None,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.ssh_host.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    pub kind: NetworkKind,
    pub source: String,
    pub model: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            kind: NetworkKind::Network,
            source: "default".to_string(),
            model: "virtio".to_string(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            default_node: "local".to_string(),
            nodes: vec![NodeConfig::local("local")],
            default_image_id: None,
            default_pool: "default".to_string(),
            snapshot_pool: "default".to_string(),
            default_volume_size_gb: 20,
            default_memory_mb: 2048,
            default_vcpus: 2,
            network: NetworkConfig::default(),
            stop_timeout_secs: 60,
            stop_poll_interval_ms: 500,
            download_task_ttl_secs: 24 * 60 * 60,
            qemu_img_bin: PathBuf::from("qemu-img"),
            virt_customize_bin: PathBuf::from("virt-customize"),
        }
    }
}

impl CloudConfig {
    /// Load configuration from a JSON file.
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!("Loaded control plane config from {}", path.display());
        Ok(config)
    }

    /// Defaults overridden by `VMCLOUD_*` variables, after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(node) = std::env::var("VMCLOUD_DEFAULT_NODE") {
            if !config.nodes.iter().any(|n| n.name == node) {
                config.nodes.push(NodeConfig::local(node.clone()));
            }
            config.default_node = node;
        }
        if let Ok(image) = std::env::var("VMCLOUD_DEFAULT_IMAGE_ID") {
            config.default_image_id = Some(image);
        }
        if let Ok(pool) = std::env::var("VMCLOUD_DEFAULT_POOL") {
            config.default_pool = pool;
        }
        if let Ok(pool) = std::env::var("VMCLOUD_SNAPSHOT_POOL") {
            config.snapshot_pool = pool;
        }
        config.default_volume_size_gb = env_parse(
            "VMCLOUD_DEFAULT_VOLUME_SIZE_GB",
            config.default_volume_size_gb,
        )?;
        config.default_memory_mb = env_parse("VMCLOUD_DEFAULT_MEMORY_MB", config.default_memory_mb)?;
        config.default_vcpus = env_parse("VMCLOUD_DEFAULT_VCPUS", config.default_vcpus)?;
        config.stop_timeout_secs = env_parse("VMCLOUD_STOP_TIMEOUT_SECS", config.stop_timeout_secs)?;
        config.download_task_ttl_secs = env_parse(
            "VMCLOUD_DOWNLOAD_TASK_TTL_SECS",
            config.download_task_ttl_secs,
        )?;
        if let Ok(bridge) = std::env::var("VMCLOUD_BRIDGE") {
            config.network = NetworkConfig {
                kind: NetworkKind::Bridge,
                source: bridge,
                ..NetworkConfig::default()
            };
        }
        if let Ok(bin) = std::env::var("VMCLOUD_QEMU_IMG") {
            config.qemu_img_bin = PathBuf::from(bin);
        }
        if let Ok(bin) = std::env::var("VMCLOUD_VIRT_CUSTOMIZE") {
            config.virt_customize_bin = PathBuf::from(bin);
        }

        Ok(config)
    }

    pub fn validate(&self) -> vmcloud_common::Result<()> {
        if self.default_volume_size_gb == 0 {
            return Err(CloudError::Config(
                "default_volume_size_gb must be greater than zero".to_string(),
            ));
        }
        if self.default_memory_mb == 0 || self.default_vcpus == 0 {
            return Err(CloudError::Config(
                "default memory and vcpu count must be greater than zero".to_string(),
            ));
        }
        if self.node(&self.default_node).is_none() {
            return Err(CloudError::Config(format!(
                "default node {} is not configured",
                self.default_node
            )));
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms.max(1))
    }

    pub fn download_task_ttl(&self) -> Duration {
        Duration::from_secs(self.download_task_ttl_secs)
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = CloudConfig::default();
        assert_eq!(config.default_volume_size_gb, 20);
        assert_eq!(config.default_memory_mb, 2048);
        assert_eq!(config.default_vcpus, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_default_node() {
        let config = CloudConfig {
            default_node: "elsewhere".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CloudError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_from_file_with_partial_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(
            &path,
            r#"{"default_image_id": "img-base", "default_memory_mb": 4096,
                "nodes": [{"name": "local", "uri": "qemu:///system", "ssh_host": null},
                          {"name": "edge", "uri": "qemu+ssh://edge/system", "ssh_host": "edge"}]}"#,
        )
        .await
        .unwrap();

        let config = CloudConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.default_image_id.as_deref(), Some("img-base"));
        assert_eq!(config.default_memory_mb, 4096);
        assert_eq!(config.default_vcpus, 2);
        assert!(config.node("edge").unwrap().is_remote());
        assert!(!config.node("local").unwrap().is_remote());
    }

    #[tokio::test]
    async fn test_load_from_file_reports_parse_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        let err = CloudConfig::load_from_file(&path).await.unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        std::env::set_var("VMCLOUD_DEFAULT_VCPUS", "4");
        std::env::set_var("VMCLOUD_BRIDGE", "br0");
        let config = CloudConfig::from_env().unwrap();
        std::env::remove_var("VMCLOUD_DEFAULT_VCPUS");
        std::env::remove_var("VMCLOUD_BRIDGE");

        assert_eq!(config.default_vcpus, 4);
        assert_eq!(config.network.kind, NetworkKind::Bridge);
        assert_eq!(config.network.source, "br0");
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        std::env::set_var("VMCLOUD_DEFAULT_MEMORY_MB", "lots");
        let result = CloudConfig::from_env();
        std::env::remove_var("VMCLOUD_DEFAULT_MEMORY_MB");
        assert!(result.is_err());
    }
}

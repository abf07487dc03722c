//! virt-customize backed offline disk mutation.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vmcloud_common::{CloudError, GuestCustomizeClient, Result};

use crate::command::{render, run_local};

/// Arguments for setting one or more account passwords on a disk image.
pub fn reset_password_args(disk: &Path, passwords: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = vec!["-a".to_string(), disk.to_string_lossy().into_owned()];
    for (user, password) in passwords {
        args.push("--password".to_string());
        args.push(format!("{user}:password:{password}"));
    }
    args
}

/// Single shell command that validates the disk path and then mutates it.
pub fn remote_reset_command(
    binary: &Path,
    disk: &Path,
    passwords: &BTreeMap<String, String>,
) -> String {
    let disk_arg = disk.to_string_lossy().into_owned();
    let check = shell_words::join(["test", "-f", disk_arg.as_str()]);
    let reset = render(binary, &reset_password_args(disk, passwords));
    format!("{check} && {reset}")
}

/// virt-customize on the control plane host.
pub struct VirtCustomize {
    binary: PathBuf,
}

impl VirtCustomize {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl GuestCustomizeClient for VirtCustomize {
    async fn validate_disk_path(&self, path: &Path) -> Result<()> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(CloudError::InvalidArgument(format!(
                "disk path {} is not a regular file",
                path.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CloudError::NotFound(
                format!("disk {}", path.display()),
            )),
            Err(e) => Err(CloudError::Io(e)),
        }
    }

    async fn reset_passwords(
        &self,
        path: &Path,
        passwords: &BTreeMap<String, String>,
    ) -> Result<()> {
        if passwords.is_empty() {
            return Err(CloudError::InvalidArgument(
                "no passwords to set".to_string(),
            ));
        }
        run_local(&self.binary, &reset_password_args(path, passwords)).await?;
        Ok(())
    }
}

//! Password reset through the guest agent or by offline disk mutation.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use vmcloud_common::{
    CloudError, DomainState, GuestCustomizeClient, HypervisorClient, InstanceState, Result,
};

use crate::command::run_remote;
use crate::connection::ConnectionManager;
use crate::customize::remote_reset_command;
use crate::instance::{boot_disk, InstanceManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPath {
    GuestAgent,
    OfflineLocal,
    OfflineRemote,
}

impl ResetPath {
    pub fn decide(running: bool, agent_available: bool, is_remote: bool) -> Self {
        match (running && agent_available, is_remote) {
            (true, _) => ResetPath::GuestAgent,
            (false, false) => ResetPath::OfflineLocal,
            (false, true) => ResetPath::OfflineRemote,
        }
    }

    pub fn is_offline(&self) -> bool {
        !matches!(self, ResetPath::GuestAgent)
    }
}

/// What a resetter acts on. `disk` is only set for the offline paths.
#[derive(Debug, Clone)]
pub struct ResetTarget {
    pub domain: String,
    pub disk: Option<PathBuf>,
}

impl ResetTarget {
    fn disk(&self) -> Result<&PathBuf> {
        self.disk
            .as_ref()
            .ok_or_else(|| CloudError::NotFound(format!("disk for instance {}", self.domain)))
    }
}

#[async_trait]
pub trait PasswordResetter: Send + Sync {
    async fn reset(&self, target: &ResetTarget, passwords: &BTreeMap<String, String>) -> Result<()>;
}

pub struct GuestAgentResetter {
    hypervisor: Arc<dyn HypervisorClient>,
}

impl GuestAgentResetter {
    pub fn new(hypervisor: Arc<dyn HypervisorClient>) -> Self {
        Self { hypervisor }
    }
}

#[async_trait]
impl PasswordResetter for GuestAgentResetter {
    async fn reset(&self, target: &ResetTarget, passwords: &BTreeMap<String, String>) -> Result<()> {
        for (user, password) in passwords {
            let command = json!({
                "execute": "guest-set-user-password",
                "arguments": {
                    "username": user,
                    "password": STANDARD.encode(password),
                    "crypted": false,
                }
            });
            self.hypervisor
                .guest_agent_command(&target.domain, &command)
                .await
                .map_err(|e| CloudError::tool(format!("setting password for {user}"), e))?;
        }
        Ok(())
    }
}

/// virt-customize through the local collaborator.
pub struct LocalOfflineResetter {
    customize: Arc<dyn GuestCustomizeClient>,
}

impl LocalOfflineResetter {
    pub fn new(customize: Arc<dyn GuestCustomizeClient>) -> Self {
        Self { customize }
    }
}

#[async_trait]
impl PasswordResetter for LocalOfflineResetter {
    async fn reset(&self, target: &ResetTarget, passwords: &BTreeMap<String, String>) -> Result<()> {
        let disk = target.disk()?;
        self.customize.validate_disk_path(disk).await?;
        self.customize.reset_passwords(disk, passwords).await
    }
}

/// virt-customize on the node, as one command over the remote channel.
pub struct RemoteOfflineResetter {
    hypervisor: Arc<dyn HypervisorClient>,
    binary: PathBuf,
}

impl RemoteOfflineResetter {
    pub fn new(hypervisor: Arc<dyn HypervisorClient>, binary: impl Into<PathBuf>) -> Self {
        Self {
            hypervisor,
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl PasswordResetter for RemoteOfflineResetter {
    async fn reset(&self, target: &ResetTarget, passwords: &BTreeMap<String, String>) -> Result<()> {
        let disk = target.disk()?;
        let command = remote_reset_command(&self.binary, disk, passwords);
        run_remote(self.hypervisor.as_ref(), &command).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PasswordResetRequest {
    pub instance_id: String,
    pub passwords: BTreeMap<String, String>,
    /// Permits stopping a running instance when the guest agent is unavailable.
    pub auto_stop: bool,
    pub auto_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordResetOutcome {
    pub instance_id: String,
    pub path: ResetPath,
    pub stopped: bool,
    pub restarted: bool,
    pub final_state: InstanceState,
}

pub struct PasswordResetCoordinator {
    connections: Arc<ConnectionManager>,
    instances: Arc<InstanceManager>,
    customize: Arc<dyn GuestCustomizeClient>,
    remote_binary: PathBuf,
}

impl PasswordResetCoordinator {
    pub fn new(
        connections: Arc<ConnectionManager>,
        instances: Arc<InstanceManager>,
        customize: Arc<dyn GuestCustomizeClient>,
        remote_binary: impl Into<PathBuf>,
    ) -> Self {
        Self {
            connections,
            instances,
            customize,
            remote_binary: remote_binary.into(),
        }
    }

    fn resetter(&self, path: ResetPath, hypervisor: Arc<dyn HypervisorClient>) -> Box<dyn PasswordResetter> {
        match path {
            ResetPath::GuestAgent => Box::new(GuestAgentResetter::new(hypervisor)),
            ResetPath::OfflineLocal => Box::new(LocalOfflineResetter::new(self.customize.clone())),
            ResetPath::OfflineRemote => Box::new(RemoteOfflineResetter::new(
                hypervisor,
                self.remote_binary.clone(),
            )),
        }
    }

    #[instrument(skip(self, request), fields(instance_id = %request.instance_id))]
    pub async fn reset_passwords(&self, request: PasswordResetRequest) -> Result<PasswordResetOutcome> {
        validate_passwords(&request.passwords)?;
        let instance_id = request.instance_id.as_str();

        let instance = self.instances.get_instance(instance_id).await?;
        let hypervisor = self.connections.get(&instance.node).await?;
        let domain = hypervisor.get_domain(instance_id).await?;

        let running = domain.state == DomainState::Running;
        let agent_available = if running {
            hypervisor
                .guest_agent_available(instance_id)
                .await
                .unwrap_or_else(|e| {
                    warn!(%instance_id, error = %e, "Guest agent probe failed");
                    false
                })
        } else {
            false
        };
        let path = ResetPath::decide(running, agent_available, hypervisor.is_remote());

        if path == ResetPath::GuestAgent {
            let target = ResetTarget {
                domain: instance_id.to_string(),
                disk: None,
            };
            self.resetter(path, hypervisor)
                .reset(&target, &request.passwords)
                .await?;
            info!(%instance_id, users = request.passwords.len(), "Passwords set through guest agent");
            return Ok(PasswordResetOutcome {
                instance_id: instance_id.to_string(),
                path,
                stopped: false,
                restarted: false,
                final_state: InstanceState::Running,
            });
        }

        let needs_stop = domain.state != DomainState::ShutOff;
        if needs_stop && !request.auto_stop {
            return Err(CloudError::CapabilityUnavailable(format!(
                "guest agent unavailable on {instance_id} and automatic stop not authorized"
            )));
        }

        let disk = boot_disk(&hypervisor.domain_disks(instance_id).await?)
            .map(|d| d.source.clone())
            .ok_or_else(|| CloudError::NotFound(format!("disk for instance {instance_id}")))?;

        if needs_stop {
            let ids = [instance_id.to_string()];
            let outcome = self.instances.stop_instances(&ids, !running).await;
            let change = outcome.changes.into_iter().next();
            match change {
                Some(c) if c.error.is_none() && c.current_state == InstanceState::Stopped => {}
                Some(c) => {
                    return Err(CloudError::InvalidState(c.error.unwrap_or_else(|| {
                        format!("instance {instance_id} did not stop in time")
                    })))
                }
                None => {
                    return Err(CloudError::Internal(format!(
                        "no stop result for {instance_id}"
                    )))
                }
            }
        }

        let target = ResetTarget {
            domain: instance_id.to_string(),
            disk: Some(disk),
        };
        let result = self
            .resetter(path, hypervisor)
            .reset(&target, &request.passwords)
            .await;

        let mut restarted = false;
        if running && request.auto_restart {
            let ids = [instance_id.to_string()];
            let outcome = self.instances.start_instances(&ids).await;
            match outcome.changes.into_iter().next().and_then(|c| c.error) {
                None => restarted = true,
                Some(e) if result.is_ok() => {
                    return Err(CloudError::InvalidState(format!(
                        "passwords set but restart of {instance_id} failed: {e}"
                    )))
                }
                Some(e) => warn!(%instance_id, error = %e, "Restart after failed reset also failed"),
            }
        }
        result?;

        info!(%instance_id, ?path, restarted, "Passwords set offline");
        Ok(PasswordResetOutcome {
            instance_id: instance_id.to_string(),
            path,
            stopped: needs_stop,
            restarted,
            final_state: if restarted {
                InstanceState::Running
            } else {
                InstanceState::Stopped
            },
        })
    }
}

fn validate_passwords(passwords: &BTreeMap<String, String>) -> Result<()> {
    if passwords.is_empty() {
        return Err(CloudError::InvalidArgument("no passwords to set".to_string()));
    }
    for user in passwords.keys() {
        if user.is_empty() || user.contains(':') || user.chars().any(char::is_whitespace) {
            return Err(CloudError::InvalidArgument(format!("invalid user name {user:?}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide_covers_every_combination() {
        use ResetPath::*;
        let cases = [
            (true, true, false, GuestAgent),
            (true, true, true, GuestAgent),
            (true, false, false, OfflineLocal),
            (true, false, true, OfflineRemote),
            (false, true, false, OfflineLocal),
            (false, true, true, OfflineRemote),
            (false, false, false, OfflineLocal),
            (false, false, true, OfflineRemote),
        ];
        for (running, agent, remote, expected) in cases {
            assert_eq!(ResetPath::decide(running, agent, remote), expected);
        }
    }

    #[test]
    fn test_validate_passwords() {
        let mut passwords = BTreeMap::new();
        assert!(validate_passwords(&passwords).is_err());
        passwords.insert("root".to_string(), "pw".to_string());
        assert!(validate_passwords(&passwords).is_ok());
        passwords.insert("bad:user".to_string(), "pw".to_string());
        assert!(matches!(
            validate_passwords(&passwords),
            Err(CloudError::InvalidArgument(_))
        ));
    }
}

use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use vmcloud_common::{CloudError, CommandOutput, HypervisorClient};

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with status {code}: {stderr}")]
    NonZeroExit {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("remote dispatch failed: {0}")]
    Remote(String),
}

impl From<CommandError> for CloudError {
    fn from(err: CommandError) -> Self {
        CloudError::ToolFailure(err.to_string())
    }
}

/// Render a program and its arguments as one shell-safe command line.
pub fn render(program: &Path, args: &[String]) -> String {
    let mut words = Vec::with_capacity(args.len() + 1);
    words.push(program.to_string_lossy().into_owned());
    words.extend(args.iter().cloned());
    shell_words::join(words)
}

/// Run a local program to completion; non-zero exit is an error.
pub async fn run_local(program: &Path, args: &[String]) -> Result<CommandOutput, CommandError> {
    debug!(command = %render(program, args), "Running local command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            program: program.to_string_lossy().into_owned(),
            source,
        })?;

    let result = CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    if !result.success() {
        return Err(CommandError::NonZeroExit {
            command: program.to_string_lossy().into_owned(),
            code: result.exit_code,
            stderr: result.stderr.trim().to_string(),
        });
    }
    Ok(result)
}

/// Dispatch one shell command over the node's remote channel.
pub async fn run_remote(
    hypervisor: &dyn HypervisorClient,
    command: &str,
) -> Result<CommandOutput, CommandError> {
    debug!(node = hypervisor.node(), %command, "Dispatching remote command");
    let output = hypervisor
        .execute_remote(command)
        .await
        .map_err(|e| CommandError::Remote(e.to_string()))?;
    if !output.success() {
        return Err(CommandError::NonZeroExit {
            command: command.split_whitespace().next().unwrap_or_default().to_string(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_render_quotes_arguments() {
        let line = render(
            &PathBuf::from("qemu-img"),
            &["info".to_string(), "/pool/my disk.qcow2".to_string()],
        );
        assert_eq!(line, "qemu-img info '/pool/my disk.qcow2'");
    }

    #[tokio::test]
    async fn test_run_local_reports_non_zero_exit() {
        let err = run_local(&PathBuf::from("false"), &[]).await.unwrap_err();
        assert!(matches!(err, CommandError::NonZeroExit { .. }));
        let cloud: CloudError = err.into();
        assert!(matches!(cloud, CloudError::ToolFailure(_)));
    }

    #[tokio::test]
    async fn test_run_local_missing_program() {
        let err = run_local(&PathBuf::from("/nonexistent/tool"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}

//! Remote command channel
//!
//! Addon and reboot actions run shell commands on the node itself. A
//! [`RemoteShell`] opens a [`RemoteSession`] for a node; the session runs one
//! command at a time and reports its output or exit status.
//!
//! [`SshShell`] drives the system `ssh` client in batch mode. Exit status 255
//! is how OpenSSH reports its own failures, so it maps to a transport error;
//! any other non-zero status is the command's own failure.

use async_trait::async_trait;
use fleetops_core::Node;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::OpsError;

/// Longest message kept from a failed command
pub const MAX_MESSAGE_LEN: usize = 256;

const SSH_TRANSPORT_EXIT: i32 = 255;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Session could not be opened or was dropped
    #[error("failed to reach {host}: {message}")]
    Connect { host: String, message: String },

    /// Command ran and exited non-zero
    #[error("Process exited with status {code}: {message}")]
    Exit { code: i32, message: String },
}

impl From<RemoteError> for OpsError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Connect { .. } => OpsError::Transport(err.to_string()),
            RemoteError::Exit { message, .. } => OpsError::Internal(message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// An open command session on one node
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn run(&self, command: &str) -> Result<CommandOutput, RemoteError>;
}

/// Opens command sessions on nodes
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(&self, node: &Node) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// Collapses whitespace and bounds the message to [`MAX_MESSAGE_LEN`] characters
pub fn normalize_message(message: &str) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((idx, _)) => collapsed[..idx].to_string(),
        None => collapsed,
    }
}

/// Command that decodes a base64 encoded script and runs it as root
///
/// Only the base64 alphabet is accepted, so the payload can be embedded in
/// the remote command line without quoting.
pub fn base64_script_command(encoded: &str) -> Result<String, OpsError> {
    let encoded = encoded.trim();
    let valid = !encoded.is_empty()
        && encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='));
    if !valid {
        return Err(OpsError::BadRequest(
            "the script is not valid base64".to_string(),
        ));
    }
    Ok(format!("echo {} | base64 -d | sudo bash", encoded))
}

/// Connection settings for [`SshShell`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub user: String,
    pub port: u16,
    pub identity: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            identity: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Remote shell backed by the system OpenSSH client
pub struct SshShell {
    options: SshOptions,
}

impl SshShell {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn connect(&self, node: &Node) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let host = if node.spec.address.is_empty() {
            node.name().to_string()
        } else {
            node.spec.address.clone()
        };
        let session = SshSession {
            options: self.options.clone(),
            host,
        };
        // Probe so an unreachable node fails here as a transport error
        session.run("true").await?;
        Ok(Box::new(session))
    }
}

struct SshSession {
    options: SshOptions,
    host: String,
}

impl SshSession {
    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout.as_secs().max(1)
            ))
            .arg("-p")
            .arg(self.options.port.to_string());
        if let Some(identity) = &self.options.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.options.user, self.host))
            .arg(remote)
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        debug!("Running remote command on {}", self.host);
        let output = self
            .command(command)
            .output()
            .await
            .map_err(|e| RemoteError::Connect {
                host: self.host.clone(),
                message: format!("failed to execute ssh: {}", e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        match output.status.code() {
            Some(0) => Ok(CommandOutput { stdout, stderr }),
            Some(SSH_TRANSPORT_EXIT) | None => Err(RemoteError::Connect {
                host: self.host.clone(),
                message: normalize_message(&stderr),
            }),
            Some(code) => {
                let detail = if stderr.trim().is_empty() { &stdout } else { &stderr };
                let message = normalize_message(&format!(
                    "Process exited with status {}: {}",
                    code, detail
                ));
                error!(
                    "Remote command failed on {}, exit code: {}, message: {}",
                    self.host, code, message
                );
                Err(RemoteError::Exit { code, message })
            }
        }
    }
}

//! SSH transport through the system `ssh` client
//!
//! Key material supplied by the caller (for example a CI secret) is staged in a
//! private temporary file that lives exactly as long as the connection.

use super::{CommandOutput, Connection};
use crate::error::ProvisionError;
use crate::inventory::{CredentialRef, Reachability, Target};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Exit status the ssh client uses for its own errors
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// ssh client settings from `ssh.{yml,json,toml}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// Client binary
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    /// Seconds before a connection attempt gives up
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Value for `StrictHostKeyChecking`
    #[serde(default = "default_host_key_checking")]
    pub strict_host_key_checking: String,
    /// Extra arguments passed before the destination
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            connect_timeout_secs: default_connect_timeout(),
            strict_host_key_checking: default_host_key_checking(),
            extra_args: Vec::new(),
        }
    }
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_host_key_checking() -> String {
    "accept-new".to_string()
}

/// Connection to one target over ssh
pub struct SshConnection {
    target: Target,
    settings: SshSettings,
    identity: Option<PathBuf>,
    // Removed from disk when the connection is dropped
    _staged_key: Option<NamedTempFile>,
}

impl SshConnection {
    /// Prepare a connection; nothing is sent over the network yet
    pub fn open(target: &Target, settings: &SshSettings) -> Result<Self> {
        let (identity, staged_key) = match &target.credential {
            CredentialRef::KeyFile(path) => (Some(path.clone()), None),
            CredentialRef::KeyMaterial(material) => {
                let staged = stage_key(material)?;
                (Some(staged.path().to_path_buf()), Some(staged))
            }
            CredentialRef::Agent => (None, None),
        };

        Ok(Self {
            target: target.clone(),
            settings: settings.clone(),
            identity,
            _staged_key: staged_key,
        })
    }

    /// Check that the target answers; updates the target's reachability
    pub async fn check_reachable(&mut self) -> Result<(), ProvisionError> {
        info!("Checking reachability of {}", self.describe());
        let outcome = self.exec("true", None).await;
        match outcome {
            Ok(output) if output.success() => {
                self.target.reachability = Reachability::Reachable;
                Ok(())
            }
            Ok(output) => {
                self.target.reachability = Reachability::Unreachable;
                Err(ProvisionError::Unreachable {
                    target: self.target.name.clone(),
                    reason: output.stderr.trim().to_string(),
                })
            }
            Err(e) => {
                self.target.reachability = Reachability::Unreachable;
                Err(ProvisionError::Unreachable {
                    target: self.target.name.clone(),
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Arguments for the ssh client, destination and remote command included
    fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                self.settings.strict_host_key_checking
            ),
            "-p".to_string(),
            self.target.port.to_string(),
        ];

        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }

        args.extend(self.settings.extra_args.iter().cloned());
        args.push(self.target.destination());
        args.push("--".to_string());
        args.push(remote_command.to_string());
        args
    }

    /// Wrap a command for privilege escalation when required
    fn remote_command(&self, command: &str) -> Result<String> {
        if self.target.needs_sudo() {
            Ok(format!("sudo -n sh -c {}", super::quote(command)?))
        } else {
            Ok(command.to_string())
        }
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn describe(&self) -> String {
        format!(
            "{} ({}:{})",
            self.target.name,
            self.target.destination(),
            self.target.port
        )
    }

    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let remote = self.remote_command(command)?;
        debug!("ssh {}: {}", self.target.destination(), command);

        let mut child = Command::new(&self.settings.ssh_binary)
            .args(self.ssh_args(&remote))
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.settings.ssh_binary))?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)
                .await
                .context("Failed to write to remote stdin")?;
            // Close stdin so the remote side sees EOF
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for ssh")?;

        let status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if status == SSH_TRANSPORT_FAILURE {
            anyhow::bail!(
                "ssh connection to {} failed: {}",
                self.target.destination(),
                stderr.trim()
            );
        }

        Ok(CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}

/// Write key material to a private temporary file
fn stage_key(material: &str) -> Result<NamedTempFile> {
    // NamedTempFile is created with mode 0600 on unix
    let mut file = tempfile::Builder::new()
        .prefix("dokploy-provision-key-")
        .tempfile()
        .context("Failed to create temporary key file")?;
    file.write_all(material.trim_end().as_bytes())
        .context("Failed to stage private key")?;
    // OpenSSH refuses keys without a trailing newline
    file.write_all(b"\n").context("Failed to stage private key")?;
    file.flush().context("Failed to stage private key")?;
    Ok(file)
}

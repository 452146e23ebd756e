//! Local shell transport, for running on the target host itself

use super::{CommandOutput, Connection};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Runs commands with `sh -c` on the controller
#[derive(Debug, Clone)]
pub struct LocalConnection {
    name: String,
    sudo: bool,
}

impl LocalConnection {
    pub fn new(name: impl Into<String>, sudo: bool) -> Self {
        Self {
            name: name.into(),
            sudo,
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn describe(&self) -> String {
        format!("{} (local)", self.name)
    }

    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        debug!("local: {}", command);

        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", "sh", "-c", command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        };

        let mut child = cmd
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn shell for: {}", command))?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)
                .await
                .context("Failed to write to command stdin")?;
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for: {}", command))?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

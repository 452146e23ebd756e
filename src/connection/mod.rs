//! Command transport to the target host
//!
//! Tasks never touch the target directly: they build shell commands and hand
//! them to a [`Connection`]. The remote host is the only source of truth, so
//! nothing returned here is cached between calls.

pub mod local;
pub mod ssh;

#[cfg(test)]
pub mod fake;

use anyhow::{bail, Result};
use async_trait::async_trait;

pub use local::LocalConnection;
pub use ssh::{SshConnection, SshSettings};

/// Result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// A command to run on the target, with optional data piped to its stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(command: impl Into<String>, stdin: impl Into<Vec<u8>>) -> Self {
        Self {
            command: command.into(),
            stdin: Some(stdin.into()),
        }
    }
}

/// Something that can run shell commands on the target
#[async_trait]
pub trait Connection: Send + Sync {
    /// Human-readable destination, used in logs
    fn describe(&self) -> String;

    /// Run a shell command and collect its output.
    ///
    /// A non-zero exit status is not an error here; transport failures are.
    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput>;
}

/// Run a command and fail on non-zero exit, returning stdout
pub async fn run(conn: &dyn Connection, command: &str) -> Result<String> {
    run_command(conn, &RemoteCommand::new(command)).await
}

/// Run a [`RemoteCommand`] and fail on non-zero exit, returning stdout
pub async fn run_command(conn: &dyn Connection, command: &RemoteCommand) -> Result<String> {
    let output = conn.exec(&command.command, command.stdin.as_deref()).await?;
    if !output.success() {
        bail!(
            "command failed (exit {}): {}\nstderr: {}",
            output.status,
            command.command,
            output.stderr.trim()
        );
    }
    Ok(output.stdout)
}

/// Run a read-only check and report whether it exited zero
pub async fn check(conn: &dyn Connection, command: &str) -> Result<bool> {
    Ok(conn.exec(command, None).await?.success())
}

/// Quote a single shell word
pub fn quote(word: &str) -> Result<String> {
    Ok(shlex::try_quote(word)?.into_owned())
}

/// Quote and join shell words
pub fn join<'a>(words: impl IntoIterator<Item = &'a str>) -> Result<String> {
    let quoted = words
        .into_iter()
        .map(quote)
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(" "))
}

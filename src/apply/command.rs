//! Command execution task
//!
//! Runs a shell command on the target. A bare command is not idempotent and
//! always reports a change; `creates`, `removes` and `unless` turn it into a
//! convergence step by describing when it has already taken effect.
//!
//! # Examples
//!
//! ```yaml
//! - name: Install Docker
//!   type: command
//!   command: curl -fsSL -o /tmp/get-docker.sh https://get.docker.com && sh /tmp/get-docker.sh
//!   creates: /usr/bin/docker
//!
//! - name: Initialise swarm
//!   type: command
//!   command: docker swarm init --advertise-addr {{ swarm_advertise_addr }}
//!   unless: docker info 2>/dev/null | grep -q 'Swarm: active'
//! ```

use super::{Converge, Plan, TaskContext};
use crate::connection::{self, quote, Connection, RemoteCommand};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Command execution task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTask {
    /// Optional description of what this task does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Shell command to run
    pub command: String,

    /// Skip when this path exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creates: Option<String>,

    /// Skip when this path does not exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removes: Option<String>,

    /// Skip when this command exits zero
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unless: Option<String>,

    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chdir: Option<String>,
}

impl CommandTask {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            description: None,
            command: command.into(),
            creates: None,
            removes: None,
            unless: None,
            chdir: None,
        }
    }

    /// Whether a guard says the command has already taken effect
    async fn satisfied(&self, conn: &dyn Connection) -> Result<bool> {
        if let Some(path) = &self.creates {
            if connection::check(conn, &format!("test -e {}", quote(path)?)).await? {
                debug!("{} exists, skipping command", path);
                return Ok(true);
            }
        }
        if let Some(path) = &self.removes {
            if !connection::check(conn, &format!("test -e {}", quote(path)?)).await? {
                debug!("{} missing, skipping command", path);
                return Ok(true);
            }
        }
        if let Some(unless) = &self.unless {
            if connection::check(conn, unless).await? {
                debug!("guard '{}' passed, skipping command", unless);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl Converge for CommandTask {
    fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            bail!("command task needs a command");
        }
        Ok(())
    }

    async fn plan(&self, conn: &dyn Connection, _ctx: &TaskContext<'_>) -> Result<Plan> {
        let mut plan = Plan::in_sync();
        if self.satisfied(conn).await? {
            return Ok(plan);
        }
        let command = match &self.chdir {
            Some(dir) => format!("cd {} && {}", quote(dir)?, self.command),
            None => self.command.clone(),
        };
        plan.push(format!("run {}", self.command), RemoteCommand::new(command));
        Ok(plan)
    }
}

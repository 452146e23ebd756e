//! APT package management task
//!
//! Ensures Debian/Ubuntu packages are installed or removed.
//!
//! # Examples
//!
//! ```yaml
//! - name: Install base packages
//!   type: apt
//!   packages: [curl, ca-certificates, ufw]
//!   update_cache: true
//! ```

use super::{one_or_many, Converge, Plan, TaskContext};
use crate::connection::{join, quote, Connection, RemoteCommand};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Package state enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    /// Ensure package is installed
    #[default]
    Present,
    /// Ensure package is removed
    Absent,
}

/// APT package management task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AptTask {
    /// Optional description of what this task does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Package name or list of names
    #[serde(deserialize_with = "one_or_many")]
    pub packages: Vec<String>,

    #[serde(default)]
    pub state: PackageState,

    /// Run `apt-get update` before installing
    #[serde(default)]
    pub update_cache: bool,
}

/// Whether `dpkg-query` reports the package as installed
async fn is_installed(conn: &dyn Connection, package: &str) -> Result<bool> {
    let output = conn
        .exec(
            &format!("dpkg-query -W -f='${{Status}}' {}", quote(package)?),
            None,
        )
        .await?;
    Ok(output.success() && output.stdout.contains("install ok installed"))
}

#[async_trait]
impl Converge for AptTask {
    fn validate(&self) -> Result<()> {
        if self.packages.is_empty() {
            bail!("apt task needs at least one package");
        }
        if let Some(bad) = self
            .packages
            .iter()
            .find(|p| p.is_empty() || p.chars().any(char::is_whitespace))
        {
            bail!("invalid package name '{}'", bad);
        }
        Ok(())
    }

    async fn plan(&self, conn: &dyn Connection, _ctx: &TaskContext<'_>) -> Result<Plan> {
        let mut pending = Vec::new();
        for package in &self.packages {
            let installed = is_installed(conn, package).await?;
            debug!("package {} installed: {}", package, installed);
            let wanted = self.state == PackageState::Present;
            if installed != wanted {
                pending.push(package.as_str());
            }
        }

        let mut plan = Plan::in_sync();
        if pending.is_empty() {
            return Ok(plan);
        }

        let packages = join(pending.iter().copied())?;
        match self.state {
            PackageState::Present => {
                let mut commands = Vec::new();
                if self.update_cache {
                    commands.push(RemoteCommand::new("apt-get update -q"));
                }
                commands.push(RemoteCommand::new(format!(
                    "DEBIAN_FRONTEND=noninteractive apt-get install -y -q {}",
                    packages
                )));
                plan.push_all(format!("install {}", pending.join(", ")), commands);
            }
            PackageState::Absent => {
                plan.push(
                    format!("remove {}", pending.join(", ")),
                    RemoteCommand::new(format!(
                        "DEBIAN_FRONTEND=noninteractive apt-get remove -y -q {}",
                        packages
                    )),
                );
            }
        }
        Ok(plan)
    }
}

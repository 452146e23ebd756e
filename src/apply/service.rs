//! Service management task
//!
//! Manages systemd units: start, stop, restart, reload, enable or disable.
//! `restarted` and `reloaded` always produce a change, which makes them the
//! usual handler actions.
//!
//! # Examples
//!
//! ```yaml
//! - name: Start and enable docker
//!   type: service
//!   service: docker
//!   state: started
//!   enabled: true
//! ```

use super::{Converge, Plan, TaskContext};
use crate::connection::{self, quote, Connection, RemoteCommand};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Service state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Ensure service is running
    Started,
    /// Ensure service is stopped
    Stopped,
    /// Restart service
    Restarted,
    /// Reload service configuration
    Reloaded,
}

/// Service management task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceTask {
    /// Optional description of what this task does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Unit name
    pub service: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ServiceState>,

    /// Whether the unit starts at boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[async_trait]
impl Converge for ServiceTask {
    fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            bail!("service task needs a service name");
        }
        if self.state.is_none() && self.enabled.is_none() {
            bail!("service task for '{}' sets neither state nor enabled", self.service);
        }
        Ok(())
    }

    async fn plan(&self, conn: &dyn Connection, _ctx: &TaskContext<'_>) -> Result<Plan> {
        let unit = quote(&self.service)?;
        let mut plan = Plan::in_sync();

        if let Some(want_enabled) = self.enabled {
            let enabled = connection::check(conn, &format!("systemctl is-enabled {}", unit)).await?;
            if enabled != want_enabled {
                let verb = if want_enabled { "enable" } else { "disable" };
                plan.push(
                    format!("{} {}", verb, self.service),
                    RemoteCommand::new(format!("systemctl {} {}", verb, unit)),
                );
            }
        }

        let verb = match self.state {
            None => None,
            Some(ServiceState::Restarted) => Some("restart"),
            Some(ServiceState::Reloaded) => Some("reload"),
            Some(state) => {
                let active =
                    connection::check(conn, &format!("systemctl is-active {}", unit)).await?;
                match (state, active) {
                    (ServiceState::Started, false) => Some("start"),
                    (ServiceState::Stopped, true) => Some("stop"),
                    _ => None,
                }
            }
        };
        if let Some(verb) = verb {
            plan.push(
                format!("{} {}", verb, self.service),
                RemoteCommand::new(format!("systemctl {} {}", verb, unit)),
            );
        }

        Ok(plan)
    }
}

//! UFW firewall task
//!
//! Manages UFW rules, default policies, logging and the enabled flag.
//! Rules are probed with `ufw show added`, which lists user rules in the same
//! form they are added with, so presence is a line comparison. Policy,
//! logging and the enabled flag are read from UFW's configuration files.
//!
//! # Examples
//!
//! ```yaml
//! - name: Allow SSH
//!   type: ufw
//!   state: allow
//!   port: 22
//!   proto: tcp
//!
//! - name: Close the initial Dokploy port
//!   type: ufw
//!   state: allow
//!   port: 3000
//!   proto: tcp
//!   delete: true
//!
//! - name: Enable the firewall, denying incoming traffic by default
//!   type: ufw
//!   state: enabled
//!   policy: deny
//! ```

use super::{files, opt_scalar_string, Converge, Plan, TaskContext};
use crate::connection::{join, Connection, RemoteCommand};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const UFW_CONF: &str = "/etc/ufw/ufw.conf";
const UFW_DEFAULTS: &str = "/etc/default/ufw";

/// What the task manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UfwState {
    /// Firewall active
    Enabled,
    /// Firewall inactive
    Disabled,
    /// Allow rule
    Allow,
    /// Deny rule
    Deny,
    /// Reject rule
    Reject,
    /// Rate-limit rule
    Limit,
    /// Default policy for a direction
    Default,
    /// Logging level
    Logging,
}

impl UfwState {
    fn rule_action(self) -> Option<&'static str> {
        match self {
            UfwState::Allow => Some("allow"),
            UfwState::Deny => Some("deny"),
            UfwState::Reject => Some("reject"),
            UfwState::Limit => Some("limit"),
            _ => None,
        }
    }
}

/// Default policy values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UfwPolicy {
    Allow,
    Deny,
    Reject,
}

impl UfwPolicy {
    fn as_str(self) -> &'static str {
        match self {
            UfwPolicy::Allow => "allow",
            UfwPolicy::Deny => "deny",
            UfwPolicy::Reject => "reject",
        }
    }

    /// Value UFW writes to /etc/default/ufw
    fn iptables_target(self) -> &'static str {
        match self {
            UfwPolicy::Allow => "ACCEPT",
            UfwPolicy::Deny => "DROP",
            UfwPolicy::Reject => "REJECT",
        }
    }
}

/// UFW firewall task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UfwTask {
    /// Optional description of what this task does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub state: UfwState,

    /// Port or port range for rules
    #[serde(
        default,
        deserialize_with = "opt_scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<String>,

    /// Protocol for rules (`tcp`, `udp`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,

    /// Source address for rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Destination address for rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    /// `in`/`out` for rules; `incoming`/`outgoing`/`routed` for `default`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,

    /// Policy for `state: default`; with `state: enabled`, the incoming policy applied before enabling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<UfwPolicy>,

    /// Level for `state: logging` (`off`, `low`, `medium`, `high`, `full`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<String>,

    /// Ensure the rule is absent instead of present
    #[serde(default)]
    pub delete: bool,
}

impl UfwTask {
    /// A rule task for `port/proto`
    pub fn rule(state: UfwState, port: &str, proto: Option<&str>) -> Self {
        Self {
            description: None,
            state,
            port: Some(port.to_string()),
            proto: proto.map(str::to_string),
            from: None,
            to: None,
            direction: None,
            policy: None,
            logging: None,
            delete: false,
        }
    }

    /// Rule words after `ufw`, in the form `ufw show added` prints them
    pub fn rule_words(&self) -> Result<Vec<String>> {
        let action = match self.state.rule_action() {
            Some(action) => action,
            None => bail!("ufw state {:?} is not a rule", self.state),
        };
        let mut words = vec![action.to_string()];
        if let Some(direction) = &self.direction {
            words.push(direction.clone());
        }

        if self.from.is_none() && self.to.is_none() {
            let port = match &self.port {
                Some(port) => port,
                None => bail!("ufw rule needs a port or from/to"),
            };
            match &self.proto {
                Some(proto) => words.push(format!("{}/{}", port, proto)),
                None => words.push(port.clone()),
            }
            return Ok(words);
        }

        words.push("from".to_string());
        words.push(self.from.clone().unwrap_or_else(|| "any".to_string()));
        words.push("to".to_string());
        words.push(self.to.clone().unwrap_or_else(|| "any".to_string()));
        if let Some(port) = &self.port {
            words.push("port".to_string());
            words.push(port.clone());
        }
        if let Some(proto) = &self.proto {
            words.push("proto".to_string());
            words.push(proto.clone());
        }
        Ok(words)
    }

    fn default_direction(&self) -> &str {
        self.direction.as_deref().unwrap_or("incoming")
    }

    async fn plan_policy(
        &self,
        conn: &dyn Connection,
        policy: UfwPolicy,
        direction: &str,
        plan: &mut Plan,
    ) -> Result<()> {
        let key = match direction {
            "outgoing" => "DEFAULT_OUTPUT_POLICY",
            "routed" => "DEFAULT_FORWARD_POLICY",
            _ => "DEFAULT_INPUT_POLICY",
        };
        let current = read_config(conn, UFW_DEFAULTS, key).await?;
        if current.as_deref() != Some(policy.iptables_target()) {
            let command = format!("ufw default {} {}", policy.as_str(), direction);
            plan.push(command.clone(), RemoteCommand::new(command));
        }
        Ok(())
    }

    async fn plan_rule(&self, conn: &dyn Connection, plan: &mut Plan) -> Result<()> {
        let words = self.rule_words()?;
        let rule = join(words.iter().map(String::as_str))?;
        let wanted = format!("ufw {}", rule);
        // Before ufw is installed there are no rules to list
        let added = conn.exec("ufw show added", None).await?;
        let present = added.success() && added.stdout.lines().any(|line| line.trim() == wanted);

        match (self.delete, present) {
            (false, false) => plan.push(
                format!("ufw {}", rule),
                RemoteCommand::new(format!("ufw {}", rule)),
            ),
            (true, true) => plan.push(
                format!("ufw delete {}", rule),
                RemoteCommand::new(format!("ufw delete {}", rule)),
            ),
            _ => {}
        }
        Ok(())
    }
}

/// Value of `KEY=value` in a shell-style config file, quotes stripped
pub fn config_value(content: &str, key: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let line = line.trim();
        if line.starts_with('#') {
            return None;
        }
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"').trim_matches('\'').to_string())
    })
}

async fn read_config(conn: &dyn Connection, path: &str, key: &str) -> Result<Option<String>> {
    Ok(files::read_file(conn, path)
        .await?
        .and_then(|content| config_value(&content, key)))
}

#[async_trait]
impl Converge for UfwTask {
    fn validate(&self) -> Result<()> {
        match self.state {
            UfwState::Default => {
                if self.policy.is_none() {
                    bail!("ufw default needs a policy");
                }
                if !matches!(self.default_direction(), "incoming" | "outgoing" | "routed") {
                    bail!("ufw default direction must be incoming, outgoing or routed");
                }
            }
            UfwState::Logging => match self.logging.as_deref() {
                Some("on" | "off" | "low" | "medium" | "high" | "full") => {}
                other => bail!("invalid ufw logging level {:?}", other),
            },
            UfwState::Enabled | UfwState::Disabled => {}
            _ => {
                if let Some(direction) = &self.direction {
                    if direction != "in" && direction != "out" {
                        bail!("ufw rule direction must be in or out");
                    }
                }
                if let Some(proto) = &self.proto {
                    if !matches!(proto.as_str(), "tcp" | "udp" | "any") {
                        bail!("invalid ufw protocol '{}'", proto);
                    }
                }
                self.rule_words()?;
            }
        }
        Ok(())
    }

    async fn plan(&self, conn: &dyn Connection, _ctx: &TaskContext<'_>) -> Result<Plan> {
        let mut plan = Plan::in_sync();
        match self.state {
            UfwState::Enabled | UfwState::Disabled => {
                if let (UfwState::Enabled, Some(policy)) = (self.state, self.policy) {
                    self.plan_policy(conn, policy, "incoming", &mut plan).await?;
                }
                let enabled = read_config(conn, UFW_CONF, "ENABLED")
                    .await?
                    .is_some_and(|v| v == "yes");
                match (self.state, enabled) {
                    (UfwState::Enabled, false) => plan.push(
                        "enable ufw",
                        RemoteCommand::new("ufw --force enable"),
                    ),
                    (UfwState::Disabled, true) => {
                        plan.push("disable ufw", RemoteCommand::new("ufw disable"))
                    }
                    _ => {}
                }
            }
            UfwState::Default => {
                let Some(policy) = self.policy else {
                    bail!("ufw default needs a policy");
                };
                self.plan_policy(conn, policy, self.default_direction(), &mut plan)
                    .await?;
            }
            UfwState::Logging => {
                let level = self.logging.as_deref().unwrap_or("low");
                let wanted = if level == "on" { "low" } else { level };
                let current = read_config(conn, UFW_CONF, "LOGLEVEL").await?;
                if current.as_deref() != Some(wanted) {
                    let command = format!("ufw logging {}", wanted);
                    plan.push(command.clone(), RemoteCommand::new(command));
                }
            }
            _ => self.plan_rule(conn, &mut plan).await?,
        }
        Ok(plan)
    }
}

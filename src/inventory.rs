//! Inventory resolution
//!
//! Maps a logical target name such as `production` to the connection
//! parameters for one host. Entries come from `inventory.{yml,json,toml}` in the
//! config directory; command-line overrides win field by field.
//!
//! **YAML Format:**
//! ```yaml
//! targets:
//!   production:
//!     address: 203.0.113.10
//!     user: deploy
//!     port: 22
//!     private_key_file: ~/.ssh/dokploy_ed25519
//!     become: true
//!     vars:
//!       dokploy_port: 3000
//! ```

use crate::error::{ProvisionError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// How commands reach the target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Through the system ssh client
    #[default]
    Ssh,
    /// Through a local shell (the controller is the target)
    Local,
}

/// Where the private key for a target comes from
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialRef {
    /// Key file on the controller
    KeyFile(PathBuf),
    /// Key material handed over by the caller (CI secret); never persisted
    KeyMaterial(String),
    /// Whatever the ssh client finds on its own (agent, default identities)
    Agent,
}

impl fmt::Debug for CredentialRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialRef::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            CredentialRef::KeyMaterial(_) => f.write_str("KeyMaterial(<redacted>)"),
            CredentialRef::Agent => f.write_str("Agent"),
        }
    }
}

/// Reachability of a target as last observed in this run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

/// One remote host, resolved once per run
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub credential: CredentialRef,
    pub connection: ConnectionKind,
    /// Prefix remote commands with `sudo -n` when the user is not root
    pub become_root: bool,
    /// Host-level variables from the inventory entry
    pub vars: IndexMap<String, serde_yaml::Value>,
    pub reachability: Reachability,
}

impl Target {
    /// `user@address`, as ssh expects it
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }

    /// Whether commands need privilege escalation
    pub fn needs_sudo(&self) -> bool {
        self.become_root && self.user != "root"
    }

    /// Facts about the target exposed to templates as `target_*` variables
    pub fn facts(&self) -> IndexMap<String, serde_yaml::Value> {
        let mut facts = IndexMap::new();
        facts.insert(
            "target_name".to_string(),
            serde_yaml::Value::String(self.name.clone()),
        );
        facts.insert(
            "target_address".to_string(),
            serde_yaml::Value::String(self.address.clone()),
        );
        facts.insert(
            "target_user".to_string(),
            serde_yaml::Value::String(self.user.clone()),
        );
        facts.insert(
            "target_port".to_string(),
            serde_yaml::Value::Number(self.port.into()),
        );
        facts
    }
}

/// Inventory entry as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetEntry {
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<PathBuf>,
    #[serde(default)]
    pub connection: ConnectionKind,
    #[serde(default = "crate::apply::default_true", rename = "become")]
    pub become_root: bool,
    #[serde(default)]
    pub vars: IndexMap<String, serde_yaml::Value>,
}

/// Per-run overrides supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct TargetOverrides {
    pub address: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub credential: Option<CredentialRef>,
}

/// Named targets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub targets: IndexMap<String, TargetEntry>,
}

impl Inventory {
    /// Resolve a target name into connection parameters.
    ///
    /// Unknown names resolve only when the overrides carry both an address and
    /// a credential.
    pub fn resolve(&self, name: &str, overrides: &TargetOverrides) -> Result<Target> {
        match self.targets.get(name) {
            Some(entry) => {
                let credential = overrides.credential.clone().unwrap_or_else(|| {
                    entry
                        .private_key_file
                        .as_ref()
                        .map(|path| CredentialRef::KeyFile(expand_home(path)))
                        .unwrap_or(CredentialRef::Agent)
                });

                Ok(Target {
                    name: name.to_string(),
                    address: overrides
                        .address
                        .clone()
                        .unwrap_or_else(|| entry.address.clone()),
                    port: overrides.port.unwrap_or(entry.port),
                    user: overrides.user.clone().unwrap_or_else(|| entry.user.clone()),
                    credential,
                    connection: entry.connection,
                    become_root: entry.become_root,
                    vars: entry.vars.clone(),
                    reachability: Reachability::Unknown,
                })
            }
            None => match (&overrides.address, &overrides.credential) {
                (Some(address), Some(credential)) => Ok(Target {
                    name: name.to_string(),
                    address: address.clone(),
                    port: overrides.port.unwrap_or_else(default_ssh_port),
                    user: overrides.user.clone().unwrap_or_else(default_user),
                    credential: credential.clone(),
                    connection: ConnectionKind::Ssh,
                    become_root: true,
                    vars: IndexMap::new(),
                    reachability: Reachability::Unknown,
                }),
                _ => Err(ProvisionError::UnknownTarget {
                    name: name.to_string(),
                    known: self.known_names(),
                }),
            },
        }
    }

    /// Names of all inventory targets, in file order
    pub fn names(&self) -> Vec<&str> {
        self.targets.keys().map(String::as_str).collect()
    }

    fn known_names(&self) -> String {
        if self.targets.is_empty() {
            "none".to_string()
        } else {
            self.names().join(", ")
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

/// Expand a leading `~/` against the controller's home directory
fn expand_home(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

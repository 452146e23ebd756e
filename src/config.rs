//! Configuration loading for dokploy-provision
//!
//! Everything lives in one config directory. Each file is optional and may be
//! written in YAML, JSON or TOML:
//!
//! - `inventory.{yml,yaml,json,toml}`: named targets
//! - `vars.{yml,yaml,json,toml}`: global default variables
//! - `ssh.{yml,yaml,json,toml}`: ssh client settings
//! - `roles/<name>/`: replaces the built-in role of the same name

use crate::apply::variables::Vars;
use crate::connection::SshSettings;
use crate::error::{ProvisionError, Result};
use crate::inventory::Inventory;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::debug;

const SYSTEM_CONFIG_DIR: &str = "/etc/dokploy-provision/config";

/// Everything read from the config directory
#[derive(Debug, Clone, Default)]
pub struct ProvisionConfig {
    pub config_dir: PathBuf,
    pub inventory: Inventory,
    pub vars: Vars,
    pub ssh: SshSettings,
}

impl ProvisionConfig {
    /// Load all config files from a directory; a missing directory yields defaults
    pub fn load(config_dir: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", config_dir.display());
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            inventory: load_optional(config_dir, "inventory")?.unwrap_or_default(),
            vars: load_optional(config_dir, "vars")?.unwrap_or_default(),
            ssh: load_optional(config_dir, "ssh")?.unwrap_or_default(),
        })
    }

    /// Directory holding role overrides
    pub fn roles_dir(&self) -> PathBuf {
        self.config_dir.join("roles")
    }
}

/// Config directory precedence: explicit path, then the system-wide
/// directory if it exists, then the user's config directory
pub fn default_config_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        let system_config = PathBuf::from(SYSTEM_CONFIG_DIR);
        if system_config.exists() {
            system_config
        } else {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dokploy-provision")
                .join("config")
        }
    })
}

/// Load `<stem>.{yml,yaml,json,toml}` from a directory, first match wins
pub fn load_optional<T: DeserializeOwned>(dir: &Path, stem: &str) -> Result<Option<T>> {
    for extension in ["yml", "yaml", "json", "toml"] {
        let path = dir.join(format!("{}.{}", stem, extension));
        if !path.is_file() {
            continue;
        }
        debug!("Reading {}", path.display());
        let contents = std::fs::read_to_string(&path)?;
        let parsed = match extension {
            "json" => serde_json::from_str(&contents).map_err(ProvisionError::from),
            "toml" => toml::from_str(&contents).map_err(ProvisionError::from),
            _ => serde_yaml::from_str(&contents).map_err(ProvisionError::from),
        };
        return parsed
            .map(Some)
            .map_err(|e| ProvisionError::Config(format!("{}: {}", path.display(), e)));
    }
    Ok(None)
}

//! Docker container task
//!
//! Keeps a named container running from the configured image and options.
//! The container carries a label with a hash of its configuration; when the
//! image or hash differs it is recreated, and a stopped container is started.
//!
//! # Examples
//!
//! ```yaml
//! - name: Run Dokploy
//!   type: container
//!   container: dokploy
//!   image: dokploy/dokploy:latest
//!   ports: ["3000:3000"]
//!   volumes:
//!     - /var/run/docker.sock:/var/run/docker.sock
//!     - /etc/dokploy:/etc/dokploy
//!   network: dokploy-network
//! ```

use super::{files, Converge, Plan, TaskContext};
use crate::connection::{join, quote, Connection, RemoteCommand};
use anyhow::{bail, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Label holding the configuration hash
pub const HASH_LABEL: &str = "dokploy-provision.hash";

/// Container state enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Present and running
    #[default]
    Started,
    /// Removed
    Absent,
}

/// Docker container task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerTask {
    /// Optional description of what this task does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Container name
    pub container: String,

    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub state: ContainerState,

    /// `host:container` port mappings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,

    /// `host:container` bind mounts or named volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Docker restart policy
    #[serde(default = "default_restart")]
    pub restart: String,

    /// Extra `docker run` arguments placed before the image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

fn default_restart() -> String {
    "unless-stopped".to_string()
}

/// What `docker inspect` reports about an existing container
#[derive(Debug, Clone, PartialEq, Eq)]
struct Inspected {
    running: bool,
    image: String,
    hash: String,
}

impl ContainerTask {
    /// Short hash over everything that requires recreating the container
    pub fn config_hash(&self) -> String {
        let mut material = vec![self.image.clone(), self.restart.clone()];
        material.extend(self.ports.iter().map(|p| format!("p:{}", p)));
        material.extend(self.volumes.iter().map(|v| format!("v:{}", v)));
        material.extend(self.env.iter().map(|(k, v)| format!("e:{}={}", k, v)));
        if let Some(network) = &self.network {
            material.push(format!("n:{}", network));
        }
        material.extend(self.args.iter().map(|a| format!("a:{}", a)));
        files::checksum(&material.join("\n"))[..16].to_string()
    }

    /// The `docker run` command for this container
    pub fn run_command(&self) -> Result<String> {
        let mut words: Vec<String> = vec![
            "docker".into(),
            "run".into(),
            "-d".into(),
            "--name".into(),
            self.container.clone(),
            "--restart".into(),
            self.restart.clone(),
        ];
        for port in &self.ports {
            words.push("-p".into());
            words.push(port.clone());
        }
        for volume in &self.volumes {
            words.push("-v".into());
            words.push(volume.clone());
        }
        for (key, value) in &self.env {
            words.push("-e".into());
            words.push(format!("{}={}", key, value));
        }
        if let Some(network) = &self.network {
            words.push("--network".into());
            words.push(network.clone());
        }
        words.push("--label".into());
        words.push(format!("{}={}", HASH_LABEL, self.config_hash()));
        words.extend(self.args.iter().cloned());
        words.push(self.image.clone());
        join(words.iter().map(String::as_str))
    }

    async fn inspect(&self, conn: &dyn Connection) -> Result<Option<Inspected>> {
        let format = format!(
            "{{{{.State.Running}}}}|{{{{.Config.Image}}}}|{{{{index .Config.Labels \"{}\"}}}}",
            HASH_LABEL
        );
        let output = conn
            .exec(
                &format!(
                    "docker inspect --format {} {}",
                    quote(&format)?,
                    quote(&self.container)?
                ),
                None,
            )
            .await?;
        if !output.success() {
            return Ok(None);
        }
        let fields: Vec<&str> = output.stdout.trim().splitn(3, '|').collect();
        match fields.as_slice() {
            [running, image, hash] => Ok(Some(Inspected {
                running: *running == "true",
                image: image.to_string(),
                hash: hash.trim().to_string(),
            })),
            _ => bail!(
                "unexpected docker inspect output for {}: {}",
                self.container,
                output.stdout.trim()
            ),
        }
    }
}

#[async_trait]
impl Converge for ContainerTask {
    fn validate(&self) -> Result<()> {
        if self.container.trim().is_empty() {
            bail!("container task needs a container name");
        }
        if self.state == ContainerState::Started && self.image.trim().is_empty() {
            bail!("container {} needs an image", self.container);
        }
        if let Some(bad) = self.ports.iter().find(|p| !p.contains(':')) {
            bail!("port mapping '{}' must be host:container", bad);
        }
        Ok(())
    }

    async fn plan(&self, conn: &dyn Connection, _ctx: &TaskContext<'_>) -> Result<Plan> {
        let mut plan = Plan::in_sync();
        let current = self.inspect(conn).await?;
        let name = quote(&self.container)?;

        match (self.state, current) {
            (ContainerState::Absent, Some(_)) => plan.push(
                format!("remove container {}", self.container),
                RemoteCommand::new(format!("docker rm -f {}", name)),
            ),
            (ContainerState::Absent, None) => {}
            (ContainerState::Started, None) => plan.push(
                format!("create container {} from {}", self.container, self.image),
                RemoteCommand::new(self.run_command()?),
            ),
            (ContainerState::Started, Some(existing)) => {
                if existing.image != self.image || existing.hash != self.config_hash() {
                    plan.push_all(
                        format!("recreate container {} from {}", self.container, self.image),
                        vec![
                            RemoteCommand::new(format!("docker rm -f {}", name)),
                            RemoteCommand::new(self.run_command()?),
                        ],
                    );
                } else if !existing.running {
                    plan.push(
                        format!("start container {}", self.container),
                        RemoteCommand::new(format!("docker start {}", name)),
                    );
                }
            }
        }
        Ok(plan)
    }
}

//! Template rendering task
//!
//! Renders a role template (or inline `content`) with the run's variables and
//! writes it to the target when the remote checksum differs. Permission and
//! ownership drift on an otherwise identical file is fixed in place.
//!
//! # Examples
//!
//! ## Render a role template
//!
//! **YAML Format:**
//! ```yaml
//! - name: Configure fail2ban jail
//!   type: template
//!   src: jail.local.j2
//!   dest: /etc/fail2ban/jail.local
//!   mode: "0644"
//!   notify: restart fail2ban
//! ```
//!
//! ## Inline content with task-local variables
//!
//! **YAML Format:**
//! ```yaml
//! - type: template
//!   description: "Write motd"
//!   content: "Managed host {{ motd_owner }}\n"
//!   dest: /etc/motd
//!   vars:
//!     motd_owner: ops
//! ```

use super::files::{self, WriteOptions};
use super::templating;
use super::variables::Vars;
use super::{scalar_string, Converge, Plan, TaskContext};
use crate::connection::{quote, Connection, RemoteCommand};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Template state enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateState {
    /// Ensure template is rendered
    #[default]
    Present,
    /// Ensure rendered file is removed
    Absent,
}

/// Template rendering task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateTask {
    /// Optional description of what this task does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Template name, looked up in the role's templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,

    /// Inline template body, used instead of `src`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Destination path on the target
    pub dest: String,

    #[serde(default)]
    pub state: TemplateState,

    #[serde(default = "default_mode", deserialize_with = "scalar_string")]
    pub mode: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Keep the previous file at `<dest>.bak`
    #[serde(default)]
    pub backup: bool,

    /// Command checking the staged file before it is moved into place (`%s` is its path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<String>,

    /// Variables visible only to this template
    #[serde(default, skip_serializing_if = "Vars::is_empty")]
    pub vars: Vars,
}

fn default_mode() -> String {
    "0644".to_string()
}

/// Named templates available to template tasks.
///
/// Role templates are registered by name; names not registered are looked up
/// in the search directories in order.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, String>,
    search_dirs: Vec<PathBuf>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, body: impl Into<String>) {
        self.templates.insert(name.into(), body.into());
    }

    pub fn add_search_dir(&mut self, dir: impl Into<PathBuf>) {
        self.search_dirs.push(dir.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
            || self.search_dirs.iter().any(|dir| dir.join(name).is_file())
    }

    /// Template body by name
    pub fn get(&self, name: &str) -> Result<String> {
        if let Some(body) = self.templates.get(name) {
            return Ok(body.clone());
        }
        for dir in &self.search_dirs {
            let path = dir.join(name);
            if path.is_file() {
                return std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read template {}", path.display()));
            }
        }
        bail!("template '{}' not found", name)
    }
}

impl TemplateTask {
    /// Render the desired file content
    pub fn render(&self, ctx: &TaskContext<'_>) -> Result<String> {
        let (label, body) = match (&self.content, &self.src) {
            (Some(content), _) => ("inline content", content.clone()),
            (None, Some(src)) => (src.as_str(), ctx.templates.get(src)?),
            (None, None) => bail!("template task for {} needs src or content", self.dest),
        };
        let context = ctx.variables.jinja_context_with(&self.vars);
        templating::render_with_context(&body, context)
            .with_context(|| format!("Failed to render template {}", label))
    }
}

#[async_trait]
impl Converge for TemplateTask {
    fn validate(&self) -> Result<()> {
        if self.dest.trim().is_empty() {
            bail!("template task needs a dest");
        }
        if self.state == TemplateState::Present {
            match (&self.src, &self.content) {
                (None, None) => bail!("template task for {} needs src or content", self.dest),
                (Some(_), Some(_)) => {
                    bail!("template task for {} sets both src and content", self.dest)
                }
                _ => {}
            }
        }
        if !self.mode.chars().all(|c| c.is_ascii_digit()) || self.mode.len() > 4 {
            bail!("invalid mode '{}'", self.mode);
        }
        Ok(())
    }

    async fn plan(&self, conn: &dyn Connection, ctx: &TaskContext<'_>) -> Result<Plan> {
        let mut plan = Plan::in_sync();

        if self.state == TemplateState::Absent {
            if crate::connection::check(conn, &format!("test -e {}", quote(&self.dest)?)).await? {
                plan.push(
                    format!("remove {}", self.dest),
                    RemoteCommand::new(format!("rm -f {}", quote(&self.dest)?)),
                );
            }
            return Ok(plan);
        }

        let desired = self.render(ctx)?;
        let current = files::remote_checksum(conn, &self.dest).await?;

        if current.as_deref() != Some(files::checksum(&desired).as_str()) {
            let options = WriteOptions {
                mode: Some(&self.mode),
                owner: self.owner.as_deref(),
                group: self.group.as_deref(),
                validate: self.validate.as_deref(),
                backup: self.backup && current.is_some(),
            };
            let summary = match current {
                Some(_) => format!("update {}", self.dest),
                None => format!("create {}", self.dest),
            };
            plan.push_all(summary, files::write_commands(&self.dest, &desired, &options)?);
            return Ok(plan);
        }

        if let Some(stat) = files::remote_stat(conn, &self.dest).await? {
            if !files::same_mode(&stat.mode, &self.mode) {
                plan.push(
                    format!("mode {} -> {} on {}", stat.mode, self.mode, self.dest),
                    RemoteCommand::new(format!(
                        "chmod {} {}",
                        quote(&self.mode)?,
                        quote(&self.dest)?
                    )),
                );
            }
            let owner_drift = self.owner.as_ref().is_some_and(|o| *o != stat.owner);
            let group_drift = self.group.as_ref().is_some_and(|g| *g != stat.group);
            if owner_drift || group_drift {
                let owner = self.owner.clone().unwrap_or(stat.owner);
                let group = self.group.clone().unwrap_or(stat.group);
                plan.push(
                    format!("owner {}:{} on {}", owner, group, self.dest),
                    RemoteCommand::new(format!(
                        "chown {} {}",
                        quote(&format!("{}:{}", owner, group))?,
                        quote(&self.dest)?
                    )),
                );
            }
        }

        Ok(plan)
    }
}

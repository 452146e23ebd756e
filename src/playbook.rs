//! Playbook composition
//!
//! A playbook is the ordered concatenation of one or more roles: their tasks
//! in role order, their handlers, templates and default variables. The entry
//! points map to fixed role lists: `deploy` runs `base`, `harden` runs
//! `hardening`, `site` runs both.

use crate::apply::variables::{VarLayer, Vars};
use crate::apply::{Handler, Task, TemplateStore};
use crate::error::{ProvisionError, Result};
use crate::roles::{Role, RoleLoader, TemplateSource};
use std::collections::HashSet;

/// Named role combinations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Deploy,
    Harden,
    Site,
}

impl Selection {
    pub fn name(&self) -> &'static str {
        match self {
            Selection::Deploy => "deploy",
            Selection::Harden => "harden",
            Selection::Site => "site",
        }
    }

    pub fn roles(&self) -> &'static [&'static str] {
        match self {
            Selection::Deploy => &["base"],
            Selection::Harden => &["hardening"],
            Selection::Site => &["base", "hardening"],
        }
    }
}

/// Tasks, handlers and variables ready for the executor
#[derive(Debug, Clone)]
pub struct Playbook {
    pub name: String,
    pub roles: Vec<String>,
    pub tasks: Vec<Task>,
    pub handlers: Vec<Handler>,
    pub templates: TemplateStore,
    /// Defaults of each role, in role order
    pub role_defaults: Vec<VarLayer>,
}

impl Playbook {
    /// Load the roles for a selection
    pub fn load(selection: Selection, loader: &RoleLoader) -> Result<Self> {
        let roles = selection
            .roles()
            .iter()
            .map(|name| loader.load(name))
            .collect::<Result<Vec<_>>>()?;
        Self::compose(selection.name(), roles)
    }

    /// Concatenate roles in order
    pub fn compose(name: &str, roles: Vec<Role>) -> Result<Self> {
        let mut playbook = Self {
            name: name.to_string(),
            roles: Vec::new(),
            tasks: Vec::new(),
            handlers: Vec::new(),
            templates: TemplateStore::new(),
            role_defaults: Vec::new(),
        };
        let mut handler_names = HashSet::new();

        for role in roles {
            for handler in &role.handlers {
                if !handler_names.insert(handler.name.clone()) {
                    return Err(ProvisionError::Config(format!(
                        "handler '{}' in role '{}' is already defined by an earlier role",
                        handler.name, role.name
                    )));
                }
            }
            match role.templates {
                TemplateSource::Embedded(templates) => {
                    for (template, body) in templates {
                        playbook.templates.insert(template, body);
                    }
                }
                TemplateSource::Directory(dir) => playbook.templates.add_search_dir(dir),
            }
            playbook.role_defaults.push(VarLayer::new(
                format!("role {} defaults", role.name),
                role.defaults,
            ));
            playbook.tasks.extend(role.tasks);
            playbook.handlers.extend(role.handlers);
            playbook.roles.push(role.name);
        }

        Ok(playbook)
    }

    /// A playbook of loose tasks, for tests and ad-hoc runs
    pub fn from_tasks(name: &str, tasks: Vec<Task>, handlers: Vec<Handler>) -> Self {
        Self {
            name: name.to_string(),
            roles: Vec::new(),
            tasks,
            handlers,
            templates: TemplateStore::new(),
            role_defaults: Vec::new(),
        }
    }

    /// Variable layers in precedence order: target facts, global vars, role
    /// defaults, inventory host vars, run-time overrides
    pub fn variable_layers(
        &self,
        facts: Vars,
        global: Vars,
        host: Vars,
        overrides: Vars,
    ) -> Vec<VarLayer> {
        let mut layers = vec![
            VarLayer::new("target facts", facts),
            VarLayer::new("global vars", global),
        ];
        layers.extend(self.role_defaults.iter().cloned());
        layers.push(VarLayer::new("inventory host vars", host));
        layers.push(VarLayer::new("extra vars", overrides));
        layers
    }
}

//! Role bundles
//!
//! A role is an ordered task list plus default variables, handlers and
//! templates, laid out as
//!
//! ```text
//! roles/<name>/
//!   defaults/main.yml    variables, lowest precedence after global vars
//!   tasks/main.yml       ordered tasks (required)
//!   handlers/main.yml    handlers notified by the tasks
//!   templates/           files for `template` tasks
//! ```
//!
//! The `base` and `hardening` roles are compiled into the binary. A directory
//! of the same name under the config directory's `roles/` replaces the
//! built-in one.

use crate::apply::variables::Vars;
use crate::apply::{Handler, Task};
use crate::error::{ProvisionError, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::debug;

struct BuiltinRole {
    name: &'static str,
    description: &'static str,
    defaults: &'static str,
    tasks: &'static str,
    handlers: &'static str,
    templates: &'static [(&'static str, &'static str)],
}

const BUILTIN_ROLES: &[BuiltinRole] = &[
    BuiltinRole {
        name: "base",
        description: "Packages, Docker with swarm, the Dokploy container and a UFW baseline",
        defaults: include_str!("../roles/base/defaults/main.yml"),
        tasks: include_str!("../roles/base/tasks/main.yml"),
        handlers: "",
        templates: &[],
    },
    BuiltinRole {
        name: "hardening",
        description: "fail2ban, closing the initial Dokploy port and tightening sshd",
        defaults: include_str!("../roles/hardening/defaults/main.yml"),
        tasks: include_str!("../roles/hardening/tasks/main.yml"),
        handlers: include_str!("../roles/hardening/handlers/main.yml"),
        templates: &[(
            "jail.local.j2",
            include_str!("../roles/hardening/templates/jail.local.j2"),
        )],
    },
];

/// Where a role's templates come from
#[derive(Debug, Clone)]
pub enum TemplateSource {
    Embedded(Vec<(String, String)>),
    Directory(PathBuf),
}

/// A loaded role
#[derive(Debug, Clone)]
pub struct Role {
    pub name: String,
    pub description: String,
    pub defaults: Vars,
    pub tasks: Vec<Task>,
    pub handlers: Vec<Handler>,
    pub templates: TemplateSource,
}

fn parse<T: DeserializeOwned + Default>(role: &str, file: &str, content: &str) -> Result<T> {
    if content.trim().is_empty() {
        return Ok(T::default());
    }
    serde_yaml::from_str(content)
        .map_err(|e| ProvisionError::Config(format!("role '{}': {}: {}", role, file, e)))
}

impl Role {
    /// Build a role from file contents
    pub fn from_sources(
        name: &str,
        description: &str,
        defaults: &str,
        tasks: &str,
        handlers: &str,
        templates: TemplateSource,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            description: description.to_string(),
            defaults: parse(name, "defaults/main.yml", defaults)?,
            tasks: parse(name, "tasks/main.yml", tasks)?,
            handlers: parse(name, "handlers/main.yml", handlers)?,
            templates,
        })
    }

    /// Load a role directory
    pub fn from_dir(name: &str, dir: &Path) -> Result<Self> {
        let read_optional = |relative: &str| -> Result<String> {
            let path = dir.join(relative);
            if path.is_file() {
                Ok(std::fs::read_to_string(&path)?)
            } else {
                Ok(String::new())
            }
        };

        let tasks_path = dir.join("tasks/main.yml");
        if !tasks_path.is_file() {
            return Err(ProvisionError::Config(format!(
                "role '{}' is missing {}",
                name,
                tasks_path.display()
            )));
        }

        Self::from_sources(
            name,
            &format!("{} (from {})", name, dir.display()),
            &read_optional("defaults/main.yml")?,
            &std::fs::read_to_string(&tasks_path)?,
            &read_optional("handlers/main.yml")?,
            TemplateSource::Directory(dir.join("templates")),
        )
    }

    fn builtin(role: &BuiltinRole) -> Result<Self> {
        Self::from_sources(
            role.name,
            role.description,
            role.defaults,
            role.tasks,
            role.handlers,
            TemplateSource::Embedded(
                role.templates
                    .iter()
                    .map(|(name, body)| (name.to_string(), body.to_string()))
                    .collect(),
            ),
        )
    }
}

/// Finds roles on disk or among the built-ins
#[derive(Debug, Clone, Default)]
pub struct RoleLoader {
    roles_dir: Option<PathBuf>,
}

impl RoleLoader {
    pub fn new(roles_dir: Option<PathBuf>) -> Self {
        Self { roles_dir }
    }

    /// Built-in role names in definition order
    pub fn builtin_names() -> Vec<&'static str> {
        BUILTIN_ROLES.iter().map(|r| r.name).collect()
    }

    pub fn load(&self, name: &str) -> Result<Role> {
        if let Some(dir) = self.roles_dir.as_ref().map(|d| d.join(name)) {
            if dir.is_dir() {
                debug!("Loading role '{}' from {}", name, dir.display());
                return Role::from_dir(name, &dir);
            }
        }
        match BUILTIN_ROLES.iter().find(|r| r.name == name) {
            Some(role) => {
                debug!("Loading built-in role '{}'", name);
                Role::builtin(role)
            }
            None => Err(ProvisionError::RoleNotFound(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::TaskAction;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_roles_parse() {
        let loader = RoleLoader::default();
        for name in RoleLoader::builtin_names() {
            let role = loader.load(name).unwrap();
            assert!(!role.tasks.is_empty(), "role {} has no tasks", name);
        }
    }

    #[test]
    fn test_base_role_shape() {
        let role = RoleLoader::default().load("base").unwrap();
        assert_eq!(role.tasks[0].action.task_type(), "apt");
        assert!(role.handlers.is_empty());
        assert_eq!(role.defaults["dokploy_port"], serde_yaml::Value::from(3000));
        assert!(role
            .tasks
            .iter()
            .any(|t| matches!(&t.action, TaskAction::Container(c) if c.container == "dokploy")));
    }

    #[test]
    fn test_hardening_handlers_cover_notifications() {
        let role = RoleLoader::default().load("hardening").unwrap();
        for task in &role.tasks {
            for topic in &task.notify {
                assert!(
                    role.handlers.iter().any(|h| h.answers_to(topic)),
                    "no handler for {}",
                    topic
                );
            }
        }
        match &role.templates {
            TemplateSource::Embedded(templates) => {
                assert!(templates.iter().any(|(name, _)| name == "jail.local.j2"))
            }
            other => panic!("unexpected template source {:?}", other),
        }
    }

    #[test]
    fn test_unknown_role() {
        assert!(matches!(
            RoleLoader::default().load("webserver"),
            Err(ProvisionError::RoleNotFound(_))
        ));
    }

    #[test]
    fn test_disk_role_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        let role_dir = dir.path().join("base/tasks");
        std::fs::create_dir_all(&role_dir).unwrap();
        std::fs::write(
            role_dir.join("main.yml"),
            "- name: Only task\n  type: command\n  command: 'true'\n",
        )
        .unwrap();

        let role = RoleLoader::new(Some(dir.path().to_path_buf()))
            .load("base")
            .unwrap();
        assert_eq!(role.tasks.len(), 1);
        assert!(role.defaults.is_empty());
        assert!(matches!(role.templates, TemplateSource::Directory(_)));
    }

    #[test]
    fn test_disk_role_without_tasks_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("custom")).unwrap();
        let result = RoleLoader::new(Some(dir.path().to_path_buf())).load("custom");
        assert!(matches!(result, Err(ProvisionError::Config(_))));
    }

    #[test]
    fn test_invalid_yaml_names_the_file() {
        let err = Role::from_sources(
            "broken",
            "",
            "",
            "- type: nonsense\n",
            "",
            TemplateSource::Embedded(Vec::new()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("tasks/main.yml"));
    }
}

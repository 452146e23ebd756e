//! Desired-state tasks and their convergence
//!
//! A [`Task`] wraps one [`TaskAction`] with the controls the executor needs:
//! an applicability guard (`when`), the handlers to notify on change, and
//! whether a failure halts the run. Every action implements [`Converge`]:
//! it probes the target read-only and returns a [`Plan`] holding the minimal
//! set of commands that would bring the target to the desired state. An empty
//! plan means the target is already converged.
//!
//! **YAML Format:**
//! ```yaml
//! - name: Render fail2ban jail
//!   type: template
//!   src: jail.local.j2
//!   dest: /etc/fail2ban/jail.local
//!   notify:
//!     - restart fail2ban
//! ```

use crate::connection::{Connection, RemoteCommand};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

pub mod apt;
pub mod command;
pub mod container;
pub mod executor;
pub mod files;
pub mod lineinfile;
pub mod report;
pub mod service;
pub mod template;
pub mod templating;
pub mod ufw;
pub mod uri;
pub mod variables;


pub use apt::AptTask;
pub use command::CommandTask;
pub use container::ContainerTask;
pub use lineinfile::LineInFileTask;
pub use service::ServiceTask;
pub use template::{TemplateStore, TemplateTask};
pub use ufw::UfwTask;
pub use uri::UriTask;

use variables::VariableContext;

/// Default true value
pub fn default_true() -> bool {
    true
}

/// One idempotent convergence step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Name shown in logs and reports
    #[serde(default)]
    pub name: String,

    /// Applicability guard, a template expression such as `verify_url is defined`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// Handler names or listen topics to trigger when this task changes something
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,

    /// Record a failure and keep going instead of halting the run
    #[serde(default)]
    pub ignore_errors: bool,

    #[serde(flatten)]
    pub action: TaskAction,
}

impl Task {
    pub fn new(name: impl Into<String>, action: TaskAction) -> Self {
        Self {
            name: name.into(),
            when: None,
            notify: Vec::new(),
            ignore_errors: false,
            action,
        }
    }

    pub fn notify(mut self, handler: impl Into<String>) -> Self {
        self.notify.push(handler.into());
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.when = Some(condition.into());
        self
    }

    pub fn ignore_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    /// Name for display, falling back to the action's description or type
    pub fn display_name(&self) -> String {
        display_name(&self.name, &self.action)
    }
}

/// A deferred task, run at most once after the main pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handler {
    pub name: String,

    /// Extra topics this handler answers to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listen: Vec<String>,

    #[serde(flatten)]
    pub action: TaskAction,
}

impl Handler {
    pub fn new(name: impl Into<String>, action: TaskAction) -> Self {
        Self {
            name: name.into(),
            listen: Vec::new(),
            action,
        }
    }

    /// Whether a `notify` entry refers to this handler
    pub fn answers_to(&self, topic: &str) -> bool {
        self.name == topic || self.listen.iter().any(|t| t == topic)
    }
}

/// Desired-state kinds
///
/// These operations define desired system state and are converged idempotently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskAction {
    /// Debian/Ubuntu packages
    Apt(AptTask),
    /// systemd units
    Service(ServiceTask),
    /// UFW firewall rules and policy
    Ufw(UfwTask),
    /// Rendered file content
    Template(TemplateTask),
    /// Single line in a file
    LineInFile(LineInFileTask),
    /// Guarded shell command
    Command(CommandTask),
    /// Docker container
    Container(ContainerTask),
    /// HTTP status assertion
    Uri(UriTask),
}

impl TaskAction {
    /// Get the string representation of the task type
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskAction::Apt(_) => "apt",
            TaskAction::Service(_) => "service",
            TaskAction::Ufw(_) => "ufw",
            TaskAction::Template(_) => "template",
            TaskAction::LineInFile(_) => "lineinfile",
            TaskAction::Command(_) => "command",
            TaskAction::Container(_) => "container",
            TaskAction::Uri(_) => "uri",
        }
    }

    /// Convergence implementation for this action
    pub fn converger(&self) -> &dyn Converge {
        match self {
            TaskAction::Apt(task) => task,
            TaskAction::Service(task) => task,
            TaskAction::Ufw(task) => task,
            TaskAction::Template(task) => task,
            TaskAction::LineInFile(task) => task,
            TaskAction::Command(task) => task,
            TaskAction::Container(task) => task,
            TaskAction::Uri(task) => task,
        }
    }

    fn description(&self) -> Option<&str> {
        match self {
            TaskAction::Apt(task) => task.description.as_deref(),
            TaskAction::Service(task) => task.description.as_deref(),
            TaskAction::Ufw(task) => task.description.as_deref(),
            TaskAction::Template(task) => task.description.as_deref(),
            TaskAction::LineInFile(task) => task.description.as_deref(),
            TaskAction::Command(task) => task.description.as_deref(),
            TaskAction::Container(task) => task.description.as_deref(),
            TaskAction::Uri(task) => task.description.as_deref(),
        }
    }
}

fn display_name(name: &str, action: &TaskAction) -> String {
    if !name.is_empty() {
        return name.to_string();
    }
    action
        .description()
        .map(str::to_string)
        .unwrap_or_else(|| action.task_type().to_string())
}

/// Context handed to actions while planning
pub struct TaskContext<'a> {
    pub variables: &'a VariableContext,
    pub templates: &'a TemplateStore,
}

/// Probe-then-plan contract shared by every action
#[async_trait]
pub trait Converge: Send + Sync {
    /// Static checks that need no connection
    fn validate(&self) -> Result<()>;

    /// Probe the target and return what would have to change.
    ///
    /// Must not mutate the target. An empty plan means converged.
    async fn plan(&self, conn: &dyn Connection, ctx: &TaskContext<'_>) -> Result<Plan>;
}

/// One logical change and the commands that make it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub summary: String,
    pub commands: Vec<RemoteCommand>,
}

/// Ordered changes needed to reach the desired state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub changes: Vec<Change>,
}

impl Plan {
    pub fn in_sync() -> Self {
        Self::default()
    }

    pub fn is_in_sync(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn push(&mut self, summary: impl Into<String>, command: RemoteCommand) {
        self.changes.push(Change {
            summary: summary.into(),
            commands: vec![command],
        });
    }

    pub fn push_all(&mut self, summary: impl Into<String>, commands: Vec<RemoteCommand>) {
        self.changes.push(Change {
            summary: summary.into(),
            commands,
        });
    }

    pub fn summaries(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.summary.clone()).collect()
    }
}

/// Accept either a single string or a list of strings
pub fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<Scalar> for String {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

/// Accept a string, number or boolean where a string is expected (`port: 22`)
pub fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Scalar::deserialize(deserializer)?.into())
}

/// Optional variant of [`scalar_string`]
pub fn opt_scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(String::from))
}

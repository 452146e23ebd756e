//! Apply task executor
//!
//! Runs an ordered task list against one target: guard, render, probe, then
//! apply the planned commands (or only report them in dry-run). A failing task
//! halts the rest of the list unless it sets `ignore_errors`. Handlers notified
//! by changed tasks run once each, in first-notified order, after the main pass.

use crate::apply::report::{Outcome, RunReport, TaskReport};
use crate::apply::variables::VariableContext;
use crate::apply::{Handler, Plan, Task, TaskAction, TaskContext, TemplateStore};
use crate::connection::{self, Connection};
use crate::error::ProvisionError;
use indexmap::IndexSet;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Executor for apply tasks
pub struct TaskExecutor {
    dry_run: bool,
    variables: VariableContext,
    templates: TemplateStore,
    playbook: String,
    target: String,
    abort: Arc<AtomicBool>,
}

impl TaskExecutor {
    pub fn new(dry_run: bool, variables: VariableContext, templates: TemplateStore) -> Self {
        Self {
            dry_run,
            variables,
            templates,
            playbook: "tasks".to_string(),
            target: "localhost".to_string(),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Names recorded in the run report
    pub fn with_labels(mut self, playbook: impl Into<String>, target: impl Into<String>) -> Self {
        self.playbook = playbook.into();
        self.target = target.into();
        self
    }

    /// Get the dry_run flag
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Get the variables context
    pub fn variables(&self) -> &VariableContext {
        &self.variables
    }

    /// Flag that stops the run before the next task when set
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Check tasks and handlers without touching the target.
    ///
    /// Guards are evaluated so that tasks which would be skipped are not
    /// required to render.
    pub fn validate(&self, tasks: &[Task], handlers: &[Handler]) -> Result<(), ProvisionError> {
        debug!("Validating {} tasks and {} handlers", tasks.len(), handlers.len());

        let mut names = HashSet::new();
        for handler in handlers {
            if !names.insert(handler.name.as_str()) {
                return Err(ProvisionError::Config(format!(
                    "duplicate handler '{}'",
                    handler.name
                )));
            }
            self.check_action(&handler.action).map_err(|reason| {
                ProvisionError::Config(format!("handler '{}': {}", handler.name, reason))
            })?;
        }

        for (index, task) in tasks.iter().enumerate() {
            let invalid = |reason: String| ProvisionError::InvalidTask {
                index: index + 1,
                reason: format!("{}: {}", task.display_name(), reason),
            };

            if let Some(topic) = task
                .notify
                .iter()
                .find(|topic| !handlers.iter().any(|h| h.answers_to(topic)))
            {
                return Err(invalid(format!("notifies unknown handler '{}'", topic)));
            }

            if let Some(condition) = &task.when {
                let unknown = self
                    .variables
                    .undefined_guard_names(condition)
                    .map_err(|e| invalid(format!("invalid when '{}': {}", condition, e)))?;
                for name in unknown {
                    warn!(
                        "Task {} '{}': when reads '{}', which no variable layer defines",
                        index + 1,
                        task.display_name(),
                        name
                    );
                }
                match self.variables.evaluate_condition(condition) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => return Err(invalid(format!("invalid when '{}': {}", condition, e))),
                }
            }
            self.check_action(&task.action).map_err(invalid)?;
        }

        debug!("All tasks validated successfully");
        Ok(())
    }

    fn check_action(&self, action: &TaskAction) -> Result<(), String> {
        let rendered = self
            .variables
            .render_action(action)
            .map_err(|e| e.to_string())?;
        rendered
            .converger()
            .validate()
            .map_err(|e| format!("{:#}", e))?;
        if let TaskAction::Template(template) = &rendered {
            if let Some(src) = &template.src {
                if !self.templates.contains(src) {
                    return Err(format!("template '{}' not found", src));
                }
            }
        }
        Ok(())
    }

    /// Apply tasks in order, then flush notified handlers
    pub async fn apply(
        &self,
        conn: &dyn Connection,
        tasks: &[Task],
        handlers: &[Handler],
    ) -> RunReport {
        let mut report = RunReport::new(&self.playbook, &self.target, self.dry_run);
        let mut pending: IndexSet<usize> = IndexSet::new();
        let mut halted = false;

        info!(
            "Executing {} tasks on {}{}",
            tasks.len(),
            conn.describe(),
            if self.dry_run { " (dry run)" } else { "" }
        );

        for (index, task) in tasks.iter().enumerate() {
            if !halted && self.aborted() {
                warn!("Run interrupted; remaining tasks will not be attempted");
                report.aborted = true;
                halted = true;
            }
            if halted {
                report.tasks.push(TaskReport::new(
                    index,
                    task.display_name(),
                    task.action.task_type(),
                    Outcome::NotAttempted,
                ));
                continue;
            }

            let task_report = self.run_task(conn, index, task).await;
            if matches!(task_report.outcome, Outcome::Changed | Outcome::WouldChange) {
                notify(&mut pending, task, handlers);
            }
            if task_report.is_hard_failure() {
                error!("Task '{}' failed; halting", task_report.name);
                halted = true;
            }
            report.tasks.push(task_report);
        }

        if !report.aborted && self.aborted() {
            report.aborted = true;
        }

        if report.aborted {
            if !pending.is_empty() {
                warn!("Skipping {} notified handlers after interrupt", pending.len());
            }
        } else {
            for (order, &handler_index) in pending.iter().enumerate() {
                let handler = &handlers[handler_index];
                report
                    .handlers
                    .push(self.run_handler(conn, order, handler).await);
            }
        }

        report.finish();
        info!(
            "Run {} finished: {} changed, {} failed",
            report.run_id,
            report.summary.changed + report.summary.would_change,
            report.summary.failed
        );
        report
    }

    async fn run_task(&self, conn: &dyn Connection, index: usize, task: &Task) -> TaskReport {
        let started = Instant::now();
        let name = task.display_name();
        let mut report = TaskReport::new(index, &name, task.action.task_type(), Outcome::Unchanged);
        info!("TASK [{}]", name);

        let guard = match &task.when {
            Some(condition) => self
                .variables
                .evaluate_condition(condition)
                .map_err(|e| ProvisionError::ProbeFailed {
                    task: name.clone(),
                    source: e.into(),
                }),
            None => Ok(true),
        };

        let result = match guard {
            Ok(false) => {
                debug!("Skipping '{}': condition is false", name);
                report.outcome = Outcome::Skipped;
                Ok(Vec::new())
            }
            Ok(true) => self.converge(conn, &name, &task.action).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(changes) if changes.is_empty() => {}
            Ok(changes) => {
                report.outcome = if self.dry_run {
                    Outcome::WouldChange
                } else {
                    Outcome::Changed
                };
                report.changes = changes;
            }
            Err(e) => {
                report.outcome = Outcome::Failed;
                report.ignored = task.ignore_errors;
                if task.ignore_errors {
                    warn!("{} (ignored)", e);
                } else {
                    error!("{}", e);
                }
                report.error = Some(e.to_string());
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!("TASK [{}] {}", name, report.outcome);
        report
    }

    async fn run_handler(&self, conn: &dyn Connection, order: usize, handler: &Handler) -> TaskReport {
        let started = Instant::now();
        let mut report = TaskReport::new(
            order,
            &handler.name,
            handler.action.task_type(),
            Outcome::WouldChange,
        );
        info!("HANDLER [{}]", handler.name);

        if !self.dry_run {
            match self.converge(conn, &handler.name, &handler.action).await {
                Ok(changes) => {
                    report.outcome = if changes.is_empty() {
                        Outcome::Unchanged
                    } else {
                        Outcome::Changed
                    };
                    report.changes = changes;
                }
                Err(e) => {
                    let e = ProvisionError::HandlerFailed {
                        handler: handler.name.clone(),
                        source: e.into(),
                    };
                    error!("{}", e);
                    report.outcome = Outcome::Failed;
                    report.error = Some(e.to_string());
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!("HANDLER [{}] {}", handler.name, report.outcome);
        report
    }

    /// Render, probe and (outside dry-run) apply one action; returns the change summaries
    async fn converge(
        &self,
        conn: &dyn Connection,
        name: &str,
        action: &TaskAction,
    ) -> Result<Vec<String>, ProvisionError> {
        let probe_failed = |source: anyhow::Error| ProvisionError::ProbeFailed {
            task: name.to_string(),
            source,
        };

        let rendered = self
            .variables
            .render_action(action)
            .map_err(|e| probe_failed(e.into()))?;
        let converger = rendered.converger();
        converger.validate().map_err(probe_failed)?;

        let ctx = TaskContext {
            variables: &self.variables,
            templates: &self.templates,
        };
        let plan: Plan = converger.plan(conn, &ctx).await.map_err(probe_failed)?;
        if plan.is_in_sync() {
            return Ok(Vec::new());
        }

        if !self.dry_run {
            for change in &plan.changes {
                debug!("Applying: {}", change.summary);
                for command in &change.commands {
                    connection::run_command(conn, command).await.map_err(|source| {
                        ProvisionError::ApplyFailed {
                            task: name.to_string(),
                            source,
                        }
                    })?;
                }
            }
        }

        Ok(plan.summaries())
    }
}

/// Queue handlers answering to the task's notify entries, keeping first-notified order
fn notify(pending: &mut IndexSet<usize>, task: &Task, handlers: &[Handler]) {
    for topic in &task.notify {
        for (index, handler) in handlers.iter().enumerate() {
            if handler.answers_to(topic) && pending.insert(index) {
                debug!("Notified handler '{}'", handler.name);
            }
        }
    }
}

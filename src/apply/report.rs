//! Run results
//!
//! The executor records one [`TaskReport`] per task and per pending handler.
//! A [`RunReport`] renders as a human recap or serializes to JSON for CI.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Result of one task or handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Target already matched
    Unchanged,
    /// Target was mutated
    Changed,
    /// Dry-run: target would be mutated
    WouldChange,
    /// Guard evaluated false
    Skipped,
    /// Probe or apply error
    Failed,
    /// Not reached because the run halted
    NotAttempted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Unchanged => "unchanged",
            Outcome::Changed => "changed",
            Outcome::WouldChange => "would-change",
            Outcome::Skipped => "skipped",
            Outcome::Failed => "failed",
            Outcome::NotAttempted => "not-attempted",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one task or handler
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    /// Position in the playbook (handlers are numbered in run order)
    pub index: usize,
    pub name: String,
    pub task_type: String,
    pub outcome: Outcome,
    /// What changed, or would change
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failed, but `ignore_errors` let the run continue
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
    pub duration_ms: u64,
}

impl TaskReport {
    pub fn new(index: usize, name: impl Into<String>, task_type: &str, outcome: Outcome) -> Self {
        Self {
            index,
            name: name.into(),
            task_type: task_type.to_string(),
            outcome,
            changes: Vec::new(),
            error: None,
            ignored: false,
            duration_ms: 0,
        }
    }

    /// A failure that counts against the run
    pub fn is_hard_failure(&self) -> bool {
        self.outcome == Outcome::Failed && !self.ignored
    }
}

/// Outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub unchanged: usize,
    pub changed: usize,
    pub would_change: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_attempted: usize,
}

impl Summary {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Changed => self.changed += 1,
            Outcome::WouldChange => self.would_change += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::NotAttempted => self.not_attempted += 1,
        }
    }
}

/// Everything that happened in one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub playbook: String,
    pub target: String,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Interrupted before all tasks ran
    pub aborted: bool,
    pub tasks: Vec<TaskReport>,
    pub handlers: Vec<TaskReport>,
    pub summary: Summary,
}

impl RunReport {
    pub fn new(playbook: impl Into<String>, target: impl Into<String>, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            playbook: playbook.into(),
            target: target.into(),
            dry_run,
            started_at: now,
            finished_at: now,
            aborted: false,
            tasks: Vec::new(),
            handlers: Vec::new(),
            summary: Summary::default(),
        }
    }

    /// Close the report: stamp the end time and count outcomes
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
        let mut summary = Summary::default();
        for report in self.tasks.iter().chain(self.handlers.iter()) {
            summary.count(report.outcome);
        }
        self.summary = summary;
    }

    /// Outcome of the named task, first match
    pub fn outcome_of(&self, name: &str) -> Option<Outcome> {
        self.tasks
            .iter()
            .chain(self.handlers.iter())
            .find(|r| r.name == name)
            .map(|r| r.outcome)
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.tasks.iter().map(|r| r.outcome).collect()
    }

    /// No hard failures and not aborted
    pub fn succeeded(&self) -> bool {
        !self.aborted
            && !self
                .tasks
                .iter()
                .chain(self.handlers.iter())
                .any(TaskReport::is_hard_failure)
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    /// Human-readable recap
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " (dry run)" } else { "" };
        out.push_str(&format!(
            "PLAY [{}] on {}{}\n",
            self.playbook, self.target, mode
        ));

        for report in &self.tasks {
            render_line(&mut out, "TASK", report);
        }
        for report in &self.handlers {
            render_line(&mut out, "HANDLER", report);
        }

        let s = &self.summary;
        out.push_str(&format!(
            "RECAP {}: unchanged={} changed={} would-change={} skipped={} failed={} not-attempted={}",
            self.target, s.unchanged, s.changed, s.would_change, s.skipped, s.failed, s.not_attempted
        ));
        if self.aborted {
            out.push_str(" (aborted)");
        }
        out.push('\n');
        out
    }
}

fn render_line(out: &mut String, kind: &str, report: &TaskReport) {
    let ignored = if report.ignored { " (ignored)" } else { "" };
    out.push_str(&format!(
        "{} [{}] {}{}\n",
        kind, report.name, report.outcome, ignored
    ));
    for change in &report.changes {
        out.push_str(&format!("    ~ {}\n", change));
    }
    if let Some(error) = &report.error {
        out.push_str(&format!("    ! {}\n", error));
    }
}

//! Line in file task
//!
//! Ensures a single line is present in (or absent from) a remote file. The
//! file is read, edited locally and written back only when the edit changes
//! something, keeping the existing mode and ownership.
//!
//! # Examples
//!
//! ```yaml
//! - name: Disable SSH password logins
//!   type: lineinfile
//!   path: /etc/ssh/sshd_config
//!   regexp: '^#?\s*PasswordAuthentication\s'
//!   line: PasswordAuthentication no
//!   validate: sshd -t -f %s
//!   notify: restart ssh
//! ```

use super::files::{self, WriteOptions};
use super::{scalar_string, Converge, Plan, TaskContext};
use crate::connection::Connection;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Line state enumeration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineState {
    /// Ensure line is present
    #[default]
    Present,
    /// Ensure line is absent
    Absent,
}

/// Line in file task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineInFileTask {
    /// Optional description of what this task does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// File to edit
    pub path: String,

    /// Pattern selecting the line to replace (or remove)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,

    /// The line itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,

    #[serde(default)]
    pub state: LineState,

    /// Create the file when missing
    #[serde(default)]
    pub create: bool,

    /// Mode for a newly created file
    #[serde(default = "default_mode", deserialize_with = "scalar_string")]
    pub mode: String,

    /// Command checking the edited file before it replaces the original (`%s` is its path)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<String>,

    #[serde(default)]
    pub backup: bool,
}

fn default_mode() -> String {
    "0644".to_string()
}

/// Apply the line edit to `content`; `None` when nothing changes.
///
/// Present: the last line matching `regexp` is replaced by `line`; with no
/// match, `line` is appended unless an identical line already exists.
/// Absent: every line matching `regexp` (or equal to `line`) is removed.
pub fn edit_lines(
    content: &str,
    regexp: Option<&Regex>,
    line: Option<&str>,
    state: LineState,
) -> Option<String> {
    let mut lines: Vec<&str> = content.lines().collect();
    let matches = |candidate: &str| match regexp {
        Some(re) => re.is_match(candidate),
        None => Some(candidate) == line,
    };

    match state {
        LineState::Present => {
            let line = line?;
            match lines.iter().rposition(|l| matches(*l)) {
                Some(index) if lines[index] == line => return None,
                Some(index) => lines[index] = line,
                None if lines.contains(&line) => return None,
                None => lines.push(line),
            }
        }
        LineState::Absent => {
            let before = lines.len();
            lines.retain(|l| !matches(*l));
            if lines.len() == before {
                return None;
            }
        }
    }

    let mut edited = lines.join("\n");
    if !edited.is_empty() {
        edited.push('\n');
    }
    Some(edited)
}

impl LineInFileTask {
    fn compiled_regexp(&self) -> Result<Option<Regex>> {
        self.regexp
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("invalid regexp '{}'", pattern))
            })
            .transpose()
    }
}

#[async_trait]
impl Converge for LineInFileTask {
    fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            bail!("lineinfile task needs a path");
        }
        match self.state {
            LineState::Present if self.line.is_none() => {
                bail!("lineinfile present on {} needs a line", self.path)
            }
            LineState::Absent if self.line.is_none() && self.regexp.is_none() => {
                bail!("lineinfile absent on {} needs a regexp or line", self.path)
            }
            _ => {}
        }
        if let Some(line) = &self.line {
            if line.contains('\n') {
                bail!("lineinfile line must be a single line");
            }
        }
        self.compiled_regexp()?;
        Ok(())
    }

    async fn plan(&self, conn: &dyn Connection, _ctx: &TaskContext<'_>) -> Result<Plan> {
        let regexp = self.compiled_regexp()?;
        let mut plan = Plan::in_sync();

        let current = files::read_file(conn, &self.path).await?;
        let (content, stat) = match current {
            Some(content) => (content, files::remote_stat(conn, &self.path).await?),
            None => {
                if self.state == LineState::Absent {
                    return Ok(plan);
                }
                if !self.create {
                    bail!("{} does not exist", self.path);
                }
                (String::new(), None)
            }
        };

        let Some(edited) = edit_lines(&content, regexp.as_ref(), self.line.as_deref(), self.state)
        else {
            return Ok(plan);
        };

        let (mode, owner, group) = match &stat {
            Some(stat) => (
                stat.mode.as_str(),
                Some(stat.owner.as_str()),
                Some(stat.group.as_str()),
            ),
            None => (self.mode.as_str(), None, None),
        };
        let options = WriteOptions {
            mode: Some(mode),
            owner,
            group,
            validate: self.validate.as_deref(),
            backup: self.backup && stat.is_some(),
        };
        let summary = match (self.state, &self.line) {
            (LineState::Present, Some(line)) => format!("{}: + {}", self.path, line),
            _ => format!(
                "{}: - {}",
                self.path,
                self.regexp.as_deref().or(self.line.as_deref()).unwrap_or_default()
            ),
        };
        plan.push_all(summary, files::write_commands(&self.path, &edited, &options)?);
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::tests::plan_for;
    use crate::connection::fake::FakeHost;

    const SSHD: &str = "Port 22\n#PasswordAuthentication yes\nUsePAM yes\n";

    fn password_task() -> LineInFileTask {
        serde_yaml::from_str(
            r#"
path: /etc/ssh/sshd_config
regexp: '^#?\s*PasswordAuthentication\s'
line: PasswordAuthentication no
validate: sshd -t -f %s
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_edit_replaces_last_match() {
        let re = Regex::new(r"^#?\s*PasswordAuthentication\s").unwrap();
        let edited = edit_lines(
            SSHD,
            Some(&re),
            Some("PasswordAuthentication no"),
            LineState::Present,
        )
        .unwrap();
        assert_eq!(edited, "Port 22\nPasswordAuthentication no\nUsePAM yes\n");

        assert_eq!(
            edit_lines(
                &edited,
                Some(&re),
                Some("PasswordAuthentication no"),
                LineState::Present
            ),
            None
        );
    }

    #[test]
    fn test_edit_appends_without_match() {
        let re = Regex::new(r"^KbdInteractiveAuthentication\s").unwrap();
        let edited = edit_lines(
            SSHD,
            Some(&re),
            Some("KbdInteractiveAuthentication no"),
            LineState::Present,
        )
        .unwrap();
        assert!(edited.ends_with("UsePAM yes\nKbdInteractiveAuthentication no\n"));
    }

    #[test]
    fn test_edit_without_regexp_checks_exact_line() {
        assert_eq!(
            edit_lines(SSHD, None, Some("UsePAM yes"), LineState::Present),
            None
        );
        assert_eq!(
            edit_lines("", None, Some("a"), LineState::Present).as_deref(),
            Some("a\n")
        );
    }

    #[test]
    fn test_edit_absent() {
        let re = Regex::new(r"^PasswordAuthentication\s+yes").unwrap();
        let content = "PasswordAuthentication yes\nChallengeResponse no\n";
        assert_eq!(
            edit_lines(content, Some(&re), None, LineState::Absent).as_deref(),
            Some("ChallengeResponse no\n")
        );
        assert_eq!(
            edit_lines("ChallengeResponse no\n", Some(&re), None, LineState::Absent),
            None
        );
        assert_eq!(
            edit_lines("PasswordAuthentication yes\n", Some(&re), None, LineState::Absent)
                .as_deref(),
            Some("")
        );
    }

    #[test]
    fn test_validate() {
        assert!(password_task().validate().is_ok());

        let mut task = password_task();
        task.line = None;
        assert!(task.validate().is_err());

        let mut task = password_task();
        task.regexp = Some("(".to_string());
        assert!(task.validate().is_err());
    }

    #[tokio::test]
    async fn test_plan_preserves_mode_and_validates() {
        let host = FakeHost::new();
        host.write_file_with_mode("/etc/ssh/sshd_config", SSHD, "644");

        let plan = plan_for(&password_task(), &host).await.unwrap();
        assert_eq!(
            plan.summaries(),
            vec!["/etc/ssh/sshd_config: + PasswordAuthentication no"]
        );
        let commands = &plan.changes[0].commands;
        assert!(commands[0].command.starts_with("install -D -m 644 -o root -g root"));
        assert!(commands[1].command.starts_with("sshd -t -f "));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let host = FakeHost::new();
        assert!(plan_for(&password_task(), &host).await.is_err());

        let mut absent = password_task();
        absent.state = LineState::Absent;
        assert!(plan_for(&absent, &host).await.unwrap().is_in_sync());

        let mut create = password_task();
        create.create = true;
        create.validate = None;
        let plan = plan_for(&create, &host).await.unwrap();
        assert_eq!(plan.changes[0].commands.len(), 1);
    }
}

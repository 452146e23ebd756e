//! URI check task
//!
//! Asserts that a URL answers with the expected HTTP status, fetched with
//! `curl` on the target. The check never changes anything: a matching status
//! is in sync, anything else fails the task.
//!
//! # Examples
//!
//! ```yaml
//! - name: Dokploy answers over HTTPS
//!   type: uri
//!   url: "{{ verify_url }}"
//!   status: 200
//!   when: verify_url is defined
//! ```

use super::{Converge, Plan, TaskContext};
use crate::connection::{quote, Connection};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// URI check task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UriTask {
    /// Optional description of what this task does
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub url: String,

    /// Expected HTTP status
    #[serde(default = "default_status")]
    pub status: u16,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Reject invalid TLS certificates
    #[serde(default = "super::default_true")]
    pub validate_certs: bool,
}

fn default_status() -> u16 {
    200
}

fn default_timeout() -> u64 {
    10
}

impl UriTask {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            description: None,
            url: url.into(),
            status: default_status(),
            timeout_secs: default_timeout(),
            validate_certs: true,
        }
    }

    fn curl_command(&self) -> Result<String> {
        let mut command = format!(
            "curl -sS -o /dev/null -w '%{{http_code}}' --max-time {}",
            self.timeout_secs
        );
        if !self.validate_certs {
            command.push_str(" -k");
        }
        command.push(' ');
        command.push_str(&quote(&self.url)?);
        Ok(command)
    }
}

#[async_trait]
impl Converge for UriTask {
    fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            bail!("uri task needs an http(s) url, got '{}'", self.url);
        }
        if !(100..=599).contains(&self.status) {
            bail!("invalid expected status {}", self.status);
        }
        Ok(())
    }

    async fn plan(&self, conn: &dyn Connection, _ctx: &TaskContext<'_>) -> Result<Plan> {
        let output = conn.exec(&self.curl_command()?, None).await?;
        let code = output.stdout.trim();
        debug!("{} answered {}", self.url, code);
        if !output.success() {
            bail!(
                "{} is not reachable: {}",
                self.url,
                output.stderr.trim()
            );
        }
        if code != self.status.to_string() {
            bail!(
                "{} answered {} but {} was expected",
                self.url,
                code,
                self.status
            );
        }
        Ok(Plan::in_sync())
    }
}

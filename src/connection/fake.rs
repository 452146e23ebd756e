//! In-memory target host for tests
//!
//! Interprets the shell commands the tasks emit (package, service, firewall,
//! container and file commands) against a small model of an Ubuntu host, so
//! convergence runs can be exercised end to end without SSH.

use super::{CommandOutput, Connection};
use crate::apply::files::checksum;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

pub const UFW_CONF: &str = "/etc/ufw/ufw.conf";
pub const UFW_DEFAULTS: &str = "/etc/default/ufw";
pub const DOCKER_INSTALL_URL: &str = "https://get.docker.com";
/// Body served for [`DOCKER_INSTALL_URL`]; running it installs Docker
pub const DOCKER_INSTALL_SCRIPT: &str = "#!/bin/sh\n# get-docker\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFile {
    pub content: String,
    pub mode: String,
    pub owner: String,
    pub group: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FakeService {
    pub active: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContainer {
    pub image: String,
    pub hash: String,
    pub running: bool,
}

/// Everything a task can observe or change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeState {
    pub packages: BTreeSet<String>,
    pub services: BTreeMap<String, FakeService>,
    pub files: BTreeMap<String, FakeFile>,
    pub ufw_rules: Vec<String>,
    pub containers: BTreeMap<String, FakeContainer>,
    pub networks: BTreeSet<String>,
    pub swarm_active: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: FakeState,
    scripts: HashMap<String, (i32, String)>,
    urls: HashMap<String, u16>,
    downloads: HashMap<String, String>,
    failures: Vec<String>,
    log: Vec<String>,
}

/// Scriptable stand-in for a remote host
#[derive(Debug, Default)]
pub struct FakeHost {
    inner: Mutex<Inner>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(status: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        status,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

fn status(success: bool) -> CommandOutput {
    if success {
        ok("")
    } else {
        fail(1, "")
    }
}

fn normalize_mode(mode: &str) -> String {
    let trimmed = mode.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

impl FakeHost {
    /// An empty host
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh Ubuntu host: no packages, UFW inactive with its stock default-deny policy, sshd running
    pub fn ubuntu() -> Self {
        let host = Self::new();
        host.write_file(UFW_CONF, "ENABLED=no\nLOGLEVEL=low\n");
        host.write_file(
            UFW_DEFAULTS,
            "IPV6=yes\nDEFAULT_INPUT_POLICY=\"DROP\"\nDEFAULT_OUTPUT_POLICY=\"ACCEPT\"\nDEFAULT_FORWARD_POLICY=\"DROP\"\n",
        );
        host.write_file(
            "/etc/ssh/sshd_config",
            "Include /etc/ssh/sshd_config.d/*.conf\n#PermitRootLogin prohibit-password\n#PasswordAuthentication yes\nKbdInteractiveAuthentication no\nUsePAM yes\n",
        );
        host.write_file(
            "/etc/ssh/sshd_config.d/50-cloud-init.conf",
            "PasswordAuthentication yes\n",
        );
        host.add_service("ssh", true, true);
        host.serve(DOCKER_INSTALL_URL, DOCKER_INSTALL_SCRIPT);
        host
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner)
    }

    pub fn state(&self) -> FakeState {
        self.with(|inner| inner.state.clone())
    }

    /// Every command executed so far
    pub fn commands(&self) -> Vec<String> {
        self.with(|inner| inner.log.clone())
    }

    /// How many times exactly this command ran
    pub fn count(&self, command: &str) -> usize {
        self.with(|inner| inner.log.iter().filter(|c| *c == command).count())
    }

    pub fn install_package(&self, name: &str) {
        self.with(|inner| inner.state.packages.insert(name.to_string()));
    }

    pub fn add_service(&self, name: &str, active: bool, enabled: bool) {
        self.with(|inner| {
            inner
                .state
                .services
                .insert(name.to_string(), FakeService { active, enabled })
        });
    }

    pub fn service(&self, name: &str) -> Option<FakeService> {
        self.with(|inner| inner.state.services.get(name).copied())
    }

    /// Add a rule in `ufw show added` form without the leading `ufw`
    pub fn add_ufw_rule(&self, rule: &str) {
        self.with(|inner| inner.state.ufw_rules.push(rule.to_string()));
    }

    pub fn write_file(&self, path: &str, content: &str) {
        self.write_file_with_mode(path, content, "644");
    }

    pub fn write_file_with_mode(&self, path: &str, content: &str, mode: &str) {
        self.with(|inner| {
            inner.state.files.insert(
                path.to_string(),
                FakeFile {
                    content: content.to_string(),
                    mode: normalize_mode(mode),
                    owner: "root".to_string(),
                    group: "root".to_string(),
                },
            )
        });
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.with(|inner| inner.state.files.get(path).map(|f| f.content.clone()))
    }

    pub fn add_container(&self, name: &str, image: &str, hash: &str, running: bool) {
        self.with(|inner| {
            inner.state.containers.insert(
                name.to_string(),
                FakeContainer {
                    image: image.to_string(),
                    hash: hash.to_string(),
                    running,
                },
            )
        });
    }

    /// Status `curl` reports for a URL; unknown URLs do not resolve
    pub fn set_url_status(&self, url: &str, code: u16) {
        self.with(|inner| inner.urls.insert(url.to_string(), code));
    }

    /// Content `curl -o` saves for a URL
    pub fn serve(&self, url: &str, body: &str) {
        self.with(|inner| inner.downloads.insert(url.to_string(), body.to_string()));
    }

    /// Make downloads of a URL fail
    pub fn unserve(&self, url: &str) {
        self.with(|inner| inner.downloads.remove(url));
    }

    /// Canned result for an exact command string
    pub fn add_script(&self, command: &str, status: i32, stdout: &str) {
        self.with(|inner| {
            inner
                .scripts
                .insert(command.to_string(), (status, stdout.to_string()))
        });
    }

    /// Make every command containing `pattern` fail
    pub fn fail_on(&self, pattern: &str) {
        self.with(|inner| inner.failures.push(pattern.to_string()));
    }
}

impl Inner {
    fn run(&mut self, command: &str, stdin: Option<&[u8]>) -> CommandOutput {
        self.log.push(command.to_string());

        if self.failures.iter().any(|p| command.contains(p.as_str())) {
            return fail(1, format!("injected failure: {}", command));
        }
        if let Some((status, stdout)) = self.scripts.get(command) {
            return CommandOutput {
                status: *status,
                stdout: stdout.clone(),
                stderr: String::new(),
            };
        }

        // Validate-then-clean-up wrapper around a staged file
        if let Some((check, cleanup)) = command.split_once(" || { rm -f ") {
            let output = self.run_simple(check, None);
            if !output.success() {
                let staged = cleanup.trim_end_matches("; exit 1; }").trim();
                self.remove(staged);
                return fail(1, output.stderr);
            }
            return output;
        }
        if let Some((dir, rest)) = command.strip_prefix("cd ").and_then(|c| c.split_once(" && ")) {
            if dir.is_empty() {
                return fail(1, "cd: missing directory");
            }
            return self.run(rest, stdin);
        }
        if let Some((first, rest)) = command.split_once(" && ") {
            let output = self.run_simple(first, None);
            if !output.success() {
                return output;
            }
            return self.run(rest, stdin);
        }
        if command.starts_with("docker info") && command.contains("Swarm: active") {
            return status(self.state.swarm_active);
        }

        self.run_simple(command, stdin)
    }

    fn run_simple(&mut self, command: &str, stdin: Option<&[u8]>) -> CommandOutput {
        let Some(words) = shlex::split(command) else {
            return fail(2, format!("syntax error: {}", command));
        };
        let words: Vec<String> = words
            .into_iter()
            .skip_while(|w| w.contains('=') && !w.starts_with('-'))
            .filter(|w| !(w.starts_with('>') || w.starts_with("2>")))
            .collect();
        let args: Vec<&str> = words.iter().map(String::as_str).collect();

        match args.as_slice() {
            ["test", "-e", path] => status(self.state.files.contains_key(*path)),
            ["cat", path] => match self.state.files.get(*path) {
                Some(file) => ok(file.content.clone()),
                None => fail(1, format!("cat: {}: No such file or directory", path)),
            },
            ["sha256sum", path] => match self.state.files.get(*path) {
                Some(file) => ok(format!("{}  {}\n", checksum(&file.content), path)),
                None => fail(1, "sha256sum: No such file or directory"),
            },
            ["stat", "-c", _, path] => match self.state.files.get(*path) {
                Some(file) => ok(format!("{} {} {}\n", file.mode, file.owner, file.group)),
                None => fail(1, "stat: cannot statx"),
            },
            ["install", "-D", rest @ ..] => self.install(rest, stdin),
            ["cp", "-a", from, to] => match self.state.files.get(*from).cloned() {
                Some(file) => {
                    self.state.files.insert(to.to_string(), file);
                    ok("")
                }
                None => fail(1, "cp: cannot stat"),
            },
            ["mv", "-f", from, to] => match self.state.files.remove(*from) {
                Some(file) => {
                    self.state.files.insert(to.to_string(), file);
                    ok("")
                }
                None => fail(1, "mv: cannot stat"),
            },
            ["rm", "-f", path] => {
                self.remove(path);
                ok("")
            }
            ["chmod", mode, path] => match self.state.files.get_mut(*path) {
                Some(file) => {
                    file.mode = normalize_mode(mode);
                    ok("")
                }
                None => fail(1, "chmod: cannot access"),
            },
            ["chown", owner_group, path] => match self.state.files.get_mut(*path) {
                Some(file) => {
                    let (owner, group) = owner_group.split_once(':').unwrap_or((owner_group, ""));
                    file.owner = owner.to_string();
                    if !group.is_empty() {
                        file.group = group.to_string();
                    }
                    ok("")
                }
                None => fail(1, "chown: cannot access"),
            },
            ["sshd", "-t", "-f", path] => match self.state.files.get(*path) {
                Some(file) if !file.content.contains("INVALID") => ok(""),
                Some(_) => fail(255, "sshd: bad configuration option"),
                None => fail(255, "sshd: no such file"),
            },
            ["dpkg-query", "-W", _, package] => {
                if self.state.packages.contains(*package) {
                    ok("install ok installed")
                } else {
                    fail(1, format!("dpkg-query: no packages found matching {}", package))
                }
            }
            ["apt-get", "update", ..] => ok(""),
            ["apt-get", verb @ ("install" | "remove"), rest @ ..] => {
                for package in rest.iter().filter(|w| !w.starts_with('-')) {
                    if *verb == "install" {
                        self.state.packages.insert(package.to_string());
                        if *package == "fail2ban" {
                            self.state.services.insert(
                                "fail2ban".to_string(),
                                FakeService {
                                    active: true,
                                    enabled: true,
                                },
                            );
                        }
                    } else {
                        self.state.packages.remove(*package);
                    }
                }
                ok("")
            }
            ["systemctl", verb, unit] => self.systemctl(verb, unit),
            ["ufw", rest @ ..] => self.ufw(rest),
            ["docker", rest @ ..] => self.docker(rest),
            ["curl", "-fsSL", "-o", path, url] => match self.downloads.get(*url).cloned() {
                Some(body) => {
                    self.write(path, body, "644", None, None);
                    ok("")
                }
                None => fail(22, format!("curl: (22) The requested URL returned error: 404 {}", url)),
            },
            ["sh", path] => {
                let is_docker_script = self
                    .state
                    .files
                    .get(*path)
                    .map(|file| file.content == DOCKER_INSTALL_SCRIPT);
                match is_docker_script {
                    Some(true) => self.install_docker(),
                    Some(false) => ok(""),
                    None => fail(2, format!("sh: 0: cannot open {}: No such file", path)),
                }
            }
            ["curl", .., url] if args.contains(&"%{http_code}") => match self.urls.get(*url) {
                Some(code) => ok(code.to_string()),
                None => fail(6, format!("curl: (6) Could not resolve host: {}", url)),
            },
            ["true"] => ok(""),
            ["false"] => fail(1, ""),
            ["touch", path] => {
                if !self.state.files.contains_key(*path) {
                    self.write(path, String::new(), "644", None, None);
                }
                ok("")
            }
            ["echo", rest @ ..] => ok(format!("{}\n", rest.join(" "))),
            _ => fail(127, format!("{}: command not found", args.first().unwrap_or(&""))),
        }
    }

    fn install_docker(&mut self) -> CommandOutput {
        self.state.packages.insert("docker-ce".to_string());
        self.write("/usr/bin/docker", String::new(), "755", None, None);
        self.state
            .services
            .insert("docker".to_string(), FakeService::default());
        ok("Docker installed\n")
    }

    fn write(&mut self, path: &str, content: String, mode: &str, owner: Option<&str>, group: Option<&str>) {
        self.state.files.insert(
            path.to_string(),
            FakeFile {
                content,
                mode: normalize_mode(mode),
                owner: owner.unwrap_or("root").to_string(),
                group: group.unwrap_or("root").to_string(),
            },
        );
    }

    fn remove(&mut self, path: &str) {
        self.state.files.remove(path);
    }

    fn install(&mut self, args: &[&str], stdin: Option<&[u8]>) -> CommandOutput {
        let mut mode = "755";
        let mut owner = None;
        let mut group = None;
        let mut rest = args;
        loop {
            match rest {
                ["-m", value, tail @ ..] => {
                    mode = *value;
                    rest = tail;
                }
                ["-o", value, tail @ ..] => {
                    owner = Some(*value);
                    rest = tail;
                }
                ["-g", value, tail @ ..] => {
                    group = Some(*value);
                    rest = tail;
                }
                _ => break,
            }
        }
        match rest {
            ["/dev/stdin", dest] => {
                let content = String::from_utf8_lossy(stdin.unwrap_or_default()).to_string();
                self.write(dest, content, mode, owner, group);
                ok("")
            }
            _ => fail(1, "install: unsupported arguments"),
        }
    }

    fn systemctl(&mut self, verb: &str, unit: &str) -> CommandOutput {
        let Some(service) = self.state.services.get_mut(unit) else {
            return fail(5, format!("Unit {}.service not found.", unit));
        };
        match verb {
            "is-active" => status(service.active),
            "is-enabled" => status(service.enabled),
            "start" | "restart" | "reload" => {
                service.active = true;
                ok("")
            }
            "stop" => {
                service.active = false;
                ok("")
            }
            "enable" => {
                service.enabled = true;
                ok("")
            }
            "disable" => {
                service.enabled = false;
                ok("")
            }
            _ => fail(1, format!("Unknown command verb {}", verb)),
        }
    }

    fn set_config(&mut self, path: &str, key: &str, value: &str) {
        let current = self
            .state
            .files
            .get(path)
            .map(|f| f.content.clone())
            .unwrap_or_default();
        let mut found = false;
        let mut lines: Vec<String> = current
            .lines()
            .map(|line| {
                if line.split_once('=').map(|(k, _)| k.trim()) == Some(key) {
                    found = true;
                    format!("{}={}", key, value)
                } else {
                    line.to_string()
                }
            })
            .collect();
        if !found {
            lines.push(format!("{}={}", key, value));
        }
        self.write(path, format!("{}\n", lines.join("\n")), "644", None, None);
    }

    fn ufw(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["show", "added"] => {
                let mut out =
                    String::from("Added user rules (see 'ufw status' for running firewall):\n");
                if self.state.ufw_rules.is_empty() {
                    out.push_str("(None)\n");
                }
                for rule in &self.state.ufw_rules {
                    out.push_str(&format!("ufw {}\n", rule));
                }
                ok(out)
            }
            ["--force", "enable"] => {
                self.set_config(UFW_CONF, "ENABLED", "yes");
                ok("Firewall is active and enabled on system startup\n")
            }
            ["disable"] => {
                self.set_config(UFW_CONF, "ENABLED", "no");
                ok("Firewall stopped and disabled on system startup\n")
            }
            ["logging", level] => {
                self.set_config(UFW_CONF, "LOGLEVEL", level);
                ok("")
            }
            ["default", policy, direction] => {
                let key = match *direction {
                    "outgoing" => "DEFAULT_OUTPUT_POLICY",
                    "routed" => "DEFAULT_FORWARD_POLICY",
                    _ => "DEFAULT_INPUT_POLICY",
                };
                let target = match *policy {
                    "allow" => "ACCEPT",
                    "reject" => "REJECT",
                    _ => "DROP",
                };
                self.set_config(UFW_DEFAULTS, key, &format!("\"{}\"", target));
                ok("")
            }
            ["delete", rule @ ..] => {
                let rule = rule.join(" ");
                let before = self.state.ufw_rules.len();
                self.state.ufw_rules.retain(|r| *r != rule);
                if self.state.ufw_rules.len() == before {
                    ok("Could not delete non-existent rule\n")
                } else {
                    ok("Rule deleted\n")
                }
            }
            ["allow" | "deny" | "reject" | "limit", ..] => {
                let rule = args.join(" ");
                if !self.state.ufw_rules.contains(&rule) {
                    self.state.ufw_rules.push(rule);
                }
                ok("Rule added\n")
            }
            _ => fail(1, "ERROR: Invalid syntax"),
        }
    }

    fn docker(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["inspect", "--format", _, name] => match self.state.containers.get(*name) {
                Some(c) => ok(format!("{}|{}|{}\n", c.running, c.image, c.hash)),
                None => fail(1, format!("Error: No such object: {}", name)),
            },
            ["run", rest @ ..] => {
                let mut name = None;
                let mut hash = String::new();
                let mut i = 0;
                while i < rest.len() {
                    match rest[i] {
                        "--name" => name = rest.get(i + 1).copied(),
                        "--label" => {
                            if let Some((_, value)) =
                                rest.get(i + 1).and_then(|l| l.split_once('='))
                            {
                                hash = value.to_string();
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
                let (Some(name), Some(image)) = (name, rest.last()) else {
                    return fail(125, "docker run: missing name or image");
                };
                if self.state.containers.contains_key(name) {
                    return fail(125, "Conflict. The container name is already in use");
                }
                if let Some(pos) = rest.iter().position(|w| *w == "--network") {
                    if let Some(network) = rest.get(pos + 1) {
                        if !self.state.networks.contains(*network) {
                            return fail(125, format!("network {} not found", network));
                        }
                    }
                }
                self.state.containers.insert(
                    name.to_string(),
                    FakeContainer {
                        image: image.to_string(),
                        hash,
                        running: true,
                    },
                );
                ok("0123456789ab\n")
            }
            ["start", name] => match self.state.containers.get_mut(*name) {
                Some(c) => {
                    c.running = true;
                    ok(format!("{}\n", name))
                }
                None => fail(1, "No such container"),
            },
            ["rm", "-f", name] => {
                self.state.containers.remove(*name);
                ok(format!("{}\n", name))
            }
            ["swarm", "init", ..] => {
                if self.state.swarm_active {
                    return fail(1, "This node is already part of a swarm.");
                }
                self.state.swarm_active = true;
                ok("Swarm initialized\n")
            }
            ["network", "inspect", name] => status(self.state.networks.contains(*name)),
            ["network", "create", .., name] => {
                if !self.state.swarm_active && args.contains(&"overlay") {
                    return fail(1, "overlay networks require swarm mode");
                }
                self.state.networks.insert(name.to_string());
                ok("")
            }
            _ => fail(1, "unsupported docker command"),
        }
    }
}

#[async_trait]
impl Connection for FakeHost {
    fn describe(&self) -> String {
        "fake-host".to_string()
    }

    async fn exec(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        Ok(self.with(|inner| inner.run(command, stdin)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection;

    #[tokio::test]
    async fn test_files_round_trip_through_commands() {
        let host = FakeHost::new();
        connection::run_command(
            &host,
            &crate::connection::RemoteCommand::with_stdin(
                "install -D -m 0600 /dev/stdin /etc/app.conf",
                "a=1\n",
            ),
        )
        .await
        .unwrap();
        assert_eq!(host.file("/etc/app.conf").as_deref(), Some("a=1\n"));
        assert_eq!(
            connection::run(&host, "stat -c '%a %U %G' /etc/app.conf")
                .await
                .unwrap(),
            "600 root root\n"
        );
    }

    #[tokio::test]
    async fn test_failed_validation_removes_staged_file() {
        let host = FakeHost::new();
        host.write_file("/tmp/staged", "INVALID\n");
        let output = host
            .exec("sshd -t -f /tmp/staged || { rm -f /tmp/staged; exit 1; }", None)
            .await
            .unwrap();
        assert!(!output.success());
        assert!(host.file("/tmp/staged").is_none());
    }

    #[tokio::test]
    async fn test_command_chain_stops_at_first_failure() {
        let host = FakeHost::ubuntu();
        host.unserve(DOCKER_INSTALL_URL);
        let output = host
            .exec("curl -fsSL -o /tmp/get.sh https://get.docker.com && touch /tmp/ran", None)
            .await
            .unwrap();
        assert_eq!(output.status, 22);
        assert!(host.file("/tmp/ran").is_none());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let host = FakeHost::new();
        let output = host.exec("frobnicate --now", None).await.unwrap();
        assert_eq!(output.status, 127);
    }

    #[tokio::test]
    async fn test_ufw_policy_written_to_defaults() {
        let host = FakeHost::ubuntu();
        connection::run(&host, "ufw default allow incoming").await.unwrap();
        let defaults = host.file(UFW_DEFAULTS).unwrap();
        assert!(defaults.contains("DEFAULT_INPUT_POLICY=\"ACCEPT\""));
        assert!(defaults.contains("DEFAULT_OUTPUT_POLICY=\"ACCEPT\""));
    }
}

//! Remote file probes and writes shared by the file-shaped tasks

use crate::connection::{self, quote, Connection, RemoteCommand};
use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

/// Suffix for staged files awaiting validation
const STAGING_SUFFIX: &str = ".dokploy-provision.tmp";

/// Ownership and permission bits of a remote file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStat {
    pub mode: String,
    pub owner: String,
    pub group: String,
}

/// Read a remote file; `None` when it does not exist
pub async fn read_file(conn: &dyn Connection, path: &str) -> Result<Option<String>> {
    let quoted = quote(path)?;
    if !connection::check(conn, &format!("test -e {}", quoted)).await? {
        return Ok(None);
    }
    let content = connection::run(conn, &format!("cat {}", quoted))
        .await
        .with_context(|| format!("Failed to read {}", path))?;
    Ok(Some(content))
}

/// SHA-256 of a remote file; `None` when it does not exist
pub async fn remote_checksum(conn: &dyn Connection, path: &str) -> Result<Option<String>> {
    let output = conn
        .exec(&format!("sha256sum {}", quote(path)?), None)
        .await?;
    if !output.success() {
        return Ok(None);
    }
    match output.stdout.split_whitespace().next() {
        Some(sum) => Ok(Some(sum.to_string())),
        None => bail!("Unexpected sha256sum output for {}", path),
    }
}

/// Mode, owner and group of a remote file; `None` when it does not exist
pub async fn remote_stat(conn: &dyn Connection, path: &str) -> Result<Option<RemoteStat>> {
    let output = conn
        .exec(&format!("stat -c '%a %U %G' {}", quote(path)?), None)
        .await?;
    if !output.success() {
        return Ok(None);
    }
    let fields: Vec<&str> = output.stdout.split_whitespace().collect();
    match fields.as_slice() {
        [mode, owner, group] => Ok(Some(RemoteStat {
            mode: mode.to_string(),
            owner: owner.to_string(),
            group: group.to_string(),
        })),
        _ => bail!("Unexpected stat output for {}: {}", path, output.stdout.trim()),
    }
}

/// Hex SHA-256 of local content
pub fn checksum(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Compare permission strings ignoring leading zeros (`0644` == `644`)
pub fn same_mode(left: &str, right: &str) -> bool {
    left.trim_start_matches('0') == right.trim_start_matches('0')
}

/// How a file is written
#[derive(Debug, Clone, Default)]
pub struct WriteOptions<'a> {
    pub mode: Option<&'a str>,
    pub owner: Option<&'a str>,
    pub group: Option<&'a str>,
    /// Command run against the staged copy before it replaces the file; `%s` is the staged path
    pub validate: Option<&'a str>,
    /// Keep a copy of the previous content at `<path>.bak`
    pub backup: bool,
}

/// Commands that atomically write `content` to `path`
pub fn write_commands(path: &str, content: &str, options: &WriteOptions<'_>) -> Result<Vec<RemoteCommand>> {
    let mut commands = Vec::new();
    let quoted_path = quote(path)?;

    if options.backup {
        commands.push(RemoteCommand::new(format!(
            "cp -a {} {}",
            quoted_path,
            quote(&format!("{}.bak", path))?
        )));
    }

    let destination = match options.validate {
        Some(_) => format!("{}{}", path, STAGING_SUFFIX),
        None => path.to_string(),
    };

    let mut install = vec!["install -D".to_string()];
    if let Some(mode) = options.mode {
        install.push(format!("-m {}", quote(mode)?));
    }
    if let Some(owner) = options.owner {
        install.push(format!("-o {}", quote(owner)?));
    }
    if let Some(group) = options.group {
        install.push(format!("-g {}", quote(group)?));
    }
    install.push("/dev/stdin".to_string());
    install.push(quote(&destination)?);
    commands.push(RemoteCommand::with_stdin(install.join(" "), content.as_bytes()));

    if let Some(validate) = options.validate {
        let staged = quote(&destination)?;
        commands.push(RemoteCommand::new(format!(
            "{} || {{ rm -f {}; exit 1; }}",
            validate.replace("%s", &staged),
            staged
        )));
        commands.push(RemoteCommand::new(format!("mv -f {} {}", staged, quoted_path)));
    }

    Ok(commands)
}

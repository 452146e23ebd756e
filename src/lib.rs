//! dokploy-provision - idempotent installation and hardening of Dokploy
//!
//! Converges one Ubuntu host over SSH towards a declared state: Docker with
//! swarm, the Dokploy container, a UFW baseline, fail2ban and a tightened sshd.
//! Role bundles are ordered task lists; the executor probes the target before
//! every change and reports what it did (or would do, in dry-run).

pub mod apply;
pub mod config;
pub mod connection;
pub mod error;
pub mod inventory;
pub mod playbook;
pub mod roles;

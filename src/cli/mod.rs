pub mod audit;
pub mod config;
pub mod paths;
pub mod run;
pub mod sandbox;
pub mod snapshot;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "cortex-sandbox")]
#[command(
    author,
    version,
    about = "Validate and run AI-generated shell commands inside a kernel-enforced sandbox"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "CORTEX_SANDBOX_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate and run a command in the sandbox
    Run(run::RunArgs),

    /// Check a command against the rules without running it
    Validate(run::ValidateArgs),

    /// Show or verify the audit log
    Audit(audit::AuditArgs),

    /// Workspace snapshots and rollback
    Snapshot(snapshot::SnapshotArgs),

    /// Sandbox capabilities and smoke tests
    Sandbox(sandbox::SandboxArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}

/// Load the config named by `--config`, or the XDG default.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    match explicit {
        Some(path) => Config::load_from(&PathBuf::from(shellexpand::tilde(path).to_string())),
        None => Config::load(),
    }
}

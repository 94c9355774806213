//! CLI subcommand: `cortex-sandbox snapshot`

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::sandbox::SandboxExecutor;

#[derive(Args)]
pub struct SnapshotArgs {
    #[command(subcommand)]
    pub command: SnapshotCommands,
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Capture the tracked paths
    Create { session: String },

    /// Restore the session's newest snapshot
    Rollback { session: String },

    /// List a session's snapshots
    List { session: String },

    /// Delete all of a session's snapshots
    Clear { session: String },
}

pub fn run(args: SnapshotArgs, config: Config) -> Result<i32> {
    let executor = SandboxExecutor::new(config)?;

    match args.command {
        SnapshotCommands::Create { session } => {
            let snapshot = executor.create_snapshot(&session)?;
            println!(
                "created snapshot {} ({}) of session '{}': {} files, {} bytes",
                snapshot.seq,
                snapshot.id,
                session,
                snapshot.file_count(),
                snapshot.total_bytes()
            );
        }
        SnapshotCommands::Rollback { session } => {
            let snapshot = executor.rollback(&session)?;
            println!(
                "restored snapshot {} ({}) taken {}",
                snapshot.seq,
                snapshot.id,
                snapshot.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        SnapshotCommands::List { session } => {
            let store = executor
                .snapshot_store()
                .context("rollback is disabled")?;
            let snapshots = store.list(&session)?;
            if snapshots.is_empty() {
                println!("no snapshots for session '{}'", session);
            }
            for s in snapshots {
                println!(
                    "{:>4}  {}  {}  {} files  {} bytes",
                    s.seq,
                    s.id,
                    s.created_at.format("%Y-%m-%d %H:%M:%S"),
                    s.file_count(),
                    s.total_bytes()
                );
            }
        }
        SnapshotCommands::Clear { session } => {
            let store = executor
                .snapshot_store()
                .context("rollback is disabled")?;
            let removed = store.clear(&session)?;
            println!("removed {} snapshot(s) of session '{}'", removed, session);
        }
    }
    Ok(0)
}

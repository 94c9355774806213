//! CLI subcommand: `cortex-sandbox audit`

use anyhow::{Result, bail};
use clap::Args;

use crate::audit::{read_audit_file, verify_audit_file};
use crate::config::Config;

#[derive(Args)]
pub struct AuditArgs {
    /// Verify the hash chain instead of listing entries
    #[arg(long)]
    pub verify: bool,

    /// Print entries as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Only show the last N entries
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,
}

pub fn run(args: AuditArgs, config: &Config) -> Result<i32> {
    let Some(path) = config.audit_log_path() else {
        bail!("audit persistence is disabled (audit.persist = false)");
    };

    if args.verify {
        let entries = read_audit_file(&path)?.len();
        let broken = verify_audit_file(&path)?;
        if broken.is_empty() {
            println!("audit chain intact ({} entries)", entries);
            return Ok(0);
        }
        println!(
            "audit chain broken at line(s): {}",
            broken
                .iter()
                .map(|i| (i + 1).to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        return Ok(1);
    }

    let entries = read_audit_file(&path)?;
    let skip = args
        .limit
        .map(|n| entries.len().saturating_sub(n))
        .unwrap_or(0);

    for entry in entries.iter().skip(skip) {
        if args.json {
            println!("{}", serde_json::to_string(entry)?);
            continue;
        }
        let outcome = serde_json::to_value(entry.outcome)?;
        let kind = serde_json::to_value(entry.kind)?;
        println!(
            "{:>5}  {}  {:<10} {:<15} {}",
            entry.seq,
            entry.ts.format("%Y-%m-%d %H:%M:%S"),
            kind.as_str().unwrap_or_default(),
            outcome.as_str().unwrap_or_default(),
            entry.command
        );
        if let Some(detail) = &entry.detail {
            println!("       {}", detail);
        }
    }
    Ok(0)
}

//! CLI subcommands: `cortex-sandbox run` and `cortex-sandbox validate`

use anyhow::{Context, Result};
use clap::Args;
use std::io::Write;

use crate::config::Config;
use crate::sandbox::{CancelToken, ExecutionResult, SandboxError, SandboxExecutor};

/// Exit code for commands the rules refused.
const EXIT_BLOCKED: i32 = 126;
/// Same convention as timeout(1).
const EXIT_TIMED_OUT: i32 = 124;
const EXIT_CANCELLED: i32 = 130;

#[derive(Args)]
pub struct RunArgs {
    /// Show the isolation that would be applied without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Snapshot the tracked paths under this session before running
    #[arg(long, value_name = "SESSION")]
    pub snapshot: Option<String>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,

    /// Command to run (joined with spaces)
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Print the decision as JSON
    #[arg(long)]
    pub json: bool,

    /// Command to check (joined with spaces)
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Returns the process exit code.
pub async fn run(args: RunArgs, config: Config) -> Result<i32> {
    let executor = SandboxExecutor::new(config)?;
    let command = args.command.join(" ");

    if let Some(session) = &args.snapshot
        && !args.dry_run
    {
        let snapshot = executor
            .create_snapshot(session)
            .with_context(|| format!("Failed to snapshot session '{}'", session))?;
        eprintln!(
            "snapshot {} of session '{}' ({} files)",
            snapshot.seq,
            session,
            snapshot.file_count()
        );
    }

    let cancel = CancelToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let outcome = executor
        .execute_with_cancel(&command, args.dry_run, &cancel)
        .await;
    watcher.abort();

    match outcome {
        Ok(result) => {
            print_result(&result, args.json)?;
            Ok(exit_code_of(&result))
        }
        Err(e) => {
            if let Some(partial) = e.partial_result() {
                print_result(partial, args.json)?;
                eprintln!("cortex-sandbox: {}", e);
                return Ok(match e {
                    SandboxError::Cancelled { .. } => EXIT_CANCELLED,
                    _ => EXIT_TIMED_OUT,
                });
            }
            match e {
                SandboxError::CommandBlocked { reason } => {
                    if args.json {
                        println!(
                            "{}",
                            serde_json::json!({ "error": "command_blocked", "reason": reason })
                        );
                    } else {
                        eprintln!("cortex-sandbox: blocked: {}", reason);
                    }
                    Ok(EXIT_BLOCKED)
                }
                other => Err(other.into()),
            }
        }
    }
}

pub fn validate(args: ValidateArgs, config: Config) -> Result<i32> {
    let executor = SandboxExecutor::new(config)?;
    let decision = executor.validate_command(&args.command.join(" "));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else if decision.allowed {
        println!("{}", decision.reason);
    } else {
        println!("blocked: {}", decision.reason);
    }
    Ok(if decision.allowed { 0 } else { 1 })
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    if let Some(preview) = &result.preview {
        print!("{}", preview);
        return Ok(());
    }

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(result.stdout.as_bytes())?;
    stdout.flush()?;
    let mut stderr = std::io::stderr().lock();
    stderr.write_all(result.stderr.as_bytes())?;
    if result.truncated {
        writeln!(stderr, "cortex-sandbox: output truncated")?;
    }
    Ok(())
}

fn exit_code_of(result: &ExecutionResult) -> i32 {
    match (result.exit_code, result.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 0,
    }
}

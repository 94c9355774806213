//! CLI subcommand: `cortex-sandbox sandbox`

use anyhow::Result;
use clap::{Args, Subcommand};
use std::time::Instant;

use crate::config::Config;
use crate::sandbox::{ExecutionResult, SandboxError, SandboxExecutor, SandboxLevel};

#[derive(Args)]
pub struct SandboxArgs {
    #[command(subcommand)]
    pub command: SandboxCommands,
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Show host capabilities and the effective configuration
    Status,

    /// Run smoke tests to verify enforcement on this host
    Test,
}

pub async fn run(args: SandboxArgs, config: Config) -> Result<i32> {
    match args.command {
        SandboxCommands::Status => run_status(config),
        SandboxCommands::Test => run_test(config).await,
    }
}

fn run_status(config: Config) -> Result<i32> {
    let executor = SandboxExecutor::new(config)?;
    let config = executor.config();

    println!("Sandbox Capabilities:");
    for line in executor.runtime().status_lines() {
        println!("{}", line);
    }
    println!();

    let limits = &config.limits;
    println!("Configuration:");
    println!("  Level:       {:?}", config.sandbox.level);
    println!("  Require:     {}", config.sandbox.require_isolation);
    println!("  Shell:       {}", config.sandbox.shell);
    println!("  Network:     {:?}", config.sandbox.network.policy);
    println!("  CPU cores:   {}", limits.max_cpu_cores);
    println!("  Memory:      {} MB", limits.max_memory_mb);
    println!("  Max fsize:   {} MB", limits.max_disk_mb);
    println!("  Timeout:     {}s", limits.timeout_seconds);
    println!("  Max procs:   {}", limits.max_processes);
    println!("  Max output:  {} bytes", limits.max_output_bytes);
    println!("  Workspace:   {}", config.workspace_path().display());
    println!(
        "  Rollback:    {}",
        if config.rollback.enable_rollback { "enabled" } else { "disabled" }
    );
    if !config.sandbox.allow_paths.read.is_empty() {
        println!("  Extra read:  {:?}", config.sandbox.allow_paths.read);
    }
    if !config.sandbox.allow_paths.write.is_empty() {
        println!("  Extra write: {:?}", config.sandbox.allow_paths.write);
    }

    Ok(0)
}

enum Check {
    Pass(String),
    Fail(String),
}

async fn run_test(mut config: Config) -> Result<i32> {
    // Short enough that the timeout check finishes quickly.
    config.limits.timeout_seconds = 2;
    let executor = SandboxExecutor::new(config)?;
    let level = executor.runtime().level;

    if !executor.runtime().available() {
        println!("Sandbox helper not found; nothing can run.");
        return Ok(1);
    }

    println!("Running sandbox smoke tests...");
    println!("  Workspace: {}", executor.config().workspace_path().display());
    println!("  Level: {:?}", level);
    println!();

    let checks: Vec<(&str, Check)> = vec![
        ("Echo command succeeds", check_echo(&executor).await),
        ("Destructive command blocked", check_blocked(&executor).await),
        ("Write outside workspace", check_write_denied(&executor, level).await),
        ("Read ~/.ssh", check_ssh_denied(&executor, level).await),
        ("Network (curl)", check_network_denied(&executor).await),
        ("Timeout enforcement", check_timeout(&executor).await),
    ];

    let total = checks.len();
    let mut failed = 0;
    for (i, (name, check)) in checks.into_iter().enumerate() {
        let label = format!("[{}/{}] {}:", i + 1, total, name);
        match check {
            Check::Pass(note) => println!("  {:<38}{}", label, note),
            Check::Fail(note) => {
                println!("  {:<38}FAIL ({})", label, note);
                failed += 1;
            }
        }
    }

    println!();
    if failed == 0 {
        println!("All {} tests passed.", total);
        Ok(0)
    } else {
        println!("{} passed, {} failed.", total - failed, failed);
        Ok(1)
    }
}

fn brief(result: &ExecutionResult) -> String {
    let output = format!("{}{}", result.stdout, result.stderr);
    let output: String = output.trim().chars().take(100).collect();
    format!("exit={:?}, output={}", result.exit_code, output)
}

async fn check_echo(executor: &SandboxExecutor) -> Check {
    match executor.execute("echo hello", false).await {
        Ok(r) if r.success && r.stdout.contains("hello") => Check::Pass("ok".into()),
        Ok(r) => Check::Fail(brief(&r)),
        Err(e) => Check::Fail(e.to_string()),
    }
}

async fn check_blocked(executor: &SandboxExecutor) -> Check {
    let before = executor.spawn_count();
    match executor.execute("rm -rf /", false).await {
        Err(SandboxError::CommandBlocked { .. }) if executor.spawn_count() == before => {
            Check::Pass("blocked (ok)".into())
        }
        Err(e) => Check::Fail(e.to_string()),
        Ok(r) => Check::Fail(format!("ran: {}", brief(&r))),
    }
}

async fn check_write_denied(executor: &SandboxExecutor, level: SandboxLevel) -> Check {
    if level < SandboxLevel::Standard {
        return Check::Pass("skipped (no landlock)".into());
    }
    match executor.execute("touch /cortex-sandbox-test-deny", false).await {
        Ok(r) if !r.success => Check::Pass("denied (ok)".into()),
        Ok(r) => {
            let _ = std::fs::remove_file("/cortex-sandbox-test-deny");
            Check::Fail(format!("write succeeded: {}", brief(&r)))
        }
        Err(e) => Check::Fail(e.to_string()),
    }
}

async fn check_ssh_denied(executor: &SandboxExecutor, level: SandboxLevel) -> Check {
    if level < SandboxLevel::Standard {
        return Check::Pass("skipped (no landlock)".into());
    }
    // HOME inside the sandbox is the workspace, so name the real one.
    let Ok(home) = etcetera::home_dir() else {
        return Check::Pass("skipped (no home directory)".into());
    };
    let ssh = home.join(".ssh");
    let command = format!("ls {}", shell_words::quote(&ssh.to_string_lossy()));
    match executor.execute(&command, false).await {
        Ok(r) if r.stderr.contains("No such file") => Check::Pass("skipped (no ~/.ssh)".into()),
        Ok(r) if !r.success => Check::Pass("denied (ok)".into()),
        Ok(r) => Check::Fail(format!("expected denied, {}", brief(&r))),
        Err(e) => Check::Fail(e.to_string()),
    }
}

async fn check_network_denied(executor: &SandboxExecutor) -> Check {
    match executor
        .execute("curl -s --connect-timeout 1 http://example.com", false)
        .await
    {
        Ok(r) if r.stderr.contains("not found") => Check::Pass("skipped (curl not installed)".into()),
        Ok(r) if !r.success => Check::Pass("denied (ok)".into()),
        Ok(r) => Check::Fail(format!("network may not be blocked, {}", brief(&r))),
        // A hung connect that hits the timeout is still denied.
        Err(SandboxError::ExecutionTimeout { .. }) => Check::Pass("denied (ok, timed out)".into()),
        Err(e) => Check::Fail(e.to_string()),
    }
}

async fn check_timeout(executor: &SandboxExecutor) -> Check {
    let start = Instant::now();
    match executor.execute("sleep 30", false).await {
        Err(SandboxError::ExecutionTimeout { .. }) => Check::Pass(format!(
            "killed after {:.1}s (ok)",
            start.elapsed().as_secs_f64()
        )),
        Err(e) => Check::Fail(e.to_string()),
        Ok(r) => Check::Fail(format!("command was not killed, {}", brief(&r))),
    }
}

//! cortex-sandbox - sandboxed execution of AI-generated shell commands
//!
//! This crate provides:
//! - Rule-based command validation with a fail-closed blocklist
//! - Kernel-enforced isolation (namespaces, Landlock, seccomp, rlimits, cgroups)
//! - A hash-chained audit ledger of every decision and run
//! - Per-session workspace snapshots with exact rollback

pub mod audit;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod paths;
pub mod sandbox;
pub mod snapshot;

pub use config::Config;
pub use sandbox::{SandboxError, SandboxExecutor};

//! The public operation surface: validate, execute, audit, snapshot.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::command::Command;
use super::descriptor::{DescriptorBuilder, SandboxLevel};
use super::detect::{HostProbe, IsolationProbe, SandboxRuntime};
use super::error::SandboxError;
use super::result::{ExecutionResult, Termination};
use super::rules::{RuleEngine, ValidationDecision};
use super::supervisor::ProcessSupervisor;
use crate::audit::{AuditEntry, AuditEvent, AuditKind, AuditLedger, AuditOutcome};
use crate::config::Config;
use crate::snapshot::{Snapshot, SnapshotStore};

const ROLLBACK_DISABLED: &str = "rollback is disabled";

/// Validates, isolates and runs commands, recording every decision.
///
/// Safe to share across tasks: each `execute` spawns its own helper with its
/// own limits, and the ledger serializes its writes.
#[derive(Debug)]
pub struct SandboxExecutor {
    config: Arc<Config>,
    runtime: Arc<SandboxRuntime>,
    rules: RuleEngine,
    builder: DescriptorBuilder,
    supervisor: ProcessSupervisor,
    ledger: AuditLedger,
    snapshots: Option<SnapshotStore>,
}

impl SandboxExecutor {
    /// Probe the running host and build an engine over `config`.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_probe(config, &HostProbe)
    }

    pub fn with_probe(config: Config, probe: &dyn IsolationProbe) -> Result<Self> {
        let workspace = config.workspace_path();
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

        let runtime = Arc::new(SandboxRuntime::probe(probe, &config.sandbox));
        if !runtime.available() {
            warn!("sandbox helper not found, executions will fail");
        } else if runtime.level == SandboxLevel::None {
            if config.sandbox.require_isolation {
                warn!("no kernel isolation available and require_isolation is set");
            } else {
                warn!("no kernel isolation available, commands run with rlimits only");
            }
        }

        let ledger = match config.audit_log_path() {
            Some(path) => AuditLedger::open(&path)
                .with_context(|| format!("Failed to open audit log {}", path.display()))?,
            None => AuditLedger::in_memory(),
        };

        let snapshots = config.rollback.enable_rollback.then(|| {
            SnapshotStore::new(
                config.snapshots_dir(),
                config.tracked_paths(),
                config.rollback.max_snapshot_bytes,
            )
        });

        info!(
            level = ?runtime.level,
            workspace = %workspace.display(),
            rollback = snapshots.is_some(),
            "sandbox executor ready"
        );

        let config = Arc::new(config);
        Ok(Self {
            builder: DescriptorBuilder::new(Arc::clone(&config), Arc::clone(&runtime)),
            rules: RuleEngine::new(),
            supervisor: ProcessSupervisor::new(),
            config,
            runtime,
            ledger,
            snapshots,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runtime(&self) -> &SandboxRuntime {
        &self.runtime
    }

    pub fn snapshot_store(&self) -> Option<&SnapshotStore> {
        self.snapshots.as_ref()
    }

    pub fn audit_ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    /// Helper processes spawned by this engine.
    pub fn spawn_count(&self) -> u64 {
        self.supervisor.spawn_count()
    }

    /// Decide whether `command` may run, without running it.
    pub fn validate_command(&self, command: &str) -> ValidationDecision {
        let decision = self.rules.validate_str(command);
        let outcome = if decision.allowed {
            AuditOutcome::Allowed
        } else {
            AuditOutcome::Blocked
        };
        self.ledger.record(
            AuditEvent::new(AuditKind::Validation, command, outcome).detail(decision.reason.clone()),
        );
        decision
    }

    /// Validate and run `command`, or only preview its isolation when
    /// `dry_run` is set.
    pub async fn execute(
        &self,
        command: &str,
        dry_run: bool,
    ) -> Result<ExecutionResult, SandboxError> {
        self.run(command, dry_run, None).await
    }

    /// Like [`execute`](Self::execute), torn down early when `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        command: &str,
        dry_run: bool,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, SandboxError> {
        self.run(command, dry_run, Some(cancel)).await
    }

    async fn run(
        &self,
        raw: &str,
        dry_run: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<ExecutionResult, SandboxError> {
        let kind = if dry_run {
            AuditKind::DryRun
        } else {
            AuditKind::Execution
        };

        let command = Command::parse(raw);
        let decision = self.rules.validate(&command);
        if !decision.allowed {
            info!(command = raw, rule = ?decision.rule, "command blocked");
            self.ledger.record(
                AuditEvent::new(kind, raw, AuditOutcome::Blocked).detail(decision.reason.clone()),
            );
            return Err(SandboxError::CommandBlocked {
                reason: decision.reason,
            });
        }

        let descriptor = match self.builder.build(&command) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(command = raw, "{}", e);
                self.ledger
                    .record(AuditEvent::new(kind, raw, AuditOutcome::Unavailable).detail(e.to_string()));
                return Err(e);
            }
        };

        if dry_run {
            debug!(command = raw, level = ?descriptor.level, "dry-run preview");
            self.ledger.record(
                AuditEvent::new(kind, raw, AuditOutcome::Previewed)
                    .detail(format!("level {:?}", descriptor.level)),
            );
            return Ok(ExecutionResult::previewed(descriptor.render_preview()));
        }

        let result = match self.supervisor.run(&descriptor, cancel).await {
            Ok(result) => result,
            Err(e) => {
                self.ledger
                    .record(AuditEvent::new(kind, raw, AuditOutcome::SpawnFailed).detail(e.to_string()));
                return Err(e);
            }
        };

        let event = AuditEvent::new(kind, raw, outcome_of(&result))
            .detail(result.summary())
            .exit_code(result.exit_code)
            .duration(result.duration);
        self.ledger.record(event);

        match result.termination {
            Termination::TimedOut => Err(SandboxError::ExecutionTimeout {
                timeout: descriptor.timeout,
                result: Box::new(result),
            }),
            Termination::Cancelled => Err(SandboxError::Cancelled {
                result: Box::new(result),
            }),
            Termination::Exited | Termination::Previewed => Ok(result),
        }
    }

    /// All audit entries, oldest first.
    pub fn get_audit_log(&self) -> Vec<AuditEntry> {
        self.ledger.read_all()
    }

    /// Capture the tracked roots for `session_key`.
    pub fn create_snapshot(&self, session_key: &str) -> Result<Snapshot, SandboxError> {
        let store = self
            .snapshots
            .as_ref()
            .ok_or_else(|| SandboxError::SnapshotFailure(ROLLBACK_DISABLED.to_string()))?;
        store
            .create(session_key)
            .map_err(|e| SandboxError::SnapshotFailure(e.to_string()))
    }

    /// Restore the newest snapshot of `session_key`.
    pub fn rollback(&self, session_key: &str) -> Result<Snapshot, SandboxError> {
        let restored = match &self.snapshots {
            Some(store) => store.rollback(session_key).map_err(|e| e.to_string()),
            None => Err(ROLLBACK_DISABLED.to_string()),
        };

        match restored {
            Ok(snapshot) => {
                self.ledger.record(
                    AuditEvent::new(AuditKind::Rollback, session_key, AuditOutcome::Restored)
                        .detail(format!("snapshot {} ({})", snapshot.seq, snapshot.id)),
                );
                Ok(snapshot)
            }
            Err(reason) => {
                warn!(session = session_key, "rollback failed: {}", reason);
                self.ledger.record(
                    AuditEvent::new(AuditKind::Rollback, session_key, AuditOutcome::RollbackFailed)
                        .detail(reason.clone()),
                );
                Err(SandboxError::RollbackFailure(reason))
            }
        }
    }
}

fn outcome_of(result: &ExecutionResult) -> AuditOutcome {
    match result.termination {
        Termination::TimedOut => AuditOutcome::TimedOut,
        Termination::Cancelled => AuditOutcome::Cancelled,
        Termination::Previewed => AuditOutcome::Previewed,
        Termination::Exited if result.success => AuditOutcome::Completed,
        Termination::Exited => AuditOutcome::Failed,
    }
}

//! Append-only audit ledger.
//!
//! Every validation, dry-run, execution and rollback produces exactly one
//! [`AuditEntry`]. Entries are kept in memory and, when a path is given,
//! appended to a JSONL file whose lines form a SHA-256 hash chain (see
//! [`chain`]). A failed file write never loses the in-memory entry.

pub mod chain;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

pub use chain::{GENESIS_HASH, read_audit_file, sha256_hex, verify_audit_file};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Validation,
    DryRun,
    Execution,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Blocked,
    Previewed,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    SpawnFailed,
    Unavailable,
    Restored,
    RollbackFailed,
}

/// One ledger record. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub kind: AuditKind,
    pub command: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// SHA-256 of the previous entry's JSON line.
    pub prev_entry_sha256: String,
}

/// Caller-supplied part of an entry; the ledger stamps sequence, time and
/// chain link.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    kind: AuditKind,
    command: String,
    outcome: AuditOutcome,
    detail: Option<String>,
    exit_code: Option<i32>,
    duration_ms: Option<u64>,
}

impl AuditEvent {
    pub fn new(kind: AuditKind, command: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            kind,
            command: command.into(),
            outcome,
            detail: None,
            exit_code: None,
            duration_ms: None,
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

#[derive(Debug)]
struct LedgerState {
    entries: Vec<AuditEntry>,
    /// Raw JSON line of each entry, for chain verification.
    lines: Vec<String>,
    last_hash: String,
    next_seq: u64,
}

#[derive(Debug)]
pub struct AuditLedger {
    state: Mutex<LedgerState>,
    path: Option<PathBuf>,
}

impl AuditLedger {
    /// A ledger that only lives in memory.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                entries: Vec::new(),
                lines: Vec::new(),
                last_hash: GENESIS_HASH.to_string(),
                next_seq: 0,
            }),
            path: None,
        }
    }

    /// Open a persistent ledger. Existing entries are loaded and the chain
    /// continues from the hash of the file's last line.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = chain::read_lines(&path)?;

        let mut entries = Vec::with_capacity(raw.len());
        let mut lines = Vec::with_capacity(raw.len());
        for line in &raw {
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => {
                    entries.push(entry);
                    lines.push(line.clone());
                }
                Err(e) => warn!(path = %path.display(), "skipping corrupted audit line: {}", e),
            }
        }

        let last_hash = raw
            .last()
            .map(|line| sha256_hex(line.as_bytes()))
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(0);
        debug!(path = %path.display(), entries = entries.len(), "opened audit ledger");

        Ok(Self {
            state: Mutex::new(LedgerState {
                entries,
                lines,
                last_hash,
                next_seq,
            }),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // Entries are plain values, so a panicked writer leaves nothing
        // half-updated that matters more than losing the ledger.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one entry and return it.
    pub fn record(&self, event: AuditEvent) -> AuditEntry {
        let mut state = self.lock();

        let entry = AuditEntry {
            seq: state.next_seq,
            ts: Utc::now(),
            kind: event.kind,
            command: event.command,
            outcome: event.outcome,
            detail: event.detail,
            exit_code: event.exit_code,
            duration_ms: event.duration_ms,
            prev_entry_sha256: state.last_hash.clone(),
        };

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to serialize audit entry {}: {}", entry.seq, e);
                String::new()
            }
        };

        if let Some(path) = &self.path
            && !line.is_empty()
            && let Err(e) = chain::append_line(path, &line)
        {
            warn!(path = %path.display(), "audit entry {} kept in memory only: {:#}", entry.seq, e);
        }

        state.last_hash = sha256_hex(line.as_bytes());
        state.next_seq += 1;
        state.lines.push(line);
        state.entries.push(entry.clone());
        entry
    }

    /// Snapshot of all entries in insertion order.
    pub fn read_all(&self) -> Vec<AuditEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Indices of entries whose chain link is broken.
    pub fn verify_chain(&self) -> Vec<usize> {
        chain::verify_lines(&self.lock().lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_entry_uses_genesis_hash() {
        let ledger = AuditLedger::in_memory();
        let entry = ledger.record(AuditEvent::new(
            AuditKind::Validation,
            "echo test",
            AuditOutcome::Allowed,
        ));
        assert_eq!(entry.seq, 0);
        assert_eq!(entry.prev_entry_sha256, GENESIS_HASH);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn in_memory_chain_verifies() {
        let ledger = AuditLedger::in_memory();
        for i in 0..4 {
            ledger.record(
                AuditEvent::new(AuditKind::Execution, format!("echo {}", i), AuditOutcome::Completed)
                    .exit_code(Some(0))
                    .duration(Duration::from_millis(5)),
            );
        }
        let entries = ledger.read_all();
        assert_eq!(
            entries.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert!(ledger.verify_chain().is_empty());
        assert_ne!(entries[1].prev_entry_sha256, GENESIS_HASH);
    }

    #[test]
    fn kinds_serialize_snake_case_and_skip_empty_fields() {
        let ledger = AuditLedger::in_memory();
        let entry = ledger.record(AuditEvent::new(
            AuditKind::DryRun,
            "ls",
            AuditOutcome::SpawnFailed,
        ));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"dry_run\""));
        assert!(json.contains("\"spawn_failed\""));
        assert!(!json.contains("\"detail\""));
        assert!(!json.contains("\"exit_code\""));
    }

    #[test]
    fn reopened_ledger_continues_the_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join("audit.jsonl");

        {
            let ledger = AuditLedger::open(&path).unwrap();
            ledger.record(AuditEvent::new(AuditKind::Validation, "ls", AuditOutcome::Allowed));
            ledger.record(AuditEvent::new(AuditKind::Validation, "nc -l 1", AuditOutcome::Blocked));
        }

        let ledger = AuditLedger::open(&path).unwrap();
        assert_eq!(ledger.len(), 2);
        let entry = ledger.record(AuditEvent::new(
            AuditKind::Rollback,
            "session-a",
            AuditOutcome::Restored,
        ));
        assert_eq!(entry.seq, 2);
        assert!(ledger.verify_chain().is_empty());
        assert!(verify_audit_file(&path).unwrap().is_empty());
        assert_eq!(read_audit_file(&path).unwrap().len(), 3);
    }

    #[test]
    fn unwritable_file_keeps_entries_in_memory() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every append fail.
        let path = tmp.path().join("audit.jsonl");
        std::fs::create_dir(&path).unwrap();

        let ledger = AuditLedger {
            state: Mutex::new(LedgerState {
                entries: Vec::new(),
                lines: Vec::new(),
                last_hash: GENESIS_HASH.to_string(),
                next_seq: 0,
            }),
            path: Some(path),
        };
        ledger.record(AuditEvent::new(AuditKind::Validation, "ls", AuditOutcome::Allowed));
        ledger.record(AuditEvent::new(AuditKind::Validation, "pwd", AuditOutcome::Allowed));
        assert_eq!(ledger.len(), 2);
        assert!(ledger.verify_chain().is_empty());
    }

    #[test]
    fn concurrent_records_are_serialized() {
        let ledger = Arc::new(AuditLedger::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        ledger.record(AuditEvent::new(
                            AuditKind::Validation,
                            format!("echo {}-{}", t, i),
                            AuditOutcome::Allowed,
                        ));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let entries = ledger.read_all();
        assert_eq!(entries.len(), 200);
        assert!(entries.windows(2).all(|w| w[1].seq == w[0].seq + 1));
        assert!(ledger.verify_chain().is_empty());
    }
}

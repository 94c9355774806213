//! JSONL hash chain.
//!
//! One JSON object per line. Each entry carries the SHA-256 of the raw bytes
//! of the previous line in `prev_entry_sha256`; the first entry uses 64
//! zeros. A broken link means the log was edited after the fact.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

use super::AuditEntry;

/// The hash used for the first entry in the chain (no predecessor).
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Compute hex-encoded SHA-256.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Append a single line to a file, creating it if needed.
pub(crate) fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open audit log")?;
    writeln!(file, "{}", line).context("Failed to write audit entry")?;
    Ok(())
}

/// Non-empty raw lines of the log; empty if it does not exist.
pub(crate) fn read_lines(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Read and parse all entries from an audit log file.
///
/// Corrupted lines are skipped, not fatal. A missing file reads as empty.
pub fn read_audit_file(path: &Path) -> Result<Vec<AuditEntry>> {
    Ok(read_lines(path)?
        .iter()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Verify the hash chain of an audit log file.
///
/// Returns the indices of lines whose link is broken or which do not parse.
/// An empty return value means the chain is intact.
pub fn verify_audit_file(path: &Path) -> Result<Vec<usize>> {
    Ok(verify_lines(&read_lines(path)?))
}

/// Verify a chain given as raw JSONL lines.
pub fn verify_lines<S: AsRef<str>>(lines: &[S]) -> Vec<usize> {
    let mut broken = Vec::new();
    let mut expected = GENESIS_HASH.to_string();

    for (i, line) in lines.iter().enumerate() {
        let line = line.as_ref();
        match serde_json::from_str::<AuditEntry>(line) {
            Ok(entry) if entry.prev_entry_sha256 == expected => {}
            _ => broken.push(i),
        }
        expected = sha256_hex(line.as_bytes());
    }

    broken
}

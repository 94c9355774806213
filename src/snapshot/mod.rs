//! Per-session workspace snapshots with exact rollback.
//!
//! A snapshot captures every tracked root (contents, modes, symlinks, and
//! whether the root existed at all). Rolling back restores the most recent
//! snapshot of a session so the tracked trees match it exactly. Snapshots are
//! stored as `<root>/<session>/<seq>-<id>.json` and all operations on one
//! session are serialized by a [`SessionLock`].

pub mod capture;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::sha256_hex;
use crate::concurrency::{SessionLock, SessionLockGuard};
pub use capture::{CapturedEntry, CapturedState, Node, TrackedRoot};

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("invalid session key: must not be empty")]
    InvalidSession,

    #[error("no snapshot exists for session '{0}'")]
    NotFound(String),

    #[error("snapshot {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("snapshot exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("snapshot I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub session_key: String,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub captured_state: CapturedState,
}

impl Snapshot {
    pub fn file_count(&self) -> usize {
        self.captured_state
            .roots
            .iter()
            .flat_map(|r| &r.entries)
            .filter(|e| matches!(e.node, Node::File { .. }))
            .count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.captured_state
            .roots
            .iter()
            .flat_map(|r| &r.entries)
            .map(|e| match &e.node {
                Node::File { contents, .. } => contents.len() as u64,
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    tracked: Vec<PathBuf>,
    max_bytes: u64,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, tracked: Vec<PathBuf>, max_bytes: u64) -> Self {
        Self {
            root: root.into(),
            tracked,
            max_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tracked_paths(&self) -> &[PathBuf] {
        &self.tracked
    }

    fn session_dir(&self, key: &str) -> Result<PathBuf, SnapshotError> {
        if key.is_empty() {
            return Err(SnapshotError::InvalidSession);
        }
        Ok(self.root.join(session_dir_name(key)))
    }

    fn lock(&self, dir: &Path) -> Result<SessionLockGuard, SnapshotError> {
        SessionLock::new(dir.join(LOCK_FILENAME))
            .acquire()
            .map_err(|source| SnapshotError::Io {
                path: dir.to_path_buf(),
                source,
            })
    }

    /// Capture the tracked roots as the session's newest snapshot.
    pub fn create(&self, session_key: &str) -> Result<Snapshot, SnapshotError> {
        let dir = self.session_dir(session_key)?;
        let _guard = self.lock(&dir)?;

        let captured_state = capture::capture(&self.tracked, self.max_bytes)?;
        let seq = snapshot_files(&dir)?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(1);
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            session_key: session_key.to_string(),
            seq,
            created_at: Utc::now(),
            captured_state,
        };

        let path = dir.join(format!("{:08}-{}.json", seq, snapshot.id));
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| SnapshotError::Corrupt {
            id: snapshot.id.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, &bytes)?;

        info!(
            session = session_key,
            seq,
            files = snapshot.file_count(),
            bytes = snapshot.total_bytes(),
            "snapshot created"
        );
        Ok(snapshot)
    }

    /// Restore the session's newest snapshot. The snapshot is fully verified
    /// before anything on disk changes.
    pub fn rollback(&self, session_key: &str) -> Result<Snapshot, SnapshotError> {
        let dir = self.session_dir(session_key)?;
        if !dir.is_dir() {
            return Err(SnapshotError::NotFound(session_key.to_string()));
        }
        let _guard = self.lock(&dir)?;

        let (_, path) = snapshot_files(&dir)?
            .pop()
            .ok_or_else(|| SnapshotError::NotFound(session_key.to_string()))?;
        let snapshot = load(&path)?;
        if snapshot.session_key != session_key {
            return Err(SnapshotError::Corrupt {
                id: snapshot.id,
                reason: format!("belongs to session '{}'", snapshot.session_key),
            });
        }
        capture::verify(&snapshot.captured_state).map_err(|reason| SnapshotError::Corrupt {
            id: snapshot.id.clone(),
            reason,
        })?;

        capture::restore(&snapshot.captured_state)?;
        info!(session = session_key, seq = snapshot.seq, id = %snapshot.id, "rolled back");
        Ok(snapshot)
    }

    pub fn latest(&self, session_key: &str) -> Result<Option<Snapshot>, SnapshotError> {
        let dir = self.session_dir(session_key)?;
        if !dir.is_dir() {
            return Ok(None);
        }
        let _guard = self.lock(&dir)?;
        snapshot_files(&dir)?
            .pop()
            .map(|(_, path)| load(&path))
            .transpose()
    }

    /// All snapshots of a session, oldest first.
    pub fn list(&self, session_key: &str) -> Result<Vec<Snapshot>, SnapshotError> {
        let dir = self.session_dir(session_key)?;
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let _guard = self.lock(&dir)?;
        snapshot_files(&dir)?
            .into_iter()
            .map(|(_, path)| load(&path))
            .collect()
    }

    /// Delete every snapshot of a session. Returns how many were removed.
    pub fn clear(&self, session_key: &str) -> Result<usize, SnapshotError> {
        let dir = self.session_dir(session_key)?;
        if !dir.is_dir() {
            return Ok(0);
        }
        let _guard = self.lock(&dir)?;
        let files = snapshot_files(&dir)?;
        for (_, path) in &files {
            fs::remove_file(path).map_err(|source| SnapshotError::Io {
                path: path.clone(),
                source,
            })?;
        }
        debug!(session = session_key, removed = files.len(), "snapshots cleared");
        Ok(files.len())
    }
}

/// Prefix of directory names derived from a key digest. Plain keys never
/// start with it, so the two namespaces cannot collide.
const HASHED_PREFIX: &str = "h-";

/// Keys made only of `[A-Za-z0-9._-]` are used as-is; anything else is
/// replaced by its SHA-256 so it cannot escape the store.
fn session_dir_name(key: &str) -> String {
    let plain = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if plain && key != "." && key != ".." && !key.starts_with(HASHED_PREFIX) {
        key.to_string()
    } else {
        format!("{}{}", HASHED_PREFIX, sha256_hex(key.as_bytes()))
    }
}

/// Snapshot files in a session directory, sorted by sequence number.
fn snapshot_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, SnapshotError> {
    let io_err = |source| SnapshotError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".json") {
            continue;
        }
        if let Some(seq) = name.split('-').next().and_then(|s| s.parse::<u64>().ok()) {
            files.push((seq, path));
        }
    }
    files.sort();
    Ok(files)
}

fn load(path: &Path) -> Result<Snapshot, SnapshotError> {
    let id = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bytes = fs::read(path).map_err(|e| SnapshotError::Corrupt {
        id: id.clone(),
        reason: format!("unreadable: {}", e),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| SnapshotError::Corrupt {
        id,
        reason: format!("unparsable: {}", e),
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let tmp = path.with_extension("json.tmp");
    let io_err = |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, PathBuf, SnapshotStore) {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("workspace");
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("a.txt"), "original").unwrap();
        let store = SnapshotStore::new(tmp.path().join("snapshots"), vec![ws.clone()], 1 << 20);
        (tmp, ws, store)
    }

    #[test]
    fn create_then_rollback_restores_workspace() {
        let (_tmp, ws, store) = setup();
        let snap = store.create("s1").unwrap();
        assert_eq!(snap.seq, 1);
        assert_eq!(snap.file_count(), 1);

        fs::write(ws.join("a.txt"), "modified").unwrap();
        fs::write(ws.join("b.txt"), "extra").unwrap();

        let restored = store.rollback("s1").unwrap();
        assert_eq!(restored.id, snap.id);
        assert_eq!(fs::read_to_string(ws.join("a.txt")).unwrap(), "original");
        assert!(!ws.join("b.txt").exists());
    }

    #[test]
    fn rollback_uses_latest_snapshot() {
        let (_tmp, ws, store) = setup();
        store.create("s1").unwrap();
        fs::write(ws.join("a.txt"), "second").unwrap();
        let second = store.create("s1").unwrap();
        assert_eq!(second.seq, 2);

        fs::write(ws.join("a.txt"), "third").unwrap();
        assert_eq!(store.rollback("s1").unwrap().seq, 2);
        assert_eq!(fs::read_to_string(ws.join("a.txt")).unwrap(), "second");
        assert_eq!(store.list("s1").unwrap().len(), 2);
    }

    #[test]
    fn unknown_session_is_not_found() {
        let (_tmp, _ws, store) = setup();
        assert!(matches!(
            store.rollback("nope"),
            Err(SnapshotError::NotFound(key)) if key == "nope"
        ));
        assert!(store.latest("nope").unwrap().is_none());
        assert!(matches!(store.create(""), Err(SnapshotError::InvalidSession)));
    }

    #[test]
    fn sessions_are_isolated() {
        let (_tmp, ws, store) = setup();
        store.create("alpha").unwrap();
        fs::write(ws.join("a.txt"), "beta-state").unwrap();
        store.create("beta").unwrap();

        fs::write(ws.join("a.txt"), "scratch").unwrap();
        store.rollback("alpha").unwrap();
        assert_eq!(fs::read_to_string(ws.join("a.txt")).unwrap(), "original");
        store.rollback("beta").unwrap();
        assert_eq!(fs::read_to_string(ws.join("a.txt")).unwrap(), "beta-state");
    }

    #[test]
    fn odd_session_keys_are_hashed() {
        assert_eq!(session_dir_name("task-42_v1.0"), "task-42_v1.0");
        assert_eq!(session_dir_name("../escape").len(), 66);
        assert!(session_dir_name("..").starts_with("h-"));

        let (_tmp, _ws, store) = setup();
        store.create("../escape").unwrap();
        assert!(store.latest("../escape").unwrap().is_some());
    }

    #[test]
    fn digest_named_keys_do_not_share_a_directory() {
        let odd = "needs/hashing";
        let digest = sha256_hex(odd.as_bytes());
        let hashed_form = session_dir_name(odd);
        assert_ne!(session_dir_name(&digest), hashed_form);
        assert_ne!(session_dir_name(&hashed_form), hashed_form);

        let (_tmp, _ws, store) = setup();
        store.create(odd).unwrap();
        assert!(store.latest(&hashed_form).unwrap().is_none());
        assert!(store.latest(&digest).unwrap().is_none());
    }

    #[test]
    fn corrupt_snapshot_leaves_workspace_untouched() {
        let (_tmp, ws, store) = setup();
        store.create("s1").unwrap();
        let (_, path) = snapshot_files(&store.root().join("s1")).unwrap().pop().unwrap();
        fs::write(&path, "{ not json").unwrap();

        fs::write(ws.join("a.txt"), "after").unwrap();
        assert!(matches!(store.rollback("s1"), Err(SnapshotError::Corrupt { .. })));
        assert_eq!(fs::read_to_string(ws.join("a.txt")).unwrap(), "after");
    }

    #[test]
    fn too_large_snapshot_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("big"), vec![0u8; 64]).unwrap();
        let store = SnapshotStore::new(tmp.path().join("snaps"), vec![ws], 16);
        assert!(matches!(
            store.create("s"),
            Err(SnapshotError::TooLarge { limit: 16 })
        ));
        assert!(store.list("s").unwrap().is_empty());
    }

    #[test]
    fn clear_removes_all() {
        let (_tmp, _ws, store) = setup();
        store.create("s1").unwrap();
        store.create("s1").unwrap();
        assert_eq!(store.clear("s1").unwrap(), 2);
        assert!(store.latest("s1").unwrap().is_none());
        assert_eq!(store.clear("never").unwrap(), 0);
    }
}

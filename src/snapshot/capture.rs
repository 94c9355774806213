//! Capture and exact restoration of tracked filesystem trees.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::SnapshotError;
use crate::audit::sha256_hex;

/// State of every tracked root at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedState {
    pub roots: Vec<TrackedRoot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRoot {
    pub path: PathBuf,
    /// False when the root did not exist; rollback then removes it.
    pub present: bool,
    /// Pre-order walk; the root itself has an empty relative path.
    pub entries: Vec<CapturedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedEntry {
    /// Path relative to the tracked root.
    pub path: PathBuf,
    pub node: Node,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Dir {
        mode: u32,
    },
    File {
        mode: u32,
        sha256: String,
        #[serde(with = "base64_bytes")]
        contents: Vec<u8>,
    },
    Symlink {
        target: PathBuf,
    },
}

impl Node {
    fn kind(&self) -> Kind {
        match self {
            Node::Dir { .. } => Kind::Dir,
            Node::File { .. } => Kind::File,
            Node::Symlink { .. } => Kind::Symlink,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dir,
    File,
    Symlink,
    Other,
}

impl Kind {
    fn of(file_type: fs::FileType) -> Self {
        if file_type.is_symlink() {
            Kind::Symlink
        } else if file_type.is_dir() {
            Kind::Dir
        } else if file_type.is_file() {
            Kind::File
        } else {
            Kind::Other
        }
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

fn io_err(path: &Path, source: io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_meta: &fs::Metadata) -> u32 {
    0
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), SnapshotError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), SnapshotError> {
    Ok(())
}

struct Budget {
    used: u64,
    limit: u64,
}

impl Budget {
    fn charge(&mut self, bytes: u64) -> Result<(), SnapshotError> {
        self.used = self.used.saturating_add(bytes);
        if self.used > self.limit {
            return Err(SnapshotError::TooLarge { limit: self.limit });
        }
        Ok(())
    }
}

/// Capture every tracked root. Fails if the file contents exceed `max_bytes`.
pub fn capture(roots: &[PathBuf], max_bytes: u64) -> Result<CapturedState, SnapshotError> {
    let mut budget = Budget {
        used: 0,
        limit: max_bytes,
    };
    let roots = roots
        .iter()
        .map(|root| capture_root(root, &mut budget))
        .collect::<Result<_, _>>()?;
    Ok(CapturedState { roots })
}

fn capture_root(root: &Path, budget: &mut Budget) -> Result<TrackedRoot, SnapshotError> {
    let meta = match fs::symlink_metadata(root) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(TrackedRoot {
                path: root.to_path_buf(),
                present: false,
                entries: Vec::new(),
            });
        }
        Err(e) => return Err(io_err(root, e)),
    };

    let mut entries = Vec::new();
    capture_node(root, PathBuf::new(), &meta, &mut entries, budget)?;
    Ok(TrackedRoot {
        path: root.to_path_buf(),
        present: true,
        entries,
    })
}

fn capture_node(
    abs: &Path,
    rel: PathBuf,
    meta: &fs::Metadata,
    entries: &mut Vec<CapturedEntry>,
    budget: &mut Budget,
) -> Result<(), SnapshotError> {
    match Kind::of(meta.file_type()) {
        Kind::Symlink => {
            let target = fs::read_link(abs).map_err(|e| io_err(abs, e))?;
            entries.push(CapturedEntry {
                path: rel,
                node: Node::Symlink { target },
            });
        }
        Kind::File => {
            let contents = fs::read(abs).map_err(|e| io_err(abs, e))?;
            budget.charge(contents.len() as u64)?;
            entries.push(CapturedEntry {
                path: rel,
                node: Node::File {
                    mode: mode_of(meta),
                    sha256: sha256_hex(&contents),
                    contents,
                },
            });
        }
        Kind::Dir => {
            entries.push(CapturedEntry {
                path: rel.clone(),
                node: Node::Dir {
                    mode: mode_of(meta),
                },
            });
            let mut children: Vec<_> = fs::read_dir(abs)
                .map_err(|e| io_err(abs, e))?
                .collect::<Result<_, _>>()
                .map_err(|e| io_err(abs, e))?;
            children.sort_by_key(|c| c.file_name());
            for child in children {
                let child_abs = child.path();
                let child_meta = fs::symlink_metadata(&child_abs).map_err(|e| io_err(&child_abs, e))?;
                capture_node(
                    &child_abs,
                    rel.join(child.file_name()),
                    &child_meta,
                    entries,
                    budget,
                )?;
            }
        }
        Kind::Other => debug!(path = %abs.display(), "skipping special file"),
    }
    Ok(())
}

/// Check every stored hash. Runs before anything on disk is changed.
pub fn verify(state: &CapturedState) -> Result<(), String> {
    for root in &state.roots {
        for entry in &root.entries {
            if let Node::File {
                sha256, contents, ..
            } = &entry.node
                && sha256_hex(contents) != *sha256
            {
                return Err(format!(
                    "hash mismatch for {}",
                    root.path.join(&entry.path).display()
                ));
            }
        }
        if root.present && root.entries.first().is_none_or(|e| !e.path.as_os_str().is_empty()) {
            return Err(format!("missing root entry for {}", root.path.display()));
        }
    }
    Ok(())
}

/// Make every tracked root match the captured state exactly.
pub fn restore(state: &CapturedState) -> Result<(), SnapshotError> {
    for root in &state.roots {
        restore_root(root)?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<(), SnapshotError> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| io_err(path, e))
}

fn existing_kind(path: &Path) -> Result<Option<Kind>, SnapshotError> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(Kind::of(meta.file_type()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Relative paths and kinds of everything currently under `abs`.
fn walk_existing(
    abs: &Path,
    rel: &Path,
    out: &mut Vec<(PathBuf, Kind)>,
) -> Result<(), SnapshotError> {
    for child in fs::read_dir(abs).map_err(|e| io_err(abs, e))? {
        let child = child.map_err(|e| io_err(abs, e))?;
        let kind = Kind::of(child.file_type().map_err(|e| io_err(&child.path(), e))?);
        let child_rel = rel.join(child.file_name());
        if kind == Kind::Dir {
            walk_existing(&child.path(), &child_rel, out)?;
        }
        out.push((child_rel, kind));
    }
    Ok(())
}

fn restore_root(root: &TrackedRoot) -> Result<(), SnapshotError> {
    if !root.present {
        return remove_any(&root.path);
    }

    let wanted: HashMap<&Path, &Node> = root
        .entries
        .iter()
        .map(|e| (e.path.as_path(), &e.node))
        .collect();

    let root_is_dir = matches!(wanted.get(Path::new("")), Some(Node::Dir { .. }));
    if root_is_dir && existing_kind(&root.path)? == Some(Kind::Dir) {
        let mut existing = Vec::new();
        walk_existing(&root.path, Path::new(""), &mut existing)?;
        // Deepest first, so children go before their parents.
        existing.sort_by_key(|(rel, _)| std::cmp::Reverse(rel.components().count()));
        for (rel, kind) in existing {
            let keep = wanted.get(rel.as_path()).is_some_and(|n| n.kind() == kind);
            if !keep {
                remove_any(&root.path.join(&rel))?;
            }
        }
    }

    let mut dir_modes = Vec::new();
    for entry in &root.entries {
        let path = if entry.path.as_os_str().is_empty() {
            root.path.clone()
        } else {
            root.path.join(&entry.path)
        };
        match &entry.node {
            Node::Dir { mode } => {
                if existing_kind(&path)? != Some(Kind::Dir) {
                    remove_any(&path)?;
                    fs::create_dir_all(&path).map_err(|e| io_err(&path, e))?;
                }
                dir_modes.push((path, *mode));
            }
            Node::File { mode, contents, .. } => {
                let unchanged = existing_kind(&path)? == Some(Kind::File)
                    && fs::read(&path).is_ok_and(|current| current == *contents);
                if !unchanged {
                    // Removing first also works for read-only files.
                    remove_any(&path)?;
                    fs::write(&path, contents).map_err(|e| io_err(&path, e))?;
                }
                set_mode(&path, *mode)?;
            }
            Node::Symlink { target } => {
                let unchanged = fs::read_link(&path).is_ok_and(|current| current == *target);
                if !unchanged {
                    remove_any(&path)?;
                    create_symlink(target, &path)?;
                }
            }
        }
    }

    // Directory modes last, deepest first, so read-only dirs don't block
    // the writes above.
    for (path, mode) in dir_modes.into_iter().rev() {
        set_mode(&path, mode)?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> Result<(), SnapshotError> {
    std::os::unix::fs::symlink(target, link).map_err(|e| io_err(link, e))
}

#[cfg(not(unix))]
fn create_symlink(_target: &Path, link: &Path) -> Result<(), SnapshotError> {
    Err(io_err(
        link,
        io::Error::new(io::ErrorKind::Unsupported, "symlinks are not supported"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(root: &Path) {
        fs::create_dir_all(root.join("src/nested")).unwrap();
        fs::write(root.join("README.md"), "hello").unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(root.join("src/nested/data.bin"), [0u8, 159, 146, 150]).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("README.md", root.join("link")).unwrap();
    }

    #[test]
    fn capture_walks_in_sorted_preorder() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        tree(&ws);

        let state = capture(std::slice::from_ref(&ws), u64::MAX).unwrap();
        let paths: Vec<_> = state.roots[0]
            .entries
            .iter()
            .map(|e| e.path.display().to_string())
            .collect();
        assert_eq!(paths[0], "");
        assert!(paths.contains(&"src/nested/data.bin".to_string()));
        let src = paths.iter().position(|p| p == "src").unwrap();
        let main = paths.iter().position(|p| p == "src/main.rs").unwrap();
        assert!(src < main);
        assert!(verify(&state).is_ok());
    }

    #[test]
    fn absent_root_is_recorded_and_removed_on_restore() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("later");
        let state = capture(std::slice::from_ref(&ws), u64::MAX).unwrap();
        assert!(!state.roots[0].present);

        fs::create_dir_all(ws.join("x")).unwrap();
        restore(&state).unwrap();
        assert!(!ws.exists());
    }

    #[test]
    fn restore_is_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        tree(&ws);
        let state = capture(std::slice::from_ref(&ws), u64::MAX).unwrap();

        fs::write(ws.join("README.md"), "changed").unwrap();
        fs::remove_file(ws.join("src/main.rs")).unwrap();
        fs::create_dir_all(ws.join("build/out")).unwrap();
        fs::write(ws.join("build/out/a.o"), "obj").unwrap();
        fs::write(ws.join("new.txt"), "new").unwrap();
        fs::remove_dir_all(ws.join("src/nested")).unwrap();

        restore(&state).unwrap();

        assert_eq!(fs::read_to_string(ws.join("README.md")).unwrap(), "hello");
        assert_eq!(fs::read_to_string(ws.join("src/main.rs")).unwrap(), "fn main() {}");
        assert_eq!(
            fs::read(ws.join("src/nested/data.bin")).unwrap(),
            vec![0u8, 159, 146, 150]
        );
        assert!(!ws.join("build").exists());
        assert!(!ws.join("new.txt").exists());
        assert_eq!(capture(std::slice::from_ref(&ws), u64::MAX).unwrap(), state);
    }

    #[cfg(unix)]
    #[test]
    fn restore_brings_back_modes_and_symlinks() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        tree(&ws);
        fs::set_permissions(ws.join("src/main.rs"), fs::Permissions::from_mode(0o600)).unwrap();
        let state = capture(std::slice::from_ref(&ws), u64::MAX).unwrap();

        fs::set_permissions(ws.join("src/main.rs"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::remove_file(ws.join("link")).unwrap();
        fs::create_dir(ws.join("link")).unwrap();

        restore(&state).unwrap();
        let mode = fs::metadata(ws.join("src/main.rs")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read_link(ws.join("link")).unwrap(), PathBuf::from("README.md"));
    }

    #[test]
    fn single_file_root() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("config.toml");
        fs::write(&file, "a = 1").unwrap();
        let state = capture(std::slice::from_ref(&file), u64::MAX).unwrap();

        fs::write(&file, "a = 2").unwrap();
        restore(&state).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "a = 1");
    }

    #[test]
    fn size_budget_is_enforced() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        tree(&ws);
        let err = capture(std::slice::from_ref(&ws), 4).unwrap_err();
        assert!(matches!(err, SnapshotError::TooLarge { limit: 4 }));
    }

    #[test]
    fn tampered_contents_fail_verification() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        tree(&ws);
        let mut state = capture(std::slice::from_ref(&ws), u64::MAX).unwrap();
        for entry in &mut state.roots[0].entries {
            if let Node::File { contents, .. } = &mut entry.node {
                contents.push(b'!');
            }
        }
        assert!(verify(&state).unwrap_err().contains("hash mismatch"));
    }
}

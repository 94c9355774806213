//! XDG Base Directory path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. Application env var (CORTEX_SANDBOX_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "cortex-sandbox";

/// Resolved directory paths, created once at startup and carried by `Config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// config.toml lives here
    pub config_dir: PathBuf,

    pub data_dir: PathBuf,

    /// Working directory of sandboxed commands and default snapshot root.
    /// May be overridden independently via CORTEX_SANDBOX_WORKSPACE.
    pub workspace: PathBuf,

    /// Audit log and snapshots
    pub state_dir: PathBuf,

    pub cache_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "CORTEX_SANDBOX_CONFIG_DIR", || {
            strategy.config_dir().join(APP_DIR)
        });
        let data_dir = env_or(&env_fn, "CORTEX_SANDBOX_DATA_DIR", || {
            strategy.data_dir().join(APP_DIR)
        });
        let state_dir = env_or(&env_fn, "CORTEX_SANDBOX_STATE_DIR", || {
            strategy
                .state_dir()
                .unwrap_or_else(|| strategy.data_dir())
                .join(APP_DIR)
        });
        let cache_dir = env_or(&env_fn, "CORTEX_SANDBOX_CACHE_DIR", || {
            strategy.cache_dir().join(APP_DIR)
        });
        let workspace = resolve_workspace(&env_fn, &data_dir);

        Ok(Self {
            config_dir,
            data_dir,
            workspace,
            state_dir,
            cache_dir,
        })
    }

    /// Every directory under one root. Used by tests and `--config` setups
    /// that keep all state together.
    pub fn under(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            workspace: root.join("workspace"),
            state_dir: root.join("state"),
            cache_dir: root.join("cache"),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join("audit.jsonl")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.state_dir.join("snapshots")
    }

    /// Create all directories with mode 0700.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.state_dir,
            &self.cache_dir,
        ] {
            create_dir_with_mode(dir)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            let data_dir = home.join(".local").join("share").join(APP_DIR);
            Self {
                config_dir: home.join(".config").join(APP_DIR),
                workspace: data_dir.join("workspace"),
                data_dir,
                state_dir: home.join(".local").join("state").join(APP_DIR),
                cache_dir: home.join(".cache").join(APP_DIR),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn resolve_workspace<F>(env_fn: &F, data_dir: &Path) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    if let Ok(ws) = env_fn("CORTEX_SANDBOX_WORKSPACE") {
        let trimmed = ws.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(shellexpand::tilde(trimmed).to_string());
            if path.is_absolute() {
                return path;
            }
        }
    }
    data_dir.join("workspace")
}

fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

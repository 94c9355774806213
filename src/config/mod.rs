use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths::Paths;
use crate::sandbox::NetworkPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub limits: ResourceLimits,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub rollback: RollbackConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-execution resource ceilings. Never pooled across concurrent runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default = "default_max_cpu_cores")]
    pub max_cpu_cores: u32,

    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    /// Largest file a command may write (RLIMIT_FSIZE)
    #[serde(default = "default_max_disk_mb")]
    pub max_disk_mb: u64,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// RLIMIT_NPROC and pids.max
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,

    /// Combined stdout+stderr kept per run; the rest is discarded
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
}

/// Requested enforcement level. Never raises the level above what the host
/// supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelSetting {
    /// Highest level the host supports.
    #[default]
    Auto,
    Full,
    Standard,
    Minimal,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub level: LevelSetting,

    /// Refuse to run anything when the host offers no isolation
    #[serde(default)]
    pub require_isolation: bool,

    /// Helper binary re-executed as the sandbox child
    #[serde(default)]
    pub helper_path: Option<PathBuf>,

    #[serde(default = "default_shell")]
    pub shell: String,

    /// Identity commands drop to when the engine runs as root
    #[serde(default = "default_nobody")]
    pub run_as_uid: u32,

    #[serde(default = "default_nobody")]
    pub run_as_gid: u32,

    /// Writable cgroup v2 directory for per-run cgroups
    #[serde(default)]
    pub cgroup_root: Option<PathBuf>,

    #[serde(default)]
    pub allow_paths: AllowPathsConfig,

    #[serde(default)]
    pub network: SandboxNetworkConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowPathsConfig {
    /// Additional read-only paths
    #[serde(default)]
    pub read: Vec<String>,

    /// Additional writable paths
    #[serde(default)]
    pub write: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxNetworkConfig {
    #[serde(default = "default_network_policy")]
    pub policy: NetworkPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    #[serde(default = "default_true")]
    pub enable_rollback: bool,

    /// Roots captured by snapshots. Empty means the workspace. Relative
    /// entries resolve against the workspace.
    #[serde(default)]
    pub tracked_paths: Vec<String>,

    #[serde(default = "default_max_snapshot_bytes")]
    pub max_snapshot_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Append entries to a JSONL file in addition to memory
    #[serde(default = "default_true")]
    pub persist: bool,

    /// Override for the audit log location
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_max_cpu_cores() -> u32 {
    2
}
fn default_max_memory_mb() -> u64 {
    2048
}
fn default_max_disk_mb() -> u64 {
    1024
}
fn default_timeout_seconds() -> u64 {
    300
}
fn default_max_processes() -> u32 {
    256
}
fn default_max_output_bytes() -> u64 {
    1_048_576 // 1MB
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_nobody() -> u32 {
    65534
}
fn default_network_policy() -> NetworkPolicy {
    NetworkPolicy::Deny
}
fn default_true() -> bool {
    true
}
fn default_max_snapshot_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_cores: default_max_cpu_cores(),
            max_memory_mb: default_max_memory_mb(),
            max_disk_mb: default_max_disk_mb(),
            timeout_seconds: default_timeout_seconds(),
            max_processes: default_max_processes(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            level: LevelSetting::default(),
            require_isolation: false,
            helper_path: None,
            shell: default_shell(),
            run_as_uid: default_nobody(),
            run_as_gid: default_nobody(),
            cgroup_root: None,
            allow_paths: AllowPathsConfig::default(),
            network: SandboxNetworkConfig::default(),
        }
    }
}

impl Default for SandboxNetworkConfig {
    fn default() -> Self {
        Self {
            policy: default_network_policy(),
        }
    }
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enable_rollback: default_true(),
            tracked_paths: Vec::new(),
            max_snapshot_bytes: default_max_snapshot_bytes(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            persist: default_true(),
            file: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Default settings over the given paths.
    pub fn with_paths(paths: Paths) -> Self {
        Self {
            paths,
            limits: ResourceLimits::default(),
            sandbox: SandboxConfig::default(),
            rollback: RollbackConfig::default(),
            audit: AuditConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load from the XDG config file, writing a commented template on first
    /// run.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        let path = paths.config_file();

        if !path.exists() {
            let config = Config::with_paths(paths);
            config.save_with_template()?;
            return Ok(config);
        }

        Self::read(&path, paths)
    }

    /// Load an explicit config file. Unlike [`Config::load`], a missing file
    /// is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let paths = Paths::resolve()?;
        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }
        Self::read(path, paths)
    }

    fn read(path: &Path, paths: Paths) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.paths = paths;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every execution fail later. Enumerated
    /// settings are already checked when the file is parsed.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.max_cpu_cores == 0
            || limits.max_memory_mb == 0
            || limits.timeout_seconds == 0
            || limits.max_processes == 0
        {
            bail!("limits must be greater than zero");
        }
        Ok(())
    }

    /// Save a commented template (for first-time setup).
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        eprintln!("Created default config at {}", path.display());
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Paths::resolve()?.config_file())
    }

    pub fn workspace_path(&self) -> PathBuf {
        self.paths.workspace.clone()
    }

    /// Where the audit ledger persists, or `None` for memory only.
    pub fn audit_log_path(&self) -> Option<PathBuf> {
        if !self.audit.persist {
            return None;
        }
        Some(match &self.audit.file {
            Some(file) => PathBuf::from(shellexpand::tilde(file).to_string()),
            None => self.paths.audit_log(),
        })
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.paths.snapshots_dir()
    }

    /// Roots captured by snapshots.
    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        let workspace = self.workspace_path();
        if self.rollback.tracked_paths.is_empty() {
            return vec![workspace];
        }
        self.rollback
            .tracked_paths
            .iter()
            .map(|p| {
                let path = PathBuf::from(shellexpand::tilde(p).to_string());
                if path.is_absolute() {
                    path
                } else {
                    workspace.join(path)
                }
            })
            .collect()
    }
}

/// Written on first run. Every value shown is the default.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# cortex-sandbox configuration
# Auto-created on first run. Edit as needed.
#
# Directories follow XDG; override with CORTEX_SANDBOX_CONFIG_DIR,
# CORTEX_SANDBOX_DATA_DIR, CORTEX_SANDBOX_STATE_DIR, CORTEX_SANDBOX_CACHE_DIR
# and CORTEX_SANDBOX_WORKSPACE.

[limits]
max_cpu_cores = 2
max_memory_mb = 2048
max_disk_mb = 1024              # largest file a command may write
timeout_seconds = 300
max_processes = 256
max_output_bytes = 1048576      # combined stdout+stderr kept per run

[sandbox]
level = "auto"                  # auto | full | standard | minimal | none
require_isolation = false       # refuse to run when no isolation is available
shell = "/bin/sh"
run_as_uid = 65534              # identity used when running as root
run_as_gid = 65534
# helper_path = "/usr/local/bin/cortex-sandbox"
# cgroup_root = "/sys/fs/cgroup/cortex-sandbox"

[sandbox.allow_paths]
read = []                       # additional read-only paths
write = []                      # additional writable paths

[sandbox.network]
policy = "deny"                 # deny | allow

[rollback]
enable_rollback = true
tracked_paths = []              # empty tracks the workspace
max_snapshot_bytes = 67108864

[audit]
persist = true
# file = "~/audit.jsonl"

[logging]
level = "info"
format = "text"                 # text | json
"#;

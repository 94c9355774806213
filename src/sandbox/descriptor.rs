//! Inert description of one sandboxed invocation.
//!
//! The builder is pure: it reads the immutable configuration and the probed
//! runtime and never touches the filesystem or spawns anything. The child
//! applies the descriptor after the supervisor hands it over as JSON.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::command::Command;
use super::detect::SandboxRuntime;
use super::error::SandboxError;
use crate::config::{Config, ResourceLimits};

/// Enforcement level based on detected kernel capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SandboxLevel {
    /// No kernel support: rlimits + timeout only.
    None,
    /// seccomp only.
    Minimal,
    /// Landlock V1+ + seccomp: filesystem + syscall isolation.
    Standard,
    /// Landlock V4+ + seccomp + userns: full isolation.
    Full,
}

/// Network access policy for sandboxed commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    Deny,
    Allow,
}

/// Which user the command runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Identity {
    /// The engine runs as root; drop to this uid/gid before exec.
    Drop { uid: u32, gid: u32 },
    /// The engine is already unprivileged; keep its identity.
    Inherit { uid: u32 },
    /// An approved privileged command; `sudo` stays in the command line.
    Escalated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSet {
    pub user: bool,
    pub mount: bool,
    /// The shell becomes pid 1 of a fresh pid namespace; when it exits the
    /// kernel kills everything it left behind.
    pub pid: bool,
    pub network: bool,
    pub ipc: bool,
    pub uts: bool,
}

impl NamespaceSet {
    pub fn any(&self) -> bool {
        self.user || self.mount || self.pid || self.network || self.ipc || self.uts
    }

    pub fn names(&self) -> Vec<&'static str> {
        [
            (self.user, "user"),
            (self.mount, "mount"),
            (self.pid, "pid"),
            (self.network, "net"),
            (self.ipc, "ipc"),
            (self.uts, "uts"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

/// The filesystem as seen from inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemView {
    /// Read-write working directory.
    pub workspace: PathBuf,
    pub read_only_paths: Vec<PathBuf>,
    pub writable_paths: Vec<PathBuf>,
    /// Credential locations; never granted, even when under a granted path.
    pub deny_paths: Vec<PathBuf>,
    /// Whether Landlock enforces this view.
    pub enforced: bool,
}

impl FilesystemView {
    /// Whether `path` falls under one of the denied credential locations.
    pub fn is_denied(&self, path: &Path) -> bool {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        self.deny_paths.iter().any(|deny| {
            let deny = deny.canonicalize().unwrap_or_else(|_| deny.to_path_buf());
            canonical.starts_with(&deny)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityPolicy {
    /// Clear the bounding and ambient sets.
    DropAll,
    /// Keep the bounding set so `sudo` can escalate.
    Retain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeccompProfile {
    Off,
    /// Host-damaging syscalls only.
    Baseline,
    /// Baseline plus mount, namespace and keyring syscalls.
    Strict,
}

const BASELINE_DENY: &[&str] = &[
    "ptrace",
    "kexec_load",
    "init_module",
    "finit_module",
    "delete_module",
    "reboot",
    "swapon",
    "swapoff",
    "bpf",
    "perf_event_open",
];

const STRICT_DENY: &[&str] = &[
    "mount",
    "umount2",
    "pivot_root",
    "setns",
    "unshare",
    "keyctl",
    "add_key",
    "request_key",
    "userfaultfd",
    "open_by_handle_at",
    "acct",
    "quotactl",
];

const NETWORK_DENY: &[&str] = &[
    "socket", "connect", "accept", "accept4", "bind", "listen", "sendto", "sendmsg", "sendmmsg",
    "recvfrom", "recvmsg", "recvmmsg",
];

/// Syscall filter, expressed by name. The child resolves names to numbers
/// for the running architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallFilter {
    pub profile: SeccompProfile,
    pub deny_network: bool,
}

impl SyscallFilter {
    pub fn denied_syscalls(&self) -> Vec<&'static str> {
        let mut denied = Vec::new();
        if self.profile == SeccompProfile::Off {
            return denied;
        }
        denied.extend_from_slice(BASELINE_DENY);
        if self.profile == SeccompProfile::Strict {
            denied.extend_from_slice(STRICT_DENY);
        }
        if self.deny_network {
            denied.extend_from_slice(NETWORK_DENY);
        }
        denied
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RlimitKind {
    AddressSpace,
    FileSize,
    CpuTime,
    Processes,
    OpenFiles,
    CoreSize,
}

impl RlimitKind {
    pub fn name(&self) -> &'static str {
        match self {
            RlimitKind::AddressSpace => "RLIMIT_AS",
            RlimitKind::FileSize => "RLIMIT_FSIZE",
            RlimitKind::CpuTime => "RLIMIT_CPU",
            RlimitKind::Processes => "RLIMIT_NPROC",
            RlimitKind::OpenFiles => "RLIMIT_NOFILE",
            RlimitKind::CoreSize => "RLIMIT_CORE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlimitSetting {
    pub kind: RlimitKind,
    pub soft: u64,
    pub hard: u64,
}

impl RlimitSetting {
    fn fixed(kind: RlimitKind, value: u64) -> Self {
        Self {
            kind,
            soft: value,
            hard: value,
        }
    }
}

/// Per-run cgroup v2 child directory and its limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupSettings {
    pub path: PathBuf,
    /// `cpu.max` contents: "<quota> <period>".
    pub cpu_max: String,
    pub memory_max_bytes: u64,
    pub pids_max: u32,
}

const CPU_PERIOD_US: u64 = 100_000;
const MAX_OPEN_FILES: u64 = 256;
const SANDBOX_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Serializable description of a sandboxed invocation, passed to the
/// re-exec'd child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationDescriptor {
    pub command: String,
    pub helper: PathBuf,
    pub shell: PathBuf,
    pub level: SandboxLevel,
    pub identity: Identity,
    pub namespaces: NamespaceSet,
    pub filesystem: FilesystemView,
    pub capabilities: CapabilityPolicy,
    pub no_new_privs: bool,
    pub network: NetworkPolicy,
    pub seccomp: SyscallFilter,
    pub rlimits: Vec<RlimitSetting>,
    pub cgroup: Option<CgroupSettings>,
    /// Whether a layer that cannot be applied aborts setup instead of
    /// degrading with a warning.
    pub strict: bool,
    pub env: Vec<(String, String)>,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_output_bytes: u64,
}

impl IsolationDescriptor {
    /// Human-readable rendering used for dry-runs.
    pub fn render_preview(&self) -> String {
        let mut out = String::new();
        let yes_no = |b: bool| if b { "yes" } else { "no" };

        let _ = writeln!(out, "command:      {}", self.command);
        let _ = writeln!(
            out,
            "invocation:   {} -c <command> (via {})",
            self.shell.display(),
            self.helper.display()
        );
        let _ = writeln!(out, "level:        {:?}", self.level);
        let identity = match self.identity {
            Identity::Drop { uid, gid } => format!("drop to uid {} gid {}", uid, gid),
            Identity::Inherit { uid } => format!("inherit uid {}", uid),
            Identity::Escalated => "escalated via sudo".to_string(),
        };
        let _ = writeln!(out, "identity:     {}", identity);
        let namespaces = self.namespaces.names();
        let _ = writeln!(
            out,
            "namespaces:   {}",
            if namespaces.is_empty() {
                "none".to_string()
            } else {
                namespaces.join(", ")
            }
        );
        let _ = writeln!(
            out,
            "workspace:    {} (read-write)",
            self.filesystem.workspace.display()
        );
        let _ = writeln!(
            out,
            "filesystem:   {}",
            if self.filesystem.enforced {
                "enforced by landlock"
            } else {
                "not enforced"
            }
        );
        let join = |paths: &[PathBuf]| {
            paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        let _ = writeln!(out, "  read-only:  {}", join(&self.filesystem.read_only_paths));
        let _ = writeln!(out, "  writable:   {}", join(&self.filesystem.writable_paths));
        let _ = writeln!(out, "  denied:     {}", join(&self.filesystem.deny_paths));
        let _ = writeln!(out, "capabilities: {:?}", self.capabilities);
        let _ = writeln!(out, "no_new_privs: {}", yes_no(self.no_new_privs));
        let _ = writeln!(out, "network:      {:?}", self.network);
        let _ = writeln!(
            out,
            "seccomp:      {:?} ({} syscalls denied)",
            self.seccomp.profile,
            self.seccomp.denied_syscalls().len()
        );
        for limit in &self.rlimits {
            let _ = writeln!(out, "  {:<14}{}", limit.kind.name(), limit.soft);
        }
        match &self.cgroup {
            Some(cg) => {
                let _ = writeln!(
                    out,
                    "cgroup:       {} (cpu.max {}, memory.max {}, pids.max {})",
                    cg.path.display(),
                    cg.cpu_max,
                    cg.memory_max_bytes,
                    cg.pids_max
                );
            }
            None => {
                let _ = writeln!(out, "cgroup:       none");
            }
        }
        let _ = writeln!(out, "timeout:      {}s", self.timeout.as_secs());
        let _ = write!(out, "output cap:   {} bytes", self.max_output_bytes);
        out
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Default credential directories to deny access to.
pub fn default_deny_paths() -> Vec<PathBuf> {
    let home = dirs_home();
    [
        ".ssh", ".aws", ".gnupg", ".config", ".docker", ".kube", ".npmrc", ".pypirc", ".netrc",
    ]
    .iter()
    .map(|p| home.join(p))
    .collect()
}

/// Default system read-only paths.
pub fn default_read_only_paths() -> Vec<PathBuf> {
    [
        "/usr",
        "/lib",
        "/lib64",
        "/bin",
        "/sbin",
        "/etc",
        "/dev",
        "/proc/self",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

fn dirs_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|b| b.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~"))
}

fn expand_all(paths: &[String]) -> impl Iterator<Item = PathBuf> + '_ {
    paths
        .iter()
        .map(|p| PathBuf::from(shellexpand::tilde(p).to_string()))
}

/// Resource ceilings enforced with setrlimit in the child.
pub fn rlimits_for(limits: &ResourceLimits) -> Vec<RlimitSetting> {
    const MIB: u64 = 1024 * 1024;
    let cpu_seconds = limits
        .timeout_seconds
        .saturating_mul(u64::from(limits.max_cpu_cores.max(1)));
    vec![
        RlimitSetting::fixed(
            RlimitKind::AddressSpace,
            limits.max_memory_mb.saturating_mul(MIB),
        ),
        RlimitSetting::fixed(RlimitKind::FileSize, limits.max_disk_mb.saturating_mul(MIB)),
        // Soft limit sends SIGXCPU first.
        RlimitSetting {
            kind: RlimitKind::CpuTime,
            soft: cpu_seconds,
            hard: cpu_seconds.saturating_add(1),
        },
        RlimitSetting::fixed(RlimitKind::Processes, u64::from(limits.max_processes)),
        RlimitSetting::fixed(RlimitKind::OpenFiles, MAX_OPEN_FILES),
        RlimitSetting::fixed(RlimitKind::CoreSize, 0),
    ]
}

/// Translates validated commands into descriptors.
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    config: Arc<Config>,
    runtime: Arc<SandboxRuntime>,
}

impl DescriptorBuilder {
    pub fn new(config: Arc<Config>, runtime: Arc<SandboxRuntime>) -> Self {
        Self { config, runtime }
    }

    /// Describe how `command` will run. The command must already have been
    /// approved by the rule engine.
    pub fn build(&self, command: &Command) -> Result<IsolationDescriptor, SandboxError> {
        let settings = &self.config.sandbox;
        let limits = &self.config.limits;
        let runtime = &self.runtime;

        let helper = runtime.helper.clone().ok_or_else(|| {
            SandboxError::SandboxUnavailable(
                "sandbox helper executable could not be located".to_string(),
            )
        })?;
        if settings.require_isolation && runtime.level == SandboxLevel::None {
            return Err(SandboxError::SandboxUnavailable(
                "host offers no kernel isolation and sandbox.require_isolation is set".to_string(),
            ));
        }

        let escalated = command.is_privileged();
        let level = runtime.level;

        let identity = if escalated {
            Identity::Escalated
        } else if runtime.is_root() {
            Identity::Drop {
                uid: settings.run_as_uid,
                gid: settings.run_as_gid,
            }
        } else {
            Identity::Inherit {
                uid: runtime.effective_uid,
            }
        };

        // Package downloads need the network.
        let network = if escalated {
            NetworkPolicy::Allow
        } else {
            settings.network.policy
        };

        let namespaces = if !escalated && level == SandboxLevel::Full {
            NamespaceSet {
                user: true,
                mount: true,
                pid: true,
                network: network == NetworkPolicy::Deny,
                ipc: true,
                uts: true,
            }
        } else {
            NamespaceSet::default()
        };

        let workspace = self.config.workspace_path();
        let mut read_only_paths = default_read_only_paths();
        read_only_paths.extend(expand_all(&settings.allow_paths.read));
        let mut writable_paths = vec![PathBuf::from("/tmp"), PathBuf::from("/dev/null")];
        writable_paths.extend(expand_all(&settings.allow_paths.write));
        let filesystem = FilesystemView {
            workspace: workspace.clone(),
            read_only_paths,
            writable_paths,
            deny_paths: default_deny_paths(),
            enforced: !escalated && level >= SandboxLevel::Standard,
        };

        let profile = if escalated {
            // A non-root engine's seccomp filter would be inherited by sudo.
            if runtime.is_root() {
                SeccompProfile::Baseline
            } else {
                SeccompProfile::Off
            }
        } else if level >= SandboxLevel::Minimal {
            SeccompProfile::Strict
        } else {
            SeccompProfile::Off
        };
        let seccomp = SyscallFilter {
            profile,
            deny_network: profile != SeccompProfile::Off && network == NetworkPolicy::Deny,
        };

        let cgroup = runtime.cgroup_root.as_ref().map(|root| CgroupSettings {
            path: root.join(format!("cortex-run-{}", uuid::Uuid::new_v4())),
            cpu_max: format!(
                "{} {}",
                u64::from(limits.max_cpu_cores.max(1)) * CPU_PERIOD_US,
                CPU_PERIOD_US
            ),
            memory_max_bytes: limits.max_memory_mb.saturating_mul(1024 * 1024),
            pids_max: limits.max_processes,
        });

        let home = if escalated {
            dirs_home()
        } else {
            workspace.clone()
        };
        let env = vec![
            ("PATH".to_string(), SANDBOX_PATH.to_string()),
            ("HOME".to_string(), home.display().to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("TERM".to_string(), "dumb".to_string()),
            ("CORTEX_SANDBOX".to_string(), "1".to_string()),
        ];

        Ok(IsolationDescriptor {
            command: command.raw().to_string(),
            helper,
            shell: PathBuf::from(&settings.shell),
            level,
            identity,
            namespaces,
            filesystem,
            capabilities: if escalated {
                CapabilityPolicy::Retain
            } else {
                CapabilityPolicy::DropAll
            },
            no_new_privs: !escalated,
            network,
            seccomp,
            rlimits: rlimits_for(limits),
            cgroup,
            strict: settings.require_isolation,
            env,
            timeout: Duration::from_secs(limits.timeout_seconds),
            max_output_bytes: limits.max_output_bytes,
        })
    }
}

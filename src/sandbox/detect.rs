//! Host capability detection and helper location.

use std::path::{Path, PathBuf};

use super::descriptor::SandboxLevel;
use crate::config::{LevelSetting, SandboxConfig};

/// File name of the helper binary the supervisor re-executes.
pub const HELPER_BINARY: &str = "cortex-sandbox";

/// Environment override for the helper location.
pub const HELPER_ENV: &str = "CORTEX_SANDBOX_HELPER";

/// Detected isolation capabilities of the current host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCapabilities {
    /// Landlock LSM availability and ABI version.
    pub landlock_abi: Option<u32>,

    /// Whether seccomp-bpf is available.
    pub seccomp_available: bool,

    /// Whether unprivileged user namespaces can be created.
    pub user_namespaces: bool,

    /// Whether the unified cgroup v2 hierarchy is mounted.
    pub cgroup_v2: bool,

    /// The highest enforcement level available.
    pub level: SandboxLevel,
}

impl SandboxCapabilities {
    /// A host offering no kernel isolation at all.
    pub fn none() -> Self {
        Self {
            landlock_abi: None,
            seccomp_available: false,
            user_namespaces: false,
            cgroup_v2: false,
            level: SandboxLevel::None,
        }
    }

    /// Derive the level from the individual capabilities.
    pub fn from_parts(
        landlock_abi: Option<u32>,
        seccomp_available: bool,
        user_namespaces: bool,
        cgroup_v2: bool,
    ) -> Self {
        let level = match (landlock_abi, seccomp_available, user_namespaces) {
            (Some(abi), true, true) if abi >= 4 => SandboxLevel::Full,
            (Some(_), true, _) => SandboxLevel::Standard,
            (None, true, _) => SandboxLevel::Minimal,
            _ => SandboxLevel::None,
        };
        Self {
            landlock_abi,
            seccomp_available,
            user_namespaces,
            cgroup_v2,
            level,
        }
    }

    /// Resolve the effective level given the configured setting. A request
    /// never raises the level above what the host supports.
    pub fn effective_level(&self, setting: LevelSetting) -> SandboxLevel {
        let requested = match setting {
            LevelSetting::Auto => return self.level,
            LevelSetting::Full => SandboxLevel::Full,
            LevelSetting::Standard => SandboxLevel::Standard,
            LevelSetting::Minimal => SandboxLevel::Minimal,
            LevelSetting::None => SandboxLevel::None,
        };
        requested.min(self.level)
    }

    /// Human-readable status lines for `sandbox status`.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        if let Some(abi) = self.landlock_abi {
            lines.push(format!("  Landlock:    v{:<3}                  ok", abi));
        } else {
            lines.push("  Landlock:    not available         --".to_string());
        }

        lines.push(if self.seccomp_available {
            "  Seccomp:     available             ok".to_string()
        } else {
            "  Seccomp:     not available         --".to_string()
        });

        lines.push(if self.user_namespaces {
            "  User ns:     available             ok".to_string()
        } else {
            "  User ns:     not available         --".to_string()
        });

        lines.push(if self.cgroup_v2 {
            "  cgroup v2:   mounted               ok".to_string()
        } else {
            "  cgroup v2:   not mounted           --".to_string()
        });

        lines.push(format!("  Level:       {:?}", self.level));
        lines
    }
}

/// Probe the current host for isolation capabilities.
pub fn detect_capabilities() -> SandboxCapabilities {
    #[cfg(target_os = "linux")]
    {
        SandboxCapabilities::from_parts(
            probe_landlock_abi(),
            probe_seccomp(),
            probe_user_namespaces(),
            Path::new("/sys/fs/cgroup/cgroup.controllers").exists(),
        )
    }

    #[cfg(not(target_os = "linux"))]
    {
        SandboxCapabilities::none()
    }
}

#[cfg(target_os = "linux")]
fn probe_landlock_abi() -> Option<u32> {
    // Highest ABI first; the first ruleset the kernel accepts wins.
    use landlock::{ABI, Access, AccessFs, Ruleset, RulesetAttr};

    [
        (ABI::V5, 5u32),
        (ABI::V4, 4),
        (ABI::V3, 3),
        (ABI::V2, 2),
        (ABI::V1, 1),
    ]
    .into_iter()
    .find(|(abi, _)| {
        Ruleset::default()
            .handle_access(AccessFs::from_all(*abi))
            .is_ok()
    })
    .map(|(_, version)| version)
}

#[cfg(target_os = "linux")]
fn probe_seccomp() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .map(|s| s.contains("Seccomp:"))
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn probe_user_namespaces() -> bool {
    let read_flag = |path: &str| {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
    };
    // Debian-style kernels gate unprivileged userns behind an extra sysctl.
    let clone_allowed = read_flag("/proc/sys/kernel/unprivileged_userns_clone").unwrap_or(1) != 0;
    let max_namespaces = read_flag("/proc/sys/user/max_user_namespaces").unwrap_or(0);
    clone_allowed && max_namespaces > 0
}

/// Host facts the engine depends on. Abstracted so degraded and unavailable
/// hosts can be simulated in tests.
#[cfg_attr(test, mockall::automock)]
pub trait IsolationProbe: Send + Sync {
    fn capabilities(&self) -> SandboxCapabilities;

    /// Locate the helper executable, preferring an explicitly configured path.
    fn locate_helper(&self, configured: Option<PathBuf>) -> Option<PathBuf>;

    fn effective_uid(&self) -> u32;

    /// A cgroup v2 directory the engine may create children in.
    fn cgroup_root(&self, configured: Option<PathBuf>) -> Option<PathBuf>;
}

/// Probe backed by the running host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

impl IsolationProbe for HostProbe {
    fn capabilities(&self) -> SandboxCapabilities {
        detect_capabilities()
    }

    fn locate_helper(&self, configured: Option<PathBuf>) -> Option<PathBuf> {
        if let Some(path) = configured {
            return is_executable(&path).then_some(path);
        }

        if let Ok(path) = std::env::var(HELPER_ENV) {
            let path = PathBuf::from(path);
            if is_executable(&path) {
                return Some(path);
            }
        }

        let exe = std::env::current_exe().ok()?;
        if exe.file_name().is_some_and(|name| name == HELPER_BINARY) {
            return Some(exe);
        }

        // Test binaries live in target/<profile>/deps, next to the real one.
        let dir = exe.parent()?;
        [Some(dir), dir.parent()]
            .into_iter()
            .flatten()
            .map(|d| d.join(HELPER_BINARY))
            .find(|candidate| is_executable(candidate))
    }

    fn effective_uid(&self) -> u32 {
        #[cfg(unix)]
        {
            nix::unistd::geteuid().as_raw()
        }
        #[cfg(not(unix))]
        {
            u32::MAX
        }
    }

    fn cgroup_root(&self, configured: Option<PathBuf>) -> Option<PathBuf> {
        let root = configured?;
        let writable = {
            #[cfg(unix)]
            {
                nix::unistd::access(&root, nix::unistd::AccessFlags::W_OK).is_ok()
            }
            #[cfg(not(unix))]
            {
                false
            }
        };
        (root.is_dir() && writable && root.join("cgroup.procs").exists()).then_some(root)
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.is_file() && meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        meta.is_file()
    }
}

/// Everything probed once at engine construction.
#[derive(Debug, Clone)]
pub struct SandboxRuntime {
    pub capabilities: SandboxCapabilities,
    /// Level after applying the configured setting.
    pub level: SandboxLevel,
    pub helper: Option<PathBuf>,
    pub effective_uid: u32,
    pub cgroup_root: Option<PathBuf>,
}

impl SandboxRuntime {
    pub fn probe(probe: &dyn IsolationProbe, settings: &SandboxConfig) -> Self {
        let capabilities = probe.capabilities();
        let level = capabilities.effective_level(settings.level);
        let cgroup_root = if capabilities.cgroup_v2 {
            probe.cgroup_root(settings.cgroup_root.clone())
        } else {
            None
        };
        Self {
            level,
            helper: probe.locate_helper(settings.helper_path.clone()),
            effective_uid: probe.effective_uid(),
            cgroup_root,
            capabilities,
        }
    }

    /// Whether commands can be spawned at all.
    pub fn available(&self) -> bool {
        self.helper.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.effective_uid == 0
    }

    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = self.capabilities.status_lines();
        lines.push(format!("  Effective:   {:?}", self.level));
        lines.push(match &self.helper {
            Some(path) => format!("  Helper:      {}", path.display()),
            None => "  Helper:      not found             --".to_string(),
        });
        if let Some(root) = &self.cgroup_root {
            lines.push(format!("  cgroup root: {}", root.display()));
        }
        lines
    }
}

//! Per-run cgroup v2 directories.
//!
//! The supervisor creates the directory and writes the limits before
//! spawning. The child moves itself in before exec, so every descendant is
//! accounted to the run and `cgroup.kill` reaches all of them.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use super::descriptor::CgroupSettings;

/// A created cgroup directory owned by one run.
#[derive(Debug)]
pub struct CgroupInstance {
    path: PathBuf,
}

impl CgroupInstance {
    /// Create the directory and apply limits. Controllers that are not
    /// delegated to the parent are skipped with a warning.
    pub fn create(settings: &CgroupSettings) -> io::Result<Self> {
        fs::create_dir(&settings.path)?;
        let instance = Self {
            path: settings.path.clone(),
        };

        for (file, value) in [
            ("cpu.max", settings.cpu_max.clone()),
            ("memory.max", settings.memory_max_bytes.to_string()),
            ("memory.swap.max", "0".to_string()),
            ("pids.max", settings.pids_max.to_string()),
            ("memory.oom.group", "1".to_string()),
        ] {
            let target = instance.path.join(file);
            if !target.exists() {
                debug!(cgroup = %instance.path.display(), file, "controller file not present");
                continue;
            }
            if let Err(e) = fs::write(&target, &value) {
                warn!(cgroup = %instance.path.display(), file, "failed to set cgroup limit: {}", e);
            }
        }

        Ok(instance)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Kill every process in the cgroup.
    pub fn kill(&self) {
        let kill_file = self.path.join("cgroup.kill");
        if kill_file.exists() {
            if let Err(e) = fs::write(&kill_file, "1") {
                warn!(cgroup = %self.path.display(), "cgroup.kill failed: {}", e);
            }
            return;
        }

        // Kernels before 5.14 have no cgroup.kill.
        #[cfg(unix)]
        for pid in self.pids() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }

    fn pids(&self) -> Vec<i32> {
        fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|s| s.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    /// Remove the directory. A cgroup can only be removed once empty, so
    /// killed processes get a moment to be reaped.
    pub async fn remove(self) {
        for attempt in 0..20 {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                Err(e) if attempt == 19 => {
                    warn!(cgroup = %self.path.display(), "failed to remove cgroup: {}", e);
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    }
}

/// Move the calling process into the cgroup at `path`.
pub fn attach_current_process(path: &Path) -> io::Result<()> {
    fs::write(path.join("cgroup.procs"), std::process::id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(root: &Path) -> CgroupSettings {
        CgroupSettings {
            path: root.join("cortex-run-test"),
            cpu_max: "200000 100000".to_string(),
            memory_max_bytes: 1024,
            pids_max: 16,
        }
    }

    // A plain directory stands in for cgroupfs: limit files only get written
    // when they already exist.
    #[tokio::test]
    async fn create_writes_existing_limit_files_only() {
        let tmp = tempfile::tempdir().unwrap();
        let s = settings(tmp.path());
        let instance = CgroupInstance::create(&s).unwrap();
        assert!(instance.path().is_dir());
        assert!(!instance.path().join("cpu.max").exists());
        instance.remove().await;
        assert!(!s.path.exists());
    }

    #[tokio::test]
    async fn remove_retries_without_stalling_the_runtime() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let tmp = tempfile::tempdir().unwrap();
        let s = settings(tmp.path());
        let instance = CgroupInstance::create(&s).unwrap();
        // A non-empty directory keeps every attempt failing.
        fs::write(instance.path().join("cgroup.procs"), "4242").unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                }
            }
        });

        // Single-threaded runtime: the ticker only advances if remove yields.
        instance.remove().await;
        assert!(ticks.load(Ordering::SeqCst) > 0);
        assert!(s.path.is_dir());
        ticker.abort();
    }

    #[test]
    fn create_fails_when_parent_is_missing() {
        let s = settings(Path::new("/nonexistent/cgroup/root"));
        assert!(CgroupInstance::create(&s).is_err());
    }

    #[test]
    fn attach_writes_own_pid() {
        let tmp = tempfile::tempdir().unwrap();
        attach_current_process(tmp.path()).unwrap();
        let written = fs::read_to_string(tmp.path().join("cgroup.procs")).unwrap();
        assert_eq!(written, std::process::id().to_string());
    }
}

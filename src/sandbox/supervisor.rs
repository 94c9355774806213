use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::cgroup::CgroupInstance;
use super::descriptor::IsolationDescriptor;
use super::error::SandboxError;
use super::result::{ExecutionResult, Termination};

/// argv[0] that makes the helper enter sandbox setup instead of the CLI.
pub const CHILD_ARGV0: &str = "cortex-sandbox-child";

/// Exit code the child uses when isolation setup fails before exec.
pub const SETUP_FAILED_EXIT: i32 = 125;

/// How long to wait for the pipe readers after the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How long the helper gets to kill its descendants after SIGTERM.
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8192;

/// Cap on setup diagnostics read from the status pipe.
const STATUS_CAP: usize = 4096;

enum Outcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Spawns the helper for one descriptor and owns its lifetime.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    spawned: Arc<AtomicU64>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of helper processes spawned so far.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Run the descriptor to completion, timeout or cancellation.
    ///
    /// The helper is re-executed with argv[0]=`cortex-sandbox-child` and the
    /// descriptor JSON as its only argument. It runs in its own process group.
    /// On timeout or cancellation it gets SIGTERM and [`TEARDOWN_GRACE`] to
    /// kill its descendants; then the group and cgroup are killed on every
    /// exit path, so nothing outlives the call.
    pub async fn run(
        &self,
        descriptor: &IsolationDescriptor,
        cancel: Option<&CancelToken>,
    ) -> Result<ExecutionResult, SandboxError> {
        let payload = serde_json::to_string(descriptor)
            .map_err(|e| SandboxError::SpawnFailure(format!("failed to encode descriptor: {}", e)))?;

        let cgroup = descriptor.cgroup.as_ref().and_then(|settings| {
            CgroupInstance::create(settings)
                .map_err(|e| {
                    warn!(cgroup = %settings.path.display(), "cgroup not created, continuing without: {}", e);
                })
                .ok()
        });

        let mut command = tokio::process::Command::new(&descriptor.helper);
        command
            .arg0(CHILD_ARGV0)
            .arg(&payload)
            .current_dir(&descriptor.filesystem.workspace)
            .env_clear()
            .envs(descriptor.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        #[cfg(unix)]
        let status_pipe = StatusPipe::new()
            .map_err(|e| SandboxError::SpawnFailure(format!("failed to create status pipe: {}", e)))?;
        #[cfg(unix)]
        status_pipe.attach(&mut command);

        let start = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(cgroup) = cgroup {
                    cgroup.remove().await;
                }
                return Err(SandboxError::SpawnFailure(format!(
                    "failed to spawn {}: {}",
                    descriptor.helper.display(),
                    e
                )));
            }
        };
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let pid = child.id();
        debug!(pid, command = %descriptor.command, "spawned sandbox helper");

        let cap = usize::try_from(descriptor.max_output_bytes).unwrap_or(usize::MAX);
        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), cap));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), cap));
        #[cfg(unix)]
        let status_task = Some(status_pipe.into_reader());
        #[cfg(not(unix))]
        let status_task: Option<JoinHandle<(Vec<u8>, bool)>> = None;

        let waited = tokio::select! {
            status = child.wait() => status.map(Outcome::Exited),
            _ = tokio::time::sleep(descriptor.timeout) => Ok(Outcome::TimedOut),
            _ = wait_for_cancel(cancel) => Ok(Outcome::Cancelled),
        };

        let exited = matches!(waited, Ok(Outcome::Exited(_)));
        if !exited {
            terminate_helper(pid, &mut child).await;
        }
        // Stragglers (backgrounded grandchildren) must not outlive the call.
        kill_tree(pid, cgroup.as_ref());
        if !exited {
            let _ = child.wait().await;
        }
        let duration = start.elapsed();

        let (stdout, stdout_truncated) = join_reader(stdout_task).await;
        let (stderr, stderr_truncated) = join_reader(stderr_task).await;
        let truncated = stdout_truncated || stderr_truncated;
        let setup_failure = match status_task {
            Some(task) => join_reader(task).await.0,
            None => String::new(),
        };

        if let Some(cgroup) = cgroup {
            cgroup.remove().await;
        }

        let outcome = waited.map_err(|e| {
            SandboxError::SpawnFailure(format!("failed to wait for sandbox helper: {}", e))
        })?;

        match outcome {
            Outcome::Exited(status) => {
                if !setup_failure.trim().is_empty() {
                    return Err(SandboxError::SpawnFailure(format!(
                        "sandbox setup failed: {}",
                        setup_failure.trim()
                    )));
                }
                let code = status.code();
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                #[cfg(not(unix))]
                let signal = None;

                let result =
                    ExecutionResult::exited(code, signal, stdout, stderr, duration, truncated);
                info!(pid, "sandboxed command {}", result.summary());
                Ok(result)
            }
            Outcome::TimedOut => {
                warn!(pid, timeout_secs = descriptor.timeout.as_secs(), "sandboxed command timed out");
                Ok(ExecutionResult::interrupted(
                    Termination::TimedOut,
                    stdout,
                    stderr,
                    duration,
                    truncated,
                ))
            }
            Outcome::Cancelled => {
                info!(pid, "sandboxed command cancelled");
                Ok(ExecutionResult::interrupted(
                    Termination::Cancelled,
                    stdout,
                    stderr,
                    duration,
                    truncated,
                ))
            }
        }
    }
}

async fn wait_for_cancel(cancel: Option<&CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Ask the helper to tear down its tree, and give it a moment to do so.
async fn terminate_helper(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        if kill(Pid::from_raw(pid), Signal::SIGTERM).is_err() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if tokio::time::timeout(TEARDOWN_GRACE, child.wait()).await.is_err() {
        debug!(pid, "helper still running after SIGTERM, killing the group");
    }
}

/// SIGKILL the helper's process group, and the cgroup when there is one.
fn kill_tree(pid: Option<u32>, cgroup: Option<&CgroupInstance>) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        // ESRCH just means the group is already empty.
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Some(cgroup) = cgroup {
        cgroup.kill();
    }
}

/// Read a pipe to EOF, keeping at most `cap` bytes. The rest is drained so
/// the writer never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
                if n > room {
                    truncated = true;
                }
            }
        }
    }
    (kept, truncated)
}

async fn join_reader(task: JoinHandle<(Vec<u8>, bool)>) -> (String, bool) {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok((bytes, truncated))) => (String::from_utf8_lossy(&bytes).into_owned(), truncated),
        Ok(Err(e)) => {
            warn!("output reader failed: {}", e);
            (String::new(), false)
        }
        Err(_) => {
            // A descendant escaped the group and still holds the pipe.
            abort.abort();
            warn!("output pipe still open after teardown, discarding");
            (String::new(), true)
        }
    }
}

/// A pipe the helper sees as [`STATUS_FD`](super::child::STATUS_FD). The
/// helper writes setup failures to it and closes it before the shell runs,
/// so nothing the command prints can pose as one.
#[cfg(unix)]
struct StatusPipe {
    read: std::os::fd::OwnedFd,
    write: std::os::fd::OwnedFd,
}

#[cfg(unix)]
impl StatusPipe {
    fn new() -> nix::Result<Self> {
        let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
        Ok(Self { read, write })
    }

    /// Place the write end at the status descriptor in the spawned helper.
    fn attach(&self, command: &mut tokio::process::Command) {
        use super::child::STATUS_FD;
        use nix::libc;
        use std::os::fd::AsRawFd;

        let write_fd = self.write.as_raw_fd();
        // Only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(move || {
                if write_fd == STATUS_FD {
                    // dup2 onto itself keeps close-on-exec set.
                    let flags = libc::fcntl(write_fd, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(write_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(write_fd, STATUS_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    /// Drop our write end and read the helper's report to EOF.
    fn into_reader(self) -> JoinHandle<(Vec<u8>, bool)> {
        let Self { read, write } = self;
        drop(write);
        tokio::spawn(async move {
            match tokio::net::unix::pipe::Receiver::from_owned_fd(read) {
                Ok(receiver) => read_capped(Some(receiver), STATUS_CAP).await,
                Err(e) => {
                    warn!("status pipe unreadable: {}", e);
                    (Vec::new(), false)
                }
            }
        })
    }
}

/// Set argv[0] on the spawned command.
trait CommandExt {
    fn arg0(&mut self, arg0: &str) -> &mut Self;
}

#[cfg(unix)]
impl CommandExt for tokio::process::Command {
    fn arg0(&mut self, arg0: &str) -> &mut Self {
        use std::os::unix::process::CommandExt;
        self.as_std_mut().arg0(arg0);
        self
    }
}

#[cfg(not(unix))]
impl CommandExt for tokio::process::Command {
    fn arg0(&mut self, _arg0: &str) -> &mut Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_capped_truncates_and_drains() {
        let data = vec![b'x'; 10_000];
        let (kept, truncated) = read_capped(Some(&data[..]), 100).await;
        assert_eq!(kept.len(), 100);
        assert!(truncated);

        let (kept, truncated) = read_capped(Some(&b"hello"[..]), 100).await;
        assert_eq!(kept, b"hello");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn read_capped_without_pipe_is_empty() {
        let (kept, truncated) = read_capped(None::<&[u8]>, 10).await;
        assert!(kept.is_empty());
        assert!(!truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn status_pipe_carries_only_what_fd_3_receives() {
        for (script, expected) in [
            ("printf 'setup broke' >&3", &b"setup broke"[..]),
            ("echo 'setup broke' >&2; exit 125", &b""[..]),
        ] {
            let pipe = StatusPipe::new().unwrap();
            let mut command = tokio::process::Command::new("/bin/sh");
            command
                .arg("-c")
                .arg(script)
                .stderr(Stdio::null())
                .kill_on_drop(true);
            pipe.attach(&mut command);
            let mut child = command.spawn().unwrap();
            let reader = pipe.into_reader();
            child.wait().await.unwrap();
            let (bytes, truncated) = reader.await.unwrap();
            assert_eq!(bytes, expected, "{}", script);
            assert!(!truncated);
        }
    }

    #[tokio::test]
    async fn missing_helper_is_a_spawn_failure() {
        use crate::config::Config;
        use crate::paths::Paths;
        use crate::sandbox::command::Command;
        use crate::sandbox::descriptor::{DescriptorBuilder, SandboxLevel};
        use crate::sandbox::detect::{SandboxCapabilities, SandboxRuntime};
        use std::path::PathBuf;

        let tmp = tempfile::tempdir().unwrap();
        let config = Config::with_paths(Paths::under(tmp.path()));
        std::fs::create_dir_all(config.workspace_path()).unwrap();
        let runtime = SandboxRuntime {
            capabilities: SandboxCapabilities::none(),
            level: SandboxLevel::None,
            helper: Some(PathBuf::from("/nonexistent/cortex-sandbox")),
            effective_uid: 1000,
            cgroup_root: None,
        };
        let descriptor = DescriptorBuilder::new(Arc::new(config), Arc::new(runtime))
            .build(&Command::parse("echo hi"))
            .unwrap();

        let supervisor = ProcessSupervisor::new();
        let err = supervisor.run(&descriptor, None).await.unwrap_err();
        assert!(matches!(err, SandboxError::SpawnFailure(_)));
        assert_eq!(supervisor.spawn_count(), 0);
    }
}

use std::os::fd::RawFd;

use nix::libc;
use nix::unistd::{ForkResult, Pid, fork, getpid, getppid};

use super::descriptor::{Identity, IsolationDescriptor, RlimitSetting};
use super::proxy;
use super::supervisor::SETUP_FAILED_EXIT;

/// Descriptor the supervisor leaves open for setup failures. It is marked
/// close-on-exec first thing, so the shell never sees it.
pub const STATUS_FD: RawFd = 3;

/// Entry point for the sandbox child process.
///
/// Called when the binary detects argv[0] ends with "cortex-sandbox-child".
/// This function never returns. The helper joins the cgroup, enters the
/// namespaces, and forks: the child applies the remaining restrictions and
/// execs the shell, the parent stays behind as a proxy (see
/// [`proxy::supervise`]) and exits with the shell's status.
///
/// argv layout:
///   argv[0] = "cortex-sandbox-child" (already consumed by dispatch)
///   argv[1] = IsolationDescriptor JSON
pub fn sandbox_child_main() -> ! {
    close_status_on_exec();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        fail("expected isolation descriptor argument");
    }

    let descriptor: IsolationDescriptor = match serde_json::from_str(&args[1]) {
        Ok(d) => d,
        Err(e) => fail(&format!("failed to parse descriptor: {}", e)),
    };

    // Join the cgroup while still owning the directory the parent created.
    if let Some(cgroup) = &descriptor.cgroup
        && let Err(e) = super::cgroup::attach_current_process(&cgroup.path)
    {
        if descriptor.strict {
            fail(&format!("cgroup attach: {}", e));
        }
        eprintln!("cortex-sandbox: cgroup not applied: {}", e);
    }

    // The proxy re-raises fatal signals of the shell; never as a core file.
    let _ = nix::sys::resource::setrlimit(nix::sys::resource::Resource::RLIMIT_CORE, 0, 0);

    // A user namespace maps the final uid, so the drop happens before the
    // unshare. Otherwise the proxy keeps the engine's identity and the
    // payload drops alone, which leaves the proxy out of the payload's reach.
    let identity_in_proxy = descriptor.namespaces.user;
    if identity_in_proxy && let Err(e) = apply_identity(&descriptor.identity) {
        fail(&format!("identity: {}", e));
    }

    if let Err(e) = enter_platform_namespaces(&descriptor) {
        fail(&e);
    }

    if let Err(e) = proxy::become_subreaper() {
        eprintln!("cortex-sandbox: {} not applied", e);
    }
    if let Err(e) = proxy::install_terminate_handler() {
        fail(&e);
    }

    let proxy_pid = getpid();
    // Single-threaded here: dispatch happens before any runtime starts.
    match unsafe { fork() } {
        Err(e) => fail(&format!("fork: {}", e)),
        Ok(ForkResult::Child) => run_payload(&descriptor, proxy_pid, !identity_in_proxy),
        Ok(ForkResult::Parent { child }) => {
            unsafe {
                libc::close(STATUS_FD);
            }
            proxy::exit_like(proxy::supervise(child))
        }
    }
}

/// The forked child: finish the restrictions and become the shell.
fn run_payload(descriptor: &IsolationDescriptor, proxy_pid: Pid, drop_identity: bool) -> ! {
    proxy::reset_terminate_handler();

    if drop_identity && let Err(e) = apply_identity(&descriptor.identity) {
        fail(&format!("identity: {}", e));
    }

    // Set after the identity change, which would clear it.
    #[cfg(target_os = "linux")]
    if let Err(e) = nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL) {
        fail(&format!("parent death signal: {}", e));
    }
    // Pid 1 of a new pid namespace sees its parent as 0.
    let parent = getppid();
    if parent.as_raw() != 0 && parent != proxy_pid {
        fail("proxy exited during setup");
    }

    // After setuid: RLIMIT_NPROC counts processes of the final uid.
    if let Err(e) = apply_rlimits(&descriptor.rlimits) {
        fail(&format!("rlimits: {}", e));
    }

    if let Err(e) = apply_platform_sandbox(descriptor) {
        fail(&e);
    }

    exec_shell(descriptor);
}

fn close_status_on_exec() {
    // EBADF when started without one; `fail` then falls back to stderr.
    unsafe {
        libc::fcntl(STATUS_FD, libc::F_SETFD, libc::FD_CLOEXEC);
    }
}

/// Report a setup failure on the status descriptor and exit. Stderr is the
/// fallback when the helper was started without one.
fn fail(message: &str) -> ! {
    let written = unsafe { libc::write(STATUS_FD, message.as_ptr().cast(), message.len()) };
    if written < 0 {
        eprintln!("cortex-sandbox: setup failed: {}", message);
    }
    unsafe { libc::_exit(SETUP_FAILED_EXIT) }
}

fn apply_identity(identity: &Identity) -> Result<(), String> {
    use nix::unistd::{Gid, Uid, setgid, setuid};

    match *identity {
        Identity::Drop { uid, gid } => {
            #[cfg(target_os = "linux")]
            nix::unistd::setgroups(&[]).map_err(|e| format!("setgroups: {}", e))?;
            setgid(Gid::from_raw(gid)).map_err(|e| format!("setgid({}): {}", gid, e))?;
            setuid(Uid::from_raw(uid)).map_err(|e| format!("setuid({}): {}", uid, e))?;
            if uid != 0 && Uid::effective().is_root() {
                return Err("still root after setuid".to_string());
            }
            // setuid clears the dumpable flag, which makes /proc/self
            // root-owned and breaks the uid_map write for namespaces.
            #[cfg(target_os = "linux")]
            unsafe {
                libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0);
            }
            Ok(())
        }
        Identity::Inherit { .. } | Identity::Escalated => Ok(()),
    }
}

/// Apply resource limits using setrlimit, clamped to the current hard limit.
fn apply_rlimits(rlimits: &[RlimitSetting]) -> Result<(), String> {
    use super::descriptor::RlimitKind;
    use nix::sys::resource::{Resource, getrlimit, setrlimit};

    for setting in rlimits {
        let resource = match setting.kind {
            RlimitKind::AddressSpace => Resource::RLIMIT_AS,
            RlimitKind::FileSize => Resource::RLIMIT_FSIZE,
            RlimitKind::CpuTime => Resource::RLIMIT_CPU,
            // Not available on macOS.
            #[cfg(target_os = "linux")]
            RlimitKind::Processes => Resource::RLIMIT_NPROC,
            #[cfg(not(target_os = "linux"))]
            RlimitKind::Processes => continue,
            RlimitKind::OpenFiles => Resource::RLIMIT_NOFILE,
            RlimitKind::CoreSize => Resource::RLIMIT_CORE,
        };

        let (_, current_hard) =
            getrlimit(resource).map_err(|e| format!("{}: {}", setting.kind.name(), e))?;
        let hard = setting.hard.min(current_hard);
        let soft = setting.soft.min(hard);
        setrlimit(resource, soft, hard).map_err(|e| format!("{}: {}", setting.kind.name(), e))?;
    }

    Ok(())
}

/// Namespaces are entered by the proxy so the fork lands in the new pid
/// namespace.
fn enter_platform_namespaces(descriptor: &IsolationDescriptor) -> Result<(), String> {
    #[cfg(target_os = "linux")]
    {
        super::linux::enter_namespaces(descriptor)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = descriptor;
        Ok(())
    }
}

/// Apply platform-specific sandbox enforcement in the payload.
fn apply_platform_sandbox(descriptor: &IsolationDescriptor) -> Result<(), String> {
    #[cfg(target_os = "linux")]
    {
        super::linux::restrict_self(descriptor)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = descriptor;
        // No kernel isolation here: rlimits and the timeout only.
        Ok(())
    }
}

/// Exec the shell with the command, replacing the current process.
fn exec_shell(descriptor: &IsolationDescriptor) -> ! {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new(&descriptor.shell)
        .arg("-c")
        .arg(&descriptor.command)
        .exec();

    // exec() only returns on error
    fail(&format!(
        "failed to exec {}: {}",
        descriptor.shell.display(),
        err
    ));
}

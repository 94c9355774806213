use super::descriptor::{CapabilityPolicy, FilesystemView, IsolationDescriptor, NamespaceSet};
use nix::libc;

/// Outside strict mode a layer the kernel refuses is reported and skipped;
/// rlimits and the timeout still bound the command.
fn degrade(descriptor: &IsolationDescriptor, layer: &str, err: String) -> Result<(), String> {
    if descriptor.strict {
        Err(format!("{}: {}", layer, err))
    } else {
        eprintln!("cortex-sandbox: {} not applied: {}", layer, err);
        Ok(())
    }
}

/// Enter the descriptor's namespaces. Runs in the proxy, before the fork, so
/// the shell is born as pid 1 of the new pid namespace.
pub fn enter_namespaces(descriptor: &IsolationDescriptor) -> Result<(), String> {
    if descriptor.namespaces.any()
        && let Err(e) = unshare_namespaces(&descriptor.namespaces)
    {
        degrade(descriptor, "namespaces", e)?;
    }
    Ok(())
}

/// Restrict the calling process: capabilities → NO_NEW_PRIVS → Landlock →
/// seccomp. Runs in the forked payload only.
///
/// Seccomp must be last because it blocks syscalls the earlier layers need.
pub fn restrict_self(descriptor: &IsolationDescriptor) -> Result<(), String> {
    if descriptor.capabilities == CapabilityPolicy::DropAll {
        drop_capabilities();
    }

    if descriptor.no_new_privs {
        set_no_new_privs()?;
    }

    if descriptor.filesystem.enforced
        && let Err(e) = apply_landlock(&descriptor.filesystem)
    {
        degrade(descriptor, "landlock", e)?;
    }

    let denied = descriptor.seccomp.denied_syscalls();
    if !denied.is_empty()
        && let Err(e) = apply_seccomp(&denied)
    {
        degrade(descriptor, "seccomp", e)?;
    }

    Ok(())
}

fn set_no_new_privs() -> Result<(), String> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Unshare the requested namespaces and map the caller's ids into the new
/// user namespace.
fn unshare_namespaces(set: &NamespaceSet) -> Result<(), String> {
    use nix::mount::{MsFlags, mount};
    use nix::sched::{CloneFlags, unshare};
    use nix::unistd::{getegid, geteuid};

    let uid = geteuid().as_raw();
    let gid = getegid().as_raw();

    let mut flags = CloneFlags::empty();
    for (on, flag) in [
        (set.user, CloneFlags::CLONE_NEWUSER),
        (set.mount, CloneFlags::CLONE_NEWNS),
        (set.pid, CloneFlags::CLONE_NEWPID),
        (set.network, CloneFlags::CLONE_NEWNET),
        (set.ipc, CloneFlags::CLONE_NEWIPC),
        (set.uts, CloneFlags::CLONE_NEWUTS),
    ] {
        if on {
            flags |= flag;
        }
    }
    unshare(flags).map_err(|e| format!("unshare: {}", e))?;

    if set.user {
        std::fs::write("/proc/self/setgroups", "deny")
            .map_err(|e| format!("setgroups deny: {}", e))?;
        std::fs::write("/proc/self/uid_map", format!("{} {} 1", uid, uid))
            .map_err(|e| format!("uid_map: {}", e))?;
        std::fs::write("/proc/self/gid_map", format!("{} {} 1", gid, gid))
            .map_err(|e| format!("gid_map: {}", e))?;
    }

    if set.mount {
        // Keep mount events from propagating back to the host.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| format!("make / private: {}", e))?;
    }

    Ok(())
}

/// Clear the capability bounding and ambient sets.
///
/// Dropping from the bounding set needs CAP_SETPCAP; without it the drop is a
/// no-op, which is harmless because an unprivileged process holds no
/// capabilities and NO_NEW_PRIVS stops it from gaining any.
fn drop_capabilities() {
    let last_cap = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse::<libc::c_ulong>().ok())
        .unwrap_or(40);

    for cap in 0..=last_cap {
        unsafe {
            libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0);
        }
    }
    unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        );
    }
}

/// Apply Landlock filesystem rules.
///
/// Uses BestEffort ABI negotiation (V5→V1) so rules degrade gracefully
/// on older kernels.
fn apply_landlock(view: &FilesystemView) -> Result<(), String> {
    use landlock::{
        ABI, Access, AccessFs, BitFlags, PathBeneath, PathFd, Ruleset, RulesetAttr,
        RulesetCreatedAttr, RulesetStatus,
    };
    use std::path::Path;

    let abi = ABI::V5;

    let read_access = AccessFs::ReadFile | AccessFs::ReadDir | AccessFs::Execute;
    let write_access = read_access
        | AccessFs::WriteFile
        | AccessFs::Truncate
        | AccessFs::RemoveFile
        | AccessFs::RemoveDir
        | AccessFs::MakeReg
        | AccessFs::MakeDir
        | AccessFs::MakeSym;

    // Directory-only rights are invalid on a file rule.
    let for_path = |path: &Path, access: BitFlags<AccessFs>| {
        if path.is_dir() {
            access
        } else {
            access & AccessFs::from_file(abi)
        }
    };

    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(abi))
        .map_err(|e| format!("Landlock ruleset creation: {}", e))?
        .create()
        .map_err(|e| format!("Landlock ruleset create: {}", e))?;

    let grants = view
        .read_only_paths
        .iter()
        .map(|p| (p, read_access))
        .chain(std::iter::once((&view.workspace, write_access)))
        .chain(view.writable_paths.iter().map(|p| (p, write_access)));

    for (path, access) in grants {
        if view.is_denied(path) {
            continue;
        }
        if let Ok(fd) = PathFd::new(path) {
            let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, for_path(path, access)));
        }
    }

    // deny_paths are enforced by omission: once a ruleset handles an access
    // type, any path without a rule is denied.

    let status = ruleset
        .restrict_self()
        .map_err(|e| format!("Landlock restrict_self: {}", e))?;

    match status.ruleset {
        RulesetStatus::FullyEnforced => {}
        RulesetStatus::PartiallyEnforced => {
            eprintln!("cortex-sandbox: Landlock partially enforced (ABI downgrade)");
        }
        RulesetStatus::NotEnforced => {
            return Err("Landlock not enforced by kernel".to_string());
        }
    }

    Ok(())
}

/// Resolve a syscall name for the running architecture.
fn syscall_number(name: &str) -> Option<i64> {
    let nr = match name {
        "socket" => libc::SYS_socket,
        "connect" => libc::SYS_connect,
        "accept" => libc::SYS_accept,
        "accept4" => libc::SYS_accept4,
        "bind" => libc::SYS_bind,
        "listen" => libc::SYS_listen,
        "sendto" => libc::SYS_sendto,
        "sendmsg" => libc::SYS_sendmsg,
        "sendmmsg" => libc::SYS_sendmmsg,
        "recvfrom" => libc::SYS_recvfrom,
        "recvmsg" => libc::SYS_recvmsg,
        "recvmmsg" => libc::SYS_recvmmsg,
        "ptrace" => libc::SYS_ptrace,
        "kexec_load" => libc::SYS_kexec_load,
        "init_module" => libc::SYS_init_module,
        "finit_module" => libc::SYS_finit_module,
        "delete_module" => libc::SYS_delete_module,
        "reboot" => libc::SYS_reboot,
        "swapon" => libc::SYS_swapon,
        "swapoff" => libc::SYS_swapoff,
        "bpf" => libc::SYS_bpf,
        "perf_event_open" => libc::SYS_perf_event_open,
        "mount" => libc::SYS_mount,
        "umount2" => libc::SYS_umount2,
        "pivot_root" => libc::SYS_pivot_root,
        "setns" => libc::SYS_setns,
        "unshare" => libc::SYS_unshare,
        "keyctl" => libc::SYS_keyctl,
        "add_key" => libc::SYS_add_key,
        "request_key" => libc::SYS_request_key,
        "userfaultfd" => libc::SYS_userfaultfd,
        "open_by_handle_at" => libc::SYS_open_by_handle_at,
        "acct" => libc::SYS_acct,
        "quotactl" => libc::SYS_quotactl,
        _ => return None,
    };
    Some(nr as i64)
}

/// Apply a seccomp-bpf deny list; denied syscalls fail with EPERM.
fn apply_seccomp(names: &[&str]) -> Result<(), String> {
    use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
    use std::collections::BTreeMap;

    // An empty rule list matches the syscall unconditionally.
    let rules: BTreeMap<i64, Vec<SeccompRule>> = names
        .iter()
        .filter_map(|name| syscall_number(name))
        .map(|nr| (nr, Vec::new()))
        .collect();

    let target_arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|e: seccompiler::BackendError| format!("seccomp unsupported arch: {}", e))?;

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        target_arch,
    )
    .map_err(|e| format!("seccomp filter creation: {}", e))?;

    let bpf: BpfProgram = filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| format!("seccomp BPF compilation: {}", e))?;

    seccompiler::apply_filter(&bpf).map_err(|e| format!("seccomp apply_filter: {}", e))?;

    Ok(())
}

//! The helper's half after the fork.
//!
//! The helper forks once: the child becomes the shell, the parent stays
//! behind as a proxy outside every payload restriction. It is a child
//! subreaper, so anything the shell orphans (including `setsid` escapees)
//! is reparented to it. When the shell ends, or the supervisor asks for a
//! teardown with SIGTERM, the proxy kills every descendant it can find and
//! exits with the shell's status.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on kill sweeps against a tree that keeps forking.
const SWEEP_ROUNDS: usize = 50;

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn request_terminate(_signal: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// How the shell ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadExit {
    Code(i32),
    Signal(Signal),
}

/// Route SIGTERM into a flag the wait loop polls.
pub fn install_terminate_handler() -> Result<(), String> {
    let action = SigAction::new(
        SigHandler::Handler(request_terminate),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGTERM, &action) }
        .map(|_| ())
        .map_err(|e| format!("SIGTERM handler: {}", e))
}

/// Give the payload default SIGTERM handling back before it execs.
pub fn reset_terminate_handler() {
    let _ = unsafe { signal::signal(Signal::SIGTERM, SigHandler::SigDfl) };
}

/// Orphans of the payload are reparented here instead of to init.
pub fn become_subreaper() -> Result<(), String> {
    #[cfg(target_os = "linux")]
    {
        nix::sys::prctl::set_child_subreaper(true).map_err(|e| format!("subreaper: {}", e))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(())
    }
}

/// Wait for the payload, reaping reparented orphans along the way, then kill
/// whatever it left behind.
pub fn supervise(payload: Pid) -> PayloadExit {
    let mut killed_payload = false;
    let exit = loop {
        if TERMINATE.load(Ordering::SeqCst) && !killed_payload {
            let _ = signal::kill(payload, Signal::SIGKILL);
            killed_payload = true;
        }
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) if pid == payload => break PayloadExit::Code(code),
            Ok(WaitStatus::Signaled(pid, sig, _)) if pid == payload => {
                break PayloadExit::Signal(sig);
            }
            Ok(WaitStatus::StillAlive) => std::thread::sleep(POLL_INTERVAL),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                eprintln!("cortex-sandbox: lost track of the shell: {}", e);
                break PayloadExit::Code(libc::EXIT_FAILURE);
            }
        }
    };

    let swept = kill_descendants(nix::unistd::getpid());
    if swept > 0 {
        eprintln!("cortex-sandbox: killed {} leftover process(es)", swept);
    }
    exit
}

/// Mirror the payload's status as the helper's own.
pub fn exit_like(exit: PayloadExit) -> ! {
    match exit {
        PayloadExit::Code(code) => std::process::exit(code),
        PayloadExit::Signal(sig) => {
            let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
            let _ = signal::raise(sig);
            std::process::exit(128 + sig as i32)
        }
    }
}

/// SIGKILL every live descendant of `root` until a sweep finds none. Returns
/// the number of kills delivered.
pub fn kill_descendants(root: Pid) -> usize {
    let mut killed = 0;
    for _ in 0..SWEEP_ROUNDS {
        let targets = descendants(root.as_raw(), &process_table());
        if targets.is_empty() {
            break;
        }
        for pid in targets {
            if signal::kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
                killed += 1;
            }
        }
        reap_children();
        std::thread::sleep(POLL_INTERVAL);
    }
    reap_children();
    killed
}

fn reap_children() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return,
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}

/// One row of the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcEntry {
    pid: i32,
    ppid: i32,
    zombie: bool,
}

fn process_table() -> Vec<ProcEntry> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(|pid| {
            let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
            parse_stat(pid, &stat)
        })
        .collect()
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are read after the last `)`.
fn parse_stat(pid: i32, stat: &str) -> Option<ProcEntry> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some(ProcEntry {
        pid,
        ppid,
        zombie: state == "Z" || state == "X",
    })
}

/// Live processes below `root`, breadth first.
fn descendants(root: i32, table: &[ProcEntry]) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<&ProcEntry>> = HashMap::new();
    for entry in table {
        children.entry(entry.ppid).or_default().push(entry);
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        for child in children.get(&parent).into_iter().flatten() {
            if child.pid == root {
                continue;
            }
            if !child.zombie {
                found.push(child.pid);
            }
            queue.push_back(child.pid);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pid: i32, ppid: i32) -> ProcEntry {
        ProcEntry {
            pid,
            ppid,
            zombie: false,
        }
    }

    #[test]
    fn stat_parsing_survives_odd_command_names() {
        let parsed = parse_stat(42, "42 (evil) S 7 (x)) R 1 42 42 0").unwrap();
        assert_eq!(parsed.ppid, 1);
        assert!(!parsed.zombie);

        let parsed = parse_stat(43, "43 (sleep) Z 10 43 43 0").unwrap();
        assert_eq!(parsed.ppid, 10);
        assert!(parsed.zombie);

        assert!(parse_stat(44, "garbage").is_none());
    }

    #[test]
    fn descendants_walk_the_whole_subtree() {
        let table = [
            entry(10, 1),
            entry(11, 10),
            entry(12, 11),
            entry(13, 12),
            entry(20, 1),
            entry(21, 20),
            ProcEntry {
                pid: 14,
                ppid: 10,
                zombie: true,
            },
        ];
        let mut found = descendants(10, &table);
        found.sort();
        assert_eq!(found, [11, 12, 13]);
        assert!(descendants(21, &table).is_empty());
    }

    #[test]
    fn own_process_table_lists_this_process() {
        if !std::path::Path::new("/proc/self/stat").exists() {
            return;
        }
        let me = std::process::id() as i32;
        let table = process_table();
        let row = table.iter().find(|e| e.pid == me).unwrap();
        assert_eq!(row.ppid, nix::unistd::getppid().as_raw());
    }
}

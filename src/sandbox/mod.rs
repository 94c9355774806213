//! Sandboxed execution of untrusted shell commands.
//!
//! A command is parsed and validated by the rule engine, translated into an
//! inert [`IsolationDescriptor`], and run by re-executing the helper binary
//! with argv[0]=`cortex-sandbox-child`. The helper joins the cgroup and
//! enters the namespaces, then forks. The child finishes the restrictions
//! and execs the shell; the parent
//! stays as a proxy that reaps and kills whatever the shell leaves behind.
//! Setup failures travel over a private status pipe, never over stderr.

pub mod cancel;
pub mod cgroup;
#[cfg(unix)]
pub mod child;
pub mod command;
pub mod descriptor;
pub mod detect;
pub mod error;
pub mod executor;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(unix)]
pub mod proxy;
pub mod result;
pub mod rules;
pub mod supervisor;

pub use cancel::CancelToken;
#[cfg(unix)]
pub use child::sandbox_child_main;
pub use command::{ChainOperator, Command, Segment, Substitution};
pub use descriptor::{
    DescriptorBuilder, Identity, IsolationDescriptor, NetworkPolicy, SandboxLevel,
};
pub use detect::{HostProbe, IsolationProbe, SandboxCapabilities, SandboxRuntime, detect_capabilities};
pub use error::SandboxError;
pub use executor::SandboxExecutor;
pub use result::{ExecutionResult, Termination};
pub use rules::{RuleEngine, ValidationDecision};
pub use supervisor::{CHILD_ARGV0, ProcessSupervisor};

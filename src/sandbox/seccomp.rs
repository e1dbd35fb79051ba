//! Compiling and installing seccomp-bpf filters. Filters are compiled once,
//! by the engine, against an architecture-specific syscall number table, and
//! the compiled BPF program (not the source config) is shipped to the
//! `sandbox-init` helper so the helper never needs `seccompiler`'s JSON
//! parsing on the hot path.

use std::collections::HashMap;

use log::debug;
use seccompiler::{sock_filter, BpfProgram, SeccompAction, SeccompFilter, TargetArch};
use serde::{Deserialize, Serialize};

use crate::error::prelude::*;

const fn get_arch() -> TargetArch {
    #[cfg(target_arch = "x86_64")]
    {
        TargetArch::x86_64
    }
    #[cfg(target_arch = "aarch64")]
    {
        TargetArch::aarch64
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        compile_error!("Unsupported architecture");
    }
}

/// `seccompiler::sock_filter` doesn't implement `Serialize`/`Deserialize`,
/// so the compiled program is re-expressed in this shape to cross the
/// engine -> helper JSON boundary.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: usize,
    pub jf: usize,
    pub k: u32,
}

impl From<sock_filter> for SockFilter {
    fn from(filter: sock_filter) -> Self {
        Self {
            code: filter.code,
            jt: filter.jt as usize,
            jf: filter.jf as usize,
            k: filter.k,
        }
    }
}

impl From<SockFilter> for sock_filter {
    fn from(val: SockFilter) -> Self {
        sock_filter {
            code: val.code,
            jt: val.jt as u8,
            jf: val.jf as u8,
            k: val.k,
        }
    }
}

#[derive(Serialize, Deserialize, Default, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum MismatchAction {
    Allow,
    Errno { errno: u32 },
    KillThread,
    #[default]
    KillProcess,
    Log,
    Trace { number: u32 },
    Trap,
}

impl From<MismatchAction> for SeccompAction {
    fn from(action: MismatchAction) -> Self {
        match action {
            MismatchAction::Allow => SeccompAction::Allow,
            MismatchAction::Errno { errno } => SeccompAction::Errno(errno),
            MismatchAction::KillThread => SeccompAction::KillThread,
            MismatchAction::KillProcess => SeccompAction::KillProcess,
            MismatchAction::Log => SeccompAction::Log,
            MismatchAction::Trace { number } => SeccompAction::Trace(number),
            MismatchAction::Trap => SeccompAction::Trap,
        }
    }
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct BpfConfig {
    #[serde(default)]
    pub mismatch_action: MismatchAction,
    #[serde(default)]
    pub allowed_calls: Vec<String>,
}

type SyscallNo = i32;

/// Syscalls every compiled test-case binary needs regardless of language:
/// process lifecycle, basic I/O, and memory management.
const BASE_ALLOWED_SYSCALLS: &[&str] = &[
    "read",
    "write",
    "readv",
    "writev",
    "close",
    "fstat",
    "lseek",
    "mmap",
    "munmap",
    "mprotect",
    "brk",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "ioctl",
    "pread64",
    "pwrite64",
    "access",
    "openat",
    "getcwd",
    "exit",
    "exit_group",
    "arch_prctl",
    "gettid",
    "futex",
    "set_tid_address",
    "set_robust_list",
    "clock_gettime",
    "getrandom",
    "sigaltstack",
    "madvise",
    "prlimit64",
];

/// Syscalls resolved to a fixed number already, independent of the call
/// table lookup (kept separate so a missing name in `allowed_calls` never
/// silently drops these).
const SPECIAL_CASE_SYSCALLS: &[SyscallNo] = &[];

#[cfg(target_arch = "x86_64")]
const X86_64_CALLS: &[(&str, SyscallNo)] = &[
    ("read", 0),
    ("write", 1),
    ("close", 3),
    ("fstat", 5),
    ("lseek", 8),
    ("mmap", 9),
    ("mprotect", 10),
    ("munmap", 11),
    ("brk", 12),
    ("rt_sigaction", 13),
    ("rt_sigprocmask", 14),
    ("rt_sigreturn", 15),
    ("ioctl", 16),
    ("pread64", 17),
    ("pwrite64", 18),
    ("readv", 19),
    ("writev", 20),
    ("access", 21),
    ("openat", 257),
    ("getcwd", 79),
    ("exit", 60),
    ("exit_group", 231),
    ("arch_prctl", 158),
    ("gettid", 186),
    ("futex", 202),
    ("set_tid_address", 218),
    ("set_robust_list", 273),
    ("clock_gettime", 228),
    ("getrandom", 318),
    ("sigaltstack", 131),
    ("madvise", 28),
    ("prlimit64", 302),
];

#[cfg(target_arch = "aarch64")]
const AARCH64_CALLS: &[(&str, SyscallNo)] = &[
    ("read", 63),
    ("write", 64),
    ("close", 57),
    ("fstat", 80),
    ("lseek", 62),
    ("mmap", 222),
    ("mprotect", 226),
    ("munmap", 215),
    ("brk", 214),
    ("rt_sigaction", 134),
    ("rt_sigprocmask", 135),
    ("rt_sigreturn", 139),
    ("ioctl", 29),
    ("pread64", 67),
    ("pwrite64", 68),
    ("readv", 65),
    ("writev", 66),
    ("access", 1033),
    ("openat", 56),
    ("getcwd", 17),
    ("exit", 93),
    ("exit_group", 94),
    ("gettid", 178),
    ("futex", 98),
    ("set_tid_address", 96),
    ("set_robust_list", 99),
    ("clock_gettime", 113),
    ("getrandom", 278),
    ("sigaltstack", 132),
    ("madvise", 233),
    ("prlimit64", 261),
];

pub fn compile_filter(config: &BpfConfig) -> Result<Vec<SockFilter>> {
    let arch = get_arch();

    #[cfg(target_arch = "x86_64")]
    let call_table: HashMap<&str, SyscallNo> = X86_64_CALLS.iter().copied().collect();
    #[cfg(target_arch = "aarch64")]
    let call_table: HashMap<&str, SyscallNo> = AARCH64_CALLS.iter().copied().collect();

    let rules = BASE_ALLOWED_SYSCALLS
        .iter()
        .copied()
        .chain(config.allowed_calls.iter().map(|s| s.as_str()))
        .map(|call| {
            call_table
                .get(call)
                .copied()
                .ok_or(call)
                .map(|call| (call as i64, vec![]))
        })
        .chain(
            SPECIAL_CASE_SYSCALLS
                .iter()
                .map(|call| Result::<_, &str>::Ok((*call as i64, vec![]))),
        )
        .collect::<Result<_, _>>()
        .map_err(|call| anyhow!("Unknown syscall for seccomp: {}", call))?;

    let filter = SeccompFilter::new(
        rules,
        config.mismatch_action.into(),
        SeccompAction::Allow,
        arch,
    )
    .context("Failed to create seccomp filter")?;

    let compiled: BpfProgram = filter
        .try_into()
        .context("Failed to compile seccomp filter")?;

    Ok(compiled.into_iter().map(Into::into).collect())
}

pub fn install_filters(filters: &[SockFilter]) -> Result {
    debug!("Applying seccomp filters");
    let bpf_filter = filters.iter().cloned().map(Into::into).collect::<Vec<_>>();
    seccompiler::apply_filter(&bpf_filter).context("Couldn't apply seccomp filter")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_with_default_config() {
        let filters = compile_filter(&BpfConfig::default()).expect("compiles");
        assert!(!filters.is_empty());
    }

    #[test]
    fn unknown_syscall_name_is_rejected() {
        let config = BpfConfig {
            allowed_calls: vec!["definitely_not_a_syscall".to_string()],
            ..Default::default()
        };
        assert!(compile_filter(&config).is_err());
    }
}

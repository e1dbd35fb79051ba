//! The JSON-on-stdin contract between the engine and the `sandbox-init`
//! helper binary: `{RunSpec, Isolation, EnableSeccomp, EnableNs}`.
//! A single request/response pair rather than a line protocol, since the
//! helper here does not need an interactive UID/GID-map handshake — that
//! step is folded into the request itself via `uid_map`/`gid_map`.

use serde::{Deserialize, Serialize};

use crate::model::{IsolationProfile, RunResult, RunSpec};
use crate::sandbox::seccomp::SockFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperRequest {
    pub run_spec: RunSpec,
    pub isolation: IsolationProfile,
    pub enable_seccomp: bool,
    pub enable_ns: bool,
    /// Compiled BPF program, empty when `enable_seccomp` is false.
    pub seccomp_program: Vec<SockFilter>,
}

/// What the helper reports over its own stdout before `execve`-ing into the
/// user's program; `RunResult` itself is assembled by the engine afterward
/// from cgroup/rusage data the helper doesn't have access to post-exec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HelperResponse {
    Ready,
    SetupFailed(String),
}

impl HelperRequest {
    pub fn to_stdin_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Placeholder carried alongside a [`RunResult`] when the engine needs to
/// distinguish "helper never got past setup" from "user program exited
/// nonzero" without re-deriving it from `exit_code` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperOutcome {
    Exited,
    SetupFailed,
    Signaled,
}

impl From<&RunResult> for HelperOutcome {
    fn from(result: &RunResult) -> Self {
        if result.exit_code == -1 {
            HelperOutcome::Signaled
        } else {
            HelperOutcome::Exited
        }
    }
}

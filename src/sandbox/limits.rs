//! `setrlimit` application, process hardening, and privilege drop, all run
//! inside `sandbox-init` immediately before `execve`.

use log::debug;
use nix::sys::resource::{setrlimit, Resource};

use crate::error::prelude::*;
use crate::model::ResourceLimit;

/// Runner uid/gid inside the sandbox's user namespace. Fixed rather than
/// configurable: the namespace mapping (see `namespaces::map_uid_gid`)
/// always maps this to an unprivileged host id.
pub const RUNNER_UID: nix::unistd::Uid = nix::unistd::Uid::from_raw(1000);
pub const RUNNER_GID: nix::unistd::Gid = nix::unistd::Gid::from_raw(100);

pub fn apply_rlimits(limits: &ResourceLimit) -> Result {
    let cpu_secs = limits.cpu_time_ms.div_ceil(1000);
    setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs).context("Couldn't set RLIMIT_CPU")?;

    let output_bytes = limits.output_mb * 1024 * 1024;
    setrlimit(Resource::RLIMIT_FSIZE, output_bytes, output_bytes)
        .context("Couldn't set RLIMIT_FSIZE")?;

    let stack_bytes = limits.stack_mb * 1024 * 1024;
    setrlimit(Resource::RLIMIT_STACK, stack_bytes, stack_bytes)
        .context("Couldn't set RLIMIT_STACK")?;

    setrlimit(Resource::RLIMIT_NPROC, limits.pids as u64, limits.pids as u64)
        .context("Couldn't set RLIMIT_NPROC")?;

    Ok(())
}

pub fn harden_process() -> Result {
    debug!("Applying process hardening");
    nix::sys::prctl::set_dumpable(false).context("Couldn't set dumpable to false")?;
    nix::sys::prctl::set_no_new_privs().context("Couldn't set no_new_privs")
}

fn su(uid: nix::unistd::Uid, gid: nix::unistd::Gid) -> Result {
    nix::unistd::setresgid(gid, gid, gid).context("Couldn't setresgid")?;
    nix::unistd::setgroups(&[gid]).context("Couldn't setgroups")?;
    nix::unistd::setresuid(uid, uid, uid).context("Couldn't setresuid")
}

pub fn su_root() -> Result {
    nix::sys::prctl::set_keepcaps(true).context("Couldn't set keepcaps")?;
    su(nix::unistd::Uid::from_raw(0), nix::unistd::Gid::from_raw(0))
        .context("Couldn't switch to root")?;
    nix::sys::prctl::set_keepcaps(false).context("Couldn't clear keepcaps")
}

pub fn su_runner() -> Result {
    nix::sys::prctl::set_keepcaps(false).context("Couldn't clear keepcaps")?;
    su(RUNNER_UID, RUNNER_GID).context("Couldn't switch to runner")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_limit_rounds_up_to_whole_seconds() {
        let limits = ResourceLimit {
            cpu_time_ms: 2500,
            ..Default::default()
        };
        assert_eq!(limits.cpu_time_ms.div_ceil(1000), 3);
    }
}

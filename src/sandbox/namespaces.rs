//! Namespace setup run inside the `sandbox-init` helper: `unshare` into new
//! mount/pid/uts/ipc/user(/net) namespaces, then the PID-1 fork trick so the
//! process that `execve`s the user's program is pid 1 in the new namespace.

use nix::sched::CloneFlags;
use nix::unistd::ForkResult;
use log::debug;

use crate::error::prelude::*;

pub fn unshare(disable_network: bool) -> Result {
    debug!("Setting up namespaces");
    let mut flags = CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWCGROUP
        | CloneFlags::CLONE_NEWUTS;
    if disable_network {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    nix::sched::unshare(flags).context("Couldn't create new namespace(s)")
}

/// Forks so the returned value is running as pid 1 of the new PID
/// namespace; the original process waits for it and exits with its status.
/// Safe only because the caller hasn't spawned other threads yet.
pub fn fork_to_pid1() -> Result {
    debug!("Forking to become pid 1 of the new namespace");
    unsafe {
        match nix::unistd::fork().context("Couldn't fork pid 1 in new PID namespace")? {
            ForkResult::Parent { child } => {
                let status = nix::sys::wait::waitpid(child, None)
                    .context("Couldn't wait for pid 1 child")?;
                let code = match status {
                    nix::sys::wait::WaitStatus::Exited(_, code) => code,
                    _ => 1,
                };
                std::process::exit(code);
            }
            ForkResult::Child => Ok(()),
        }
    }
}

/// Maps uid/gid 0 (inside the namespace) to the host's unprivileged runner
/// uid/gid via `newuidmap`/`newgidmap`, the only operation that must run
/// from outside the new user namespace. Since `sandbox-init` runs as its
/// own unprivileged process (no separate service/worker split), this maps
/// the helper's own pid immediately after `unshare` and before the pid-1
/// fork.
pub async fn map_uid_gid(pid: i32, inside_uid: u32, outside_uid: u32) -> Result {
    use tokio::process::Command;

    let run = |prog: &str, id_inside: u32, id_outside: u32| async move {
        let output = Command::new(prog)
            .arg(pid.to_string())
            .arg("0")
            .arg(outside_uid.to_string())
            .arg("1")
            .arg(id_inside.to_string())
            .arg((outside_uid + 1).to_string())
            .arg("1")
            .output()
            .await
            .with_context(|| format!("Couldn't run {prog}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{prog} failed: {stderr}");
        }
        Ok::<(), anyhow::Error>(())
    };

    run("newuidmap", inside_uid, outside_uid).await?;
    run("newgidmap", inside_uid, outside_uid).await?;
    Ok(())
}

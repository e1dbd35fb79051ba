//! Helper binary spawned once per sandboxed run. Reads a `HelperRequest` as
//! a single JSON document on stdin, sets up namespaces/mounts/limits/seccomp,
//! then `execve`s into the requested program. Its own binary rather than a
//! re-exec of the service's own executable.
//!
//! Exit codes: the child's own exit code on success; 125 if the JSON request
//! is malformed; 126 if sandbox setup (namespaces/mounts/limits/seccomp)
//! fails; 127 if `execve` itself fails. Setup failures are always reported on
//! stderr, never swallowed.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use judge_exec::model::{BindMount, IsolationProfile, RunSpec};
use judge_exec::sandbox::helper_proto::HelperRequest;
use judge_exec::sandbox::{limits, mounts, namespaces, seccomp};

const SANDBOX_ROOT: &str = "/run/sandbox-init/root";

fn main() {
    env_logger::init();

    let request = match read_request() {
        Ok(request) => request,
        Err(e) => {
            eprintln!("sandbox-init: {e:?}");
            std::process::exit(125);
        }
    };

    if let Err(e) = setup(&request) {
        eprintln!("sandbox-init: {e:?}");
        std::process::exit(126);
    }

    if let Err(e) = exec_into(&request.run_spec) {
        eprintln!("sandbox-init: {e:?}");
        std::process::exit(127);
    }
}

fn setup(request: &HelperRequest) -> anyhow::Result<()> {
    if request.enable_ns {
        setup_namespaced_root(request)?;
    }

    limits::apply_rlimits(&request.run_spec.limits)?;
    limits::harden_process()?;

    if request.enable_seccomp {
        seccomp::install_filters(&request.seccomp_program)?;
    }

    redirect_stdio(&request.run_spec)?;
    std::env::set_current_dir(&request.run_spec.work_dir)?;
    Ok(())
}

fn read_request() -> anyhow::Result<HelperRequest> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| anyhow::anyhow!("couldn't read request from stdin: {e}"))?;
    serde_json::from_str(&input).map_err(|e| anyhow::anyhow!("malformed helper request: {e}"))
}

fn setup_namespaced_root(request: &HelperRequest) -> anyhow::Result<()> {
    let outside_uid = nix::unistd::Uid::current().as_raw();

    namespaces::unshare(request.isolation.disable_network)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(namespaces::map_uid_gid(
        std::process::id() as i32,
        limits::RUNNER_UID.as_raw(),
        outside_uid,
    ))?;

    namespaces::fork_to_pid1()?;

    limits::su_root()?;

    let root = PathBuf::from(SANDBOX_ROOT);
    std::fs::create_dir_all(&root)?;

    let binds = build_bind_mounts(&request.isolation);
    mounts::setup_rootfs(&root, &binds, "64m")?;
    mounts::chroot_into(&root)?;

    limits::su_runner()?;

    Ok(())
}

fn build_bind_mounts(profile: &IsolationProfile) -> Vec<BindMount> {
    let mut binds = Vec::with_capacity(profile.bind_mounts.len() + 1);
    if let Some(rootfs) = &profile.rootfs_path {
        binds.push(BindMount {
            source: rootfs.clone(),
            target: "/".to_string(),
            read_only: true,
        });
    }
    binds.extend(profile.bind_mounts.iter().cloned());
    binds
}

fn redirect_stdio(spec: &RunSpec) -> anyhow::Result<()> {
    redirect_fd(spec.stdin_path.as_deref(), 0, false)?;
    redirect_fd(spec.stdout_path.as_deref(), 1, true)?;
    redirect_fd(spec.stderr_path.as_deref(), 2, true)?;
    Ok(())
}

fn redirect_fd(path: Option<&str>, fd: i32, writable: bool) -> anyhow::Result<()> {
    let file = match path {
        Some(p) => open_for_redirect(Path::new(p), writable)?,
        None => open_for_redirect(Path::new("/dev/null"), writable)?,
    };
    nix::unistd::dup2(file.as_raw_fd(), fd)
        .map_err(|e| anyhow::anyhow!("couldn't redirect fd {fd}: {e}"))?;
    Ok(())
}

fn open_for_redirect(path: &Path, writable: bool) -> anyhow::Result<std::fs::File> {
    if writable {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("couldn't open {} for writing: {e}", path.display()))
    } else {
        OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("couldn't open {} for reading: {e}", path.display()))
    }
}

fn exec_into(spec: &RunSpec) -> anyhow::Result<()> {
    let cmd = spec
        .cmd
        .first()
        .ok_or_else(|| anyhow::anyhow!("empty command"))?;
    let program = CString::new(cmd.as_str())?;
    let argv = spec
        .cmd
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    let envp = build_envp(&spec.env);

    nix::unistd::execve(&program, &argv, &envp)
        .map_err(|e| anyhow::anyhow!("execve failed: {e}"))?;
    unreachable!("execve either replaced this process or returned an error above")
}

fn build_envp(env: &HashMap<String, String>) -> Vec<CString> {
    let mut base = vec![
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        "HOME=/tmp".to_string(),
        "LANG=C.UTF-8".to_string(),
    ];
    for (k, v) in env {
        base.push(format!("{k}={v}"));
    }
    base.into_iter()
        .filter_map(|s| CString::new(s).ok())
        .collect()
}

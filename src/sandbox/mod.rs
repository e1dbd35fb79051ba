//! Runs one program in isolation under resource limits and produces a
//! [`RunResult`]. A single engine that spawns the `sandbox-init` helper
//! binary per run and supervises it with a `select!`-raced
//! wait/timeout/cancellation shape.

pub mod cgroup;
pub mod helper_proto;
pub mod limits;
pub mod mounts;
pub mod namespaces;
pub mod seccomp;

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::SandboxConfig;
use crate::error::prelude::*;
use crate::model::{IsolationProfile, ResourceLimit, RunResult, RunSpec};

use cgroup::{setup_root_cgroup, CGroup, CGroupStats};
use helper_proto::HelperRequest;
use seccomp::BpfConfig;

/// cgroups in flight, keyed by `submission_id`; a submission may have
/// several concurrent test-case cgroups (compile + N parallel test runs are
/// not actually parallel in this design, but the map supports it).
type Registry = Arc<Mutex<HashMap<String, Vec<CGroup>>>>;

pub struct SandboxEngine {
    config: SandboxConfig,
    root: Option<CGroup>,
    service: Option<CGroup>,
    registry: Registry,
}

enum StopReason {
    Exited,
    WallTimeout,
    CpuTimeout,
    Cancelled,
}

impl SandboxEngine {
    pub async fn new(config: SandboxConfig) -> Result<Self> {
        if !config.enable_cgroup {
            return Ok(Self {
                config,
                root: None,
                service: None,
                registry: Arc::new(Mutex::new(HashMap::new())),
            });
        }

        let (root, service) = setup_root_cgroup(&config.cgroup_root)
            .await
            .context("Couldn't set up root cgroup")?;

        Ok(Self {
            config,
            root: Some(root),
            service: Some(service),
            registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn resolve_seccomp_path(&self, profile: &IsolationProfile) -> Option<PathBuf> {
        let path = profile.seccomp_profile_path.as_ref()?;
        let path = Path::new(path);
        Some(if path.is_relative() {
            Path::new(&self.config.seccomp_dir).join(path)
        } else {
            path.to_path_buf()
        })
    }

    async fn load_seccomp_program(
        &self,
        profile: &IsolationProfile,
    ) -> Result<Vec<seccomp::SockFilter>> {
        let bpf_config = match self.resolve_seccomp_path(profile) {
            Some(path) => {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("Couldn't read seccomp profile {}", path.display()))?;
                serde_json::from_str::<BpfConfig>(&text)
                    .context("Couldn't parse seccomp profile")?
            }
            None => BpfConfig::default(),
        };
        seccomp::compile_filter(&bpf_config)
    }

    fn validate(spec: &RunSpec, profile: &IsolationProfile, enable_ns: bool) -> Result<()> {
        if spec.cmd.is_empty() {
            bail!("RunSpec.cmd must not be empty");
        }
        if spec.work_dir.trim().is_empty() {
            bail!("RunSpec.work_dir must not be empty");
        }
        if !enable_ns && (profile.rootfs_path.is_some() || !profile.bind_mounts.is_empty()) {
            bail!("rootfs_path and bind_mounts require namespaces to be enabled");
        }
        Ok(())
    }

    /// Runs one program in isolation and produces a [`RunResult`]. On every
    /// return path the helper's process group is killed, its cgroup is
    /// destroyed, and the cgroup registry entry is removed.
    pub async fn run(&self, spec: RunSpec, profile: IsolationProfile) -> Result<RunResult> {
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (&spec, &profile);
            bail!("sandbox engine is unsupported on this platform");
        }

        #[cfg(target_os = "linux")]
        {
            Self::validate(&spec, &profile, self.config.enable_namespaces)?;

            let test_cgroup = if self.config.enable_cgroup {
                let service = self
                    .service
                    .as_ref()
                    .context("cgroup enabled but service cgroup missing")?;
                let nanos = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos();
                let name = format!("{}__{}-{}", spec.submission_id, spec.test_id, nanos);
                let cg = service
                    .create_child(&name, true)
                    .await
                    .context("Couldn't create per-run cgroup")?;
                cg.apply_hard_limits(&spec.limits).await?;
                self.registry
                    .lock()
                    .await
                    .entry(spec.submission_id.clone())
                    .or_default()
                    .push(cg.clone());
                Some(cg)
            } else {
                None
            };

            let result = self.run_inner(&spec, &profile, test_cgroup.as_ref()).await;

            if let Some(cg) = &test_cgroup {
                let mut registry = self.registry.lock().await;
                if let Some(list) = registry.get_mut(&spec.submission_id) {
                    list.retain(|c| c.path() != cg.path());
                    if list.is_empty() {
                        registry.remove(&spec.submission_id);
                    }
                }
                if let Err(e) = cg.shutdown().await {
                    warn!("Couldn't tear down per-run cgroup: {:?}", e);
                }
            }

            result
        }
    }

    #[cfg(target_os = "linux")]
    async fn run_inner(
        &self,
        spec: &RunSpec,
        profile: &IsolationProfile,
        test_cgroup: Option<&CGroup>,
    ) -> Result<RunResult> {
        let seccomp_program = if self.config.enable_seccomp {
            self.load_seccomp_program(profile).await?
        } else {
            Vec::new()
        };

        let request = HelperRequest {
            run_spec: spec.clone(),
            isolation: profile.clone(),
            enable_seccomp: self.config.enable_seccomp,
            enable_ns: self.config.enable_namespaces,
            seccomp_program,
        };

        let mut child = Command::new(&self.config.helper_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // Own process group so the monitor can SIGKILL the whole tree via -pid.
            .process_group(0)
            .spawn()
            .context("Couldn't spawn sandbox-init helper")?;
        let started_at = std::time::Instant::now();

        let mut stdin = child.stdin.take().context("Couldn't take helper stdin")?;
        let payload = request.to_stdin_json()?;
        stdin
            .write_all(payload.as_bytes())
            .await
            .context("Couldn't write request to helper")?;
        drop(stdin);

        if self.config.enable_cgroup {
            if let (Some(cg), Some(pid)) = (test_cgroup, child.id()) {
                cg.move_pid(pid as i32)
                    .await
                    .context("Couldn't enroll helper into cgroup")?;
            }
        }

        let stats_before = match test_cgroup {
            Some(cg) => cg.get_stats().await.unwrap_or_default(),
            None => CGroupStats::default(),
        };

        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(None::<StopReasonTag>);
        let monitor_handle = test_cgroup.map(|cg| {
            let cg = cg.clone();
            let limits = spec.limits;
            let wall = Duration::from_millis(limits.wall_time_ms);
            let tx = stop_tx.clone();
            tokio::spawn(async move { monitor_loop(cg, limits, wall, tx).await })
        });

        let reason;
        let status = tokio::select! {
            biased;
            _ = stop_rx.changed() => {
                reason = match *stop_rx.borrow() {
                    Some(StopReasonTag::Wall) => StopReason::WallTimeout,
                    Some(StopReasonTag::Cpu) => StopReason::CpuTimeout,
                    _ => StopReason::Cancelled,
                };
                kill_process_group(child.id());
                child.wait().await.ok()
            }
            status = child.wait() => {
                reason = StopReason::Exited;
                status.ok()
            }
        };

        if let Some(handle) = monitor_handle {
            handle.abort();
        }

        let timed_out = matches!(reason, StopReason::WallTimeout | StopReason::CpuTimeout);

        let stats_after = match test_cgroup {
            Some(cg) => cg.get_stats().await.unwrap_or_default(),
            None => stats_before,
        };
        let used_stats = stats_after - stats_before;

        let oom_killed = test_cgroup.is_some() && used_stats.check_broke_memory_limit();

        let memory_kb = match test_cgroup {
            Some(cg) => cg.get_memory_peak().await.unwrap_or(0) / 1024,
            None => 0,
        };

        let time_ms = if test_cgroup.is_some() {
            used_stats.cpu_usage_usec / 1000
        } else {
            0
        };

        let mut stderr_capture = Vec::new();
        if let Some(mut stderr) = child.stderr.take() {
            let mut buf = vec![0u8; self.config.stdout_stderr_max_bytes];
            if let Ok(n) = stderr.read(&mut buf).await {
                stderr_capture = buf[..n].to_vec();
            }
        }

        let (stdout_capture, output_kb) = match &spec.stdout_path {
            Some(path) => {
                let bytes = tokio::fs::read(path).await.unwrap_or_default();
                let output_kb = bytes.len() as u64 / 1024;
                let truncated = bytes
                    .into_iter()
                    .take(self.config.stdout_stderr_max_bytes)
                    .collect();
                (truncated, output_kb)
            }
            None => (Vec::new(), 0),
        };

        let exit_code = if timed_out || matches!(reason, StopReason::Cancelled) {
            -1
        } else {
            status
                .and_then(|s| s.code())
                .or_else(|| status.and_then(|s| s.signal()).map(|_| -1))
                .unwrap_or(-1)
        };

        Ok(RunResult {
            exit_code,
            time_ms,
            wall_time_ms: started_at.elapsed().as_millis() as u64,
            memory_kb,
            output_kb,
            stdout_capture,
            stderr_capture,
            oom_killed,
            timed_out,
        })
    }

    /// Cooperative cancellation: writes `1` to every cgroup registered
    /// against this submission's `cgroup.kill`.
    pub async fn kill_submission(&self, submission_id: &str) -> Result {
        let registry = self.registry.lock().await;
        if let Some(cgroups) = registry.get(submission_id) {
            for cg in cgroups {
                cg.kill().await.ok();
            }
        }
        Ok(())
    }

    pub fn default_limits() -> ResourceLimit {
        ResourceLimit::default()
    }
}

#[derive(Debug, Clone, Copy)]
enum StopReasonTag {
    Wall,
    Cpu,
}

#[cfg(target_os = "linux")]
async fn monitor_loop(
    cgroup: CGroup,
    limits: ResourceLimit,
    wall: Duration,
    tx: tokio::sync::watch::Sender<Option<StopReasonTag>>,
) {
    let wall_deadline = tokio::time::sleep(wall);
    tokio::pin!(wall_deadline);
    let mut poll = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = &mut wall_deadline, if limits.wall_time_ms != 0 => {
                debug!("Sandbox run exceeded wall time limit");
                tx.send(Some(StopReasonTag::Wall)).ok();
                return;
            }
            _ = poll.tick() => {
                if let Ok(stats) = cgroup.get_stats().await {
                    if stats.check_broke_cpu_time(limits.cpu_time_ms) {
                        debug!("Sandbox run exceeded cpu time limit");
                        tx.send(Some(StopReasonTag::Cpu)).ok();
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn kill_process_group(child_id: Option<u32>) {
    if let Some(id) = child_id {
        let pid = Pid::from_raw(-(id as i32));
        match signal::kill(pid, Signal::SIGKILL) {
            Ok(_) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => warn!("Couldn't kill process group {}: {:?}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_cmd() {
        let spec = RunSpec {
            submission_id: "s".into(),
            test_id: "t".into(),
            work_dir: "/tmp".into(),
            cmd: vec![],
            env: HashMap::new(),
            stdin_path: None,
            stdout_path: None,
            stderr_path: None,
            limits: ResourceLimit::default(),
            profile_name: "run".into(),
        };
        let profile = IsolationProfile::default();
        assert!(SandboxEngine::validate(&spec, &profile, true).is_err());
    }

    #[test]
    fn validate_rejects_rootfs_without_namespaces() {
        let spec = RunSpec {
            submission_id: "s".into(),
            test_id: "t".into(),
            work_dir: "/tmp".into(),
            cmd: vec!["/bin/true".into()],
            env: HashMap::new(),
            stdin_path: None,
            stdout_path: None,
            stderr_path: None,
            limits: ResourceLimit::default(),
            profile_name: "run".into(),
        };
        let profile = IsolationProfile {
            rootfs_path: Some("/rootfs".into()),
            ..Default::default()
        };
        assert!(SandboxEngine::validate(&spec, &profile, false).is_err());
    }
}

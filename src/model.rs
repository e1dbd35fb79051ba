//! The data model shared by every component: submissions, the on-queue
//! message envelope, data packs, status, and sandbox run results.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Origin of a submission; determines queue routing and priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scene {
    Contest,
    Practice,
    Custom,
    Rejudge,
}

impl Scene {
    /// `contest → 0` (highest) .. `rejudge → 3` (lowest).
    pub fn priority_tier(&self) -> u8 {
        match self {
            Scene::Contest => 0,
            Scene::Practice => 1,
            Scene::Custom => 2,
            Scene::Rejudge => 3,
        }
    }

    pub fn topic_suffix(&self) -> &'static str {
        match self.priority_tier() {
            0 => "level0",
            1 => "level1",
            2 => "level2",
            _ => "level3",
        }
    }
}

/// Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: String,
    pub problem_id: i64,
    pub user_id: i64,
    pub contest_id: Option<i64>,
    pub language_id: String,
    pub source_code: Vec<u8>,
    pub source_object_key: String,
    pub source_hash: String,
    pub scene: Scene,
    pub created_at: DateTime<Utc>,
}

/// The on-queue value. Separate from [`Submission`] because the envelope
/// headers (priority/retry/expiration) are queue plumbing, not submission
/// data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeMessage {
    pub submission_id: String,
    pub problem_id: i64,
    pub language_id: String,
    pub source_object_key: String,
    pub source_hash: String,
    pub contest_id: Option<i64>,
    pub user_id: i64,
    pub priority: u8,
    #[serde(default)]
    pub extra_compile_flags: Vec<String>,
}

/// Queue envelope headers, carried alongside a serialized [`JudgeMessage`] body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    /// 0 disables expiration checking.
    pub expiration_ms: u64,
}

impl EnvelopeHeaders {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_ms > 0
            && (now - self.timestamp).num_milliseconds() > self.expiration_ms as i64
    }
}

/// One test case inside a published data pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPackCase {
    pub input_path: String,
    pub answer_path: String,
    #[serde(default = "default_score")]
    pub score: u32,
    #[serde(default)]
    pub limits_override: Option<ResourceLimit>,
}

fn default_score() -> u32 {
    1
}

/// Content-addressed by `(problem_id, version, data_pack_hash)`. Immutable
/// once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDataPack {
    pub problem_id: i64,
    pub version: u32,
    pub data_pack_hash: String,
    pub cases: Vec<DataPackCase>,
    /// Whether to keep running cases after the first non-Accepted one.
    /// Defaults to `false` — a manifest that omits this flag stops the pool
    /// at the first failure.
    #[serde(default)]
    pub run_all: bool,
    #[serde(default)]
    pub default_limits: Option<ResourceLimit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeVerdict {
    Pending,
    Compiling,
    Running,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    RuntimeError,
    CompileError,
    SystemError,
    Canceled,
}

impl JudgeVerdict {
    /// Terminal status: anything other than Pending/Compiling/Running.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Compiling | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerTestResult {
    pub test_id: usize,
    pub status: JudgeVerdict,
    pub time_ms: u64,
    pub memory_kb: u64,
    pub output_kb: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total_tests: u32,
    pub done_tests: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusTimestamps {
    pub received_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The authoritative state machine. `done_tests` never decreases; once
/// `status` is terminal, further transitions must be rejected by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeStatus {
    pub submission_id: String,
    pub status: JudgeVerdict,
    pub progress: Progress,
    #[serde(default)]
    pub per_test: Vec<PerTestResult>,
    pub timestamps: StatusTimestamps,
    #[serde(default)]
    pub compile_log: Option<String>,
}

impl JudgeStatus {
    pub fn new_pending(submission_id: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            submission_id: submission_id.into(),
            status: JudgeVerdict::Pending,
            progress: Progress::default(),
            per_test: Vec::new(),
            timestamps: StatusTimestamps {
                received_at: Some(received_at),
                started_at: None,
                finished_at: None,
            },
            compile_log: None,
        }
    }

    /// A non-terminal-only in-place merge, honoring the monotone invariant.
    /// Returns `false` (and leaves `self` unchanged) if `self` is already
    /// terminal or if `next` would move `done_tests` backwards.
    pub fn apply(&mut self, next: JudgeStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if next.progress.done_tests < self.progress.done_tests {
            return false;
        }
        *self = next;
        true
    }
}

/// A `{type:"final", status, created_at}` event published to `status.final`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Final {
        status: JudgeStatus,
        created_at: i64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_mb: u64,
    pub stack_mb: u64,
    pub output_mb: u64,
    pub pids: u32,
}

impl Default for ResourceLimit {
    fn default() -> Self {
        Self {
            cpu_time_ms: 2_000,
            wall_time_ms: 5_000,
            memory_mb: 256,
            stack_mb: 64,
            output_mb: 16,
            pids: 32,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsolationProfile {
    pub rootfs_path: Option<String>,
    pub seccomp_profile_path: Option<String>,
    pub disable_network: bool,
    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,
}

/// One sandboxed execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    pub submission_id: String,
    pub test_id: String,
    pub work_dir: String,
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub stdin_path: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub limits: ResourceLimit,
    pub profile_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub exit_code: i32,
    pub time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_kb: u64,
    pub output_kb: u64,
    pub stdout_capture: Vec<u8>,
    pub stderr_capture: Vec<u8>,
    pub oom_killed: bool,
    pub timed_out: bool,
}

/// Helper row shape for the durable status store. `sqlx::FromRow` derives
/// against a flattened representation; `JudgeStatus` itself nests
/// `progress`/`timestamps`/`per_test`, which are stored as JSON text columns.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JudgeStatusRow {
    pub submission_id: String,
    pub status: String,
    pub progress_json: String,
    pub per_test_json: String,
    pub timestamps_json: String,
    pub compile_log: Option<String>,
    pub updated_at: NaiveDateTime,
}

impl JudgeStatusRow {
    pub fn from_status(status: &JudgeStatus, updated_at: NaiveDateTime) -> anyhow::Result<Self> {
        Ok(Self {
            submission_id: status.submission_id.clone(),
            status: serde_json::to_string(&status.status)?,
            progress_json: serde_json::to_string(&status.progress)?,
            per_test_json: serde_json::to_string(&status.per_test)?,
            timestamps_json: serde_json::to_string(&status.timestamps)?,
            compile_log: status.compile_log.clone(),
            updated_at,
        })
    }

    pub fn into_status(self) -> anyhow::Result<JudgeStatus> {
        Ok(JudgeStatus {
            submission_id: self.submission_id,
            status: serde_json::from_str(&self.status)?,
            progress: serde_json::from_str(&self.progress_json)?,
            per_test: serde_json::from_str(&self.per_test_json)?,
            timestamps: serde_json::from_str(&self.timestamps_json)?,
            compile_log: self.compile_log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_maps_to_expected_tiers() {
        assert_eq!(Scene::Contest.priority_tier(), 0);
        assert_eq!(Scene::Practice.topic_suffix(), "level1");
        assert_eq!(Scene::Rejudge.priority_tier(), 3);
    }

    #[test]
    fn terminal_status_rejects_further_transitions() {
        let now = Utc::now();
        let mut status = JudgeStatus::new_pending("S1", now);
        status.status = JudgeVerdict::Accepted;
        status.progress.done_tests = 3;

        let mut attempt = status.clone();
        let regressive = JudgeStatus {
            status: JudgeVerdict::Running,
            progress: Progress {
                total_tests: 3,
                done_tests: 4,
            },
            ..status.clone()
        };
        assert!(!attempt.apply(regressive));
        assert_eq!(attempt.progress.done_tests, 3);
    }

    #[test]
    fn done_tests_must_not_decrease() {
        let now = Utc::now();
        let mut status = JudgeStatus::new_pending("S1", now);
        status.status = JudgeVerdict::Running;
        status.progress.done_tests = 2;

        let mut backwards = status.clone();
        let next = JudgeStatus {
            status: JudgeVerdict::Running,
            progress: Progress {
                total_tests: 3,
                done_tests: 1,
            },
            ..status.clone()
        };
        assert!(!backwards.apply(next));
    }
}

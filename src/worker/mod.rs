//! Worker Pool: turns one `JudgeMessage` into a terminal `JudgeStatus`,
//! publishing progress along the way. Compiles, then iterates test cases
//! through the data-pack cache, sandbox engine, and status store in a single
//! pipeline, classifying each case as it completes.

pub mod checker;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use sha2::{Digest, Sha256};

use crate::datapack::DataPackCache;
use crate::error::prelude::*;
use crate::model::{
    JudgeMessage, JudgeStatus, JudgeVerdict, PerTestResult, Progress, ProblemDataPack,
    ResourceLimit, RunSpec,
};
use crate::registry::Registry;
use crate::sandbox::SandboxEngine;
use crate::status::StatusStore;
use crate::storage::ObjectStorage;

use checker::{check_output, CheckerConfig};

/// Problem metadata — test-case manifest, answer checker config, version and
/// hash — is an external collaborator per the scope notes; this trait is the
/// boundary the worker pool depends on instead of a concrete store.
#[async_trait]
pub trait ProblemMetaSource: Send + Sync {
    async fn latest_data_pack(&self, problem_id: i64) -> Result<ProblemDataPack, JudgeError>;
    async fn checker_config(&self, problem_id: i64) -> Result<CheckerConfig, JudgeError>;
}

pub struct InMemoryProblemMetaSource {
    packs: dashmap::DashMap<i64, ProblemDataPack>,
    checkers: dashmap::DashMap<i64, CheckerConfig>,
}

impl InMemoryProblemMetaSource {
    pub fn new() -> Self {
        Self {
            packs: dashmap::DashMap::new(),
            checkers: dashmap::DashMap::new(),
        }
    }

    pub fn insert(&self, pack: ProblemDataPack, checker: CheckerConfig) {
        self.checkers.insert(pack.problem_id, checker);
        self.packs.insert(pack.problem_id, pack);
    }
}

impl Default for InMemoryProblemMetaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProblemMetaSource for InMemoryProblemMetaSource {
    async fn latest_data_pack(&self, problem_id: i64) -> Result<ProblemDataPack, JudgeError> {
        self.packs
            .get(&problem_id)
            .map(|p| p.clone())
            .ok_or_else(|| JudgeError::terminal_judgment(format!("no data pack for problem {problem_id}")))
    }

    async fn checker_config(&self, problem_id: i64) -> Result<CheckerConfig, JudgeError> {
        Ok(self
            .checkers
            .get(&problem_id)
            .map(|c| c.clone())
            .unwrap_or_default())
    }
}

pub struct WorkerPoolConfig {
    pub work_root: PathBuf,
    pub compile_limits: ResourceLimit,
}

pub struct WorkerPool {
    sandbox: Arc<SandboxEngine>,
    registry: Arc<Registry>,
    data_cache: Arc<DataPackCache>,
    storage: Arc<dyn ObjectStorage>,
    status_store: Arc<StatusStore>,
    problem_meta: Arc<dyn ProblemMetaSource>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        sandbox: Arc<SandboxEngine>,
        registry: Arc<Registry>,
        data_cache: Arc<DataPackCache>,
        storage: Arc<dyn ObjectStorage>,
        status_store: Arc<StatusStore>,
        problem_meta: Arc<dyn ProblemMetaSource>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            sandbox,
            registry,
            data_cache,
            storage,
            status_store,
            problem_meta,
            config,
        }
    }

    /// Processes one message to completion. Returns `Ok(())` once a terminal
    /// status has been persisted (including the "inherent to this submission"
    /// `SystemError` cases — those are not queue-retriable). Returns `Err`
    /// only for failures the queue layer should retry/dead-letter.
    pub async fn process(&self, message: JudgeMessage) -> Result<(), JudgeError> {
        let submission_id = message.submission_id.clone();
        let work_dir = self.config.work_root.join(&submission_id);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(|e| JudgeError::transient(format!("couldn't create work dir: {e}")))?;

        let result = self.process_inner(&message, &work_dir).await;

        tokio::fs::remove_dir_all(&work_dir).await.ok();

        match result {
            Ok(status) => {
                self.status_store
                    .persist_final_status(&status)
                    .await
                    .map_err(|e| JudgeError::transient(e.to_string()))?;
                Ok(())
            }
            Err(Outcome::Retriable(e)) => Err(e),
            Err(Outcome::Terminal(status)) => {
                self.status_store
                    .persist_final_status(&status)
                    .await
                    .map_err(|e| JudgeError::transient(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn process_inner(
        &self,
        message: &JudgeMessage,
        work_dir: &std::path::Path,
    ) -> Result<JudgeStatus, Outcome> {
        let submission_id = &message.submission_id;
        let received_at = Utc::now();
        let mut status = JudgeStatus::new_pending(submission_id.clone(), received_at);
        status.status = JudgeVerdict::Compiling;
        status.timestamps.started_at = Some(Utc::now());
        self.status_store.save(&status).await.ok();

        // Step 1 (language resolution) / step in spec: unknown language is
        // terminal SystemError, not retried.
        let language = self
            .registry
            .resolve_language(&message.language_id)
            .map_err(|_| {
                Outcome::Terminal(system_error(
                    submission_id,
                    received_at,
                    format!("unknown language \"{}\"", message.language_id),
                ))
            })?
            .clone();

        // Step 2: fetch source, verify hash.
        let source = self
            .storage
            .get_stream(&message.source_object_key)
            .await
            .map_err(|e| Outcome::Retriable(JudgeError::transient(e.to_string())))?;
        let mut hasher = Sha256::new();
        hasher.update(&source);
        let digest = format!("{:x}", hasher.finalize());
        if digest != message.source_hash {
            return Err(Outcome::Terminal(system_error(
                submission_id,
                received_at,
                "source hash mismatch".to_string(),
            )));
        }
        let source_path = work_dir.join(&language.source_filename);
        tokio::fs::write(&source_path, &source)
            .await
            .map_err(|e| Outcome::Retriable(JudgeError::transient(format!("couldn't write source: {e}"))))?;

        // Step 3: ensure data pack.
        let pack = self
            .problem_meta
            .latest_data_pack(message.problem_id)
            .await
            .map_err(|e| Outcome::Terminal(system_error(submission_id, received_at, e.message)))?;
        let checker_config = self
            .problem_meta
            .checker_config(message.problem_id)
            .await
            .unwrap_or_default();

        let handle = self
            .data_cache
            .acquire(pack.problem_id, pack.version, &pack.data_pack_hash)
            .await
            .map_err(|e| Outcome::Retriable(JudgeError::transient(format!("data pack cache: {e}"))))?;

        let process_result = self
            .run_submission(
                message,
                &language,
                &pack,
                &checker_config,
                work_dir,
                &source_path,
                &handle.local_dir,
            )
            .await;

        self.data_cache.release(handle).await;

        let mut final_status = process_result?;
        final_status.submission_id = submission_id.clone();
        final_status.timestamps.received_at = Some(received_at);
        final_status.timestamps.finished_at = Some(Utc::now());
        Ok(final_status)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_submission(
        &self,
        message: &JudgeMessage,
        language: &crate::registry::LanguageSpec,
        pack: &ProblemDataPack,
        checker_config: &CheckerConfig,
        work_dir: &std::path::Path,
        source_path: &std::path::Path,
        data_pack_dir: &std::path::Path,
    ) -> Result<JudgeStatus, Outcome> {
        let submission_id = &message.submission_id;
        let received_at = Utc::now();

        // Step 4: compile.
        let mut compile_log = String::new();
        if let Some(compile_cmd) = &language.compile_cmd {
            let mut cmd = compile_cmd.clone();
            cmd.push(source_path.display().to_string());
            if language.extra_compile_flags_allowed {
                cmd.extend(message.extra_compile_flags.iter().cloned());
            }

            let compile_profile = self
                .registry
                .resolve_profile("compile")
                .map_err(|e| Outcome::Terminal(system_error(submission_id, received_at, e.message)))?
                .clone();

            let spec = RunSpec {
                submission_id: submission_id.clone(),
                test_id: "compile".to_string(),
                work_dir: work_dir.display().to_string(),
                cmd,
                env: Default::default(),
                stdin_path: None,
                stdout_path: Some(work_dir.join("compile.out").display().to_string()),
                stderr_path: Some(work_dir.join("compile.err").display().to_string()),
                limits: self.config.compile_limits,
                profile_name: "compile".to_string(),
            };

            let result = self
                .sandbox
                .run(spec, compile_profile)
                .await
                .map_err(|e| Outcome::Retriable(JudgeError::transient(format!("sandbox: {e}"))))?;

            compile_log = format!(
                "{}{}",
                String::from_utf8_lossy(&result.stdout_capture),
                String::from_utf8_lossy(&result.stderr_capture)
            );

            if result.oom_killed || result.timed_out {
                let mut status = terminal_status(submission_id, JudgeVerdict::CompileError, 0, 0);
                status.compile_log = Some(format!(
                    "compilation exceeded resource limits\n{compile_log}"
                ));
                return Ok(status);
            }
            if result.exit_code != 0 {
                let mut status = terminal_status(submission_id, JudgeVerdict::CompileError, 0, 0);
                status.compile_log = Some(compile_log);
                return Ok(status);
            }
        }

        // Step 5: run per test case.
        let run_profile = self
            .registry
            .resolve_profile(&language.profile_name)
            .map_err(|e| Outcome::Terminal(system_error(submission_id, received_at, e.message)))?
            .clone();

        let mut running = progress_status(submission_id, pack.cases.len() as u32, 0);
        if !compile_log.is_empty() {
            running.compile_log = Some(compile_log.clone());
        }
        self.status_store.save(&running).await.ok();

        let mut per_test = Vec::with_capacity(pack.cases.len());
        let mut first_failure: Option<JudgeVerdict> = None;

        for (idx, case) in pack.cases.iter().enumerate() {
            let limits = case
                .limits_override
                .or(pack.default_limits)
                .or(language.default_limits)
                .unwrap_or_default();

            let stdout_path = work_dir.join(format!("test-{idx}.out"));
            let spec = RunSpec {
                submission_id: submission_id.clone(),
                test_id: idx.to_string(),
                work_dir: work_dir.display().to_string(),
                cmd: language.run_cmd.clone(),
                env: Default::default(),
                stdin_path: Some(data_pack_dir.join(&case.input_path).display().to_string()),
                stdout_path: Some(stdout_path.display().to_string()),
                stderr_path: Some(work_dir.join(format!("test-{idx}.err")).display().to_string()),
                limits,
                profile_name: language.profile_name.clone(),
            };

            let result = self
                .sandbox
                .run(spec, run_profile.clone())
                .await
                .map_err(|e| Outcome::Retriable(JudgeError::transient(format!("sandbox: {e}"))))?;

            let verdict = if result.oom_killed {
                JudgeVerdict::MemoryLimitExceeded
            } else if result.timed_out {
                JudgeVerdict::TimeLimitExceeded
            } else if result.exit_code != 0 {
                JudgeVerdict::RuntimeError
            } else if result.output_kb > limits.output_mb * 1024 {
                JudgeVerdict::OutputLimitExceeded
            } else {
                let answer = tokio::fs::read(data_pack_dir.join(&case.answer_path))
                    .await
                    .unwrap_or_default();
                match check_output(checker_config, &result.stdout_capture, &answer) {
                    Ok(true) => JudgeVerdict::Accepted,
                    Ok(false) => JudgeVerdict::WrongAnswer,
                    Err(e) => {
                        warn!("checker failed for submission {submission_id} test {idx}: {e}");
                        JudgeVerdict::SystemError
                    }
                }
            };

            per_test.push(PerTestResult {
                test_id: idx,
                status: verdict,
                time_ms: result.time_ms,
                memory_kb: result.memory_kb,
                output_kb: result.output_kb,
            });

            let progress = progress_status(submission_id, pack.cases.len() as u32, per_test.len() as u32);
            self.status_store.save(&progress).await.ok();

            if verdict != JudgeVerdict::Accepted && first_failure.is_none() {
                first_failure = Some(verdict);
                if !pack.run_all {
                    info!(
                        "submission {submission_id} stopped at test {idx} with {verdict:?} (run_all=false)"
                    );
                    break;
                }
            }
        }

        let final_verdict = first_failure.unwrap_or(JudgeVerdict::Accepted);
        let done_tests = per_test.len() as u32;
        let mut status = terminal_status(submission_id, final_verdict, pack.cases.len() as u32, done_tests);
        status.per_test = per_test;
        if !compile_log.is_empty() {
            status.compile_log = Some(compile_log);
        }
        Ok(status)
    }
}

enum Outcome {
    Retriable(JudgeError),
    Terminal(JudgeStatus),
}

fn terminal_status(submission_id: &str, verdict: JudgeVerdict, total: u32, done: u32) -> JudgeStatus {
    let mut status = JudgeStatus::new_pending(submission_id, Utc::now());
    status.status = verdict;
    status.progress = Progress {
        total_tests: total,
        done_tests: done,
    };
    status
}

/// A `Running` status update carrying the current progress count, published
/// as each test case completes so polling clients see it move.
fn progress_status(submission_id: &str, total: u32, done: u32) -> JudgeStatus {
    let mut status = JudgeStatus::new_pending(submission_id, Utc::now());
    status.status = JudgeVerdict::Running;
    status.progress = Progress {
        total_tests: total,
        done_tests: done,
    };
    status
}

fn system_error(submission_id: &str, received_at: chrono::DateTime<Utc>, message: String) -> JudgeStatus {
    let mut status = JudgeStatus::new_pending(submission_id, received_at);
    status.status = JudgeVerdict::SystemError;
    status.timestamps.finished_at = Some(Utc::now());
    status.compile_log = Some(message);
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapack::DataPackCacheConfig;
    use crate::kv::inmemory::InMemoryCache;
    use crate::model::{DataPackCase, IsolationProfile};
    use crate::queue::inmemory::InMemoryQueue;
    use crate::registry::{LanguageSpec, RegistryManifest};
    use crate::sandbox::SandboxEngine;
    use crate::storage::inmemory::InMemoryObjectStorage;
    use std::collections::HashMap;
    use std::time::Duration;

    fn registry() -> Arc<Registry> {
        let mut languages = HashMap::new();
        languages.insert(
            "py3".to_string(),
            LanguageSpec {
                compile_cmd: None,
                run_cmd: vec!["python3".into(), "main.py".into()],
                source_filename: "main.py".into(),
                extra_compile_flags_allowed: false,
                default_limits: None,
                profile_name: "run".into(),
            },
        );
        let mut profiles = HashMap::new();
        profiles.insert("compile".to_string(), IsolationProfile::default());
        profiles.insert("run".to_string(), IsolationProfile::default());
        Arc::new(Registry::new(RegistryManifest { languages, profiles }).unwrap())
    }

    #[tokio::test]
    async fn unknown_language_becomes_system_error_not_a_retry() {
        let sandbox_config = crate::config::SandboxConfig {
            cgroup_root: "/sys/fs/cgroup/judge".into(),
            seccomp_dir: "/etc/judge/seccomp".into(),
            helper_path: "/usr/bin/true".into(),
            enable_cgroup: false,
            enable_seccomp: false,
            enable_namespaces: false,
            stdout_stderr_max_bytes: 4096,
        };
        let sandbox = Arc::new(SandboxEngine::new(sandbox_config).await.unwrap());
        let storage: Arc<dyn ObjectStorage> = Arc::new(InMemoryObjectStorage::new());
        let cache_dir = std::env::temp_dir().join(format!("wp-test-{}", uuid::Uuid::new_v4()));
        let data_cache = Arc::new(DataPackCache::new(
            DataPackCacheConfig {
                root_dir: cache_dir,
                ttl: Duration::from_secs(60),
                lock_wait: Duration::from_secs(5),
                max_entries: 8,
                max_bytes: 1024 * 1024,
            },
            storage.clone(),
            Arc::new(InMemoryCache::new()),
        ));
        let pool = crate::status::tests_support::in_memory_pool().await;
        let status_store = Arc::new(StatusStore::new(
            pool.clone(),
            Arc::new(InMemoryCache::new()),
            Arc::new(InMemoryQueue::new()),
            crate::status::StatusStoreConfig {
                cache_ttl: Duration::from_secs(60),
                final_topic: "judge.status.final".into(),
            },
        ));

        let worker_pool = WorkerPool::new(
            sandbox,
            registry(),
            data_cache,
            storage,
            status_store.clone(),
            Arc::new(InMemoryProblemMetaSource::new()),
            WorkerPoolConfig {
                work_root: std::env::temp_dir(),
                compile_limits: ResourceLimit::default(),
            },
        );

        let message = JudgeMessage {
            submission_id: "S1".into(),
            problem_id: 1,
            language_id: "not-a-language".into(),
            source_object_key: "submissions/S1/source.code".into(),
            source_hash: "deadbeef".into(),
            contest_id: None,
            user_id: 1,
            priority: 0,
            extra_compile_flags: Vec::new(),
        };

        worker_pool.process(message).await.unwrap();
        let status = status_store.get("S1").await.unwrap().unwrap();
        assert_eq!(status.status, JudgeVerdict::SystemError);
    }

    #[test]
    fn data_pack_case_defaults_score_to_one() {
        let case: DataPackCase = serde_json::from_str(
            r#"{"input_path":"a","answer_path":"b"}"#,
        )
        .unwrap();
        assert_eq!(case.score, 1);
    }
}

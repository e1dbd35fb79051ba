//! Operator CLI for a local smoke submission: reads a source file, runs it
//! through the worker pool end to end against in-memory capability
//! backends and a throwaway sqlite status store, and prints the resulting
//! `JudgeStatus` as JSON. Doesn't touch Kafka/S3/Redis — for that, run the
//! `judge-exec` service itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sha2::{Digest, Sha256};

use judge_exec::datapack::{DataPackCache, DataPackCacheConfig};
use judge_exec::error::prelude::*;
use judge_exec::kv::inmemory::InMemoryCache;
use judge_exec::model::{DataPackCase, JudgeMessage, ProblemDataPack, ResourceLimit};
use judge_exec::queue::inmemory::InMemoryQueue;
use judge_exec::registry::{LanguageSpec, Registry, RegistryManifest};
use judge_exec::sandbox::SandboxEngine;
use judge_exec::status::{StatusStore, StatusStoreConfig};
use judge_exec::storage::{self, inmemory::InMemoryObjectStorage, ObjectStorage};
use judge_exec::worker::{InMemoryProblemMetaSource, WorkerPool, WorkerPoolConfig};

#[derive(Parser, Debug)]
#[command(name = "judge-exec-cli", version)]
struct Cli {
    /// Source file to judge.
    source: PathBuf,
    /// Language id as it appears in the registry manifest (default registers
    /// a bare-metal `py3` runner with no isolation profile beyond defaults).
    #[arg(long, default_value = "py3")]
    language: String,
    /// Directory holding `input`/`answer` files for a single test case; if
    /// omitted, the submission is judged against a single no-op test case.
    #[arg(long)]
    test_case_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let source = tokio::fs::read(&cli.source)
        .await
        .with_context(|| format!("couldn't read source file {}", cli.source.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&source);
    let source_hash = format!("{:x}", hasher.finalize());

    let registry = Arc::new(build_registry(&cli.language)?);
    let storage: Arc<dyn ObjectStorage> = Arc::new(InMemoryObjectStorage::new());
    let cache = Arc::new(InMemoryCache::new());
    let queue = Arc::new(InMemoryQueue::new());

    let submission_id = format!("smoke-{}", uuid::Uuid::new_v4());
    storage
        .put(&storage::source_key(&submission_id), source)
        .await?;

    let work_root = std::env::temp_dir().join("judge-exec-cli");
    tokio::fs::create_dir_all(&work_root).await.ok();

    let cache_root = work_root.join("datapack-cache");
    let data_cache = Arc::new(DataPackCache::new(
        DataPackCacheConfig {
            root_dir: cache_root,
            ttl: Duration::from_secs(3600),
            lock_wait: Duration::from_secs(5),
            max_entries: 16,
            max_bytes: 1024 * 1024 * 1024,
        },
        storage.clone(),
        cache.clone(),
    ));

    let (pack, data_pack_bytes) = build_data_pack(&cli.test_case_dir).await?;
    storage
        .put(&storage::data_pack_key(pack.problem_id, pack.version), data_pack_bytes)
        .await?;

    let problem_meta = Arc::new(InMemoryProblemMetaSource::new());
    problem_meta.insert(pack, Default::default());

    let status_pool = sqlx::SqlitePool::connect("sqlite::memory:")
        .await
        .context("couldn't open in-memory status database")?;
    let status_store = Arc::new(StatusStore::new(
        status_pool,
        cache,
        queue,
        StatusStoreConfig {
            cache_ttl: Duration::from_secs(60),
            final_topic: "judge.status.final".to_string(),
        },
    ));
    status_store.migrate().await?;

    let sandbox_config = judge_exec::config::SandboxConfig {
        cgroup_root: "/sys/fs/cgroup/judge-exec-cli".to_string(),
        seccomp_dir: "/etc/judge/seccomp".to_string(),
        helper_path: which_helper(),
        enable_cgroup: false,
        enable_seccomp: false,
        enable_namespaces: false,
        stdout_stderr_max_bytes: 64 * 1024,
    };
    let sandbox = Arc::new(SandboxEngine::new(sandbox_config).await?);

    let worker_pool = WorkerPool::new(
        sandbox,
        registry,
        data_cache,
        storage,
        status_store.clone(),
        problem_meta,
        WorkerPoolConfig {
            work_root,
            compile_limits: ResourceLimit::default(),
        },
    );

    let message = JudgeMessage {
        submission_id: submission_id.clone(),
        problem_id: 1,
        language_id: cli.language,
        source_object_key: storage::source_key(&submission_id),
        source_hash,
        contest_id: None,
        user_id: 0,
        priority: 0,
        extra_compile_flags: Vec::new(),
    };

    worker_pool.process(message).await?;

    let status = status_store
        .get(&submission_id)
        .await?
        .context("worker pool finished without persisting a status")?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}

fn which_helper() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("sandbox-init")))
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| "sandbox-init".to_string())
}

fn build_registry(language: &str) -> Result<Registry> {
    let mut languages = std::collections::HashMap::new();
    languages.insert(
        language.to_string(),
        LanguageSpec {
            compile_cmd: None,
            run_cmd: vec!["python3".to_string(), "main.py".to_string()],
            source_filename: "main.py".to_string(),
            extra_compile_flags_allowed: false,
            default_limits: None,
            profile_name: "run".to_string(),
        },
    );
    let mut profiles = std::collections::HashMap::new();
    profiles.insert("compile".to_string(), Default::default());
    profiles.insert("run".to_string(), Default::default());
    Registry::new(RegistryManifest { languages, profiles })
}

/// With no `--test-case-dir`, judges against a single test case whose input
/// and expected answer are both empty, just enough to exercise the pipeline.
async fn build_data_pack(test_case_dir: &Option<PathBuf>) -> Result<(ProblemDataPack, Vec<u8>)> {
    let staging = std::env::temp_dir().join(format!("judge-exec-cli-pack-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&staging).await?;

    match test_case_dir {
        Some(dir) => {
            tokio::fs::copy(dir.join("input"), staging.join("input")).await.ok();
            tokio::fs::copy(dir.join("answer"), staging.join("answer")).await.ok();
        }
        None => {
            tokio::fs::write(staging.join("input"), b"").await?;
            tokio::fs::write(staging.join("answer"), b"").await?;
        }
    }

    let archive = tar_directory(&staging).await?;
    let mut hasher = Sha256::new();
    hasher.update(&archive);
    let data_pack_hash = format!("{:x}", hasher.finalize());

    tokio::fs::remove_dir_all(&staging).await.ok();

    Ok((
        ProblemDataPack {
            problem_id: 1,
            version: 1,
            data_pack_hash,
            cases: vec![DataPackCase {
                input_path: "input".to_string(),
                answer_path: "answer".to_string(),
                score: 1,
                limits_override: None,
            }],
            run_all: false,
            default_limits: None,
        },
        archive,
    ))
}

/// Builds a `.tar.zst` archive matching what the data-pack cache expects to
/// unpack, so this smoke tool exercises the real extraction path.
async fn tar_directory(dir: &PathBuf) -> Result<Vec<u8>> {
    let dir = dir.clone();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", &dir)?;
        let tar_bytes = builder.into_inner()?;
        let archive = zstd::stream::encode_all(&tar_bytes[..], 0)
            .context("couldn't zstd-compress data pack archive")?;
        Ok(archive)
    })
    .await
    .context("tar build task panicked")?
}

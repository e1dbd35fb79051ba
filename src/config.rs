//! Configuration loading: a YAML-backed `Figment` with environment
//! overrides, loaded standalone since the HTTP framework itself is out of
//! scope here.

use std::path::Path;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::Deserialize;

use crate::error::prelude::*;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MinioConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_level_topics")]
    pub levels: Vec<String>,
    #[serde(default = "default_status_final_topic")]
    pub status_final: String,
    #[serde(default = "default_retry_topic")]
    pub retry: String,
    #[serde(default = "default_dlq_topic")]
    pub dlq: String,
}

fn default_level_topics() -> Vec<String> {
    vec![
        "judge.level0".into(),
        "judge.level1".into(),
        "judge.level2".into(),
        "judge.level3".into(),
    ]
}

fn default_status_final_topic() -> String {
    "judge.status.final".into()
}

fn default_retry_topic() -> String {
    "judge.retry".into()
}

fn default_dlq_topic() -> String {
    "judge.dlq".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitConfig {
    pub max_code_bytes: usize,
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

fn default_idempotency_ttl_secs() -> u64 {
    600
}

fn default_rate_limit_per_minute() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct JudgeConfig {
    pub work_root: String,
}

fn default_true() -> bool {
    true
}

fn default_stdout_stderr_max_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    pub cgroup_root: String,
    pub seccomp_dir: String,
    pub helper_path: String,
    #[serde(default = "default_true")]
    pub enable_cgroup: bool,
    #[serde(default = "default_true")]
    pub enable_seccomp: bool,
    #[serde(default = "default_true")]
    pub enable_namespaces: bool,
    #[serde(default = "default_stdout_stderr_max_bytes")]
    pub stdout_stderr_max_bytes: usize,
}

fn default_pool_size() -> usize {
    8
}

fn default_worker_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_worker_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_lock_wait_ms() -> u64 {
    5_000
}

fn default_max_entries() -> usize {
    256
}

fn default_max_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub root_dir: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

fn default_status_ttl_secs() -> u64 {
    300
}

fn default_status_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_status_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_status_final_topic")]
    pub final_topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub minio: Option<MinioConfig>,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub topics: TopicsConfigOrDefault,
    pub submit: SubmitConfig,
    pub judge: JudgeConfig,
    pub sandbox: SandboxConfig,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub status: StatusConfigOrDefault,
}

/// `figment`/serde don't let a struct field be `#[serde(default)]` and
/// nested-struct at once without a wrapper when every inner field also has a
/// default; these newtypes give `TopicsConfig`/`StatusConfig` a `Default`.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct TopicsConfigOrDefault(pub TopicsConfig);

impl Default for TopicsConfigOrDefault {
    fn default() -> Self {
        Self(TopicsConfig {
            levels: default_level_topics(),
            status_final: default_status_final_topic(),
            retry: default_retry_topic(),
            dlq: default_dlq_topic(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct StatusConfigOrDefault(pub StatusConfig);

impl Default for StatusConfigOrDefault {
    fn default() -> Self {
        Self(StatusConfig {
            ttl_secs: default_status_ttl_secs(),
            timeout_ms: default_status_timeout_ms(),
            final_topic: default_status_final_topic(),
        })
    }
}

impl Config {
    /// Loads `path` as YAML, then applies `JUDGE_`-prefixed environment
    /// variable overrides (`JUDGE_DATABASE.URL`, etc.), mirroring how this
    /// codebase layers `rocket::figment`'s `Env` provider over its own
    /// `Rocket.toml`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("JUDGE_").split("__"))
            .extract()
            .context("Couldn't load configuration")
    }
}

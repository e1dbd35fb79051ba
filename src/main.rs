use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use figment::providers::{Format, Yaml};
use figment::Figment;
use log::info;
use tokio_util::sync::CancellationToken;

use judge_exec::config::Config;
use judge_exec::datapack::{DataPackCache, DataPackCacheConfig};
use judge_exec::error::prelude::*;
use judge_exec::kv::inmemory::InMemoryCache;
use judge_exec::kv::Cache;
use judge_exec::queue::consumer::{ConsumerOptions, QueueConsumer, WeightedTopic};
use judge_exec::queue::inmemory::InMemoryQueue;
use judge_exec::queue::{MessageQueue, TokenLimiter};
use judge_exec::registry::{Registry, RegistryManifest};
use judge_exec::sandbox::SandboxEngine;
use judge_exec::status::{StatusStore, StatusStoreConfig};
use judge_exec::storage::inmemory::InMemoryObjectStorage;
use judge_exec::storage::ObjectStorage;
use judge_exec::submit::FinalStatusConsumer;
use judge_exec::worker::{InMemoryProblemMetaSource, WorkerPool, WorkerPoolConfig};

/// Judge-execution plane: sandboxed worker pool, weighted queue consumer, and
/// status store, wired up from a single YAML config file.
#[derive(Parser, Debug)]
#[command(name = "judge-exec", version)]
struct Cli {
    #[arg(long, env = "JUDGE_CONFIG", default_value = "judge-exec.yaml")]
    config: String,
    #[arg(long, env = "JUDGE_REGISTRY", default_value = "registry.yaml")]
    registry: String,
}

fn build_cache(config: &Config) -> Arc<dyn Cache> {
    #[cfg(feature = "redis-backend")]
    if let Some(redis) = &config.redis {
        match judge_exec::kv::redis_backend::RedisCache::connect(&redis.url) {
            Ok(cache) => return Arc::new(cache),
            Err(e) => log::error!("couldn't connect to redis, falling back to in-memory cache: {e:?}"),
        }
    }
    let _ = config;
    Arc::new(InMemoryCache::new())
}

async fn build_storage(config: &Config) -> Arc<dyn ObjectStorage> {
    #[cfg(feature = "s3")]
    if let Some(minio) = &config.minio {
        match judge_exec::storage::s3::S3ObjectStorage::connect(minio).await {
            Ok(storage) => return Arc::new(storage),
            Err(e) => log::error!("couldn't connect to object storage, falling back to in-memory: {e:?}"),
        }
    }
    let _ = config;
    Arc::new(InMemoryObjectStorage::new())
}

fn build_queue(config: &Config) -> Arc<dyn MessageQueue> {
    #[cfg(feature = "kafka")]
    if let Some(kafka) = &config.kafka {
        match judge_exec::queue::kafka::KafkaQueue::connect(&kafka.brokers, "judge-exec") {
            Ok(queue) => return Arc::new(queue),
            Err(e) => log::error!("couldn't connect to kafka, falling back to in-memory queue: {e:?}"),
        }
    }
    let _ = config;
    Arc::new(InMemoryQueue::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    let manifest: RegistryManifest = Figment::new()
        .merge(Yaml::file(&cli.registry))
        .extract()
        .with_context(|| format!("couldn't load registry manifest {}", cli.registry))?;
    let registry = Arc::new(Registry::new(manifest)?);

    let cache = build_cache(&config);
    let storage = build_storage(&config).await;
    let queue = build_queue(&config);

    let sandbox = Arc::new(SandboxEngine::new(config.sandbox.clone()).await?);

    let data_cache = Arc::new(DataPackCache::new(
        DataPackCacheConfig {
            root_dir: config.cache.root_dir.clone().into(),
            ttl: Duration::from_secs(config.cache.ttl_secs),
            lock_wait: Duration::from_millis(config.cache.lock_wait_ms),
            max_entries: config.cache.max_entries,
            max_bytes: config.cache.max_bytes,
        },
        storage.clone(),
        cache.clone(),
    ));

    let status_pool = sqlx::SqlitePool::connect(&config.database.url)
        .await
        .context("couldn't connect to the status database")?;
    let status_store = Arc::new(StatusStore::new(
        status_pool,
        cache.clone(),
        queue.clone(),
        StatusStoreConfig {
            cache_ttl: Duration::from_secs(config.status.0.ttl_secs),
            final_topic: config.status.0.final_topic.clone(),
        },
    ));
    status_store.migrate().await?;

    // Problem metadata storage is an external collaborator outside this
    // crate's scope; wiring a real implementation in means adding a
    // `ProblemMetaSource` impl backed by whatever service owns it.
    let problem_meta = Arc::new(InMemoryProblemMetaSource::new());

    let worker_pool = Arc::new(WorkerPool::new(
        sandbox,
        registry,
        data_cache,
        storage,
        status_store.clone(),
        problem_meta,
        WorkerPoolConfig {
            work_root: config.judge.work_root.clone().into(),
            compile_limits: judge_exec::model::ResourceLimit::default(),
        },
    ));

    let shutdown = CancellationToken::new();
    let limiter = Arc::new(TokenLimiter::new(config.worker.pool_size));
    let consumer = QueueConsumer::new(queue.clone(), shutdown.clone());

    let weighted = config
        .topics
        .0
        .levels
        .iter()
        .enumerate()
        .map(|(tier, topic)| WeightedTopic {
            topic: topic.clone(),
            weight: 8u32 >> tier.min(3),
        })
        .collect::<Vec<_>>();

    let handler_pool = worker_pool.clone();
    let handler: judge_exec::queue::consumer::Handler =
        Arc::new(move |message| -> judge_exec::queue::consumer::HandlerFuture {
            let worker_pool = handler_pool.clone();
            Box::pin(async move {
                let judge_message = serde_json::from_slice(&message.body)
                    .map_err(|e| JudgeError::validation(format!("malformed judge message: {e}")))?;
                worker_pool.process(judge_message).await
            })
        });

    let worker_options = ConsumerOptions {
        max_retries: 3,
        retry_delay: Duration::from_millis(500),
        dead_letter_topic: Some(config.topics.0.dlq.clone()),
    };

    info!("judge-exec starting: {} worker slots, {} weighted topics", config.worker.pool_size, weighted.len());

    let consumer_task = tokio::spawn(async move {
        consumer.run_weighted(weighted, limiter, handler, worker_options).await;
    });

    let final_consumer = FinalStatusConsumer::new(queue.clone(), status_store.clone(), config.status.0.final_topic.clone());
    let final_shutdown = shutdown.clone();
    let final_task = tokio::spawn(async move {
        loop {
            if final_shutdown.is_cancelled() {
                break;
            }
            match final_consumer.poll_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(Duration::from_millis(100)).await,
                Err(e) => {
                    log::warn!("final status consumer error: {e:?}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested, draining in-flight work");
    shutdown.cancel();
    let _ = tokio::join!(consumer_task, final_task);

    Ok(())
}

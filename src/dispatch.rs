//! Delegation of shard processing to a remote worker
//!
//! Instead of processing shards in-process, the dispatcher can send one
//! processing request per shard to a worker service. Requests are sent in the
//! background, a few at a time, with randomized pauses in between so that
//! neither the worker nor the dataset origin gets overwhelmed.

use crate::{
    config::{DispatchConfig, RetryPolicy},
    fetch::{self, retry_with_backoff},
    shards::{NgramOrder, ShardId},
    Result,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{
    sync::Semaphore,
    task::{JoinHandle, JoinSet},
};

/// Something that can process shards on our behalf
pub trait ShardWorker {
    /// Have a shard processed, returning once the worker has acknowledged it
    fn process(&self, shard: &ShardId) -> impl Future<Output = Result<()>> + Send;
}

/// Body of a shard processing request
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ShardRequest {
    /// Ngram order of the shard
    pub order: NgramOrder,

    /// Key of the shard within its ngram order
    pub shard_key: Box<str>,

    /// Where the worker should download the shard from
    pub url: Box<str>,
}
//
impl From<&ShardId> for ShardRequest {
    fn from(shard: &ShardId) -> Self {
        Self {
            order: shard.order,
            shard_key: shard.key.clone(),
            url: shard.url.clone(),
        }
    }
}

/// [`ShardWorker`] that is reached over HTTP
#[derive(Clone, Debug)]
pub struct HttpWorker {
    /// Shared HTTP client
    client: reqwest::Client,

    /// Where requests are POSTed
    endpoint: Box<str>,

    /// How hard we should try to reach the worker
    policy: RetryPolicy,
}
//
impl HttpWorker {
    /// Set up a worker client
    pub fn new(client: reqwest::Client, endpoint: &str, policy: RetryPolicy) -> Result<Self> {
        fetch::check_url(endpoint).context("checking the worker endpoint")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            policy,
        })
    }
}
//
impl ShardWorker for HttpWorker {
    async fn process(&self, shard: &ShardId) -> Result<()> {
        let request = ShardRequest::from(shard);
        retry_with_backoff(&self.policy, &format!("dispatch of {shard}"), || {
            let response = self.client.post(&*self.endpoint).json(&request).send();
            async move { response.await.and_then(Response::error_for_status) }
        })
        .await?;
        Ok(())
    }
}

/// Counters that are updated as the dispatch progresses
#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

/// Snapshot of a dispatch's progress
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DispatchProgress {
    /// Number of shards to be dispatched
    pub total: usize,

    /// Number of requests that were sent so far
    pub dispatched: usize,

    /// Number of requests that were acknowledged by the worker
    pub succeeded: usize,

    /// Number of requests that failed
    pub failed: usize,
}

/// Final report of a dispatch
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DispatchReport {
    /// When the first request was sent
    pub started_at: DateTime<Utc>,

    /// When the last request completed
    pub finished_at: DateTime<Utc>,

    /// Number of requests that were acknowledged by the worker
    pub succeeded: usize,

    /// Shards whose request failed, they stay unprocessed
    pub failed_shards: Vec<Box<str>>,
}

/// Handle to a dispatch that runs in the background
#[derive(Debug)]
pub struct DispatchHandle {
    /// Number of shards to be dispatched
    total: usize,

    /// Live counters
    counters: Arc<Counters>,

    /// Background task
    task: JoinHandle<DispatchReport>,
}
//
impl DispatchHandle {
    /// Check how far the dispatch went
    pub fn progress(&self) -> DispatchProgress {
        DispatchProgress {
            total: self.total,
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Truth that every request has completed
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the dispatch to complete
    pub async fn join(self) -> Result<DispatchReport> {
        self.task.await.context("waiting for the dispatch to complete")
    }
}

/// Start sending processing requests for some shards to a worker
///
/// This returns as soon as the dispatch is started. Use the returned handle
/// to follow its progress and collect the final report.
pub fn dispatch<W>(shards: Vec<ShardId>, worker: Arc<W>, config: &DispatchConfig) -> DispatchHandle
where
    W: ShardWorker + Send + Sync + 'static,
{
    let total = shards.len();
    let counters = Arc::new(Counters::default());
    let task = tokio::spawn(run_dispatch(shards, worker, config.clone(), counters.clone()));
    DispatchHandle {
        total,
        counters,
        task,
    }
}

/// Background part of [`dispatch()`]
async fn run_dispatch<W>(
    shards: Vec<ShardId>,
    worker: Arc<W>,
    config: DispatchConfig,
    counters: Arc<Counters>,
) -> DispatchReport
where
    W: ShardWorker + Send + Sync + 'static,
{
    let started_at = Utc::now();
    let in_flight = Arc::new(Semaphore::new(config.concurrency.get()));
    let mut requests = JoinSet::new();
    for (idx, shard) in shards.into_iter().enumerate() {
        if idx > 0 {
            tokio::time::sleep(config.base_delay + fetch::jitter(config.jitter)).await;
        }
        let permit = in_flight
            .clone()
            .acquire_owned()
            .await
            .expect("the in-flight semaphore is never closed");
        counters.dispatched.fetch_add(1, Ordering::Relaxed);
        log::info!("Dispatching {shard}");
        let worker = worker.clone();
        let counters = counters.clone();
        requests.spawn(async move {
            let result = worker.process(&shard).await;
            drop(permit);
            match result {
                Ok(()) => {
                    log::info!("Worker acknowledged {shard}");
                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(e) => {
                    log::warn!("Worker failed to process {shard} from {}: {e:#}", shard.url);
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    Err(shard.key)
                }
            }
        });
    }

    // Collect the outcome of every request
    let mut succeeded = 0;
    let mut failed_shards = Vec::new();
    while let Some(outcome) = requests.join_next().await {
        match outcome {
            Ok(Ok(())) => succeeded += 1,
            Ok(Err(shard_key)) => failed_shards.push(shard_key),
            Err(e) => log::error!("A dispatch request crashed: {e}"),
        }
    }
    failed_shards.sort_unstable();
    DispatchReport {
        started_at,
        finished_at: Utc::now(),
        succeeded,
        failed_shards,
    }
}

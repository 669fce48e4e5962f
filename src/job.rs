//! Resumable orchestration of the whole harvesting job
//!
//! A job invocation walks through every shard of every configured ngram order
//! in a fixed order, skipping shards that previous invocations completed. When
//! the wall-clock budget runs out, it stops at the next shard boundary and
//! reports how far it went. The next invocation picks up from there, thanks to
//! the checkpoints. Once every shard has been attempted, the output tables are
//! computed from the results of all completed shards.

use crate::{
    aggregate::{Aggregator, Folded},
    checkpoint::CheckpointStore,
    config::Config,
    fetch::ShardSource,
    progress::{ProgressReport, Work},
    shards::{NgramOrder, ShardId},
    storage::ResultStore,
    top, tsv, Result,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Name of the record that describes the last job invocation
pub const LAST_RUN_RECORD: &str = "last_run";

/// Per-order statistics of a job invocation
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OrderSummary {
    /// Ngram order
    pub order: NgramOrder,

    /// Shards that were processed and checkpointed by this invocation
    pub processed: usize,

    /// Shards that were already done
    pub skipped: usize,

    /// Shards that could not be processed and will be retried next time
    pub failed: usize,

    /// Length of the published output table, if it was computed
    pub published: Option<usize>,
}
//
impl OrderSummary {
    /// Empty statistics
    fn new(order: NgramOrder) -> Self {
        Self {
            order,
            processed: 0,
            skipped: 0,
            failed: 0,
            published: None,
        }
    }
}

/// How a job invocation ended
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// The time budget ran out, processing will resume at this shard
    Paused {
        /// Ngram order of the next shard
        order: NgramOrder,

        /// Key of the next shard
        shard_key: Box<str>,
    },

    /// Every shard was attempted and the output tables were published
    Completed,
}

/// Outcome of a job invocation
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobSummary {
    /// How the invocation ended
    pub status: JobStatus,

    /// Statistics for each ngram order that was reached
    pub orders: Vec<OrderSummary>,

    /// Truth that another invocation has something left to do
    pub more_work_remains: bool,
}
//
impl JobSummary {
    /// Total number of shards processed by this invocation
    pub fn processed(&self) -> usize {
        self.orders.iter().map(|o| o.processed).sum()
    }

    /// Total number of shards that were skipped by this invocation
    pub fn skipped(&self) -> usize {
        self.orders.iter().map(|o| o.skipped).sum()
    }

    /// Total number of shards that failed during this invocation
    pub fn failed(&self) -> usize {
        self.orders.iter().map(|o| o.failed).sum()
    }
}

/// Persistent record of the last job invocation
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobRecord {
    /// When the invocation ended
    pub ran_at: DateTime<Utc>,

    /// What it did
    pub summary: JobSummary,
}

/// Outcome of processing a single shard
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardOutcome {
    /// The shard was processed and checkpointed
    Processed,

    /// The shard was already done
    Skipped,
}

/// Harvesting job, bound to its collaborators
#[derive(Debug)]
pub struct Job<'a, Src, Ck, St> {
    /// Process configuration
    config: &'a Config,

    /// Where shard data comes from
    source: &'a Src,

    /// Which shards are done
    checkpoints: &'a Ck,

    /// Where results go
    store: &'a St,

    /// Progress display
    report: &'a ProgressReport,
}
//
impl<'a, Src, Ck, St> Job<'a, Src, Ck, St>
where
    Src: ShardSource,
    Ck: CheckpointStore,
    St: ResultStore,
{
    /// Set up a job
    pub fn new(
        config: &'a Config,
        source: &'a Src,
        checkpoints: &'a Ck,
        store: &'a St,
        report: &'a ProgressReport,
    ) -> Self {
        Self {
            config,
            source,
            checkpoints,
            store,
            report,
        }
    }

    /// Start or resume the job
    ///
    /// Failing shards are logged and left for the next invocation. Errors are
    /// only returned when progress cannot be tracked or results cannot be
    /// published.
    pub async fn run(&self) -> Result<JobSummary> {
        let start = Instant::now();
        let mut orders = Vec::with_capacity(self.config.orders.len());
        for &order in self.config.orders.iter() {
            log::info!("Processing {order} shards");
            let mut summary = OrderSummary::new(order);
            let progress = self.report.add(
                format!("Processing {order} shards"),
                Work::Steps(order.num_shards()),
            );
            for shard in order.shards(&self.config.corpus) {
                if self.is_done(&shard)? {
                    log::debug!("Skipping {shard}, already processed");
                    summary.skipped += 1;
                    progress.make_progress(1);
                    continue;
                }

                // Only stop between shards, never in the middle of one
                if start.elapsed() >= self.config.deadline {
                    log::info!(
                        "Time budget of {:?} exhausted, pausing before {shard}",
                        self.config.deadline
                    );
                    progress.finish();
                    orders.push(summary);
                    let status = JobStatus::Paused {
                        order,
                        shard_key: shard.key,
                    };
                    return Ok(self.conclude(status, orders));
                }

                match self.process_shard(&shard).await {
                    Ok(folded) => {
                        self.record_completion(folded)?;
                        summary.processed += 1;
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to process {shard} from {}, will retry on next run: {e:#}",
                            shard.url
                        );
                        summary.failed += 1;
                    }
                }
                progress.make_progress(1);
                if !self.config.shard_delay.is_zero() {
                    tokio::time::sleep(self.config.shard_delay).await;
                }
            }
            progress.finish();
            log::info!(
                "Done with {order} shards: processed {}, skipped {}, failed {}",
                summary.processed,
                summary.skipped,
                summary.failed
            );
            orders.push(summary);
        }

        // Every shard was attempted, compute the output tables
        let mut tables = Vec::with_capacity(orders.len());
        for summary in &mut orders {
            let table = top::publish_order(
                &self.config.corpus,
                summary.order,
                &self.config.rank,
                self.checkpoints,
                self.store,
                self.report,
            )?;
            summary.published = Some(table.len());
            tables.push((summary.order, table));
        }
        top::publish_consolidated(self.store, &tables).context("publishing consolidated tables")?;
        Ok(self.conclude(JobStatus::Completed, orders))
    }

    /// Process a single shard, unless it is already done
    pub async fn run_shard(&self, shard: &ShardId) -> Result<ShardOutcome> {
        if self.is_done(shard)? {
            log::info!("Skipping {shard}, already processed");
            return Ok(ShardOutcome::Skipped);
        }
        let folded = self.process_shard(shard).await?;
        self.record_completion(folded)?;
        Ok(ShardOutcome::Processed)
    }

    /// Check the checkpoint of a shard
    fn is_done(&self, shard: &ShardId) -> Result<bool> {
        self.checkpoints
            .is_done(shard.order, &shard.key)
            .with_context(|| format!("checking if {shard} was already processed"))
    }

    /// Download, decode, filter and aggregate a shard, then commit its results
    async fn process_shard(&self, shard: &ShardId) -> Result<Folded> {
        log::info!("Processing {shard} from {}", shard.url);
        let gz_bytes = self.source.open(shard).await?;
        let mut aggregator = Aggregator::new(shard.clone(), self.store, self.config.flush)?;
        let stats = tsv::extract(gz_bytes, self.config.max_line_length.get(), &mut aggregator)
            .await?;
        let folded = aggregator.finish()?;
        log::info!(
            "Completed {shard}: {} lines, {} accepted, {} partial results",
            stats.lines,
            stats.accepted,
            folded.num_parts()
        );
        Ok(folded)
    }

    /// Checkpoint a shard whose results were committed
    fn record_completion(&self, folded: Folded) -> Result<()> {
        let shard = folded.shard();
        self.checkpoints
            .mark_done(shard.order, &shard.key, &shard.url)
            .with_context(|| format!("checkpointing {shard}"))
    }

    /// Summarize the job invocation and record it
    fn conclude(&self, status: JobStatus, orders: Vec<OrderSummary>) -> JobSummary {
        let more_work_remains = matches!(status, JobStatus::Paused { .. })
            || orders.iter().any(|summary| summary.failed > 0);
        let summary = JobSummary {
            status,
            orders,
            more_work_remains,
        };
        let record = JobRecord {
            ran_at: Utc::now(),
            summary: summary.clone(),
        };
        if let Err(e) = self.store.write_output(LAST_RUN_RECORD, &record) {
            log::warn!("Failed to record the outcome of this run: {e:#}");
        }
        summary
    }
}

/// How far the harvesting of an ngram order went
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OrderProgress {
    /// Ngram order
    pub order: NgramOrder,

    /// Shards that are checkpointed as done
    pub done: usize,

    /// Shards in this order
    pub total: usize,
}

/// Overall progress of the harvesting job
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatusReport {
    /// Per-order progress, for every configured order
    pub orders: Vec<OrderProgress>,

    /// Outcome of the last job invocation, if any
    pub last_run: Option<JobRecord>,
}

/// Report how far the job went, without fetching anything
pub fn status(
    config: &Config,
    checkpoints: &impl CheckpointStore,
    store: &impl ResultStore,
) -> Result<StatusReport> {
    let orders = config
        .orders
        .iter()
        .map(|&order| {
            let pending = pending_shards(config, order, checkpoints)?.len();
            let total = order.num_shards();
            Ok(OrderProgress {
                order,
                done: total - pending,
                total,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let last_run = store
        .read_output(LAST_RUN_RECORD)
        .context("loading the record of the last run")?;
    Ok(StatusReport { orders, last_run })
}

/// Shards of an ngram order that are not done yet, in processing order
pub fn pending_shards(
    config: &Config,
    order: NgramOrder,
    checkpoints: &impl CheckpointStore,
) -> Result<Vec<ShardId>> {
    let mut pending = Vec::new();
    for shard in order.shards(&config.corpus) {
        let done = checkpoints
            .is_done(order, &shard.key)
            .with_context(|| format!("checking if {shard} was already processed"))?;
        if !done {
            pending.push(shard);
        }
    }
    Ok(pending)
}

//! Processing pipeline configuration

use crate::{
    shards::{Corpus, NgramOrder},
    Options, Result,
};
use anyhow::Context;
use directories::ProjectDirs;
use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::Path,
    sync::Arc,
    time::Duration,
};

/// Final process configuration
///
/// This is the result of digesting [`Options`]. Please refer to [`Options`] to know
/// more about individual fields.
#[allow(missing_docs)]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Which dataset is being harvested
    pub corpus: Corpus,

    /// Ngram orders to be processed, in processing order
    pub orders: Box<[NgramOrder]>,

    /// Directory where checkpoints, partial results and outputs are kept
    pub state_dir: Box<Path>,

    /// Wall-clock budget of one job invocation
    pub deadline: Duration,

    /// Pause between two processed shards
    pub shard_delay: Duration,

    /// Retry policy for shard downloads
    pub retry: RetryPolicy,

    /// Bound on connection establishment, and on the wait for each chunk of
    /// a download
    pub http_timeout: Duration,

    /// Memory bounds of the per-shard aggregator
    pub flush: FlushLimits,

    /// Longest input line whose record is considered, longer ones are skipped
    pub max_line_length: NonZeroUsize,

    /// Output table configuration
    pub rank: RankConfig,

    /// Remote worker fan-out configuration
    pub dispatch: DispatchConfig,
}
//
impl Config {
    /// Determine process configuration from CLI arguments
    pub(crate) fn new(options: Options) -> Result<Arc<Self>> {
        let Options {
            orders,
            language,
            dataset_version,
            base_url,
            state_dir,
            deadline_mins,
            shard_delay_ms,
            max_attempts,
            retry_base_ms,
            retry_max_ms,
            http_timeout_secs,
            flush_lines,
            flush_entries,
            max_line_length,
            min_frequency,
            top_unigrams,
            top_ngrams,
        } = options;
        let state_dir = match state_dir {
            Some(dir) => dir.into(),
            None => default_state_dir()?,
        };
        let orders = if orders.is_empty() {
            NgramOrder::all().collect()
        } else {
            orders.into()
        };
        Ok(Arc::new(Self {
            corpus: Corpus {
                base_url,
                language,
                version: dataset_version,
            },
            orders,
            state_dir,
            deadline: Duration::from_secs(60 * deadline_mins.get()),
            shard_delay: Duration::from_millis(shard_delay_ms),
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(retry_base_ms.get()),
                max_delay: Duration::from_millis(retry_max_ms.get()),
            },
            http_timeout: Duration::from_secs(http_timeout_secs.get()),
            flush: FlushLimits {
                max_lines: flush_lines,
                max_entries: flush_entries,
            },
            max_line_length,
            rank: RankConfig {
                min_frequency,
                top_unigrams,
                top_ngrams,
            },
            dispatch: DispatchConfig::default(),
        }))
    }

    /// Rebuild with a different dispatcher configuration
    pub fn with_dispatch_config(&self, dispatch: DispatchConfig) -> Arc<Self> {
        Arc::new(Self {
            dispatch,
            ..self.clone()
        })
    }
}

/// Retry policy for transient network failures
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RetryPolicy {
    /// Maximal number of attempts, including the first one
    pub max_attempts: NonZeroUsize,

    /// Delay before the first retry, doubled on each subsequent retry
    ///
    /// This is also the upper bound of the random jitter added to each delay.
    pub base_delay: Duration,

    /// Upper bound on the exponential part of the retry delay
    pub max_delay: Duration,
}
//
impl RetryPolicy {
    /// Delay before retrying after a certain number of failed attempts,
    /// excluding jitter
    pub fn backoff(&self, failed_attempts: usize) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16) as u32;
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
            .max(self.base_delay)
    }
}

/// Memory bounds of the per-shard aggregator
///
/// Once either bound is reached, the aggregated table is written down as a
/// partial result file and cleared.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FlushLimits {
    /// Number of input lines after which the table is flushed
    pub max_lines: NonZeroU64,

    /// Number of distinct ngrams after which the table is flushed
    pub max_entries: NonZeroUsize,
}

/// Output table configuration
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RankConfig {
    /// Ngrams with a lower total match count are not eligible for output
    pub min_frequency: u64,

    /// Number of output unigrams
    pub top_unigrams: NonZeroUsize,

    /// Number of output ngrams for orders 2 and above
    pub top_ngrams: NonZeroUsize,
}
//
impl RankConfig {
    /// Output table size for a given ngram order
    pub fn top_k(&self, order: NgramOrder) -> usize {
        if order.get() == 1 {
            self.top_unigrams.get()
        } else {
            self.top_ngrams.get()
        }
    }
}

/// Remote worker fan-out configuration
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct DispatchConfig {
    /// Endpoint that shard processing requests are sent to
    pub worker_url: Option<Box<str>>,

    /// Maximal number of simultaneous in-flight requests
    pub concurrency: NonZeroUsize,

    /// Fixed part of the delay between two dispatched requests
    pub base_delay: Duration,

    /// Upper bound of the random part of the delay between requests
    pub jitter: Duration,
}
//
impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_url: None,
            concurrency: NonZeroUsize::new(2).expect("2 is not 0"),
            base_delay: Duration::from_millis(500),
            jitter: Duration::from_millis(1000),
        }
    }
}

/// Platform-specific location of the harvester's state
fn default_state_dir() -> Result<Box<Path>> {
    let dirs = ProjectDirs::from("", "", env!("CARGO_PKG_NAME"))
        .context("determining the state directory's location")?;
    Ok(dirs.data_dir().into())
}

/// Configuration used by unit tests
#[cfg(test)]
pub fn test_config(state_dir: &Path) -> Config {
    Config {
        corpus: Corpus {
            base_url: "http://localhost/ngrams".into(),
            language: "eng".into(),
            version: "20120701".into(),
        },
        orders: NgramOrder::all().collect(),
        state_dir: state_dir.into(),
        deadline: Duration::from_secs(55 * 60),
        shard_delay: Duration::ZERO,
        retry: RetryPolicy {
            max_attempts: NonZeroUsize::new(5).unwrap(),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        },
        http_timeout: Duration::from_secs(30),
        flush: FlushLimits {
            max_lines: NonZeroU64::new(1_000).unwrap(),
            max_entries: NonZeroUsize::new(1_000).unwrap(),
        },
        max_line_length: NonZeroUsize::new(1024).unwrap(),
        rank: RankConfig {
            min_frequency: 0,
            top_unigrams: NonZeroUsize::new(30_000).unwrap(),
            top_ngrams: NonZeroUsize::new(10_000).unwrap(),
        },
        dispatch: DispatchConfig::default(),
    }
}

//! This program harvests ngram frequencies from the Google Books Ngram
//! dataset, whose general documentation you can find at
//! <http://storage.googleapis.com/books/ngrams/books/datasetsv3.html>.
//!
//! The dataset is much too large to be processed in one go, so harvesting is
//! split into resumable job invocations with a bounded duration. Each
//! invocation picks up where the previous one stopped, and once every data
//! file has been processed, tables of the most frequent ngrams are published.

mod aggregate;
mod checkpoint;
mod config;
mod dispatch;
mod fetch;
mod job;
mod progress;
mod shards;
mod storage;
mod top;
mod tsv;

use crate::{
    checkpoint::FsCheckpointStore,
    config::{Config, DispatchConfig},
    dispatch::HttpWorker,
    fetch::HttpSource,
    job::Job,
    progress::{ProgressReport, Work},
    shards::NgramOrder,
    storage::{FsResultStore, ResultStore},
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use serde::Serialize;
use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Harvest ngram frequencies from the Google Books Ngram dataset
///
/// Every command prints its outcome as JSON on stdout.
#[derive(Parser, Debug)]
#[command(version, author)]
struct Args {
    /// What should be done
    #[command(subcommand)]
    command: Command,

    /// Settings shared by every command
    #[command(flatten)]
    options: Options,
}

/// Settings shared by every command
#[derive(clap::Args, Debug)]
struct Options {
    /// Ngram orders to be processed, e.g. "1,2" or "3gram"
    ///
    /// By default, every order from 1 to 5 is processed, in increasing order.
    #[arg(short, long, value_delimiter = ',', global = true)]
    orders: Vec<NgramOrder>,

    /// Short name of the Google Books Ngram language to be used, e.g.
    /// "eng-fiction"
    #[arg(short, long, default_value = "eng", global = true)]
    language: Box<str>,

    /// Version of the dataset, as it appears in data file names
    #[arg(long, default_value = "20120701", global = true)]
    dataset_version: Box<str>,

    /// Base URL under which the data files are published
    #[arg(
        long,
        default_value = "http://storage.googleapis.com/books/ngrams/books",
        global = true
    )]
    base_url: Box<str>,

    /// Directory where checkpoints, partial results and output tables go
    ///
    /// Defaults to the platform's data directory.
    #[arg(short, long, global = true)]
    state_dir: Option<PathBuf>,

    /// Wall-clock budget of a job invocation, in minutes
    ///
    /// Once it is exhausted, the job stops before the next shard, and a later
    /// invocation will resume from there. A shard that is being processed is
    /// always completed, so leave some headroom below any hard time limit of
    /// your execution environment.
    #[arg(short, long, default_value = "55", global = true)]
    deadline_mins: NonZeroU64,

    /// Pause between two processed shards, in milliseconds
    ///
    /// This reduces pressure on the dataset's origin server.
    #[arg(long, default_value = "1000", global = true)]
    shard_delay_ms: u64,

    /// Maximal number of attempts at a network request
    #[arg(long, default_value = "5", global = true)]
    max_attempts: NonZeroUsize,

    /// Delay before retrying a failed network request, in milliseconds
    ///
    /// This delay is doubled after every failed attempt, and a random jitter
    /// of up to the same duration is added to it.
    #[arg(long, default_value = "1000", global = true)]
    retry_base_ms: NonZeroU64,

    /// Upper bound on the exponential retry delay, in milliseconds
    #[arg(long, default_value = "60000", global = true)]
    retry_max_ms: NonZeroU64,

    /// Network timeout, in seconds
    ///
    /// This bounds both connection establishment and the wait for each new
    /// chunk of a download. A download that stalls for longer fails its shard,
    /// which will be retried by a later invocation.
    #[arg(long, default_value = "300", global = true)]
    http_timeout_secs: NonZeroU64,

    /// Number of input lines after which in-memory counts are flushed to disk
    #[arg(long, default_value = "10000000", global = true)]
    flush_lines: NonZeroU64,

    /// Number of distinct ngrams after which in-memory counts are flushed to
    /// disk
    ///
    /// This bounds the memory footprint of shard processing.
    #[arg(long, default_value = "2000000", global = true)]
    flush_entries: NonZeroUsize,

    /// Longest accepted line of input, in bytes
    ///
    /// Longer lines can only come from corrupt data. They are skipped, like
    /// any other malformed record.
    #[arg(long, default_value = "65536", global = true)]
    max_line_length: NonZeroUsize,

    /// Minimum total match count of published ngrams
    ///
    /// Extremely rare ngrams are mostly noise (OCR errors, neologisms...).
    #[arg(short, long, default_value = "5000", global = true)]
    min_frequency: u64,

    /// Number of published unigrams
    #[arg(long, default_value = "30000", global = true)]
    top_unigrams: NonZeroUsize,

    /// Number of published ngrams for every order from 2 to 5
    #[arg(long, default_value = "10000", global = true)]
    top_ngrams: NonZeroUsize,
}

/// Operations that the harvester can carry out
#[derive(Subcommand, Debug)]
enum Command {
    /// Start or resume the harvesting job
    ///
    /// Output tables are published once every shard has been attempted.
    Run,

    /// Process a single shard, as a delegated worker would
    Shard {
        /// Ngram order of the shard
        order: NgramOrder,

        /// Key of the shard, e.g. "q" for unigrams or "qu" for longer ngrams
        key: Box<str>,
    },

    /// Have the pending shards of an ngram order processed by a remote worker
    Dispatch {
        /// Ngram order whose shards should be dispatched
        order: NgramOrder,

        /// Endpoint that processing requests are POSTed to
        worker_url: Box<str>,

        /// Maximal number of simultaneous requests
        #[arg(long, default_value = "2")]
        concurrency: NonZeroUsize,

        /// Minimal delay between two requests, in milliseconds
        #[arg(long, default_value = "500")]
        delay_ms: u64,

        /// Upper bound of the random delay added between requests, in
        /// milliseconds
        #[arg(long, default_value = "1000")]
        jitter_ms: u64,
    },

    /// Report how far the harvesting went, without fetching anything
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up logging
    setup_logging().map_err(|e| anyhow::format_err!("{e}"))?;

    // Decode CLI arguments
    let Args { command, options } = Args::parse();
    let config = Config::new(options)?;

    // Set up storage
    let checkpoints = FsCheckpointStore::new(&config.state_dir.join("checkpoints"))?;
    let results = FsResultStore::new(&config.state_dir.join("results"))?;

    // Do what was asked
    match command {
        Command::Run => {
            let report = ProgressReport::new();
            let source = http_source(&config, &report)?;
            let job = Job::new(&config, &source, &checkpoints, &results, &report);
            let summary = job.run().await?;
            print_json(&summary).await
        }
        Command::Shard { order, key } => {
            let shard = order
                .shards(&config.corpus)
                .find(|shard| shard.key == key)
                .with_context(|| format!("there is no {order} shard with key {key:?}"))?;
            let report = ProgressReport::new();
            let source = http_source(&config, &report)?;
            let job = Job::new(&config, &source, &checkpoints, &results, &report);
            let outcome = job.run_shard(&shard).await?;
            print_json(&outcome).await
        }
        Command::Dispatch {
            order,
            worker_url,
            concurrency,
            delay_ms,
            jitter_ms,
        } => {
            let config = config.with_dispatch_config(DispatchConfig {
                worker_url: Some(worker_url),
                concurrency,
                base_delay: Duration::from_millis(delay_ms),
                jitter: Duration::from_millis(jitter_ms),
            });
            let report = dispatch_order(&config, order, &checkpoints).await?;
            results
                .write_output(&format!("dispatch_{order}"), &report)
                .context("recording the dispatch report")?;
            print_json(&report).await
        }
        Command::Status => {
            let status = job::status(&config, &checkpoints, &results)?;
            print_json(&status).await
        }
    }
}

/// Set up an HTTP client that won't wait forever on an unresponsive server
fn http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.http_timeout)
        .build()
        .context("setting up the HTTP client")
}

/// Set up the HTTP shard downloader
fn http_source(config: &Config, report: &ProgressReport) -> Result<HttpSource> {
    let bytes = report.add("Downloading shards", Work::Bytes(0));
    Ok(HttpSource::new(
        http_client(config)?,
        config.retry,
        config.http_timeout,
        bytes,
    ))
}

/// Dispatch the pending shards of an ngram order and wait for the outcome
async fn dispatch_order(
    config: &Arc<Config>,
    order: NgramOrder,
    checkpoints: &FsCheckpointStore,
) -> Result<dispatch::DispatchReport> {
    let endpoint = config
        .dispatch
        .worker_url
        .as_deref()
        .context("no worker endpoint was configured")?;
    let worker = Arc::new(HttpWorker::new(http_client(config)?, endpoint, config.retry)?);
    let pending = job::pending_shards(config, order, checkpoints)?;
    log::info!("Dispatching {} pending {order} shards to {endpoint}", pending.len());

    // Follow the background dispatch until it's done
    let report = ProgressReport::new();
    let tracker = report.add(format!("Dispatching {order} shards"), Work::Steps(pending.len()));
    let handle = dispatch::dispatch(pending, worker, &config.dispatch);
    let mut poll = tokio::time::interval(Duration::from_millis(200));
    while !handle.is_finished() {
        poll.tick().await;
        let progress = handle.progress();
        let completed = (progress.succeeded + progress.failed) as u64;
        tracker.make_progress(completed.saturating_sub(tracker.position()));
    }
    tracker.finish();
    let outcome = handle.join().await?;
    log::info!(
        "Dispatch of {order} shards done: {} acknowledged, {} failed",
        outcome.succeeded,
        outcome.failed_shards.len()
    );
    Ok(outcome)
}

/// Print a command's outcome on stdout
async fn print_json(value: &impl Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serializing the outcome")?;
    let mut stdout = BufWriter::new(tokio::io::stdout());
    stdout.write_all(json.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

/// Use anyhow for Result type erasure
pub use anyhow::Result;

/// Space-separated words whose frequency is being measured
pub type Gram = Box<str>;

/// Number of recorded occurences of an ngram
///
/// According to
/// https://github.com/orgtre/google-books-ngram-frequency?tab=readme-ov-file#the-underlying-corpus,
/// English can have >283 billion matches over 10 years, so totals need 64 bits.
pub type MatchCount = u64;

/// Set up logging
fn setup_logging() -> syslog::Result<()> {
    syslog::init(
        syslog::Facility::LOG_USER,
        if cfg!(feature = "log-trace") {
            LevelFilter::Trace
        } else if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
        None,
    )
}

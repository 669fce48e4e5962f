//! Resilient download of dataset shards

use crate::{config::RetryPolicy, progress::ProgressTracker, shards::ShardId, Result};
use anyhow::Context;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use rand::Rng;
use reqwest::{Response, StatusCode};
use std::{
    future::Future,
    io::{self, ErrorKind},
    pin::Pin,
    time::Duration,
};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

/// Compressed byte stream of a shard
pub type ShardStream = Pin<Box<dyn AsyncRead + Send>>;

/// Something that can provide the compressed bytes of a shard
pub trait ShardSource {
    /// Start fetching a shard
    ///
    /// The returned stream may still fail midway, in which case the shard
    /// should be treated as failed.
    fn open(&self, shard: &ShardId) -> impl Future<Output = Result<ShardStream>> + Send;
}

/// Errors that may go away if the failed operation is retried
pub trait Transient {
    /// Truth that the operation should be retried
    fn is_transient(&self) -> bool;
}
//
impl Transient for reqwest::Error {
    fn is_transient(&self) -> bool {
        match self.status() {
            Some(status) => status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
            // No status means we never got a well-formed response
            None => !self.is_builder() && !self.is_redirect(),
        }
    }
}

/// Run an operation until it succeeds, fails permanently, or runs out of
/// retries, sleeping with exponential backoff and jitter between attempts
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T>
where
    E: Transient + std::error::Error + Send + Sync + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < policy.max_attempts.get() => {
                let delay = policy.backoff(attempt) + jitter(policy.base_delay);
                log::warn!(
                    "Attempt {attempt}/{} of {what} failed ({e}), retrying in {delay:?}",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                let cause = if e.is_transient() {
                    "retries exhausted"
                } else {
                    "permanent error"
                };
                return Err(anyhow::Error::new(e)
                    .context(format!("{what} failed after {attempt} attempt(s), {cause}")));
            }
        }
    }
}

/// Random delay in [0; max]
pub fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Shard source that downloads shards over HTTP
#[derive(Clone, Debug)]
pub struct HttpSource {
    /// Shared HTTP client
    client: reqwest::Client,

    /// How hard we should try
    policy: RetryPolicy,

    /// Longest wait for the next chunk of a download before giving up
    idle_timeout: Duration,

    /// Tracks how many compressed bytes have been downloaded
    bytes: ProgressTracker,
}
//
impl HttpSource {
    /// Set up the shard downloader
    pub fn new(
        client: reqwest::Client,
        policy: RetryPolicy,
        idle_timeout: Duration,
        bytes: ProgressTracker,
    ) -> Self {
        Self {
            client,
            policy,
            idle_timeout,
            bytes,
        }
    }
}
//
impl ShardSource for HttpSource {
    async fn open(&self, shard: &ShardId) -> Result<ShardStream> {
        // Start the download, retrying until we get a response header
        let url = &*shard.url;
        let response = retry_with_backoff(&self.policy, &format!("download of {url}"), || {
            let request = self.client.get(url).send();
            async move { request.await.and_then(Response::error_for_status) }
        })
        .await?;
        if let Some(length) = response.content_length() {
            self.bytes.add_work(length);
        }

        // Slice the download into chunks of bytes
        let bytes = self.bytes.clone();
        let chunks = bound_idle_time(response.bytes_stream(), self.idle_timeout).map(move |res| {
            // Track how many input bytes have been downloaded so far
            res.inspect(|bytes_block| bytes.make_progress(bytes_block.len() as u64))
        });
        Ok(Box::pin(StreamReader::new(chunks)))
    }
}

/// Translate a stream of downloaded chunks into I/O results, failing with
/// [`ErrorKind::TimedOut`] if no chunk arrives within `idle_timeout`
///
/// The stream ends after the first error.
fn bound_idle_time<S, E>(
    chunks: S,
    idle_timeout: Duration,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    stream::unfold(Some(Box::pin(chunks)), move |chunks| async move {
        let mut chunks = chunks?;
        match tokio::time::timeout(idle_timeout, chunks.next()).await {
            Ok(Some(Ok(bytes_block))) => Some((Ok(bytes_block), Some(chunks))),
            Ok(Some(Err(e))) => Some((Err(io::Error::new(ErrorKind::Other, e)), None)),
            Ok(None) => None,
            Err(_) => {
                let message = format!("no data received for {idle_timeout:?}");
                Some((Err(io::Error::new(ErrorKind::TimedOut, message)), None))
            }
        }
    })
}

/// Check that a worker or shard URL is well-formed before using it
pub fn check_url(url: &str) -> Result<()> {
    reqwest::Url::parse(url)
        .map(|_| ())
        .with_context(|| format!("parsing URL {url}"))
}

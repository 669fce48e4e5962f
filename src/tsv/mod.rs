//! Processing of the gzipped TSV data files from Google

pub mod codec;
pub mod filter;

use self::codec::{BoundedLinesCodec, RawLine};
use crate::{aggregate::Aggregator, fetch::ShardStream, storage::ResultStore, Result};
use anyhow::Context;
use async_compression::tokio::bufread::GzipDecoder;
use futures::stream::{Stream, StreamExt};
use tokio::io::BufReader;
use tokio_util::codec::FramedRead;

/// Number of lines between two progress messages in the logs
const LINES_PER_LOG: u64 = 50_000;

/// Decode a gzipped byte stream into a stream of lines
///
/// Only one line at a time is buffered. Lines longer than `max_line_length`
/// are reported as [`RawLine::Overlong`] without their contents. The last
/// line of the input does not need to be terminated by a newline.
///
/// Errors only come from the compressed byte stream, and end the stream.
pub fn decode_lines(
    gz_bytes: ShardStream,
    max_line_length: usize,
) -> impl Stream<Item = Result<RawLine>> + Send + Unpin {
    let mut tsv_bytes = GzipDecoder::new(BufReader::new(gz_bytes));
    tsv_bytes.multiple_members(true);
    FramedRead::new(tsv_bytes, BoundedLinesCodec::new(max_line_length))
        .map(|line| line.context("decompressing TSV data"))
}

/// Statistics about the lines of a data file
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LineStats {
    /// Lines that were read
    pub lines: u64,

    /// Lines that were accepted by the record filter
    pub accepted: u64,
}

/// Feed every valid record of a data file into an aggregator
///
/// Malformed lines are skipped. Only failure to download or decompress the
/// data file is an error.
pub async fn extract<S: ResultStore>(
    gz_bytes: ShardStream,
    max_line_length: usize,
    aggregator: &mut Aggregator<'_, S>,
) -> Result<LineStats> {
    let shard = aggregator.shard().clone();
    let mut lines = decode_lines(gz_bytes, max_line_length);
    let mut stats = LineStats::default();
    while let Some(line) = lines.next().await {
        let line = line.with_context(|| format!("reading {}", shard.url))?;
        stats.lines += 1;
        if stats.lines % LINES_PER_LOG == 0 {
            log::debug!("Processed {} lines from {shard}", stats.lines);
        }
        match filter::line_text(&line) {
            Some(text) => {
                if aggregator.add_line(text)? {
                    stats.accepted += 1;
                }
            }
            None => aggregator.skip_line()?,
        }
    }
    Ok(stats)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        aggregate::AggregateTable,
        config::FlushLimits,
        shards::{Corpus, NgramOrder, ShardId},
        storage::FsResultStore,
    };
    use bytes::BytesMut;
    use futures::TryStreamExt;
    use std::num::{NonZeroU64, NonZeroUsize};

    async fn lines_of(data: &[u8], max_line_length: usize) -> Result<Vec<RawLine>> {
        let compressed = testing::gzip(data).await;
        decode_lines(testing::stream(compressed), max_line_length)
            .try_collect()
            .await
    }

    fn complete(text: &[u8]) -> RawLine {
        RawLine::Complete(BytesMut::from(text))
    }

    #[tokio::test]
    async fn lines_are_split() {
        let lines = lines_of(b"a\t1\t2\t3\nb\t4\t5\t6\n", 64).await.unwrap();
        assert_eq!(lines, vec![complete(b"a\t1\t2\t3"), complete(b"b\t4\t5\t6")]);
    }

    #[tokio::test]
    async fn trailing_partial_line_is_kept() {
        let lines = lines_of(b"first\nlast without newline", 64).await.unwrap();
        assert_eq!(lines, vec![complete(b"first"), complete(b"last without newline")]);
    }

    #[tokio::test]
    async fn overlong_lines_do_not_end_the_stream() {
        let lines = lines_of(b"short\nthis line is way too long\nafter\n", 10).await.unwrap();
        assert_eq!(
            lines,
            vec![complete(b"short"), RawLine::Overlong { length: 25 }, complete(b"after")]
        );
    }

    #[tokio::test]
    async fn corrupt_input_is_an_error() {
        let garbage = b"definitely not gzip".to_vec();
        let result: Result<Vec<RawLine>> = decode_lines(testing::stream(garbage), 64)
            .try_collect()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn truncated_input_is_an_error() {
        let mut compressed = testing::gzip("some line\n".repeat(1000)).await;
        compressed.truncate(compressed.len() / 2);
        let result: Result<Vec<RawLine>> = decode_lines(testing::stream(compressed), 64)
            .try_collect()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path()).unwrap();
        let corpus = Corpus {
            base_url: "http://localhost".into(),
            language: "eng".into(),
            version: "20120701".into(),
        };
        let shard = ShardId::new(&corpus, NgramOrder::new(1).unwrap(), "g".into());
        let limits = FlushLimits {
            max_lines: NonZeroU64::new(1000).unwrap(),
            max_entries: NonZeroUsize::new(1000).unwrap(),
        };
        let mut aggregator = Aggregator::new(shard.clone(), &store, limits).unwrap();

        let mut data = b"good\t1999\t5\t1\n\xff\xfebad\t1999\t5\t1\n".to_vec();
        data.extend_from_slice(format!("{}\t1999\t5\t1\n", "g".repeat(2000)).as_bytes());
        data.extend_from_slice(b"good\t2000\t2\t1\nother\t1999\t7\t1");
        let compressed = testing::gzip(&data).await;
        let stats = extract(testing::stream(compressed), 1024, &mut aggregator)
            .await
            .unwrap();
        assert_eq!(stats, LineStats { lines: 5, accepted: 3 });

        aggregator.finish().unwrap();
        let mut totals = AggregateTable::new();
        for part in 0..store.num_partials(&shard).unwrap() {
            for (gram, count) in store.read_partial(&shard, part).unwrap() {
                *totals.entry(gram).or_default() += count;
            }
        }
        assert_eq!(totals.len(), 2);
        assert_eq!(totals["good"], 7);
        assert_eq!(totals["other"], 7);
    }
}

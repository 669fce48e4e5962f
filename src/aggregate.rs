//! Memory-bounded accumulation of ngram match counts within a shard

use crate::{
    config::FlushLimits,
    shards::ShardId,
    storage::{PartialTable, ResultStore},
    tsv::filter,
    Gram, MatchCount, Result,
};
use anyhow::Context;
use std::collections::HashMap;

/// Cumulative match counts, keyed by ngram
pub type AggregateTable = HashMap<Gram, MatchCount>;

/// Accumulator for the records of a single data file
///
/// Whenever the in-memory table grows too large, or too many lines have been
/// read since the last flush, the table is written down to the result store as
/// a partial result and cleared. Counts are therefore exact, but the same
/// ngram may appear in several partial results, which must be summed.
///
/// Once you're done with a data file, call [`finish()`](Self::finish) to commit
/// its partial results.
#[derive(Debug)]
pub struct Aggregator<'store, S: ResultStore> {
    /// Shard being processed
    shard: ShardId,

    /// Where partial results go
    store: &'store S,

    /// When the table must be flushed
    limits: FlushLimits,

    /// Counts accumulated since the last flush
    table: AggregateTable,

    /// Lines read since the last flush
    lines_since_flush: u64,

    /// Number of partial results written so far
    num_parts: usize,
}
//
impl<'store, S: ResultStore> Aggregator<'store, S> {
    /// Start accumulating the records of a shard
    ///
    /// Uncommitted partial results of previous attempts at processing this
    /// shard are discarded.
    pub fn new(shard: ShardId, store: &'store S, limits: FlushLimits) -> Result<Self> {
        store
            .begin_shard(&shard)
            .with_context(|| format!("preparing storage for shard {shard}"))?;
        Ok(Self {
            shard,
            store,
            limits,
            table: AggregateTable::new(),
            lines_since_flush: 0,
            num_parts: 0,
        })
    }

    /// Shard being processed
    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    /// Integrate a raw line from the data file
    ///
    /// Returns truth that the line was a valid record.
    pub fn add_line(&mut self, line: &str) -> Result<bool> {
        let accepted = match filter::parse_record(line, self.shard.order) {
            Some(record) => {
                self.add(record);
                true
            }
            None => false,
        };
        self.count_line()?;
        Ok(accepted)
    }

    /// Account for a line that could not even be read as text
    pub fn skip_line(&mut self) -> Result<()> {
        self.count_line()
    }

    /// Flush if enough lines have been read or enough ngrams accumulated
    fn count_line(&mut self) -> Result<()> {
        self.lines_since_flush += 1;
        if self.lines_since_flush >= self.limits.max_lines.get()
            || self.table.len() >= self.limits.max_entries.get()
        {
            self.flush()?;
        }
        Ok(())
    }

    /// Integrate a valid record
    fn add(&mut self, record: filter::Record<'_>) {
        // Avoid allocating a new key for ngrams that were seen before
        if let Some(count) = self.table.get_mut(record.gram) {
            *count = count.saturating_add(record.match_count);
            return;
        }
        self.table.insert(record.gram.into(), record.match_count);
    }

    /// Write down the current table as a partial result and clear it
    fn flush(&mut self) -> Result<()> {
        self.lines_since_flush = 0;
        if self.table.is_empty() {
            return Ok(());
        }
        let partial = self.table.drain().collect::<PartialTable>();
        self.store
            .write_partial(&self.shard, self.num_parts, &partial)
            .with_context(|| format!("flushing partial result #{} of {}", self.num_parts, self.shard))?;
        log::debug!(
            "Flushed {} ngrams from {} as partial result #{}",
            partial.len(),
            self.shard,
            self.num_parts
        );
        self.num_parts += 1;
        Ok(())
    }

    /// Flush the remaining counts and commit all partial results of the shard
    pub fn finish(mut self) -> Result<Folded> {
        self.flush()?;
        self.store
            .commit_shard(&self.shard)
            .with_context(|| format!("committing results of shard {}", self.shard))?;
        Ok(Folded {
            shard: self.shard,
            num_parts: self.num_parts,
        })
    }
}

/// Proof that a shard's results have been durably committed
///
/// Only [`Aggregator::finish()`] can produce this, and only a value of this
/// type allows a shard to be checkpointed as done.
#[derive(Debug, Eq, PartialEq)]
pub struct Folded {
    /// Shard whose results were committed
    shard: ShardId,

    /// Number of partial results that were committed
    num_parts: usize,
}
//
impl Folded {
    /// Shard whose results were committed
    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    /// Number of partial results that were committed
    pub fn num_parts(&self) -> usize {
        self.num_parts
    }
}

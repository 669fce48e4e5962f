//! Merge shard results and select the top ngrams of each order

use crate::{
    aggregate::AggregateTable,
    checkpoint::CheckpointStore,
    config::RankConfig,
    progress::{ProgressReport, Work},
    shards::{Corpus, NgramOrder},
    storage::ResultStore,
    tsv::filter,
    Gram, MatchCount, Result,
};
use anyhow::Context;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{cmp::Reverse, collections::BinaryHeap};

/// Entry of a final output table
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct RankedEntry {
    /// Ngram
    pub gram: Gram,

    /// Total match count across all shards
    pub freq: MatchCount,
}

/// Name of the output table of an ngram order
pub fn table_name(order: NgramOrder) -> String {
    format!("{order}_top")
}

/// Name of the output table with the top unigrams
pub const WORDS_TABLE: &str = "words_top";

/// Name of the output table that concatenates the top 2+-grams
pub const PHRASES_TABLE: &str = "phrases_top";

/// Sum the committed results of every completed shard of an ngram order
///
/// Only shards that are checkpointed as done are included.
///
/// Every distinct ngram of the order is held in memory until the frequency
/// floor is applied by [`rank()`], so the aggregator's flush limits only bound
/// shard processing, not this merge. Its footprint grows with the vocabulary
/// of the whole order.
pub fn merge_order(
    corpus: &Corpus,
    order: NgramOrder,
    checkpoints: &impl CheckpointStore,
    store: &impl ResultStore,
    report: &ProgressReport,
) -> Result<(AggregateTable, usize)> {
    let progress = report.add(format!("Merging {order} results"), Work::Steps(order.num_shards()));
    let mut totals = AggregateTable::new();
    let mut num_merged = 0;
    for shard in order.shards(corpus) {
        progress.make_progress(1);
        if !checkpoints.is_done(order, &shard.key)? {
            continue;
        }
        let num_parts = store.num_partials(&shard)?;
        for part in 0..num_parts {
            let partial = store
                .read_partial(&shard, part)
                .with_context(|| format!("loading partial result #{part} of {shard}"))?;
            for (gram, count) in partial {
                let total = totals.entry(gram).or_default();
                *total = total.saturating_add(count);
            }
        }
        num_merged += 1;
    }
    progress.finish();
    log::info!(
        "Merged {num_merged} completed {order} shards into {} distinct ngrams",
        totals.len()
    );
    Ok((totals, num_merged))
}

/// Pick the most frequent ngrams of an order, by decreasing total match count
///
/// Ngrams that do not have the shape of the requested order, or whose total
/// match count is below the configured floor, are discarded. Ties are broken
/// by ascending ngram text, so the output only depends on the input counts.
pub fn rank(totals: AggregateTable, order: NgramOrder, config: &RankConfig) -> Vec<RankedEntry> {
    let max_len = config.top_k(order);
    let top = totals
        .into_par_iter()
        .filter(|(gram, freq)| {
            if !filter::is_clean_gram(gram, order) {
                log::warn!("Discarding malformed {order} {gram:?} from merged results");
                return false;
            }
            *freq >= config.min_frequency
        })
        // Smaller keys are better ngrams, so a max-heap pops the worst one
        .map(|(gram, freq)| (Reverse(freq), gram))
        // First determine top ngrams on each thread using a heap...
        .fold(
            || BinaryHeap::with_capacity(max_len + 1),
            |mut heap, key| {
                heap.push(key);
                if heap.len() > max_len {
                    heap.pop();
                }
                heap
            },
        )
        // ...then merge thread results into a global result
        .reduce(BinaryHeap::new, |heap1, heap2| {
            let (mut dst, mut src) = if heap1.len() >= heap2.len() {
                (heap1, heap2)
            } else {
                (heap2, heap1)
            };
            while let Some(elem) = src.pop() {
                dst.push(elem);
                if dst.len() > max_len {
                    dst.pop();
                }
            }
            dst
        });
    top.into_sorted_vec()
        .into_iter()
        .map(|(Reverse(freq), gram)| RankedEntry { gram, freq })
        .collect()
}

/// Merge, rank and publish the output table of an ngram order
///
/// The published table is returned, for use by [`publish_consolidated()`].
pub fn publish_order(
    corpus: &Corpus,
    order: NgramOrder,
    config: &RankConfig,
    checkpoints: &impl CheckpointStore,
    store: &impl ResultStore,
    report: &ProgressReport,
) -> Result<Vec<RankedEntry>> {
    let (totals, _num_merged) = merge_order(corpus, order, checkpoints, store, report)?;
    let ranked = rank(totals, order, config);
    store
        .write_output(&table_name(order), &ranked)
        .with_context(|| format!("saving the top {order} table"))?;
    log::info!("Published top {} {order}s", ranked.len());
    Ok(ranked)
}

/// Build the consolidated word and phrase tables from per-order tables that
/// were just published
///
/// The word table is rewritten if unigrams are among the published orders,
/// and the phrase table if any higher order is, even when the result is
/// empty. Tables left over from other runs are never looked at.
pub fn publish_consolidated(
    store: &impl ResultStore,
    published: &[(NgramOrder, Vec<RankedEntry>)],
) -> Result<()> {
    let mut phrases = None::<Vec<RankedEntry>>;
    for (order, table) in published {
        if order.get() == 1 {
            store.write_output(WORDS_TABLE, table)?;
        } else {
            phrases.get_or_insert_with(Vec::new).extend_from_slice(table);
        }
    }
    if let Some(phrases) = phrases {
        store.write_output(PHRASES_TABLE, &phrases)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::FsCheckpointStore,
        shards::ShardId,
        storage::{FsResultStore, PartialTable},
    };
    use std::num::NonZeroUsize;

    fn config(top_k: usize, min_frequency: u64) -> RankConfig {
        RankConfig {
            min_frequency,
            top_unigrams: NonZeroUsize::new(top_k).unwrap(),
            top_ngrams: NonZeroUsize::new(top_k).unwrap(),
        }
    }

    fn totals(entries: &[(&str, u64)]) -> AggregateTable {
        entries.iter().map(|&(g, c)| (g.into(), c)).collect()
    }

    fn entry(gram: &str, freq: u64) -> RankedEntry {
        RankedEntry {
            gram: gram.into(),
            freq,
        }
    }

    fn corpus() -> Corpus {
        Corpus {
            base_url: "http://localhost".into(),
            language: "eng".into(),
            version: "20120701".into(),
        }
    }

    /// Commit some partial results for a shard and mark it done
    fn complete_shard(
        checkpoints: &FsCheckpointStore,
        store: &FsResultStore,
        shard: &ShardId,
        parts: &[&[(&str, u64)]],
    ) {
        store.begin_shard(shard).unwrap();
        for (idx, part) in parts.iter().enumerate() {
            let table = part.iter().map(|&(g, c)| (g.into(), c)).collect::<PartialTable>();
            store.write_partial(shard, idx, &table).unwrap();
        }
        store.commit_shard(shard).unwrap();
        checkpoints.mark_done(shard.order, &shard.key, &shard.url).unwrap();
    }

    #[test]
    fn ranking_sorts_and_truncates() {
        let order = NgramOrder::new(2).unwrap();
        let ranked = rank(
            totals(&[("a b", 5), ("c d", 50), ("e f", 20), ("g h", 1)]),
            order,
            &config(3, 0),
        );
        assert_eq!(ranked, vec![entry("c d", 50), entry("e f", 20), entry("a b", 5)]);
    }

    #[test]
    fn ranking_breaks_ties_by_text() {
        let order = NgramOrder::new(1).unwrap();
        let ranked = rank(
            totals(&[("pear", 7), ("apple", 7), ("zebra", 9), ("mango", 7)]),
            order,
            &config(3, 0),
        );
        assert_eq!(ranked, vec![entry("zebra", 9), entry("apple", 7), entry("mango", 7)]);
    }

    #[test]
    fn ranking_applies_floor_and_shape() {
        let order = NgramOrder::new(2).unwrap();
        let ranked = rank(
            totals(&[("big dog", 6000), ("small dog", 4999), ("d0g bark", 90000), ("dog", 90000)]),
            order,
            &config(10, 5000),
        );
        assert_eq!(ranked, vec![entry("big dog", 6000)]);
    }

    #[test]
    fn ranking_large_tables() {
        let order = NgramOrder::new(1).unwrap();
        let words = (0..2000u64)
            .map(|i| {
                let word = format!("w{}", i)
                    .chars()
                    .map(|c| if c.is_ascii_digit() { (b'a' + c as u8 - b'0') as char } else { c })
                    .collect::<String>();
                (word.into_boxed_str(), i)
            })
            .collect::<AggregateTable>();
        let ranked = rank(words, order, &config(100, 0));
        assert_eq!(ranked.len(), 100);
        assert_eq!(ranked[0].freq, 1999);
        assert_eq!(ranked[99].freq, 1900);
        assert!(ranked.windows(2).all(|w| w[0].freq > w[1].freq));
    }

    #[test]
    fn merging_sums_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FsCheckpointStore::new(&dir.path().join("checkpoints")).unwrap();
        let store = FsResultStore::new(&dir.path().join("results")).unwrap();
        let corpus = corpus();
        let order = NgramOrder::new(2).unwrap();
        let shards = order.shards(&corpus).collect::<Vec<_>>();
        complete_shard(&checkpoints, &store, &shards[0], &[&[("happy dog", 50)]]);
        complete_shard(
            &checkpoints,
            &store,
            &shards[1],
            &[&[("happy dog", 30)], &[("sad cat", 20)]],
        );

        // Committed but not checkpointed results are not included
        store.begin_shard(&shards[2]).unwrap();
        store.write_partial(&shards[2], 0, &vec![("happy dog".into(), 1000)]).unwrap();
        store.commit_shard(&shards[2]).unwrap();

        let report = ProgressReport::hidden();
        let (totals, num_merged) = merge_order(&corpus, order, &checkpoints, &store, &report).unwrap();
        assert_eq!(num_merged, 2);
        assert_eq!(
            rank(totals, order, &config(2, 0)),
            vec![entry("happy dog", 80), entry("sad cat", 20)]
        );
    }

    #[test]
    fn publishing_tables() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = FsCheckpointStore::new(&dir.path().join("checkpoints")).unwrap();
        let store = FsResultStore::new(&dir.path().join("results")).unwrap();
        let corpus = corpus();
        let report = ProgressReport::hidden();

        let unigrams = NgramOrder::new(1).unwrap();
        let bigrams = NgramOrder::new(2).unwrap();
        let shard = unigrams.shards(&corpus).next().unwrap();
        complete_shard(&checkpoints, &store, &shard, &[&[("apple", 3), ("ant", 9)]]);
        let shard = bigrams.shards(&corpus).next().unwrap();
        complete_shard(&checkpoints, &store, &shard, &[&[("an apple", 4)]]);

        let config = config(10, 0);
        let words = publish_order(&corpus, unigrams, &config, &checkpoints, &store, &report).unwrap();
        assert_eq!(words.len(), 2);
        let pairs = publish_order(&corpus, bigrams, &config, &checkpoints, &store, &report).unwrap();
        assert_eq!(pairs.len(), 1);
        publish_consolidated(&store, &[(unigrams, words), (bigrams, pairs)]).unwrap();

        let words = store.read_output::<Vec<RankedEntry>>(WORDS_TABLE).unwrap().unwrap();
        assert_eq!(words, vec![entry("ant", 9), entry("apple", 3)]);
        let phrases = store.read_output::<Vec<RankedEntry>>(PHRASES_TABLE).unwrap().unwrap();
        assert_eq!(phrases, vec![entry("an apple", 4)]);
        assert_eq!(
            store.read_output::<Vec<RankedEntry>>(&table_name(bigrams)).unwrap().unwrap(),
            phrases
        );
    }

    #[test]
    fn consolidation_ignores_stale_tables() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path()).unwrap();
        let bigrams = NgramOrder::new(2).unwrap();
        let trigrams = NgramOrder::new(3).unwrap();
        store.write_output(&table_name(trigrams), &vec![entry("old stale phrase", 99)]).unwrap();
        store.write_output(WORDS_TABLE, &vec![entry("old", 99)]).unwrap();
        store.write_output(PHRASES_TABLE, &vec![entry("old phrase", 99)]).unwrap();

        // An empty phrase table replaces the previous one
        publish_consolidated(&store, &[(bigrams, Vec::new())]).unwrap();
        let phrases = store.read_output::<Vec<RankedEntry>>(PHRASES_TABLE).unwrap().unwrap();
        assert!(phrases.is_empty());

        // Only the tables that were handed over are consolidated
        publish_consolidated(&store, &[(bigrams, vec![entry("new phrase", 5)])]).unwrap();
        let phrases = store.read_output::<Vec<RankedEntry>>(PHRASES_TABLE).unwrap().unwrap();
        assert_eq!(phrases, vec![entry("new phrase", 5)]);

        // Unigrams were not published, so the word table is left alone
        let words = store.read_output::<Vec<RankedEntry>>(WORDS_TABLE).unwrap().unwrap();
        assert_eq!(words, vec![entry("old", 99)]);
    }
}

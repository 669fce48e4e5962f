//! Durable storage of partial results, output tables and job records
//!
//! Partial results of a shard are first written to a staging area, then
//! promoted all at once into the committed area when the shard has been fully
//! processed. Only committed partials are ever read back, so an interrupted
//! shard never contributes half of its data to the output.

use crate::{shards::ShardId, Gram, MatchCount, Result};
use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{self, File},
    io::{BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

/// Aggregated ngram counts from one flush of the aggregator
pub type PartialTable = Vec<(Gram, MatchCount)>;

/// Durable storage for everything the pipeline produces
pub trait ResultStore {
    /// Prepare for processing a shard, discarding uncommitted leftovers of a
    /// previous attempt
    fn begin_shard(&self, shard: &ShardId) -> Result<()>;

    /// Write down a partial result of the shard being processed
    ///
    /// Partial results are numbered from 0 in the order they are written.
    fn write_partial(&self, shard: &ShardId, part: usize, table: &PartialTable) -> Result<()>;

    /// Make all partial results written since `begin_shard()` visible to
    /// readers, replacing any previously committed results for this shard
    fn commit_shard(&self, shard: &ShardId) -> Result<()>;

    /// Number of committed partial results for a shard
    fn num_partials(&self, shard: &ShardId) -> Result<usize>;

    /// Read back a committed partial result
    fn read_partial(&self, shard: &ShardId, part: usize) -> Result<PartialTable>;

    /// Write down an output table or record under a certain name
    fn write_output(&self, name: &str, value: &impl Serialize) -> Result<()>;

    /// Read back an output table or record, if it exists
    fn read_output<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>>;
}

/// [`ResultStore`] that keeps everything in a local directory
#[derive(Clone, Debug)]
pub struct FsResultStore {
    /// Root of the storage area
    root: Box<Path>,
}
//
impl FsResultStore {
    /// Set up storage in a certain directory
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("creating result directory {}", root.display()))?;
        Ok(Self { root: root.into() })
    }

    /// Directory of the partial results of a shard
    fn shard_dir(&self, area: &str, shard: &ShardId) -> PathBuf {
        self.root
            .join("partials")
            .join(area)
            .join(shard.order.to_string())
            .join(&*shard.key)
    }

    /// Path to a partial result file
    fn partial_path(dir: &Path, part: usize) -> PathBuf {
        dir.join(format!("part-{part:05}.json"))
    }
}
//
impl ResultStore for FsResultStore {
    fn begin_shard(&self, shard: &ShardId) -> Result<()> {
        let staging = self.shard_dir("staging", shard);
        remove_dir_if_exists(&staging)?;
        fs::create_dir_all(&staging)
            .with_context(|| format!("creating staging directory {}", staging.display()))
    }

    fn write_partial(&self, shard: &ShardId, part: usize, table: &PartialTable) -> Result<()> {
        let path = Self::partial_path(&self.shard_dir("staging", shard), part);
        write_json_atomically(&path, table)
    }

    fn commit_shard(&self, shard: &ShardId) -> Result<()> {
        let staging = self.shard_dir("staging", shard);
        let committed = self.shard_dir("committed", shard);
        anyhow::ensure!(
            staging.is_dir(),
            "no staged results to commit for shard {shard}"
        );
        remove_dir_if_exists(&committed)?;
        if let Some(parent) = committed.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        fs::rename(&staging, &committed).with_context(|| {
            format!("promoting {} to {}", staging.display(), committed.display())
        })
    }

    fn num_partials(&self, shard: &ShardId) -> Result<usize> {
        let committed = self.shard_dir("committed", shard);
        let entries = match fs::read_dir(&committed) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("listing {}", committed.display()))
            }
        };
        let mut num_parts = 0;
        for entry in entries {
            let entry = entry.with_context(|| format!("listing {}", committed.display()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("part-") && name.ends_with(".json") {
                num_parts += 1;
            }
        }
        Ok(num_parts)
    }

    fn read_partial(&self, shard: &ShardId, part: usize) -> Result<PartialTable> {
        let path = Self::partial_path(&self.shard_dir("committed", shard), part);
        read_json(&path)?.with_context(|| format!("partial result {} is missing", path.display()))
    }

    fn write_output(&self, name: &str, value: &impl Serialize) -> Result<()> {
        write_json_atomically(&self.root.join("output").join(format!("{name}.json")), value)
    }

    fn read_output<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        read_json(&self.root.join("output").join(format!("{name}.json")))
    }
}

/// Serialize a value as JSON into a file, such that readers either see the
/// previous version of the file or the complete new one
pub fn write_json_atomically(path: &Path, value: &impl Serialize) -> Result<()> {
    let context = || format!("writing {}", path.display());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(context)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp_path).with_context(context)?);
        serde_json::to_writer(&mut writer, value).with_context(context)?;
        writer.flush().with_context(context)?;
    }
    fs::rename(&tmp_path, path).with_context(context)
}

/// Deserialize a JSON file, if it exists
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .with_context(|| format!("parsing {}", path.display()))
}

/// Recursively remove a directory, if it exists
fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shards::{Corpus, NgramOrder};

    fn shard(key: &str) -> ShardId {
        let corpus = Corpus {
            base_url: "http://localhost".into(),
            language: "eng".into(),
            version: "20120701".into(),
        };
        ShardId::new(&corpus, NgramOrder::new(2).unwrap(), key.into())
    }

    fn table(entries: &[(&str, u64)]) -> PartialTable {
        entries.iter().map(|&(g, c)| (g.into(), c)).collect()
    }

    #[test]
    fn staged_partials_are_invisible_until_committed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path()).unwrap();
        let shard = shard("ha");

        store.begin_shard(&shard).unwrap();
        store.write_partial(&shard, 0, &table(&[("happy dog", 50)])).unwrap();
        store.write_partial(&shard, 1, &table(&[("happy cat", 5)])).unwrap();
        assert_eq!(store.num_partials(&shard).unwrap(), 0);

        store.commit_shard(&shard).unwrap();
        assert_eq!(store.num_partials(&shard).unwrap(), 2);
        assert_eq!(store.read_partial(&shard, 0).unwrap(), table(&[("happy dog", 50)]));
        assert_eq!(store.read_partial(&shard, 1).unwrap(), table(&[("happy cat", 5)]));
    }

    #[test]
    fn reprocessing_replaces_committed_partials() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path()).unwrap();
        let shard = shard("ha");

        store.begin_shard(&shard).unwrap();
        store.write_partial(&shard, 0, &table(&[("happy dog", 50)])).unwrap();
        store.write_partial(&shard, 1, &table(&[("happy cat", 5)])).unwrap();
        store.commit_shard(&shard).unwrap();

        // An interrupted attempt leaves staging leftovers behind...
        store.begin_shard(&shard).unwrap();
        store.write_partial(&shard, 0, &table(&[("junk", 1)])).unwrap();

        // ...which the next attempt discards
        store.begin_shard(&shard).unwrap();
        store.write_partial(&shard, 0, &table(&[("happy dog", 50), ("happy cat", 5)])).unwrap();
        store.commit_shard(&shard).unwrap();
        assert_eq!(store.num_partials(&shard).unwrap(), 1);
        assert_eq!(
            store.read_partial(&shard, 0).unwrap(),
            table(&[("happy dog", 50), ("happy cat", 5)])
        );
    }

    #[test]
    fn committing_without_staging_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path()).unwrap();
        assert!(store.commit_shard(&shard("zz")).is_err());
    }

    #[test]
    fn outputs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path()).unwrap();
        assert_eq!(store.read_output::<Vec<u64>>("missing").unwrap(), None);
        store.write_output("numbers", &vec![3u64, 2, 1]).unwrap();
        assert_eq!(store.read_output::<Vec<u64>>("numbers").unwrap(), Some(vec![3, 2, 1]));
        assert!(!dir.path().join("output").join("numbers.json.tmp").exists());
    }
}

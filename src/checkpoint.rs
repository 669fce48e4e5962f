//! Durable record of which shards have been fully processed

use crate::{
    shards::NgramOrder,
    storage::{read_json, write_json_atomically},
    Result,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Processing status of a shard
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    /// The shard's contribution has been durably folded into the results
    Done,
}

/// Checkpoint of a shard, created once it has been fully processed
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointRecord {
    /// Ngram order of the shard
    pub order: NgramOrder,

    /// Key of the shard within its ngram order
    pub shard_key: Box<str>,

    /// Processing status
    pub status: ShardStatus,

    /// Where the shard was downloaded from
    pub source_url: Box<str>,

    /// When processing of the shard completed
    pub completed_at: DateTime<Utc>,
}

/// Keyed durable storage of shard checkpoints
///
/// Any error from these methods means that progress cannot be tracked, and
/// that processing must stop.
pub trait CheckpointStore {
    /// Truth that a shard has been fully processed
    fn is_done(&self, order: NgramOrder, shard_key: &str) -> Result<bool>;

    /// Record that a shard has been fully processed
    ///
    /// Only call this once the shard's results have been durably committed.
    /// Marking a shard that is already done has no effect.
    fn mark_done(&self, order: NgramOrder, shard_key: &str, source_url: &str) -> Result<()>;
}

/// [`CheckpointStore`] that keeps one JSON file per shard in a directory
#[derive(Clone, Debug)]
pub struct FsCheckpointStore {
    /// Directory where checkpoints are stored
    dir: Box<Path>,
}
//
impl FsCheckpointStore {
    /// Set up checkpoint storage in a certain directory
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating checkpoint directory {}", dir.display()))?;
        Ok(Self { dir: dir.into() })
    }

    /// Location of a shard's checkpoint
    fn path(&self, order: NgramOrder, shard_key: &str) -> PathBuf {
        self.dir.join(format!("{order}_{shard_key}.json"))
    }

    /// Load a shard's checkpoint, if there is a valid one
    pub fn get(&self, order: NgramOrder, shard_key: &str) -> Result<Option<CheckpointRecord>> {
        let path = self.path(order, shard_key);
        match read_json::<CheckpointRecord>(&path) {
            Ok(record) => Ok(record),
            // Read errors mean the store is unusable, bad contents just mean
            // that the shard must be processed again
            Err(e) if e.root_cause().is::<serde_json::Error>() => {
                log::warn!("Ignoring invalid checkpoint {}: {e:#}", path.display());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
//
impl CheckpointStore for FsCheckpointStore {
    fn is_done(&self, order: NgramOrder, shard_key: &str) -> Result<bool> {
        Ok(self.get(order, shard_key)?.is_some_and(|record| {
            record.order == order
                && *record.shard_key == *shard_key
                && record.status == ShardStatus::Done
        }))
    }

    fn mark_done(&self, order: NgramOrder, shard_key: &str, source_url: &str) -> Result<()> {
        if self.is_done(order, shard_key)? {
            log::debug!("Shard {order}/{shard_key} was already marked done");
            return Ok(());
        }
        let record = CheckpointRecord {
            order,
            shard_key: shard_key.into(),
            status: ShardStatus::Done,
            source_url: source_url.into(),
            completed_at: Utc::now(),
        };
        write_json_atomically(&self.path(order, shard_key), &record)
            .with_context(|| format!("recording completion of shard {order}/{shard_key}"))
    }
}

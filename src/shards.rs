//! Addressing of the Google Books Ngram data files ("shards")

use crate::Result;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::OnceLock};

/// Number of space-separated words in the ngrams of a dataset
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct NgramOrder(u8);
//
impl NgramOrder {
    /// Smallest ngram order published by Google
    pub const MIN: u8 = 1;

    /// Largest ngram order published by Google
    pub const MAX: u8 = 5;

    /// Validate an ngram order
    pub fn new(order: u8) -> Result<Self> {
        anyhow::ensure!(
            (Self::MIN..=Self::MAX).contains(&order),
            "ngram order {order} is outside of supported range {}..={}",
            Self::MIN,
            Self::MAX
        );
        Ok(Self(order))
    }

    /// Every supported ngram order, in processing order
    pub fn all() -> impl Iterator<Item = Self> {
        (Self::MIN..=Self::MAX).map(Self)
    }

    /// Numerical value, which is also the number of words per ngram
    pub fn get(self) -> usize {
        usize::from(self.0)
    }

    /// Enumerate the shards of this ngram order
    ///
    /// Unigrams are split by first letter, longer ngrams by first two letters.
    /// The enumeration order is fixed, and so is the order in which shards
    /// get processed.
    pub fn shards<'a>(self, corpus: &'a Corpus) -> impl Iterator<Item = ShardId> + 'a {
        let keys = if self.0 == 1 {
            single_letter_keys()
        } else {
            letter_pair_keys()
        };
        keys.iter().map(move |key| ShardId::new(corpus, self, key.clone()))
    }

    /// Number of shards in this ngram order
    pub fn num_shards(self) -> usize {
        if self.0 == 1 {
            single_letter_keys().len()
        } else {
            letter_pair_keys().len()
        }
    }
}
//
impl TryFrom<u8> for NgramOrder {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}
//
impl From<NgramOrder> for u8 {
    fn from(value: NgramOrder) -> Self {
        value.0
    }
}
//
impl FromStr for NgramOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.strip_suffix("gram").unwrap_or(s);
        Self::new(s.parse()?)
    }
}
//
impl fmt::Display for NgramOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}gram", self.0)
    }
}

/// Which edition of the Google Books Ngram dataset is being harvested
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Corpus {
    /// Base URL under which the data files are published
    pub base_url: Box<str>,

    /// Short language name, as in dataset URLs (e.g. "eng", "eng-fiction")
    pub language: Box<str>,

    /// Dataset version, as in dataset URLs (e.g. "20120701")
    pub version: Box<str>,
}
//
impl Corpus {
    /// URL of a data file
    fn url(&self, order: NgramOrder, key: &str) -> Box<str> {
        format!(
            "{}/googlebooks-{}-all-{}-{}-{key}.gz",
            self.base_url.trim_end_matches('/'),
            self.language,
            order,
            self.version,
        )
        .into()
    }
}

/// Identifier of one data file of the dataset
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ShardId {
    /// Ngram order of the data file
    pub order: NgramOrder,

    /// Letter prefix that all ngrams in the file share
    pub key: Box<str>,

    /// Where the file can be downloaded
    pub url: Box<str>,
}
//
impl ShardId {
    /// Address a shard of a corpus
    pub fn new(corpus: &Corpus, order: NgramOrder, key: Box<str>) -> Self {
        let url = corpus.url(order, &key);
        Self { order, key, url }
    }
}
//
impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.order, self.key)
    }
}

/// Shard keys of the unigram dataset: "a" to "z"
fn single_letter_keys() -> &'static [Box<str>] {
    static LAZY: OnceLock<Box<[Box<str>]>> = OnceLock::new();
    LAZY.get_or_init(|| {
        ('a'..='z')
            .map(|c| c.to_string().into_boxed_str())
            .collect()
    })
}

/// Shard keys of the 2+-gram datasets: "aa" to "zz"
fn letter_pair_keys() -> &'static [Box<str>] {
    static LAZY: OnceLock<Box<[Box<str>]>> = OnceLock::new();
    LAZY.get_or_init(|| {
        ('a'..='z')
            .flat_map(|first| ('a'..='z').map(move |second| format!("{first}{second}").into()))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Corpus {
        Corpus {
            base_url: "http://storage.googleapis.com/books/ngrams/books/".into(),
            language: "eng".into(),
            version: "20120701".into(),
        }
    }

    #[test]
    fn shard_counts() {
        let corpus = corpus();
        for order in NgramOrder::all() {
            let shards = order.shards(&corpus).collect::<Vec<_>>();
            let expected = if order.get() == 1 { 26 } else { 676 };
            assert_eq!(shards.len(), expected);
            assert_eq!(order.num_shards(), expected);
        }
    }

    #[test]
    fn shard_keys_and_urls() {
        let corpus = corpus();
        let unigrams = NgramOrder::new(1).unwrap().shards(&corpus).collect::<Vec<_>>();
        assert_eq!(&*unigrams[0].key, "a");
        assert_eq!(&*unigrams[25].key, "z");
        assert_eq!(
            &*unigrams[0].url,
            "http://storage.googleapis.com/books/ngrams/books/googlebooks-eng-all-1gram-20120701-a.gz"
        );

        let trigrams = NgramOrder::new(3).unwrap().shards(&corpus).collect::<Vec<_>>();
        assert_eq!(&*trigrams[0].key, "aa");
        assert_eq!(&*trigrams[1].key, "ab");
        assert_eq!(&*trigrams[26].key, "ba");
        assert_eq!(&*trigrams[675].key, "zz");
        assert!(trigrams[1].url.ends_with("googlebooks-eng-all-3gram-20120701-ab.gz"));
    }

    #[test]
    fn enumeration_is_deterministic() {
        let corpus = corpus();
        let order = NgramOrder::new(2).unwrap();
        let first = order.shards(&corpus).collect::<Vec<_>>();
        let second = order.shards(&corpus).collect::<Vec<_>>();
        assert_eq!(first, second);
    }

    #[test]
    fn order_validation() {
        assert!(NgramOrder::new(0).is_err());
        assert!(NgramOrder::new(6).is_err());
        assert_eq!("3gram".parse::<NgramOrder>().unwrap().get(), 3);
        assert_eq!("5".parse::<NgramOrder>().unwrap().get(), 5);
        assert!("7gram".parse::<NgramOrder>().is_err());
        assert_eq!(NgramOrder::new(4).unwrap().to_string(), "4gram");
    }
}

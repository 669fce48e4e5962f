//! Validation of individual dataset records

use super::codec::RawLine;
use crate::shards::NgramOrder;

/// Validated record from a data file
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Record<'line> {
    /// Ngram whose frequency is being studied, words separated by one space
    pub gram: &'line str,

    /// Number of matches recorded over one year
    pub match_count: u64,
}

/// Reasons why a data file line could be discarded
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RejectCause {
    /// Line exceeds the configured length limit
    Overlong,

    /// Line is not valid UTF-8 text
    NotUtf8,

    /// Line does not have the expected number of tab-separated columns
    MissingColumns,

    /// Match count column is not a non-negative integer
    BadMatchCount,

    /// Ngram does not have the number of words of the current ngram order
    WrongWordCount,

    /// Some word contains something else than ASCII letters
    NonWord,
}
//
impl RejectCause {
    /// Explanation for the logs
    fn describe(self) -> &'static str {
        match self {
            Self::Overlong => "it's too long",
            Self::NotUtf8 => "it's not valid UTF-8",
            Self::MissingColumns => "some columns are missing",
            Self::BadMatchCount => "its match count is invalid",
            Self::WrongWordCount => "it doesn't have the right number of words",
            Self::NonWord => "it's not made of words",
        }
    }
}

/// Parse and validate a `ngram<TAB>year<TAB>match_count<TAB>volume_count` line
///
/// Lines which are not well-formed records of purely alphabetic ngrams of the
/// expected order are rejected. This is routine at corpus scale and only
/// reported in trace logs.
pub fn parse_record(line: &str, order: NgramOrder) -> Option<Record<'_>> {
    let result = check_record(line, order);
    if let Err(cause) = result {
        log::trace!("Rejected {line:?} because {}", cause.describe());
    }
    result.ok()
}

/// Get the text of a line, if it is short enough and valid UTF-8
///
/// Like other malformed records, unreadable lines are only reported in trace
/// logs, and the rest of the data file remains usable.
pub fn line_text(line: &RawLine) -> Option<&str> {
    match line {
        RawLine::Complete(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(_) => {
                log::trace!(
                    "Rejected {:?} because {}",
                    String::from_utf8_lossy(bytes),
                    RejectCause::NotUtf8.describe()
                );
                None
            }
        },
        RawLine::Overlong { length } => {
            log::trace!(
                "Rejected a line of {length} bytes because {}",
                RejectCause::Overlong.describe()
            );
            None
        }
    }
}

/// Truth that an ngram has `order` words, each made of ASCII letters only,
/// separated by single spaces
pub fn is_clean_gram(gram: &str, order: NgramOrder) -> bool {
    check_gram(gram, order).is_ok()
}

/// Implementation of [`parse_record()`]
fn check_record(line: &str, order: NgramOrder) -> Result<Record<'_>, RejectCause> {
    let mut columns = line.split('\t');
    let (Some(gram), Some(_year), Some(match_count)) =
        (columns.next(), columns.next(), columns.next())
    else {
        return Err(RejectCause::MissingColumns);
    };
    let match_count = match_count
        .parse::<u64>()
        .map_err(|_| RejectCause::BadMatchCount)?;
    check_gram(gram, order)?;
    Ok(Record { gram, match_count })
}

/// Implementation of [`is_clean_gram()`]
fn check_gram(gram: &str, order: NgramOrder) -> Result<(), RejectCause> {
    let mut num_words = 0;
    for word in gram.split(' ') {
        if word.is_empty() || !word.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(RejectCause::NonWord);
        }
        num_words += 1;
        if num_words > order.get() {
            return Err(RejectCause::WrongWordCount);
        }
    }
    if num_words == order.get() {
        Ok(())
    } else {
        Err(RejectCause::WrongWordCount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(n: u8) -> NgramOrder {
        NgramOrder::new(n).unwrap()
    }

    #[test]
    fn accepts_alphabetic_ngrams() {
        assert_eq!(
            parse_record("the cat sat\t1999\t4821\t312", order(3)),
            Some(Record {
                gram: "the cat sat",
                match_count: 4821
            })
        );
        assert_eq!(
            parse_record("Hello\t2000\t0\t0", order(1)),
            Some(Record {
                gram: "Hello",
                match_count: 0
            })
        );
        // Extra columns are tolerated
        assert_eq!(
            parse_record("big dog\t2001\t7\t3\textra", order(2)).map(|r| r.match_count),
            Some(7)
        );
    }

    #[test]
    fn rejects_non_words() {
        assert_eq!(parse_record("cat99 ran\t1999\t10\t2", order(2)), None);
        assert_eq!(parse_record("don't stop\t1999\t10\t2", order(2)), None);
        assert_eq!(parse_record("cat_NOUN ran\t1999\t10\t2", order(2)), None);
        assert_eq!(parse_record("café noir\t1999\t10\t2", order(2)), None);
        assert_eq!(parse_record("\t1999\t10\t2", order(1)), None);
        assert_eq!(parse_record("", order(1)), None);
    }

    #[test]
    fn rejects_wrong_word_counts() {
        assert_eq!(parse_record("the cat\t1999\t10\t2", order(3)), None);
        assert_eq!(parse_record("the cat sat down\t1999\t10\t2", order(3)), None);
        // Double spaces produce an empty word
        assert_eq!(parse_record("the  cat\t1999\t10\t2", order(2)), None);
        assert_eq!(parse_record(" cat\t1999\t10\t2", order(1)), None);
    }

    #[test]
    fn rejects_bad_match_counts() {
        assert_eq!(parse_record("cat\t1999\t-3\t2", order(1)), None);
        assert_eq!(parse_record("cat\t1999\t1.5\t2", order(1)), None);
        assert_eq!(parse_record("cat\t1999\tNaN\t2", order(1)), None);
        assert_eq!(parse_record("cat\t1999", order(1)), None);
        assert_eq!(parse_record("cat", order(1)), None);
    }

    #[test]
    fn unreadable_lines_have_no_text() {
        use bytes::BytesMut;
        let line = RawLine::Complete(BytesMut::from(&b"cat\t1999\t3\t1"[..]));
        assert_eq!(line_text(&line), Some("cat\t1999\t3\t1"));
        let line = RawLine::Complete(BytesMut::from(&b"\xff\xfebad\t1999\t5\t1"[..]));
        assert_eq!(line_text(&line), None);
        assert_eq!(line_text(&RawLine::Overlong { length: 100_000 }), None);
    }

    #[test]
    fn gram_shape() {
        assert!(is_clean_gram("happy dog", order(2)));
        assert!(!is_clean_gram("happy dog", order(1)));
        assert!(!is_clean_gram("happy", order(2)));
        assert!(!is_clean_gram("happy d0g", order(2)));
        assert!(!is_clean_gram("", order(1)));
    }
}

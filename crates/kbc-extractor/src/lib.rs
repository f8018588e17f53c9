//! KBC Extractor - Built-in extraction functions
//!
//! In-process processing units for mention-level relation extraction:
//! - `clean_sentences`: token cleanup of preprocessed sentences
//! - `extract_people`: person mentions from NER tags
//! - `extract_candidates`: spouse relation candidates with distant supervision
//! - `extract_features`: features of each relation candidate

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use kbc_core::{Record, RecordFunction, Result};

pub mod candidates;
pub mod clean;
pub mod features;
pub mod people;

pub use candidates::{ExtractCandidates, Supervision};
pub use clean::CleanSentences;
pub use features::ExtractFeatures;
pub use people::ExtractPeople;

/// NER tag marking person tokens
pub const PERSON_TAG: &str = "PERSON";

/// A contiguous phrase referring to a person
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonMention {
    pub sentence_id: String,
    pub start_position: usize,
    pub length: usize,
    pub text: String,
    pub mention_id: String,
}

impl PersonMention {
    /// End position (exclusive)
    pub fn end_position(&self) -> usize {
        self.start_position + self.length
    }

    pub fn to_record(&self) -> Result<Record> {
        to_record(self)
    }
}

/// Find maximal runs of `tag` in a tagged sentence. Tokens past the
/// shorter of `words` and `ner_tags` are ignored.
pub fn find_mentions(
    sentence_id: &str,
    words: &[&str],
    ner_tags: &[&str],
    tag: &str,
) -> Vec<PersonMention> {
    let mut mentions = Vec::new();
    let mut start = None;

    let len = words.len().min(ner_tags.len());
    for i in 0..=len {
        let inside = i < len && ner_tags[i] == tag;
        match (start, inside) {
            (None, true) => start = Some(i),
            (Some(s), false) => {
                mentions.push(PersonMention {
                    sentence_id: sentence_id.to_string(),
                    start_position: s,
                    length: i - s,
                    text: words[s..i].join(" "),
                    mention_id: format!("{sentence_id}_{s}"),
                });
                start = None;
            }
            _ => {}
        }
    }

    mentions
}

/// Read the words and NER tags of a sentence record
pub(crate) fn tagged_sentence(record: &Record) -> Result<(&str, Vec<&str>, Vec<&str>)> {
    let sentence_id = record.require_str("sentence_id")?;
    let words = record.require_str_array("words")?;
    let ner_tags = record.require_str_array("ner_tags")?;

    if words.len() != ner_tags.len() {
        return Err(kbc_core::KbcError::record(format!(
            "sentence `{sentence_id}` has {} words but {} NER tags",
            words.len(),
            ner_tags.len()
        )));
    }

    Ok((sentence_id, words, ner_tags))
}

pub(crate) fn to_record<T: Serialize>(value: &T) -> Result<Record> {
    let value = serde_json::to_value(value)
        .map_err(|e| kbc_core::KbcError::record(format!("unencodable output: {e}")))?;
    Record::try_from(value)
}

/// Every built-in function, ready for registration
pub fn builtins() -> Vec<Arc<dyn RecordFunction>> {
    vec![
        Arc::new(CleanSentences::new()),
        Arc::new(ExtractPeople::new()),
        Arc::new(ExtractCandidates::new()),
        Arc::new(ExtractFeatures::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_mentions_maximal_runs() {
        let words = ["Barack", "Obama", "and", "Michelle", "Obama", "met", "Biden"];
        let tags = ["PERSON", "PERSON", "O", "PERSON", "PERSON", "O", "PERSON"];

        let mentions = find_mentions("s1", &words, &tags, PERSON_TAG);

        assert_eq!(mentions.len(), 3);
        assert_eq!(mentions[0].text, "Barack Obama");
        assert_eq!(mentions[1].mention_id, "s1_3");
        assert_eq!(mentions[1].end_position(), 5);
        assert_eq!(mentions[2].start_position, 6);
        assert_eq!(mentions[2].length, 1);
    }

    #[test]
    fn test_find_mentions_none() {
        assert!(find_mentions("s", &["a", "b"], &["O", "O"], PERSON_TAG).is_empty());
        assert!(find_mentions("s", &[], &[], PERSON_TAG).is_empty());
    }

    #[test]
    fn test_find_mentions_uneven_lengths() {
        let longer_tags = find_mentions("s", &["Ann"], &["PERSON", "PERSON"], PERSON_TAG);
        assert_eq!(longer_tags.len(), 1);
        assert_eq!(longer_tags[0].text, "Ann");
        assert_eq!(longer_tags[0].length, 1);

        let longer_words = find_mentions("s", &["Ann", "Lee", "x"], &["PERSON"], PERSON_TAG);
        assert_eq!(longer_words.len(), 1);
        assert_eq!(longer_words[0].text, "Ann");
    }

    #[test]
    fn test_builtin_names_are_unique() {
        let mut names: Vec<_> = builtins().iter().map(|f| f.name().to_string()).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }
}

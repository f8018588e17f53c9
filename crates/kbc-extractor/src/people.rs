//! Person mention extraction

use kbc_core::{Record, RecordFunction, Result};

use crate::{find_mentions, tagged_sentence, PERSON_TAG};

/// `extract_people` built-in
///
/// Emits one record per maximal run of person-tagged tokens:
/// `sentence_id`, `start_position`, `length`, `text`, `mention_id`.
#[derive(Debug, Clone)]
pub struct ExtractPeople {
    tag: String,
}

impl ExtractPeople {
    pub fn new() -> Self {
        Self {
            tag: PERSON_TAG.to_string(),
        }
    }

    /// Extract runs of a different NER tag
    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Default for ExtractPeople {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordFunction for ExtractPeople {
    fn apply(&self, record: &Record) -> Result<Vec<Record>> {
        let (sentence_id, words, tags) = tagged_sentence(record)?;

        find_mentions(sentence_id, &words, &tags, &self.tag)
            .iter()
            .map(|m| m.to_record())
            .collect()
    }

    fn name(&self) -> &str {
        "extract_people"
    }
}

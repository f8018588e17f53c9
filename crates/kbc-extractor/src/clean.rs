//! Sentence cleanup
//!
//! Trims every token and drops tokens that are empty after trimming,
//! together with their NER tag. Sentences left without words are dropped.

use serde_json::Value;

use kbc_core::{KbcError, Record, RecordFunction, Result};

/// `clean_sentences` built-in
#[derive(Debug, Default, Clone)]
pub struct CleanSentences;

impl CleanSentences {
    pub fn new() -> Self {
        Self
    }
}

impl RecordFunction for CleanSentences {
    fn apply(&self, record: &Record) -> Result<Vec<Record>> {
        let sentence_id = record.require_str("sentence_id")?;
        let words = record.require_str_array("words")?;
        let tags = record.optional_str_array("ner_tags")?;

        if let Some(tags) = &tags {
            if tags.len() != words.len() {
                return Err(KbcError::record(format!(
                    "sentence `{sentence_id}` has {} words but {} NER tags",
                    words.len(),
                    tags.len()
                )));
            }
        }

        let kept: Vec<usize> = words
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.trim().is_empty())
            .map(|(i, _)| i)
            .collect();

        if kept.is_empty() {
            return Ok(Vec::new());
        }

        let cleaned_words: Vec<Value> = kept.iter().map(|&i| words[i].trim().into()).collect();
        let cleaned_tags: Option<Vec<Value>> = tags
            .as_ref()
            .map(|tags| kept.iter().map(|&i| tags[i].trim().into()).collect());

        let mut out = record.clone();
        out.insert("words", cleaned_words);
        if let Some(tags) = cleaned_tags {
            out.insert("ner_tags", tags);
        }

        Ok(vec![out])
    }

    fn name(&self) -> &str {
        "clean_sentences"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sentence(value: Value) -> Record {
        Record::try_from(value).unwrap()
    }

    #[test]
    fn test_trims_and_drops_blank_tokens() {
        let input = sentence(json!({
            "sentence_id": "s1",
            "doc_id": "d1",
            "words": [" Barack", "", "Obama ", "  "],
            "ner_tags": ["PERSON", "O", "PERSON", "O"]
        }));

        let out = CleanSentences::new().apply(&input).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("words"), Some(&json!(["Barack", "Obama"])));
        assert_eq!(out[0].get("ner_tags"), Some(&json!(["PERSON", "PERSON"])));
        assert_eq!(out[0].get("doc_id"), Some(&json!("d1")));
    }

    #[test]
    fn test_empty_sentence_dropped() {
        let input = sentence(json!({"sentence_id": "s2", "words": [" ", ""]}));
        assert!(CleanSentences::new().apply(&input).unwrap().is_empty());
    }

    #[test]
    fn test_tag_mismatch_is_record_error() {
        let input = sentence(json!({
            "sentence_id": "s3",
            "words": ["a", "b"],
            "ner_tags": ["O"]
        }));
        let err = CleanSentences::new().apply(&input).unwrap_err();
        assert!(err.is_record_error());
    }

    #[test]
    fn test_missing_words_is_record_error() {
        let input = sentence(json!({"sentence_id": "s4"}));
        assert!(CleanSentences::new().apply(&input).unwrap_err().is_record_error());
    }
}

//! Candidate features
//!
//! Input records are relation candidates; output rows are
//! `{relation_id, feature}` pairs.

use serde::Serialize;

use kbc_core::{Record, RecordFunction, Result};

use crate::to_record;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct FeatureRow<'a> {
    relation_id: &'a str,
    feature: String,
}

/// `extract_features` built-in
#[derive(Debug, Default, Clone)]
pub struct ExtractFeatures;

impl ExtractFeatures {
    pub fn new() -> Self {
        Self
    }

    /// Feature strings for one candidate
    pub fn features(person1: &str, person2: &str, words_between: &[&str]) -> Vec<String> {
        let mut features = Vec::new();

        for word in words_between {
            let feature = format!("word_between={}", word.to_lowercase());
            if !features.contains(&feature) {
                features.push(feature);
            }
        }
        features.push(format!("num_words_between={}", words_between.len()));

        let last1 = person1.split_whitespace().last();
        let last2 = person2.split_whitespace().last();
        if person1.split_whitespace().count() > 1 && last1.is_some() && last1 == last2 {
            features.push("potential_last_name_match".to_string());
        }

        features
    }
}

impl RecordFunction for ExtractFeatures {
    fn apply(&self, record: &Record) -> Result<Vec<Record>> {
        let relation_id = record.require_str("relation_id")?;
        let person1 = record.require_str("person1_text")?;
        let person2 = record.require_str("person2_text")?;
        let between = record.require_str_array("words_between")?;

        Self::features(person1, person2, &between)
            .into_iter()
            .map(|feature| to_record(&FeatureRow { relation_id, feature }))
            .collect()
    }

    fn name(&self) -> &str {
        "extract_features"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_features() {
        let features = ExtractFeatures::features(
            "Barack Obama",
            "Michelle Obama",
            &["and", "wife", "And"],
        );
        assert_eq!(
            features,
            vec![
                "word_between=and",
                "word_between=wife",
                "num_words_between=3",
                "potential_last_name_match",
            ]
        );
    }

    #[test]
    fn test_single_token_names_do_not_match() {
        let features = ExtractFeatures::features("Obama", "Obama", &[]);
        assert_eq!(features, vec!["num_words_between=0"]);
    }

    #[test]
    fn test_apply_on_candidate() {
        let candidate = Record::try_from(json!({
            "relation_id": "s1_0-s1_2",
            "person1_text": "Alice",
            "person2_text": "Bob",
            "words_between": ["met"],
            "is_true": null
        }))
        .unwrap();

        let rows = ExtractFeatures::new().apply(&candidate).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("relation_id"), Some(&json!("s1_0-s1_2")));
        assert_eq!(rows[0].get("feature"), Some(&json!("word_between=met")));
        assert_eq!(rows[1].get("feature"), Some(&json!("num_words_between=1")));
    }

    #[test]
    fn test_missing_field_is_record_error() {
        let candidate = Record::try_from(json!({"relation_id": "r"})).unwrap();
        assert!(ExtractFeatures::new().apply(&candidate).unwrap_err().is_record_error());
    }
}

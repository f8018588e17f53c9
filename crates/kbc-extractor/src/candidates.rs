//! Spouse relation candidates
//!
//! Every ordered pair of distinct person mentions in a sentence becomes a
//! candidate. Distant supervision labels it from the words between the two
//! mentions; candidates with no signal stay `Unknown` for inference.

use regex::Regex;
use serde::Serialize;

use kbc_core::{ConfigError, KbcError, Label, Record, RecordFunction, Result};

use crate::{find_mentions, tagged_sentence, to_record, PersonMention, PERSON_TAG};

// ============================================================================
// Supervision
// ============================================================================

const SPOUSE_WORDS: &[&str] = &["wife", "husband", "married", "spouse", "wed"];
const FAMILY_WORDS: &[&str] = &[
    "brother", "sister", "father", "mother", "son", "daughter", "cousin",
];

/// Keyword rules for distant supervision
#[derive(Debug, Clone)]
pub struct Supervision {
    positive: Option<Regex>,
    negative: Option<Regex>,
}

impl Supervision {
    /// Build rules from word lists
    pub fn new(positive: &[&str], negative: &[&str]) -> Result<Self> {
        Ok(Self {
            positive: Some(word_pattern(positive)?),
            negative: Some(word_pattern(negative)?),
        })
    }

    /// Label a candidate from its mentions and the words between them
    pub fn label(&self, first: &str, second: &str, words_between: &[&str]) -> Label {
        if first.eq_ignore_ascii_case(second) {
            return Label::False;
        }

        let between = words_between.join(" ");
        let matches = |rule: &Option<Regex>| rule.as_ref().is_some_and(|r| r.is_match(&between));

        if matches(&self.negative) {
            Label::False
        } else if matches(&self.positive) {
            Label::True
        } else {
            Label::Unknown
        }
    }
}

impl Default for Supervision {
    fn default() -> Self {
        Self {
            positive: word_pattern(SPOUSE_WORDS).ok(),
            negative: word_pattern(FAMILY_WORDS).ok(),
        }
    }
}

fn word_pattern(words: &[&str]) -> Result<Regex> {
    let alternatives: Vec<String> = words.iter().map(|w| regex::escape(w)).collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))
        .map_err(|e| {
            KbcError::Config(ConfigError::InvalidValue {
                key: "supervision".to_string(),
                value: e.to_string(),
            })
        })
}

// ============================================================================
// Candidate extraction
// ============================================================================

/// A candidate pair of person mentions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpouseCandidate {
    pub relation_id: String,
    pub sentence_id: String,
    pub person1_id: String,
    pub person2_id: String,
    pub person1_text: String,
    pub person2_text: String,
    pub description: String,
    pub words_between: Vec<String>,
    pub is_true: Label,
}

/// `extract_candidates` built-in
#[derive(Debug, Clone, Default)]
pub struct ExtractCandidates {
    supervision: Supervision,
}

impl ExtractCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_supervision(supervision: Supervision) -> Self {
        Self { supervision }
    }

    /// Candidates of one sentence, in mention order
    pub fn candidates(
        &self,
        sentence_id: &str,
        words: &[&str],
        tags: &[&str],
    ) -> Vec<SpouseCandidate> {
        let mentions = find_mentions(sentence_id, words, tags, PERSON_TAG);
        let mut out = Vec::new();

        for p1 in &mentions {
            for p2 in &mentions {
                if p1.mention_id == p2.mention_id {
                    continue;
                }
                out.push(self.candidate(sentence_id, words, p1, p2));
            }
        }

        out
    }

    fn candidate(
        &self,
        sentence_id: &str,
        words: &[&str],
        p1: &PersonMention,
        p2: &PersonMention,
    ) -> SpouseCandidate {
        let (left, right) = if p1.start_position < p2.start_position {
            (p1, p2)
        } else {
            (p2, p1)
        };
        let between = &words[left.end_position()..right.start_position];

        SpouseCandidate {
            relation_id: format!("{}-{}", p1.mention_id, p2.mention_id),
            sentence_id: sentence_id.to_string(),
            person1_id: p1.mention_id.clone(),
            person2_id: p2.mention_id.clone(),
            person1_text: p1.text.clone(),
            person2_text: p2.text.clone(),
            description: format!("{}-{}", p1.text, p2.text),
            words_between: between.iter().map(|w| w.to_string()).collect(),
            is_true: self.supervision.label(&p1.text, &p2.text, between),
        }
    }
}

impl RecordFunction for ExtractCandidates {
    fn apply(&self, record: &Record) -> Result<Vec<Record>> {
        let (sentence_id, words, tags) = tagged_sentence(record)?;

        self.candidates(sentence_id, &words, &tags)
            .iter()
            .map(to_record)
            .collect()
    }

    fn name(&self) -> &str {
        "extract_candidates"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tagged(words: &'static str, tags: &'static str) -> (Vec<&'static str>, Vec<&'static str>) {
        (words.split(' ').collect(), tags.split(' ').collect())
    }

    #[test]
    fn test_positive_supervision() {
        let (words, tags) = tagged(
            "Barack Obama and his wife Michelle",
            "PERSON PERSON O O O PERSON",
        );
        let candidates = ExtractCandidates::new().candidates("s1", &words, &tags);

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].relation_id, "s1_0-s1_5");
        assert_eq!(candidates[0].words_between, vec!["and", "his", "wife"]);
        assert_eq!(candidates[0].is_true, Label::True);
        assert_eq!(candidates[1].person1_text, "Michelle");
        assert_eq!(candidates[1].words_between, vec!["and", "his", "wife"]);
    }

    #[test]
    fn test_negative_and_unknown() {
        let s = Supervision::default();
        assert_eq!(s.label("A", "B", &["and", "her", "brother"]), Label::False);
        assert_eq!(s.label("A", "B", &["met"]), Label::Unknown);
        assert_eq!(s.label("Obama", "obama", &["wife"]), Label::False);
        assert_eq!(s.label("A", "B", &["Married"]), Label::True);
        assert_eq!(s.label("A", "B", &["sonnet"]), Label::Unknown);
    }

    #[test]
    fn test_custom_supervision() {
        let s = Supervision::new(&["partner"], &["boss"]).unwrap();
        assert_eq!(s.label("A", "B", &["partner"]), Label::True);
        assert_eq!(s.label("A", "B", &["wife"]), Label::Unknown);
    }

    #[test]
    fn test_unknown_label_is_null() {
        let input = Record::try_from(json!({
            "sentence_id": "s2",
            "words": ["Alice", "met", "Bob"],
            "ner_tags": ["PERSON", "O", "PERSON"]
        }))
        .unwrap();

        let out = ExtractCandidates::new().apply(&input).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get("is_true"), Some(&json!(null)));
        assert_eq!(out[0].get("description"), Some(&json!("Alice-Bob")));
        assert_eq!(out[1].get("person1_id"), Some(&json!("s2_2")));
    }

    #[test]
    fn test_single_person_has_no_candidates() {
        let input = Record::try_from(json!({
            "sentence_id": "s3",
            "words": ["Alice", "slept"],
            "ner_tags": ["PERSON", "O"]
        }))
        .unwrap();
        assert!(ExtractCandidates::new().apply(&input).unwrap().is_empty());
    }
}

//! Ordered rule tables compiled from configuration.
//!
//! Tables are plain data in [`crate::config`]; this module compiles them once
//! at component construction. Evaluation order is the table order and the
//! first matching row wins. A pattern that fails to compile is a
//! [`ConfigError::InvalidPattern`], never a silently skipped row.

use regex::Regex;

use crate::config::{PatternRule, WeightedPhrase};
use crate::error::ConfigError;
use crate::text;

/// Query text in both canonical forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedText {
    pub normalized: String,
    pub squeezed: String,
    word_starts: Vec<usize>,
    word_ends: Vec<usize>,
}

impl NormalizedText {
    pub fn new(raw: &str) -> Self {
        let normalized = text::normalize(raw);
        let squeezed = text::squeeze(&normalized);
        let (word_starts, word_ends) = text::squeezed_word_bounds(&normalized);
        Self {
            normalized,
            squeezed,
            word_starts,
            word_ends,
        }
    }

    /// Whether `regex` matches the squeezed form on whole-word boundaries.
    ///
    /// "my incomplete code" squeezes to `myincompletecode`; the `completecode`
    /// hit starts inside a word and is ignored.
    pub fn squeezed_match(&self, regex: &Regex) -> bool {
        regex.find_iter(&self.squeezed).any(|m| {
            self.word_starts.binary_search(&m.start()).is_ok()
                && self.word_ends.binary_search(&m.end()).is_ok()
        })
    }
}

/// Compile one pattern, case-insensitively, attributing failures to `table`.
pub fn compile_pattern(table: &str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(&format!("(?i){pattern}")).map_err(|e| ConfigError::InvalidPattern {
        table: table.to_string(),
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Clone)]
struct CompiledRule {
    label: String,
    regex: Regex,
    match_squeezed: bool,
}

/// An ordered `{pattern, label}` table with first-match semantics.
#[derive(Debug, Clone)]
pub struct RuleTable {
    name: String,
    rules: Vec<CompiledRule>,
}

impl RuleTable {
    pub fn compile(name: &str, rules: &[PatternRule]) -> Result<Self, ConfigError> {
        let rules = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    label: rule.label.clone(),
                    regex: compile_pattern(name, &rule.pattern)?,
                    match_squeezed: rule.match_squeezed,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self {
            name: name.to_string(),
            rules,
        })
    }

    /// Label of the first rule matching either form of the text.
    pub fn first_match(&self, text: &NormalizedText) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| {
                rule.regex.is_match(&text.normalized)
                    || (rule.match_squeezed && text.squeezed_match(&rule.regex))
            })
            .map(|rule| rule.label.as_str())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// A set of patterns belonging to one signal; counts how many fire.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

impl PatternSet {
    pub fn compile(table: &str, patterns: &[String]) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| compile_pattern(table, p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Number of distinct patterns that match.
    pub fn match_count(&self, text: &str) -> usize {
        self.patterns.iter().filter(|p| p.is_match(text)).count()
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Weighted phrase table; each phrase contributes its weight once.
#[derive(Debug, Clone)]
pub struct PhraseScorer {
    phrases: Vec<(Regex, f64)>,
}

impl PhraseScorer {
    /// Phrases are matched literally on word boundaries of normalised text.
    pub fn compile(table: &str, phrases: &[WeightedPhrase]) -> Result<Self, ConfigError> {
        let phrases = phrases
            .iter()
            .map(|p| {
                let literal = regex::escape(&text::normalize(&p.phrase));
                Ok((compile_pattern(table, &format!(r"\b{literal}\b"))?, p.weight))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { phrases })
    }

    /// Sum of matched weights, clamped to [0, 1].
    pub fn score(&self, normalized: &str) -> f64 {
        let total: f64 = self
            .phrases
            .iter()
            .filter(|(re, _)| re.is_match(normalized))
            .map(|(_, w)| w.max(0.0))
            .sum();
        total.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RuleTable {
        RuleTable::compile(
            "test",
            &[
                PatternRule::new("first", r"\bfull solution\b"),
                PatternRule::new("second", r"\bsolution\b"),
                PatternRule::squeezed("squeezed", r"answerkey"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_first_match_wins() {
        let t = table();
        assert_eq!(
            t.first_match(&NormalizedText::new("the FULL solution please")),
            Some("first")
        );
        assert_eq!(
            t.first_match(&NormalizedText::new("a solution")),
            Some("second")
        );
        assert_eq!(t.first_match(&NormalizedText::new("hello")), None);
    }

    #[test]
    fn test_squeezed_form_only_when_opted_in() {
        let t = table();
        assert_eq!(
            t.first_match(&NormalizedText::new("the a-n-s-w-e-r k.e.y")),
            Some("squeezed")
        );
        // "s o l u t i o n" squeezes to "solution" but those rules do not opt in.
        assert_eq!(t.first_match(&NormalizedText::new("s o l u t i o n")), None);
    }

    #[test]
    fn test_squeezed_match_needs_word_boundaries() {
        let t = table();
        // Hits that start or end inside a word are not obfuscation.
        assert_eq!(t.first_match(&NormalizedText::new("the chanswer key")), None);
        assert_eq!(t.first_match(&NormalizedText::new("answer keys")), None);
        assert_eq!(
            t.first_match(&NormalizedText::new("the answer_key")),
            Some("squeezed")
        );
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = RuleTable::compile("integrity", &[PatternRule::new("bad", "(unclosed")])
            .unwrap_err();
        match err {
            ConfigError::InvalidPattern { table, pattern, .. } => {
                assert_eq!(table, "integrity");
                assert_eq!(pattern, "(unclosed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pattern_set_counts_distinct_patterns() {
        let set = PatternSet::compile(
            "code",
            &[r"\bpython\b".to_string(), r"\bnumpy\b".to_string()],
        )
        .unwrap();
        assert_eq!(set.match_count("python python"), 1);
        assert_eq!(set.match_count("numpy in python"), 2);
        assert!(!set.is_match("java"));
    }

    #[test]
    fn test_phrase_scorer_clamps_and_counts_once() {
        let scorer = PhraseScorer::compile(
            "confusion",
            &[
                WeightedPhrase::new("confused", 0.5),
                WeightedPhrase::new("still lost", 0.8),
            ],
        )
        .unwrap();
        assert!((scorer.score("confused confused") - 0.5).abs() < 1e-9);
        assert!((scorer.score("still lost and confused") - 1.0).abs() < 1e-9);
        assert_eq!(scorer.score("all good"), 0.0);
    }

    #[test]
    fn test_phrase_scorer_word_boundaries() {
        let scorer =
            PhraseScorer::compile("confusion", &[WeightedPhrase::new("lost", 0.3)]).unwrap();
        assert_eq!(scorer.score("the loss function"), 0.0);
        assert!(scorer.score("i'm lost") > 0.0);
    }
}

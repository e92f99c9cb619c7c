//! Scaffolding selection: how much instructional support a turn gets.
//!
//! The confusion score comes from a weighted distress-phrase table; the level
//! comes from a decision table over (confusion, prior mastery), evaluated
//! high-confusion first so a struggling signal always outweighs historical
//! mastery for that turn.

use std::collections::HashMap;

use crate::config::ScaffoldingConfig;
use crate::error::ConfigError;
use crate::rules::PhraseScorer;
use crate::text;
use crate::types::ScaffoldingLevel;

/// Scores textual evidence that a learner is struggling.
#[derive(Debug, Clone)]
pub struct ConfusionDetector {
    scorer: PhraseScorer,
    repeat_boost: f64,
}

impl ConfusionDetector {
    pub fn new(config: &ScaffoldingConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            scorer: PhraseScorer::compile("confusion", &config.confusion_phrases)?,
            repeat_boost: config.repeat_confusion_boost,
        })
    }

    /// Confusion score of already-normalised text, in [0, 1].
    pub fn score(&self, normalized: &str) -> f64 {
        self.scorer.score(normalized)
    }

    /// Score of the current turn, raised when the previous user turn was also
    /// confused. A calm turn stays at zero regardless of history.
    pub fn score_turn(&self, normalized: &str, previous_user_turn: Option<&str>) -> f64 {
        let current = self.score(normalized);
        if current <= 0.0 {
            return current;
        }
        let repeated = previous_user_turn
            .map(|prev| self.score(&text::normalize(prev)) > 0.0)
            .unwrap_or(false);
        if repeated {
            (current + self.repeat_boost).clamp(0.0, 1.0)
        } else {
            current
        }
    }
}

/// The scaffolding decision table.
#[derive(Debug, Clone)]
pub struct ScaffoldingSelector {
    demonstrated_threshold: f64,
    explained_threshold: f64,
    low_mastery: f64,
    high_mastery: f64,
    unknown_mastery: f64,
}

impl ScaffoldingSelector {
    pub fn new(config: &ScaffoldingConfig) -> Self {
        Self {
            demonstrated_threshold: config.demonstrated_threshold,
            explained_threshold: config.explained_threshold,
            low_mastery: config.low_mastery,
            high_mastery: config.high_mastery,
            unknown_mastery: config.unknown_mastery,
        }
    }

    /// First matching row wins:
    ///
    /// | confusion            | mastery      | level          |
    /// |----------------------|--------------|----------------|
    /// | >= demonstrated      | any          | `demonstrated` |
    /// | >= explained         | any          | `explained`    |
    /// | below explained      | < low        | `explained`    |
    /// | below explained      | >= high      | `hint`         |
    /// | otherwise            |              | `guided`       |
    pub fn select(&self, confusion: f64, prior_mastery: f64) -> ScaffoldingLevel {
        let confusion = if confusion.is_nan() { 0.0 } else { confusion };
        let mastery = if prior_mastery.is_nan() {
            0.0
        } else {
            prior_mastery
        };

        if confusion >= self.demonstrated_threshold {
            ScaffoldingLevel::Demonstrated
        } else if confusion >= self.explained_threshold {
            ScaffoldingLevel::Explained
        } else if mastery < self.low_mastery {
            ScaffoldingLevel::Explained
        } else if mastery >= self.high_mastery {
            ScaffoldingLevel::Hint
        } else {
            ScaffoldingLevel::Guided
        }
    }

    /// Prior mastery for a turn: the weakest detected concept, a missing
    /// record counting as 0.0; `unknown_mastery` when no concept was detected.
    pub fn prior_mastery(&self, concepts: &[String], snapshot: &HashMap<String, f64>) -> f64 {
        concepts
            .iter()
            .map(|c| snapshot.get(c).copied().unwrap_or(0.0))
            .reduce(f64::min)
            .unwrap_or(self.unknown_mastery)
    }
}

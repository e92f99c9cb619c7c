//! Post-hoc evaluation of a completed (or partial) response.
//!
//! Produces a quality score, the misconceptions found in the learner's
//! message, the performance signal, and the next mastery record for every
//! concept the turn touched. Evaluation is pure; the pipeline persists the
//! resulting records.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{EvaluatorConfig, ScaffoldingConfig};
use crate::error::ConfigError;
use crate::rules::{PatternSet, compile_pattern};
use crate::text;
use crate::types::{MasteryRecord, PerformanceSignal, ScaffoldingLevel};

/// A misconception detected in the learner's message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Misconception {
    pub id: String,
    pub concept: Option<String>,
    pub description: String,
}

/// Per-criterion breakdown of the quality score, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityBreakdown {
    pub non_empty: f64,
    pub grounding: f64,
    pub depth_fit: f64,
    pub completeness: f64,
}

impl QualityBreakdown {
    pub fn score(&self) -> f64 {
        let sum = self.non_empty + self.grounding + self.depth_fit + self.completeness;
        (sum / 4.0).clamp(0.0, 1.0)
    }
}

/// Mastery change for one concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryUpdate {
    pub concept: String,
    /// Score before this interaction; `None` when the record is new.
    pub previous: Option<f64>,
    pub record: MasteryRecord,
}

impl MasteryUpdate {
    pub fn delta(&self) -> f64 {
        self.record.score - self.previous.unwrap_or(0.0)
    }
}

/// What the evaluator looks at.
#[derive(Debug, Clone)]
pub struct EvaluationInput<'a> {
    pub user_id: &'a str,
    pub query: &'a str,
    /// Confusion score computed for this turn.
    pub confusion: f64,
    pub concepts: &'a [String],
    pub scaffolding: Option<ScaffoldingLevel>,
    pub response_text: &'a str,
    pub citations: &'a [String],
    pub requires_retrieval: bool,
    pub max_words: Option<usize>,
    pub cancelled: bool,
    pub incomplete: bool,
    pub budget_exhausted: bool,
}

/// Evaluator output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub quality_score: f64,
    pub quality: QualityBreakdown,
    pub signal: PerformanceSignal,
    pub misconceptions: Vec<Misconception>,
    pub mastery_updates: Vec<MasteryUpdate>,
}

#[derive(Debug, Clone)]
struct CompiledMisconception {
    id: String,
    concept: Option<String>,
    description: String,
    pattern: Regex,
}

pub struct Evaluator {
    misconceptions: Vec<CompiledMisconception>,
    understanding: PatternSet,
    decay_factor: f64,
    outcome_weight: f64,
    confusion_threshold: f64,
}

impl Evaluator {
    pub fn new(config: &EvaluatorConfig, scaffolding: &ScaffoldingConfig) -> Result<Self, ConfigError> {
        let misconceptions = config
            .misconceptions
            .iter()
            .map(|rule| {
                Ok(CompiledMisconception {
                    id: rule.id.clone(),
                    concept: rule.concept.clone(),
                    description: rule.description.clone(),
                    pattern: compile_pattern("evaluator.misconceptions", &rule.pattern)?,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let understanding: Vec<String> = config
            .understanding_phrases
            .iter()
            .map(|p| format!(r"\b{}\b", regex::escape(&text::normalize(p))))
            .collect();

        Ok(Self {
            misconceptions,
            understanding: PatternSet::compile("evaluator.understanding", &understanding)?,
            decay_factor: config.decay_factor.clamp(0.0, 1.0),
            outcome_weight: config.outcome_weight.max(0.0),
            confusion_threshold: scaffolding.explained_threshold,
        })
    }

    pub fn decay_factor(&self) -> f64 {
        self.decay_factor
    }

    /// Misconceptions stated in already-normalised text, in table order.
    pub fn detect_misconceptions(&self, normalized: &str) -> Vec<Misconception> {
        self.misconceptions
            .iter()
            .filter(|m| m.pattern.is_match(normalized))
            .map(|m| Misconception {
                id: m.id.clone(),
                concept: m.concept.clone(),
                description: m.description.clone(),
            })
            .collect()
    }

    /// Confusion (or any misconception) beats understanding; neither is passive.
    pub fn performance_signal(
        &self,
        normalized: &str,
        confusion: f64,
        misconceptions: &[Misconception],
    ) -> PerformanceSignal {
        if confusion >= self.confusion_threshold || !misconceptions.is_empty() {
            PerformanceSignal::Confusion
        } else if self.understanding.is_match(normalized) {
            PerformanceSignal::Understanding
        } else {
            PerformanceSignal::Passive
        }
    }

    /// `clamp(old * decay + weight * signal, 0, 1)`.
    pub fn updated_score(&self, old: f64, decay: f64, signal: PerformanceSignal) -> f64 {
        let old = if old.is_nan() { 0.0 } else { old };
        (old * decay + self.outcome_weight * signal.value()).clamp(0.0, 1.0)
    }

    /// Next record for `concept`, starting from 0.0 when there is none.
    pub fn next_record(
        &self,
        user_id: &str,
        concept: &str,
        prior: Option<&MasteryRecord>,
        signal: PerformanceSignal,
        now: DateTime<Utc>,
    ) -> MasteryUpdate {
        let (previous, decay) = match prior {
            Some(record) => (Some(record.score), record.decay_factor),
            None => (None, self.decay_factor),
        };
        MasteryUpdate {
            concept: concept.to_string(),
            previous,
            record: MasteryRecord {
                user_id: user_id.to_string(),
                concept: concept.to_string(),
                score: self.updated_score(previous.unwrap_or(0.0), decay, signal),
                decay_factor: decay,
                last_assessed: now,
            },
        }
    }

    pub fn quality(&self, input: &EvaluationInput<'_>) -> QualityBreakdown {
        let words = text::word_count(input.response_text);
        let non_empty = if words > 0 { 1.0 } else { 0.0 };
        let grounding = if !input.requires_retrieval || !input.citations.is_empty() {
            1.0
        } else {
            0.0
        };
        let completeness = if input.cancelled || input.incomplete {
            0.0
        } else if input.budget_exhausted {
            0.5
        } else {
            1.0
        };
        QualityBreakdown {
            non_empty,
            grounding,
            depth_fit: depth_fit(words, input.scaffolding, input.max_words),
            completeness,
        }
    }

    /// Evaluate one turn. `prior` looks up the mastery snapshot captured at
    /// the start of the request.
    pub fn evaluate<'s>(
        &self,
        input: &EvaluationInput<'_>,
        prior: impl Fn(&str) -> Option<&'s MasteryRecord>,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let normalized = text::normalize(input.query);
        let misconceptions = self.detect_misconceptions(&normalized);
        let signal = self.performance_signal(&normalized, input.confusion, &misconceptions);
        let quality = self.quality(input);

        let mut concepts: Vec<&str> = input.concepts.iter().map(String::as_str).collect();
        for m in &misconceptions {
            if let Some(c) = m.concept.as_deref() {
                if !concepts.contains(&c) {
                    concepts.push(c);
                }
            }
        }
        let mastery_updates = concepts
            .into_iter()
            .map(|concept| self.next_record(input.user_id, concept, prior(concept), signal, now))
            .collect();

        Evaluation {
            quality_score: quality.score(),
            quality,
            signal,
            misconceptions,
            mastery_updates,
        }
    }
}

/// Word range that fits each scaffolding level.
fn expected_words(level: ScaffoldingLevel) -> (usize, usize) {
    match level {
        ScaffoldingLevel::Hint => (5, 120),
        ScaffoldingLevel::Guided => (20, 250),
        ScaffoldingLevel::Explained => (60, 500),
        ScaffoldingLevel::Demonstrated => (100, 900),
    }
}

fn depth_fit(words: usize, level: Option<ScaffoldingLevel>, max_words: Option<usize>) -> f64 {
    if words == 0 {
        return 0.0;
    }
    let (low, high) = match (level, max_words) {
        (Some(level), _) => expected_words(level),
        (None, Some(max)) => (1, max.max(1)),
        (None, None) => (3, 600),
    };
    if words < low {
        words as f64 / low as f64
    } else if words > high {
        high as f64 / words as f64
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn evaluator() -> Evaluator {
        Evaluator::new(&EvaluatorConfig::default(), &ScaffoldingConfig::default()).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap()
    }

    fn record(concept: &str, score: f64, decay: f64) -> MasteryRecord {
        MasteryRecord {
            user_id: "u1".into(),
            concept: concept.into(),
            score,
            decay_factor: decay,
            last_assessed: now(),
        }
    }

    fn input<'a>(query: &'a str, text: &'a str, concepts: &'a [String], citations: &'a [String]) -> EvaluationInput<'a> {
        EvaluationInput {
            user_id: "u1",
            query,
            confusion: 0.0,
            concepts,
            scaffolding: Some(ScaffoldingLevel::Guided),
            response_text: text,
            citations,
            requires_retrieval: true,
            max_words: None,
            cancelled: false,
            incomplete: false,
            budget_exhausted: false,
        }
    }

    #[test]
    fn test_update_formula() {
        let e = evaluator();
        let s = e.updated_score(0.5, 0.9, PerformanceSignal::Understanding);
        assert!((s - 0.55).abs() < 1e-9);
        let s = e.updated_score(0.5, 0.9, PerformanceSignal::Confusion);
        assert!((s - 0.45).abs() < 1e-9);
        assert_eq!(e.updated_score(1.0, 1.0, PerformanceSignal::Understanding), 1.0);
        assert_eq!(e.updated_score(f64::NAN, 0.9, PerformanceSignal::Confusion), 0.0);
    }

    #[test]
    fn test_zero_signal_never_increases() {
        let e = evaluator();
        let mut score = 0.93;
        for _ in 0..50 {
            let next = e.updated_score(score, 0.9, PerformanceSignal::Confusion);
            assert!(next < score || (next == 0.0 && score == 0.0));
            score = next;
        }
    }

    #[test]
    fn test_new_record_starts_from_zero_with_config_decay() {
        let e = evaluator();
        let update = e.next_record("u1", "overfitting", None, PerformanceSignal::Passive, now());
        assert_eq!(update.previous, None);
        assert!((update.record.score - 0.05).abs() < 1e-9);
        assert_eq!(update.record.decay_factor, 0.9);
        assert!((update.delta() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_existing_record_keeps_its_decay() {
        let e = evaluator();
        let prior = record("overfitting", 0.8, 0.5);
        let update = e.next_record("u1", "overfitting", Some(&prior), PerformanceSignal::Confusion, now());
        assert!((update.record.score - 0.4).abs() < 1e-9);
        assert_eq!(update.record.decay_factor, 0.5);
        assert!((update.delta() + 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_detect_misconceptions() {
        let e = evaluator();
        let found = e.detect_misconceptions(&text::normalize(
            "So gradient descent always finds the global minimum, right?",
        ));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "gd_global_minimum");
        assert_eq!(found[0].concept.as_deref(), Some("gradient_descent"));

        let found = e.detect_misconceptions(&text::normalize("Correlation implies causation here"));
        assert_eq!(found[0].id, "correlation_causation");
        assert!(found[0].concept.is_none());

        assert!(e.detect_misconceptions("what is a learning rate").is_empty());
    }

    #[test]
    fn test_performance_signal() {
        let e = evaluator();
        assert_eq!(e.performance_signal("got it, thanks", 0.0, &[]), PerformanceSignal::Understanding);
        assert_eq!(e.performance_signal("got it but i'm confused", 0.5, &[]), PerformanceSignal::Confusion);
        assert_eq!(e.performance_signal("what is bias", 0.3, &[]), PerformanceSignal::Passive);
        let m = Misconception {
            id: "x".into(),
            concept: None,
            description: String::new(),
        };
        assert_eq!(e.performance_signal("got it", 0.0, &[m]), PerformanceSignal::Confusion);
    }

    #[test]
    fn test_quality_full_marks() {
        let e = evaluator();
        let concepts: Vec<String> = vec![];
        let citations = vec!["lec3".to_string()];
        let answer = "word ".repeat(40);
        let q = e.quality(&input("q", &answer, &concepts, &citations));
        assert_eq!(q.score(), 1.0);
    }

    #[test]
    fn test_quality_penalties() {
        let e = evaluator();
        let concepts: Vec<String> = vec![];
        let answer = "word ".repeat(40);

        // Uncited answer that needed retrieval.
        let q = e.quality(&input("q", &answer, &concepts, &[]));
        assert_eq!(q.grounding, 0.0);
        assert!((q.score() - 0.75).abs() < 1e-9);

        // Cancelled partial answer.
        let citations = vec!["lec3".to_string()];
        let mut partial = input("q", "word word", &concepts, &citations);
        partial.cancelled = true;
        let q = e.quality(&partial);
        assert_eq!(q.completeness, 0.0);
        assert!((q.depth_fit - 0.1).abs() < 1e-9);

        // Empty output scores zero on content criteria.
        let q = e.quality(&input("q", "", &concepts, &citations));
        assert_eq!(q.non_empty, 0.0);
        assert_eq!(q.depth_fit, 0.0);
    }

    #[test]
    fn test_quality_budget_exhausted_is_half_complete() {
        let e = evaluator();
        let concepts: Vec<String> = vec![];
        let citations = vec!["lec3".to_string()];
        let answer = "word ".repeat(40);
        let mut i = input("q", &answer, &concepts, &citations);
        i.budget_exhausted = true;
        assert_eq!(e.quality(&i).completeness, 0.5);
    }

    #[test]
    fn test_evaluate_updates_detected_and_misconception_concepts() {
        let e = evaluator();
        let concepts = vec!["overfitting".to_string()];
        let citations = vec!["lec5".to_string()];
        let snapshot = [record("overfitting", 0.6, 0.9)];
        let query = "I think more data causes overfitting and gradient descent always finds the global minimum";
        let answer = "word ".repeat(30);

        let eval = e.evaluate(
            &input(query, &answer, &concepts, &citations),
            |c| snapshot.iter().find(|r| r.concept == c),
            now(),
        );

        assert_eq!(eval.signal, PerformanceSignal::Confusion);
        let ids: Vec<&str> = eval.misconceptions.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["gd_global_minimum", "more_data_overfits"]);
        let updated: Vec<&str> = eval.mastery_updates.iter().map(|u| u.concept.as_str()).collect();
        assert_eq!(updated, vec!["overfitting", "gradient_descent"]);
        assert!((eval.mastery_updates[0].record.score - 0.54).abs() < 1e-9);
        assert_eq!(eval.mastery_updates[1].previous, None);
        assert_eq!(eval.mastery_updates[1].record.score, 0.0);
        assert!((0.0..=1.0).contains(&eval.quality_score));
    }
}

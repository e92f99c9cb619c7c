//! Configuration system for Lectern.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/lectern/config.toml` and/or `.lectern/config.toml`
//! in the workspace directory.
//!
//! Every threshold and rule table the pipeline consults lives here as data, so
//! deployments can retune them without recompiling and tests can inject
//! alternate tables through plain struct construction.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{Intent, ResponderKind, ResponseProfile};

/// Top-level configuration for the Lectern pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LecternConfig {
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub scaffolding: ScaffoldingConfig,
    #[serde(default)]
    pub concepts: ConceptsConfig,
    #[serde(default)]
    pub responders: RespondersConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub syllabus: SyllabusConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

impl LecternConfig {
    /// Collect validation warnings from every section.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        warnings.extend(self.governor.validate());
        warnings.extend(self.router.validate());
        warnings.extend(self.scaffolding.validate());
        warnings.extend(self.evaluator.validate());
        warnings.extend(self.llm.validate());
        if self.responders.max_tool_calls == 0 {
            warnings.push(
                "responders.max_tool_calls is 0; responders will never call tools".to_string(),
            );
        }
        warnings
    }
}

// =============================================================================
// Shared rule shapes
// =============================================================================

/// One row of an ordered `{pattern, outcome}` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRule {
    /// Outcome label reported when the rule matches.
    pub label: String,
    /// Regular expression matched against normalised text.
    pub pattern: String,
    /// Also match against the squeezed (letters and digits only) form; a
    /// squeezed hit must begin and end on word boundaries of the normalised text.
    #[serde(default)]
    pub match_squeezed: bool,
}

impl PatternRule {
    pub fn new(label: &str, pattern: &str) -> Self {
        Self {
            label: label.to_string(),
            pattern: pattern.to_string(),
            match_squeezed: false,
        }
    }

    pub fn squeezed(label: &str, pattern: &str) -> Self {
        Self {
            match_squeezed: true,
            ..Self::new(label, pattern)
        }
    }
}

/// A phrase with a weight, used for confusion scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedPhrase {
    pub phrase: String,
    pub weight: f64,
}

impl WeightedPhrase {
    pub fn new(phrase: &str, weight: f64) -> Self {
        Self {
            phrase: phrase.to_string(),
            weight,
        }
    }
}

// =============================================================================
// Governor
// =============================================================================

/// Policy engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Reject when the minimum retrieval distance exceeds this value.
    pub scope_threshold: f64,
    /// How many passages the scope check retrieves.
    pub scope_top_k: usize,
    /// Ordered integrity table; any match rejects.
    pub integrity_rules: Vec<PatternRule>,
    /// User-facing explanations per rejection reason.
    #[serde(default)]
    pub messages: RejectionMessages,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            scope_threshold: 0.80,
            scope_top_k: 5,
            integrity_rules: default_integrity_rules(),
            messages: RejectionMessages::default(),
        }
    }
}

impl GovernorConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.scope_threshold <= 0.0 {
            warnings.push(format!(
                "governor.scope_threshold ({}) rejects every query",
                self.scope_threshold
            ));
        }
        if self.scope_top_k == 0 {
            warnings.push("governor.scope_top_k is 0; scope check sees no passages".to_string());
        }
        if self.integrity_rules.is_empty() {
            warnings.push("governor.integrity_rules is empty; integrity check is off".to_string());
        }
        warnings
    }
}

fn default_integrity_rules() -> Vec<PatternRule> {
    vec![
        PatternRule::new(
            "full_solution_request",
            concat!(
                r"\b(give|send|show|write|provide|post|share)\b.{0,40}\b(full|complete|entire|whole|final|working)\b.{0,40}\b(solutions?|answers?|code|implementation|program|proof)\b",
                r".{0,40}\b(assignments?|homeworks?|hw\d*|problem sets?|psets?|labs?|quiz(zes)?|exams?|midterms?)\b",
                r"|\b(assignments?|homeworks?|hw\d*|problem sets?|psets?|labs?|quiz(zes)?|exams?|midterms?)\b.{0,60}",
                r"\b(give|send|show|write|provide|post|share)\b.{0,40}\b(full|complete|entire|whole|final|working)\b.{0,40}\b(solutions?|answers?|code|implementation|program|proof)\b",
            ),
        ),
        PatternRule::new(
            "do_my_assignment",
            r"\b(do|solve|finish|write)\s+(my|this|the)\s+(assignment|homework|hw|problem set|pset|lab|project|quiz|exam)\b",
        ),
        PatternRule::new(
            "assessment_for_me",
            r"\b(assignment|homework|hw|problem set|pset|lab|quiz|exam)\b.{0,40}\bfor me\b",
        ),
        PatternRule::new(
            "just_the_answer",
            r"\bjust (give|tell|show|send) me the (answers?|solutions?|code)\b",
        ),
        PatternRule::new(
            "answer_key",
            r"\b(answer key|solutions? manual|answers? (to|for) (the )?(quiz|exam|test|midterm|final|assignment|homework))\b",
        ),
        PatternRule::squeezed(
            "obfuscated_solution_request",
            r"(fullsolution|completesolution|entiresolution|completecode|fullcode)",
        ),
    ]
}

/// User-facing explanation for each rejection reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionMessages {
    pub out_of_scope: String,
    pub integrity_violation: String,
    pub retrieval_unavailable: String,
    /// Shown when a backing service fails after the policy gate.
    pub service_unavailable: String,
}

impl Default for RejectionMessages {
    fn default() -> Self {
        Self {
            out_of_scope: "That question doesn't appear to be covered by this course's material, \
                           so I can't answer it here. Try asking about a topic from the lectures, \
                           readings, or assignments."
                .to_string(),
            integrity_violation: "I can't provide complete solutions to graded work. I'm happy to \
                                  explain the underlying concepts, review your approach, or give \
                                  you a hint for the next step."
                .to_string(),
            retrieval_unavailable: "I couldn't check the course material just now, so I can't \
                                    answer yet. This is temporary. Please try again in a moment."
                .to_string(),
            service_unavailable: "The tutoring service is temporarily unavailable. Your question \
                                  was received; please try again in a moment."
                .to_string(),
        }
    }
}

// =============================================================================
// Router
// =============================================================================

/// One row of the ordered intent-priority table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRule {
    pub name: String,
    pub intent: Intent,
    /// Lexical signals; any match fires the rule.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Fires on confusion signals instead of patterns.
    #[serde(default)]
    pub confusion: bool,
    /// Always fires (table terminator).
    #[serde(default)]
    pub fallback: bool,
    /// Confidence of a single-signal match.
    pub base_confidence: f64,
}

impl IntentRule {
    fn patterns(name: &str, intent: Intent, base_confidence: f64, patterns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            intent,
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            confusion: false,
            fallback: false,
            base_confidence,
        }
    }
}

/// Response profile per intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentProfiles {
    pub tutor: ResponseProfile,
    pub explain: ResponseProfile,
    pub math: ResponseProfile,
    pub code: ResponseProfile,
    pub logistics: ResponseProfile,
    pub quick_answer: ResponseProfile,
}

impl IntentProfiles {
    pub fn get(&self, intent: Intent) -> &ResponseProfile {
        match intent {
            Intent::Tutor => &self.tutor,
            Intent::Explain => &self.explain,
            Intent::Math => &self.math,
            Intent::Code => &self.code,
            Intent::Logistics => &self.logistics,
            Intent::QuickAnswer => &self.quick_answer,
        }
    }
}

fn profile(
    responder: ResponderKind,
    template_id: &str,
    temperature: f32,
    max_words: Option<usize>,
    requires_retrieval: bool,
) -> ResponseProfile {
    ResponseProfile {
        responder,
        model: None,
        temperature,
        template_id: template_id.to_string(),
        max_words,
        requires_retrieval,
    }
}

impl Default for IntentProfiles {
    fn default() -> Self {
        Self {
            tutor: profile(ResponderKind::Tutor, "tutor", 0.7, None, true),
            explain: profile(ResponderKind::Tutor, "explain", 0.5, None, true),
            math: profile(ResponderKind::Math, "math", 0.3, None, true),
            code: profile(ResponderKind::Code, "code", 0.1, None, true),
            logistics: profile(ResponderKind::Logistics, "logistics", 0.0, Some(80), true),
            quick_answer: profile(ResponderKind::QuickAnswer, "quick_answer", 0.2, Some(60), false),
        }
    }
}

/// Intent router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Decisions below this confidence go to the classifier tier.
    pub confidence_floor: f64,
    /// Confusion score at or above which the confusion override fires.
    pub confusion_trigger: f64,
    /// Whether the classifier tier is consulted at all.
    pub classifier_enabled: bool,
    /// Template id used for classifier calls.
    pub classifier_template: String,
    /// Confidence assigned to classifier decisions.
    pub classifier_confidence: f64,
    /// LRU size for classifier results.
    pub classifier_cache_size: usize,
    /// Ordered rule table, evaluated top to bottom, first match wins.
    pub rules: Vec<IntentRule>,
    #[serde(default)]
    pub profiles: IntentProfiles,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.6,
            confusion_trigger: 0.3,
            classifier_enabled: true,
            classifier_template: "intent_classifier".to_string(),
            classifier_confidence: 0.7,
            classifier_cache_size: 256,
            rules: default_intent_rules(),
            profiles: IntentProfiles::default(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            warnings.push(format!(
                "router.confidence_floor ({}) is outside [0, 1]",
                self.confidence_floor
            ));
        }
        if !self.rules.iter().any(|r| r.fallback) {
            warnings.push(
                "router.rules has no fallback rule; unmatched queries use quick_answer".to_string(),
            );
        }
        for rule in &self.rules {
            if !rule.fallback && !rule.confusion && rule.patterns.is_empty() {
                warnings.push(format!("router rule '{}' has no signals and never fires", rule.name));
            }
        }
        warnings
    }
}

/// The default intent-priority table.
///
/// Order matters: code before the broad "explain" patterns; logistics before
/// any teaching intent; the confusion override before quick-answer, explain
/// and math so a struggling learner is never given a terse or formula-first
/// reply; math before tutor so derivation vocabulary wins on specificity.
fn default_intent_rules() -> Vec<IntentRule> {
    vec![
        IntentRule::patterns(
            "code_signals",
            Intent::Code,
            0.85,
            &[
                r"\b(python|javascript|java|c\+\+|rust|julia|matlab)\b",
                r"\b(numpy|pandas|pytorch|torch|tensorflow|keras|sklearn|scikit-learn|matplotlib|jupyter)\b",
                r"\b(traceback|stack ?trace|error message|exception|syntax error|segfault|indentation)\b",
                r"\b(implement|implementation|debug|debugging|compile|my code|this code|script|import)\b",
                r"```",
            ],
        ),
        IntentRule::patterns(
            "logistics_signals",
            Intent::Logistics,
            0.85,
            &[
                r"\b(due date|due|deadline|extension|late (policy|penalty|submission))\b",
                r"\b(syllabus|schedule|office hours?|grading|graded|grade breakdown|rubric)\b",
                r"\b(midterm|final exam|exam date|lecture (time|room|hall)|recitation|section time)\b",
                r"\b(this course|the course|course (structure|outline|policy|policies|website)|prerequisites?|textbook)\b",
            ],
        ),
        IntentRule {
            name: "confusion_override".to_string(),
            intent: Intent::Tutor,
            patterns: Vec::new(),
            confusion: true,
            fallback: false,
            base_confidence: 0.9,
        },
        IntentRule::patterns(
            "quick_factual",
            Intent::QuickAnswer,
            0.8,
            &[
                r"\b(briefly|quickly|in brief|tl;?dr|short answer|one[- ]liner)\b",
                r"\bin (one|a single|a few) (sentence|line|word)s?\b",
                r"\b(yes or no|just the definition|just tell me)\b",
            ],
        ),
        IntentRule::patterns(
            "explain_request",
            Intent::Explain,
            0.75,
            &[
                r"^(what (is|are|does)|what's|define|describe|explain|tell me about)\b",
                r"\b(can you explain|could you explain|what is meant by|meaning of|definition of)\b",
            ],
        ),
        IntentRule::patterns(
            "math_signals",
            Intent::Math,
            0.8,
            &[
                r"\b(derive|derivation|derivative|partial derivatives?|integral|integrate)\b",
                r"\b(formula|equation|proof|prove|closed[- ]form|lemma|theorem)\b",
                r"\b(matrix|matrices|eigen\w*|jacobian|hessian|likelihood|expectation|variance)\b",
                r"\b(calculate|compute|solve for)\b",
            ],
        ),
        IntentRule::patterns(
            "tutor_signals",
            Intent::Tutor,
            0.7,
            &[
                r"\b(why|how does|how do|how is|intuition|intuitively|concept|conceptually)\b",
                r"\b(difference between|compare|comparison|relationship between|trade-?offs?)\b",
                r"\b(understand|learn|study|teach me|walk me through)\b",
            ],
        ),
        IntentRule {
            name: "default_fallback".to_string(),
            intent: Intent::QuickAnswer,
            patterns: Vec::new(),
            confusion: false,
            fallback: true,
            base_confidence: 0.5,
        },
    ]
}

// =============================================================================
// Scaffolding and concepts
// =============================================================================

/// Scaffolding selector configuration (the decision table thresholds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaffoldingConfig {
    /// Weighted distress phrases for confusion scoring.
    pub confusion_phrases: Vec<WeightedPhrase>,
    /// confusion >= this => demonstrated.
    pub demonstrated_threshold: f64,
    /// confusion >= this (and below demonstrated) => explained.
    pub explained_threshold: f64,
    /// Low confusion and mastery below this => explained.
    pub low_mastery: f64,
    /// Low confusion and mastery at or above this => hint.
    pub high_mastery: f64,
    /// Added to the confusion score when the previous user turn was also confused.
    pub repeat_confusion_boost: f64,
    /// Prior mastery assumed when the query mentions no known concept.
    pub unknown_mastery: f64,
}

impl Default for ScaffoldingConfig {
    fn default() -> Self {
        Self {
            confusion_phrases: vec![
                WeightedPhrase::new("don't understand", 0.7),
                WeightedPhrase::new("dont understand", 0.7),
                WeightedPhrase::new("do not understand", 0.7),
                WeightedPhrase::new("doesn't make sense", 0.6),
                WeightedPhrase::new("makes no sense", 0.6),
                WeightedPhrase::new("still lost", 0.8),
                WeightedPhrase::new("completely lost", 0.8),
                WeightedPhrase::new("confused", 0.5),
                WeightedPhrase::new("confusing", 0.4),
                WeightedPhrase::new("struggling", 0.5),
                WeightedPhrase::new("stuck", 0.4),
                WeightedPhrase::new("no idea", 0.4),
                WeightedPhrase::new("lost", 0.3),
            ],
            demonstrated_threshold: 0.7,
            explained_threshold: 0.4,
            low_mastery: 0.3,
            high_mastery: 0.8,
            repeat_confusion_boost: 0.1,
            unknown_mastery: 0.5,
        }
    }
}

impl ScaffoldingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.explained_threshold > self.demonstrated_threshold {
            warnings.push(format!(
                "scaffolding.explained_threshold ({}) > demonstrated_threshold ({}); explained is unreachable",
                self.explained_threshold, self.demonstrated_threshold
            ));
        }
        if self.low_mastery > self.high_mastery {
            warnings.push(format!(
                "scaffolding.low_mastery ({}) > high_mastery ({})",
                self.low_mastery, self.high_mastery
            ));
        }
        for p in &self.confusion_phrases {
            if p.weight <= 0.0 {
                warnings.push(format!(
                    "confusion phrase '{}' has non-positive weight {}",
                    p.phrase, p.weight
                ));
            }
        }
        warnings
    }
}

/// A course concept and the surface forms that mention it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptEntry {
    pub id: String,
    pub aliases: Vec<String>,
}

impl ConceptEntry {
    fn new(id: &str, aliases: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Concept catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptsConfig {
    pub catalog: Vec<ConceptEntry>,
}

impl Default for ConceptsConfig {
    fn default() -> Self {
        Self {
            catalog: vec![
                ConceptEntry::new(
                    "gradient_descent",
                    &["gradient descent", "sgd", "stochastic gradient", "learning rate"],
                ),
                ConceptEntry::new("backpropagation", &["backpropagation", "backprop", "chain rule"]),
                ConceptEntry::new("overfitting", &["overfitting", "overfit", "underfitting"]),
                ConceptEntry::new(
                    "regularization",
                    &["regularization", "regularisation", "l1 penalty", "l2 penalty", "ridge", "lasso", "dropout"],
                ),
                ConceptEntry::new("linear_regression", &["linear regression", "least squares"]),
                ConceptEntry::new("logistic_regression", &["logistic regression", "sigmoid"]),
                ConceptEntry::new("classification", &["classification", "classifier"]),
                ConceptEntry::new(
                    "neural_networks",
                    &["neural network", "neural net", "perceptron", "activation function"],
                ),
                ConceptEntry::new("loss_functions", &["loss function", "cross-entropy", "cross entropy", "mean squared error", "mse"]),
                ConceptEntry::new("bias_variance", &["bias-variance", "bias variance"]),
                ConceptEntry::new("cross_validation", &["cross-validation", "cross validation", "k-fold"]),
            ],
        }
    }
}

// =============================================================================
// Responders
// =============================================================================

/// Responder configuration shared by all variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondersConfig {
    /// Maximum tool invocations per request.
    pub max_tool_calls: usize,
    /// Passages retrieved for context.
    pub top_k: usize,
    /// Prior turns passed to templates.
    pub history_turns: usize,
    /// Patterns marking a query as assessment-style.
    pub assessment_patterns: Vec<String>,
    /// Longest fenced code block allowed below `demonstrated` on assessment queries.
    pub max_solution_code_lines: usize,
    /// Replacement text for a withheld solution block.
    pub withheld_note: String,
}

impl Default for RespondersConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: 3,
            top_k: 4,
            history_turns: 6,
            assessment_patterns: vec![
                r"\b(assignment|homework|hw\s*\d*|problem set|pset|lab\s*\d+|quiz|exam|midterm|project)\b"
                    .to_string(),
            ],
            max_solution_code_lines: 12,
            withheld_note: "[Full solution withheld: this looks like graded work. Try the next \
                            step yourself and ask me to check your reasoning.]"
                .to_string(),
        }
    }
}

// =============================================================================
// Evaluator
// =============================================================================

/// One row of the misconception table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MisconceptionRule {
    pub id: String,
    pub pattern: String,
    /// Concept the misconception belongs to, if any.
    #[serde(default)]
    pub concept: Option<String>,
    pub description: String,
}

impl MisconceptionRule {
    fn new(id: &str, pattern: &str, concept: Option<&str>, description: &str) -> Self {
        Self {
            id: id.to_string(),
            pattern: pattern.to_string(),
            concept: concept.map(str::to_string),
            description: description.to_string(),
        }
    }
}

/// Evaluator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Multiplier on the old mastery score per interaction.
    pub decay_factor: f64,
    /// Weight of the new performance signal.
    pub outcome_weight: f64,
    /// Phrases indicating the learner understands.
    pub understanding_phrases: Vec<String>,
    pub misconceptions: Vec<MisconceptionRule>,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            decay_factor: 0.9,
            outcome_weight: 0.1,
            understanding_phrases: vec![
                "that makes sense".to_string(),
                "makes sense now".to_string(),
                "got it".to_string(),
                "i understand now".to_string(),
                "so it means".to_string(),
                "is that right".to_string(),
                "so basically".to_string(),
            ],
            misconceptions: vec![
                MisconceptionRule::new(
                    "classification_regression_conflation",
                    r"\b(logistic regression (is|does) (a )?regression|regression (model )?(predicts|outputs) (a )?(class|category|label)|classification (predicts|outputs) (a )?continuous)\b",
                    Some("classification"),
                    "Conflates classification (discrete labels) with regression (continuous targets).",
                ),
                MisconceptionRule::new(
                    "gd_global_minimum",
                    r"\bgradient descent (always )?(finds|guarantees|reaches|converges to) (the )?global (minimum|optimum)\b",
                    Some("gradient_descent"),
                    "Believes gradient descent always finds the global minimum on non-convex losses.",
                ),
                MisconceptionRule::new(
                    "more_data_overfits",
                    r"\bmore (training )?data (causes|leads to|increases) overfitting\b",
                    Some("overfitting"),
                    "Believes adding training data causes overfitting.",
                ),
                MisconceptionRule::new(
                    "correlation_causation",
                    r"\bcorrelation (implies|means|proves|shows) causation\b",
                    None,
                    "Treats correlation as evidence of causation.",
                ),
            ],
        }
    }
}

impl EvaluatorConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !(0.0..=1.0).contains(&self.decay_factor) {
            warnings.push(format!(
                "evaluator.decay_factor ({}) is outside [0, 1]",
                self.decay_factor
            ));
        }
        if self.outcome_weight < 0.0 {
            warnings.push(format!(
                "evaluator.outcome_weight ({}) is negative",
                self.outcome_weight
            ));
        }
        warnings
    }
}

// =============================================================================
// External services
// =============================================================================

/// Language-model provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: "openai" (any OpenAI-compatible endpoint).
    pub provider: String,
    /// Default model identifier.
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Optional base URL override for the API endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Maximum tokens to generate in a response.
    pub max_tokens: usize,
    /// Hard per-call timeout.
    pub timeout_secs: u64,
    /// Whether final answers are streamed token by token.
    pub use_streaming: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            max_tokens: 1024,
            timeout_secs: 60,
            use_streaming: true,
        }
    }
}

impl LlmConfig {
    /// Validate this LLM config and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.timeout_secs == 0 {
            warnings.push("llm.timeout_secs is 0; every call will time out".to_string());
        }
        if self.max_tokens == 0 {
            warnings.push("llm.max_tokens is 0".to_string());
        }
        warnings
    }
}

/// Retrieval service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Base URL of the search endpoint (`POST {base_url}/search`).
    pub base_url: String,
    /// Optional collection name forwarded to the service.
    #[serde(default)]
    pub collection: Option<String>,
    /// Per-call timeout.
    pub timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            collection: None,
            timeout_ms: 3000,
        }
    }
}

/// Retry policy for transient service failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_backoff_ms: 200,
            max_backoff_ms: 2000,
        }
    }
}

/// Learner store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the JSON store file; when unset the host picks a location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            timeout_ms: 2000,
        }
    }
}

/// One syllabus section served by the `syllabus_lookup` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyllabusSection {
    pub topic: String,
    pub text: String,
    pub source_id: String,
}

/// Syllabus configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyllabusConfig {
    #[serde(default)]
    pub sections: Vec<SyllabusSection>,
}

/// Prompt template overrides: template id -> handlebars source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `LECTERN_`)
/// 3. Workspace-local config (`.lectern/config.toml`)
/// 4. User config (`~/.config/lectern/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&LecternConfig>,
) -> Result<LecternConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(LecternConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "lectern", "lectern") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".lectern").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // LECTERN_GOVERNOR__SCOPE_THRESHOLD, LECTERN_LLM__MODEL, etc.
    figment = figment.merge(Env::prefixed("LECTERN_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".lectern").join("config.toml")
}

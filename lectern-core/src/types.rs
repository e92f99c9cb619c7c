//! Core types for the Lectern pipeline.
//!
//! Closed enumerations for intents, scaffolding levels and policy outcomes,
//! the request input (`QueryContext`), the generation request/response pair
//! exchanged with the language-model layer, the persisted learner records,
//! and the outward-facing `ResponsePayload`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// Request input
// =============================================================================

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One prior turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// Immutable input for one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryContext {
    /// Raw query text as typed by the learner.
    pub query: String,
    /// User identifier.
    pub user_id: String,
    /// Optional role (e.g. "student", "ta").
    #[serde(default)]
    pub role: Option<String>,
    /// Prior turns, most recent last.
    #[serde(default)]
    pub history: Vec<Turn>,
    /// Prior mastery snapshot: concept id -> score in [0, 1].
    #[serde(default)]
    pub prior_mastery: HashMap<String, f64>,
}

impl QueryContext {
    pub fn new(user_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_mastery(mut self, concept: impl Into<String>, score: f64) -> Self {
        self.prior_mastery.insert(concept.into(), score);
        self
    }

    /// The most recent user turn before the current query, if any.
    pub fn previous_user_turn(&self) -> Option<&Turn> {
        self.history.iter().rev().find(|t| t.role == Role::User)
    }
}

// =============================================================================
// Intents and responders
// =============================================================================

/// What kind of help a query is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Full Socratic conceptual tutoring.
    Tutor,
    /// Medium-depth explanation ("what is X") without confusion signals.
    Explain,
    /// Mathematical derivation, formulas, proofs.
    Math,
    /// Programming and library help.
    Code,
    /// Schedule, grading and course-structure questions.
    Logistics,
    /// Short factual answer.
    QuickAnswer,
}

impl Intent {
    pub fn all() -> &'static [Intent] {
        &[
            Intent::Tutor,
            Intent::Explain,
            Intent::Math,
            Intent::Code,
            Intent::Logistics,
            Intent::QuickAnswer,
        ]
    }

    /// Teaching-family intents get a scaffolding level.
    pub fn is_teaching(&self) -> bool {
        matches!(self, Intent::Tutor | Intent::Explain | Intent::Math)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Tutor => "tutor",
            Intent::Explain => "explain",
            Intent::Math => "math",
            Intent::Code => "code",
            Intent::Logistics => "logistics",
            Intent::QuickAnswer => "quick_answer",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = String;

    /// Lenient parse: accepts the canonical tag, common synonyms, and free text
    /// whose first recognised word names an intent (classifier output).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned = s.trim().to_lowercase();
        for token in cleaned.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
            let intent = match token {
                "tutor" | "tutoring" | "conceptual" => Intent::Tutor,
                "explain" | "explanation" => Intent::Explain,
                "math" | "mathematics" | "derivation" => Intent::Math,
                "code" | "coding" | "programming" => Intent::Code,
                "logistics" | "logistic" | "administrative" => Intent::Logistics,
                "quick_answer" | "quick" | "factual" => Intent::QuickAnswer,
                _ => continue,
            };
            return Ok(intent);
        }
        Err(format!("unrecognised intent: '{}'", s.trim()))
    }
}

/// Responder implementations available in the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponderKind {
    Tutor,
    Math,
    Code,
    Logistics,
    QuickAnswer,
}

impl ResponderKind {
    pub fn all() -> &'static [ResponderKind] {
        &[
            ResponderKind::Tutor,
            ResponderKind::Math,
            ResponderKind::Code,
            ResponderKind::Logistics,
            ResponderKind::QuickAnswer,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponderKind::Tutor => "tutor",
            ResponderKind::Math => "math",
            ResponderKind::Code => "code",
            ResponderKind::Logistics => "logistics",
            ResponderKind::QuickAnswer => "quick_answer",
        }
    }
}

impl fmt::Display for ResponderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a response is generated for an intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseProfile {
    /// Which responder handles the intent.
    pub responder: ResponderKind,
    /// Optional model override (model family); `None` uses the configured default.
    #[serde(default)]
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Prompt template identifier.
    pub template_id: String,
    /// Upper bound on response length in words.
    #[serde(default)]
    pub max_words: Option<usize>,
    /// Whether the responder must retrieve course context before answering.
    #[serde(default = "default_true")]
    pub requires_retrieval: bool,
}

fn default_true() -> bool {
    true
}

/// Which tier produced a routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingTier {
    Rules,
    Classifier,
}

/// Output of the intent router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub intent: Intent,
    pub profile: ResponseProfile,
    /// Routing confidence in [0, 1].
    pub confidence: f64,
    /// Name of the rule (or "classifier") that decided.
    pub rule: String,
    pub tier: RoutingTier,
}

// =============================================================================
// Scaffolding
// =============================================================================

/// Ordered degree of instructional support.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ScaffoldingLevel {
    Hint,
    Guided,
    Explained,
    Demonstrated,
}

impl ScaffoldingLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaffoldingLevel::Hint => "hint",
            ScaffoldingLevel::Guided => "guided",
            ScaffoldingLevel::Explained => "explained",
            ScaffoldingLevel::Demonstrated => "demonstrated",
        }
    }
}

impl fmt::Display for ScaffoldingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Closed taxonomy of rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Too dissimilar from course content.
    OutOfScope,
    /// Asks for a complete graded-work solution.
    IntegrityViolation,
    /// The scope check could not run; retry later.
    RetrievalUnavailable,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::OutOfScope => "out_of_scope",
            RejectionReason::IntegrityViolation => "integrity_violation",
            RejectionReason::RetrievalUnavailable => "retrieval_unavailable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RejectionReason::RetrievalUnavailable)
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which policy law a rejection enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLaw {
    Scope,
    Integrity,
}

/// Result of the policy gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub approved: bool,
    pub reason: Option<RejectionReason>,
    pub law: Option<PolicyLaw>,
    /// Minimum retrieval distance observed by the scope check, if it ran.
    pub min_distance: Option<f64>,
    /// Label of the integrity rule that matched, if any.
    pub integrity_rule: Option<String>,
    /// Whether the caller should retry instead of showing a permanent rejection.
    pub retryable: bool,
}

impl PolicyDecision {
    pub fn approve(min_distance: f64) -> Self {
        Self {
            approved: true,
            reason: None,
            law: None,
            min_distance: Some(min_distance),
            integrity_rule: None,
            retryable: false,
        }
    }

    pub fn reject(reason: RejectionReason, law: PolicyLaw) -> Self {
        Self {
            approved: false,
            reason: Some(reason),
            law: Some(law),
            min_distance: None,
            integrity_rule: None,
            retryable: reason.is_retryable(),
        }
    }

    pub fn with_min_distance(mut self, distance: f64) -> Self {
        self.min_distance = Some(distance);
        self
    }

    pub fn with_integrity_rule(mut self, label: impl Into<String>) -> Self {
        self.integrity_rule = Some(label.into());
        self
    }
}

// =============================================================================
// Retrieval and generation
// =============================================================================

/// A ranked passage returned by the retrieval service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub text: String,
    pub source_id: String,
    /// Distance in [0, inf), 0 = identical.
    pub distance: f64,
}

impl RetrievedPassage {
    pub fn new(source_id: impl Into<String>, text: impl Into<String>, distance: f64) -> Self {
        Self {
            text: text.into(),
            source_id: source_id.into(),
            distance,
        }
    }
}

/// A tool the model may call during a responder loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments.
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Token usage statistics for a generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A request to the language-model layer: template id plus variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub template_id: String,
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
    /// Optional model override.
    pub model: Option<String>,
    /// Tools offered to the model; empty disables tool calling.
    pub tools: Vec<ToolDefinition>,
}

impl GenerationRequest {
    pub fn new(template_id: impl Into<String>, temperature: f32) -> Self {
        Self {
            template_id: template_id.into(),
            temperature,
            ..Default::default()
        }
    }

    pub fn var(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }
}

/// A completed generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: TokenUsage,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Events emitted during streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A text fragment.
    Token(String),
    /// A complete tool call.
    ToolCall(ToolCall),
    /// Generation finished.
    Done { usage: TokenUsage },
    /// Provider-side error mid-stream.
    Error(String),
}

// =============================================================================
// Evaluation and persistence
// =============================================================================

/// What an interaction says about the learner's understanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceSignal {
    /// The learner demonstrates correct understanding.
    Understanding,
    /// The learner consumed an answer without evidence either way.
    Passive,
    /// The learner is confused or holds a misconception.
    Confusion,
}

impl PerformanceSignal {
    /// Numeric signal fed into the mastery update.
    pub fn value(&self) -> f64 {
        match self {
            PerformanceSignal::Understanding => 1.0,
            PerformanceSignal::Passive => 0.5,
            PerformanceSignal::Confusion => 0.0,
        }
    }
}

/// Outcome of a pipeline run, recorded in the interaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTag {
    Answered,
    /// Streaming was cancelled after some output.
    Partial,
    /// Tool-call budget was exhausted; best-effort answer given.
    BudgetExhausted,
    Rejected,
    /// A backing service was unavailable after retry.
    Unavailable,
    /// Cancelled before the responder produced output.
    Cancelled,
}

impl OutcomeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeTag::Answered => "answered",
            OutcomeTag::Partial => "partial",
            OutcomeTag::BudgetExhausted => "budget_exhausted",
            OutcomeTag::Rejected => "rejected",
            OutcomeTag::Unavailable => "unavailable",
            OutcomeTag::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OutcomeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted per user x concept mastery estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub user_id: String,
    pub concept: String,
    /// Mastery in [0, 1].
    pub score: f64,
    /// Multiplier applied to the old score once per interaction.
    pub decay_factor: f64,
    pub last_assessed: DateTime<Utc>,
}

/// Append-only record of one completed pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub intent: Option<Intent>,
    pub outcome: OutcomeTag,
    pub concept_focus: Option<String>,
    pub scaffolding_level: Option<ScaffoldingLevel>,
    pub approved: bool,
    pub rejection_reason: Option<RejectionReason>,
    pub quality_score: Option<f64>,
}

// =============================================================================
// Outward payload
// =============================================================================

/// Coarse status of the response for the surrounding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Answered,
    Partial,
    Rejected,
    Unavailable,
}

/// The full contract the core exposes outward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub intent: Option<Intent>,
    pub scaffolding_level: Option<ScaffoldingLevel>,
    pub approved: bool,
    pub rejection_reason: Option<RejectionReason>,
    pub text: String,
    pub citations: Vec<String>,
    pub quality_score: Option<f64>,
    pub status: ResponseStatus,
    /// The caller may retry the same request later.
    pub retryable: bool,
    /// The tool-call bound was reached; the answer is best-effort.
    #[serde(default)]
    pub budget_exhausted: bool,
    /// Misconception ids detected in this turn.
    #[serde(default)]
    pub misconceptions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffolding_level_ordering() {
        assert!(ScaffoldingLevel::Hint < ScaffoldingLevel::Guided);
        assert!(ScaffoldingLevel::Guided < ScaffoldingLevel::Explained);
        assert!(ScaffoldingLevel::Explained < ScaffoldingLevel::Demonstrated);
    }

    #[test]
    fn test_intent_teaching_family() {
        assert!(Intent::Tutor.is_teaching());
        assert!(Intent::Explain.is_teaching());
        assert!(Intent::Math.is_teaching());
        assert!(!Intent::Code.is_teaching());
        assert!(!Intent::Logistics.is_teaching());
        assert!(!Intent::QuickAnswer.is_teaching());
    }

    #[test]
    fn test_intent_parse_lenient() {
        assert_eq!("tutor".parse::<Intent>().unwrap(), Intent::Tutor);
        assert_eq!(" Logistics\n".parse::<Intent>().unwrap(), Intent::Logistics);
        assert_eq!(
            "Intent: quick_answer".parse::<Intent>().unwrap(),
            Intent::QuickAnswer
        );
        assert_eq!("math.".parse::<Intent>().unwrap(), Intent::Math);
        assert!("weather".parse::<Intent>().is_err());
    }

    #[test]
    fn test_intent_serde_snake_case() {
        let json = serde_json::to_string(&Intent::QuickAnswer).unwrap();
        assert_eq!(json, "\"quick_answer\"");
        let back: Intent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Intent::QuickAnswer);
    }

    #[test]
    fn test_rejection_reason_retryable() {
        assert!(RejectionReason::RetrievalUnavailable.is_retryable());
        assert!(!RejectionReason::OutOfScope.is_retryable());
        assert!(!RejectionReason::IntegrityViolation.is_retryable());
    }

    #[test]
    fn test_policy_decision_constructors() {
        let ok = PolicyDecision::approve(0.2);
        assert!(ok.approved);
        assert!(ok.reason.is_none());
        assert_eq!(ok.min_distance, Some(0.2));

        let rejected =
            PolicyDecision::reject(RejectionReason::RetrievalUnavailable, PolicyLaw::Scope);
        assert!(!rejected.approved);
        assert!(rejected.retryable);
        assert_eq!(rejected.law, Some(PolicyLaw::Scope));
    }

    #[test]
    fn test_previous_user_turn() {
        let ctx = QueryContext::new("u1", "and now?").with_history(vec![
            Turn::user("first"),
            Turn::assistant("reply"),
            Turn::user("second"),
            Turn::assistant("reply two"),
        ]);
        assert_eq!(ctx.previous_user_turn().unwrap().text, "second");
        assert!(QueryContext::new("u1", "q").previous_user_turn().is_none());
    }

    #[test]
    fn test_performance_signal_values() {
        assert_eq!(PerformanceSignal::Confusion.value(), 0.0);
        assert_eq!(PerformanceSignal::Understanding.value(), 1.0);
        assert!(PerformanceSignal::Passive.value() > 0.0);
    }

    #[test]
    fn test_generation_request_builder() {
        let req = GenerationRequest::new("tutor", 0.7)
            .var("query", "what is a tensor?")
            .var("level", "hint");
        assert_eq!(req.template_id, "tutor");
        assert_eq!(req.variables["query"], "what is a tensor?");
        assert!(req.tools.is_empty());
    }
}

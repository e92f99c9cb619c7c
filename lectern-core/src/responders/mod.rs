//! Responders: turn an approved, routed query into an answer.
//!
//! Every variant shares one [`ResponseEngine`] that owns the bounded tool
//! loop, citation extraction, the solution guard and streaming. Variants only
//! choose which tools the model may call, extra template variables, and
//! whether syllabus sections are seeded into the context before the first
//! generation. A [`ResponderRegistry`] maps each [`ResponderKind`] to its
//! implementation.

mod code;
mod logistics;
mod math;
mod quick;
mod tutor;

pub use code::CodeResponder;
pub use logistics::LogisticsResponder;
pub use math::MathResponder;
pub use quick::QuickAnswerResponder;
pub use tutor::TutorResponder;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::brain::Brain;
use crate::config::RespondersConfig;
use crate::error::{ConfigError, LecternError, PipelineError};
use crate::prompts::level_guidance;
use crate::retrieval::{RetrievalService, default_search_timeout, search_with_retry};
use crate::retry::RetryPolicy;
use crate::rules::{NormalizedText, PatternSet, compile_pattern};
use crate::syllabus::SyllabusService;
use crate::text;
use crate::types::{
    GenerationRequest, Intent, ResponderKind, ResponseProfile, RetrievedPassage, ScaffoldingLevel,
    StreamEvent, TokenUsage, ToolCall, ToolDefinition, Turn,
};

pub const SEARCH_COURSE_TOOL: &str = "search_course";
pub const SYLLABUS_LOOKUP_TOOL: &str = "syllabus_lookup";

/// Separates streamed text of a tool round from what follows it.
const PREAMBLE_BREAK: &str = "\n\n";

/// Receives streamed text fragments as they are produced.
#[async_trait]
pub trait TokenSink: Send + Sync {
    async fn on_token(&self, token: &str);
}

/// Everything a responder needs from the pipeline state.
#[derive(Debug, Clone)]
pub struct ResponderRequest {
    pub query: String,
    pub user_role: Option<String>,
    pub history: Vec<Turn>,
    pub intent: Intent,
    pub profile: ResponseProfile,
    /// Set only for teaching-family intents.
    pub scaffolding: Option<ScaffoldingLevel>,
    pub concepts: Vec<String>,
}

/// One executed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
    pub succeeded: bool,
}

/// What a responder hands back to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct ResponderOutput {
    pub text: String,
    /// Source ids of passages actually cited, in first-use order.
    pub citations: Vec<String>,
    /// Every passage placed in the model's context, in prompt order.
    pub passages: Vec<RetrievedPassage>,
    pub tool_invocations: Vec<ToolInvocation>,
    /// The tool-call bound was reached and the answer is best-effort.
    pub budget_exhausted: bool,
    /// Cancellation stopped generation; `text` holds whatever was produced.
    pub cancelled: bool,
    /// The stream broke after some output was produced.
    pub incomplete: bool,
    /// The solution guard was active for this request.
    pub guarded: bool,
    /// The guard replaced at least one code block.
    pub withheld: bool,
    pub usage: TokenUsage,
}

/// Per-variant choices layered on the shared engine.
#[derive(Debug, Clone, Default)]
pub struct VariantPlan {
    pub tools: Vec<ToolDefinition>,
    pub extra_vars: Map<String, Value>,
    /// Look the query up in the syllabus before the first generation.
    pub seed_syllabus: bool,
}

/// A responder variant.
#[async_trait]
pub trait Responder: Send + Sync {
    fn kind(&self) -> ResponderKind;

    async fn respond(
        &self,
        request: &ResponderRequest,
        sink: Option<&dyn TokenSink>,
        cancel: &CancellationToken,
    ) -> Result<ResponderOutput, LecternError>;
}

pub fn search_course_tool() -> ToolDefinition {
    ToolDefinition {
        name: SEARCH_COURSE_TOOL.to_string(),
        description: "Search the course material for passages relevant to a query.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to search for" }
            },
            "required": ["query"]
        }),
    }
}

pub fn syllabus_lookup_tool() -> ToolDefinition {
    ToolDefinition {
        name: SYLLABUS_LOOKUP_TOOL.to_string(),
        description: "Look up schedule, deadline, grading or course-structure facts in the syllabus."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "topic": { "type": "string", "description": "Syllabus topic, e.g. 'homework 2 deadline'" }
            },
            "required": ["topic"]
        }),
    }
}

/// Source ids cited in `text` via `[n]` or `[n, m]` markers, in first-use
/// order, de-duplicated. Markers pointing outside `passages` are ignored.
pub fn extract_citations(marker: &Regex, text: &str, passages: &[RetrievedPassage]) -> Vec<String> {
    let mut cited: Vec<String> = Vec::new();
    for caps in marker.captures_iter(text) {
        let Some(group) = caps.get(1) else { continue };
        for index in group.as_str().split(',') {
            let Ok(n) = index.trim().parse::<usize>() else {
                continue;
            };
            if n == 0 {
                continue;
            }
            if let Some(passage) = passages.get(n - 1) {
                if !cited.contains(&passage.source_id) {
                    cited.push(passage.source_id.clone());
                }
            }
        }
    }
    cited
}

struct Round {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: TokenUsage,
    cancelled: bool,
    incomplete: bool,
}

/// Shared generation machinery behind every responder variant.
pub struct ResponseEngine {
    brain: Brain,
    retrieval: Arc<dyn RetrievalService>,
    syllabus: Arc<dyn SyllabusService>,
    retry: RetryPolicy,
    search_timeout: Duration,
    assessment: PatternSet,
    citation_marker: Regex,
    code_fence: Regex,
    max_tool_calls: usize,
    top_k: usize,
    history_turns: usize,
    max_solution_code_lines: usize,
    withheld_note: String,
    use_streaming: bool,
}

impl ResponseEngine {
    pub fn new(
        config: &RespondersConfig,
        brain: Brain,
        retrieval: Arc<dyn RetrievalService>,
        syllabus: Arc<dyn SyllabusService>,
        retry: RetryPolicy,
        use_streaming: bool,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            brain,
            retrieval,
            syllabus,
            retry,
            search_timeout: default_search_timeout(),
            assessment: PatternSet::compile("responders.assessment", &config.assessment_patterns)?,
            citation_marker: compile_pattern("responders.citations", r"\[(\d+(?:\s*,\s*\d+)*)\]")?,
            code_fence: compile_pattern("responders.code_fence", r"(?s)```[^\n]*\n(.*?)(?:```|\z)")?,
            max_tool_calls: config.max_tool_calls,
            top_k: config.top_k,
            history_turns: config.history_turns,
            max_solution_code_lines: config.max_solution_code_lines,
            withheld_note: config.withheld_note.clone(),
            use_streaming,
        })
    }

    /// Bound on each retrieval attempt.
    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = timeout;
        self
    }

    pub fn max_tool_calls(&self) -> usize {
        self.max_tool_calls
    }

    /// Whether the solution guard applies: an assessment-style query below
    /// the `demonstrated` level.
    pub fn guard_applies(&self, query: &str, level: Option<ScaffoldingLevel>) -> bool {
        let below_demonstrated = level.is_none_or(|l| l < ScaffoldingLevel::Demonstrated);
        below_demonstrated && self.assessment.is_match(&NormalizedText::new(query).normalized)
    }

    /// Replace fenced code blocks longer than the allowed number of lines.
    /// Returns the new text and whether anything was withheld.
    pub fn withhold_solutions(&self, text: &str) -> (String, bool) {
        let mut withheld = false;
        let replaced = self.code_fence.replace_all(text, |caps: &regex::Captures<'_>| {
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let lines = body.lines().filter(|l| !l.trim().is_empty()).count();
            if lines > self.max_solution_code_lines {
                withheld = true;
                self.withheld_note.clone()
            } else {
                caps[0].to_string()
            }
        });
        (replaced.into_owned(), withheld)
    }

    fn add_passages(passages: &mut Vec<RetrievedPassage>, found: Vec<RetrievedPassage>) -> Vec<usize> {
        let mut indices = Vec::new();
        for passage in found {
            let existing = passages
                .iter()
                .position(|p| p.source_id == passage.source_id && p.text == passage.text);
            match existing {
                Some(i) => indices.push(i + 1),
                None => {
                    passages.push(passage);
                    indices.push(passages.len());
                }
            }
        }
        indices
    }

    async fn syllabus_passages(&self, topic: &str) -> Vec<RetrievedPassage> {
        self.syllabus
            .lookup(topic)
            .await
            .into_iter()
            .map(|s| RetrievedPassage::new(s.source_id, format!("{}: {}", s.topic, s.text), 0.0))
            .collect()
    }

    /// Run one tool call; the returned text is shown to the model.
    async fn execute_tool(
        &self,
        call: &ToolCall,
        passages: &mut Vec<RetrievedPassage>,
    ) -> (String, bool) {
        let argument = |key: &str| {
            call.arguments
                .get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        match call.name.as_str() {
            SEARCH_COURSE_TOOL => {
                let Some(query) = argument("query") else {
                    return ("error: missing 'query' argument".to_string(), false);
                };
                match search_with_retry(
                    self.retrieval.as_ref(),
                    &self.retry,
                    self.search_timeout,
                    &query,
                    self.top_k,
                )
                .await
                {
                    Ok(found) if found.is_empty() => ("no matching passages".to_string(), true),
                    Ok(found) => {
                        let indices = Self::add_passages(passages, found);
                        (format!("added passages {}", format_indices(&indices)), true)
                    }
                    Err(e) => {
                        warn!(error = %e, "search_course tool failed");
                        (format!("error: course search unavailable ({e})"), false)
                    }
                }
            }
            SYLLABUS_LOOKUP_TOOL => {
                let Some(topic) = argument("topic") else {
                    return ("error: missing 'topic' argument".to_string(), false);
                };
                let found = self.syllabus_passages(&topic).await;
                if found.is_empty() {
                    ("no syllabus entry for that topic".to_string(), true)
                } else {
                    let indices = Self::add_passages(passages, found);
                    (format!("added passages {}", format_indices(&indices)), true)
                }
            }
            other => (format!("error: unknown tool '{other}'"), false),
        }
    }

    fn build_request(
        &self,
        request: &ResponderRequest,
        plan: &VariantPlan,
        passages: &[RetrievedPassage],
        tool_results: &[(String, String)],
        budget_exhausted: bool,
        tools_enabled: bool,
    ) -> GenerationRequest {
        let history_start = request.history.len().saturating_sub(self.history_turns);
        let history: Vec<Value> = request.history[history_start..]
            .iter()
            .map(|t| json!({ "role": t.role, "text": t.text }))
            .collect();
        let numbered: Vec<Value> = passages
            .iter()
            .enumerate()
            .map(|(i, p)| json!({ "index": i + 1, "source_id": p.source_id, "text": p.text }))
            .collect();
        let results: Vec<Value> = tool_results
            .iter()
            .map(|(name, output)| json!({ "name": name, "output": output }))
            .collect();
        let (level, guidance) = match request.scaffolding {
            Some(level) => (level.as_str(), level_guidance(level)),
            None => ("none", ""),
        };

        let mut generation = GenerationRequest::new(
            request.profile.template_id.clone(),
            request.profile.temperature,
        )
        .var("query", request.query.as_str())
        .var("intent", request.intent.as_str())
        .var("level", level)
        .var("level_guidance", guidance)
        .var("history", history)
        .var("passages", numbered)
        .var("tool_results", results)
        .var("budget_exhausted", budget_exhausted)
        .var("concepts", request.concepts.clone());
        if let Some(max_words) = request.profile.max_words {
            generation = generation.var("max_words", max_words);
        }
        if let Some(role) = &request.user_role {
            generation = generation.var("role", role.as_str());
        }
        for (key, value) in &plan.extra_vars {
            generation.variables.insert(key.clone(), value.clone());
        }
        generation.model = request.profile.model.clone();
        if tools_enabled {
            generation.tools = plan.tools.clone();
        }
        generation
    }

    async fn generate_blocking(
        &self,
        generation: GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Round, LecternError> {
        tokio::select! {
            _ = cancel.cancelled() => Ok(Round {
                text: String::new(),
                tool_calls: Vec::new(),
                usage: TokenUsage::default(),
                cancelled: true,
                incomplete: false,
            }),
            result = self.brain.generate(generation) => {
                let response = result?;
                Ok(Round {
                    text: response.text,
                    tool_calls: response.tool_calls,
                    usage: response.usage,
                    cancelled: false,
                    incomplete: false,
                })
            }
        }
    }

    async fn generate_streamed(
        &self,
        generation: GenerationRequest,
        sink: &dyn TokenSink,
        cancel: &CancellationToken,
    ) -> Result<Round, LecternError> {
        let mut stream = self.brain.stream(generation.clone());
        let mut round = Round {
            text: String::new(),
            tool_calls: Vec::new(),
            usage: TokenUsage::default(),
            cancelled: false,
            incomplete: false,
        };
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    round.cancelled = true;
                    return Ok(round);
                }
                event = stream.next() => event,
            };
            match event {
                None => return Ok(round),
                Some(StreamEvent::Token(token)) => {
                    sink.on_token(&token).await;
                    round.text.push_str(&token);
                }
                Some(StreamEvent::ToolCall(call)) => round.tool_calls.push(call),
                Some(StreamEvent::Done { usage }) => round.usage = usage,
                Some(StreamEvent::Error(message)) => {
                    if round.text.is_empty() && round.tool_calls.is_empty() {
                        debug!(error = %message, "Stream failed before output; retrying without streaming");
                        drop(stream);
                        let fallback = self.generate_blocking(generation, cancel).await?;
                        if !fallback.text.is_empty() {
                            sink.on_token(&fallback.text).await;
                        }
                        return Ok(fallback);
                    }
                    warn!(error = %message, "Stream broke after partial output");
                    round.incomplete = true;
                    return Ok(round);
                }
            }
        }
    }

    /// Run the shared loop for one request.
    pub async fn run(
        &self,
        request: &ResponderRequest,
        plan: &VariantPlan,
        sink: Option<&dyn TokenSink>,
        cancel: &CancellationToken,
    ) -> Result<ResponderOutput, LecternError> {
        let mut output = ResponderOutput {
            guarded: self.guard_applies(&request.query, request.scaffolding),
            ..Default::default()
        };

        if request.profile.requires_retrieval {
            let found = search_with_retry(
                self.retrieval.as_ref(),
                &self.retry,
                self.search_timeout,
                &request.query,
                self.top_k,
            )
            .await?;
            Self::add_passages(&mut output.passages, found);
        }
        if plan.seed_syllabus {
            let seeded = self.syllabus_passages(&request.query).await;
            Self::add_passages(&mut output.passages, seeded);
        }

        let stream_sink = sink.filter(|_| {
            self.use_streaming && !output.guarded && request.profile.max_words.is_none()
        });

        let mut tool_results: Vec<(String, String)> = Vec::new();
        let mut calls_used = 0usize;
        // Streamed text from tool rounds was already shown, so it stays in the answer.
        let mut streamed_preamble = String::new();
        loop {
            if cancel.is_cancelled() {
                output.cancelled = true;
                output.text = streamed_preamble;
                break;
            }
            // Tools stay offered after the last allowed call so the model can
            // show whether it needed more; the budget only binds if it did.
            let tools_enabled =
                !plan.tools.is_empty() && self.max_tool_calls > 0 && !output.budget_exhausted;
            let generation = self.build_request(
                request,
                plan,
                &output.passages,
                &tool_results,
                output.budget_exhausted,
                tools_enabled,
            );
            let round = match stream_sink {
                Some(s) => self.generate_streamed(generation, s, cancel).await?,
                None => self.generate_blocking(generation, cancel).await?,
            };
            output.usage.accumulate(&round.usage);

            if round.cancelled || round.incomplete || !tools_enabled || round.tool_calls.is_empty() {
                streamed_preamble.push_str(&round.text);
                output.text = streamed_preamble;
                output.cancelled = round.cancelled;
                output.incomplete = round.incomplete;
                break;
            }

            if let Some(s) = stream_sink {
                if !round.text.trim().is_empty() {
                    streamed_preamble.push_str(&round.text);
                    if !round.text.ends_with('\n') {
                        streamed_preamble.push_str(PREAMBLE_BREAK);
                        s.on_token(PREAMBLE_BREAK).await;
                    }
                }
            }

            let mut skipped = 0usize;
            for call in round.tool_calls {
                if calls_used >= self.max_tool_calls {
                    debug!(tool = %call.name, "Skipping tool call beyond budget");
                    skipped += 1;
                    continue;
                }
                calls_used += 1;
                let (result, succeeded) = self.execute_tool(&call, &mut output.passages).await;
                debug!(tool = %call.name, succeeded, "Tool executed");
                tool_results.push((call.name.clone(), result));
                output.tool_invocations.push(ToolInvocation {
                    name: call.name,
                    arguments: call.arguments,
                    succeeded,
                });
            }
            if skipped > 0 {
                info!(
                    max_tool_calls = self.max_tool_calls,
                    skipped,
                    "Tool budget exhausted; generating best-effort answer"
                );
                output.budget_exhausted = true;
            }
        }

        if output.guarded {
            let (text, withheld) = self.withhold_solutions(&output.text);
            output.text = text;
            output.withheld = withheld;
        }
        if let Some(max_words) = request.profile.max_words {
            output.text = text::truncate_words(&output.text, max_words);
        }
        output.citations = extract_citations(&self.citation_marker, &output.text, &output.passages);

        if stream_sink.is_none() && !output.text.is_empty() {
            if let Some(s) = sink {
                s.on_token(&output.text).await;
            }
        }
        Ok(output)
    }
}

fn format_indices(indices: &[usize]) -> String {
    indices
        .iter()
        .map(|i| format!("[{i}]"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Dispatch table from responder kind to implementation.
#[derive(Default)]
pub struct ResponderRegistry {
    responders: HashMap<ResponderKind, Arc<dyn Responder>>,
}

impl ResponderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All five built-in variants sharing `engine`.
    pub fn standard(engine: Arc<ResponseEngine>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TutorResponder::new(Arc::clone(&engine))));
        registry.register(Arc::new(MathResponder::new(Arc::clone(&engine))));
        registry.register(Arc::new(CodeResponder::new(Arc::clone(&engine))));
        registry.register(Arc::new(LogisticsResponder::new(Arc::clone(&engine))));
        registry.register(Arc::new(QuickAnswerResponder::new(engine)));
        registry
    }

    /// Register a responder, replacing any previous one of the same kind.
    pub fn register(&mut self, responder: Arc<dyn Responder>) {
        self.responders.insert(responder.kind(), responder);
    }

    pub fn get(&self, kind: ResponderKind) -> Result<Arc<dyn Responder>, PipelineError> {
        self.responders
            .get(&kind)
            .cloned()
            .ok_or_else(|| PipelineError::NoResponder {
                kind: kind.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.responders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::config::RouterConfig;
    use crate::retrieval::MockRetrieval;
    use crate::syllabus::StaticSyllabus;
    use std::sync::Mutex;
    use std::time::Duration;

    pub struct RecordingSink {
        pub tokens: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self {
                tokens: Mutex::new(Vec::new()),
            }
        }

        pub fn text(&self) -> String {
            self.tokens.lock().unwrap().concat()
        }

        pub fn count(&self) -> usize {
            self.tokens.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TokenSink for RecordingSink {
        async fn on_token(&self, token: &str) {
            self.tokens.lock().unwrap().push(token.to_string());
        }
    }

    pub fn course_retrieval() -> MockRetrieval {
        MockRetrieval::new()
            .with_topic(
                "gradient",
                vec![
                    RetrievedPassage::new("lec3", "Gradient descent steps against the gradient.", 0.2),
                    RetrievedPassage::new("lec4", "The learning rate scales each step.", 0.3),
                ],
            )
            .with_topic(
                "regularization",
                vec![RetrievedPassage::new("lec6", "L2 regularization penalises large weights.", 0.25)],
            )
            .with_fallback(vec![RetrievedPassage::new("lec1", "Course overview.", 0.5)])
    }

    pub fn syllabus() -> StaticSyllabus {
        StaticSyllabus::new(vec![crate::config::SyllabusSection {
            topic: "Homework deadlines".to_string(),
            text: "Homework is due Fridays at 23:59.".to_string(),
            source_id: "syllabus#deadlines".to_string(),
        }])
    }

    pub fn engine_with(
        provider: Arc<MockLlmProvider>,
        retrieval: Arc<MockRetrieval>,
        use_streaming: bool,
    ) -> Arc<ResponseEngine> {
        let retry = RetryPolicy {
            max_retries: 1,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };
        let brain = Brain::new(provider, Duration::from_secs(2), retry);
        Arc::new(
            ResponseEngine::new(
                &RespondersConfig::default(),
                brain,
                retrieval,
                Arc::new(syllabus()),
                retry,
                use_streaming,
            )
            .unwrap(),
        )
    }

    pub fn request(query: &str, intent: Intent, level: Option<ScaffoldingLevel>) -> ResponderRequest {
        ResponderRequest {
            query: query.to_string(),
            user_role: None,
            history: Vec::new(),
            intent,
            profile: RouterConfig::default().profiles.get(intent).clone(),
            scaffolding: level,
            concepts: Vec::new(),
        }
    }
}

//! The request pipeline: policy → routing → scaffolding → responder →
//! evaluator, strictly in that order, over one [`PipelineState`].
//!
//! Policy rejections, exhausted tool budgets and unavailable services become
//! a well-formed [`ResponsePayload`]; only a [`ValidationError`] (or a
//! missing responder) aborts the request. Every run that gets past input
//! validation appends exactly one [`InteractionRecord`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::brain::Brain;
use crate::concepts::ConceptCatalog;
use crate::config::LecternConfig;
use crate::error::{ConfigError, LecternError, ValidationError};
use crate::evaluator::{Evaluation, EvaluationInput, Evaluator};
use crate::governor::Governor;
use crate::responders::{
    ResponderOutput, ResponderRegistry, ResponderRequest, ResponseEngine, TokenSink,
};
use crate::retrieval::RetrievalService;
use crate::retry::RetryPolicy;
use crate::router::IntentRouter;
use crate::scaffolding::{ConfusionDetector, ScaffoldingSelector};
use crate::state::{PipelineState, ScaffoldingOutcome, Stage};
use crate::store::{LearnerStore, with_store_timeout};
use crate::syllabus::SyllabusService;
use crate::text;
use crate::types::{
    InteractionRecord, Intent, MasteryRecord, OutcomeTag, PolicyDecision, QueryContext,
    ResponsePayload, ResponseStatus, RoutingDecision, ScaffoldingLevel,
};

/// Observer for one pipeline run. Every method defaults to a no-op.
#[async_trait]
pub trait PipelineCallback: Send + Sync {
    /// A stage is about to run.
    async fn on_stage(&self, _stage: Stage) {}

    async fn on_policy_decision(&self, _decision: &PolicyDecision) {}

    async fn on_routing(&self, _decision: &RoutingDecision) {}

    async fn on_scaffolding(&self, _level: Option<ScaffoldingLevel>, _confusion: f64) {}

    /// A fragment of response text.
    async fn on_token(&self, _token: &str) {}

    async fn on_complete(&self, _payload: &ResponsePayload) {}
}

/// A callback that ignores everything.
pub struct NoOpCallback;

#[async_trait]
impl PipelineCallback for NoOpCallback {}

/// A callback that records everything, for tests and offline inspection.
pub struct RecordingCallback {
    stages: tokio::sync::Mutex<Vec<Stage>>,
    tokens: tokio::sync::Mutex<Vec<String>>,
    decisions: tokio::sync::Mutex<Vec<PolicyDecision>>,
    routes: tokio::sync::Mutex<Vec<RoutingDecision>>,
    completed: tokio::sync::Mutex<Vec<ResponsePayload>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self {
            stages: tokio::sync::Mutex::new(Vec::new()),
            tokens: tokio::sync::Mutex::new(Vec::new()),
            decisions: tokio::sync::Mutex::new(Vec::new()),
            routes: tokio::sync::Mutex::new(Vec::new()),
            completed: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn stages(&self) -> Vec<Stage> {
        self.stages.lock().await.clone()
    }

    pub async fn tokens(&self) -> Vec<String> {
        self.tokens.lock().await.clone()
    }

    /// All streamed fragments joined.
    pub async fn streamed_text(&self) -> String {
        self.tokens.lock().await.concat()
    }

    pub async fn decisions(&self) -> Vec<PolicyDecision> {
        self.decisions.lock().await.clone()
    }

    pub async fn routes(&self) -> Vec<RoutingDecision> {
        self.routes.lock().await.clone()
    }

    pub async fn completed(&self) -> Vec<ResponsePayload> {
        self.completed.lock().await.clone()
    }
}

impl Default for RecordingCallback {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineCallback for RecordingCallback {
    async fn on_stage(&self, stage: Stage) {
        self.stages.lock().await.push(stage);
    }

    async fn on_policy_decision(&self, decision: &PolicyDecision) {
        self.decisions.lock().await.push(decision.clone());
    }

    async fn on_routing(&self, decision: &RoutingDecision) {
        self.routes.lock().await.push(decision.clone());
    }

    async fn on_token(&self, token: &str) {
        self.tokens.lock().await.push(token.to_string());
    }

    async fn on_complete(&self, payload: &ResponsePayload) {
        self.completed.lock().await.push(payload.clone());
    }
}

struct CallbackSink<'a> {
    callback: &'a dyn PipelineCallback,
}

#[async_trait]
impl TokenSink for CallbackSink<'_> {
    async fn on_token(&self, token: &str) {
        self.callback.on_token(token).await;
    }
}

/// Concept detection, confusion scoring and level selection in one place.
pub struct ScaffoldingStage {
    catalog: ConceptCatalog,
    detector: ConfusionDetector,
    selector: ScaffoldingSelector,
}

impl ScaffoldingStage {
    pub fn new(config: &LecternConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            catalog: ConceptCatalog::new(&config.concepts.catalog)?,
            detector: ConfusionDetector::new(&config.scaffolding)?,
            selector: ScaffoldingSelector::new(&config.scaffolding),
        })
    }

    /// Concept ids mentioned in `query`, in first-mention order.
    pub fn concepts(&self, query: &str) -> Vec<String> {
        self.catalog.detect(&text::normalize(query))
    }

    /// Scaffolding outcome for a routed query. Non-teaching intents get no
    /// level but still carry confusion and concepts for the evaluator.
    pub fn run(
        &self,
        query: &str,
        previous_user_turn: Option<&str>,
        intent: Intent,
        concepts: Vec<String>,
        mastery: &HashMap<String, f64>,
    ) -> ScaffoldingOutcome {
        let normalized = text::normalize(query);
        let confusion = self.detector.score_turn(&normalized, previous_user_turn);
        let prior_mastery = self.selector.prior_mastery(&concepts, mastery);
        let level = intent
            .is_teaching()
            .then(|| self.selector.select(confusion, prior_mastery));
        ScaffoldingOutcome {
            level,
            confusion,
            concepts,
            prior_mastery,
        }
    }
}

/// External collaborators the pipeline is wired to.
#[derive(Clone)]
pub struct PipelineServices {
    pub brain: Brain,
    pub retrieval: Arc<dyn RetrievalService>,
    pub syllabus: Arc<dyn SyllabusService>,
    pub store: Arc<dyn LearnerStore>,
}

/// Everything one run produced.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub payload: ResponsePayload,
    pub state: PipelineState,
    pub interaction: InteractionRecord,
    pub evaluation: Option<Evaluation>,
}

/// The tutoring request pipeline.
pub struct TutorPipeline {
    governor: Governor,
    router: IntentRouter,
    scaffolding: ScaffoldingStage,
    responders: ResponderRegistry,
    evaluator: Evaluator,
    store: Arc<dyn LearnerStore>,
    store_timeout: Duration,
}

impl TutorPipeline {
    pub fn new(config: &LecternConfig, services: PipelineServices) -> Result<Self, ConfigError> {
        let retry = RetryPolicy::from(&config.retry);
        let search_timeout = Duration::from_millis(config.retrieval.timeout_ms);
        let governor = Governor::new(&config.governor, Arc::clone(&services.retrieval), retry)?
            .with_search_timeout(search_timeout);
        let router = IntentRouter::new(&config.router, &config.scaffolding)?
            .with_classifier(services.brain.clone());
        let engine = ResponseEngine::new(
            &config.responders,
            services.brain,
            services.retrieval,
            services.syllabus,
            retry,
            config.llm.use_streaming,
        )?
        .with_search_timeout(search_timeout);
        Ok(Self {
            governor,
            router,
            scaffolding: ScaffoldingStage::new(config)?,
            responders: ResponderRegistry::standard(Arc::new(engine)),
            evaluator: Evaluator::new(&config.evaluator, &config.scaffolding)?,
            store: services.store,
            store_timeout: Duration::from_millis(config.store.timeout_ms),
        })
    }

    /// Replace the responder dispatch table.
    pub fn with_responders(mut self, responders: ResponderRegistry) -> Self {
        self.responders = responders;
        self
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn router(&self) -> &IntentRouter {
        &self.router
    }

    fn abort(&self, e: ValidationError) -> LecternError {
        error!(error = %e, "Pipeline state invalid; aborting request");
        LecternError::Validation(e)
    }

    /// Mastery snapshot for `concepts`, captured once per request:
    /// context scores override, anything else is read from the store.
    async fn mastery_snapshot(
        &self,
        ctx: &QueryContext,
        concepts: &[String],
    ) -> HashMap<String, MasteryRecord> {
        let mut snapshot = HashMap::new();
        for concept in concepts {
            if let Some(score) = ctx.prior_mastery.get(concept) {
                snapshot.insert(
                    concept.clone(),
                    MasteryRecord {
                        user_id: ctx.user_id.clone(),
                        concept: concept.clone(),
                        score: score.clamp(0.0, 1.0),
                        decay_factor: self.evaluator.decay_factor(),
                        last_assessed: Utc::now(),
                    },
                );
                continue;
            }
            let lookup = with_store_timeout(
                "get_mastery",
                self.store_timeout,
                self.store.get_mastery(&ctx.user_id, concept),
            )
            .await;
            match lookup {
                Ok(Some(record)) => {
                    snapshot.insert(concept.clone(), record);
                }
                Ok(None) => {}
                Err(e) => warn!(concept = %concept, error = %e, "Mastery lookup failed; treating as unassessed"),
            }
        }
        snapshot
    }

    async fn persist_mastery(&self, evaluation: &Evaluation) {
        for update in &evaluation.mastery_updates {
            let result = with_store_timeout(
                "upsert_mastery",
                self.store_timeout,
                self.store.upsert_mastery(update.record.clone()),
            )
            .await;
            if let Err(e) = result {
                warn!(concept = %update.concept, error = %e, "Failed to persist mastery update");
            }
        }
    }

    async fn finish(
        &self,
        state: PipelineState,
        mut payload: ResponsePayload,
        outcome: OutcomeTag,
        evaluation: Option<Evaluation>,
        callback: &dyn PipelineCallback,
    ) -> PipelineRun {
        let interaction = InteractionRecord {
            id: Uuid::new_v4(),
            user_id: state.input().user_id.clone(),
            timestamp: Utc::now(),
            intent: state.routing().intent,
            outcome,
            concept_focus: state.pedagogy().concepts.first().cloned(),
            scaffolding_level: state.pedagogy().scaffolding_level,
            approved: state.policy().approved,
            rejection_reason: state.policy().rejection_reason,
            quality_score: state.output().quality_score,
        };
        let appended = with_store_timeout(
            "append_interaction",
            self.store_timeout,
            self.store.append_interaction(interaction.clone()),
        )
        .await;
        if let Err(e) = appended {
            warn!(error = %e, "Failed to append interaction record");
        }

        payload.quality_score = state.output().quality_score;
        info!(
            user = %interaction.user_id,
            intent = interaction.intent.map(|i| i.as_str()).unwrap_or("none"),
            level = interaction.scaffolding_level.map(|l| l.as_str()).unwrap_or("none"),
            outcome = %outcome,
            quality = payload.quality_score.unwrap_or(-1.0),
            version = state.version(),
            "Pipeline run complete"
        );
        callback.on_complete(&payload).await;
        PipelineRun {
            payload,
            state,
            interaction,
            evaluation,
        }
    }

    fn payload(state: &PipelineState, status: ResponseStatus, text: String, retryable: bool) -> ResponsePayload {
        ResponsePayload {
            intent: state.routing().intent,
            scaffolding_level: state.pedagogy().scaffolding_level,
            approved: state.policy().approved,
            rejection_reason: state.policy().rejection_reason,
            text,
            citations: Vec::new(),
            quality_score: None,
            status,
            retryable,
            budget_exhausted: false,
            misconceptions: Vec::new(),
        }
    }

    async fn cancelled(
        &self,
        state: PipelineState,
        stage: Stage,
        callback: &dyn PipelineCallback,
    ) -> PipelineRun {
        info!(stage = %stage, "Request cancelled before the responder ran");
        let payload = Self::payload(&state, ResponseStatus::Partial, String::new(), true);
        self.finish(state, payload, OutcomeTag::Cancelled, None, callback)
            .await
    }

    /// Process one query end to end.
    pub async fn process(
        &self,
        ctx: &QueryContext,
        callback: &dyn PipelineCallback,
        cancel: &CancellationToken,
    ) -> Result<PipelineRun, LecternError> {
        let mut state = PipelineState::new(ctx).map_err(|e| self.abort(e))?;

        // --- Policy ---
        if cancel.is_cancelled() {
            return Ok(self.cancelled(state, Stage::Policy, callback).await);
        }
        callback.on_stage(Stage::Policy).await;
        let decision = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(self.cancelled(state, Stage::Policy, callback).await);
            }
            decision = self.governor.evaluate(&ctx.user_id, &ctx.query) => {
                decision.map_err(|e| self.abort(e))?
            }
        };
        state.apply_policy(&decision).map_err(|e| self.abort(e))?;
        callback.on_policy_decision(&decision).await;

        if let Some(reason) = decision.reason.filter(|_| !decision.approved) {
            let text = self.governor.explanation(reason).to_string();
            let payload = Self::payload(&state, ResponseStatus::Rejected, text, decision.retryable);
            return Ok(self
                .finish(state, payload, OutcomeTag::Rejected, None, callback)
                .await);
        }

        // --- Routing ---
        if cancel.is_cancelled() {
            return Ok(self.cancelled(state, Stage::Routing, callback).await);
        }
        callback.on_stage(Stage::Routing).await;
        let routing = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(self.cancelled(state, Stage::Routing, callback).await);
            }
            routing = self.router.route(&ctx.query) => routing,
        };
        state.apply_routing(&routing).map_err(|e| self.abort(e))?;
        callback.on_routing(&routing).await;
        debug!(intent = %routing.intent, rule = %routing.rule, confidence = routing.confidence, "Routed");

        // --- Scaffolding ---
        callback.on_stage(Stage::Scaffolding).await;
        let concepts = self.scaffolding.concepts(&ctx.query);
        let snapshot = self.mastery_snapshot(ctx, &concepts).await;
        let scores: HashMap<String, f64> = snapshot
            .iter()
            .map(|(concept, record)| (concept.clone(), record.score))
            .collect();
        let outcome = self.scaffolding.run(
            &ctx.query,
            ctx.previous_user_turn().map(|t| t.text.as_str()),
            routing.intent,
            concepts,
            &scores,
        );
        callback
            .on_scaffolding(outcome.level, outcome.confusion)
            .await;
        state.apply_scaffolding(outcome).map_err(|e| self.abort(e))?;

        // --- Responder ---
        if cancel.is_cancelled() {
            return Ok(self.cancelled(state, Stage::Responder, callback).await);
        }
        callback.on_stage(Stage::Responder).await;
        let responder = self.responders.get(routing.profile.responder)?;
        let request = ResponderRequest {
            query: ctx.query.clone(),
            user_role: ctx.role.clone(),
            history: ctx.history.clone(),
            intent: routing.intent,
            profile: routing.profile.clone(),
            scaffolding: state.pedagogy().scaffolding_level,
            concepts: state.pedagogy().concepts.clone(),
        };
        let sink = CallbackSink { callback };
        let response: ResponderOutput = match responder.respond(&request, Some(&sink), cancel).await {
            Ok(response) => response,
            Err(LecternError::Validation(e)) => return Err(self.abort(e)),
            Err(e @ LecternError::Pipeline(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, retryable = e.is_retryable(), "Responder failed; returning unavailable");
                let text = self.governor.unavailable_message().to_string();
                let payload =
                    Self::payload(&state, ResponseStatus::Unavailable, text, e.is_retryable());
                return Ok(self
                    .finish(state, payload, OutcomeTag::Unavailable, None, callback)
                    .await);
            }
        };
        state.apply_response(&response).map_err(|e| self.abort(e))?;

        // --- Evaluation ---
        callback.on_stage(Stage::Evaluation).await;
        let evaluation = {
            let pedagogy = state.pedagogy();
            let input = EvaluationInput {
                user_id: &ctx.user_id,
                query: &ctx.query,
                confusion: pedagogy.confusion,
                concepts: &pedagogy.concepts,
                scaffolding: pedagogy.scaffolding_level,
                response_text: &response.text,
                citations: &response.citations,
                requires_retrieval: routing.profile.requires_retrieval,
                max_words: routing.profile.max_words,
                cancelled: response.cancelled,
                incomplete: response.incomplete,
                budget_exhausted: response.budget_exhausted,
            };
            self.evaluator
                .evaluate(&input, |concept| snapshot.get(concept), Utc::now())
        };
        state.apply_evaluation(&evaluation).map_err(|e| self.abort(e))?;
        self.persist_mastery(&evaluation).await;

        let (status, outcome) = if response.cancelled && response.text.is_empty() {
            (ResponseStatus::Partial, OutcomeTag::Cancelled)
        } else if response.cancelled || response.incomplete {
            (ResponseStatus::Partial, OutcomeTag::Partial)
        } else if response.budget_exhausted {
            (ResponseStatus::Answered, OutcomeTag::BudgetExhausted)
        } else {
            (ResponseStatus::Answered, OutcomeTag::Answered)
        };
        let mut payload = Self::payload(
            &state,
            status,
            response.text.clone(),
            status == ResponseStatus::Partial,
        );
        payload.citations = response.citations.clone();
        payload.budget_exhausted = response.budget_exhausted;
        payload.misconceptions = state.output().misconceptions.clone();

        Ok(self
            .finish(state, payload, outcome, Some(evaluation), callback)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::retrieval::MockRetrieval;
    use crate::store::InMemoryStore;
    use crate::syllabus::StaticSyllabus;
    use crate::types::{RejectionReason, RetrievedPassage};

    struct Harness {
        pipeline: TutorPipeline,
        provider: Arc<MockLlmProvider>,
        store: Arc<InMemoryStore>,
    }

    fn harness() -> Harness {
        let mut config = LecternConfig::default();
        config.retry.base_backoff_ms = 1;
        config.retry.max_backoff_ms = 1;
        let provider = Arc::new(MockLlmProvider::new());
        let store = Arc::new(InMemoryStore::new());
        let retrieval = MockRetrieval::new()
            .with_topic(
                "overfitting",
                vec![RetrievedPassage::new("lec5", "Overfitting memorises noise.", 0.2)],
            )
            .with_fallback(vec![RetrievedPassage::new("misc", "Unrelated.", 1.4)]);
        let services = PipelineServices {
            brain: Brain::new(provider.clone(), Duration::from_secs(2), RetryPolicy::none()),
            retrieval: Arc::new(retrieval),
            syllabus: Arc::new(StaticSyllabus::default()),
            store: store.clone(),
        };
        Harness {
            pipeline: TutorPipeline::new(&config, services).unwrap(),
            provider,
            store,
        }
    }

    #[tokio::test]
    async fn test_answered_run_records_one_interaction() {
        let h = harness();
        h.provider.queue_text("It memorises noise in the training set [1].");
        let callback = RecordingCallback::new();
        let run = h
            .pipeline
            .process(
                &QueryContext::new("u1", "What is overfitting?"),
                &callback,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(run.payload.status, ResponseStatus::Answered);
        assert_eq!(run.payload.intent, Some(Intent::Explain));
        assert_eq!(run.payload.citations, vec!["lec5"]);
        assert!(run.payload.quality_score.is_some());
        assert_eq!(run.state.stage(), Stage::Evaluation);
        assert_eq!(
            callback.stages().await,
            vec![
                Stage::Policy,
                Stage::Routing,
                Stage::Scaffolding,
                Stage::Responder,
                Stage::Evaluation
            ]
        );
        assert_eq!(callback.streamed_text().await, run.payload.text);
        assert_eq!(h.store.all_interactions().await.len(), 1);
        assert!(
            h.store
                .get_mastery("u1", "overfitting")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_rejection_skips_later_stages() {
        let h = harness();
        let callback = RecordingCallback::new();
        let run = h
            .pipeline
            .process(
                &QueryContext::new("u1", "What is the weather today?"),
                &callback,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(run.payload.rejection_reason, Some(RejectionReason::OutOfScope));
        assert!(!run.payload.text.is_empty());
        assert_eq!(callback.stages().await, vec![Stage::Policy]);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(run.interaction.outcome, OutcomeTag::Rejected);
        assert!(run.evaluation.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_keeps_response() {
        let h = harness();
        h.store.set_fail_writes(true);
        h.provider.queue_text("Noise gets memorised [1].");
        let run = h
            .pipeline
            .process(
                &QueryContext::new("u1", "What is overfitting?"),
                &NoOpCallback,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(run.payload.status, ResponseStatus::Answered);
        assert_eq!(run.payload.text, "Noise gets memorised [1].");
    }

    #[tokio::test]
    async fn test_empty_query_aborts_without_record() {
        let h = harness();
        let err = h
            .pipeline
            .process(
                &QueryContext::new("u1", " "),
                &NoOpCallback,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LecternError::Validation(ValidationError::EmptyQuery)));
        assert!(h.store.all_interactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_logged() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let run = h
            .pipeline
            .process(&QueryContext::new("u1", "What is overfitting?"), &NoOpCallback, &cancel)
            .await
            .unwrap();
        assert_eq!(run.interaction.outcome, OutcomeTag::Cancelled);
        assert!(!run.interaction.approved);
        assert_eq!(h.store.all_interactions().await.len(), 1);
    }

    #[test]
    fn test_scaffolding_stage_non_teaching_has_no_level() {
        let stage = ScaffoldingStage::new(&LecternConfig::default()).unwrap();
        let query = "I'm confused about gradient descent in numpy";
        let concepts = stage.concepts(query);
        let outcome = stage.run(query, None, Intent::Code, concepts, &HashMap::new());
        assert!(outcome.level.is_none());
        assert!(outcome.confusion > 0.0);
        assert_eq!(outcome.concepts, vec!["gradient_descent"]);
    }
}

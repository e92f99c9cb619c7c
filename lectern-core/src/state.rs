//! Per-request pipeline state.
//!
//! Fields are grouped by the stage that owns them. Groups are readable by
//! everyone but written only through the matching `apply_*` method, which
//! takes exactly what that stage produces, checks stage ordering, bumps
//! `version`, and re-validates the invariants. A violation is a
//! [`ValidationError`]: fatal for the request.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::error::ValidationError;
use crate::evaluator::Evaluation;
use crate::responders::ResponderOutput;
use crate::types::{
    Intent, PolicyDecision, PolicyLaw, QueryContext, RejectionReason, ResponseProfile,
    RetrievedPassage, RoutingDecision, ScaffoldingLevel, Turn,
};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Policy,
    Routing,
    Scaffolding,
    Responder,
    Evaluation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Policy => "policy",
            Stage::Routing => "routing",
            Stage::Scaffolding => "scaffolding",
            Stage::Responder => "responder",
            Stage::Evaluation => "evaluation",
        }
    }

    fn predecessor(&self) -> Option<Stage> {
        match self {
            Stage::Created => None,
            Stage::Policy => Some(Stage::Created),
            Stage::Routing => Some(Stage::Policy),
            Stage::Scaffolding => Some(Stage::Routing),
            Stage::Responder => Some(Stage::Scaffolding),
            Stage::Evaluation => Some(Stage::Responder),
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only after creation.
#[derive(Debug, Clone, Serialize)]
pub struct InputFields {
    pub query: String,
    pub user_id: String,
    pub role: Option<String>,
    pub history: Vec<Turn>,
}

/// Written by the policy engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicyFields {
    pub approved: bool,
    pub rejection_reason: Option<RejectionReason>,
    pub law: Option<PolicyLaw>,
    pub min_distance: Option<f64>,
    pub retryable: bool,
}

/// Written by the intent router.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingFields {
    pub intent: Option<Intent>,
    pub profile: Option<ResponseProfile>,
    pub confidence: f64,
    pub rule: Option<String>,
}

/// Written by the scaffolding stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PedagogyFields {
    pub scaffolding_level: Option<ScaffoldingLevel>,
    pub confusion: f64,
    pub concepts: Vec<String>,
    pub prior_mastery: Option<f64>,
}

/// What the scaffolding stage produces.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaffoldingOutcome {
    pub level: Option<ScaffoldingLevel>,
    pub confusion: f64,
    pub concepts: Vec<String>,
    pub prior_mastery: f64,
}

/// Written by the responder.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalFields {
    pub passages: Vec<RetrievedPassage>,
}

/// Written by the responder and the evaluator.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputFields {
    pub text: String,
    pub citations: Vec<String>,
    pub budget_exhausted: bool,
    pub cancelled: bool,
    pub incomplete: bool,
    pub quality_score: Option<f64>,
    /// New mastery score per concept.
    pub mastery: BTreeMap<String, f64>,
    /// Mastery change per concept.
    pub mastery_delta: BTreeMap<String, f64>,
    pub misconceptions: Vec<String>,
}

/// The single record threaded through one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    version: u32,
    stage: Stage,
    input: InputFields,
    policy: PolicyFields,
    routing: RoutingFields,
    pedagogy: PedagogyFields,
    retrieval: RetrievalFields,
    output: OutputFields,
}

impl PipelineState {
    pub fn new(ctx: &QueryContext) -> Result<Self, ValidationError> {
        let state = Self {
            version: 0,
            stage: Stage::Created,
            input: InputFields {
                query: ctx.query.clone(),
                user_id: ctx.user_id.clone(),
                role: ctx.role.clone(),
                history: ctx.history.clone(),
            },
            policy: PolicyFields::default(),
            routing: RoutingFields::default(),
            pedagogy: PedagogyFields::default(),
            retrieval: RetrievalFields::default(),
            output: OutputFields::default(),
        };
        state.validate()?;
        Ok(state)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Last stage whose output was applied.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn input(&self) -> &InputFields {
        &self.input
    }

    pub fn policy(&self) -> &PolicyFields {
        &self.policy
    }

    pub fn routing(&self) -> &RoutingFields {
        &self.routing
    }

    pub fn pedagogy(&self) -> &PedagogyFields {
        &self.pedagogy
    }

    pub fn retrieval(&self) -> &RetrievalFields {
        &self.retrieval
    }

    pub fn output(&self) -> &OutputFields {
        &self.output
    }

    pub fn approved(&self) -> bool {
        self.policy.approved
    }

    fn enter(&mut self, stage: Stage) -> Result<(), ValidationError> {
        if stage > Stage::Policy && !self.policy.approved {
            return Err(ValidationError::StageAfterRejection {
                stage: stage.to_string(),
            });
        }
        if stage.predecessor() != Some(self.stage) {
            return Err(ValidationError::StageOutOfOrder {
                stage: stage.to_string(),
                previous: self.stage.to_string(),
            });
        }
        Ok(())
    }

    fn commit(&mut self, stage: Stage) -> Result<(), ValidationError> {
        self.stage = stage;
        self.version += 1;
        self.validate()
    }

    pub fn apply_policy(&mut self, decision: &PolicyDecision) -> Result<(), ValidationError> {
        self.enter(Stage::Policy)?;
        self.policy = PolicyFields {
            approved: decision.approved,
            rejection_reason: decision.reason,
            law: decision.law,
            min_distance: decision.min_distance,
            retryable: decision.retryable,
        };
        self.commit(Stage::Policy)
    }

    pub fn apply_routing(&mut self, decision: &RoutingDecision) -> Result<(), ValidationError> {
        self.enter(Stage::Routing)?;
        self.routing = RoutingFields {
            intent: Some(decision.intent),
            profile: Some(decision.profile.clone()),
            confidence: decision.confidence,
            rule: Some(decision.rule.clone()),
        };
        self.commit(Stage::Routing)
    }

    pub fn apply_scaffolding(&mut self, outcome: ScaffoldingOutcome) -> Result<(), ValidationError> {
        self.enter(Stage::Scaffolding)?;
        self.pedagogy = PedagogyFields {
            scaffolding_level: outcome.level,
            confusion: outcome.confusion,
            concepts: outcome.concepts,
            prior_mastery: Some(outcome.prior_mastery),
        };
        self.commit(Stage::Scaffolding)
    }

    pub fn apply_response(&mut self, response: &ResponderOutput) -> Result<(), ValidationError> {
        self.enter(Stage::Responder)?;
        self.retrieval.passages = response.passages.clone();
        self.output.text = response.text.clone();
        self.output.citations = response.citations.clone();
        self.output.budget_exhausted = response.budget_exhausted;
        self.output.cancelled = response.cancelled;
        self.output.incomplete = response.incomplete;
        self.commit(Stage::Responder)
    }

    pub fn apply_evaluation(&mut self, evaluation: &Evaluation) -> Result<(), ValidationError> {
        self.enter(Stage::Evaluation)?;
        self.output.quality_score = Some(evaluation.quality_score);
        self.output.misconceptions = evaluation.misconceptions.iter().map(|m| m.id.clone()).collect();
        for update in &evaluation.mastery_updates {
            self.output
                .mastery
                .insert(update.concept.clone(), update.record.score);
            self.output
                .mastery_delta
                .insert(update.concept.clone(), update.delta());
        }
        self.commit(Stage::Evaluation)
    }

    /// Check every cross-group invariant.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.input.query.trim().is_empty() {
            return Err(ValidationError::EmptyQuery);
        }
        if self.input.user_id.trim().is_empty() {
            return Err(ValidationError::EmptyUser);
        }
        if self.routing.intent.is_some() && !self.policy.approved {
            return Err(ValidationError::IntentWithoutApproval);
        }
        if self.stage >= Stage::Routing && self.routing.intent.is_none() {
            return Err(ValidationError::ApprovedWithoutIntent);
        }
        if self.pedagogy.scaffolding_level.is_some() {
            match self.routing.intent {
                Some(intent) if intent.is_teaching() => {}
                other => {
                    return Err(ValidationError::ScaffoldingForNonTeachingIntent {
                        intent: other.map(|i| i.to_string()).unwrap_or_else(|| "none".to_string()),
                    });
                }
            }
        }
        let known: HashSet<&str> = self
            .retrieval
            .passages
            .iter()
            .map(|p| p.source_id.as_str())
            .collect();
        if let Some(unknown) = self
            .output
            .citations
            .iter()
            .find(|c| !known.contains(c.as_str()))
        {
            return Err(ValidationError::UnknownCitation {
                source_id: unknown.clone(),
            });
        }
        if let Some((concept, score)) = self
            .output
            .mastery
            .iter()
            .find(|(_, s)| !(0.0..=1.0).contains(*s))
        {
            return Err(ValidationError::MasteryOutOfRange {
                concept: concept.clone(),
                score: *score,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::types::RoutingTier;

    fn ctx() -> QueryContext {
        QueryContext::new("u1", "what is overfitting?")
    }

    fn routing(intent: Intent) -> RoutingDecision {
        RoutingDecision {
            intent,
            profile: RouterConfig::default().profiles.get(intent).clone(),
            confidence: 0.8,
            rule: "explain_request".into(),
            tier: RoutingTier::Rules,
        }
    }

    fn outcome(level: Option<ScaffoldingLevel>) -> ScaffoldingOutcome {
        ScaffoldingOutcome {
            level,
            confusion: 0.0,
            concepts: vec!["overfitting".into()],
            prior_mastery: 0.5,
        }
    }

    fn routed(intent: Intent) -> PipelineState {
        let mut state = PipelineState::new(&ctx()).unwrap();
        state.apply_policy(&PolicyDecision::approve(0.3)).unwrap();
        state.apply_routing(&routing(intent)).unwrap();
        state
    }

    #[test]
    fn test_happy_path_bumps_version() {
        let mut state = routed(Intent::Explain);
        state
            .apply_scaffolding(outcome(Some(ScaffoldingLevel::Guided)))
            .unwrap();
        let response = ResponderOutput {
            text: "Memorising noise [1].".into(),
            citations: vec!["lec5".into()],
            passages: vec![RetrievedPassage::new("lec5", "text", 0.3)],
            ..Default::default()
        };
        state.apply_response(&response).unwrap();
        assert_eq!(state.stage(), Stage::Responder);
        assert_eq!(state.version(), 4);
        assert_eq!(state.output().citations, vec!["lec5"]);
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(matches!(
            PipelineState::new(&QueryContext::new("u1", "  ")),
            Err(ValidationError::EmptyQuery)
        ));
        assert!(matches!(
            PipelineState::new(&QueryContext::new("", "q")),
            Err(ValidationError::EmptyUser)
        ));
    }

    #[test]
    fn test_no_stage_after_rejection() {
        let mut state = PipelineState::new(&ctx()).unwrap();
        state
            .apply_policy(&PolicyDecision::reject(
                RejectionReason::OutOfScope,
                PolicyLaw::Scope,
            ))
            .unwrap();
        let err = state.apply_routing(&routing(Intent::Tutor)).unwrap_err();
        assert!(matches!(err, ValidationError::StageAfterRejection { .. }));
        assert!(state.routing().intent.is_none());
    }

    #[test]
    fn test_stages_must_run_in_order() {
        let mut state = PipelineState::new(&ctx()).unwrap();
        let err = state.apply_routing(&routing(Intent::Tutor)).unwrap_err();
        assert!(matches!(err, ValidationError::StageOutOfOrder { .. }));

        let mut state = routed(Intent::Tutor);
        let err = state.apply_routing(&routing(Intent::Tutor)).unwrap_err();
        assert!(matches!(err, ValidationError::StageOutOfOrder { .. }));
    }

    #[test]
    fn test_scaffolding_only_for_teaching_intents() {
        let mut state = routed(Intent::Logistics);
        let err = state
            .apply_scaffolding(outcome(Some(ScaffoldingLevel::Hint)))
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::ScaffoldingForNonTeachingIntent { .. }
        ));

        let mut state = routed(Intent::Logistics);
        state.apply_scaffolding(outcome(None)).unwrap();
    }

    #[test]
    fn test_citation_must_be_retrieved() {
        let mut state = routed(Intent::Tutor);
        state
            .apply_scaffolding(outcome(Some(ScaffoldingLevel::Guided)))
            .unwrap();
        let response = ResponderOutput {
            text: "[1]".into(),
            citations: vec!["lecture-9".into()],
            ..Default::default()
        };
        assert!(matches!(
            state.apply_response(&response),
            Err(ValidationError::UnknownCitation { .. })
        ));
    }
}

//! Derivations, formulas and proofs.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{
    ResponderOutput, ResponderRequest, Responder, ResponseEngine, TokenSink, VariantPlan,
    search_course_tool,
};
use crate::error::LecternError;
use crate::types::{ResponderKind, ScaffoldingLevel};

pub struct MathResponder {
    engine: Arc<ResponseEngine>,
}

impl MathResponder {
    pub fn new(engine: Arc<ResponseEngine>) -> Self {
        Self { engine }
    }

    /// Full intermediate steps are shown from `explained` upward; lower
    /// levels stop at the step the learner should take next.
    fn plan(level: Option<ScaffoldingLevel>) -> VariantPlan {
        let show_steps = level.is_some_and(|l| l >= ScaffoldingLevel::Explained);
        let mut plan = VariantPlan {
            tools: vec![search_course_tool()],
            ..Default::default()
        };
        plan.extra_vars
            .insert("show_steps".to_string(), Value::Bool(show_steps));
        plan
    }
}

#[async_trait]
impl Responder for MathResponder {
    fn kind(&self) -> ResponderKind {
        ResponderKind::Math
    }

    async fn respond(
        &self,
        request: &ResponderRequest,
        sink: Option<&dyn TokenSink>,
        cancel: &CancellationToken,
    ) -> Result<ResponderOutput, LecternError> {
        let plan = Self::plan(request.scaffolding);
        self.engine.run(request, &plan, sink, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::types::Intent;

    #[tokio::test]
    async fn test_show_steps_follows_level() {
        let provider = Arc::new(MockLlmProvider::new());
        let engine = engine_with(provider.clone(), Arc::new(course_retrieval()), false);
        let responder = MathResponder::new(engine);
        let cancel = CancellationToken::new();

        for level in [ScaffoldingLevel::Hint, ScaffoldingLevel::Demonstrated] {
            responder
                .respond(
                    &request("derive the gradient of the squared loss", Intent::Math, Some(level)),
                    None,
                    &cancel,
                )
                .await
                .unwrap();
        }

        let requests = provider.requests();
        assert_eq!(requests[0].template_id, "math");
        assert_eq!(requests[0].variables["show_steps"], false);
        assert_eq!(requests[1].variables["show_steps"], true);
        assert!((requests[0].temperature - 0.3).abs() < f32::EPSILON);
    }
}

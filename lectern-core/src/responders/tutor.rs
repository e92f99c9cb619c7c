//! Conceptual tutoring. Also serves the `explain` intent through its profile
//! template.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    ResponderOutput, ResponderRequest, Responder, ResponseEngine, TokenSink, VariantPlan,
    search_course_tool,
};
use crate::error::LecternError;
use crate::types::ResponderKind;

pub struct TutorResponder {
    engine: Arc<ResponseEngine>,
    plan: VariantPlan,
}

impl TutorResponder {
    pub fn new(engine: Arc<ResponseEngine>) -> Self {
        Self {
            engine,
            plan: VariantPlan {
                tools: vec![search_course_tool()],
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl Responder for TutorResponder {
    fn kind(&self) -> ResponderKind {
        ResponderKind::Tutor
    }

    async fn respond(
        &self,
        request: &ResponderRequest,
        sink: Option<&dyn TokenSink>,
        cancel: &CancellationToken,
    ) -> Result<ResponderOutput, LecternError> {
        self.engine.run(request, &self.plan, sink, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::types::{Intent, ScaffoldingLevel, Turn};

    #[tokio::test]
    async fn test_explain_uses_explain_template_and_history_window() {
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_text("Overfitting means memorising noise [1].");
        let engine = engine_with(provider.clone(), Arc::new(course_retrieval()), false);
        let mut req = request("what is overfitting?", Intent::Explain, Some(ScaffoldingLevel::Guided));
        req.history = (0..10).map(|i| Turn::user(format!("turn {i}"))).collect();

        TutorResponder::new(engine)
            .respond(&req, None, &CancellationToken::new())
            .await
            .unwrap();

        let sent = &provider.requests()[0];
        assert_eq!(sent.template_id, "explain");
        let history = sent.variables["history"].as_array().unwrap();
        assert_eq!(history.len(), 6);
        assert_eq!(history[0]["text"], "turn 4");
        assert_eq!(history[0]["role"], "user");
    }
}

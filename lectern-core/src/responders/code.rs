//! Programming and library help.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{
    ResponderOutput, ResponderRequest, Responder, ResponseEngine, TokenSink, VariantPlan,
    search_course_tool,
};
use crate::error::LecternError;
use crate::types::ResponderKind;

pub struct CodeResponder {
    engine: Arc<ResponseEngine>,
}

impl CodeResponder {
    pub fn new(engine: Arc<ResponseEngine>) -> Self {
        Self { engine }
    }

    fn plan(&self, request: &ResponderRequest) -> VariantPlan {
        let mut plan = VariantPlan {
            tools: vec![search_course_tool()],
            ..Default::default()
        };
        // Lets the template steer toward snippets instead of full programs.
        let graded = self.engine.guard_applies(&request.query, request.scaffolding);
        plan.extra_vars
            .insert("graded_work".to_string(), Value::Bool(graded));
        plan
    }
}

#[async_trait]
impl Responder for CodeResponder {
    fn kind(&self) -> ResponderKind {
        ResponderKind::Code
    }

    async fn respond(
        &self,
        request: &ResponderRequest,
        sink: Option<&dyn TokenSink>,
        cancel: &CancellationToken,
    ) -> Result<ResponderOutput, LecternError> {
        let plan = self.plan(request);
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
    async fn test_graded_work_flag_and_low_temperature() {
        let provider = Arc::new(MockLlmProvider::new());
        let engine = engine_with(provider.clone(), Arc::new(course_retrieval()), false);
        let responder = CodeResponder::new(engine);
        let cancel = CancellationToken::new();

        responder
            .respond(&request("numpy gradient shape error", Intent::Code, None), None, &cancel)
            .await
            .unwrap();
        responder
            .respond(&request("assignment 2 gradient loop is slow", Intent::Code, None), None, &cancel)
            .await
            .unwrap();

        let requests = provider.requests();
        assert_eq!(requests[0].variables["graded_work"], false);
        assert_eq!(requests[1].variables["graded_work"], true);
        assert!(requests[0].temperature <= 0.1);
        assert_eq!(requests[0].variables["level"], "none");
    }
}

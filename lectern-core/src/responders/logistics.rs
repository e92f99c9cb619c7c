//! Schedule, deadline, grading and course-structure questions.
//!
//! Syllabus sections matching the query are placed in context before the
//! first generation; the model may look up more with `syllabus_lookup`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    ResponderOutput, ResponderRequest, Responder, ResponseEngine, TokenSink, VariantPlan,
    search_course_tool, syllabus_lookup_tool,
};
use crate::error::LecternError;
use crate::types::ResponderKind;

pub struct LogisticsResponder {
    engine: Arc<ResponseEngine>,
    plan: VariantPlan,
}

impl LogisticsResponder {
    pub fn new(engine: Arc<ResponseEngine>) -> Self {
        Self {
            engine,
            plan: VariantPlan {
                tools: vec![syllabus_lookup_tool(), search_course_tool()],
                seed_syllabus: true,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl Responder for LogisticsResponder {
    fn kind(&self) -> ResponderKind {
        ResponderKind::Logistics
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
    use super::super::SYLLABUS_LOOKUP_TOOL;
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::text;
    use crate::types::Intent;

    #[tokio::test]
    async fn test_syllabus_seeded_and_answer_capped() {
        let long: Vec<String> = (0..200).map(|i| format!("word{i}")).collect();
        let provider = Arc::new(MockLlmProvider::new());
        provider.queue_text(&format!("Homework is due Friday [2]. {}", long.join(" ")));
        let sink = RecordingSink::new();
        let engine = engine_with(provider.clone(), Arc::new(course_retrieval()), true);

        let out = LogisticsResponder::new(engine)
            .respond(
                &request("when are homework deadlines?", Intent::Logistics, None),
                Some(&sink),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // Course fallback passage first, then the seeded syllabus section.
        assert_eq!(out.passages.len(), 2);
        assert_eq!(out.passages[1].source_id, "syllabus#deadlines");
        assert_eq!(out.citations, vec!["syllabus#deadlines"]);
        assert!(text::word_count(&out.text) <= 80);
        // Length-capped answers arrive as a single fragment.
        assert_eq!(sink.count(), 1);

        let sent = &provider.requests()[0];
        assert_eq!(sent.variables["max_words"], 80);
        let tool_names: Vec<&str> = sent.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tool_names, vec![SYLLABUS_LOOKUP_TOOL, "search_course"]);
    }
}

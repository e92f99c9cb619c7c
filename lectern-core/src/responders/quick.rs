//! Short factual answers. No tools; retrieval follows the profile, which
//! skips it by default.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ResponderOutput, ResponderRequest, Responder, ResponseEngine, TokenSink, VariantPlan};
use crate::error::LecternError;
use crate::types::ResponderKind;

pub struct QuickAnswerResponder {
    engine: Arc<ResponseEngine>,
    plan: VariantPlan,
}

impl QuickAnswerResponder {
    pub fn new(engine: Arc<ResponseEngine>) -> Self {
        Self {
            engine,
            plan: VariantPlan::default(),
        }
    }
}

#[async_trait]
impl Responder for QuickAnswerResponder {
    fn kind(&self) -> ResponderKind {
        ResponderKind::QuickAnswer
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

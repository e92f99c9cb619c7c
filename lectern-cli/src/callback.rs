//! Terminal callback: streams answer fragments to stdout.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use lectern_core::pipeline::PipelineCallback;
use lectern_core::state::Stage;
use lectern_core::types::{PolicyDecision, RoutingDecision, ScaffoldingLevel};

/// A CLI callback that prints tokens as they arrive.
pub(crate) struct CliCallback {
    /// Suppress token output (JSON mode prints the payload instead).
    quiet: bool,
    streamed: AtomicBool,
}

impl CliCallback {
    pub(crate) fn new(quiet: bool) -> Self {
        Self {
            quiet,
            streamed: AtomicBool::new(false),
        }
    }

    /// Whether any answer text reached stdout.
    pub(crate) fn streamed(&self) -> bool {
        self.streamed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PipelineCallback for CliCallback {
    async fn on_stage(&self, stage: Stage) {
        tracing::debug!(stage = %stage, "Stage started");
    }

    async fn on_policy_decision(&self, decision: &PolicyDecision) {
        tracing::info!(approved = decision.approved, "Policy checked");
    }

    async fn on_routing(&self, decision: &RoutingDecision) {
        tracing::info!(intent = %decision.intent, rule = %decision.rule, "Routed");
    }

    async fn on_scaffolding(&self, level: Option<ScaffoldingLevel>, confusion: f64) {
        tracing::info!(
            level = level.map(|l| l.as_str()).unwrap_or("none"),
            confusion,
            "Scaffolding selected"
        );
    }

    async fn on_token(&self, token: &str) {
        if self.quiet {
            return;
        }
        self.streamed.store(true, Ordering::Relaxed);
        print!("{token}");
        let _ = io::stdout().flush();
    }
}

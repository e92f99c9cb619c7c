//! # Lectern Core
//!
//! Core library for the Lectern course tutor.
//! Provides the request pipeline (policy gate, intent router, scaffolding,
//! responders, evaluator), the LLM interface (brain), learner persistence,
//! configuration, and fundamental types.

pub mod brain;
pub mod concepts;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod governor;
pub mod persistence;
pub mod pipeline;
pub mod prompts;
pub mod providers;
pub mod responders;
pub mod retrieval;
pub mod retry;
pub mod router;
pub mod rules;
pub mod scaffolding;
pub mod state;
pub mod store;
pub mod syllabus;
pub mod text;
pub mod types;

// Re-export commonly used types at the crate root.
pub use brain::{Brain, LlmProvider, MockLlmProvider, MockReply};
pub use config::{LecternConfig, load_config};
pub use error::{LecternError, Result};
pub use evaluator::{Evaluation, Evaluator};
pub use governor::Governor;
pub use pipeline::{
    NoOpCallback, PipelineCallback, PipelineRun, PipelineServices, RecordingCallback,
    ScaffoldingStage, TutorPipeline,
};
pub use prompts::PromptLibrary;
pub use providers::create_provider;
pub use retrieval::{HttpRetrievalClient, MockRetrieval, RetrievalService};
pub use retry::RetryPolicy;
pub use router::IntentRouter;
pub use state::{PipelineState, Stage};
pub use store::{InMemoryStore, JsonFileStore, LearnerStore};
pub use syllabus::{StaticSyllabus, SyllabusService};
pub use types::{
    InteractionRecord, Intent, MasteryRecord, OutcomeTag, PolicyDecision, QueryContext,
    RejectionReason, ResponsePayload, ResponseStatus, RoutingDecision, ScaffoldingLevel, Turn,
};

//! Error types for the Lectern pipeline core.
//!
//! Uses `thiserror` for public API error types with structured variants covering
//! the language-model layer, retrieval, persistence, configuration, pipeline-state
//! validation, and request lifecycle domains.
//!
//! Policy rejections and exhausted tool budgets are *not* errors: they are
//! recovered inside the pipeline and turned into a well-formed response payload.

use std::path::PathBuf;

/// Top-level error type for the Lectern core library.
#[derive(Debug, thiserror::Error)]
pub enum LecternError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LecternError {
    /// Whether the failure is transient (service unavailable) and the caller
    /// may retry the whole request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            LecternError::Llm(e) => e.is_transient(),
            LecternError::Retrieval(e) => e.is_transient(),
            LecternError::Store(StoreError::Timeout { .. }) => true,
            _ => false,
        }
    }
}

/// Errors from language-model invocations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Streaming error: {message}")]
    Streaming { message: String },

    #[error("Unknown prompt template: {template_id}")]
    UnknownTemplate { template_id: String },

    #[error("Template render failed for '{template_id}': {message}")]
    TemplateRender {
        template_id: String,
        message: String,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

impl LlmError {
    /// Transient failures worth one more attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Timeout { .. } | LlmError::Connection { .. }
        )
    }
}

/// Errors from the retrieval service.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Retrieval service unavailable: {message}")]
    Unavailable { message: String },

    #[error("Retrieval timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Invalid retrieval response: {message}")]
    InvalidResponse { message: String },
}

impl RetrievalError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RetrievalError::Unavailable { .. } | RetrievalError::Timeout { .. }
        )
    }
}

/// Errors from the learner store (mastery records and interaction log).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store persistence error: {message}")]
    Persistence { message: String },

    #[error("Store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Mastery score {score} for concept '{concept}' is outside [0, 1]")]
    ScoreOutOfRange { concept: String, score: f64 },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Invalid pattern in {table} table: '{pattern}': {message}")]
    InvalidPattern {
        table: String,
        pattern: String,
        message: String,
    },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Malformed pipeline state. Always a programming or integration fault:
/// fatal for the request, never silently recovered.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Query text is empty")]
    EmptyQuery,

    #[error("User identifier is empty")]
    EmptyUser,

    #[error("Intent is set but the query was not approved")]
    IntentWithoutApproval,

    #[error("Query was approved but no intent was set after routing")]
    ApprovedWithoutIntent,

    #[error("Scaffolding level set for non-teaching intent '{intent}'")]
    ScaffoldingForNonTeachingIntent { intent: String },

    #[error("Citation '{source_id}' does not refer to a retrieved passage")]
    UnknownCitation { source_id: String },

    #[error("Mastery score {score} for concept '{concept}' is outside [0, 1]")]
    MasteryOutOfRange { concept: String, score: f64 },

    #[error("Stage '{stage}' ran on a rejected request")]
    StageAfterRejection { stage: String },

    #[error("Stage '{stage}' ran out of order (after '{previous}')")]
    StageOutOfOrder { stage: String, previous: String },
}

/// Errors from the request lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Request was cancelled during stage '{stage}'")]
    Cancelled { stage: String },

    #[error("No responder registered for '{kind}'")]
    NoResponder { kind: String },
}

/// A type alias for results using the top-level `LecternError`.
pub type Result<T> = std::result::Result<T, LecternError>;

//! Language-model invocation layer.
//!
//! The [`LlmProvider`] trait abstracts over concrete backends. [`Brain`] wraps
//! a provider with the per-call timeout and the bounded retry policy, and
//! exposes streamed generation as a lazy, finite stream of [`StreamEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::retry::RetryPolicy;
use crate::types::{GenerationRequest, GenerationResponse, StreamEvent, TokenUsage, ToolCall};

/// Trait for language-model backends.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Perform a full generation and return the response.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;

    /// Perform a streaming generation, sending events to the channel.
    ///
    /// Implementations stop producing once the receiver is dropped.
    async fn generate_streaming(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// A lazy, finite, non-restartable sequence of generation events.
pub type GenerationStream = ReceiverStream<StreamEvent>;

/// Provider wrapper adding timeouts, retries and usage accounting.
#[derive(Clone)]
pub struct Brain {
    provider: Arc<dyn LlmProvider>,
    timeout: Duration,
    retry: RetryPolicy,
    default_max_tokens: Option<usize>,
    usage: Arc<Mutex<TokenUsage>>,
}

impl Brain {
    pub fn new(provider: Arc<dyn LlmProvider>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            provider,
            timeout,
            retry,
            default_max_tokens: None,
            usage: Arc::new(Mutex::new(TokenUsage::default())),
        }
    }

    /// Apply `max_tokens` to requests that do not set their own.
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.default_max_tokens = Some(max_tokens);
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Token usage accumulated across all calls made through this brain.
    pub fn total_usage(&self) -> TokenUsage {
        *self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn prepare(&self, mut request: GenerationRequest) -> GenerationRequest {
        if request.max_tokens.is_none() {
            request.max_tokens = self.default_max_tokens;
        }
        request
    }

    fn track_usage(&self, usage: &TokenUsage) {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .accumulate(usage);
    }

    async fn generate_once(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, LlmError> {
        tokio::time::timeout(self.timeout, self.provider.generate(request))
            .await
            .map_err(|_| LlmError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            })?
    }

    /// Generate a complete response, retrying transient failures.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, LlmError> {
        let request = self.prepare(request);
        debug!(
            template = %request.template_id,
            temperature = request.temperature,
            tools = request.tools.len(),
            "Generating"
        );
        let response = self
            .retry
            .run("llm.generate", LlmError::is_transient, || {
                self.generate_once(request.clone())
            })
            .await?;
        self.track_usage(&response.usage);
        Ok(response)
    }

    /// Start a streamed generation.
    ///
    /// The producer runs on its own task under the per-call timeout; a
    /// timeout or provider failure arrives as a final [`StreamEvent::Error`].
    /// Dropping the returned stream stops the producer.
    pub fn stream(&self, request: GenerationRequest) -> GenerationStream {
        let request = self.prepare(request);
        let (tx, rx) = mpsc::channel(64);
        let provider = Arc::clone(&self.provider);
        let timeout = self.timeout;
        let usage = Arc::clone(&self.usage);

        tokio::spawn(async move {
            let (inner_tx, mut inner_rx) = mpsc::channel::<StreamEvent>(64);
            let forward_tx = tx.clone();
            let forward = async move {
                while let Some(event) = inner_rx.recv().await {
                    if let StreamEvent::Done { usage: u } = &event {
                        usage
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .accumulate(u);
                    }
                    if forward_tx.send(event).await.is_err() {
                        break;
                    }
                }
            };
            let produce = tokio::time::timeout(timeout, provider.generate_streaming(request, inner_tx));
            let (result, ()) = tokio::join!(produce, forward);
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(
                    LlmError::Timeout {
                        timeout_secs: timeout.as_secs(),
                    }
                    .to_string(),
                ),
            };
            if let Some(message) = failure {
                warn!(error = %message, "Streamed generation failed");
                let _ = tx.send(StreamEvent::Error(message)).await;
            }
        });

        ReceiverStream::new(rx)
    }
}

/// A scripted reply for [`MockLlmProvider`].
#[derive(Debug)]
pub enum MockReply {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    /// Text and tool calls in one reply.
    TextWithToolCalls(String, Vec<ToolCall>),
    Fail(LlmError),
}

/// A mock LLM provider for testing and offline development.
///
/// Replies are taken from a per-template sticky table first, then from a FIFO
/// queue; an exhausted queue yields a fixed placeholder text. Every request is
/// recorded for inspection.
pub struct MockLlmProvider {
    model: String,
    queue: Mutex<VecDeque<MockReply>>,
    sticky: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<GenerationRequest>>,
    token_delay: Option<Duration>,
    call_delay: Option<Duration>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            queue: Mutex::new(VecDeque::new()),
            sticky: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            token_delay: None,
            call_delay: None,
        }
    }

    /// A provider whose every reply is `text`.
    pub fn with_response(text: &str) -> Self {
        let provider = Self::new();
        for _ in 0..20 {
            provider.queue_text(text);
        }
        provider
    }

    /// Sleep between streamed tokens.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Sleep before answering each call.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = Some(delay);
        self
    }

    pub fn queue(&self, reply: MockReply) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    pub fn queue_text(&self, text: &str) {
        self.queue(MockReply::Text(text.to_string()));
    }

    /// Queue a single tool call with a generated id.
    pub fn queue_tool_call(&self, name: &str, arguments: serde_json::Value) {
        self.queue(MockReply::ToolCalls(vec![ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4()),
            name: name.to_string(),
            arguments,
        }]));
    }

    /// Always answer `template_id` with `text`, bypassing the queue.
    pub fn set_template_reply(&self, template_id: &str, text: &str) {
        self.sticky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(template_id.to_string(), text.to_string());
    }

    /// Requests received, in call order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn next_reply(&self, request: &GenerationRequest) -> MockReply {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if let Some(text) = self
            .sticky
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.template_id)
        {
            return MockReply::Text(text.clone());
        }
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                MockReply::Text("I'm a mock LLM. No queued responses available.".to_string())
            })
    }

    fn response(&self, text: String, tool_calls: Vec<ToolCall>) -> GenerationResponse {
        let finish_reason = if tool_calls.is_empty() {
            "stop"
        } else {
            "tool_calls"
        };
        GenerationResponse {
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: text.split_whitespace().count(),
            },
            text,
            tool_calls,
            model: self.model.clone(),
            finish_reason: Some(finish_reason.to_string()),
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let reply = self.next_reply(&request);
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        match reply {
            MockReply::Text(text) => Ok(self.response(text, Vec::new())),
            MockReply::ToolCalls(calls) if request.tools.is_empty() => {
                // Tools disabled: a real model would have to answer in text.
                let names: Vec<String> = calls.into_iter().map(|c| c.name).collect();
                Ok(self.response(
                    format!("(wanted to call {} but tools are disabled)", names.join(", ")),
                    Vec::new(),
                ))
            }
            MockReply::ToolCalls(calls) => Ok(self.response(String::new(), calls)),
            MockReply::TextWithToolCalls(text, _) if request.tools.is_empty() => {
                Ok(self.response(text, Vec::new()))
            }
            MockReply::TextWithToolCalls(text, calls) => Ok(self.response(text, calls)),
            MockReply::Fail(error) => Err(error),
        }
    }

    async fn generate_streaming(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let response = self.generate(request).await?;
        for call in response.tool_calls {
            if tx.send(StreamEvent::ToolCall(call)).await.is_err() {
                return Ok(());
            }
        }
        for word in response.text.split_inclusive(char::is_whitespace) {
            if let Some(delay) = self.token_delay {
                tokio::time::sleep(delay).await;
            }
            if tx.send(StreamEvent::Token(word.to_string())).await.is_err() {
                return Ok(());
            }
        }
        let _ = tx
            .send(StreamEvent::Done {
                usage: response.usage,
            })
            .await;
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

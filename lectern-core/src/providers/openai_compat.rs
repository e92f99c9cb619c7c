//! OpenAI-compatible LLM provider.
//!
//! Works with OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio and any endpoint
//! that follows the chat-completions API. Template ids are rendered locally
//! through the [`PromptLibrary`] into a system and a user message.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::brain::LlmProvider;
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::prompts::PromptLibrary;
use crate::types::{
    GenerationRequest, GenerationResponse, StreamEvent, TokenUsage, ToolCall, ToolDefinition,
};

/// OpenAI-compatible chat-completions provider.
pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    prompts: Arc<PromptLibrary>,
}

impl OpenAiCompatibleProvider {
    /// Create a provider, reading the API key from `config.api_key_env`.
    ///
    /// Local endpoints (localhost) do not need a key.
    pub fn new(config: &LlmConfig, prompts: Arc<PromptLibrary>) -> Result<Self, LlmError> {
        let is_local = config
            .base_url
            .as_ref()
            .map(|u| u.contains("localhost") || u.contains("127.0.0.1"))
            .unwrap_or(false);

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .or_else(|| {
                if is_local {
                    debug!("No API key set for local provider; using placeholder bearer token");
                    Some("local".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| LlmError::AuthFailed {
                provider: format!(
                    "OpenAI-compatible: env var '{}' not set",
                    config.api_key_env
                ),
            })?;
        Ok(Self::new_with_key(config, api_key, prompts))
    }

    /// Create a provider with an explicitly provided API key.
    pub fn new_with_key(config: &LlmConfig, api_key: String, prompts: Arc<PromptLibrary>) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model: config.model.clone(),
            prompts,
        }
    }

    fn tools_to_json(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    fn build_body(&self, request: &GenerationRequest, stream: bool) -> Result<Value, LlmError> {
        let prompt = self
            .prompts
            .render(&request.template_id, &request.variables)?;
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
            "temperature": request.temperature,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(Self::tools_to_json(&request.tools));
        }
        Ok(body)
    }

    fn parse_tool_call(tc: &Value) -> Option<ToolCall> {
        let id = tc.get("id")?.as_str()?.to_string();
        let func = tc.get("function")?;
        let name = func.get("name")?.as_str()?.to_string();
        let args_str = func.get("arguments")?.as_str()?;
        let arguments = serde_json::from_str(args_str).unwrap_or_else(|_| json!({}));
        Some(ToolCall {
            id,
            name,
            arguments,
        })
    }

    fn parse_usage(value: Option<&Value>) -> TokenUsage {
        TokenUsage {
            input_tokens: value
                .and_then(|u| u.get("prompt_tokens"))
                .and_then(|t| t.as_u64())
                .unwrap_or(0) as usize,
            output_tokens: value
                .and_then(|u| u.get("completion_tokens"))
                .and_then(|t| t.as_u64())
                .unwrap_or(0) as usize,
        }
    }

    /// Parse a chat-completions response body.
    fn parse_response(body: &Value, model: &str) -> Result<GenerationResponse, LlmError> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No choices in response".to_string(),
            })?;
        let message = choice
            .get("message")
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No message in choice".to_string(),
            })?;

        let text = message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        let tool_calls = message
            .get("tool_calls")
            .and_then(|t| t.as_array())
            .map(|calls| calls.iter().filter_map(Self::parse_tool_call).collect())
            .unwrap_or_default();

        Ok(GenerationResponse {
            text,
            tool_calls,
            usage: Self::parse_usage(body.get("usage")),
            model: body
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(model)
                .to_string(),
            finish_reason: choice
                .get("finish_reason")
                .and_then(|f| f.as_str())
                .map(str::to_string),
        })
    }

    /// Parse a single SSE data line. `None` for comments, keep-alives and `[DONE]`.
    fn parse_sse_line(line: &str) -> Option<Value> {
        let data = line.trim().strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            return None;
        }
        serde_json::from_str(data).ok()
    }

    /// Map an HTTP status code to the appropriate error.
    fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, "Authentication failed");
                LlmError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => LlmError::RateLimited {
                retry_after_secs: 5,
            },
            502..=504 => LlmError::Connection {
                message: format!("Upstream unavailable ({status}): {body}"),
            },
            s if s >= 500 => LlmError::ApiRequest {
                message: format!("Server error ({status}): {body}"),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {status}: {body}"),
            },
        }
    }

    fn map_send_error(e: reqwest::Error) -> LlmError {
        if e.is_timeout() || e.is_connect() {
            LlmError::Connection {
                message: format!("Request failed: {e}"),
            }
        } else {
            LlmError::ApiRequest {
                message: format!("Request failed: {e}"),
            }
        }
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, "Sending chat completion request");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, &text));
        }
        Ok(response)
    }
}

/// Accumulates streamed tool-call fragments by index.
#[derive(Default)]
struct ToolCallAssembler {
    calls: BTreeMap<u64, (String, String, String)>,
}

impl ToolCallAssembler {
    fn push(&mut self, delta: &Value) {
        let index = delta.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
        let entry = self.calls.entry(index).or_default();
        if let Some(id) = delta.get("id").and_then(|i| i.as_str()) {
            entry.0 = id.to_string();
        }
        if let Some(func) = delta.get("function") {
            if let Some(name) = func.get("name").and_then(|n| n.as_str()) {
                entry.1.push_str(name);
            }
            if let Some(args) = func.get("arguments").and_then(|a| a.as_str()) {
                entry.2.push_str(args);
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter(|(_, name, _)| !name.is_empty())
            .map(|(id, name, args)| ToolCall {
                id,
                name,
                arguments: serde_json::from_str(&args).unwrap_or_else(|_| json!({})),
            })
            .collect()
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let body = self.build_body(&request, false)?;
        let response = self.post(&body).await?;
        let text = response.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {e}"),
        })?;
        let json: Value = serde_json::from_str(&text).map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid JSON: {e}"),
        })?;
        Self::parse_response(&json, &self.model)
    }

    async fn generate_streaming(
        &self,
        request: GenerationRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), LlmError> {
        let body = self.build_body(&request, true)?;
        let response = self.post(&body).await?;

        let mut usage = TokenUsage::default();
        let mut tools = ToolCallAssembler::default();
        let mut buffer = String::new();
        let mut bytes = response.bytes_stream();

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| LlmError::Streaming {
                message: format!("Failed to read stream: {e}"),
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if line == "data: [DONE]" || line == "data:[DONE]" {
                    break 'read;
                }
                let Some(data) = Self::parse_sse_line(line) else {
                    continue;
                };
                if let Some(u) = data.get("usage").filter(|u| !u.is_null()) {
                    usage = Self::parse_usage(Some(u));
                }
                let Some(delta) = data
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("delta"))
                else {
                    continue;
                };
                if let Some(content) = delta.get("content").and_then(|c| c.as_str())
                    && !content.is_empty()
                    && tx.send(StreamEvent::Token(content.to_string())).await.is_err()
                {
                    // Receiver dropped: the caller cancelled.
                    return Ok(());
                }
                if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                    for call in calls {
                        tools.push(call);
                    }
                }
            }
        }

        for call in tools.finish() {
            if tx.send(StreamEvent::ToolCall(call)).await.is_err() {
                return Ok(());
            }
        }
        let _ = tx.send(StreamEvent::Done { usage }).await;
        Ok(())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

//! Retrieval service: ranked course passages with similarity distances.
//!
//! The pipeline consumes retrieval through the [`RetrievalService`] trait. The
//! policy engine uses it for the scope check and responders use it for
//! grounding context and for the `search_course` tool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RetrievalConfig;
use crate::error::RetrievalError;
use crate::retry::RetryPolicy;
use crate::types::RetrievedPassage;

/// Vector-similarity search over course material.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Return up to `top_k` passages ranked by ascending distance
    /// (0 = identical).
    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedPassage>, RetrievalError>;
}

/// Per-attempt bound used when a caller does not configure one.
pub fn default_search_timeout() -> Duration {
    Duration::from_millis(RetrievalConfig::default().timeout_ms)
}

/// Search with the shared retry policy applied to transient failures.
///
/// Each attempt is bounded by `timeout` whatever the service does internally;
/// an elapsed attempt is a transient [`RetrievalError::Timeout`].
pub async fn search_with_retry(
    service: &dyn RetrievalService,
    retry: &RetryPolicy,
    timeout: Duration,
    query: &str,
    top_k: usize,
) -> Result<Vec<RetrievedPassage>, RetrievalError> {
    retry
        .run("retrieval.search", RetrievalError::is_transient, || async move {
            tokio::time::timeout(timeout, service.search(query, top_k))
                .await
                .unwrap_or_else(|_| {
                    Err(RetrievalError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                })
        })
        .await
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<RetrievedPassage>,
}

/// HTTP client for a retrieval service exposing `POST {base_url}/search`.
///
/// Request body: `{"query": "...", "top_k": 5}`.
/// Response body: `{"results": [{"text", "source_id", "distance"}]}`.
pub struct HttpRetrievalClient {
    client: Client,
    base_url: String,
    collection: Option<String>,
    timeout: Duration,
}

impl HttpRetrievalClient {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    fn map_http_error(status: reqwest::StatusCode, body: &str) -> RetrievalError {
        match status.as_u16() {
            429 | 502 | 503 | 504 => RetrievalError::Unavailable {
                message: format!("HTTP {status}: {body}"),
            },
            s if s >= 500 => RetrievalError::Unavailable {
                message: format!("Server error ({status}): {body}"),
            },
            _ => RetrievalError::InvalidResponse {
                message: format!("HTTP {status}: {body}"),
            },
        }
    }

    async fn search_inner(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedPassage>, RetrievalError> {
        let url = format!("{}/search", self.base_url);
        let body = SearchRequest {
            query,
            top_k,
            collection: self.collection.as_deref(),
        };

        debug!(url = %url, top_k, "Sending retrieval request");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RetrievalError::Unavailable {
                message: format!("Request failed: {e}"),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RetrievalError::Unavailable {
                message: format!("Failed to read response body: {e}"),
            })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &text));
        }

        let parsed: SearchResponse =
            serde_json::from_str(&text).map_err(|e| RetrievalError::InvalidResponse {
                message: format!("Invalid JSON: {e}"),
            })?;

        let mut results = parsed.results;
        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results.truncate(top_k);
        Ok(results)
    }
}

#[async_trait]
impl RetrievalService for HttpRetrievalClient {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedPassage>, RetrievalError> {
        tokio::time::timeout(self.timeout, self.search_inner(query, top_k))
            .await
            .map_err(|_| RetrievalError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })?
    }
}

/// A scripted retrieval service for tests and offline runs.
///
/// Topics map a keyword (matched case-insensitively as a substring) to the
/// passages returned for it; queries matching no topic get the fallback set.
pub struct MockRetrieval {
    topics: Vec<(String, Vec<RetrievedPassage>)>,
    fallback: Vec<RetrievedPassage>,
    failures: Mutex<VecDeque<RetrievalError>>,
    always_fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl MockRetrieval {
    /// No topics; every query gets an empty result set.
    pub fn new() -> Self {
        Self {
            topics: Vec::new(),
            fallback: Vec::new(),
            failures: Mutex::new(VecDeque::new()),
            always_fail: false,
            delay: None,
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Passages for queries containing `keyword`.
    pub fn with_topic(mut self, keyword: &str, passages: Vec<RetrievedPassage>) -> Self {
        self.topics.push((keyword.to_lowercase(), passages));
        self
    }

    /// Passages for queries matching no topic.
    pub fn with_fallback(mut self, passages: Vec<RetrievedPassage>) -> Self {
        self.fallback = passages;
        self
    }

    /// Fail the next call with `error`; repeatable.
    pub fn fail_next(self, error: RetrievalError) -> Self {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
        self
    }

    /// Every call fails with `Unavailable`.
    pub fn always_unavailable(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Sleep before answering (for timeout tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Queries received, in call order.
    pub fn queries(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MockRetrieval {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RetrievalService for MockRetrieval {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedPassage>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(query.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_fail {
            return Err(RetrievalError::Unavailable {
                message: "mock retrieval is unavailable".to_string(),
            });
        }
        let scripted = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        let lowered = query.to_lowercase();
        let mut results: Vec<RetrievedPassage> = self
            .topics
            .iter()
            .filter(|(keyword, _)| lowered.contains(keyword.as_str()))
            .flat_map(|(_, passages)| passages.iter().cloned())
            .collect();
        if results.is_empty() {
            results = self.fallback.clone();
        }
        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results.dedup_by(|a, b| a.source_id == b.source_id);
        results.truncate(top_k);
        Ok(results)
    }
}

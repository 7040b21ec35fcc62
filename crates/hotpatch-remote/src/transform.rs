//! Transform service: instruction-driven file rewriting
//!
//! The workflow treats the model as an opaque function from
//! `(current content, instruction, recent history)` to new content. The
//! Anthropic implementation keeps no conversation state of its own; any
//! context arrives through the request's `history`.

use async_trait::async_trait;
use hotpatch_core::{HotpatchError, MemoryEntry, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreaker;
use crate::types::{AnthropicMessage, AnthropicRequest, AnthropicResponse, Model};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: usize = 16000;

// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_SECS: u64 = 5;
const MAX_BACKOFF_SECS: u64 = 60;

const SYSTEM_PROMPT: &str = "You are a developer assistant editing a single source file. \
Return ONLY the complete, updated file content. No explanations, no markdown fences, \
no commentary before or after the code.";

/// Input to a single transform call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    /// Short target identifier the operator used
    pub target_key: String,
    /// Path of the file inside its repository
    pub file_path: String,
    pub current_content: String,
    pub instruction: String,
    /// Recent conversation memory for the target, oldest first
    pub history: Vec<MemoryEntry>,
}

/// Trait for the content rewriting function
#[async_trait]
pub trait TransformService: Send + Sync {
    /// Produce the proposed new content for `request`
    async fn transform(&self, request: &TransformRequest) -> Result<String>;
}

/// Build the user prompt sent to the model
pub fn build_transform_prompt(request: &TransformRequest) -> String {
    let mut prompt = format!(
        "This is the full file `{}` for {}:\n\n{}\n\nUpdate it to:\n\n{}",
        request.file_path, request.target_key, request.current_content, request.instruction
    );

    if !request.history.is_empty() {
        prompt.push_str("\n\nRecent history for this file (oldest first):\n");
        for entry in &request.history {
            let role = match entry.role {
                hotpatch_core::MemoryRole::User => "operator",
                hotpatch_core::MemoryRole::Assistant => "assistant",
            };
            prompt.push_str(&format!(
                "- [{}] {}: {}\n",
                entry.timestamp.format("%Y-%m-%d %H:%M"),
                role,
                entry.content
            ));
        }
    }

    prompt
}

/// Longest preamble line ("Here is the updated file:") allowed before a fence
const MAX_PREAMBLE_CHARS: usize = 120;

fn is_preamble(line: &str) -> bool {
    !line.contains("```")
        && line.trim_end().ends_with(':')
        && line.chars().count() <= MAX_PREAMBLE_CHARS
}

/// Strip a markdown fence wrapped around the code a model returned
///
/// Only a reply that opens with a fence line, or with one short preamble line
/// ending in `:` and then a fence line, is unwrapped; the body runs to the next line that is
/// exactly a closing fence. Anything else is returned trimmed, so backticks
/// inside the file's own code are left alone.
pub fn clean_model_output(raw: &str) -> String {
    let trimmed = raw.trim();
    let lines: Vec<&str> = trimmed.lines().collect();

    let opening = match lines.iter().position(|l| l.starts_with("```")) {
        Some(0) => 0,
        Some(1) if is_preamble(lines[0]) => 1,
        _ => return trimmed.to_string(),
    };

    let body = &lines[opening + 1..];
    let closing = body
        .iter()
        .position(|l| l.trim() == "```")
        .unwrap_or(body.len());

    body[..closing].join("\n").trim_end().to_string()
}

/// Anthropic Messages API transform
pub struct AnthropicTransform {
    client: reqwest::Client,
    api_key: String,
    api_url: String,
    model: Model,
    max_tokens: usize,
    circuit_breaker: CircuitBreaker,
}

impl AnthropicTransform {
    /// Create a transform using `api_key`
    pub fn new(api_key: impl Into<String>, model: Model) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            api_url: ANTHROPIC_API_URL.to_string(),
            model,
            max_tokens: DEFAULT_MAX_TOKENS,
            circuit_breaker: CircuitBreaker::default(),
        }
    }

    /// Set max tokens for responses
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Point at a different endpoint (proxies, recorded fixtures)
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn build_request(&self, request: &TransformRequest) -> AnthropicRequest {
        AnthropicRequest {
            model: self.model.api_name().to_string(),
            max_tokens: self.max_tokens,
            temperature: 0.2,
            system: SYSTEM_PROMPT.to_string(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: build_transform_prompt(request),
            }],
        }
    }
}

#[async_trait]
impl TransformService for AnthropicTransform {
    async fn transform(&self, request: &TransformRequest) -> Result<String> {
        tracing::info!(
            "Requesting rewrite of {} ({}) with model {}",
            request.file_path,
            request.target_key,
            self.model
        );

        if !self.circuit_breaker.can_execute() {
            return Err(HotpatchError::ApiLimit(format!(
                "Circuit breaker is OPEN after repeated model failures. Retry in {} seconds.",
                self.circuit_breaker.time_until_retry().as_secs()
            )));
        }

        let body = self.build_request(request);
        let mut retries = 0;
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            tracing::debug!("Sending request to Anthropic API (attempt {})", retries + 1);

            let response = self
                .client
                .post(&self.api_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    self.circuit_breaker.record_failure();
                    HotpatchError::Api(format!("Failed to send request: {}", e))
                })?;

            let status = response.status();

            if status.as_u16() == 429 || (status.is_server_error() && retries < MAX_RETRIES) {
                retries += 1;
                if retries > MAX_RETRIES {
                    self.circuit_breaker.record_failure();
                    return Err(HotpatchError::ApiLimit(format!(
                        "Rate limit exceeded after {} retries",
                        MAX_RETRIES
                    )));
                }

                let wait_secs = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                tracing::warn!(
                    "Model API returned {}. Waiting {} seconds before retry {}/{}",
                    status,
                    wait_secs,
                    retries,
                    MAX_RETRIES
                );

                tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown".to_string());
                self.circuit_breaker.record_failure();
                return Err(HotpatchError::Api(format!(
                    "Anthropic API error {}: {}",
                    status, error_text
                )));
            }

            let parsed: AnthropicResponse = response
                .json()
                .await
                .map_err(|e| HotpatchError::Api(format!("Failed to parse response: {}", e)))?;

            let text: String = parsed
                .content
                .iter()
                .map(|block| block.text.as_str())
                .collect::<Vec<_>>()
                .join("");
            if text.trim().is_empty() {
                self.circuit_breaker.record_failure();
                return Err(HotpatchError::Transform(
                    "Model returned no content".to_string(),
                ));
            }

            self.circuit_breaker.record_success();

            if let Some(usage) = &parsed.usage {
                tracing::info!(
                    "Rewrite of {} complete ({} chars, {} input tokens, {} output tokens)",
                    request.file_path,
                    text.len(),
                    usage.input_tokens,
                    usage.output_tokens
                );
            }

            return Ok(clean_model_output(&text));
        }
    }
}

/// Transform that replays queued replies and records every request
///
/// Each call pops the next reply; an empty queue is a transform error.
#[derive(Debug, Default)]
pub struct ScriptedTransform {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    requests: Mutex<Vec<TransformRequest>>,
    delay: Option<Duration>,
}

impl ScriptedTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply
    pub fn then_reply(self, content: impl Into<String>) -> Self {
        self.lock_replies().push_back(Ok(content.into()));
        self
    }

    /// Queue a failure
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.lock_replies().push_back(Err(message.into()));
        self
    }

    /// Sleep before answering (exercises caller timeouts)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<TransformRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_replies(&self) -> std::sync::MutexGuard<'_, VecDeque<std::result::Result<String, String>>> {
        self.replies.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TransformService for ScriptedTransform {
    async fn transform(&self, request: &TransformRequest) -> Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self.lock_replies().pop_front();
        match reply {
            Some(Ok(content)) => Ok(content),
            Some(Err(message)) => Err(HotpatchError::Transform(message)),
            None => Err(HotpatchError::Transform("no scripted reply left".to_string())),
        }
    }
}

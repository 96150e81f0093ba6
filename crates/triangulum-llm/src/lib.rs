//! LLM client interface (§6 "External Interfaces"): the core depends only on
//! [`LlmClient`], never on a concrete provider. The semantic and contextual
//! analyzer roles call `query` with a composed prompt and get back raw text,
//! which they parse with [`codec::parse_json_response`] since providers
//! routinely wrap JSON answers in a code fence.
//!
//! [`ScriptedLlmClient`] drives deterministic tests; [`HttpLlmClient`] is a
//! thin single-provider HTTP implementation for real deployments.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod codec;
pub mod config;

use std::num::NonZeroU32;
use std::sync::Mutex;
use std::time::Instant;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use secrecy::ExposeSecret;
use tracing::{debug, instrument, warn};

pub use config::Config;

/// Default client-side rate limit, in requests per minute, when unconfigured.
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// Outcome of [`LlmClient::health_check`], matching §6's `{healthy, latency-ms}` shape.
#[derive(Debug, Clone, Copy)]
pub struct HealthStatus {
    /// Whether the provider responded successfully within its configured timeout.
    pub healthy: bool,
    /// Round-trip latency of the health probe.
    pub latency_ms: u64,
}

/// The interface the coordination core depends on for every LLM call.
///
/// Implementations must not panic on malformed provider output; a failed
/// call is always an `Err`, never a panic, so the worker pool's retry and
/// circuit-breaker machinery can act on it.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Send `prompt` to the model and return its raw text response.
    async fn query(&self, prompt: &str) -> anyhow::Result<String>;

    /// Probe provider reachability. Implementations that have no cheap
    /// reachability endpoint fall back to a minimal query.
    async fn health_check(&self) -> anyhow::Result<HealthStatus>;
}

type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Reqwest-based [`LlmClient`] for a single HTTP provider speaking a
/// chat-completions-style JSON API, rate limited client-side with `governor`.
pub struct HttpLlmClient {
    http: reqwest::Client,
    config: Config,
    limiter: GovernorLimiter,
}

/// Minimal chat-completions request body; providers that need a different
/// shape can wrap this client or implement [`LlmClient`] directly.
#[derive(serde::Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(serde::Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(serde::Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(serde::Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(serde::Deserialize)]
struct ResponseMessage {
    content: String,
}

impl HttpLlmClient {
    /// Build a client from `config`, with its own HTTP connection pool and
    /// client-side token bucket sized to `config.rate_limit()` per minute.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout()).build()?;
        let per_minute =
            NonZeroU32::new(config.rate_limit().max(1)).expect("rate_limit floor of 1 is nonzero");
        let limiter = RateLimiter::direct(Quota::per_minute(per_minute));
        Ok(Self { http, config, limiter })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.config.api_key().expose_secret())
    }
}

#[async_trait::async_trait]
impl LlmClient for HttpLlmClient {
    #[instrument(skip(self, prompt), fields(model = %self.config.model_name()))]
    async fn query(&self, prompt: &str) -> anyhow::Result<String> {
        if self.limiter.check().is_err() {
            anyhow::bail!("llm client rate limit exceeded for model {}", self.config.model_name());
        }

        let body = CompletionRequest {
            model: self.config.model_name(),
            messages: vec![ChatMessage { role: "user", content: prompt }],
        };

        let response = self
            .http
            .post(self.config.base_url())
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("llm provider returned status {}", response.status());
        }

        let parsed: CompletionResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("llm provider returned no choices"))?;

        debug!(bytes = content.len(), "received llm response");
        Ok(content)
    }

    async fn health_check(&self) -> anyhow::Result<HealthStatus> {
        let started = Instant::now();
        let result = self.query("ping").await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => Ok(HealthStatus { healthy: true, latency_ms }),
            Err(err) => {
                warn!(error = %err, "llm health check failed");
                Ok(HealthStatus { healthy: false, latency_ms })
            }
        }
    }
}

/// Deterministic [`LlmClient`] for tests: returns canned responses in order,
/// cycling the last one once exhausted, and records every prompt it saw.
pub struct ScriptedLlmClient {
    responses: Vec<String>,
    calls: Mutex<Vec<String>>,
    healthy: bool,
}

impl ScriptedLlmClient {
    /// Build a scripted client that returns each of `responses` in order.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            calls: Mutex::new(Vec::new()),
            healthy: true,
        }
    }

    /// Build a scripted client whose [`LlmClient::health_check`] reports unhealthy.
    pub fn unhealthy() -> Self {
        Self {
            responses: Vec::new(),
            calls: Mutex::new(Vec::new()),
            healthy: false,
        }
    }

    /// Prompts seen so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("scripted client mutex poisoned").clone()
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn query(&self, prompt: &str) -> anyhow::Result<String> {
        let mut calls = self.calls.lock().expect("scripted client mutex poisoned");
        let index = calls.len().min(self.responses.len().saturating_sub(1));
        calls.push(prompt.to_string());
        self.responses
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("scripted llm client has no responses configured"))
    }

    async fn health_check(&self) -> anyhow::Result<HealthStatus> {
        Ok(HealthStatus {
            healthy: self.healthy,
            latency_ms: 0,
        })
    }
}

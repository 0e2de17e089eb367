//! The provider router: one `generate` contract over heterogeneous
//! LLM backends.
//!
//! The router resolves a model alias to a provider, shapes the request
//! through that provider's adapter, enforces timeouts and cancellation,
//! post-processes the text (fence stripping, HTML intake check), and
//! never silently switches providers. Fallback policy belongs to the
//! iteration strategies above it.

use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::providers::{
    AnthropicAdapter, GeminiAdapter, OllamaAdapter, OpenAiCompatAdapter, ProviderAdapter,
    ProviderSettings, ShapedRequest, StreamFormat,
};
use super::types::{
    estimate_tokens, pricing_for, ChunkSink, GenerateMeta, GenerateOptions, ProviderKind,
};
use crate::error::{Error, Result};

/// Default max output tokens when the caller does not specify.
pub const DEFAULT_MAX_TOKENS: u32 = 8_192;

/// The uniform generation seam. The router implements it against real
/// providers; strategies and the pipeline accept any implementation.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<(String, GenerateMeta)>;

    /// Which provider family an alias would route to. Stub generators
    /// keep the default.
    fn detect(&self, _alias: &str) -> ProviderKind {
        ProviderKind::Gemini
    }
}

/// One row of the models listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub provider: String,
    pub alias: String,
    pub model: String,
    pub available: bool,
}

fn build_http_client() -> Client {
    // Proxy auto-detection can panic in some sandboxed environments;
    // fall back to a no-proxy client. Per-request timeouts are applied
    // at call sites because they differ per provider.
    match catch_unwind(AssertUnwindSafe(|| Client::builder().build())) {
        Ok(Ok(client)) => client,
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .build()
            .expect("Failed to create HTTP client"),
    }
}

/// Per-provider connection settings for [`Router::new`].
#[derive(Debug, Clone, Default)]
pub struct RouterSettings {
    pub gemini: ProviderSettings,
    pub openai: ProviderSettings,
    pub anthropic: ProviderSettings,
    pub ollama: ProviderSettings,
    /// Alias used when a request names no model.
    pub default_alias: String,
}

/// Uniform facade over the provider adapters.
pub struct Router {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    default_alias: String,
    http: Client,
}

impl Router {
    pub fn new(settings: RouterSettings) -> Self {
        let default_alias = if settings.default_alias.is_empty() {
            "gemini".to_string()
        } else {
            settings.default_alias.clone()
        };
        Self {
            adapters: vec![
                Arc::new(GeminiAdapter::new(settings.gemini)),
                Arc::new(OpenAiCompatAdapter::new(settings.openai)),
                Arc::new(AnthropicAdapter::new(settings.anthropic)),
                Arc::new(OllamaAdapter::new(settings.ollama)),
            ],
            default_alias,
            http: build_http_client(),
        }
    }

    fn classify(alias: &str) -> Option<ProviderKind> {
        let a = alias.to_ascii_lowercase();
        if a.starts_with("gemini") || a == "flash" {
            Some(ProviderKind::Gemini)
        } else if a.starts_with("gpt") || a.starts_with("o1") || a == "openai" {
            Some(ProviderKind::OpenAiCompat)
        } else if a.starts_with("claude") || a == "sonnet" || a == "haiku" {
            Some(ProviderKind::Anthropic)
        } else if a.starts_with("llama")
            || a.starts_with("mistral")
            || a.starts_with("qwen")
            || a.starts_with("gemma")
            || a == "ollama"
            || a == "local"
        {
            Some(ProviderKind::Ollama)
        } else {
            None
        }
    }

    /// Map a model alias to a provider. Total: unknown aliases route to
    /// the default alias's provider.
    pub fn detect_provider(&self, alias: &str) -> ProviderKind {
        Self::classify(alias)
            .or_else(|| Self::classify(&self.default_alias))
            .unwrap_or(ProviderKind::Gemini)
    }

    fn adapter_for(&self, kind: ProviderKind) -> &Arc<dyn ProviderAdapter> {
        self.adapters
            .iter()
            .find(|a| a.kind() == kind)
            .expect("router constructed with every provider kind")
    }

    /// Every known alias across providers, with availability.
    pub fn models(&self) -> Vec<ModelInfo> {
        self.adapters
            .iter()
            .flat_map(|adapter| {
                let available = adapter.available();
                let provider = adapter.kind().to_string();
                adapter.aliases().into_iter().map(move |(alias, model)| ModelInfo {
                    provider: provider.clone(),
                    alias: alias.to_string(),
                    model: model.to_string(),
                    available,
                })
            })
            .collect()
    }

    /// Providers that currently have credentials (or are local).
    pub fn available_providers(&self) -> Vec<ProviderKind> {
        self.adapters
            .iter()
            .filter(|a| a.available())
            .map(|a| a.kind())
            .collect()
    }

    async fn consume_stream(
        &self,
        response: reqwest::Response,
        adapter: &Arc<dyn ProviderAdapter>,
        sink: &Arc<dyn ChunkSink>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let format = adapter.stream_format();
        let mut aggregated = String::new();
        let mut pending = String::new();
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = stream.next() => chunk,
            };
            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(Error::Stream(e.to_string())),
                None => break,
            };
            pending.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let payload = match format {
                    StreamFormat::Sse => match line.strip_prefix("data:") {
                        Some(data) => data.trim(),
                        None => continue,
                    },
                    StreamFormat::NdJson => line,
                };
                if payload == "[DONE]" {
                    continue;
                }
                let value: Value = match serde_json::from_str(payload) {
                    Ok(v) => v,
                    Err(e) => {
                        return Err(Error::Stream(format!("bad stream payload: {}", e)));
                    }
                };
                if let Some(text) = adapter.extract_chunk(&value) {
                    sink.send(&text);
                    aggregated.push_str(&text);
                }
            }
        }

        if aggregated.is_empty() {
            return Err(Error::empty_response(adapter.kind().to_string()));
        }
        Ok(aggregated)
    }
}

#[async_trait::async_trait]
impl Generator for Router {
    fn detect(&self, alias: &str) -> ProviderKind {
        self.detect_provider(alias)
    }

    async fn generate(
        &self,
        prompt: &str,
        opts: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<(String, GenerateMeta)> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let alias = opts.model.as_deref().unwrap_or(&self.default_alias);
        let kind = self.detect_provider(alias);
        let adapter = self.adapter_for(kind);

        if !adapter.available() {
            return Err(Error::NotConfigured(format!(
                "provider {} has no credentials",
                kind
            )));
        }

        let model = adapter.resolve_alias(alias);
        let streaming = opts.chunk_sink.is_some();
        let body = adapter.shape_request(&ShapedRequest {
            model: &model,
            system: opts.system.as_deref(),
            prompt,
            max_tokens: opts.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: opts.temperature,
            stream: streaming,
        });

        let timeout = adapter.timeout();
        let mut request = self
            .http
            .post(adapter.endpoint(&model, streaming))
            .timeout(timeout)
            .header("content-type", "application/json");
        for (name, value) in adapter.headers() {
            request = request.header(name, value);
        }

        tracing::debug!(provider = %kind, %model, streaming, "dispatching generate request");
        let started = Instant::now();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = request.json(&body).send() => response,
        }
        .map_err(|e| {
            if e.is_timeout() {
                Error::timeout(timeout.as_millis() as u64)
            } else {
                Error::provider(kind.to_string(), e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = adapter
                .error_message(&body)
                .unwrap_or_else(|| format!("{}: {}", status, body));
            return Err(Error::provider(kind.to_string(), message));
        }

        let raw = if let Some(sink) = &opts.chunk_sink {
            self.consume_stream(response, adapter, sink, cancel).await?
        } else {
            let body = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                body = response.text() => body,
            }
            .map_err(|e| Error::provider(kind.to_string(), e.to_string()))?;
            let value: Value = serde_json::from_str(&body)
                .map_err(|e| Error::provider(kind.to_string(), format!("unparseable response: {}", e)))?;
            adapter.extract_text(&value)?
        };

        let html = postprocess(&raw)?;
        let duration_ms = started.elapsed().as_millis() as u64;
        let tokens_in_est = estimate_tokens(prompt) + opts.system.as_deref().map_or(0, estimate_tokens);
        let tokens_out_est = estimate_tokens(&html);
        let cost_est = pricing_for(&model).cost(tokens_in_est, tokens_out_est);

        tracing::info!(provider = %kind, %model, duration_ms, tokens_out_est, "generation complete");
        Ok((
            html,
            GenerateMeta {
                provider: kind,
                resolved_model: model,
                duration_ms,
                tokens_in_est,
                tokens_out_est,
                cost_est,
            },
        ))
    }
}

/// Strip markdown fences, trim, and enforce the HTML intake contract.
pub fn postprocess(raw: &str) -> Result<String> {
    let text = strip_fences(raw);
    let lower = text.to_lowercase();
    if lower.contains("<!doctype") || lower.contains("<html") {
        Ok(text)
    } else {
        let preview: String = text.chars().take(80).collect();
        Err(Error::MalformedOutput(format!(
            "output is not an HTML document: {:?}",
            preview
        )))
    }
}

/// Remove a leading and trailing triple-backtick fence, if present.
pub fn strip_fences(raw: &str) -> String {
    let mut text = raw.trim();

    if text.starts_with("```") {
        match text.find('\n') {
            Some(newline) => text = text[newline + 1..].trim_start(),
            None => text = "",
        }
    }
    if let Some(stripped) = text.trim_end().strip_suffix("```") {
        text = stripped.trim_end();
    }
    text.trim().to_string()
}

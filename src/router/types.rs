//! Router types: provider kinds, generate options, metadata, pricing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::store::short_id;

/// An LLM backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gemini,
    OpenAiCompat,
    Anthropic,
    Ollama,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gemini => write!(f, "gemini"),
            Self::OpenAiCompat => write!(f, "openai"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Ollama => write!(f, "ollama"),
        }
    }
}

/// Receiver for streamed generation chunks.
///
/// Threaded through `Router::generate` instead of an ad-hoc callback;
/// the aggregated text is still post-processed and validated after the
/// stream completes.
pub trait ChunkSink: Send + Sync {
    fn send(&self, chunk: &str);
}

impl ChunkSink for tokio::sync::mpsc::UnboundedSender<String> {
    fn send(&self, chunk: &str) {
        let _ = self.send(chunk.to_string());
    }
}

/// Options for a single generate call.
#[derive(Clone, Default)]
pub struct GenerateOptions {
    /// Model alias; the adapter resolves it to a concrete model id.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// System instruction, built by the enhancer.
    pub system: Option<String>,
    /// When set, the provider stream is consumed chunk-by-chunk into
    /// this sink; otherwise the call is a single round trip.
    pub chunk_sink: Option<Arc<dyn ChunkSink>>,
}

impl std::fmt::Debug for GenerateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerateOptions")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("system", &self.system.as_deref().map(|s| s.len()))
            .field("streaming", &self.chunk_sink.is_some())
            .finish()
    }
}

impl GenerateOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_chunk_sink(mut self, sink: Arc<dyn ChunkSink>) -> Self {
        self.chunk_sink = Some(sink);
        self
    }
}

/// Metadata for one completed generate call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateMeta {
    pub provider: ProviderKind,
    pub resolved_model: String,
    pub duration_ms: u64,
    pub tokens_in_est: u64,
    pub tokens_out_est: u64,
    pub cost_est: f64,
}

/// A completed generation with its artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub id: String,
    pub provider: ProviderKind,
    pub model: String,
    pub prompt_hash: String,
    pub html: String,
    pub tokens_in_est: u64,
    pub tokens_out_est: u64,
    pub cost_est: f64,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

impl Generation {
    pub fn new(prompt: &str, html: String, meta: &GenerateMeta) -> Self {
        Self {
            id: short_id(),
            provider: meta.provider,
            model: meta.resolved_model.clone(),
            prompt_hash: prompt_hash(prompt),
            html,
            tokens_in_est: meta.tokens_in_est,
            tokens_out_est: meta.tokens_out_est,
            cost_est: meta.cost_est,
            duration_ms: meta.duration_ms,
            at: Utc::now(),
        }
    }
}

/// Stable hash of an enhanced prompt (first 16 hex chars of SHA-256).
pub fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

/// Rough token estimate when a provider reports no usage: chars / 4.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}

/// Per-model pricing in USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

impl ModelPricing {
    pub const fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    pub fn cost(&self, in_tokens: u64, out_tokens: u64) -> f64 {
        (in_tokens as f64 / 1_000_000.0) * self.input_per_m
            + (out_tokens as f64 / 1_000_000.0) * self.output_per_m
    }

    /// Local models cost nothing.
    pub const fn free() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// Pricing lookup by resolved model id; unknown models price as zero.
pub fn pricing_for(model: &str) -> ModelPricing {
    match model {
        m if m.starts_with("gemini-2.0-flash") => ModelPricing::new(0.075, 0.30),
        m if m.starts_with("gemini-1.5-pro") => ModelPricing::new(1.25, 5.00),
        m if m.starts_with("gemini-1.5-flash") => ModelPricing::new(0.075, 0.30),
        m if m.starts_with("gpt-4o-mini") => ModelPricing::new(0.15, 0.60),
        m if m.starts_with("gpt-4o") => ModelPricing::new(2.5, 10.0),
        m if m.starts_with("claude-3-5-sonnet") => ModelPricing::new(3.0, 15.0),
        m if m.starts_with("claude-3-5-haiku") => ModelPricing::new(0.8, 4.0),
        _ => ModelPricing::free(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_prompt_hash_stable_and_short() {
        let a = prompt_hash("build a habit tracker");
        let b = prompt_hash("build a habit tracker");
        let c = prompt_hash("build a chess clock");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = pricing_for("gpt-4o");
        let cost = pricing.cost(1_000_000, 1_000_000);
        assert!((cost - 12.5).abs() < 1e-9);

        let free = pricing_for("llama3.2");
        assert_eq!(free.cost(1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn test_generation_carries_prompt_hash() {
        let meta = GenerateMeta {
            provider: ProviderKind::Gemini,
            resolved_model: "gemini-2.0-flash".to_string(),
            duration_ms: 900,
            tokens_in_est: 50,
            tokens_out_est: 200,
            cost_est: 0.0001,
        };
        let generation = Generation::new("p", "<html></html>".to_string(), &meta);
        assert_eq!(generation.prompt_hash, prompt_hash("p"));
        assert_eq!(generation.id.len(), 12);
    }

    #[test]
    fn test_options_builder() {
        let opts = GenerateOptions::default()
            .with_model("gemini")
            .with_max_tokens(4096)
            .with_temperature(0.9)
            .with_system("html only");
        assert_eq!(opts.model.as_deref(), Some("gemini"));
        assert_eq!(opts.max_tokens, Some(4096));
        assert!(opts.chunk_sink.is_none());
    }
}

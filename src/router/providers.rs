//! Provider adapters.
//!
//! Each adapter supplies the four things the router needs: an alias map,
//! a request-body shaper, a response extractor, and an availability
//! check. The router never looks inside a provider's wire format.

use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::types::ProviderKind;
use crate::error::{Error, Result};

/// How a provider frames its streaming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// `data: {...}` server-sent-event lines.
    Sse,
    /// One JSON object per line.
    NdJson,
}

/// Everything an adapter needs to shape one request.
#[derive(Debug, Clone, Copy)]
pub struct ShapedRequest<'a> {
    pub model: &'a str,
    pub system: Option<&'a str>,
    pub prompt: &'a str,
    pub max_tokens: u32,
    pub temperature: Option<f64>,
    pub stream: bool,
}

/// Connection settings for one provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    /// API token; `None` disables the provider.
    pub api_key: Option<String>,
    /// Base URL override.
    pub base_url: Option<String>,
}

/// Uniform adapter over one backend family.
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Resolve a model alias to a concrete model id. Total over the
    /// alias namespace: unknown aliases resolve to themselves.
    fn resolve_alias(&self, alias: &str) -> String;

    /// Known `(alias, model)` pairs, for the models endpoint.
    fn aliases(&self) -> Vec<(&'static str, &'static str)>;

    /// Whether this provider can take requests (token present, or local).
    fn available(&self) -> bool;

    /// Per-request timeout.
    fn timeout(&self) -> Duration {
        Duration::from_secs(120)
    }

    /// Request URL for a model.
    fn endpoint(&self, model: &str, stream: bool) -> String;

    /// Headers beyond content-type.
    fn headers(&self) -> Vec<(&'static str, String)>;

    /// Build the request body.
    fn shape_request(&self, req: &ShapedRequest<'_>) -> Value;

    /// Pull the generated text out of a complete response body.
    fn extract_text(&self, body: &Value) -> Result<String>;

    /// Pull the text delta out of one stream event payload.
    fn extract_chunk(&self, payload: &Value) -> Option<String>;

    fn stream_format(&self) -> StreamFormat {
        StreamFormat::Sse
    }

    /// Parse the provider's error envelope, if recognizable.
    fn error_message(&self, body: &str) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Gemini

pub struct GeminiAdapter {
    settings: ProviderSettings,
}

impl GeminiAdapter {
    const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com";

    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }

    fn base_url(&self) -> &str {
        self.settings
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn key(&self) -> &str {
        self.settings.api_key.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
}

impl ProviderAdapter for GeminiAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn resolve_alias(&self, alias: &str) -> String {
        match alias {
            "gemini" | "flash" => "gemini-2.0-flash".to_string(),
            "gemini-pro" => "gemini-1.5-pro".to_string(),
            other => other.to_string(),
        }
    }

    fn aliases(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("gemini", "gemini-2.0-flash"),
            ("flash", "gemini-2.0-flash"),
            ("gemini-pro", "gemini-1.5-pro"),
        ]
    }

    fn available(&self) -> bool {
        self.settings.api_key.is_some()
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url(),
                model,
                self.key()
            )
        } else {
            format!(
                "{}/v1beta/models/{}:generateContent?key={}",
                self.base_url(),
                model,
                self.key()
            )
        }
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn shape_request(&self, req: &ShapedRequest<'_>) -> Value {
        let mut body = json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": req.prompt }],
            }],
            "generationConfig": {
                "maxOutputTokens": req.max_tokens,
            },
        });
        if let Some(temperature) = req.temperature {
            body["generationConfig"]["temperature"] = json!(temperature);
        }
        if let Some(system) = req.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }

    fn extract_text(&self, body: &Value) -> Result<String> {
        let parts = body
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .ok_or_else(|| Error::empty_response("gemini"))?;
        let text: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(Error::empty_response("gemini"));
        }
        Ok(text)
    }

    fn extract_chunk(&self, payload: &Value) -> Option<String> {
        payload
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string())
    }

    fn error_message(&self, body: &str) -> Option<String> {
        serde_json::from_str::<GeminiError>(body)
            .ok()
            .map(|e| e.error.message)
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible

pub struct OpenAiCompatAdapter {
    settings: ProviderSettings,
}

impl OpenAiCompatAdapter {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }

    fn base_url(&self) -> &str {
        self.settings
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

impl ProviderAdapter for OpenAiCompatAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompat
    }

    fn resolve_alias(&self, alias: &str) -> String {
        match alias {
            "gpt" | "openai" => "gpt-4o".to_string(),
            "gpt-mini" => "gpt-4o-mini".to_string(),
            other => other.to_string(),
        }
    }

    fn aliases(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("gpt", "gpt-4o"),
            ("openai", "gpt-4o"),
            ("gpt-mini", "gpt-4o-mini"),
        ]
    }

    fn available(&self) -> bool {
        self.settings.api_key.is_some()
    }

    fn endpoint(&self, _model: &str, _stream: bool) -> String {
        format!("{}/v1/chat/completions", self.base_url())
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![(
            "Authorization",
            format!("Bearer {}", self.settings.api_key.as_deref().unwrap_or("")),
        )]
    }

    fn shape_request(&self, req: &ShapedRequest<'_>) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = req.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": req.prompt }));

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": req.stream,
        });
        if let Some(temperature) = req.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    fn extract_text(&self, body: &Value) -> Result<String> {
        body.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
            .map(|c| c.to_string())
            .ok_or_else(|| Error::empty_response("openai"))
    }

    fn extract_chunk(&self, payload: &Value) -> Option<String> {
        payload
            .pointer("/choices/0/delta/content")
            .and_then(|c| c.as_str())
            .map(|c| c.to_string())
    }

    fn error_message(&self, body: &str) -> Option<String> {
        serde_json::from_str::<OpenAiError>(body)
            .ok()
            .map(|e| e.error.message)
    }
}

// ---------------------------------------------------------------------------
// Anthropic (direct)

pub struct AnthropicAdapter {
    settings: ProviderSettings,
}

impl AnthropicAdapter {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }

    fn base_url(&self) -> &str {
        self.settings
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn resolve_alias(&self, alias: &str) -> String {
        match alias {
            "claude" | "sonnet" => "claude-3-5-sonnet-20241022".to_string(),
            "haiku" => "claude-3-5-haiku-20241022".to_string(),
            other => other.to_string(),
        }
    }

    fn aliases(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("claude", "claude-3-5-sonnet-20241022"),
            ("sonnet", "claude-3-5-sonnet-20241022"),
            ("haiku", "claude-3-5-haiku-20241022"),
        ]
    }

    fn available(&self) -> bool {
        self.settings.api_key.is_some()
    }

    fn endpoint(&self, _model: &str, _stream: bool) -> String {
        format!("{}/v1/messages", self.base_url())
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            (
                "x-api-key",
                self.settings.api_key.clone().unwrap_or_default(),
            ),
            ("anthropic-version", Self::API_VERSION.to_string()),
        ]
    }

    fn shape_request(&self, req: &ShapedRequest<'_>) -> Value {
        let mut body = json!({
            "model": req.model,
            "max_tokens": req.max_tokens,
            "messages": [{ "role": "user", "content": req.prompt }],
            "stream": req.stream,
        });
        if let Some(system) = req.system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = req.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    fn extract_text(&self, body: &Value) -> Result<String> {
        let content = body
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| Error::empty_response("anthropic"))?;
        let text: String = content
            .iter()
            .filter_map(|block| block["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(Error::empty_response("anthropic"));
        }
        Ok(text)
    }

    fn extract_chunk(&self, payload: &Value) -> Option<String> {
        if payload["type"].as_str() == Some("content_block_delta") {
            payload
                .pointer("/delta/text")
                .and_then(|t| t.as_str())
                .map(|t| t.to_string())
        } else {
            None
        }
    }

    fn error_message(&self, body: &str) -> Option<String> {
        serde_json::from_str::<AnthropicError>(body)
            .ok()
            .map(|e| e.error.message)
    }
}

// ---------------------------------------------------------------------------
// Ollama (local)

pub struct OllamaAdapter {
    settings: ProviderSettings,
}

impl OllamaAdapter {
    const DEFAULT_BASE_URL: &'static str = "http://localhost:11434";

    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }

    fn base_url(&self) -> &str {
        self.settings
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

impl ProviderAdapter for OllamaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn resolve_alias(&self, alias: &str) -> String {
        match alias {
            "ollama" | "local" => "llama3.2".to_string(),
            other => other.to_string(),
        }
    }

    fn aliases(&self) -> Vec<(&'static str, &'static str)> {
        vec![("ollama", "llama3.2"), ("local", "llama3.2")]
    }

    fn available(&self) -> bool {
        // Local daemon, no token; reachability shows up as a request error.
        true
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(300)
    }

    fn endpoint(&self, _model: &str, _stream: bool) -> String {
        format!("{}/api/generate", self.base_url())
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn shape_request(&self, req: &ShapedRequest<'_>) -> Value {
        let mut body = json!({
            "model": req.model,
            "prompt": req.prompt,
            "stream": req.stream,
            "options": { "num_predict": req.max_tokens },
        });
        if let Some(system) = req.system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = req.temperature {
            body["options"]["temperature"] = json!(temperature);
        }
        body
    }

    fn extract_text(&self, body: &Value) -> Result<String> {
        body.get("response")
            .and_then(|r| r.as_str())
            .filter(|r| !r.is_empty())
            .map(|r| r.to_string())
            .ok_or_else(|| Error::empty_response("ollama"))
    }

    fn extract_chunk(&self, payload: &Value) -> Option<String> {
        payload
            .get("response")
            .and_then(|r| r.as_str())
            .filter(|r| !r.is_empty())
            .map(|r| r.to_string())
    }

    fn stream_format(&self) -> StreamFormat {
        StreamFormat::NdJson
    }

    fn error_message(&self, body: &str) -> Option<String> {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v["error"].as_str().map(|e| e.to_string()))
    }
}

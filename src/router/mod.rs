//! Provider router: a uniform `generate` contract over heterogeneous
//! LLM backends, with alias resolution and markdown stripping.

pub mod engine;
pub mod providers;
pub mod types;

pub use engine::{postprocess, strip_fences, Generator, ModelInfo, Router, RouterSettings};
pub use providers::{
    AnthropicAdapter, GeminiAdapter, OllamaAdapter, OpenAiCompatAdapter, ProviderAdapter,
    ProviderSettings, ShapedRequest, StreamFormat,
};
pub use types::{
    estimate_tokens, pricing_for, prompt_hash, ChunkSink, GenerateMeta, GenerateOptions,
    Generation, ModelPricing, ProviderKind,
};

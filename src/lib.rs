//! # forge-core
//!
//! An orchestrator that turns a one-line intent into a complete,
//! self-contained HTML application through an LLM-backed pipeline.
//!
//! ## Core Components
//!
//! - **Router**: one `generate` contract over heterogeneous LLM providers
//! - **Enhancer / Validator / Sanitizer**: pure prompt assembly, the
//!   four-axis quality rubric, and a best-effort safety filter
//! - **Strategies**: best-of-N, refinement chain, genetic evolution, duels
//! - **Pipeline**: probes, enhancement, generation, validation, persistence
//! - **Stores**: KV collections, run history, grimoire, telemetry
//! - **HTTP/SSE**: REST surface with auth, rate limiting and live progress
//!
//! ## Example
//!
//! ```rust,ignore
//! use forge_core::{Intent, Pipeline, Router, RouterSettings};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let router = Arc::new(Router::new(RouterSettings::default()));
//! let pipeline = Pipeline::builder(router).build();
//!
//! let result = pipeline
//!     .run(&Intent::new("track my cardio for 8 weeks"), &CancellationToken::new())
//!     .await?;
//! println!("grade {} -> {} bytes", result.score.grade, result.html.len());
//! ```

pub mod cache;
pub mod config;
pub mod enhance;
pub mod error;
pub mod events;
pub mod hooks;
pub mod http;
pub mod output;
pub mod pipeline;
pub mod plugins;
pub mod probes;
pub mod router;
pub mod sanitize;
pub mod store;
pub mod strategies;
pub mod validate;
pub mod watch;

// Re-exports for convenience
pub use cache::{CacheNamespace, CacheStats, TtlCache};
pub use config::{ConfigLoader, ForgeConfig};
pub use enhance::{enhance, system_instruction, EnhanceOptions, StylePreset};
pub use error::{Error, Result};
pub use events::{NullSink, ProgressEvent, ProgressSink};
pub use hooks::{HookBus, HookFailure, HookFn, HookPoint, HookState};
pub use http::{api_router, ApiState, RateLimiter, SseChannel, SseChannelConfig};
pub use output::{output_filename, slug, OutputRenderer};
pub use pipeline::{Intent, IntentOptions, Pipeline, PipelineBuilder, PipelineResult};
pub use plugins::{CommandFn, Plugin, PluginManifest, PluginRegistry};
pub use probes::{ContextBundle, ContextProbe, ProbeSet};
pub use router::{
    ChunkSink, GenerateMeta, GenerateOptions, Generation, Generator, ModelInfo, ProviderKind,
    Router, RouterSettings,
};
pub use sanitize::{sanitize, scan, SanitizeOptions, SanitizeResult, ScanReport, Severity};
pub use store::{
    Grimoire, GrimoireEntry, GrimoireQuery, History, HistoryEntry, KvStore, Migrator, Profile,
    PromptVersions, Telemetry,
};
pub use strategies::{
    ab_test, best_of, evolve, fallback_test, iteration_chain, prompt_duel, refine, BestOfConfig,
    ChainConfig, DuelConfig, EvolveConfig, IterationRecord, RefineConfig,
};
pub use validate::{Axis, Grade, Indicator, IndicatorTest, Score, Validator};
pub use watch::{watch_router, WatchMode, WatchOptions, WatchState};

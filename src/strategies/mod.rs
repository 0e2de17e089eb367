//! Iteration strategies over the generator + validator seam.
//!
//! Every strategy produces a deterministic score from a given document;
//! the only nondeterminism comes from the LLM. A single failed LLM call
//! scores as zero and the strategy proceeds.

pub mod best_of;
pub mod duel;
pub mod genetic;
pub mod refine;

pub use best_of::{best_of, BestOfConfig, BestOfResult};
pub use duel::{ab_test, fallback_test, prompt_duel, DuelConfig, DuelOutcome, DuelVariant, FallbackOutcome};
pub use genetic::{evolve, EvolveConfig, EvolveOutcome, Individual};
pub use refine::{
    iteration_chain, refine, ChainConfig, ChainResult, IterationRecord, RefineConfig,
    RefineOutcome,
};

use crate::router::GenerateMeta;
use crate::validate::Score;

/// Default bound on parallel LLM calls within one strategy.
pub const DEFAULT_PARALLELISM: usize = 3;

/// One scored generation candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub html: String,
    pub score: Score,
    pub meta: GenerateMeta,
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted generators shared by the strategy tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    use crate::error::{Error, Result};
    use crate::router::{GenerateMeta, GenerateOptions, Generator, ProviderKind};

    /// Serves canned outputs in sequence; after the script is exhausted,
    /// the last entry repeats.
    pub struct ScriptedGenerator {
        script: Vec<Result<String>>,
        calls: AtomicUsize,
    }

    impl ScriptedGenerator {
        pub fn new(script: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            opts: &GenerateOptions,
            _cancel: &CancellationToken,
        ) -> Result<(String, GenerateMeta)> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .get(index)
                .or_else(|| self.script.last())
                .expect("script must not be empty");
            match step {
                Ok(html) => Ok((
                    html.clone(),
                    GenerateMeta {
                        provider: ProviderKind::Gemini,
                        resolved_model: opts
                            .model
                            .clone()
                            .unwrap_or_else(|| "stub-model".to_string()),
                        duration_ms: 1,
                        tokens_in_est: 10,
                        tokens_out_est: 100,
                        cost_est: 0.0,
                    },
                )),
                Err(e) => Err(Error::Internal(e.to_string())),
            }
        }
    }

    /// Routes by model alias: each alias gets its own fixed response.
    pub struct AliasGenerator {
        responses: Vec<(String, Result<String>)>,
    }

    impl AliasGenerator {
        pub fn new(responses: Vec<(&str, Result<String>)>) -> Arc<Self> {
            Arc::new(Self {
                responses: responses
                    .into_iter()
                    .map(|(alias, r)| (alias.to_string(), r))
                    .collect(),
            })
        }
    }

    #[async_trait::async_trait]
    impl Generator for AliasGenerator {
        async fn generate(
            &self,
            _prompt: &str,
            opts: &GenerateOptions,
            _cancel: &CancellationToken,
        ) -> Result<(String, GenerateMeta)> {
            let alias = opts.model.as_deref().unwrap_or_default();
            let (_, response) = self
                .responses
                .iter()
                .find(|(a, _)| a == alias)
                .unwrap_or_else(|| panic!("no scripted response for alias {}", alias));
            match response {
                Ok(html) => Ok((
                    html.clone(),
                    GenerateMeta {
                        provider: ProviderKind::Gemini,
                        resolved_model: alias.to_string(),
                        duration_ms: 1,
                        tokens_in_est: 10,
                        tokens_out_est: 100,
                        cost_est: 0.0,
                    },
                )),
                Err(e) => Err(Error::Internal(e.to_string())),
            }
        }
    }

    /// HTML fixtures of graded richness for strategy assertions.
    pub fn poor_html() -> String {
        "<html><body>app</body></html>".to_string()
    }

    pub fn fair_html() -> String {
        let mut doc = String::from(
            "<!DOCTYPE html><html><head><title>App</title><style>body { transition: all 0.2s; }</style></head>\
             <body><main><input placeholder=\"entry\"><button onclick=\"save()\">Save</button></main>\
             <script>function save() { localStorage.setItem('k', '1'); }</script></body></html>",
        );
        doc.push_str(&"<!-- -->".repeat(16));
        doc
    }

    pub fn rich_html() -> String {
        let mut doc = String::from(
            "<!DOCTYPE html><html lang=\"en\"><head><title>App \u{25b2}</title><style>\
             :root { --accent: #0af; } body { background: linear-gradient(#111, #224); transition: background 0.3s; }\
             @keyframes pulse { from { opacity: 0; } } @media (max-width: 600px) { body { font-size: 13px; } }\
             </style></head><body><header role=\"banner\"><nav aria-label=\"main\">App</nav></header>\
             <main><section><input placeholder=\"minutes\" onchange=\"save()\"><button onclick=\"save()\">Log</button>\
             <canvas></canvas></section></main><footer></footer>\
             <script>function save() { try { localStorage.setItem('log', Date.now()); } catch (e) {} }\
             document.addEventListener('DOMContentLoaded', save);</script></body></html>",
        );
        doc.push_str(&"<!-- filler for the length indicator -->".repeat(60));
        doc
    }
}

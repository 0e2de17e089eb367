//! The end-to-end pipeline.
//!
//! `Pipeline::run` conducts one generation: probes, enhancement,
//! generation (single call or iteration chain), validation with optional
//! sanitizing, and persistence. Every stage is bracketed by its hook
//! points and reported on the attached progress sink. A failed stage
//! surfaces with its stage name after the `on_error` hooks have run;
//! telemetry records the attempt either way, while history only records
//! successful runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::config::ForgeConfig;
use crate::enhance::{enhance, system_instruction, EnhanceOptions, StylePreset};
use crate::error::{Error, Result};
use crate::events::{NullSink, ProgressEvent, ProgressSink};
use crate::hooks::{HookBus, HookPoint, HookState};
use crate::output::OutputRenderer;
use crate::probes::ProbeSet;
use crate::router::{prompt_hash, ChunkSink, GenerateOptions, Generator, ProviderKind};
use crate::sanitize::{sanitize, scan, SanitizeOptions, ScanReport};
use crate::store::{Grimoire, History, Inscription, Profile, RunRecord, Telemetry, TelemetryRecord};
use crate::strategies::{iteration_chain, ChainConfig, IterationRecord};
use crate::validate::{Score, Validator};

/// Raw user input plus options.
#[derive(Debug, Clone, Default)]
pub struct Intent {
    pub text: String,
    pub options: IntentOptions,
}

impl Intent {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            options: IntentOptions::default(),
        }
    }
}

/// Per-run options carried by the intent.
#[derive(Debug, Clone, Default)]
pub struct IntentOptions {
    /// Model alias; defaults to the configured default model.
    pub model: Option<String>,
    pub style: StylePreset,
    pub language: Option<String>,
    /// Run the iteration chain instead of a single call.
    pub iterate: bool,
    pub persona: Option<String>,
    /// Stream chunks onto the progress sink.
    pub stream: bool,
    /// Also inscribe the prompt into the grimoire.
    pub inscribe: bool,
    pub tags: Vec<String>,
}

/// What a run produces.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub html: String,
    pub score: Score,
    /// The assembled context block.
    pub context: String,
    /// Per-iteration records; one entry for non-iterated runs.
    pub iterations: Vec<IterationRecord>,
    pub model: String,
    pub provider: ProviderKind,
    pub enhanced_prompt: String,
    pub history_id: Option<String>,
    pub output_path: Option<PathBuf>,
    pub scan: Option<ScanReport>,
    /// What the sanitizer removed, if it ran.
    pub removed: Vec<String>,
    /// Persistence problems that did not invalidate the run.
    pub persist_errors: Vec<String>,
    pub duration_ms: u64,
    /// Hook failures captured during the run.
    pub hook_errors: Vec<crate::hooks::HookFailure>,
}

/// Bridges streamed chunks onto the progress sink.
struct EventChunkSink {
    sink: Arc<dyn ProgressSink>,
}

impl ChunkSink for EventChunkSink {
    fn send(&self, chunk: &str) {
        self.sink.emit(&ProgressEvent::Chunk {
            text: chunk.to_string(),
        });
    }
}

/// Assembles a [`Pipeline`].
pub struct PipelineBuilder {
    generator: Arc<dyn Generator>,
    config: ForgeConfig,
    validator: Arc<Validator>,
    hooks: Arc<HookBus>,
    probes: Option<ProbeSet>,
    history: Option<Arc<History>>,
    grimoire: Option<Arc<Grimoire>>,
    telemetry: Option<Arc<Telemetry>>,
    profile: Option<Arc<Profile>>,
    renderer: Option<OutputRenderer>,
    sink: Arc<dyn ProgressSink>,
}

impl PipelineBuilder {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            config: ForgeConfig::default(),
            validator: Arc::new(Validator::new()),
            hooks: Arc::new(HookBus::new()),
            probes: None,
            history: None,
            grimoire: None,
            telemetry: None,
            profile: None,
            renderer: None,
            sink: Arc::new(NullSink),
        }
    }

    pub fn with_config(mut self, config: ForgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_validator(mut self, validator: Arc<Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookBus>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_probes(mut self, probes: ProbeSet) -> Self {
        self.probes = Some(probes);
        self
    }

    pub fn with_history(mut self, history: Arc<History>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_grimoire(mut self, grimoire: Arc<Grimoire>) -> Self {
        self.grimoire = Some(grimoire);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_profile(mut self, profile: Arc<Profile>) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_renderer(mut self, renderer: OutputRenderer) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Pipeline {
        let probes = self
            .probes
            .unwrap_or_else(|| ProbeSet::new(&TtlCache::new()));
        Pipeline {
            generator: self.generator,
            config: self.config,
            validator: self.validator,
            hooks: self.hooks,
            probes,
            history: self.history,
            grimoire: self.grimoire,
            telemetry: self.telemetry,
            profile: self.profile,
            renderer: self.renderer,
            sink: self.sink,
        }
    }
}

/// The generation conductor.
pub struct Pipeline {
    generator: Arc<dyn Generator>,
    config: ForgeConfig,
    validator: Arc<Validator>,
    hooks: Arc<HookBus>,
    probes: ProbeSet,
    history: Option<Arc<History>>,
    grimoire: Option<Arc<Grimoire>>,
    telemetry: Option<Arc<Telemetry>>,
    profile: Option<Arc<Profile>>,
    renderer: Option<OutputRenderer>,
    sink: Arc<dyn ProgressSink>,
}

/// Overall timeout for the context stage; late probes are dropped.
const CONTEXT_STAGE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

impl Pipeline {
    pub fn builder(generator: Arc<dyn Generator>) -> PipelineBuilder {
        PipelineBuilder::new(generator)
    }

    /// The hook bus, for plugin wiring.
    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    fn fail(
        &self,
        stage: &str,
        error: Error,
        state: HookState,
        model: &str,
        started: Instant,
    ) -> Error {
        // Cancellation is not a stage failure; it propagates as-is and
        // skips the error hooks.
        if matches!(error, Error::Cancelled) {
            return error;
        }

        tracing::warn!(stage, error = %error, "pipeline stage failed");
        self.sink.emit(&ProgressEvent::Error {
            message: error.to_string(),
            stage: stage.to_string(),
        });
        let _ = self.hooks.run(HookPoint::OnError, state);

        self.record_telemetry(model, 0, 0, 0.0, started.elapsed().as_millis() as u64, false);

        Error::stage(stage, error.to_string())
    }

    fn record_telemetry(
        &self,
        model: &str,
        in_tokens: u64,
        out_tokens: u64,
        cost_est: f64,
        duration_ms: u64,
        success: bool,
    ) {
        if let Some(telemetry) = &self.telemetry {
            let record = TelemetryRecord {
                at: chrono::Utc::now(),
                model: model.to_string(),
                in_tokens,
                out_tokens,
                cost_est,
                duration_ms,
                success,
            };
            if let Err(e) = telemetry.record(record) {
                tracing::warn!(error = %e, "telemetry write failed");
            }
        }
    }

    /// Run the full pipeline for one intent.
    pub async fn run(&self, intent: &Intent, cancel: &CancellationToken) -> Result<PipelineResult> {
        if intent.text.trim().is_empty() {
            return Err(Error::InvalidInput("intent must not be empty".into()));
        }

        let started = Instant::now();
        let opts = &intent.options;
        let alias = opts
            .model
            .clone()
            .unwrap_or_else(|| self.config.provider.default_model.clone());

        self.sink.emit(&ProgressEvent::Start {
            prompt: intent.text.clone(),
        });

        // -- Context -----------------------------------------------------
        self.sink.emit(&ProgressEvent::Progress {
            stage: "context".to_string(),
        });
        let mut state = self
            .hooks
            .run(HookPoint::BeforeContext, HookState::for_intent(&intent.text));

        let stage_started = Instant::now();
        let bundle = match tokio::time::timeout(CONTEXT_STAGE_TIMEOUT, self.probes.gather(cancel))
            .await
        {
            Ok(bundle) => bundle,
            Err(_) => {
                tracing::warn!("context stage timed out, continuing without late probes");
                Default::default()
            }
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        state.context_block = Some(bundle.block());
        state
            .timings
            .insert("context".to_string(), stage_started.elapsed().as_millis() as u64);
        state = self.hooks.run(HookPoint::AfterContext, state);

        // -- Enhance -----------------------------------------------------
        self.sink.emit(&ProgressEvent::Progress {
            stage: "enhance".to_string(),
        });
        state = self.hooks.run(HookPoint::BeforeEnhance, state);

        let provider_kind = self.generator.detect(&alias);
        let profile_hint = match &self.profile {
            Some(profile) => profile.hint().unwrap_or_default(),
            None => None,
        };
        let enhanced = enhance(
            &state.intent,
            &EnhanceOptions {
                style: opts.style,
                language: opts.language.clone(),
                context_block: state.context_block.clone(),
                profile_hint,
                persona: opts.persona.clone(),
            },
        );
        let system = system_instruction(provider_kind, opts.style);
        state.enhanced = Some(enhanced);
        state.model = Some(alias.clone());
        state = self.hooks.run(HookPoint::AfterEnhance, state);
        let enhanced_prompt = state
            .enhanced
            .clone()
            .expect("enhanced prompt set before generation");

        // -- Generate ----------------------------------------------------
        self.sink.emit(&ProgressEvent::Progress {
            stage: "generate".to_string(),
        });
        state = self.hooks.run(HookPoint::BeforeGenerate, state);

        let mut generate_opts = GenerateOptions::default()
            .with_model(alias.clone())
            .with_max_tokens(self.config.provider.max_tokens)
            .with_system(system);
        if let Some(temperature) = self.config.provider.temperature {
            generate_opts = generate_opts.with_temperature(temperature);
        }
        if opts.stream {
            generate_opts = generate_opts.with_chunk_sink(Arc::new(EventChunkSink {
                sink: self.sink.clone(),
            }));
        }

        let stage_started = Instant::now();
        let (html, provider, model, iterations, tokens) = if opts.iterate {
            let chain_config = ChainConfig {
                threshold: self.config.pipeline.threshold,
                max_rounds: self.config.pipeline.max_rounds,
                patience: self.config.pipeline.patience,
                opts: generate_opts,
            };
            let chain = match iteration_chain(
                &self.generator,
                &self.validator,
                &enhanced_prompt,
                &chain_config,
                cancel,
            )
            .await
            {
                Ok(chain) => chain,
                Err(e) => return Err(self.fail("generate", e, state, &alias, started)),
            };
            (
                chain.html,
                provider_kind,
                alias.clone(),
                chain.iterations,
                (0, 0, 0.0),
            )
        } else {
            let (html, meta) = match self
                .generator
                .generate(&enhanced_prompt, &generate_opts, cancel)
                .await
            {
                Ok(ok) => ok,
                Err(e) => return Err(self.fail("generate", e, state, &alias, started)),
            };
            let total = self.validator.validate(&html).total;
            (
                html,
                meta.provider,
                meta.resolved_model,
                vec![IterationRecord {
                    iteration: 0,
                    score: total,
                    improved: true,
                }],
                (meta.tokens_in_est, meta.tokens_out_est, meta.cost_est),
            )
        };
        state.html = Some(html);
        state
            .timings
            .insert("generate".to_string(), stage_started.elapsed().as_millis() as u64);
        state = self.hooks.run(HookPoint::AfterGenerate, state);

        // -- Validate ----------------------------------------------------
        self.sink.emit(&ProgressEvent::Progress {
            stage: "validate".to_string(),
        });
        state = self.hooks.run(HookPoint::BeforeValidate, state);

        let mut html = state.html.clone().unwrap_or_default();
        let mut scan_report = None;
        let mut removed = Vec::new();
        if self.config.security.sanitize {
            scan_report = Some(scan(&html));
            let sanitized = sanitize(
                &html,
                SanitizeOptions {
                    strip_scripts: self.config.security.strip_scripts,
                    strip_inline_styles: self.config.security.strip_inline_styles,
                },
            );
            html = sanitized.code;
            removed = sanitized.removed;
        }
        let score = self.validator.validate(&html);
        state.html = Some(html.clone());
        state.score = Some(score.clone());
        state = self.hooks.run(HookPoint::AfterValidate, state);
        // Hooks may have rewritten the document or its score.
        let html = state.html.clone().unwrap_or(html);
        let score = state.score.clone().unwrap_or(score);

        // -- Persist -----------------------------------------------------
        self.sink.emit(&ProgressEvent::Progress {
            stage: "persist".to_string(),
        });
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        state = self.hooks.run(HookPoint::BeforePersist, state);

        let mut persist_errors = Vec::new();
        let mut history_id = None;
        if let Some(history) = &self.history {
            let record = RunRecord {
                prompt: intent.text.clone(),
                enhanced_prompt_hash: prompt_hash(&enhanced_prompt),
                model: model.clone(),
                provider: provider.to_string(),
                score: score.clone(),
                style: Some(opts.style.to_string()),
                tags: opts.tags.clone(),
            };
            match history.record(record, &html) {
                Ok(entry) => history_id = Some(entry.id),
                Err(e) => persist_errors.push(format!("history: {}", e)),
            }
        }

        if opts.inscribe {
            if let Some(grimoire) = &self.grimoire {
                let inscription = Inscription {
                    prompt: intent.text.clone(),
                    tags: opts.tags.clone(),
                    category: "generated".to_string(),
                    score: Some(score.total),
                    metadata: HashMap::new(),
                };
                if let Err(e) = grimoire.inscribe(inscription) {
                    persist_errors.push(format!("grimoire: {}", e));
                }
            }
        }

        if let Some(profile) = &self.profile {
            if let Err(e) = profile.record_style(&opts.style.to_string()) {
                persist_errors.push(format!("profile: {}", e));
            }
        }

        let mut output_path = None;
        if let Some(renderer) = &self.renderer {
            match renderer.render(&intent.text, &html) {
                Ok(path) => output_path = Some(path),
                Err(e) => persist_errors.push(format!("render: {}", e)),
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.record_telemetry(&model, tokens.0, tokens.1, tokens.2, duration_ms, true);
        for problem in &persist_errors {
            tracing::warn!(%problem, "persistence problem");
        }
        state = self.hooks.run(HookPoint::AfterPersist, state);

        self.sink.emit(&ProgressEvent::Complete { score: score.total });

        Ok(PipelineResult {
            html,
            score,
            context: state.context_block.clone().unwrap_or_default(),
            iterations,
            model,
            provider,
            enhanced_prompt,
            history_id,
            output_path,
            scan: scan_report,
            removed,
            persist_errors,
            duration_ms,
            hook_errors: state.hook_errors,
        })
    }
}

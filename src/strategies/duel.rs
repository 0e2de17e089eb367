//! Duels: concurrent multi-variant generation with score-based selection.
//!
//! An A/B duel runs the same prompt across a provider list; a prompt duel
//! runs prompt variants against a single provider. Failed variants are
//! omitted from the verdict; if every variant fails the duel reports
//! `AllProvidersFailed`. The fallback test runs a primary, falls back
//! below a threshold, and returns the better of the two.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::DEFAULT_PARALLELISM;
use crate::error::{Error, Result};
use crate::router::{GenerateOptions, Generator};
use crate::validate::{Score, Validator};

/// Configuration shared by the duel entry points.
#[derive(Debug, Clone)]
pub struct DuelConfig {
    /// Bound on concurrent LLM calls.
    pub parallelism: usize,
    pub opts: GenerateOptions,
}

impl Default for DuelConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            opts: GenerateOptions::default(),
        }
    }
}

/// One surviving duel variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelVariant {
    /// Provider alias (A/B duel) or prompt label (prompt duel).
    pub label: String,
    pub model: String,
    pub score: Score,
    pub html: String,
    /// Why this variant placed where it did.
    pub reasoning: String,
}

/// The duel verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelOutcome {
    pub winner: DuelVariant,
    /// All surviving variants, sorted by total descending.
    pub variants: Vec<DuelVariant>,
    /// Labels of variants that failed outright.
    pub failed: Vec<String>,
}

/// Outcome of a fallback test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackOutcome {
    pub chosen: DuelVariant,
    pub used_fallback: bool,
}

fn axis_breakdown(score: &Score) -> String {
    format!(
        "conatus {:.2}, ratio {:.2}, laetitia {:.2}, natura {:.2}",
        score.conatus, score.ratio, score.laetitia, score.natura
    )
}

fn build_reasoning(variant_score: &Score, rank: usize) -> String {
    if rank == 0 {
        format!(
            "winner with total {:.2} (grade {}); {}",
            variant_score.total,
            variant_score.grade,
            axis_breakdown(variant_score)
        )
    } else {
        let top_issues: Vec<&str> = variant_score
            .issues
            .iter()
            .take(3)
            .map(|s| s.as_str())
            .collect();
        format!(
            "total {:.2} (grade {}); {}; top issues: {}",
            variant_score.total,
            variant_score.grade,
            axis_breakdown(variant_score),
            if top_issues.is_empty() {
                "none".to_string()
            } else {
                top_issues.join("; ")
            }
        )
    }
}

/// Run labelled `(label, prompt, model)` variants concurrently and rank
/// the survivors.
async fn run_duel(
    generator: &Arc<dyn Generator>,
    validator: &Validator,
    variants: Vec<(String, String, Option<String>)>,
    config: &DuelConfig,
    cancel: &CancellationToken,
) -> Result<DuelOutcome> {
    if variants.is_empty() {
        return Err(Error::InvalidInput("duel requires at least one variant".into()));
    }

    let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));
    let runs = variants.into_iter().map(|(label, prompt, model)| {
        let generator = generator.clone();
        let semaphore = semaphore.clone();
        let mut opts = config.opts.clone();
        let cancel = cancel.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            if let Some(model) = model {
                opts.model = Some(model);
            }
            let outcome = generator.generate(&prompt, &opts, &cancel).await;
            (label, outcome)
        }
    });

    let mut survivors: Vec<DuelVariant> = Vec::new();
    let mut failed: Vec<String> = Vec::new();

    for (label, outcome) in join_all(runs).await {
        match outcome {
            Ok((html, meta)) => {
                let score = validator.validate(&html);
                survivors.push(DuelVariant {
                    label,
                    model: meta.resolved_model,
                    score,
                    html,
                    reasoning: String::new(),
                });
            }
            Err(e) => {
                tracing::debug!(variant = %label, error = %e, "duel variant failed");
                failed.push(label);
            }
        }
    }

    if survivors.is_empty() {
        return Err(Error::AllProvidersFailed);
    }

    survivors.sort_by(|a, b| {
        b.score
            .total
            .partial_cmp(&a.score.total)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for (rank, variant) in survivors.iter_mut().enumerate() {
        variant.reasoning = build_reasoning(&variant.score, rank);
    }

    Ok(DuelOutcome {
        winner: survivors[0].clone(),
        variants: survivors,
        failed,
    })
}

/// Generate the same prompt across a provider list; best total wins.
pub async fn ab_test(
    generator: &Arc<dyn Generator>,
    validator: &Validator,
    prompt: &str,
    providers: &[String],
    config: &DuelConfig,
    cancel: &CancellationToken,
) -> Result<DuelOutcome> {
    let variants = providers
        .iter()
        .map(|alias| (alias.clone(), prompt.to_string(), Some(alias.clone())))
        .collect();
    run_duel(generator, validator, variants, config, cancel).await
}

/// Generate prompt variants against a single provider; best total wins.
pub async fn prompt_duel(
    generator: &Arc<dyn Generator>,
    validator: &Validator,
    prompts: &[String],
    config: &DuelConfig,
    cancel: &CancellationToken,
) -> Result<DuelOutcome> {
    let variants = prompts
        .iter()
        .enumerate()
        .map(|(index, prompt)| (format!("variant-{}", index + 1), prompt.clone(), None))
        .collect();
    run_duel(generator, validator, variants, config, cancel).await
}

/// Run `primary`; below the threshold (or on failure), run `fallback`;
/// return the better of the two. No error escapes unless both fail.
pub async fn fallback_test(
    generator: &Arc<dyn Generator>,
    validator: &Validator,
    prompt: &str,
    primary: &str,
    fallback: &str,
    threshold: f64,
    config: &DuelConfig,
    cancel: &CancellationToken,
) -> Result<FallbackOutcome> {
    let mut opts = config.opts.clone();
    opts.model = Some(primary.to_string());

    let primary_variant = match generator.generate(prompt, &opts, cancel).await {
        Ok((html, meta)) => {
            let score = validator.validate(&html);
            Some(DuelVariant {
                label: primary.to_string(),
                model: meta.resolved_model,
                reasoning: format!("primary scored {:.2}", score.total),
                score,
                html,
            })
        }
        Err(e) => {
            tracing::debug!(provider = primary, error = %e, "primary failed");
            None
        }
    };

    if let Some(variant) = &primary_variant {
        if variant.score.total >= threshold {
            return Ok(FallbackOutcome {
                chosen: variant.clone(),
                used_fallback: false,
            });
        }
    }

    let mut opts = config.opts.clone();
    opts.model = Some(fallback.to_string());
    let fallback_variant = match generator.generate(prompt, &opts, cancel).await {
        Ok((html, meta)) => {
            let score = validator.validate(&html);
            Some(DuelVariant {
                label: fallback.to_string(),
                model: meta.resolved_model,
                reasoning: format!("fallback scored {:.2}", score.total),
                score,
                html,
            })
        }
        Err(e) => {
            tracing::debug!(provider = fallback, error = %e, "fallback failed");
            None
        }
    };

    match (primary_variant, fallback_variant) {
        (Some(p), Some(f)) => {
            let (chosen, used_fallback) = if f.score.total > p.score.total {
                (f, true)
            } else {
                (p, false)
            };
            Ok(FallbackOutcome {
                chosen,
                used_fallback,
            })
        }
        (Some(p), None) => Ok(FallbackOutcome {
            chosen: p,
            used_fallback: false,
        }),
        (None, Some(f)) => Ok(FallbackOutcome {
            chosen: f,
            used_fallback: true,
        }),
        (None, None) => Err(Error::AllProvidersFailed),
    }
}

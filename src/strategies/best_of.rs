//! Best-of-N: generate N candidates, keep the highest-scoring one.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{Candidate, DEFAULT_PARALLELISM};
use crate::error::{Error, Result};
use crate::router::{GenerateOptions, Generator};
use crate::validate::Validator;

/// Configuration for [`best_of`].
#[derive(Debug, Clone)]
pub struct BestOfConfig {
    /// How many candidates to generate.
    pub n: usize,
    /// Bound on concurrent LLM calls.
    pub parallelism: usize,
    pub opts: GenerateOptions,
}

impl Default for BestOfConfig {
    fn default() -> Self {
        Self {
            n: 3,
            parallelism: DEFAULT_PARALLELISM,
            opts: GenerateOptions::default(),
        }
    }
}

/// Outcome of a best-of-N run.
#[derive(Debug, Clone)]
pub struct BestOfResult {
    pub best: Candidate,
    /// Rubric totals per candidate, in generation order; failed
    /// candidates score zero.
    pub totals: Vec<f64>,
}

/// Run N generations (bounded by a semaphore), validate each, return the
/// highest-total result. Ties go to the earliest candidate.
pub async fn best_of(
    generator: &Arc<dyn Generator>,
    validator: &Validator,
    prompt: &str,
    config: &BestOfConfig,
    cancel: &CancellationToken,
) -> Result<BestOfResult> {
    if config.n == 0 {
        return Err(Error::InvalidInput("best-of requires n >= 1".into()));
    }

    let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));
    let runs = (0..config.n).map(|index| {
        let generator = generator.clone();
        let semaphore = semaphore.clone();
        let opts = config.opts.clone();
        let cancel = cancel.clone();
        let prompt = prompt.to_string();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let result = generator.generate(&prompt, &opts, &cancel).await;
            (index, result)
        }
    });

    let mut outcomes = join_all(runs).await;
    outcomes.sort_by_key(|(index, _)| *index);

    let mut best: Option<Candidate> = None;
    let mut totals = Vec::with_capacity(config.n);
    let mut first_error: Option<Error> = None;

    for (index, outcome) in outcomes {
        match outcome {
            Ok((html, meta)) => {
                let score = validator.validate(&html);
                totals.push(score.total);
                let better = best
                    .as_ref()
                    .map(|b| score.total > b.score.total)
                    .unwrap_or(true);
                if better {
                    best = Some(Candidate { html, score, meta });
                }
            }
            Err(e) => {
                tracing::debug!(candidate = index, error = %e, "candidate failed, scoring zero");
                totals.push(0.0);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    match best {
        Some(best) => Ok(BestOfResult { best, totals }),
        None => Err(first_error.unwrap_or(Error::AllProvidersFailed)),
    }
}

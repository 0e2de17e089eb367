//! Refinement loop and iteration chain.
//!
//! Refinement regenerates a document with its issues and weakest axes
//! spelled out, accepting a replacement only on strict improvement. The
//! chain wraps a first generation plus refinement rounds with a patience
//! counter, recording one entry per iteration. Neither ever returns a
//! document worse than its input.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::router::{GenerateOptions, Generator};
use crate::validate::{Score, Validator};

/// Configuration for [`refine`].
#[derive(Debug, Clone)]
pub struct RefineConfig {
    /// Stop once the total reaches this.
    pub threshold: f64,
    /// Hard cap on refinement rounds.
    pub max_rounds: u32,
    pub opts: GenerateOptions,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            max_rounds: 3,
            opts: GenerateOptions::default(),
        }
    }
}

/// Configuration for [`iteration_chain`].
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub threshold: f64,
    pub max_rounds: u32,
    /// Stop after this many consecutive non-improving rounds.
    pub patience: u32,
    pub opts: GenerateOptions,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            threshold: 0.70,
            max_rounds: 3,
            patience: 2,
            opts: GenerateOptions::default(),
        }
    }
}

/// One chain iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub score: f64,
    pub improved: bool,
}

/// Result of a refinement loop.
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    pub html: String,
    pub score: Score,
    pub rounds: u32,
}

/// Result of an iteration chain.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub html: String,
    pub score: Score,
    pub iterations: Vec<IterationRecord>,
}

/// Build the refinement prompt: issues plus the two weakest axes.
pub fn refinement_prompt(original_prompt: &str, html: &str, score: &Score) -> String {
    let mut prompt = String::with_capacity(html.len() + 1024);

    prompt.push_str("Improve this HTML application. Original intent:\n\n");
    prompt.push_str(original_prompt.trim());
    prompt.push_str("\n\nProblems found in the current version:\n");
    if score.issues.is_empty() {
        prompt.push_str("- overall polish is below the bar\n");
    } else {
        for issue in &score.issues {
            prompt.push_str("- ");
            prompt.push_str(issue);
            prompt.push('\n');
        }
    }

    let weakest = score.weakest_axes();
    prompt.push_str(&format!(
        "\nFocus areas, in order: {} and {}.\n",
        weakest[0], weakest[1]
    ));

    prompt.push_str("\nCurrent version:\n\n");
    prompt.push_str(html);
    prompt.push_str(
        "\n\nReturn the complete improved HTML document. Keep everything that \
         already works; address the problems above.\n",
    );
    prompt
}

/// Refine `(html, score)` until the threshold, a non-improvement, or the
/// round cap. The returned document never scores below the input.
pub async fn refine(
    generator: &Arc<dyn Generator>,
    validator: &Validator,
    original_prompt: &str,
    html: String,
    score: Score,
    config: &RefineConfig,
    cancel: &CancellationToken,
) -> Result<RefineOutcome> {
    let mut current_html = html;
    let mut current_score = score;
    let mut rounds = 0;

    while current_score.total < config.threshold && rounds < config.max_rounds {
        let prompt = refinement_prompt(original_prompt, &current_html, &current_score);
        rounds += 1;

        let (candidate_html, _meta) =
            match generator.generate(&prompt, &config.opts, cancel).await {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::debug!(round = rounds, error = %e, "refinement round failed, stopping");
                    break;
                }
            };

        let candidate_score = validator.validate(&candidate_html);
        if candidate_score.total > current_score.total {
            tracing::debug!(
                round = rounds,
                from = current_score.total,
                to = candidate_score.total,
                "refinement accepted"
            );
            current_html = candidate_html;
            current_score = candidate_score;
        } else {
            break;
        }
    }

    Ok(RefineOutcome {
        html: current_html,
        score: current_score,
        rounds,
    })
}

/// Generate once, then refine while below the threshold, stopping after
/// `patience` consecutive non-improving rounds. Emits one record per
/// iteration; the final score is never below the initial score.
pub async fn iteration_chain(
    generator: &Arc<dyn Generator>,
    validator: &Validator,
    prompt: &str,
    config: &ChainConfig,
    cancel: &CancellationToken,
) -> Result<ChainResult> {
    let (mut best_html, _meta) = generator.generate(prompt, &config.opts, cancel).await?;
    let mut best_score = validator.validate(&best_html);

    let mut iterations = vec![IterationRecord {
        iteration: 0,
        score: best_score.total,
        improved: true,
    }];

    let mut stale = 0u32;
    let mut iteration = 0u32;

    while best_score.total < config.threshold
        && iteration < config.max_rounds
        && stale < config.patience
    {
        iteration += 1;
        let refinement = refinement_prompt(prompt, &best_html, &best_score);

        let improved = match generator.generate(&refinement, &config.opts, cancel).await {
            Ok((candidate_html, _)) => {
                let candidate_score = validator.validate(&candidate_html);
                if candidate_score.total > best_score.total {
                    best_html = candidate_html;
                    best_score = candidate_score;
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                tracing::debug!(iteration, error = %e, "chain iteration failed, scoring zero");
                false
            }
        };

        iterations.push(IterationRecord {
            iteration,
            score: best_score.total,
            improved,
        });
        if improved {
            stale = 0;
        } else {
            stale += 1;
        }
    }

    Ok(ChainResult {
        html: best_html,
        score: best_score,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::strategies::testing::{fair_html, poor_html, rich_html, ScriptedGenerator};
    use pretty_assertions::assert_eq;

    fn validator() -> Validator {
        Validator::new()
    }

    #[tokio::test]
    async fn test_refine_accepts_strict_improvement() {
        let generator = ScriptedGenerator::new(vec![Ok(rich_html())]);
        let validator = validator();
        let initial = poor_html();
        let initial_score = validator.validate(&initial);

        let outcome = refine(
            &(generator as Arc<dyn Generator>),
            &validator,
            "a tracker",
            initial,
            initial_score.clone(),
            &RefineConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.score.total > initial_score.total);
        assert_eq!(outcome.rounds, 1);
    }

    #[tokio::test]
    async fn test_refine_never_returns_worse_html() {
        // The "replacement" is worse; the input must survive.
        let generator = ScriptedGenerator::new(vec![Ok(poor_html())]);
        let validator = validator();
        let initial = fair_html();
        let initial_score = validator.validate(&initial);

        let outcome = refine(
            &(generator as Arc<dyn Generator>),
            &validator,
            "a tracker",
            initial.clone(),
            initial_score.clone(),
            &RefineConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.html, initial);
        assert_eq!(outcome.score.total, initial_score.total);
    }

    #[tokio::test]
    async fn test_refine_skips_when_already_above_threshold() {
        let generator = ScriptedGenerator::new(vec![Ok(poor_html())]);
        let validator = validator();
        let initial = rich_html();
        let initial_score = validator.validate(&initial);

        let outcome = refine(
            &(generator.clone() as Arc<dyn Generator>),
            &validator,
            "a tracker",
            initial,
            initial_score,
            &RefineConfig {
                threshold: 0.5,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.rounds, 0);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_refinement_prompt_names_issues_and_weak_axes() {
        let validator = validator();
        let score = validator.validate(&poor_html());
        let prompt = refinement_prompt("a tracker", &poor_html(), &score);

        assert!(prompt.contains("a tracker"));
        for issue in &score.issues {
            assert!(prompt.contains(issue.as_str()));
        }
        let weakest = score.weakest_axes();
        assert!(prompt.contains(&format!("{} and {}", weakest[0], weakest[1])));
    }

    #[tokio::test]
    async fn test_chain_improves_and_records_iterations() {
        // First a poor document, then a rich one: the chain should keep
        // the second and record both iterations as improvements.
        let generator = ScriptedGenerator::new(vec![Ok(poor_html()), Ok(rich_html())]);
        let validator = validator();

        let result = iteration_chain(
            &(generator as Arc<dyn Generator>),
            &validator,
            "a tracker",
            &ChainConfig {
                threshold: 0.70,
                max_rounds: 2,
                patience: 2,
                opts: GenerateOptions::default(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.iterations.len(), 2);
        assert_eq!(result.iterations[0].iteration, 0);
        assert!(result.iterations[0].improved);
        assert_eq!(result.iterations[1].iteration, 1);
        assert!(result.iterations[1].improved);
        assert!(result.score.total >= result.iterations[0].score);
        assert_eq!(result.score.total, validator.validate(&rich_html()).total);
    }

    #[tokio::test]
    async fn test_chain_final_score_never_below_initial() {
        let generator = ScriptedGenerator::new(vec![Ok(fair_html()), Ok(poor_html())]);
        let validator = validator();

        let result = iteration_chain(
            &(generator as Arc<dyn Generator>),
            &validator,
            "a tracker",
            &ChainConfig::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let initial = result.iterations[0].score;
        assert!(result.score.total >= initial);
        assert_eq!(result.html, fair_html());
    }

    #[tokio::test]
    async fn test_chain_patience_stops_stale_runs() {
        // Initial poor document, then endless equally-poor replacements.
        let generator = ScriptedGenerator::new(vec![Ok(poor_html())]);
        let validator = validator();

        let result = iteration_chain(
            &(generator.clone() as Arc<dyn Generator>),
            &validator,
            "a tracker",
            &ChainConfig {
                threshold: 0.99,
                max_rounds: 10,
                patience: 2,
                opts: GenerateOptions::default(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // Initial + two stale rounds, then patience ran out.
        assert_eq!(result.iterations.len(), 3);
        assert!(!result.iterations[1].improved);
        assert!(!result.iterations[2].improved);
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_chain_above_threshold_skips_refinement() {
        let generator = ScriptedGenerator::new(vec![Ok(rich_html())]);
        let validator = validator();

        let result = iteration_chain(
            &(generator.clone() as Arc<dyn Generator>),
            &validator,
            "a tracker",
            &ChainConfig {
                threshold: 0.5,
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.iterations.len(), 1);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_chain_failed_refinement_scores_zero_and_continues() {
        let generator = ScriptedGenerator::new(vec![
            Ok(poor_html()),
            Err(Error::Internal("flaky".into())),
            Ok(rich_html()),
        ]);
        let validator = validator();

        let result = iteration_chain(
            &(generator as Arc<dyn Generator>),
            &validator,
            "a tracker",
            &ChainConfig {
                threshold: 0.70,
                max_rounds: 3,
                patience: 2,
                opts: GenerateOptions::default(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!result.iterations[1].improved);
        assert!(result.iterations[2].improved);
        assert_eq!(result.html, rich_html());
    }
}

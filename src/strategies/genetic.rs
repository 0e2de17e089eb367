//! Genetic evolution over prompt variants.
//!
//! The population starts from the base prompt (one unchanged, the rest
//! mutated). Each generation evaluates every individual in parallel,
//! keeps the elites, and refills by tournament selection, single-point
//! crossover on sentence genes, and per-gene mutation from a fixed list
//! of textual mutations. Evolution stops early once the best individual
//! clears the threshold.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::DEFAULT_PARALLELISM;
use crate::error::{Error, Result};
use crate::router::{GenerateOptions, Generator};
use crate::validate::{Score, Validator};

/// Genes shorter than this are dropped during tokenization.
const MIN_GENE_LEN: usize = 5;

/// Tournament size for parent selection.
const TOURNAMENT_SIZE: usize = 3;

/// The fixed mutation vocabulary.
const MUTATIONS: &[&str] = &[
    "Add a bold accent color to the most important control",
    "Include one subtle animation on state change",
    "Add keyboard shortcuts for the primary actions",
    "Show a compact summary of stored data at the top",
    "Design a friendly empty state for first launch",
    "Add a dark mode toggle that persists",
    "Use large, readable numerals for key figures",
    "Celebrate streaks or milestones visually",
];

/// Configuration for [`evolve`].
#[derive(Debug, Clone)]
pub struct EvolveConfig {
    pub population: usize,
    pub generations: u32,
    /// Per-gene mutation probability.
    pub mutation_rate: f64,
    /// Individuals carried over unchanged each generation.
    pub elite_count: usize,
    /// Early-stop once the best total reaches this.
    pub threshold: f64,
    /// Bound on concurrent LLM calls during evaluation.
    pub parallelism: usize,
    /// PRNG seed; fixed seed gives a reproducible evolution.
    pub seed: u64,
    pub opts: GenerateOptions,
}

impl Default for EvolveConfig {
    fn default() -> Self {
        Self {
            population: 6,
            generations: 4,
            mutation_rate: 0.3,
            elite_count: 2,
            threshold: 0.85,
            parallelism: DEFAULT_PARALLELISM,
            seed: 0x00c0ffee,
            opts: GenerateOptions::default(),
        }
    }
}

/// One member of the population. Lives only within a single evolve call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Individual {
    pub prompt: String,
    pub html: Option<String>,
    pub fitness: Option<Score>,
    pub generation: u32,
}

impl Individual {
    fn seed(prompt: String) -> Self {
        Self {
            prompt,
            html: None,
            fitness: None,
            generation: 0,
        }
    }

    fn total(&self) -> f64 {
        self.fitness.as_ref().map(|f| f.total).unwrap_or(0.0)
    }
}

/// Per-generation summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub generation: u32,
    pub best_total: f64,
    pub mean_total: f64,
}

/// Outcome of an evolution run.
#[derive(Debug, Clone)]
pub struct EvolveOutcome {
    pub best: Individual,
    pub generations_run: u32,
    pub history: Vec<GenerationSummary>,
}

/// Small deterministic PRNG (xorshift64*). The strategies avoid an RNG
/// dependency so evolution is reproducible from the seed alone.
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound.max(1) as u64) as usize
    }
}

/// Split a prompt into sentence genes. Splits on sentence-ending
/// punctuation or newlines; genes shorter than five characters drop out.
pub fn tokenize_genes(prompt: &str) -> Vec<String> {
    prompt
        .split(|c| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|gene| gene.trim())
        .filter(|gene| gene.len() >= MIN_GENE_LEN)
        .map(|gene| gene.to_string())
        .collect()
}

fn join_genes(genes: &[String]) -> String {
    let mut out = genes.join(". ");
    if !out.is_empty() {
        out.push('.');
    }
    out
}

fn mutate(prompt: &str, rate: f64, rng: &mut Rng) -> String {
    let mut genes = tokenize_genes(prompt);
    if genes.is_empty() {
        return prompt.to_string();
    }
    for gene in genes.iter_mut() {
        if rng.next_f64() < rate {
            let mutation = MUTATIONS[rng.below(MUTATIONS.len())];
            gene.push_str(", and ");
            gene.push_str(&mutation.to_lowercase());
        }
    }
    join_genes(&genes)
}

fn crossover(a: &str, b: &str, rng: &mut Rng) -> String {
    let genes_a = tokenize_genes(a);
    let genes_b = tokenize_genes(b);
    if genes_a.is_empty() {
        return b.to_string();
    }
    if genes_b.is_empty() {
        return a.to_string();
    }

    let cut = 1 + rng.below(genes_a.len().min(genes_b.len()));
    let mut child: Vec<String> = genes_a[..cut.min(genes_a.len())].to_vec();
    child.extend_from_slice(&genes_b[cut.min(genes_b.len())..]);
    join_genes(&child)
}

fn tournament<'a>(population: &'a [Individual], rng: &mut Rng) -> &'a Individual {
    let mut best: Option<&Individual> = None;
    for _ in 0..TOURNAMENT_SIZE {
        let candidate = &population[rng.below(population.len())];
        let better = best.map(|b| candidate.total() > b.total()).unwrap_or(true);
        if better {
            best = Some(candidate);
        }
    }
    best.expect("non-empty population")
}

async fn evaluate(
    generator: &Arc<dyn Generator>,
    validator: &Validator,
    population: &mut [Individual],
    parallelism: usize,
    opts: &GenerateOptions,
    cancel: &CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let evaluations = population
        .iter()
        .enumerate()
        .filter(|(_, individual)| individual.fitness.is_none())
        .map(|(index, individual)| {
            let generator = generator.clone();
            let semaphore = semaphore.clone();
            let opts = opts.clone();
            let cancel = cancel.clone();
            let prompt = individual.prompt.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let outcome = generator.generate(&prompt, &opts, &cancel).await;
                (index, outcome)
            }
        })
        .collect::<Vec<_>>();

    for (index, outcome) in join_all(evaluations).await {
        let individual = &mut population[index];
        match outcome {
            Ok((html, _meta)) => {
                individual.fitness = Some(validator.validate(&html));
                individual.html = Some(html);
            }
            Err(e) => {
                tracing::debug!(index, error = %e, "individual failed evaluation, fitness zero");
                individual.fitness = Some(Score::zero());
            }
        }
    }
}

/// Run the evolutionary search.
pub async fn evolve(
    generator: &Arc<dyn Generator>,
    validator: &Validator,
    base_prompt: &str,
    config: &EvolveConfig,
    cancel: &CancellationToken,
) -> Result<EvolveOutcome> {
    if config.population < 2 {
        return Err(Error::InvalidInput("evolution requires a population of at least 2".into()));
    }

    let mut rng = Rng::new(config.seed);
    let mut population: Vec<Individual> = Vec::with_capacity(config.population);
    population.push(Individual::seed(base_prompt.to_string()));
    for _ in 1..config.population {
        population.push(Individual::seed(mutate(
            base_prompt,
            config.mutation_rate.max(0.5),
            &mut rng,
        )));
    }

    let mut history = Vec::new();
    let mut generations_run = 0;

    for generation in 0..config.generations.max(1) {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        evaluate(
            generator,
            validator,
            &mut population,
            config.parallelism,
            &config.opts,
            cancel,
        )
        .await;

        population.sort_by(|a, b| {
            b.total()
                .partial_cmp(&a.total())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        generations_run = generation + 1;

        let best_total = population[0].total();
        let mean_total =
            population.iter().map(Individual::total).sum::<f64>() / population.len() as f64;
        history.push(GenerationSummary {
            generation,
            best_total,
            mean_total,
        });
        tracing::debug!(generation, best_total, mean_total, "generation evaluated");

        if best_total >= config.threshold || generation + 1 == config.generations.max(1) {
            break;
        }

        // Elites survive unchanged; the rest are bred fresh.
        let elite_count = config.elite_count.min(population.len());
        let mut next: Vec<Individual> = population[..elite_count].to_vec();
        while next.len() < config.population {
            let parent_a = tournament(&population, &mut rng);
            let parent_b = tournament(&population, &mut rng);
            let child_prompt = mutate(
                &crossover(&parent_a.prompt, &parent_b.prompt, &mut rng),
                config.mutation_rate,
                &mut rng,
            );
            let mut child = Individual::seed(child_prompt);
            child.generation = generation + 1;
            next.push(child);
        }
        population = next;
    }

    let best = population
        .into_iter()
        .max_by(|a, b| {
            a.total()
                .partial_cmp(&b.total())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("non-empty population");

    if best.html.is_none() {
        return Err(Error::AllProvidersFailed);
    }

    Ok(EvolveOutcome {
        best,
        generations_run,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::testing::{poor_html, rich_html, ScriptedGenerator};
    use pretty_assertions::assert_eq;

    const BASE: &str = "Build a habit tracker. Show a weekly grid. Keep data on the device.";

    #[test]
    fn test_tokenize_genes_drops_short_fragments() {
        let genes = tokenize_genes("Track runs. Go!\nShow weekly totals. a. bb.");
        assert_eq!(genes, vec!["Track runs", "Show weekly totals"]);
    }

    #[test]
    fn test_mutation_is_seed_deterministic() {
        let mut rng_a = Rng::new(42);
        let mut rng_b = Rng::new(42);
        assert_eq!(mutate(BASE, 1.0, &mut rng_a), mutate(BASE, 1.0, &mut rng_b));
    }

    #[test]
    fn test_mutation_rate_zero_is_identity_on_genes() {
        let mut rng = Rng::new(7);
        let mutated = mutate(BASE, 0.0, &mut rng);
        assert_eq!(mutated, join_genes(&tokenize_genes(BASE)));
    }

    #[test]
    fn test_crossover_mixes_parent_genes() {
        let mut rng = Rng::new(9);
        let a = "Alpha gene one. Alpha gene two. Alpha gene three.";
        let b = "Beta gene one. Beta gene two. Beta gene three.";
        let child = crossover(a, b, &mut rng);
        let genes = tokenize_genes(&child);
        assert!(genes[0].starts_with("Alpha"));
        assert!(genes.last().unwrap().starts_with("Beta") || genes.len() == 3);
    }

    #[test]
    fn test_crossover_with_empty_parent() {
        let mut rng = Rng::new(9);
        assert_eq!(crossover("", "Valid gene here.", &mut rng), "Valid gene here.");
        assert_eq!(crossover("Valid gene here.", "", &mut rng), "Valid gene here.");
    }

    #[tokio::test]
    async fn test_evolve_returns_evaluated_best() {
        let generator = ScriptedGenerator::new(vec![Ok(rich_html())]);
        let validator = Validator::new();
        let config = EvolveConfig {
            population: 4,
            generations: 2,
            threshold: 0.99,
            ..Default::default()
        };

        let outcome = evolve(
            &(generator as Arc<dyn Generator>),
            &validator,
            BASE,
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.best.html.is_some());
        assert!(outcome.best.total() > 0.5);
        assert!(!outcome.history.is_empty());
    }

    #[tokio::test]
    async fn test_evolve_early_stops_at_threshold() {
        let generator = ScriptedGenerator::new(vec![Ok(rich_html())]);
        let validator = Validator::new();
        let rich_total = validator.validate(&rich_html()).total;
        let config = EvolveConfig {
            population: 3,
            generations: 10,
            threshold: rich_total - 0.01,
            ..Default::default()
        };

        let outcome = evolve(
            &(generator.clone() as Arc<dyn Generator>),
            &validator,
            BASE,
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.generations_run, 1);
        // Only the first generation was evaluated.
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_individuals_score_zero() {
        let generator = ScriptedGenerator::new(vec![
            Err(crate::error::Error::Internal("down".into())),
            Ok(poor_html()),
        ]);
        let validator = Validator::new();
        let config = EvolveConfig {
            population: 2,
            generations: 1,
            ..Default::default()
        };

        let outcome = evolve(
            &(generator as Arc<dyn Generator>),
            &validator,
            BASE,
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // The surviving individual is the one that produced HTML.
        assert!(outcome.best.html.is_some());
        assert_eq!(outcome.history.len(), 1);
    }

    #[tokio::test]
    async fn test_population_below_two_rejected() {
        let generator = ScriptedGenerator::new(vec![Ok(poor_html())]);
        let validator = Validator::new();
        let config = EvolveConfig {
            population: 1,
            ..Default::default()
        };

        let err = evolve(
            &(generator as Arc<dyn Generator>),
            &validator,
            BASE,
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_seed_population_keeps_base_unchanged() {
        // With an impossible threshold and one generation, the first
        // individual evaluated is the unmutated base prompt.
        let generator = ScriptedGenerator::new(vec![Ok(rich_html())]);
        let validator = Validator::new();
        let config = EvolveConfig {
            population: 3,
            generations: 1,
            ..Default::default()
        };

        let outcome = evolve(
            &(generator as Arc<dyn Generator>),
            &validator,
            BASE,
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // All individuals got the same HTML, so the base prompt (sorted
        // stably among equals) is present in the outcome.
        assert_eq!(outcome.best.fitness.as_ref().unwrap().total, validator.validate(&rich_html()).total);
    }
}

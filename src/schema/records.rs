//! Persisted run records (population entries, generation statistics, era
//! lifecycle) and the progress types reported while a run is in flight.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EraConfig, Prompt};

/// A prompt's membership in one generation's population.
///
/// `generation` is the population position; `prompt.generation()` stays the
/// generation the prompt was created in, so elites appear under several
/// population generations with the same prompt id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationEntry {
    pub era: String,
    /// Generation this population belongs to, which differs from
    /// `prompt.generation()` for elites.
    pub generation: usize,
    /// Carried forward unchanged from the previous generation.
    pub elite: bool,
    pub prompt: Prompt,
}

/// Number of prompts of each kind in one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorCounts {
    /// Prompts carried forward, whatever their origin.
    pub elite: usize,
    /// The remaining fields count non-elite prompts by origin.
    pub initial: usize,
    pub mutation: usize,
    pub crossover: usize,
    pub immigrant: usize,
}

impl OperatorCounts {
    pub fn total(&self) -> usize {
        self.elite + self.initial + self.mutation + self.crossover + self.immigrant
    }
}

/// Student t-test of a generation's fitness against the previous generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TTestResult {
    /// One-tailed p-value (improvement only).
    pub p_value: f64,
    /// `p_value` below 0.05.
    pub significant: bool,
    /// Current mean minus previous mean.
    pub mean_improvement: f64,
    /// Cohen's d.
    pub effect_size: f64,
    /// Pooled-variance Student's t.
    pub t_statistic: f64,
}

/// One-way ANOVA of fitness across all generations so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnovaResult {
    pub p_value: f64,
    /// `p_value` below 0.05.
    pub significant: bool,
    /// One-way ANOVA F across all generations so far.
    pub f_statistic: f64,
    /// Mean fitness keyed by generation.
    pub generation_means: BTreeMap<usize, f64>,
    /// Groups that entered the test.
    pub num_generations: usize,
}

/// Summary statistics recorded once per generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub era: String,
    pub generation: usize,
    pub population_size: usize,
    /// Summary of the generation's fitness values; unscored prompts count as 0.
    pub mean_fitness: f64,
    /// Sample standard deviation.
    pub std_fitness: f64,
    pub median_fitness: f64,
    pub min_fitness: f64,
    pub max_fitness: f64,
    pub counts: OperatorCounts,
    /// Prompts evaluated in this generation (elites are not re-evaluated).
    pub evaluated_count: usize,
    /// Prompts whose compression or judging failed completely.
    pub failed_evaluations: usize,
    /// Wall time from the start of evaluation to the end of recording.
    pub elapsed_seconds: f64,
    /// Corpus sample ids drawn for this generation's evaluations.
    pub evaluation_corpus_ids: Vec<String>,
    /// `words` or `tokens`.
    pub fitness_metric: String,
    pub compression_model: String,
    /// Crossover swapped a single tag.
    pub single_tag: bool,
    /// Convergence signal after this generation, recorded even when ignored.
    pub converged: bool,
    /// Against the previous generation; `None` for generation 0 or zero variance.
    pub ttest_vs_previous: Option<TTestResult>,
    /// Across every generation so far; `None` until three generations exist
    /// or when there is no within-generation variance.
    pub anova: Option<AnovaResult>,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle status of an era.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EraStatus {
    Running,
    /// Stopped on the generation limit or on convergence.
    Completed,
    /// Cancelled or failed.
    Halted,
}

/// Reason evolution stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Reached the configured generation limit.
    MaxGenerations,
    /// Mean fitness plateaued and the signal was honored.
    Converged,
    /// User cancelled.
    Cancelled,
    /// A fatal error stopped the run.
    Error(String),
}

/// Era record: configuration plus lifecycle timestamps and final summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EraRecord {
    pub era: String,
    /// Configuration the era ran with.
    pub config: EraConfig,
    pub status: EraStatus,
    pub start_time: DateTime<Utc>,
    /// Set once the era stops.
    pub end_time: Option<DateTime<Utc>>,
    /// Last recorded generation.
    pub total_generations: usize,
    /// From the last recorded generation, if any.
    pub final_mean_fitness: Option<f64>,
    pub final_max_fitness: Option<f64>,
    pub stop_reason: Option<StopReason>,
}

impl EraRecord {
    /// Record for an era that is starting now.
    pub fn started(config: &EraConfig) -> Self {
        Self {
            era: config.era.clone(),
            config: config.clone(),
            status: EraStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            total_generations: 0,
            final_mean_fitness: None,
            final_max_fitness: None,
            stop_reason: None,
        }
    }

    /// Closing record derived from the starting one.
    pub fn finished(&self, last: Option<&GenerationStats>, stop_reason: StopReason) -> Self {
        let status = match stop_reason {
            StopReason::MaxGenerations | StopReason::Converged => EraStatus::Completed,
            StopReason::Cancelled | StopReason::Error(_) => EraStatus::Halted,
        };
        Self {
            status,
            end_time: Some(Utc::now()),
            total_generations: last.map_or(0, |s| s.generation),
            final_mean_fitness: last.map(|s| s.mean_fitness),
            final_max_fitness: last.map(|s| s.max_fitness),
            stop_reason: Some(stop_reason),
            ..self.clone()
        }
    }
}

/// Current phase of the orchestrator's state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EvolutionPhase {
    /// Creating generation 0.
    #[default]
    Seeding,
    /// Scoring unscored prompts.
    Evaluating,
    /// Computing and persisting generation statistics.
    Recording,
    /// Consulting the convergence monitor.
    CheckingConvergence,
    /// Building the next population.
    Varying,
    /// Run finished.
    Halted,
}

/// Progress update reported after every recorded generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionProgress {
    pub era: String,
    /// Current generation.
    pub generation: usize,
    pub max_generations: usize,
    pub phase: EvolutionPhase,
    /// Mean fitness of the last recorded generation.
    pub mean_fitness: f64,
    /// Best fitness of the last recorded generation.
    pub best_fitness: f64,
    /// Latest convergence signal.
    pub converged: bool,
    /// Set on the final report only.
    pub stop_reason: Option<StopReason>,
}

/// Final result of a run.
#[derive(Debug, Clone)]
pub struct EvolutionResult {
    /// Closing era record.
    pub era: EraRecord,
    /// Statistics of every recorded generation, in order.
    pub history: Vec<GenerationStats>,
    /// Scored population of the last generation.
    pub final_population: Vec<Prompt>,
    pub stop_reason: StopReason,
}

impl EvolutionResult {
    /// Highest-fitness prompt of the final population.
    pub fn best(&self) -> Option<&Prompt> {
        self.final_population.iter().max_by(|a, b| {
            a.fitness()
                .unwrap_or(0.0)
                .total_cmp(&b.fitness().unwrap_or(0.0))
        })
    }
}

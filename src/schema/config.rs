//! Era configuration: population, operator, fitness, evaluation and
//! convergence settings for one evolutionary run.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::CompressionMetric;

/// Top-level configuration for one era (one complete evolutionary run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EraConfig {
    /// Era identifier, used as the persistence key prefix.
    pub era: String,
    /// Corpus domain handed to the corpus provider.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Population and generation settings.
    #[serde(default)]
    pub population: PopulationConfig,
    /// Genetic operator settings.
    #[serde(default)]
    pub operators: OperatorConfig,
    /// Fitness formula settings.
    #[serde(default)]
    pub fitness: FitnessConfig,
    /// Compression and judging settings.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Early-stop settings.
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for EraConfig {
    fn default() -> Self {
        Self {
            era: "era-1".to_string(),
            domain: default_domain(),
            population: PopulationConfig::default(),
            operators: OperatorConfig::default(),
            fitness: FitnessConfig::default(),
            evaluation: EvaluationConfig::default(),
            convergence: ConvergenceConfig::default(),
            random_seed: None,
        }
    }
}

fn default_domain() -> String {
    "mixed".to_string()
}

/// Population and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Number of prompts in every generation (N).
    #[serde(default = "default_population_size")]
    pub size: usize,
    /// Index of the last generation to produce.
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            size: default_population_size(),
            max_generations: default_max_generations(),
        }
    }
}

fn default_population_size() -> usize {
    20
}
fn default_max_generations() -> usize {
    20
}

/// Genetic operator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Fraction of the population carried forward unchanged.
    #[serde(default = "default_elite_fraction")]
    pub elite_fraction: f64,
    /// Fraction of the population produced by mutation.
    #[serde(default = "default_mutation_fraction")]
    pub mutation_fraction: f64,
    /// Fraction of the population injected as immigrants on odd generations.
    #[serde(default = "default_immigration_fraction")]
    pub immigration_fraction: f64,
    /// Tags rewritten per mutation child.
    #[serde(default = "default_tags_per_mutation")]
    pub tags_per_mutation: usize,
    /// Swap exactly one tag role per crossover event.
    #[serde(default)]
    pub single_tag: bool,
    /// Sampling temperature passed to the tag generator.
    #[serde(default = "default_generation_temperature")]
    pub generation_temperature: f64,
    /// Attempts per generated tag before unusable output becomes fatal.
    #[serde(default = "default_max_generation_attempts")]
    pub max_generation_attempts: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            elite_fraction: default_elite_fraction(),
            mutation_fraction: default_mutation_fraction(),
            immigration_fraction: default_immigration_fraction(),
            tags_per_mutation: default_tags_per_mutation(),
            single_tag: false,
            generation_temperature: default_generation_temperature(),
            max_generation_attempts: default_max_generation_attempts(),
        }
    }
}

fn default_elite_fraction() -> f64 {
    0.2
}
fn default_mutation_fraction() -> f64 {
    0.2
}
fn default_immigration_fraction() -> f64 {
    0.08
}
fn default_tags_per_mutation() -> usize {
    1
}
fn default_generation_temperature() -> f64 {
    1.0
}
fn default_max_generation_attempts() -> usize {
    3
}

impl OperatorConfig {
    /// Target elite count for a population of `size`.
    pub fn elite_count(&self, size: usize) -> usize {
        round_fraction(size, self.elite_fraction)
    }

    /// Mutation children per generation.
    pub fn mutation_count(&self, size: usize) -> usize {
        round_fraction(size, self.mutation_fraction)
    }

    /// Immigrants injected on generations that receive immigration.
    pub fn immigrant_count(&self, size: usize) -> usize {
        round_fraction(size, self.immigration_fraction)
    }

    /// Crossover children that fill the rest of `generation` when every
    /// elite slot is taken. Immigrants only arrive on odd generations.
    pub fn crossover_count(&self, size: usize, generation: usize) -> usize {
        let immigrants = if generation % 2 == 1 {
            self.immigrant_count(size)
        } else {
            0
        };
        size.saturating_sub(self.elite_count(size) + self.mutation_count(size) + immigrants)
    }
}

fn round_fraction(size: usize, fraction: f64) -> usize {
    (size as f64 * fraction).round() as usize
}

/// Fitness formula settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessConfig {
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,
    #[serde(default = "default_compression_weight")]
    pub compression_weight: f64,
    /// Compression ratio at which the compression term saturates.
    #[serde(default = "default_compression_cap")]
    pub compression_cap: f64,
    /// Feed the token ratio (instead of the word ratio) into the formula.
    #[serde(default)]
    pub use_token_metric: bool,
}

impl Default for FitnessConfig {
    fn default() -> Self {
        Self {
            quality_weight: default_quality_weight(),
            compression_weight: default_compression_weight(),
            compression_cap: default_compression_cap(),
            use_token_metric: false,
        }
    }
}

impl FitnessConfig {
    pub fn metric(&self) -> CompressionMetric {
        if self.use_token_metric {
            CompressionMetric::Tokens
        } else {
            CompressionMetric::Words
        }
    }
}

fn default_quality_weight() -> f64 {
    0.75
}
fn default_compression_weight() -> f64 {
    0.25
}
fn default_compression_cap() -> f64 {
    20.0
}

/// Compression and judging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// The era's single compression model.
    #[serde(default = "default_compression_model")]
    pub compression_model: String,
    /// Judge models, scored independently.
    #[serde(default = "default_judge_models")]
    pub judge_models: Vec<String>,
    /// Evaluation worker threads (0 = auto-detect).
    #[serde(default)]
    pub parallel_workers: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            compression_model: default_compression_model(),
            judge_models: default_judge_models(),
            parallel_workers: 0,
        }
    }
}

fn default_compression_model() -> String {
    "claude".to_string()
}
fn default_judge_models() -> Vec<String> {
    vec!["openai".to_string(), "claude".to_string(), "gemini".to_string()]
}

/// How the spread of recent generation means is measured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConvergenceCriterion {
    /// max - min of the window.
    #[default]
    Range,
    /// (max - min) relative to the window mean.
    RelativeChange,
}

/// Early-stop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Number of recent generation means considered.
    #[serde(default = "default_convergence_window")]
    pub window: usize,
    /// Spread at or below which the run counts as converged.
    #[serde(default = "default_convergence_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub criterion: ConvergenceCriterion,
    /// Keep evolving to `max_generations` even after convergence.
    #[serde(default)]
    pub no_convergence_stop: bool,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            window: default_convergence_window(),
            threshold: default_convergence_threshold(),
            criterion: ConvergenceCriterion::default(),
            no_convergence_stop: false,
        }
    }
}

fn default_convergence_window() -> usize {
    3
}
fn default_convergence_threshold() -> f64 {
    0.05
}

const MIN_POPULATION: usize = 5;
const WEIGHT_TOLERANCE: f64 = 1e-9;

impl EraConfig {
    /// Validate the configuration before any external call is made.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.era.trim().is_empty() {
            return Err(ConfigError::EmptyEra);
        }

        let size = self.population.size;
        if size < MIN_POPULATION {
            return Err(ConfigError::PopulationTooSmall(size));
        }

        let ops = &self.operators;
        check_fraction("elite_fraction", ops.elite_fraction, 0.0, 0.5, false)?;
        check_fraction("mutation_fraction", ops.mutation_fraction, 0.0, 0.5, true)?;
        check_fraction("immigration_fraction", ops.immigration_fraction, 0.0, 0.3, true)?;

        let total = ops.elite_fraction + ops.mutation_fraction + ops.immigration_fraction;
        if total >= 1.0 {
            return Err(ConfigError::FractionsTooLarge(total));
        }

        let elites = ops.elite_count(size);
        if elites < 1 {
            return Err(ConfigError::NoElites(size));
        }
        let reserved = elites + ops.mutation_count(size) + ops.immigrant_count(size);
        let crossover = size.saturating_sub(reserved);
        if reserved > size || crossover < 2 {
            return Err(ConfigError::NoRoomForCrossover { size, reserved });
        }

        if !(1..=5).contains(&ops.tags_per_mutation) {
            return Err(ConfigError::InvalidTagsPerMutation(ops.tags_per_mutation));
        }
        if ops.max_generation_attempts == 0 {
            return Err(ConfigError::NoGenerationAttempts);
        }
        if !ops.generation_temperature.is_finite() || ops.generation_temperature < 0.0 {
            return Err(ConfigError::InvalidTemperature(ops.generation_temperature));
        }

        let fit = &self.fitness;
        if fit.quality_weight < 0.0 || fit.compression_weight < 0.0 {
            return Err(ConfigError::NegativeWeight);
        }
        let weight_sum = fit.quality_weight + fit.compression_weight;
        if (weight_sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::WeightsDoNotSumToOne(weight_sum));
        }
        if !fit.compression_cap.is_finite() || fit.compression_cap <= 0.0 {
            return Err(ConfigError::InvalidCompressionCap(fit.compression_cap));
        }

        if self.evaluation.compression_model.trim().is_empty() {
            return Err(ConfigError::NoCompressionModel);
        }
        let judges = &self.evaluation.judge_models;
        if judges.is_empty() {
            return Err(ConfigError::NoJudges);
        }
        let mut seen = HashSet::with_capacity(judges.len());
        if let Some(repeated) = judges.iter().find(|model| !seen.insert(model.as_str())) {
            return Err(ConfigError::DuplicateJudge(repeated.clone()));
        }

        if self.convergence.window == 0 {
            return Err(ConfigError::InvalidConvergenceWindow);
        }
        if !self.convergence.threshold.is_finite() || self.convergence.threshold < 0.0 {
            return Err(ConfigError::InvalidConvergenceThreshold(
                self.convergence.threshold,
            ));
        }

        Ok(())
    }
}

fn check_fraction(
    name: &'static str,
    value: f64,
    min: f64,
    max: f64,
    min_inclusive: bool,
) -> Result<(), ConfigError> {
    let above_min = if min_inclusive {
        value >= min
    } else {
        value > min
    };
    if value.is_finite() && above_min && value <= max {
        Ok(())
    } else {
        Err(ConfigError::FractionOutOfRange { name, value, max })
    }
}

/// Era configuration validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Era name must be non-empty")]
    EmptyEra,
    #[error("Population size must be at least 5, got {0}")]
    PopulationTooSmall(usize),
    #[error("{name} = {value} is outside its allowed range (max {max})")]
    FractionOutOfRange {
        name: &'static str,
        value: f64,
        max: f64,
    },
    #[error("Elite, mutation and immigration fractions sum to {0:.2}; they must leave room for crossover")]
    FractionsTooLarge(f64),
    #[error("elite_fraction produces no elites for population {0}")]
    NoElites(usize),
    #[error("Population {size} leaves fewer than 2 crossover slots after reserving {reserved}")]
    NoRoomForCrossover { size: usize, reserved: usize },
    #[error("tags_per_mutation must be 1-5, got {0}")]
    InvalidTagsPerMutation(usize),
    #[error("max_generation_attempts must be at least 1")]
    NoGenerationAttempts,
    #[error("Generation temperature must be a non-negative number, got {0}")]
    InvalidTemperature(f64),
    #[error("Fitness weights must be non-negative")]
    NegativeWeight,
    #[error("Fitness weights must sum to 1, got {0}")]
    WeightsDoNotSumToOne(f64),
    #[error("Compression cap must be positive, got {0}")]
    InvalidCompressionCap(f64),
    #[error("No compression model specified")]
    NoCompressionModel,
    #[error("At least one judge model is required")]
    NoJudges,
    #[error("Judge model '{0}' is listed more than once")]
    DuplicateJudge(String),
    #[error("Convergence window must be at least 1")]
    InvalidConvergenceWindow,
    #[error("Convergence threshold must be a non-negative number, got {0}")]
    InvalidConvergenceThreshold(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = EraConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_operator_counts_round() {
        let ops = OperatorConfig::default();
        assert_eq!(ops.elite_count(10), 2);
        assert_eq!(ops.mutation_count(10), 2);
        assert_eq!(ops.immigrant_count(10), 1);
        assert_eq!(ops.immigrant_count(20), 2);
        assert_eq!(ops.crossover_count(10, 0), 6);
        assert_eq!(ops.crossover_count(10, 1), 5);
        assert_eq!(ops.crossover_count(10, 2), 6);
    }

    #[test]
    fn test_duplicate_judges_rejected() {
        let mut config = EraConfig::default();
        config.evaluation.judge_models = vec!["openai".into(), "claude".into(), "openai".into()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateJudge("openai".into()))
        );

        config.evaluation.judge_models.pop();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_small_population_rejected() {
        let mut config = EraConfig::default();
        config.population.size = 3;
        assert_eq!(config.validate(), Err(ConfigError::PopulationTooSmall(3)));
    }

    #[test]
    fn test_fraction_sum_rejected() {
        let mut config = EraConfig::default();
        config.operators.elite_fraction = 0.5;
        config.operators.mutation_fraction = 0.4;
        config.operators.immigration_fraction = 0.2;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FractionsTooLarge(_))
        ));
    }

    #[test]
    fn test_crossover_room_required() {
        let mut config = EraConfig::default();
        config.population.size = 5;
        config.operators.elite_fraction = 0.4;
        config.operators.mutation_fraction = 0.4;
        config.operators.immigration_fraction = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoRoomForCrossover { .. })
        ));
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = EraConfig::default();
        config.fitness.quality_weight = 0.8;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::WeightsDoNotSumToOne(_))
        ));

        config.fitness.compression_weight = 0.2;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EraConfig =
            serde_json::from_str(r#"{"era": "test-1", "population": {"size": 10}}"#).unwrap();
        assert_eq!(config.population.size, 10);
        assert_eq!(config.population.max_generations, 20);
        assert_eq!(config.evaluation.judge_models.len(), 3);
        assert_eq!(config.fitness.metric(), CompressionMetric::Words);
        assert!(config.validate().is_ok());
    }
}

//! Evolutionary search over compression prompt genomes.
//!
//! # Overview
//!
//! The evolution system consists of:
//!
//! - **Fitness Evaluation** (`fitness`): compression, multi-judge scoring and the
//!   weighted fitness formula
//! - **Selection** (`selection`): elitism and roulette-wheel parent sampling
//! - **Genome Operations** (`genome`): crossover, mutation, immigration and seeding
//! - **Convergence** (`convergence`): sliding-window plateau detection
//! - **Statistics** (`stats`): per-generation summaries, t-test and ANOVA
//! - **Lineage** (`lineage`): ancestry queries and lineage invariant checks
//! - **Archive** (`archive`): append-only persistence of era records
//! - **Search** (`search`): the orchestrator that runs one era
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use prompt_evolution::evolution::{Collaborators, EvolutionEngine, JsonlArchive};
//! use prompt_evolution::schema::EraConfig;
//! # fn clients() -> (
//! #     Arc<dyn prompt_evolution::CorpusProvider>,
//! #     Arc<dyn prompt_evolution::TagGenerator>,
//! #     Arc<dyn prompt_evolution::Compressor>,
//! #     Arc<dyn prompt_evolution::Judge>,
//! # ) { unimplemented!() }
//!
//! let (corpus, generator, compressor, judge) = clients();
//! let store = Arc::new(JsonlArchive::open("runs").unwrap());
//! let collaborators = Collaborators { corpus, generator, compressor, judge, store };
//!
//! let mut engine = EvolutionEngine::new(EraConfig::default(), collaborators).unwrap();
//! let result = engine
//!     .run_with_callback(|progress| {
//!         println!("Generation {}: mean fitness = {:.3}",
//!             progress.generation, progress.mean_fitness);
//!     })
//!     .unwrap();
//!
//! if let Some(best) = result.best() {
//!     println!("Best prompt:\n{}", best.instruction_text());
//! }
//! ```

mod archive;
mod convergence;
mod fitness;
mod genome;
mod lineage;
mod search;
mod selection;
mod stats;

#[cfg(test)]
pub(crate) mod testing;

pub use archive::{JsonlArchive, MemoryArchive, PromptStore, StoreError, StoreReader};
pub use convergence::ConvergenceMonitor;
pub use fitness::{
    FitnessEvaluator, average_quality, compose_fitness, compression_ratio, count_words,
    normalize_compression, survival_factor,
};
pub use genome::{GenomeRng, TagWriter, VariationError, crossover_with_swap};
pub use lineage::{LineageError, LineageIndex};
pub use search::{Collaborators, EvolutionEngine, EvolutionError};
pub use selection::{ParentPool, is_elite_eligible, roulette_index, select_elites};
pub use stats::{FitnessSummary, SIGNIFICANCE_LEVEL, anova, count_origins, summarize, t_test_vs_previous};

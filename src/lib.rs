//! Prompt Evolution - Genetic search for text-compression prompts.
//!
//! This crate evolves compression prompts with a genetic algorithm. Each
//! prompt is a genome of five tagged instructions; fitness combines how well
//! an LLM compresses a corpus sample under the prompt (scored by a panel of
//! judge models) with how much shorter the output is.
//!
//! # Architecture
//!
//! The crate is split into three main modules:
//!
//! - `schema`: Genome, configuration and record types
//! - `collaborators`: Interfaces to the corpus, generation, compression and
//!   judge services
//! - `evolution`: Fitness pipeline, genetic operators, lineage, persistence
//!   and the orchestrator
//!
//! # Example
//!
//! ```rust,no_run
//! use prompt_evolution::schema::EraConfig;
//!
//! let config: EraConfig = serde_json::from_str(r#"{"era": "era-7"}"#).unwrap();
//! config.validate().unwrap();
//!
//! println!("Population {} for {} generations",
//!     config.population.size, config.population.max_generations);
//! ```

pub mod collaborators;
pub mod evolution;
pub mod schema;

// Re-export commonly used types
pub use collaborators::{
    Cl100kTokenCounter, CollaboratorError, Compressor, CorpusProvider, CorpusSample,
    GeneratedText, GenerationRequest, Judge, JudgeRequest, JudgeVerdict, TagGenerator,
    TokenCounter,
};
pub use evolution::{Collaborators, EvolutionEngine, EvolutionError, JsonlArchive, MemoryArchive};
pub use schema::{EraConfig, Prompt, Tag, TagRole};

//! Schema module - Genome, configuration and record types for prompt evolution.

mod config;
mod genome;
mod records;

pub use config::*;
pub use genome::*;
pub use records::*;

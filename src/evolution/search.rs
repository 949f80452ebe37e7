//! Evolution orchestrator: drives one era from seeding to halt.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;

use crate::collaborators::{
    Cl100kTokenCounter, CollaboratorError, Compressor, CorpusProvider, CorpusSample, Judge,
    TagGenerator, TokenCounter,
};
use crate::schema::{
    ConfigError, EraConfig, EraRecord, EvolutionPhase, EvolutionProgress, EvolutionResult,
    GenerationStats, GenomeError, PopulationEntry, Prompt, StopReason, TagRole,
};

use super::archive::{PromptStore, StoreError};
use super::convergence::ConvergenceMonitor;
use super::fitness::FitnessEvaluator;
use super::genome::{GenomeRng, TagWriter, VariationError};
use super::lineage::{LineageError, LineageIndex};
use super::selection::{ParentPool, select_elites};
use super::stats;

/// Fatal errors that stop an era.
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Genome(#[from] GenomeError),
    #[error("Collaborator unavailable: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("Lineage check failed: {0}")]
    Lineage(#[from] LineageError),
    #[error("Persistence failed: {0}")]
    Store(#[from] StoreError),
    #[error("Generation {generation} has {actual} prompts, expected {expected}")]
    PopulationSizeDrift {
        generation: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Generation {generation} needs {needed} parent(s) but only {available} are available")]
    InsufficientParents {
        generation: usize,
        needed: usize,
        available: usize,
    },
    #[error("Tag generator returned unusable '{role}' text {attempts} times")]
    GeneratorOutput { role: TagRole, attempts: usize },
    #[error("Failed to build evaluation thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl From<VariationError> for EvolutionError {
    fn from(err: VariationError) -> Self {
        match err {
            VariationError::Genome(e) => EvolutionError::Genome(e),
            VariationError::Generator { source, .. } => EvolutionError::Collaborator(source),
            VariationError::UnusableOutput { role, attempts } => {
                EvolutionError::GeneratorOutput { role, attempts }
            }
        }
    }
}

/// External services an era depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub corpus: Arc<dyn CorpusProvider>,
    pub generator: Arc<dyn TagGenerator>,
    pub compressor: Arc<dyn Compressor>,
    pub judge: Arc<dyn Judge>,
    pub store: Arc<dyn PromptStore>,
}

/// One population slot.
#[derive(Debug, Clone)]
struct Member {
    prompt: Prompt,
    /// Carried forward from the previous generation.
    elite: bool,
}

/// Evolution engine that runs one era.
pub struct EvolutionEngine {
    config: EraConfig,
    rng: GenomeRng,
    evaluator: FitnessEvaluator,
    writer: TagWriter,
    corpus: Arc<dyn CorpusProvider>,
    store: Arc<dyn PromptStore>,
    pool: rayon::ThreadPool,
    lineage: LineageIndex,
    monitor: ConvergenceMonitor,
    population: Vec<Member>,
    fitness_history: BTreeMap<usize, Vec<f64>>,
    history: Vec<GenerationStats>,
    generation: usize,
    phase: EvolutionPhase,
    cancelled: Arc<AtomicBool>,
}

impl EvolutionEngine {
    /// Create a new evolution engine. The configuration is validated here,
    /// before any collaborator is called.
    pub fn new(config: EraConfig, collaborators: Collaborators) -> Result<Self, EvolutionError> {
        config.validate()?;

        let rng = match config.random_seed {
            Some(seed) => GenomeRng::new(seed),
            None => GenomeRng::random(),
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.evaluation.parallel_workers)
            .thread_name(|i| format!("evaluator-{i}"))
            .build()?;
        let evaluator = FitnessEvaluator::new(
            config.fitness.clone(),
            &config.evaluation,
            collaborators.compressor,
            collaborators.judge,
            Arc::new(Cl100kTokenCounter::new()?),
        );

        Ok(Self {
            rng,
            evaluator,
            writer: TagWriter::new(collaborators.generator, &config.operators),
            corpus: collaborators.corpus,
            store: collaborators.store,
            pool,
            lineage: LineageIndex::new(),
            monitor: ConvergenceMonitor::new(config.convergence.clone()),
            population: Vec::new(),
            fitness_history: BTreeMap::new(),
            history: Vec::new(),
            generation: 0,
            phase: EvolutionPhase::Seeding,
            cancelled: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// Replace the token counter used for the token compression ratio.
    pub fn with_token_counter(mut self, token_counter: Arc<dyn TokenCounter>) -> Self {
        self.evaluator = self.evaluator.with_token_counter(token_counter);
        self
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Lineage of every prompt produced so far.
    pub fn lineage(&self) -> &LineageIndex {
        &self.lineage
    }

    /// Current population.
    pub fn population(&self) -> impl Iterator<Item = &Prompt> {
        self.population.iter().map(|m| &m.prompt)
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn phase(&self) -> EvolutionPhase {
        self.phase
    }

    /// Run evolution with progress callback.
    ///
    /// The era record is appended when the run starts and again when it
    /// halts, including when it halts on an error.
    pub fn run_with_callback<F>(&mut self, callback: F) -> Result<EvolutionResult, EvolutionError>
    where
        F: Fn(&EvolutionProgress),
    {
        let started = EraRecord::started(&self.config);
        self.store.append_era(&started)?;
        log::info!(
            "Era {} started: population {}, up to generation {}",
            self.config.era,
            self.config.population.size,
            self.config.population.max_generations
        );

        let outcome = self.evolve(&callback);
        self.phase = EvolutionPhase::Halted;

        match outcome {
            Ok(stop_reason) => {
                let record = started.finished(self.history.last(), stop_reason.clone());
                self.store.append_era(&record)?;
                log::info!(
                    "Era {} halted after generation {}: {:?}",
                    self.config.era,
                    self.generation,
                    stop_reason
                );
                callback(&self.progress(Some(stop_reason.clone())));
                Ok(EvolutionResult {
                    era: record,
                    history: self.history.clone(),
                    final_population: self.population.iter().map(|m| m.prompt.clone()).collect(),
                    stop_reason,
                })
            }
            Err(err) => {
                log::error!("Era {} failed: {}", self.config.era, err);
                let record =
                    started.finished(self.history.last(), StopReason::Error(err.to_string()));
                if let Err(store_err) = self.store.append_era(&record) {
                    log::error!("Could not record halted era {}: {}", self.config.era, store_err);
                }
                Err(err)
            }
        }
    }

    /// Run evolution (blocking).
    pub fn run(&mut self) -> Result<EvolutionResult, EvolutionError> {
        self.run_with_callback(|_| {})
    }

    fn evolve<F>(&mut self, callback: &F) -> Result<StopReason, EvolutionError>
    where
        F: Fn(&EvolutionProgress),
    {
        if self.is_cancelled() {
            return Ok(StopReason::Cancelled);
        }
        self.phase = EvolutionPhase::Seeding;
        self.seed()?;

        loop {
            if self.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            let generation_start = Instant::now();

            self.phase = EvolutionPhase::Evaluating;
            let corpus_ids = self.evaluate_population()?;
            self.check_population()?;

            self.phase = EvolutionPhase::Recording;
            let mut stats = self.generation_stats(corpus_ids, generation_start);

            self.phase = EvolutionPhase::CheckingConvergence;
            stats.converged = self.monitor.record(stats.mean_fitness);
            self.record(stats)?;
            callback(&self.progress(None));

            if let Some(reason) = self.should_stop() {
                return Ok(reason);
            }

            self.phase = EvolutionPhase::Varying;
            self.step_generation()?;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Check if evolution should stop after the current generation.
    fn should_stop(&self) -> Option<StopReason> {
        if self.generation >= self.config.population.max_generations {
            return Some(StopReason::MaxGenerations);
        }
        if self.monitor.should_stop() {
            return Some(StopReason::Converged);
        }
        if self.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        None
    }

    /// Fill generation 0 with freshly written prompts.
    fn seed(&mut self) -> Result<(), EvolutionError> {
        let size = self.config.population.size;
        let mut population = Vec::with_capacity(size);
        for _ in 0..size {
            let prompt = self.writer.seed(&mut self.rng)?;
            population.push(Member {
                prompt,
                elite: false,
            });
        }
        self.population = population;
        self.generation = 0;
        log::info!("Seeded generation 0 with {} prompts", size);
        Ok(())
    }

    /// Score every unscored prompt on the worker pool.
    ///
    /// Returns once every evaluation has finished, so the next generation's
    /// operators always see a fully scored population.
    fn evaluate_population(&mut self) -> Result<Vec<String>, EvolutionError> {
        let mut jobs: Vec<(Member, Option<CorpusSample>)> = Vec::with_capacity(self.population.len());
        for member in std::mem::take(&mut self.population) {
            let sample = if member.prompt.is_scored() {
                None
            } else {
                Some(self.corpus.sample(&self.config.domain)?)
            };
            jobs.push((member, sample));
        }
        let corpus_ids: Vec<String> = jobs
            .iter()
            .filter_map(|(_, sample)| sample.as_ref().map(|s| s.id.clone()))
            .collect();

        let evaluator = &self.evaluator;
        let scored: Result<Vec<Member>, GenomeError> = self.pool.install(|| {
            jobs.into_par_iter()
                .map(|(member, sample)| match sample {
                    Some(sample) => {
                        let evaluation = evaluator.evaluate(&member.prompt, &sample);
                        Ok(Member {
                            prompt: member.prompt.with_evaluation(evaluation)?,
                            elite: member.elite,
                        })
                    }
                    None => Ok(member),
                })
                .collect()
        });
        self.population = scored?;

        log::debug!(
            "Generation {}: evaluated {} prompts",
            self.generation,
            corpus_ids.len()
        );
        Ok(corpus_ids)
    }

    /// Size and lineage checks on the freshly scored population.
    fn check_population(&mut self) -> Result<(), EvolutionError> {
        let expected = self.config.population.size;
        if self.population.len() != expected {
            return Err(EvolutionError::PopulationSizeDrift {
                generation: self.generation,
                expected,
                actual: self.population.len(),
            });
        }
        for member in &self.population {
            if self.lineage.insert(member.prompt.clone())? {
                self.lineage.validate_prompt(member.prompt.prompt_id())?;
            }
        }
        Ok(())
    }

    fn generation_stats(&self, corpus_ids: Vec<String>, started: Instant) -> GenerationStats {
        let fitness: Vec<f64> = self
            .population
            .iter()
            .map(|m| m.prompt.fitness().unwrap_or(0.0))
            .collect();
        let summary = stats::summarize(&fitness);
        let counts = stats::count_origins(self.population.iter().map(|m| (m.prompt.kind(), m.elite)));
        let failed_evaluations = self
            .population
            .iter()
            .filter(|m| !m.elite)
            .filter(|m| m.prompt.evaluation().is_some_and(|e| e.is_total_failure()))
            .count();

        let ttest_vs_previous = self
            .generation
            .checked_sub(1)
            .and_then(|previous| self.fitness_history.get(&previous))
            .and_then(|previous| stats::t_test_vs_previous(&fitness, previous));
        let mut groups = self.fitness_history.clone();
        groups.insert(self.generation, fitness);
        let anova = stats::anova(&groups);

        GenerationStats {
            era: self.config.era.clone(),
            generation: self.generation,
            population_size: self.population.len(),
            mean_fitness: summary.mean,
            std_fitness: summary.std,
            median_fitness: summary.median,
            min_fitness: summary.min,
            max_fitness: summary.max,
            counts,
            evaluated_count: corpus_ids.len(),
            failed_evaluations,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            evaluation_corpus_ids: corpus_ids,
            fitness_metric: self.config.fitness.metric().as_str().to_string(),
            compression_model: self.config.evaluation.compression_model.clone(),
            single_tag: self.config.operators.single_tag,
            converged: false,
            ttest_vs_previous,
            anova,
            timestamp: Utc::now(),
        }
    }

    /// Persist the population and statistics of the current generation.
    fn record(&mut self, stats: GenerationStats) -> Result<(), EvolutionError> {
        let entries: Vec<PopulationEntry> = self
            .population
            .iter()
            .map(|m| PopulationEntry {
                era: self.config.era.clone(),
                generation: self.generation,
                elite: m.elite,
                prompt: m.prompt.clone(),
            })
            .collect();
        self.store
            .append_population(&self.config.era, self.generation, &entries)?;
        self.store.append_generation_stats(&stats)?;

        log::info!(
            "Generation {}: mean {:.4} (std {:.4}), best {:.4}, elite {} / mutation {} / crossover {} / immigrant {}, {} failed{}",
            stats.generation,
            stats.mean_fitness,
            stats.std_fitness,
            stats.max_fitness,
            stats.counts.elite,
            stats.counts.mutation,
            stats.counts.crossover,
            stats.counts.immigrant,
            stats.failed_evaluations,
            if stats.converged { ", converged" } else { "" }
        );
        if let Some(ttest) = &stats.ttest_vs_previous {
            log::debug!(
                "Generation {} vs previous: t = {:.3}, p = {:.4}, d = {:.3}",
                stats.generation,
                ttest.t_statistic,
                ttest.p_value,
                ttest.effect_size
            );
        }

        self.fitness_history.insert(
            self.generation,
            self.population
                .iter()
                .map(|m| m.prompt.fitness().unwrap_or(0.0))
                .collect(),
        );
        self.history.push(stats);
        Ok(())
    }

    /// Build the next population: elites, mutants, immigrants (odd generations
    /// only), then crossover children for every remaining slot.
    fn step_generation(&mut self) -> Result<(), EvolutionError> {
        let next = self.generation + 1;
        let size = self.config.population.size;
        let ops = self.config.operators.clone();

        let current: Vec<Prompt> = self.population.iter().map(|m| m.prompt.clone()).collect();
        let elite_indices = select_elites(&current, ops.elite_count(size));
        let parents = ParentPool::new(&current, &elite_indices);

        let mut population: Vec<Member> = elite_indices
            .iter()
            .map(|&i| Member {
                prompt: current[i].clone(),
                elite: true,
            })
            .collect();

        let insufficient = |needed: usize| EvolutionError::InsufficientParents {
            generation: next,
            needed,
            available: parents.len(),
        };

        for _ in 0..ops.mutation_count(size) {
            let parent = parents.pick(&mut self.rng).ok_or_else(|| insufficient(1))?;
            let child = self
                .writer
                .mutate(&mut self.rng, parent, ops.tags_per_mutation, next)?;
            population.push(Member {
                prompt: child,
                elite: false,
            });
        }

        if next % 2 == 1 {
            for _ in 0..ops.immigrant_count(size) {
                let immigrant = self.writer.immigrant(&mut self.rng, next)?;
                population.push(Member {
                    prompt: immigrant,
                    elite: false,
                });
            }
        }

        let crossover_count = size.checked_sub(population.len()).ok_or(
            EvolutionError::PopulationSizeDrift {
                generation: next,
                expected: size,
                actual: population.len(),
            },
        )?;
        for _ in 0..crossover_count {
            let (a, b) = parents.pick_pair(&mut self.rng).ok_or_else(|| insufficient(2))?;
            let child = self.rng.crossover(a, b, ops.single_tag, next)?;
            population.push(Member {
                prompt: child,
                elite: false,
            });
        }

        if population.len() != size {
            return Err(EvolutionError::PopulationSizeDrift {
                generation: next,
                expected: size,
                actual: population.len(),
            });
        }

        log::debug!(
            "Generation {}: {} elites, {} crossover children",
            next,
            elite_indices.len(),
            crossover_count
        );
        self.population = population;
        self.generation = next;
        Ok(())
    }

    fn progress(&self, stop_reason: Option<StopReason>) -> EvolutionProgress {
        let last = self.history.last();
        EvolutionProgress {
            era: self.config.era.clone(),
            generation: self.generation,
            max_generations: self.config.population.max_generations,
            phase: self.phase,
            mean_fitness: last.map_or(0.0, |s| s.mean_fitness),
            best_fitness: last.map_or(0.0, |s| s.max_fitness),
            converged: self.monitor.is_converged(),
            stop_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::*;
    use crate::evolution::archive::{MemoryArchive, StoreReader};
    use crate::evolution::testing::{
        ChecksumCompressor, FailingCompressor, FailingGenerator, FixedCorpus, FixedJudge,
        SequenceGenerator, WordKeepingCompressor, initial_prompt, pid, scored_prompt,
    };
    use crate::schema::{EraStatus, Origin, PopulationConfig, Tag};

    /// Non-elite entries of `kind`.
    fn created_in(entries: &[PopulationEntry], kind: Origin) -> usize {
        entries
            .iter()
            .filter(|e| !e.elite && e.prompt.kind() == kind)
            .count()
    }

    fn config(size: usize, max_generations: usize) -> EraConfig {
        let mut config = EraConfig {
            era: "test-era".into(),
            population: PopulationConfig {
                size,
                max_generations,
            },
            random_seed: Some(42),
            ..Default::default()
        };
        config.convergence.no_convergence_stop = true;
        config.evaluation.parallel_workers = 2;
        config
    }

    fn collaborators(
        compressor: Arc<dyn Compressor>,
        generator: Arc<dyn TagGenerator>,
    ) -> (Collaborators, Arc<MemoryArchive>) {
        let store = Arc::new(MemoryArchive::new());
        let collaborators = Collaborators {
            corpus: Arc::new(FixedCorpus::new(40)),
            generator,
            compressor,
            judge: Arc::new(FixedJudge::uniform(4.0, 2.0, 2.0).with_model("gemini", 3.0, 3.0, 1.0)),
            store: store.clone(),
        };
        (collaborators, store)
    }

    fn varied() -> (Collaborators, Arc<MemoryArchive>) {
        collaborators(Arc::new(ChecksumCompressor), Arc::new(SequenceGenerator::new()))
    }

    #[test]
    fn test_invalid_config_rejected_before_work() {
        let (collaborators, store) = varied();
        let result = EvolutionEngine::new(config(3, 2), collaborators);
        assert!(matches!(result, Err(EvolutionError::Config(_))));
        assert!(store.latest_era("test-era").unwrap().is_none());
    }

    #[test]
    fn test_population_size_and_elites() {
        let (collaborators, store) = varied();
        let mut engine = EvolutionEngine::new(config(10, 4), collaborators).unwrap();
        let result = engine.run().unwrap();

        assert_eq!(result.stop_reason, StopReason::MaxGenerations);
        assert_eq!(result.history.len(), 5);
        assert_eq!(result.final_population.len(), 10);

        for generation in 0..=4 {
            let entries = store.population("test-era", generation).unwrap();
            assert_eq!(entries.len(), 10);
            assert!(entries.iter().all(|e| e.prompt.is_scored()));
            let elites = entries.iter().filter(|e| e.elite).count();
            assert_eq!(elites, if generation == 0 { 0 } else { 2 });
        }
    }

    #[test]
    fn test_elites_carried_unchanged() {
        let (collaborators, store) = varied();
        let mut engine = EvolutionEngine::new(config(10, 3), collaborators).unwrap();
        engine.run().unwrap();

        for generation in 1..=3 {
            let previous: HashMap<_, _> = store
                .population("test-era", generation - 1)
                .unwrap()
                .into_iter()
                .map(|e| (e.prompt.prompt_id(), e.prompt))
                .collect();
            let mut best: Vec<f64> = previous.values().filter_map(Prompt::fitness).collect();
            best.sort_by(|a, b| b.total_cmp(a));

            let mut elite_fitness = Vec::new();
            for entry in store.population("test-era", generation).unwrap() {
                if !entry.elite {
                    assert_eq!(entry.prompt.generation(), generation);
                    continue;
                }
                let before = &previous[&entry.prompt.prompt_id()];
                assert_eq!(before.evaluation(), entry.prompt.evaluation());
                assert_eq!(before.generation(), entry.prompt.generation());
                elite_fitness.push(entry.prompt.fitness().unwrap());
            }
            elite_fitness.sort_by(|a, b| b.total_cmp(a));
            assert_eq!(elite_fitness, best[..2].to_vec());
        }
    }

    #[test]
    fn test_operator_counts_and_immigration() {
        let (collaborators, store) = varied();
        let mut engine = EvolutionEngine::new(config(10, 3), collaborators).unwrap();
        let result = engine.run().unwrap();

        let gen0 = &result.history[0].counts;
        assert_eq!((gen0.initial, gen0.elite), (10, 0));

        for stats in &result.history[1..] {
            let entries = store.population("test-era", stats.generation).unwrap();
            let immigrants = if stats.generation % 2 == 1 { 1 } else { 0 };
            assert_eq!(stats.counts.elite, 2);
            assert_eq!(stats.counts.mutation, 2);
            assert_eq!(stats.counts.immigrant, immigrants);
            assert_eq!(stats.counts.crossover, 10 - 2 - 2 - immigrants);
            assert_eq!(created_in(&entries, Origin::Immigrant), immigrants);
            assert_eq!(stats.evaluated_count, 8);
            assert_eq!(stats.evaluation_corpus_ids.len(), 8);
        }
        assert!(result.history[0].ttest_vs_previous.is_none());
        assert!(result.history[1].anova.is_none());
    }

    #[test]
    fn test_lineage_terminates() {
        let (collaborators, store) = varied();
        let mut engine = EvolutionEngine::new(config(10, 5), collaborators).unwrap();
        engine.run().unwrap();

        let mut index = LineageIndex::new();
        for entry in store.populations("test-era", 0..=5).unwrap() {
            index.insert(entry.prompt).unwrap();
        }
        index.validate_all().unwrap();
        assert_eq!(index.len(), engine.lineage().len());

        for prompt in index.prompts() {
            if let Some(hops) = index.hops_to_generation_zero(prompt.prompt_id()).unwrap() {
                assert!(hops <= prompt.generation());
            } else {
                let roots_are_immigrants = index
                    .ancestors(prompt.prompt_id())
                    .unwrap()
                    .iter()
                    .chain(std::iter::once(&prompt.prompt_id()))
                    .filter_map(|id| index.get(*id))
                    .filter(|p| p.parent_ids().is_empty())
                    .all(|p| p.kind() == Origin::Immigrant);
                assert!(roots_are_immigrants);
            }
        }
    }

    #[test]
    fn test_convergence_stops_run() {
        let (collaborators, _) = collaborators(
            Arc::new(WordKeepingCompressor::new(8)),
            Arc::new(SequenceGenerator::new()),
        );
        let mut config = config(10, 10);
        config.convergence.no_convergence_stop = false;
        let mut engine = EvolutionEngine::new(config, collaborators).unwrap();
        let result = engine.run().unwrap();

        assert_eq!(result.stop_reason, StopReason::Converged);
        assert_eq!(result.history.len(), 3);
        assert!(result.history[2].converged);
        assert_eq!(result.era.status, EraStatus::Completed);
    }

    #[test]
    fn test_convergence_recorded_when_overridden() {
        let (collaborators, _) = collaborators(
            Arc::new(WordKeepingCompressor::new(8)),
            Arc::new(SequenceGenerator::new()),
        );
        let mut engine = EvolutionEngine::new(config(10, 4), collaborators).unwrap();
        let result = engine.run().unwrap();

        assert_eq!(result.stop_reason, StopReason::MaxGenerations);
        assert_eq!(result.history.len(), 5);
        assert!(!result.history[1].converged);
        assert!(result.history[2..].iter().all(|s| s.converged));
    }

    #[test]
    fn test_failed_compression_yields_zero_fitness() {
        let (collaborators, _) =
            collaborators(Arc::new(FailingCompressor), Arc::new(SequenceGenerator::new()));
        let mut engine = EvolutionEngine::new(config(10, 2), collaborators).unwrap();
        let result = engine.run().unwrap();

        assert!(result.final_population.iter().all(|p| p.fitness() == Some(0.0)));
        assert_eq!(result.history[0].failed_evaluations, 10);
        assert_eq!(result.history[1].counts.elite, 0);
        assert_eq!(result.history[1].counts.total(), 10);
    }

    #[test]
    fn test_generator_failure_is_fatal() {
        let (collaborators, store) = collaborators(
            Arc::new(ChecksumCompressor),
            Arc::new(FailingGenerator),
        );
        let mut engine = EvolutionEngine::new(config(10, 3), collaborators).unwrap();
        let err = engine.run().unwrap_err();

        assert!(matches!(err, EvolutionError::Collaborator(_)));
        let record = store.latest_era("test-era").unwrap().unwrap();
        assert_eq!(record.status, EraStatus::Halted);
        assert!(matches!(record.stop_reason, Some(StopReason::Error(_))));
    }

    #[test]
    fn test_lineage_violation_halts_era() {
        let (collaborators, store) = varied();
        let mut engine = EvolutionEngine::new(config(10, 3), collaborators).unwrap();

        // Claim the guid the first seeded tag will receive, with other text.
        let first_guid = GenomeRng::new(42).tag_guid();
        let mut tags = initial_prompt(900).tags().to_vec();
        tags[0] = Tag::fresh(
            TagRole::ALL[0],
            first_guid,
            "unrelated text",
            Origin::Initial,
            None,
        )
        .unwrap();
        let squatter = Prompt::new(pid(900), 0, Origin::Initial, vec![], None, tags).unwrap();
        engine.lineage.insert(squatter).unwrap();

        let err = engine.run().unwrap_err();
        assert!(matches!(
            err,
            EvolutionError::Lineage(LineageError::TagConflict(guid)) if guid == first_guid
        ));
        assert_eq!(engine.phase(), EvolutionPhase::Halted);
        assert!(store.generation_stats("test-era", 0..=3).unwrap().is_empty());

        let record = store.latest_era("test-era").unwrap().unwrap();
        assert_eq!(record.status, EraStatus::Halted);
        assert!(matches!(record.stop_reason, Some(StopReason::Error(_))));
    }

    #[test]
    fn test_population_size_drift_detected() {
        let (collaborators, _) = varied();
        let mut engine = EvolutionEngine::new(config(10, 3), collaborators).unwrap();
        engine.seed().unwrap();
        engine.population.truncate(7);

        let err = engine.check_population().unwrap_err();
        assert!(matches!(
            err,
            EvolutionError::PopulationSizeDrift {
                generation: 0,
                expected: 10,
                actual: 7,
            }
        ));
    }

    #[test]
    fn test_empty_parent_pool_is_fatal() {
        let (collaborators, _) = varied();
        let mut engine = EvolutionEngine::new(config(10, 3), collaborators).unwrap();
        engine.population = vec![
            Member {
                prompt: scored_prompt(1, 0.6),
                elite: false,
            },
            Member {
                prompt: scored_prompt(2, 0.4),
                elite: false,
            },
        ];

        let err = engine.step_generation().unwrap_err();
        assert!(matches!(
            err,
            EvolutionError::InsufficientParents {
                generation: 1,
                needed: 1,
                available: 0,
            }
        ));
        assert_eq!(engine.generation(), 0);
        assert_eq!(engine.population().count(), 2);
    }

    #[test]
    fn test_cancellation() {
        let (collaborators, store) = varied();
        let mut engine = EvolutionEngine::new(config(10, 50), collaborators).unwrap();
        let cancel = engine.cancel_handle();

        // Cancel immediately
        cancel.store(true, Ordering::Relaxed);

        let result = engine.run().unwrap();
        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert!(result.history.is_empty());
        assert_eq!(
            store.latest_era("test-era").unwrap().unwrap().status,
            EraStatus::Halted
        );
    }

    #[test]
    fn test_cancel_from_callback() {
        let (collaborators, _) = varied();
        let mut engine = EvolutionEngine::new(config(10, 50), collaborators).unwrap();
        let cancel = engine.cancel_handle();
        let seen = RefCell::new(Vec::new());

        let result = engine
            .run_with_callback(|progress| {
                seen.borrow_mut().push(progress.generation);
                if progress.generation == 1 {
                    cancel.store(true, Ordering::Relaxed);
                }
            })
            .unwrap();

        assert_eq!(result.stop_reason, StopReason::Cancelled);
        assert_eq!(result.history.len(), 2);
        assert_eq!(seen.into_inner(), vec![0, 1, 1]);
    }

    #[test]
    fn test_seeded_runs_reproducible() {
        let run = || {
            let (collaborators, _) = varied();
            let mut engine = EvolutionEngine::new(config(10, 3), collaborators).unwrap();
            engine.run().unwrap()
        };
        let ids = |result: &EvolutionResult| -> Vec<_> {
            result
                .final_population
                .iter()
                .map(|p| (p.prompt_id(), p.fitness()))
                .collect()
        };
        assert_eq!(ids(&run()), ids(&run()));
    }
}

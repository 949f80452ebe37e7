//! Append-only persistence for era, population and generation records.
//!
//! Records are keyed by `(era, generation, prompt_id)` for population entries
//! and `(era, generation)` for statistics. Nothing is ever overwritten: the
//! same key appended twice is an error. Era records are the exception in that
//! a second append (the closing record) supersedes the first for readers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::schema::{EraRecord, GenerationStats, GenomeError, PopulationEntry};

/// Persistence failures. All of them stop a running era.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed record at {path}:{line}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Stored prompt is invalid: {0}")]
    InvalidPrompt(#[from] GenomeError),
    #[error("Duplicate record {0}")]
    Duplicate(String),
    #[error("Entry for {found} appended under {expected}")]
    KeyMismatch { expected: String, found: String },
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Read-only query surface over persisted records.
pub trait StoreReader: Send + Sync {
    /// Most recently appended record of an era.
    fn latest_era(&self, era: &str) -> Result<Option<EraRecord>, StoreError>;

    /// Population of one generation, in append order.
    fn population(&self, era: &str, generation: usize) -> Result<Vec<PopulationEntry>, StoreError>;

    /// Populations of a generation range, ordered by generation.
    fn populations(
        &self,
        era: &str,
        generations: RangeInclusive<usize>,
    ) -> Result<Vec<PopulationEntry>, StoreError>;

    /// Statistics of a generation range, ordered by generation.
    fn generation_stats(
        &self,
        era: &str,
        generations: RangeInclusive<usize>,
    ) -> Result<Vec<GenerationStats>, StoreError>;

    /// Generations with a stored population.
    fn generations(&self, era: &str) -> Result<Vec<usize>, StoreError>;
}

/// Append-only writer used by the orchestrator.
pub trait PromptStore: StoreReader {
    fn append_era(&self, record: &EraRecord) -> Result<(), StoreError>;

    fn append_population(
        &self,
        era: &str,
        generation: usize,
        entries: &[PopulationEntry],
    ) -> Result<(), StoreError>;

    fn append_generation_stats(&self, stats: &GenerationStats) -> Result<(), StoreError>;
}

type GenerationKey = (String, usize);

/// Indexed records shared by both store implementations.
#[derive(Debug, Default)]
struct ArchiveState {
    eras: HashMap<String, EraRecord>,
    populations: BTreeMap<GenerationKey, Vec<PopulationEntry>>,
    stats: BTreeMap<GenerationKey, GenerationStats>,
}

impl ArchiveState {
    fn check_population(
        &self,
        era: &str,
        generation: usize,
        entries: &[PopulationEntry],
    ) -> Result<(), StoreError> {
        let mut seen: HashSet<_> = self
            .populations
            .get(&(era.to_string(), generation))
            .into_iter()
            .flatten()
            .map(|e| e.prompt.prompt_id())
            .collect();
        for entry in entries {
            if entry.era != era || entry.generation != generation {
                return Err(StoreError::KeyMismatch {
                    expected: format!("{era}/{generation}"),
                    found: format!("{}/{}", entry.era, entry.generation),
                });
            }
            let id = entry.prompt.prompt_id();
            if !seen.insert(id) {
                return Err(StoreError::Duplicate(format!(
                    "population entry {era}/{generation}/{id}"
                )));
            }
        }
        Ok(())
    }

    fn insert_population(&mut self, era: &str, generation: usize, entries: &[PopulationEntry]) {
        self.populations
            .entry((era.to_string(), generation))
            .or_default()
            .extend_from_slice(entries);
    }

    fn check_stats(&self, stats: &GenerationStats) -> Result<(), StoreError> {
        if self
            .stats
            .contains_key(&(stats.era.clone(), stats.generation))
        {
            return Err(StoreError::Duplicate(format!(
                "generation stats {}/{}",
                stats.era, stats.generation
            )));
        }
        Ok(())
    }

    fn insert_stats(&mut self, stats: GenerationStats) {
        self.stats
            .insert((stats.era.clone(), stats.generation), stats);
    }

    fn key_range(era: &str, generations: &RangeInclusive<usize>) -> RangeInclusive<GenerationKey> {
        (era.to_string(), *generations.start())..=(era.to_string(), *generations.end())
    }

    fn populations(&self, era: &str, generations: &RangeInclusive<usize>) -> Vec<PopulationEntry> {
        if generations.is_empty() {
            return Vec::new();
        }
        self.populations
            .range(Self::key_range(era, generations))
            .flat_map(|(_, entries)| entries.iter().cloned())
            .collect()
    }

    fn stats(&self, era: &str, generations: &RangeInclusive<usize>) -> Vec<GenerationStats> {
        if generations.is_empty() {
            return Vec::new();
        }
        self.stats
            .range(Self::key_range(era, generations))
            .map(|(_, stats)| stats.clone())
            .collect()
    }

    fn generations(&self, era: &str) -> Vec<usize> {
        self.populations
            .keys()
            .filter(|(e, _)| e == era)
            .map(|(_, generation)| *generation)
            .collect()
    }
}

fn lock(state: &Mutex<ArchiveState>) -> Result<MutexGuard<'_, ArchiveState>, StoreError> {
    state.lock().map_err(|_| StoreError::Poisoned)
}

macro_rules! impl_store_reader {
    ($ty:ty) => {
        impl StoreReader for $ty {
            fn latest_era(&self, era: &str) -> Result<Option<EraRecord>, StoreError> {
                Ok(lock(&self.state)?.eras.get(era).cloned())
            }

            fn population(
                &self,
                era: &str,
                generation: usize,
            ) -> Result<Vec<PopulationEntry>, StoreError> {
                Ok(lock(&self.state)?.populations(era, &(generation..=generation)))
            }

            fn populations(
                &self,
                era: &str,
                generations: RangeInclusive<usize>,
            ) -> Result<Vec<PopulationEntry>, StoreError> {
                Ok(lock(&self.state)?.populations(era, &generations))
            }

            fn generation_stats(
                &self,
                era: &str,
                generations: RangeInclusive<usize>,
            ) -> Result<Vec<GenerationStats>, StoreError> {
                Ok(lock(&self.state)?.stats(era, &generations))
            }

            fn generations(&self, era: &str) -> Result<Vec<usize>, StoreError> {
                Ok(lock(&self.state)?.generations(era))
            }
        }
    };
}

/// In-memory store, used by tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    state: Mutex<ArchiveState>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

impl_store_reader!(MemoryArchive);

impl PromptStore for MemoryArchive {
    fn append_era(&self, record: &EraRecord) -> Result<(), StoreError> {
        lock(&self.state)?
            .eras
            .insert(record.era.clone(), record.clone());
        Ok(())
    }

    fn append_population(
        &self,
        era: &str,
        generation: usize,
        entries: &[PopulationEntry],
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state)?;
        state.check_population(era, generation, entries)?;
        state.insert_population(era, generation, entries);
        Ok(())
    }

    fn append_generation_stats(&self, stats: &GenerationStats) -> Result<(), StoreError> {
        let mut state = lock(&self.state)?;
        state.check_stats(stats)?;
        state.insert_stats(stats.clone());
        Ok(())
    }
}

/// Directory of JSON-lines files, one record per line.
///
/// Existing files are loaded and validated when the archive is opened; every
/// append writes through to disk before the in-memory index is updated.
#[derive(Debug)]
pub struct JsonlArchive {
    dir: PathBuf,
    state: Mutex<ArchiveState>,
}

impl JsonlArchive {
    pub const ERAS_FILE: &'static str = "eras.jsonl";
    pub const POPULATION_FILE: &'static str = "population.jsonl";
    pub const GENERATIONS_FILE: &'static str = "generations.jsonl";

    /// Open (or create) an archive directory.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut state = ArchiveState::default();
        for record in read_lines::<EraRecord>(&dir.join(Self::ERAS_FILE))? {
            state.eras.insert(record.era.clone(), record);
        }

        let population: Vec<PopulationEntry> = read_lines(&dir.join(Self::POPULATION_FILE))?;
        for entry in &population {
            entry.prompt.validate()?;
            let batch = std::slice::from_ref(entry);
            state.check_population(&entry.era, entry.generation, batch)?;
            state.insert_population(&entry.era, entry.generation, batch);
        }

        for stats in read_lines::<GenerationStats>(&dir.join(Self::GENERATIONS_FILE))? {
            state.check_stats(&stats)?;
            state.insert_stats(stats);
        }

        log::debug!(
            "Opened archive {} ({} eras, {} population entries)",
            dir.display(),
            state.eras.len(),
            population.len()
        );

        Ok(Self {
            dir,
            state: Mutex::new(state),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append_lines<T: Serialize>(&self, file: &str, records: &[T]) -> Result<(), StoreError> {
        let path = self.dir.join(file);
        let io_error = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&buffer).map_err(io_error)?;
        writer.flush().map_err(io_error)?;
        Ok(())
    }
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| StoreError::Malformed {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

impl_store_reader!(JsonlArchive);

impl PromptStore for JsonlArchive {
    fn append_era(&self, record: &EraRecord) -> Result<(), StoreError> {
        let mut state = lock(&self.state)?;
        self.append_lines(Self::ERAS_FILE, std::slice::from_ref(record))?;
        state.eras.insert(record.era.clone(), record.clone());
        Ok(())
    }

    fn append_population(
        &self,
        era: &str,
        generation: usize,
        entries: &[PopulationEntry],
    ) -> Result<(), StoreError> {
        let mut state = lock(&self.state)?;
        state.check_population(era, generation, entries)?;
        self.append_lines(Self::POPULATION_FILE, entries)?;
        state.insert_population(era, generation, entries);
        Ok(())
    }

    fn append_generation_stats(&self, stats: &GenerationStats) -> Result<(), StoreError> {
        let mut state = lock(&self.state)?;
        state.check_stats(stats)?;
        self.append_lines(Self::GENERATIONS_FILE, std::slice::from_ref(stats))?;
        state.insert_stats(stats.clone());
        Ok(())
    }
}

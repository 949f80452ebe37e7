//! Prompt Evolution CLI - Validate era configurations and audit stored runs.

use std::fs;
use std::path::PathBuf;

use prompt_evolution::evolution::{JsonlArchive, LineageIndex, StoreError, StoreReader};
use prompt_evolution::schema::EraConfig;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("--example") => print_example_config(),
        Some("validate") if args.len() == 3 => validate(&PathBuf::from(&args[2])),
        Some("audit") if args.len() == 4 => audit(&PathBuf::from(&args[2]), &args[3]),
        _ => {
            eprintln!("Usage: {} <command>", args[0]);
            eprintln!();
            eprintln!("Commands:");
            eprintln!("  --example                 Print the default era configuration");
            eprintln!("  validate <config.json>    Check an era configuration");
            eprintln!("  audit <store-dir> <era>   Summarize a stored era and verify its lineage");
            std::process::exit(1);
        }
    }
}

fn print_example_config() {
    let config = EraConfig::default();
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing config: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_config(path: &PathBuf) -> EraConfig {
    let config_str = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    })
}

fn validate(path: &PathBuf) {
    let config = load_config(path);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let size = config.population.size;
    let ops = &config.operators;
    let elites = ops.elite_count(size);
    let mutants = ops.mutation_count(size);
    let immigrants = ops.immigrant_count(size);

    println!("Era '{}' is valid", config.era);
    println!(
        "  Population: {} for {} generations",
        size, config.population.max_generations
    );
    println!(
        "  Per generation: {} elites, {} mutants, {} immigrants (odd generations only)",
        elites, mutants, immigrants
    );
    println!(
        "  Crossover: {} on even generations, {} on odd generations",
        ops.crossover_count(size, 0),
        ops.crossover_count(size, 1)
    );
    println!(
        "  Fitness: {:.2} quality + {:.2} compression ({} ratio, cap {})",
        config.fitness.quality_weight,
        config.fitness.compression_weight,
        config.fitness.metric().as_str(),
        config.fitness.compression_cap
    );
    println!(
        "  Models: compression {}, judges {}",
        config.evaluation.compression_model,
        config.evaluation.judge_models.join(", ")
    );
}

fn audit(dir: &PathBuf, era: &str) {
    let store = JsonlArchive::open(dir).unwrap_or_else(|e| {
        eprintln!("Error opening store: {}", e);
        std::process::exit(1);
    });
    println!("Store: {}", store.dir().display());

    match store.latest_era(era) {
        Ok(Some(record)) => {
            println!("Era '{}' ({:?})", record.era, record.status);
            println!("  Started: {}", record.start_time);
            if let Some(end) = record.end_time {
                println!("  Ended: {}", end);
            }
            if let Some(reason) = &record.stop_reason {
                println!("  Stop reason: {:?}", reason);
            }
        }
        Ok(None) => println!("Era '{}' has no era record", era),
        Err(e) => store_failure(e),
    }

    let generations = store.generations(era).unwrap_or_else(|e| store_failure(e));
    let (Some(&first), Some(&last)) = (generations.first(), generations.last()) else {
        println!("No stored populations");
        return;
    };

    println!();
    println!("Generation   mean     std      max      elite  mut  cross  immig  failed");
    for stats in store
        .generation_stats(era, first..=last)
        .unwrap_or_else(|e| store_failure(e))
    {
        println!(
            "{:>10}   {:.4}   {:.4}   {:.4}   {:>5}  {:>3}  {:>5}  {:>5}  {:>6}{}",
            stats.generation,
            stats.mean_fitness,
            stats.std_fitness,
            stats.max_fitness,
            stats.counts.elite,
            stats.counts.mutation,
            stats.counts.crossover,
            stats.counts.immigrant,
            stats.failed_evaluations,
            if stats.converged { "  converged" } else { "" }
        );
    }

    let final_population = store.population(era, last).unwrap_or_else(|e| store_failure(e));
    let best = final_population
        .iter()
        .filter_map(|entry| entry.prompt.evaluation().map(|e| (&entry.prompt, e)))
        .max_by(|(_, a), (_, b)| a.fitness.total_cmp(&b.fitness));
    if let Some((prompt, evaluation)) = best {
        println!();
        println!(
            "Best of generation {}: {} ({}) fitness {:.4}, ratio {:.2}, quality {:.2} from {}/{} judges",
            last,
            prompt.prompt_id(),
            prompt.kind(),
            evaluation.fitness,
            evaluation.compression_ratio,
            evaluation.quality_score_avg,
            evaluation.successful_judges(),
            evaluation.judge_details.len()
        );
    }

    let mut lineage = LineageIndex::new();
    for entry in store
        .populations(era, first..=last)
        .unwrap_or_else(|e| store_failure(e))
    {
        if let Err(e) = lineage.insert(entry.prompt) {
            eprintln!("Lineage error: {}", e);
            std::process::exit(1);
        }
    }
    if let Err(e) = lineage.validate_all() {
        eprintln!("Lineage error: {}", e);
        std::process::exit(1);
    }

    let counts = lineage.origin_counts();
    println!();
    println!(
        "Lineage OK: {} prompts ({} initial, {} mutation, {} crossover, {} immigrant)",
        lineage.len(),
        counts.initial,
        counts.mutation,
        counts.crossover,
        counts.immigrant
    );
}

fn store_failure(e: StoreError) -> ! {
    eprintln!("Error reading store: {}", e);
    std::process::exit(1);
}

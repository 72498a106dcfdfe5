//! Command-line driver: configure a world, run or resume it, and wire the
//! file-backed checkpoint and statistics sinks.

use aevolite_core::{World, WorldConfig};
use aevolite_storage::{FileCheckpoints, FileStats};
use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    name = "aevolite",
    about = "In-silico experimental evolution over a toroidal grid"
)]
struct AppCli {
    /// Grid width in cells.
    #[arg(long)]
    width: Option<u32>,
    /// Grid height in cells.
    #[arg(long)]
    height: Option<u32>,
    /// Seed keying every random stream of the run.
    #[arg(long)]
    seed: Option<u64>,
    /// Per-base point mutation rate.
    #[arg(long)]
    mutation_rate: Option<f64>,
    /// Founder genome length in bits.
    #[arg(long)]
    genome_length: Option<usize>,
    /// Generations between checkpoint saves.
    #[arg(long)]
    backup_step: Option<u32>,
    /// Number of generations to simulate.
    #[arg(short = 'n', long, default_value_t = 1_000)]
    generations: u64,
    /// Resume from the checkpoint saved at this generation.
    #[arg(long)]
    resume: Option<u64>,
    /// JSON configuration file; explicit flags override its fields.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory receiving checkpoint files.
    #[arg(long, default_value = "backup")]
    backup_dir: PathBuf,
    /// Directory receiving statistics files.
    #[arg(long, default_value = "stats")]
    stats_dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = AppCli::parse();
    init_tracing();

    let checkpoints = FileCheckpoints::new(&cli.backup_dir)
        .with_context(|| format!("creating backup directory {}", cli.backup_dir.display()))?;
    let stats = FileStats::create(&cli.stats_dir)
        .with_context(|| format!("creating stats directory {}", cli.stats_dir.display()))?;

    let mut world = match cli.resume {
        Some(generation) => {
            let checkpoint = checkpoints
                .load(generation)
                .with_context(|| format!("loading checkpoint for generation {generation}"))?;
            World::from_checkpoint(checkpoint, Box::new(checkpoints), Box::new(stats))?
        }
        None => {
            let config = compose_config(&cli)?;
            World::with_sinks(config, Box::new(checkpoints), Box::new(stats))?
        }
    };

    let summary = world.run(cli.generations)?;
    info!(
        generation = summary.generation,
        best_fitness = summary.best_fitness,
        mean_fitness = summary.mean_fitness,
        "run complete"
    );
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

/// Start from the optional JSON file (missing fields fall back to defaults),
/// then let explicit command-line flags win.
fn compose_config(cli: &AppCli) -> Result<WorldConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading configuration file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing configuration file {}", path.display()))?
        }
        None => WorldConfig::default(),
    };
    if let Some(width) = cli.width {
        config.grid_width = width;
    }
    if let Some(height) = cli.height {
        config.grid_height = height;
    }
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(rate) = cli.mutation_rate {
        config.mutation_rate = rate;
    }
    if let Some(length) = cli.genome_length {
        config.init_length_dna = length;
    }
    if let Some(step) = cli.backup_step {
        config.backup_step = step;
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_configuration() {
        let dir = std::env::temp_dir().join(format!(
            "aevolite-app-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time")
                .as_nanos()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("config.json");
        fs::write(&path, r#"{"grid_width": 10, "seed": 99}"#).expect("config file");

        let cli = AppCli::parse_from([
            "aevolite",
            "--config",
            path.to_str().expect("utf-8 path"),
            "--height",
            "6",
            "--seed",
            "123",
        ]);
        let config = compose_config(&cli).expect("config");
        assert_eq!(config.grid_width, 10, "from file");
        assert_eq!(config.grid_height, 6, "flag beats default");
        assert_eq!(config.seed, 123, "flag beats file");
        assert_eq!(
            config.mutation_rate,
            WorldConfig::default().mutation_rate,
            "untouched fields keep defaults"
        );

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn cli_defaults_run_a_thousand_generations() {
        let cli = AppCli::parse_from(["aevolite"]);
        assert_eq!(cli.generations, 1_000);
        assert_eq!(cli.backup_dir, PathBuf::from("backup"));
        assert!(cli.resume.is_none());
    }
}

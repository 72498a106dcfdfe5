//! File-backed persistence for Aevolite: gzip-compressed binary checkpoints
//! and plain-text per-generation statistics.

use aevolite_core::{
    Checkpoint, Organism, Persistence, PersistenceError, StatsSink,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Checkpoint directory writing one compressed file per saved generation.
#[derive(Debug, Clone)]
pub struct FileCheckpoints {
    dir: PathBuf,
}

impl FileCheckpoints {
    /// Open (creating if needed) a checkpoint directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the checkpoint files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, generation: u64) -> PathBuf {
        self.dir.join(format!("backup_{generation}.az"))
    }

    /// Write one checkpoint, replacing any previous file for the same
    /// generation.
    pub fn write(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let path = self.path_for(checkpoint.generation);
        let file = File::create(&path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        bincode::serialize_into(&mut encoder, checkpoint)?;
        encoder.finish()?.flush()?;
        info!(generation = checkpoint.generation, path = %path.display(), "checkpoint written");
        Ok(())
    }

    /// Load the checkpoint saved for `generation`.
    pub fn load(&self, generation: u64) -> Result<Checkpoint, StorageError> {
        let path = self.path_for(generation);
        let file = File::open(&path)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        let checkpoint = bincode::deserialize_from(decoder)?;
        info!(generation, path = %path.display(), "checkpoint loaded");
        Ok(checkpoint)
    }
}

impl Persistence for FileCheckpoints {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        self.write(checkpoint).map_err(PersistenceError::new)
    }
}

/// Plain-text statistics files: one row per generation for the best organism
/// and for population means.
#[derive(Debug)]
pub struct FileStats {
    best: BufWriter<File>,
    mean: BufWriter<File>,
}

impl FileStats {
    /// Open (creating if needed) the statistics directory and its two files.
    /// Existing files are appended to so resumed runs keep their history.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let best = Self::open_log(&dir.join("stats_best.txt"))?;
        let mean = Self::open_log(&dir.join("stats_mean.txt"))?;
        Ok(Self { best, mean })
    }

    fn open_log(path: &Path) -> Result<BufWriter<File>, StorageError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut writer = BufWriter::new(file);
        if fresh {
            writeln!(
                writer,
                "# generation fitness metaerror genome_length rnas coding_rnas proteins functional_proteins"
            )?;
        }
        Ok(writer)
    }
}

impl StatsSink for FileStats {
    fn write_best(&mut self, generation: u64, best: &Organism) -> Result<(), PersistenceError> {
        let stats = best.stats();
        let result: Result<(), StorageError> = (|| {
            writeln!(
                self.best,
                "{} {:e} {:e} {} {} {} {} {}",
                generation,
                best.fitness(),
                best.metaerror(),
                stats.genome_length,
                stats.rna_count,
                stats.coding_rnas,
                stats.protein_count,
                stats.functional_proteins,
            )?;
            self.best.flush()?;
            Ok(())
        })();
        result.map_err(PersistenceError::new)
    }

    fn write_average(
        &mut self,
        generation: u64,
        population: &[Arc<Organism>],
    ) -> Result<(), PersistenceError> {
        let count = population.len() as f64;
        let mut fitness = 0.0;
        let mut metaerror = 0.0;
        let mut genome_length = 0.0;
        let mut rnas = 0.0;
        let mut coding_rnas = 0.0;
        let mut proteins = 0.0;
        let mut functional = 0.0;
        for organism in population {
            let stats = organism.stats();
            fitness += organism.fitness();
            metaerror += organism.metaerror();
            genome_length += stats.genome_length as f64;
            rnas += stats.rna_count as f64;
            coding_rnas += stats.coding_rnas as f64;
            proteins += stats.protein_count as f64;
            functional += stats.functional_proteins as f64;
        }

        let result: Result<(), StorageError> = (|| {
            writeln!(
                self.mean,
                "{} {:e} {:e} {} {} {} {} {}",
                generation,
                fitness / count,
                metaerror / count,
                genome_length / count,
                rnas / count,
                coding_rnas / count,
                proteins / count,
                functional / count,
            )?;
            self.mean.flush()?;
            Ok(())
        })();
        result.map_err(PersistenceError::new)
    }
}

impl Drop for FileStats {
    fn drop(&mut self) {
        if let Err(err) = self.best.flush().and_then(|()| self.mean.flush()) {
            warn!("failed to flush statistics on drop: {err}");
        }
    }
}

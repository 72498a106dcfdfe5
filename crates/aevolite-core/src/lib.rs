//! Core simulation types for the Aevolite workspace.
//!
//! A toroidal grid of organisms evolves toward a fixed phenotypic target.
//! Each organism carries a circular binary genome; transcribed units (RNAs)
//! and translated units (proteins) are derived from it by pattern matching,
//! proteins contribute triangular kernels to a phenotype curve, and the L1
//! distance between phenotype and target determines fitness. Selection is
//! local and fitness-proportional over the 3x3 toroidal neighborhood.

use aevolite_rng::{RngPool, RngStream, StreamPurpose};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Length in bits of the promoter consensus window.
pub const PROM_SIZE: usize = 22;

/// Promoter consensus sequence. A window within Hamming distance
/// [`MAX_PROM_DISTANCE`] of this pattern starts a transcription unit.
pub const PROM_SEQ: &str = "0101011001110010010110";

/// Largest Hamming distance at which a window still counts as a promoter.
pub const MAX_PROM_DISTANCE: u32 = 4;

/// Span in bits of a terminator hairpin (4-bit stem, 3-bit loop, 4-bit stem).
pub const TERM_SIZE: usize = 11;

/// Number of complementary stem pairs required for a terminator.
pub const TERM_STEM_SIZE: usize = 4;

/// Ribosome binding pattern preceding a start codon.
pub const SHINE_DAL_SEQ: &str = "011011";

/// Offset from a gene start to the first coding bit: the 6-bit binding site,
/// a 4-bit spacer, and the 3-bit start codon.
pub const SD_TO_START: usize = 13;

/// Offset from a gene start to the start codon itself.
pub const SD_TO_START_CODON: usize = 10;

/// Bits per codon.
pub const CODON_SIZE: usize = 3;

pub const CODON_START: u8 = 0b000;
pub const CODON_STOP: u8 = 0b001;
pub const CODON_W0: u8 = 0b010;
pub const CODON_W1: u8 = 0b011;
pub const CODON_M0: u8 = 0b100;
pub const CODON_M1: u8 = 0b101;
pub const CODON_H0: u8 = 0b110;
pub const CODON_H1: u8 = 0b111;

/// Largest number of codons decoded from a single protein.
pub const MAX_CODONS: usize = 64;

/// Sampling resolution of the phenotype and target curves over [0, 1].
pub const PHENOTYPE_SIZE: usize = 300;

/// Exponent applied to the metabolic error when computing fitness.
pub const SELECTION_PRESSURE: f64 = 1000.0;

pub const X_MIN: f64 = 0.0;
pub const X_MAX: f64 = 1.0;
pub const W_MIN: f64 = 0.0;
pub const W_MAX: f64 = 0.033333333;
pub const H_MIN: f64 = -1.0;
pub const H_MAX: f64 = 1.0;
pub const Y_MIN: f64 = 0.0;
pub const Y_MAX: f64 = 1.0;

/// Proteins whose |w| or |h| fall below this threshold contribute nothing.
const PROTEIN_EPSILON: f64 = 1e-15;

/// Cells in the 3x3 toroidal selection neighborhood.
const NEIGHBORHOOD_SIZE: usize = 9;

/// Errors raised while constructing or advancing a world.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A checkpoint whose fields are inconsistent with each other.
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(&'static str),
    /// A genome shorter than the promoter window cannot be indexed safely.
    #[error("genome shorter than the promoter window")]
    DegenerateGenome,
    /// Failure reported by a persistence or statistics collaborator.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Opaque failure surfaced by persistence and statistics sinks.
#[derive(Debug, Error)]
#[error("persistence failure: {source}")]
pub struct PersistenceError {
    #[from]
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl PersistenceError {
    /// Wrap a concrete sink error.
    pub fn new(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }
}

/// Static configuration for a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Grid width in cells.
    pub grid_width: u32,
    /// Grid height in cells.
    pub grid_height: u32,
    /// Seed keying every random stream of the run.
    pub seed: u64,
    /// Per-base point mutation rate.
    pub mutation_rate: f64,
    /// Length in bits of the randomly generated founder genome.
    pub init_length_dna: usize,
    /// Generations between checkpoint saves.
    pub backup_step: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            grid_width: 32,
            grid_height: 32,
            seed: 42,
            mutation_rate: 1e-5,
            init_length_dna: 5_000,
            backup_step: 10,
        }
    }
}

impl WorldConfig {
    fn validate(&self) -> Result<(), WorldError> {
        if self.grid_width == 0 || self.grid_height == 0 {
            return Err(WorldError::InvalidConfig("grid dimensions must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.mutation_rate) {
            return Err(WorldError::InvalidConfig(
                "mutation_rate must lie in [0, 1]",
            ));
        }
        if self.init_length_dna < PROM_SIZE {
            return Err(WorldError::InvalidConfig(
                "init_length_dna must cover at least one promoter window",
            ));
        }
        if self.backup_step == 0 {
            return Err(WorldError::InvalidConfig("backup_step must be non-zero"));
        }
        Ok(())
    }

    /// Number of organisms on the grid.
    #[must_use]
    pub const fn population_size(&self) -> usize {
        self.grid_width as usize * self.grid_height as usize
    }
}

/// One Gaussian component of the phenotypic target.
#[derive(Debug, Clone, Copy)]
struct Gaussian {
    height: f64,
    mean: f64,
    width: f64,
}

impl Gaussian {
    const fn new(height: f64, mean: f64, width: f64) -> Self {
        Self {
            height,
            mean,
            width,
        }
    }

    fn compute_y(&self, x: f64) -> f64 {
        let offset = x - self.mean;
        self.height * (-(offset * offset) / (2.0 * self.width * self.width)).exp()
    }
}

/// The fixed environmental curve organisms are selected against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhenotypicTarget {
    values: Vec<f64>,
    geometric_area: f64,
}

impl PhenotypicTarget {
    /// The standard three-Gaussian target sampled at `i / 300`, clipped to
    /// `[Y_MIN, Y_MAX]`.
    #[must_use]
    pub fn from_gaussians() -> Self {
        let gaussians = [
            Gaussian::new(1.2, 0.52, 0.12),
            Gaussian::new(-1.4, 0.5, 0.07),
            Gaussian::new(0.3, 0.8, 0.03),
        ];
        let values = (0..PHENOTYPE_SIZE)
            .map(|i| {
                let x = i as f64 / PHENOTYPE_SIZE as f64;
                let y: f64 = gaussians.iter().map(|g| g.compute_y(x)).sum();
                y.clamp(Y_MIN, Y_MAX)
            })
            .collect();
        Self::with_values(values)
    }

    /// Rebuild a target from persisted samples.
    pub fn from_values(values: Vec<f64>) -> Result<Self, WorldError> {
        if values.len() != PHENOTYPE_SIZE {
            return Err(WorldError::InvalidCheckpoint(
                "target sample count does not match the phenotype resolution",
            ));
        }
        Ok(Self::with_values(values))
    }

    fn with_values(values: Vec<f64>) -> Self {
        let geometric_area = (0..PHENOTYPE_SIZE - 1)
            .map(|i| (values[i].abs() + values[i + 1].abs()) / (2.0 * PHENOTYPE_SIZE as f64))
            .sum();
        Self {
            values,
            geometric_area,
        }
    }

    /// Sampled target values.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Trapezoidal L1 norm of the target; the metabolic error of an empty
    /// phenotype.
    #[must_use]
    pub const fn geometric_area(&self) -> f64 {
        self.geometric_area
    }
}

/// Circular binary genome stored as packed 64-bit words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genome {
    words: Vec<u64>,
    len: usize,
}

impl Genome {
    /// Generate a uniformly random genome of `length` bits.
    pub fn random(length: usize, rng: &mut RngStream) -> Result<Self, WorldError> {
        if length < PROM_SIZE {
            return Err(WorldError::DegenerateGenome);
        }
        let mut genome = Self {
            words: vec![0; length.div_ceil(64)],
            len: length,
        };
        for position in 0..length {
            if rng.uniform_int(0, 1) == 1 {
                genome.words[position >> 6] |= 1 << (position & 63);
            }
        }
        Ok(genome)
    }

    /// Number of bits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bit value at `pos`, wrapping circularly.
    #[inline]
    #[must_use]
    pub fn bit(&self, pos: usize) -> bool {
        let pos = pos % self.len;
        (self.words[pos >> 6] >> (pos & 63)) & 1 == 1
    }

    /// Toggle the bit at `pos`.
    pub fn flip(&mut self, pos: usize) {
        let pos = pos % self.len;
        self.words[pos >> 6] ^= 1 << (pos & 63);
    }

    /// Hamming distance between the window starting at `pos` and the
    /// promoter consensus.
    #[must_use]
    pub fn promoter_distance(&self, pos: usize) -> u32 {
        PROM_SEQ
            .bytes()
            .enumerate()
            .filter(|&(offset, expected)| self.bit(pos + offset) != (expected == b'1'))
            .count() as u32
    }

    /// Number of complementary stem pairs of the hairpin test at `pos`.
    /// A value of [`TERM_STEM_SIZE`] marks a terminator.
    #[must_use]
    pub fn terminator_distance(&self, pos: usize) -> u32 {
        (0..TERM_STEM_SIZE)
            .filter(|&i| self.bit(pos + i) != self.bit(pos + TERM_SIZE - 1 - i))
            .count() as u32
    }

    /// True when `pos` carries the ribosome binding site followed by a start
    /// codon four bases downstream.
    #[must_use]
    pub fn shine_dal_start(&self, pos: usize) -> bool {
        SHINE_DAL_SEQ
            .bytes()
            .enumerate()
            .all(|(offset, expected)| self.bit(pos + offset) == (expected == b'1'))
            && self.codon_at(pos + SD_TO_START_CODON) == CODON_START
    }

    /// True when the codon at `pos` is the stop codon.
    #[must_use]
    pub fn protein_stop(&self, pos: usize) -> bool {
        self.codon_at(pos) == CODON_STOP
    }

    /// Integer value of the three bits at `pos` (first bit is the high bit).
    #[must_use]
    pub fn codon_at(&self, pos: usize) -> u8 {
        let mut value = 0;
        for offset in 0..CODON_SIZE {
            value <<= 1;
            if self.bit(pos + offset) {
                value |= 1;
            }
        }
        value
    }
}

/// A transcribed unit delimited by a promoter and a terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct Rna {
    /// Promoter position.
    pub begin: usize,
    /// Last transcribed position, past the terminator hairpin.
    pub end: usize,
    /// Expression level derived from the promoter distance.
    pub expression: f64,
    /// Transcribed length net of the promoter window.
    pub length: usize,
    /// Whether at least one protein was translated from this unit.
    pub is_coding: bool,
    /// Gene start positions found on this unit.
    pub gene_starts: Vec<usize>,
}

/// A translated unit with its decoded triangle parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Protein {
    /// Gene start position (the binding site, not the coding region).
    pub start: usize,
    /// Position of the last stop-codon bit.
    pub end: usize,
    /// Coding length in bits until decoding, codon count afterwards.
    pub length: usize,
    /// Accumulated expression; duplicates fold into their representative.
    pub expression: f64,
    /// Triangle peak abscissa.
    pub m: f64,
    /// Triangle half-width.
    pub w: f64,
    /// Triangle signed height.
    pub h: f64,
    /// False when a codon class is missing or the triangle is degenerate.
    pub is_functional: bool,
    /// Cleared on duplicates folded into a representative.
    pub is_valid: bool,
}

/// Derived counts reported to statistics sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrganismStats {
    pub genome_length: usize,
    pub rna_count: usize,
    pub coding_rnas: usize,
    pub non_coding_rnas: usize,
    pub protein_count: usize,
    pub functional_proteins: usize,
    pub non_functional_proteins: usize,
}

/// One organism: a genome plus every structure derived from it.
///
/// Organisms stored in the world's generation arrays are immutable; children
/// produced without mutation share their parent through `Arc`.
#[derive(Debug, Clone)]
pub struct Organism {
    dna: Genome,
    promoters: BTreeMap<usize, u32>,
    terminators: BTreeSet<usize>,
    rnas: Vec<Rna>,
    proteins: Vec<Protein>,
    phenotype: Vec<f64>,
    delta: Vec<f64>,
    metaerror: f64,
    fitness: f64,
}

impl Organism {
    /// Organism with a freshly generated random genome and empty caches.
    pub fn random(length: usize, rng: &mut RngStream) -> Result<Self, WorldError> {
        Ok(Self::from_genome(Genome::random(length, rng)?))
    }

    /// Organism wrapping an existing genome; caches start empty.
    #[must_use]
    pub fn from_genome(dna: Genome) -> Self {
        Self {
            dna,
            promoters: BTreeMap::new(),
            terminators: BTreeSet::new(),
            rnas: Vec::new(),
            proteins: Vec::new(),
            phenotype: vec![0.0; PHENOTYPE_SIZE],
            delta: vec![0.0; PHENOTYPE_SIZE],
            metaerror: 0.0,
            fitness: 0.0,
        }
    }

    /// Clone a parent's genome and promoter map for a child about to mutate.
    /// The remaining caches are rebuilt after the mutations land.
    #[must_use]
    pub fn child_of(parent: &Self) -> Self {
        Self {
            dna: parent.dna.clone(),
            promoters: parent.promoters.clone(),
            terminators: BTreeSet::new(),
            rnas: Vec::new(),
            proteins: Vec::new(),
            phenotype: vec![0.0; PHENOTYPE_SIZE],
            delta: vec![0.0; PHENOTYPE_SIZE],
            metaerror: 0.0,
            fitness: 0.0,
        }
    }

    #[must_use]
    pub fn dna(&self) -> &Genome {
        &self.dna
    }

    /// Promoter positions mapped to their consensus distance.
    #[must_use]
    pub fn promoters(&self) -> &BTreeMap<usize, u32> {
        &self.promoters
    }

    /// Known terminator positions, sorted.
    #[must_use]
    pub fn terminators(&self) -> &BTreeSet<usize> {
        &self.terminators
    }

    #[must_use]
    pub fn rnas(&self) -> &[Rna] {
        &self.rnas
    }

    #[must_use]
    pub fn proteins(&self) -> &[Protein] {
        &self.proteins
    }

    /// Phenotype samples, each in [0, 1].
    #[must_use]
    pub fn phenotype(&self) -> &[f64] {
        &self.phenotype
    }

    /// Trapezoidal L1 distance between phenotype and target.
    #[must_use]
    pub const fn metaerror(&self) -> f64 {
        self.metaerror
    }

    #[must_use]
    pub const fn fitness(&self) -> f64 {
        self.fitness
    }

    /// Counts reported to statistics sinks.
    #[must_use]
    pub fn stats(&self) -> OrganismStats {
        let coding_rnas = self.rnas.iter().filter(|rna| rna.is_coding).count();
        let valid = self.proteins.iter().filter(|p| p.is_valid).count();
        let functional = self
            .proteins
            .iter()
            .filter(|p| p.is_valid && p.is_functional)
            .count();
        OrganismStats {
            genome_length: self.dna.len(),
            rna_count: self.rnas.len(),
            coding_rnas,
            non_coding_rnas: self.rnas.len() - coding_rnas,
            protein_count: valid,
            functional_proteins: functional,
            non_functional_proteins: valid - functional,
        }
    }

    /// Apply an ordered list of mutation events to the genome, repairing the
    /// promoter map around each touched position.
    pub fn apply_mutations(&mut self, events: &[MutationEvent]) {
        for event in events {
            match *event {
                MutationEvent::Switch { position } => {
                    self.dna.flip(position);
                    self.refresh_promoters_around(position);
                }
            }
        }
    }

    /// Re-examine the promoter windows covering `pos` after its bit changed.
    fn refresh_promoters_around(&mut self, pos: usize) {
        let len = self.dna.len();
        if len < PROM_SIZE {
            return;
        }
        for offset in 0..PROM_SIZE {
            let start = (pos + len - offset) % len;
            let distance = self.dna.promoter_distance(start);
            if distance <= MAX_PROM_DISTANCE {
                self.promoters.insert(start, distance);
            } else {
                self.promoters.remove(&start);
            }
        }
    }

    /// Full scan of the genome for promoters and terminators.
    pub fn locate_promoters_and_terminators(&mut self) {
        self.promoters.clear();
        self.terminators.clear();
        let len = self.dna.len();
        if len < PROM_SIZE {
            return;
        }
        for position in 0..len {
            let distance = self.dna.promoter_distance(position);
            if distance <= MAX_PROM_DISTANCE {
                self.promoters.insert(position, distance);
            }
            if self.dna.terminator_distance(position) == TERM_STEM_SIZE as u32 {
                self.terminators.insert(position);
            }
        }
    }

    /// Rebuild every derived structure from scratch, starting with a full
    /// promoter/terminator scan.
    pub fn evaluate_full(&mut self, target: &PhenotypicTarget) {
        self.locate_promoters_and_terminators();
        self.proteins.clear();
        self.locate_rnas_full();
        self.finish_evaluation(target);
    }

    /// Rebuild derived structures from the maintained promoter map,
    /// discovering terminators by walking the genome.
    pub fn evaluate_incremental(&mut self, target: &PhenotypicTarget) {
        self.locate_rnas_incremental();
        self.finish_evaluation(target);
    }

    fn finish_evaluation(&mut self, target: &PhenotypicTarget) {
        self.find_gene_starts();
        self.compute_proteins();
        self.translate_proteins();
        self.compute_phenotype();
        self.compute_fitness(target);
    }

    /// Pair each promoter with the first terminator at or after its
    /// transcription start, using the sorted terminator set.
    fn locate_rnas_full(&mut self) {
        self.rnas.clear();
        if self.terminators.is_empty() {
            return;
        }
        let len = self.dna.len();
        for (&prom_pos, &distance) in &self.promoters {
            let start = (prom_pos + PROM_SIZE) % len;
            let terminator = self
                .terminators
                .range(start..)
                .next()
                .or_else(|| self.terminators.iter().next())
                .copied();
            let Some(terminator) = terminator else {
                continue;
            };
            let end = (terminator + TERM_SIZE - 1) % len;
            let raw = (len - prom_pos + end) % len;
            let length = raw as i64 - (PROM_SIZE as i64 - 1);
            if length > 0 {
                self.rnas.push(Rna {
                    begin: prom_pos,
                    end,
                    expression: 1.0 - f64::from(distance) / 5.0,
                    length: length as usize,
                    is_coding: false,
                    gene_starts: Vec::new(),
                });
            }
        }
    }

    /// Pair each promoter with a terminator by probing the genome forward,
    /// recording every terminator encountered.
    fn locate_rnas_incremental(&mut self) {
        self.proteins.clear();
        self.rnas.clear();
        self.terminators.clear();
        let len = self.dna.len();
        for (&prom_pos, &distance) in &self.promoters {
            let start = (prom_pos + PROM_SIZE) % len;
            let mut position = start;
            let mut terminator = None;
            loop {
                if self.dna.terminator_distance(position) == TERM_STEM_SIZE as u32 {
                    terminator = Some(position);
                    break;
                }
                position = (position + 1) % len;
                if position == start {
                    break;
                }
            }
            let Some(terminator) = terminator else {
                continue;
            };
            self.terminators.insert(terminator);
            let end = (terminator + TERM_SIZE - 1) % len;
            let raw = (len - prom_pos + end) % len;
            let length = raw as i64 - (PROM_SIZE as i64 - 1);
            if length > 0 {
                self.rnas.push(Rna {
                    begin: prom_pos,
                    end,
                    expression: 1.0 - f64::from(distance) / 5.0,
                    length: length as usize,
                    is_coding: false,
                    gene_starts: Vec::new(),
                });
            }
        }
    }

    /// Scan each transcribed unit for ribosome binding sites.
    fn find_gene_starts(&mut self) {
        let len = self.dna.len();
        for rna in &mut self.rnas {
            rna.gene_starts.clear();
            if rna.length < PROM_SIZE {
                continue;
            }
            let mut position = (rna.begin + PROM_SIZE) % len;
            while position != rna.end {
                if self.dna.shine_dal_start(position) {
                    rna.gene_starts.push(position);
                }
                position = (position + 1) % len;
            }
        }
    }

    /// Walk each gene in codon steps until its stop codon, emitting proteins
    /// long enough to carry a signal.
    fn compute_proteins(&mut self) {
        let len = self.dna.len();
        for rna in &mut self.rnas {
            for &gene_start in &rna.gene_starts {
                let mut position = (gene_start + SD_TO_START) % len;
                let transcription_start = (rna.begin + PROM_SIZE) % len;
                let upstream = if transcription_start <= gene_start {
                    gene_start - transcription_start
                } else {
                    len - transcription_start + gene_start
                };
                let mut transcribed = (upstream + SD_TO_START) as i64;

                while rna.length as i64 - transcribed >= CODON_SIZE as i64 {
                    if self.dna.protein_stop(position) {
                        let end = (position + CODON_SIZE - 1) % len;
                        let coding_start = gene_start + SD_TO_START;
                        let length = if coding_start < end {
                            (end - coding_start) as i64
                        } else {
                            len as i64 - coding_start as i64 + end as i64
                        };
                        if length >= CODON_SIZE as i64 {
                            self.proteins.push(Protein {
                                start: gene_start,
                                end,
                                length: length as usize,
                                expression: rna.expression,
                                m: 0.0,
                                w: 0.0,
                                h: 0.0,
                                is_functional: false,
                                is_valid: true,
                            });
                            rna.is_coding = true;
                        }
                        break;
                    }
                    position = (position + CODON_SIZE) % len;
                    transcribed += CODON_SIZE as i64;
                }
            }
        }
    }

    /// Decode each protein's codon stream into its (m, w, h) triangle via the
    /// reflected-binary accumulators, then fold duplicate genes.
    fn translate_proteins(&mut self) {
        let len = self.dna.len();
        for protein in &mut self.proteins {
            if !protein.is_valid {
                continue;
            }
            let mut position = (protein.start + SD_TO_START) % len;
            let codon_budget = (protein.length / CODON_SIZE).min(MAX_CODONS);
            let mut codons = [0u8; MAX_CODONS];
            for slot in codons.iter_mut().take(codon_budget) {
                *slot = self.dna.codon_at(position);
                position = (position + CODON_SIZE) % len;
            }

            let mut m_acc = 0.0;
            let mut w_acc = 0.0;
            let mut h_acc = 0.0;
            let mut m_count = 0u32;
            let mut w_count = 0u32;
            let mut h_count = 0u32;
            // Carriers start clear so the high-weight bit survives the
            // Gray-to-binary XOR.
            let mut m_carry = false;
            let mut w_carry = false;
            let mut h_carry = false;

            for &codon in &codons[..codon_budget] {
                match codon {
                    CODON_M0 | CODON_M1 => {
                        m_count += 1;
                        m_carry ^= codon == CODON_M1;
                        m_acc *= 2.0;
                        if m_carry {
                            m_acc += 1.0;
                        }
                    }
                    CODON_W0 | CODON_W1 => {
                        w_count += 1;
                        w_carry ^= codon == CODON_W1;
                        w_acc *= 2.0;
                        if w_carry {
                            w_acc += 1.0;
                        }
                    }
                    // The start codon codes for the same amino acid as H0.
                    CODON_H0 | CODON_H1 | CODON_START => {
                        h_count += 1;
                        h_carry ^= codon == CODON_H1;
                        h_acc *= 2.0;
                        if h_carry {
                            h_acc += 1.0;
                        }
                    }
                    _ => {}
                }
            }

            protein.length = codon_budget;

            let m = if m_count > 0 {
                m_acc / (f64::powi(2.0, m_count as i32) - 1.0)
            } else {
                0.5
            };
            let w = if w_count > 0 {
                w_acc / (f64::powi(2.0, w_count as i32) - 1.0)
            } else {
                0.0
            };
            let h = if h_count > 0 {
                h_acc / (f64::powi(2.0, h_count as i32) - 1.0)
            } else {
                0.5
            };

            protein.m = (X_MAX - X_MIN) * m + X_MIN;
            protein.w = (W_MAX - W_MIN) * w + W_MIN;
            protein.h = (H_MAX - H_MIN) * h + H_MIN;
            protein.is_functional = m_count > 0
                && w_count > 0
                && h_count > 0
                && protein.w != 0.0
                && protein.h != 0.0;
        }

        self.fold_duplicate_genes();
    }

    /// Keep one representative per gene start; siblings surrender their
    /// expression and drop out of the phenotype.
    fn fold_duplicate_genes(&mut self) {
        let mut representative: BTreeMap<usize, usize> = BTreeMap::new();
        for index in 0..self.proteins.len() {
            if !self.proteins[index].is_valid {
                continue;
            }
            match representative.entry(self.proteins[index].start) {
                Entry::Vacant(slot) => {
                    slot.insert(index);
                }
                Entry::Occupied(slot) => {
                    let keeper = *slot.get();
                    let extra = self.proteins[index].expression;
                    self.proteins[keeper].expression += extra;
                    self.proteins[index].is_valid = false;
                }
            }
        }
    }

    /// Sum the clipped triangle kernels of every contributing protein.
    fn compute_phenotype(&mut self) {
        let mut activation = [0.0f64; PHENOTYPE_SIZE];
        let mut inhibition = [0.0f64; PHENOTYPE_SIZE];

        for protein in &self.proteins {
            if !protein.is_valid
                || !protein.is_functional
                || protein.w.abs() < PROTEIN_EPSILON
                || protein.h.abs() < PROTEIN_EPSILON
            {
                continue;
            }
            let ix0 = phenotype_index(protein.m - protein.w);
            let ix1 = phenotype_index(protein.m);
            let ix2 = phenotype_index(protein.m + protein.w);
            let peak = protein.h * protein.expression;
            let lane = if protein.h > 0.0 {
                &mut activation
            } else {
                &mut inhibition
            };

            if ix1 > ix0 {
                let rise = peak / (ix1 - ix0) as f64;
                for (count, value) in lane[ix0 + 1..ix1].iter_mut().enumerate() {
                    *value += rise * (count + 1) as f64;
                }
            }
            lane[ix1] += peak;
            if ix2 > ix1 {
                let fall = peak / (ix2 - ix1) as f64;
                for (count, value) in lane[ix1 + 1..ix2].iter_mut().enumerate() {
                    *value += peak - fall * (count + 1) as f64;
                }
            }
        }

        for value in &mut activation {
            *value = value.min(1.0);
        }
        for value in &mut inhibition {
            *value = value.max(-1.0);
        }
        for (index, sample) in self.phenotype.iter_mut().enumerate() {
            *sample = (activation[index] + inhibition[index]).clamp(0.0, 1.0);
        }
    }

    /// Trapezoidal L1 distance to the target, exponentiated into fitness.
    fn compute_fitness(&mut self, target: &PhenotypicTarget) {
        let values = target.values();
        for (index, delta) in self.delta.iter_mut().enumerate() {
            *delta = self.phenotype[index] - values[index];
        }
        self.metaerror = (0..PHENOTYPE_SIZE - 1)
            .map(|i| (self.delta[i].abs() + self.delta[i + 1].abs()) / (2.0 * PHENOTYPE_SIZE as f64))
            .sum();
        self.fitness = (-SELECTION_PRESSURE * self.metaerror).exp();
    }
}

/// Quantize an abscissa in [0, 1] to a phenotype bucket, clamped to range.
fn phenotype_index(x: f64) -> usize {
    let raw = (x * PHENOTYPE_SIZE as f64) as i64;
    raw.clamp(0, PHENOTYPE_SIZE as i64 - 1) as usize
}

/// A single mutation event. Only point substitutions exist today; the
/// variant leaves room for insertions and deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationEvent {
    /// Toggle one bit.
    Switch { position: usize },
}

/// Per-cell mutation schedule for one generation.
#[derive(Debug, Clone, Default)]
pub struct Mutator {
    events: Vec<MutationEvent>,
}

impl Mutator {
    /// Draw a Poisson-distributed number of point mutations over a genome of
    /// `genome_length` bits.
    #[must_use]
    pub fn draw(rng: &mut RngStream, genome_length: usize, mutation_rate: f64) -> Self {
        let count = rng.poisson(mutation_rate * genome_length as f64);
        let mut events = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let position = rng.uniform_int(0, genome_length as u64 - 1) as usize;
            events.push(MutationEvent::Switch { position });
        }
        Self { events }
    }

    #[must_use]
    pub fn has_mutated(&self) -> bool {
        !self.events.is_empty()
    }

    /// Events in draw order.
    #[must_use]
    pub fn events(&self) -> &[MutationEvent] {
        &self.events
    }
}

/// Everything needed to resume a run, minus the derived caches (promoters
/// and downstream structures are rediscovered on load).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub generation: u64,
    pub grid_width: u32,
    pub grid_height: u32,
    pub backup_step: u32,
    pub mutation_rate: f64,
    pub seed: u64,
    pub target: Vec<f64>,
    pub genomes: Vec<Genome>,
}

/// Checkpoint sink invoked every `backup_step` generations.
pub trait Persistence: Send {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), PersistenceError>;
}

/// No-op checkpoint sink.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl Persistence for NullPersistence {
    fn save(&mut self, _checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Statistics sink invoked once per generation.
pub trait StatsSink: Send {
    fn write_best(&mut self, generation: u64, best: &Organism) -> Result<(), PersistenceError>;
    fn write_average(
        &mut self,
        generation: u64,
        population: &[Arc<Organism>],
    ) -> Result<(), PersistenceError>;
}

/// No-op statistics sink.
#[derive(Debug, Default)]
pub struct NullStats;

impl StatsSink for NullStats {
    fn write_best(&mut self, _generation: u64, _best: &Organism) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn write_average(
        &mut self,
        _generation: u64,
        _population: &[Arc<Organism>],
    ) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Summary emitted after each generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSummary {
    pub generation: u64,
    pub best_index: usize,
    pub best_fitness: f64,
    pub mean_fitness: f64,
    pub mutated_cells: usize,
    pub checkpointed: bool,
}

/// The toroidal grid of organisms and its generation step machinery.
pub struct World {
    config: WorldConfig,
    generation: u64,
    target: PhenotypicTarget,
    rng: RngPool,
    previous: Vec<Arc<Organism>>,
    next_parent: Vec<usize>,
    best_index: usize,
    persistence: Box<dyn Persistence>,
    stats: Box<dyn StatsSink>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("config", &self.config)
            .field("generation", &self.generation)
            .field("population", &self.previous.len())
            .field("best_index", &self.best_index)
            .finish()
    }
}

impl World {
    /// Instantiate a world with no-op sinks.
    pub fn new(config: WorldConfig) -> Result<Self, WorldError> {
        Self::with_sinks(config, Box::new(NullPersistence), Box::new(NullStats))
    }

    /// Instantiate a world: build the target, rejection-sample a founder
    /// that beats the empty phenotype, and clone it across the grid.
    pub fn with_sinks(
        config: WorldConfig,
        persistence: Box<dyn Persistence>,
        stats: Box<dyn StatsSink>,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        let target = PhenotypicTarget::from_gaussians();
        info!(
            geometric_area = target.geometric_area(),
            "initialized environmental target"
        );
        let rng = RngPool::new(config.grid_width, config.grid_height, config.seed);

        let mut founder_stream = rng.stream(0, StreamPurpose::Mutation, 0);
        let mut attempts = 0u64;
        let founder = loop {
            attempts += 1;
            let mut organism = Organism::random(config.init_length_dna, &mut founder_stream)?;
            organism.evaluate_full(&target);
            let gap =
                ((organism.metaerror() - target.geometric_area()) * 1e10).round() / 1e10;
            if gap < 0.0 {
                break organism;
            }
        };
        debug!(
            attempts,
            fitness = founder.fitness(),
            "founder organism accepted"
        );

        let population = config.population_size();
        let founder = Arc::new(founder);
        Ok(Self {
            previous: vec![founder; population],
            next_parent: vec![0; population],
            best_index: 0,
            generation: 0,
            target,
            rng,
            config,
            persistence,
            stats,
        })
    }

    /// Rebuild a world from a checkpoint. Promoters, terminators and every
    /// downstream cache are rediscovered from the persisted genomes.
    pub fn from_checkpoint(
        checkpoint: Checkpoint,
        persistence: Box<dyn Persistence>,
        stats: Box<dyn StatsSink>,
    ) -> Result<Self, WorldError> {
        let Checkpoint {
            generation,
            grid_width,
            grid_height,
            backup_step,
            mutation_rate,
            seed,
            target,
            genomes,
        } = checkpoint;

        let population = grid_width as usize * grid_height as usize;
        if genomes.len() != population {
            return Err(WorldError::InvalidCheckpoint(
                "population does not match the grid shape",
            ));
        }
        if genomes.iter().any(|genome| genome.len() < PROM_SIZE) {
            return Err(WorldError::DegenerateGenome);
        }
        let config = WorldConfig {
            grid_width,
            grid_height,
            seed,
            mutation_rate,
            init_length_dna: genomes.first().map_or(PROM_SIZE, Genome::len),
            backup_step,
        };
        config.validate()?;
        let target = PhenotypicTarget::from_values(target)?;
        info!(
            generation,
            geometric_area = target.geometric_area(),
            "restored environmental target"
        );

        let previous: Vec<Arc<Organism>> = genomes
            .into_par_iter()
            .map(|genome| {
                let mut organism = Organism::from_genome(genome);
                organism.evaluate_full(&target);
                Arc::new(organism)
            })
            .collect();

        let rng = RngPool::new(grid_width, grid_height, seed);
        let mut world = Self {
            previous,
            next_parent: vec![0; population],
            best_index: 0,
            generation,
            target,
            rng,
            config,
            persistence,
            stats,
        };
        world.best_index = world.find_best();
        Ok(world)
    }

    /// Immutable view of the configuration.
    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Completed generation count.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// The environmental target for this run.
    #[must_use]
    pub fn target(&self) -> &PhenotypicTarget {
        &self.target
    }

    /// Organisms of the last completed generation, in cell order.
    #[must_use]
    pub fn organisms(&self) -> &[Arc<Organism>] {
        &self.previous
    }

    /// Parent cell chosen for each cell in the last selection pass.
    #[must_use]
    pub fn next_parents(&self) -> &[usize] {
        &self.next_parent
    }

    /// The fittest organism of the last completed generation.
    #[must_use]
    pub fn best(&self) -> &Arc<Organism> {
        &self.previous[self.best_index]
    }

    #[must_use]
    pub const fn best_index(&self) -> usize {
        self.best_index
    }

    /// Number of organisms on the grid.
    #[must_use]
    pub fn population_size(&self) -> usize {
        self.previous.len()
    }

    /// Summary of the current population without advancing it.
    #[must_use]
    pub fn summary(&self) -> GenerationSummary {
        GenerationSummary {
            generation: self.generation,
            best_index: self.best_index,
            best_fitness: self.previous[self.best_index].fitness(),
            mean_fitness: self.mean_fitness(),
            mutated_cells: 0,
            checkpointed: false,
        }
    }

    /// Snapshot the world state for persistence.
    #[must_use]
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            generation: self.generation,
            grid_width: self.config.grid_width,
            grid_height: self.config.grid_height,
            backup_step: self.config.backup_step,
            mutation_rate: self.config.mutation_rate,
            seed: self.config.seed,
            target: self.target.values().to_vec(),
            genomes: self
                .previous
                .iter()
                .map(|organism| organism.dna().clone())
                .collect(),
        }
    }

    /// Advance one generation: selection, mutation draws, reproduction with
    /// copy-on-mutate, then statistics and the periodic checkpoint.
    ///
    /// Each pass is data-parallel over cells and acts as a barrier; results
    /// are identical to a sequential sweep because every cell draws from its
    /// own counter-based stream.
    pub fn step(&mut self) -> Result<GenerationSummary, WorldError> {
        let generation = self.generation + 1;
        let width = self.config.grid_width as usize;
        let height = self.config.grid_height as usize;
        let count = width * height;
        let rng = self.rng;
        let mutation_rate = self.config.mutation_rate;
        let previous = &self.previous;

        let parents: Vec<usize> = (0..count)
            .into_par_iter()
            .map(|cell| select_parent(previous, width, height, &rng, cell, generation))
            .collect();

        let mutations: Vec<Mutator> = {
            let parents = &parents;
            (0..count)
                .into_par_iter()
                .map(|cell| {
                    let mut stream = rng.stream(cell, StreamPurpose::Mutation, generation);
                    Mutator::draw(
                        &mut stream,
                        previous[parents[cell]].dna().len(),
                        mutation_rate,
                    )
                })
                .collect()
        };

        let target = &self.target;
        let current: Vec<Arc<Organism>> = {
            let parents = &parents;
            let mutations = &mutations;
            (0..count)
                .into_par_iter()
                .map(|cell| {
                    let parent = &previous[parents[cell]];
                    if mutations[cell].has_mutated() {
                        let mut child = Organism::child_of(parent);
                        child.apply_mutations(mutations[cell].events());
                        child.evaluate_incremental(target);
                        Arc::new(child)
                    } else {
                        Arc::clone(parent)
                    }
                })
                .collect()
        };

        let mutated_cells = mutations.iter().filter(|m| m.has_mutated()).count();
        self.next_parent = parents;
        self.previous = current;
        self.generation = generation;
        self.best_index = self.find_best();

        let best_fitness = self.previous[self.best_index].fitness();
        let mean_fitness = self.mean_fitness();

        self.stats
            .write_best(generation, &self.previous[self.best_index])?;
        self.stats.write_average(generation, &self.previous)?;

        let checkpointed = generation % u64::from(self.config.backup_step) == 0;
        if checkpointed {
            let snapshot = self.checkpoint();
            self.persistence.save(&snapshot)?;
            debug!(generation, "checkpoint saved");
        }

        Ok(GenerationSummary {
            generation,
            best_index: self.best_index,
            best_fitness,
            mean_fitness,
            mutated_cells,
            checkpointed,
        })
    }

    /// Run `generations` steps, logging each generation's best fitness.
    pub fn run(&mut self, generations: u64) -> Result<GenerationSummary, WorldError> {
        info!(
            from = self.generation,
            to = self.generation + generations,
            "running evolution"
        );
        let mut last = self.summary();
        for _ in 0..generations {
            last = self.step()?;
            info!(
                generation = last.generation,
                best_fitness = last.best_fitness,
                "generation complete"
            );
        }
        Ok(last)
    }

    /// First index holding the maximal fitness.
    fn find_best(&self) -> usize {
        let mut best = 0;
        let mut best_fitness = OrderedFloat(self.previous[0].fitness());
        for (index, organism) in self.previous.iter().enumerate().skip(1) {
            let fitness = OrderedFloat(organism.fitness());
            if fitness > best_fitness {
                best = index;
                best_fitness = fitness;
            }
        }
        best
    }

    fn mean_fitness(&self) -> f64 {
        self.previous.iter().map(|o| o.fitness()).sum::<f64>() / self.previous.len() as f64
    }
}

/// Fitness-proportional roulette over the 3x3 toroidal neighborhood of
/// `cell`, drawn on the cell's reproduction stream for `generation`.
fn select_parent(
    previous: &[Arc<Organism>],
    width: usize,
    height: usize,
    rng: &RngPool,
    cell: usize,
    generation: u64,
) -> usize {
    let x = cell / height;
    let y = cell % height;

    let mut fitnesses = [0.0f64; NEIGHBORHOOD_SIZE];
    let mut sum = 0.0;
    let mut slot = 0;
    for dx in 0..3 {
        for dy in 0..3 {
            let nx = (x + dx + width - 1) % width;
            let ny = (y + dy + height - 1) % height;
            let fitness = previous[nx * height + ny].fitness();
            fitnesses[slot] = fitness;
            sum += fitness;
            slot += 1;
        }
    }

    let mut probs = [0.0f64; NEIGHBORHOOD_SIZE];
    for (prob, fitness) in probs.iter_mut().zip(fitnesses) {
        *prob = fitness / sum;
    }

    let mut stream = rng.stream(cell, StreamPurpose::Reprod, generation);
    let winner = stream.roulette(&probs);
    let dx = winner / 3;
    let dy = winner % 3;
    ((x + dx + width - 1) % width) * height + ((y + dy + height - 1) % height)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genome_from_bits(bits: &str) -> Genome {
        let len = bits.len();
        let mut words = vec![0u64; len.div_ceil(64)];
        for (index, byte) in bits.bytes().enumerate() {
            assert!(byte == b'0' || byte == b'1');
            if byte == b'1' {
                words[index >> 6] |= 1 << (index & 63);
            }
        }
        Genome { words, len }
    }

    fn random_genome(length: usize, seed: u64) -> Genome {
        let pool = RngPool::new(1, 1, seed);
        let mut stream = pool.stream(0, StreamPurpose::Mutation, 0);
        Genome::random(length, &mut stream).expect("genome")
    }

    #[test]
    fn genome_bits_flip_and_wrap() {
        let mut genome = genome_from_bits("0000000000000000000000");
        assert_eq!(genome.len(), 22);
        assert!(!genome.bit(3));
        genome.flip(3);
        assert!(genome.bit(3));
        assert!(genome.bit(3 + 22), "queries wrap circularly");
        genome.flip(3 + 22);
        assert!(!genome.bit(3));
    }

    #[test]
    fn promoter_consensus_has_distance_zero() {
        let genome = genome_from_bits(PROM_SEQ);
        assert_eq!(genome.promoter_distance(0), 0);
        let mut noisy = genome.clone();
        noisy.flip(0);
        noisy.flip(5);
        assert_eq!(noisy.promoter_distance(0), 2);
    }

    #[test]
    fn promoter_detection_spans_the_origin() {
        // Consensus written across the wrap point: the last four bits sit at
        // the end of the genome, the remaining eighteen at the front.
        let len = 44;
        let start = len - 4;
        let mut bits = vec![b'0'; len];
        for (offset, byte) in PROM_SEQ.bytes().enumerate() {
            bits[(start + offset) % len] = byte;
        }
        let genome = genome_from_bits(std::str::from_utf8(&bits).unwrap());
        assert_eq!(genome.promoter_distance(start), 0);

        let mut organism = Organism::from_genome(genome);
        organism.locate_promoters_and_terminators();
        assert_eq!(organism.promoters().get(&start), Some(&0));
    }

    #[test]
    fn terminator_requires_a_full_complementary_stem() {
        //            0123456789a
        let genome = genome_from_bits("1111000000000000000000");
        assert_eq!(genome.terminator_distance(0), 4);
        let mut broken = genome.clone();
        broken.flip(10);
        assert_eq!(broken.terminator_distance(0), 3);
    }

    #[test]
    fn codon_reads_high_bit_first() {
        let genome = genome_from_bits("1010010000000000000000");
        assert_eq!(genome.codon_at(0), 0b101);
        assert_eq!(genome.codon_at(2), 0b100);
        assert!(genome.protein_stop(3));
        assert!(!genome.protein_stop(0));
    }

    #[test]
    fn shine_dal_needs_site_and_start_codon() {
        //                            011011....000
        let genome = genome_from_bits("0110111111000000000000");
        assert!(genome.shine_dal_start(0));
        let mut broken = genome.clone();
        broken.flip(11);
        assert!(!broken.shine_dal_start(0));
        let mut shifted = genome.clone();
        shifted.flip(1);
        assert!(!shifted.shine_dal_start(0));
    }

    #[test]
    fn target_matches_the_gaussian_sum() {
        let target = PhenotypicTarget::from_gaussians();
        assert_eq!(target.values().len(), PHENOTYPE_SIZE);

        let expected = |x: f64| -> f64 {
            let g1 = 1.2 * (-(x - 0.52) * (x - 0.52) / (2.0 * 0.12 * 0.12)).exp();
            let g2 = -1.4 * (-(x - 0.5) * (x - 0.5) / (2.0 * 0.07 * 0.07)).exp();
            let g3 = 0.3 * (-(x - 0.8) * (x - 0.8) / (2.0 * 0.03 * 0.03)).exp();
            (g1 + g2 + g3).clamp(Y_MIN, Y_MAX)
        };

        // The narrow inhibitory Gaussian dominates the curve's midpoint.
        assert_eq!(target.values()[150], 0.0);
        assert_eq!(target.values()[150], expected(0.5));
        let x = 195.0 / PHENOTYPE_SIZE as f64;
        assert!((target.values()[195] - expected(x)).abs() < 1e-12);
        assert!(target.values()[195] > 0.0);
        assert!(target.geometric_area() > 0.0);
    }

    /// A genome carrying exactly one transcription unit with one gene whose
    /// codons are [M1, W1, H1]: consensus promoter at 0, binding site at 22,
    /// coding region at 35, stop codon at 44, terminator hairpin at 50.
    fn single_gene_genome() -> Genome {
        let bits = [
            PROM_SEQ, // 0..22
            "011011", // 22..28 ribosome binding site
            "0000",   // 28..32 spacer
            "000",    // 32..35 start codon
            "101",    // 35..38 M1
            "011",    // 38..41 W1
            "111",    // 41..44 H1
            "001",    // 44..47 stop
            "100",    // 47..50
            "1111",   // 50..54 hairpin stem
            "000",    // 54..57 hairpin loop
            "0000",   // 57..61 complementary stem
            "000",    // 61..64
        ]
        .concat();
        genome_from_bits(&bits)
    }

    #[test]
    fn single_gene_decodes_to_extreme_triangle() {
        let target = PhenotypicTarget::from_gaussians();
        let mut organism = Organism::from_genome(single_gene_genome());
        organism.promoters.insert(0, 0);
        organism.evaluate_incremental(&target);

        assert_eq!(organism.rnas().len(), 1);
        let rna = &organism.rnas()[0];
        assert_eq!(rna.begin, 0);
        assert_eq!(rna.end, 60);
        assert_eq!(rna.length, 39);
        assert_eq!(rna.expression, 1.0);
        assert!(rna.is_coding);
        assert_eq!(rna.gene_starts, vec![22]);
        assert!(organism.terminators().contains(&50));

        assert_eq!(organism.proteins().len(), 1);
        let protein = &organism.proteins()[0];
        assert_eq!(protein.start, 22);
        assert_eq!(protein.end, 46);
        assert_eq!(protein.length, 3, "three codons decoded");
        assert!(protein.is_valid);
        assert!(protein.is_functional);
        assert_eq!(protein.m, X_MAX);
        assert_eq!(protein.w, W_MAX);
        assert_eq!(protein.h, H_MAX);
        assert_eq!(protein.expression, 1.0);

        // The triangle peaks at the right edge of the sampled interval.
        assert_eq!(organism.phenotype()[299], 1.0);
        assert!(organism.fitness() > 0.0 && organism.fitness() <= 1.0);
    }

    #[test]
    fn duplicate_genes_fold_into_one_representative() {
        let mut organism = Organism::from_genome(single_gene_genome());
        let template = Protein {
            start: 22,
            end: 46,
            length: 3,
            expression: 0.8,
            m: 0.5,
            w: 0.01,
            h: 1.0,
            is_functional: true,
            is_valid: true,
        };
        organism.proteins.push(template.clone());
        organism.proteins.push(Protein {
            expression: 0.6,
            ..template.clone()
        });
        organism.proteins.push(Protein {
            start: 30,
            ..template
        });
        organism.fold_duplicate_genes();

        assert!(organism.proteins[0].is_valid);
        assert!((organism.proteins[0].expression - 1.4).abs() < 1e-12);
        assert!(!organism.proteins[1].is_valid);
        assert!(organism.proteins[2].is_valid, "distinct start kept");
    }

    #[test]
    fn full_and_incremental_evaluations_agree_after_mutation() {
        let target = PhenotypicTarget::from_gaussians();
        for seed in [1u64, 7, 23, 91] {
            let mut parent = Organism::from_genome(random_genome(1_000, seed));
            parent.evaluate_full(&target);

            let events = [
                MutationEvent::Switch { position: 3 },
                MutationEvent::Switch { position: 421 },
                MutationEvent::Switch { position: 999 },
            ];
            let mut child = Organism::child_of(&parent);
            child.apply_mutations(&events);
            child.evaluate_incremental(&target);

            let mut rescanned = Organism::from_genome(child.dna().clone());
            rescanned.evaluate_full(&target);

            assert_eq!(child.promoters(), rescanned.promoters());
            assert_eq!(child.rnas(), rescanned.rnas());
            assert_eq!(child.proteins(), rescanned.proteins());
            assert_eq!(child.phenotype(), rescanned.phenotype());
            assert_eq!(child.fitness(), rescanned.fitness());

            // Every transcription unit stays anchored to recorded structures.
            for rna in child.rnas() {
                assert!(child.promoters().contains_key(&rna.begin));
                let len = child.dna().len();
                assert!(
                    child
                        .terminators()
                        .iter()
                        .any(|&t| (t + TERM_SIZE - 1) % len == rna.end)
                );
            }
        }
    }

    #[test]
    fn random_organisms_respect_numeric_invariants() {
        let target = PhenotypicTarget::from_gaussians();
        for seed in 0..8u64 {
            let mut organism = Organism::from_genome(random_genome(600, seed));
            organism.evaluate_full(&target);

            for &sample in organism.phenotype() {
                assert!((0.0..=1.0).contains(&sample));
            }
            assert!((0.0..=1.0).contains(&organism.metaerror()));
            assert!(organism.fitness() > 0.0 && organism.fitness() <= 1.0);
            for protein in organism.proteins().iter().filter(|p| p.is_valid) {
                assert!((X_MIN..=X_MAX).contains(&protein.m));
                assert!((W_MIN..=W_MAX).contains(&protein.w));
                assert!((H_MIN..=H_MAX).contains(&protein.h));
            }
        }
    }

    #[test]
    fn config_validation_rejects_bad_inputs() {
        let valid = WorldConfig {
            grid_width: 4,
            grid_height: 4,
            init_length_dna: 100,
            ..WorldConfig::default()
        };
        assert!(valid.validate().is_ok());

        let mut config = valid.clone();
        config.grid_width = 0;
        assert!(matches!(
            config.validate(),
            Err(WorldError::InvalidConfig(_))
        ));

        let mut config = valid.clone();
        config.mutation_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = valid.clone();
        config.init_length_dna = PROM_SIZE - 1;
        assert!(config.validate().is_err());

        let mut config = valid;
        config.backup_step = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn neutral_single_cell_world_keeps_its_founder() {
        let config = WorldConfig {
            grid_width: 1,
            grid_height: 1,
            seed: 1,
            mutation_rate: 0.0,
            init_length_dna: 100,
            backup_step: 100,
        };
        let mut world = World::new(config).expect("world");
        let founder = Arc::clone(&world.organisms()[0]);
        let fitness = founder.fitness();

        for _ in 0..10 {
            let summary = world.step().expect("step");
            assert_eq!(summary.mutated_cells, 0);
            assert_eq!(summary.best_fitness, fitness);
        }
        assert!(Arc::ptr_eq(world.best(), &founder));
        assert_eq!(world.generation(), 10);
        assert_eq!(world.next_parents(), &[0]);
    }

    #[test]
    fn step_summary_reports_the_population_maximum() {
        let config = WorldConfig {
            grid_width: 3,
            grid_height: 3,
            seed: 9,
            mutation_rate: 1e-3,
            init_length_dna: 300,
            backup_step: 100,
        };
        let mut world = World::new(config).expect("world");
        let summary = world.step().expect("step");
        assert_eq!(summary.generation, 1);
        assert!(!summary.checkpointed);

        let max = world
            .organisms()
            .iter()
            .map(|o| o.fitness())
            .fold(f64::MIN, f64::max);
        assert_eq!(summary.best_fitness, max);
        assert_eq!(world.best().fitness(), max);
        for &parent in world.next_parents() {
            assert!(parent < world.population_size());
        }
    }

    #[test]
    fn checkpoint_restores_an_identical_population() {
        let config = WorldConfig {
            grid_width: 4,
            grid_height: 3,
            seed: 77,
            mutation_rate: 1e-3,
            init_length_dna: 300,
            backup_step: 100,
        };
        let mut world = World::new(config).expect("world");
        for _ in 0..4 {
            world.step().expect("step");
        }

        let snapshot = world.checkpoint();
        let mut restored =
            World::from_checkpoint(snapshot, Box::new(NullPersistence), Box::new(NullStats))
                .expect("restored world");

        assert_eq!(restored.generation(), world.generation());
        let original: Vec<f64> = world.organisms().iter().map(|o| o.fitness()).collect();
        let reloaded: Vec<f64> = restored.organisms().iter().map(|o| o.fitness()).collect();
        assert_eq!(original, reloaded);

        // Resumed evolution replays the exact uninterrupted trajectory.
        for _ in 0..3 {
            let a = world.step().expect("step");
            let b = restored.step().expect("step");
            assert_eq!(a, b);
        }
    }

    #[test]
    fn checkpoint_with_wrong_population_is_rejected() {
        let config = WorldConfig {
            grid_width: 2,
            grid_height: 2,
            seed: 5,
            mutation_rate: 0.0,
            init_length_dna: 100,
            backup_step: 10,
        };
        let world = World::new(config).expect("world");
        let mut snapshot = world.checkpoint();
        snapshot.genomes.pop();
        let result =
            World::from_checkpoint(snapshot, Box::new(NullPersistence), Box::new(NullStats));
        assert!(matches!(result, Err(WorldError::InvalidCheckpoint(_))));
    }
}

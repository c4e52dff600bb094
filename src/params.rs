//! Parameter document parsing.
//!
//! The document is JSON. Every field has a default, so `{}` is a valid
//! document; a production run typically pins at least the chunk geometry and
//! the trained repeat-count substitution matrix.

use crate::error::{PolishError, Result};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Params {
    /// Work in run-length space; homopolymer lengths are re-estimated with
    /// the substitution matrix.
    pub use_run_length_encoding: bool,
    /// Downsampling target depth. 0 disables downsampling.
    pub max_depth: u64,
    /// Inner window length of a chunk.
    pub chunk_size: usize,
    /// Overlap padding added on both sides of a chunk's inner window.
    pub chunk_boundary: usize,
    /// Shuffle the dispatch order of chunks to even out stragglers. Must not
    /// affect any output.
    pub shuffle_chunks: bool,
    /// Trim each read's alignment so its first and last operation within the
    /// chunk window is a match.
    pub require_match_boundaries: bool,
    /// In bubble extraction, take allele strings from read substrings
    /// traversing the bubble rather than synthesising them from node weights.
    pub use_read_alleles: bool,
    /// Same switch, applied when the bubble graph is built for phasing.
    pub use_read_alleles_in_phasing: bool,
    pub poa: PoaParams,
    pub phaser: PhaserParams,
    /// Trained `P(observedRun | trueRun, base)` table. Absent means a
    /// synthetic geometric-decay matrix is used.
    pub repeat_count_matrix: Option<RepeatMatrixSpec>,
}

impl Default for Params {
    fn default() -> Self {
        Params {
            use_run_length_encoding: true,
            max_depth: 64,
            chunk_size: 100_000,
            chunk_boundary: 1_000,
            shuffle_chunks: false,
            require_match_boundaries: true,
            use_read_alleles: false,
            use_read_alleles_in_phasing: true,
            poa: PoaParams::default(),
            phaser: PhaserParams::default(),
            repeat_count_matrix: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct PoaParams {
    pub match_score: i32,
    /// Negative score applied to aligned mismatching bases.
    pub mismatch_score: i32,
    /// Negative score applied per inserted/deleted run.
    pub gap_score: i32,
    /// Half-width of the realignment DP band, in runs.
    pub band_width: usize,
    /// Cap on consensus/realign iterations. The loop also stops early when
    /// the consensus reaches a fixed point.
    pub max_realign_iterations: usize,
    /// Total observation weight an insertion string must accumulate before
    /// it is promoted to graph nodes.
    pub min_insert_weight: f64,
    /// Fraction of a node's total weight a minority signal must reach for
    /// the node to open a bubble.
    pub candidate_variant_weight: f64,
    /// Minimum summed read weight for an allele to be retained.
    pub min_allele_support: f64,
}

impl Default for PoaParams {
    fn default() -> Self {
        PoaParams {
            match_score: 2,
            mismatch_score: -4,
            gap_score: -4,
            band_width: 64,
            max_realign_iterations: 3,
            min_insert_weight: 3.0,
            candidate_variant_weight: 0.2,
            min_allele_support: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct PhaserParams {
    /// Prior probability that a bubble is heterozygous.
    pub het_prior: f64,
    /// Per-allele read error rate in the observation model.
    pub read_error_rate: f64,
    /// Cap on EM iterations.
    pub max_iterations: usize,
    /// Iterations of the k-means style initial clustering.
    pub kmeans_iterations: usize,
    /// Minimum |log-likelihood(h1) - log-likelihood(h2)| for a read to be
    /// assigned; below this the read is unphased and feeds both haplotypes.
    pub min_phase_confidence: f64,
}

impl Default for PhaserParams {
    fn default() -> Self {
        PhaserParams {
            het_prior: 1e-3,
            read_error_rate: 0.05,
            max_iterations: 16,
            kmeans_iterations: 8,
            min_phase_confidence: 2.0,
        }
    }
}

/// On-disk form of the repeat-count substitution matrix: per base, a
/// `(maxRunLength + 1) x (maxRunLength + 1)` table of log probabilities
/// indexed `[trueRun][observedRun]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatMatrixSpec {
    pub max_run_length: usize,
    pub log_probabilities: FxHashMap<String, Vec<Vec<f64>>>,
}

impl Params {
    pub fn from_file(path: &str) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            PolishError::InputUnavailable(format!("could not read parameter file {}: {}", path, e))
        })?;
        let params: Params = serde_json::from_reader(BufReader::new(file))?;
        Ok(params)
    }

    /// Startup consistency checks; fatal before any chunk is dispatched.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(PolishError::ParameterInconsistent(
                "chunkSize must be positive".to_string(),
            ));
        }
        if self.chunk_boundary >= self.chunk_size {
            return Err(PolishError::ParameterInconsistent(format!(
                "chunkBoundary ({}) must be smaller than chunkSize ({})",
                self.chunk_boundary, self.chunk_size
            )));
        }
        if self.poa.max_realign_iterations == 0 {
            return Err(PolishError::ParameterInconsistent(
                "poa.maxRealignIterations must be at least 1".to_string(),
            ));
        }
        if !(0.0..0.5).contains(&self.phaser.read_error_rate) || self.phaser.read_error_rate <= 0.0
        {
            return Err(PolishError::ParameterInconsistent(format!(
                "phaser.readErrorRate ({}) must be in (0, 0.5)",
                self.phaser.read_error_rate
            )));
        }
        if self.phaser.het_prior <= 0.0 || self.phaser.het_prior >= 1.0 {
            return Err(PolishError::ParameterInconsistent(format!(
                "phaser.hetPrior ({}) must be in (0, 1)",
                self.phaser.het_prior
            )));
        }
        if let Some(spec) = &self.repeat_count_matrix {
            if spec.max_run_length == 0 {
                return Err(PolishError::ParameterInconsistent(
                    "repeatCountMatrix.maxRunLength must be positive".to_string(),
                ));
            }
            for (base, table) in &spec.log_probabilities {
                let expected = spec.max_run_length + 1;
                if table.len() != expected || table.iter().any(|row| row.len() != expected) {
                    return Err(PolishError::ParameterInconsistent(format!(
                        "repeatCountMatrix table for base {} is not {} x {}",
                        base, expected, expected
                    )));
                }
            }
        }
        Ok(())
    }
}

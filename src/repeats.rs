//! Bayesian re-estimation of homopolymer run lengths.
//!
//! Each consensus position carries a histogram of observed run lengths from
//! the reads. The substitution matrix gives `P(observed | true, base)`; the
//! re-estimated length is the maximum-posterior true length under a uniform
//! prior. The matrix is loaded once from the parameter document and shared
//! read-only across workers; absent a trained table, a synthetic
//! geometric-decay pseudo-likelihood is used.

use crate::error::{PolishError, Result};
use crate::params::{Params, RepeatMatrixSpec};
use crate::poa::{Consensus, Poa};
use crate::rle::base_index;
use rustc_hash::FxHashSet;

/// Synthetic matrix decay per unit of |observed - true|, in log space.
const SYNTHETIC_DECAY: f64 = 2.0;
const SYNTHETIC_MAX_RUN_LENGTH: usize = 50;

pub struct RepeatSubMatrix {
    max_run_length: usize,
    /// Per base, `[true * (max + 1) + observed]` log probabilities.
    log_probs: [Vec<f64>; 4],
}

impl RepeatSubMatrix {
    pub fn from_params(params: &Params) -> Result<Self> {
        match &params.repeat_count_matrix {
            Some(spec) => Self::from_spec(spec),
            None => Ok(Self::synthetic(SYNTHETIC_MAX_RUN_LENGTH)),
        }
    }

    pub fn from_spec(spec: &RepeatMatrixSpec) -> Result<Self> {
        let side = spec.max_run_length + 1;
        // Bases absent from the document keep the synthetic fallback.
        let mut log_probs = Self::synthetic(spec.max_run_length).log_probs;
        for (base, table) in &spec.log_probabilities {
            let b = base
                .bytes()
                .next()
                .and_then(|b| base_index(b.to_ascii_uppercase()))
                .ok_or_else(|| {
                    PolishError::ParameterInconsistent(format!(
                        "repeatCountMatrix base {} is not one of A/C/G/T",
                        base
                    ))
                })?;
            for (true_len, row) in table.iter().enumerate() {
                for (observed, &p) in row.iter().enumerate() {
                    log_probs[b][true_len * side + observed] = p;
                }
            }
        }
        Ok(RepeatSubMatrix {
            max_run_length: spec.max_run_length,
            log_probs,
        })
    }

    /// Symmetric pseudo-likelihood concentrated on the diagonal: an observed
    /// run of length j supports true length i with log weight
    /// `-SYNTHETIC_DECAY * |i - j|`.
    pub fn synthetic(max_run_length: usize) -> Self {
        let side = max_run_length + 1;
        let table: Vec<f64> = (0..side * side)
            .map(|idx| {
                let true_len = (idx / side) as f64;
                let observed = (idx % side) as f64;
                -SYNTHETIC_DECAY * (true_len - observed).abs()
            })
            .collect();
        RepeatSubMatrix {
            max_run_length,
            log_probs: [table.clone(), table.clone(), table.clone(), table],
        }
    }

    pub fn max_run_length(&self) -> usize {
        self.max_run_length
    }

    pub fn log_prob(&self, base: u8, true_len: u32, observed: u32) -> f64 {
        let b = match base_index(base) {
            Some(b) => b,
            None => return 0.0,
        };
        let side = self.max_run_length + 1;
        let t = (true_len as usize).min(self.max_run_length);
        let o = (observed as usize).min(self.max_run_length);
        self.log_probs[b][t * side + o]
    }
}

/// Maximum-posterior true run length for one observation histogram.
/// Ties resolve to the smaller length, keeping re-estimation deterministic.
pub fn most_likely_run_length(
    matrix: &RepeatSubMatrix,
    base: u8,
    histogram: &[(u32, f64)],
) -> Option<u32> {
    if histogram.is_empty() || base_index(base).is_none() {
        return None;
    }
    let mut best_len = 0u32;
    let mut best_score = f64::NEG_INFINITY;
    for true_len in 1..=matrix.max_run_length() as u32 {
        let score: f64 = histogram
            .iter()
            .map(|&(observed, weight)| weight * matrix.log_prob(base, true_len, observed))
            .sum();
        if score > best_score {
            best_score = score;
            best_len = true_len;
        }
    }
    Some(best_len)
}

/// Re-estimate every run length of a consensus in place. Observations from
/// reads in `exclude` are ignored; in diploid mode each haplotype's
/// consensus passes the other haplotype's read set here, so unphased reads
/// contribute to both.
pub fn estimate_repeat_counts(
    poa: &Poa,
    consensus: &mut Consensus,
    matrix: &RepeatSubMatrix,
    exclude: Option<&FxHashSet<u32>>,
) {
    for run in 0..consensus.rle.len() {
        let node = &poa.nodes[consensus.nodes[run] as usize];
        let base = consensus.rle.base(run);
        let mut histogram: Vec<(u32, f64)> = Vec::new();
        for obs in &node.observations {
            if obs.base != base {
                continue;
            }
            if exclude.is_some_and(|set| set.contains(&obs.read)) {
                continue;
            }
            match histogram.iter_mut().find(|(l, _)| *l == obs.run_length) {
                Some((_, w)) => *w += obs.weight,
                None => histogram.push((obs.run_length, obs.weight)),
            }
        }
        if let Some(len) = most_likely_run_length(matrix, base, &histogram) {
            consensus.rle.set_run_length(run, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::PoaParams;
    use crate::poa::{run_poa, Poa};
    use crate::reads::{AlignedPair, ChunkRead, ReadAlignment};
    use crate::rle::RleString;

    #[test]
    fn test_unanimous_observations() {
        let matrix = RepeatSubMatrix::synthetic(50);
        let hist = vec![(5u32, 10.0)];
        assert_eq!(most_likely_run_length(&matrix, b'A', &hist), Some(5));
    }

    #[test]
    fn test_symmetric_split_ties_to_smaller() {
        // Half the reads saw 5, half saw 6; the symmetric synthetic matrix
        // scores both equally and the smaller length wins.
        let matrix = RepeatSubMatrix::synthetic(50);
        let hist = vec![(5u32, 5.0), (6u32, 5.0)];
        assert_eq!(most_likely_run_length(&matrix, b'A', &hist), Some(5));
    }

    #[test]
    fn test_majority_pulls_estimate() {
        let matrix = RepeatSubMatrix::synthetic(50);
        let hist = vec![(5u32, 2.0), (6u32, 8.0)];
        assert_eq!(most_likely_run_length(&matrix, b'A', &hist), Some(6));
    }

    #[test]
    fn test_argmax_maximises_posterior() {
        // The returned length scores at least as well as every alternative.
        let matrix = RepeatSubMatrix::synthetic(20);
        let hist = vec![(3u32, 4.0), (4u32, 3.0), (7u32, 1.0)];
        let best = most_likely_run_length(&matrix, b'C', &hist).unwrap();
        let score = |t: u32| -> f64 {
            hist.iter()
                .map(|&(o, w)| w * matrix.log_prob(b'C', t, o))
                .sum()
        };
        for t in 1..=20 {
            assert!(score(best) >= score(t));
        }
    }

    #[test]
    fn test_trained_matrix_lookup() {
        let mut log_probabilities = rustc_hash::FxHashMap::default();
        // maxRunLength 2: 3x3 table. Biased so observed 1 favours true 2.
        log_probabilities.insert(
            "A".to_string(),
            vec![
                vec![0.0, -10.0, -10.0],
                vec![-10.0, -5.0, -1.0],
                vec![-10.0, -1.0, -5.0],
            ],
        );
        let spec = RepeatMatrixSpec {
            max_run_length: 2,
            log_probabilities,
        };
        let matrix = RepeatSubMatrix::from_spec(&spec).unwrap();
        assert_eq!(matrix.log_prob(b'A', 2, 1), -1.0);
        let hist = vec![(1u32, 1.0)];
        assert_eq!(most_likely_run_length(&matrix, b'A', &hist), Some(2));
    }

    #[test]
    fn test_estimate_updates_consensus() {
        // Reference AAAAA; half the reads agree, half saw six As. The node
        // histogram drives the re-estimate; with the symmetric matrix the
        // tie resolves to 5 and the output is stable across runs.
        let reference = RleString::compress(b"AAAAA");
        let reads: Vec<ChunkRead> = (0..10)
            .map(|i| ChunkRead {
                name: format!("r{}", i),
                rle: RleString::compress(if i < 5 { b"AAAAA" } else { b"AAAAAA" }),
                forward: true,
                soft_clip_start: 0,
                soft_clip_end: 0,
            })
            .collect();
        let alignments: Vec<ReadAlignment> = (0..10)
            .map(|_| {
                vec![AlignedPair {
                    read_offset: 0,
                    ref_offset: 0,
                    weight: 1.0,
                }]
            })
            .collect();
        let params = PoaParams::default();
        let run = || {
            let (poa, _) = run_poa(&reads, &alignments, &reference, true, &params);
            let mut consensus = poa.consensus();
            let matrix = RepeatSubMatrix::synthetic(50);
            estimate_repeat_counts(&poa, &mut consensus, &matrix, None);
            consensus.rle.expand()
        };
        let first = run();
        assert_eq!(first, b"AAAAA".to_vec());
        assert_eq!(first, run());
    }

    #[test]
    fn test_exclusion_filters_observations() {
        let reference = RleString::compress(b"AAAAA");
        let reads: Vec<ChunkRead> = (0..4)
            .map(|i| ChunkRead {
                name: format!("r{}", i),
                rle: RleString::compress(if i < 2 { b"AAAAA" } else { b"AAAAAAAA" }),
                forward: true,
                soft_clip_start: 0,
                soft_clip_end: 0,
            })
            .collect();
        let alignments: Vec<ReadAlignment> = (0..4)
            .map(|_| {
                vec![AlignedPair {
                    read_offset: 0,
                    ref_offset: 0,
                    weight: 1.0,
                }]
            })
            .collect();
        let poa = Poa::build(&reference, true, &reads, &alignments, &PoaParams::default());
        let matrix = RepeatSubMatrix::synthetic(50);

        // Excluding the long-run reads leaves a unanimous histogram of 5.
        let mut consensus = poa.consensus();
        let exclude: FxHashSet<u32> = [2u32, 3u32].into_iter().collect();
        estimate_repeat_counts(&poa, &mut consensus, &matrix, Some(&exclude));
        assert_eq!(consensus.rle.expand(), b"AAAAA".to_vec());

        // Excluding the short-run reads instead moves the estimate to 8.
        let mut consensus = poa.consensus();
        let exclude: FxHashSet<u32> = [0u32, 1u32].into_iter().collect();
        estimate_repeat_counts(&poa, &mut consensus, &matrix, Some(&exclude));
        assert_eq!(consensus.rle.expand(), b"AAAAAAAA".to_vec());
    }
}

//! Diploid phasing over a bubble graph.
//!
//! Reads are assigned to two haplotypes and each bubble receives an allele
//! pair, jointly maximising the phased read likelihood under a simple
//! per-allele error model. The search alternates EM-style between fixing
//! read assignments (choosing per-bubble genotypes) and fixing genotypes
//! (reassigning reads), seeded by a k-means style clustering of per-read
//! allele-vote vectors. Reads whose haplotype log-likelihood margin falls
//! below the confidence threshold are left unphased and feed both
//! downstream haplotype graphs.

use crate::bubble::BubbleGraph;
use crate::params::PhaserParams;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaplotypeAssignment {
    Hap1,
    Hap2,
    Unphased,
}

/// Chosen allele index per bubble for each haplotype.
#[derive(Debug, Clone)]
pub struct GenomeFragment {
    pub hap1: Vec<usize>,
    pub hap2: Vec<usize>,
    /// Index of the first phased bubble within the graph's bubble sequence.
    pub ref_start: usize,
    pub length: usize,
}

struct PhaseProblem {
    /// Per bubble: read -> observed allele index.
    observations: Vec<FxHashMap<u32, usize>>,
    /// Per read: (bubble, allele) sightings, bubble-ordered.
    by_read: Vec<Vec<(usize, usize)>>,
    allele_counts: Vec<usize>,
}

impl PhaseProblem {
    fn new(graph: &BubbleGraph, read_count: usize) -> Self {
        let mut observations = Vec::with_capacity(graph.bubbles.len());
        let mut by_read: Vec<Vec<(usize, usize)>> = vec![Vec::new(); read_count];
        let mut allele_counts = Vec::with_capacity(graph.bubbles.len());
        for (b, bubble) in graph.bubbles.iter().enumerate() {
            let mut map = FxHashMap::default();
            for (a, allele) in bubble.alleles.iter().enumerate() {
                for &read in &allele.reads {
                    map.insert(read, a);
                    if (read as usize) < read_count {
                        by_read[read as usize].push((b, a));
                    }
                }
            }
            observations.push(map);
            allele_counts.push(bubble.alleles.len());
        }
        PhaseProblem {
            observations,
            by_read,
            allele_counts,
        }
    }

    /// log P(observed allele | true allele) for one bubble.
    fn obs_ll(&self, bubble: usize, observed: usize, truth: usize, error_rate: f64) -> f64 {
        if observed == truth {
            (1.0 - error_rate).ln()
        } else {
            (error_rate / (self.allele_counts[bubble] - 1).max(1) as f64).ln()
        }
    }

    fn read_ll(&self, read: usize, genotype: &[(usize, usize)], hap1: bool, error_rate: f64) -> f64 {
        self.by_read[read]
            .iter()
            .map(|&(b, o)| {
                let truth = if hap1 { genotype[b].0 } else { genotype[b].1 };
                self.obs_ll(b, o, truth, error_rate)
            })
            .sum()
    }
}

/// Fraction of shared bubbles where two reads voted differently.
fn vote_distance(a: &[(usize, usize)], b: &[(usize, usize)]) -> f64 {
    let mut shared = 0usize;
    let mut differ = 0usize;
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                shared += 1;
                if a[i].1 != b[j].1 {
                    differ += 1;
                }
                i += 1;
                j += 1;
            }
        }
    }
    if shared == 0 {
        0.5
    } else {
        differ as f64 / shared as f64
    }
}

/// Initial 2-clustering of reads by their allele-vote vectors. Seeds are the
/// read with the most observations and the read farthest from it, making the
/// initialisation deterministic.
fn kmeans_init(problem: &PhaseProblem, candidates: &[usize], iterations: usize) -> Vec<u8> {
    let seed1 = *candidates
        .iter()
        .max_by_key(|&&r| problem.by_read[r].len())
        .unwrap();
    let seed2 = *candidates
        .iter()
        .max_by(|&&a, &&b| {
            vote_distance(&problem.by_read[seed1], &problem.by_read[a])
                .partial_cmp(&vote_distance(&problem.by_read[seed1], &problem.by_read[b]))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.cmp(&a))
        })
        .unwrap();

    let mut assignment: FxHashMap<usize, u8> = FxHashMap::default();
    for &r in candidates {
        let d1 = vote_distance(&problem.by_read[r], &problem.by_read[seed1]);
        let d2 = vote_distance(&problem.by_read[r], &problem.by_read[seed2]);
        assignment.insert(r, if d2 < d1 { 2 } else { 1 });
    }

    for _ in 0..iterations {
        // Centroid: majority allele per bubble per cluster.
        let mut votes: Vec<[FxHashMap<usize, usize>; 2]> = (0..problem.observations.len())
            .map(|_| [FxHashMap::default(), FxHashMap::default()])
            .collect();
        for &r in candidates {
            let cluster = (assignment[&r] - 1) as usize;
            for &(b, a) in &problem.by_read[r] {
                *votes[b][cluster].entry(a).or_insert(0) += 1;
            }
        }
        let centroid = |cluster: usize| -> Vec<Option<usize>> {
            votes
                .iter()
                .map(|v| {
                    v[cluster]
                        .iter()
                        .max_by_key(|&(&a, &count)| (count, std::cmp::Reverse(a)))
                        .map(|(&a, _)| a)
                })
                .collect()
        };
        let c1 = centroid(0);
        let c2 = centroid(1);

        let mut changed = false;
        for &r in candidates {
            let mut agree1 = 0i64;
            let mut agree2 = 0i64;
            for &(b, a) in &problem.by_read[r] {
                if c1[b] == Some(a) {
                    agree1 += 1;
                }
                if c2[b] == Some(a) {
                    agree2 += 1;
                }
            }
            let new = if agree2 > agree1 { 2 } else if agree1 > agree2 { 1 } else { assignment[&r] };
            if assignment[&r] != new {
                assignment.insert(r, new);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut out = vec![0u8; problem.by_read.len()];
    for (&r, &c) in &assignment {
        out[r] = c;
    }
    out
}

/// Choose the best ordered allele pair for one bubble given the current read
/// assignment. Score ties prefer `a <= b` lexicographically by allele
/// string, then a pair containing the reference allele.
fn best_genotype(
    graph: &BubbleGraph,
    problem: &PhaseProblem,
    bubble: usize,
    assignment: &[u8],
    params: &PhaserParams,
) -> (usize, usize) {
    let alleles = &graph.bubbles[bubble].alleles;
    let het_prior_ln = params.het_prior.ln();
    let hom_prior_ln = (1.0 - params.het_prior).ln();

    let mut best: Option<(f64, usize, usize)> = None;
    for a1 in 0..alleles.len() {
        for a2 in 0..alleles.len() {
            let mut score = if a1 == a2 { hom_prior_ln } else { het_prior_ln };
            for (&read, &observed) in &problem.observations[bubble] {
                let truth = match assignment[read as usize] {
                    1 => a1,
                    2 => a2,
                    _ => continue,
                };
                score += problem.obs_ll(bubble, observed, truth, params.read_error_rate);
            }
            let candidate_better = match &best {
                None => true,
                Some((best_score, b1, b2)) => {
                    score > *best_score
                        || (score == *best_score
                            && preference_rank(alleles, a1, a2)
                                < preference_rank(alleles, *b1, *b2))
                }
            };
            if candidate_better {
                best = Some((score, a1, a2));
            }
        }
    }
    let (_, a1, a2) = best.unwrap();
    (a1, a2)
}

/// Lower ranks are preferred on score ties.
fn preference_rank(
    alleles: &[crate::bubble::Allele],
    a1: usize,
    a2: usize,
) -> (bool, bool, usize, usize) {
    let ordered = alleles[a1].bases <= alleles[a2].bases;
    let has_ref = alleles[a1].is_ref || alleles[a2].is_ref;
    (!ordered, !has_ref, a1, a2)
}

/// Phase a bubble graph: the genome fragment plus a per-read haplotype
/// assignment. `hap1` and `hap2` read sets are disjoint by construction.
pub fn phase_bubble_graph(
    graph: &BubbleGraph,
    read_count: usize,
    params: &PhaserParams,
) -> (GenomeFragment, Vec<HaplotypeAssignment>) {
    let fragment_len = graph.bubbles.len();
    if fragment_len == 0 || read_count == 0 {
        return (
            GenomeFragment {
                hap1: Vec::new(),
                hap2: Vec::new(),
                ref_start: 0,
                length: 0,
            },
            vec![HaplotypeAssignment::Unphased; read_count],
        );
    }

    let problem = PhaseProblem::new(graph, read_count);
    let candidates: Vec<usize> = (0..read_count)
        .filter(|&r| !problem.by_read[r].is_empty())
        .collect();
    if candidates.is_empty() {
        let genotype: Vec<(usize, usize)> = (0..fragment_len)
            .map(|b| {
                let r = graph.bubbles[b].ref_allele;
                (r, r)
            })
            .collect();
        return (
            GenomeFragment {
                hap1: genotype.iter().map(|g| g.0).collect(),
                hap2: genotype.iter().map(|g| g.1).collect(),
                ref_start: 0,
                length: fragment_len,
            },
            vec![HaplotypeAssignment::Unphased; read_count],
        );
    }

    let mut assignment = kmeans_init(&problem, &candidates, params.kmeans_iterations);
    let mut genotype: Vec<(usize, usize)> = vec![(0, 0); fragment_len];

    for _ in 0..params.max_iterations {
        for b in 0..fragment_len {
            genotype[b] = best_genotype(graph, &problem, b, &assignment, params);
        }
        let mut changed = false;
        for &r in &candidates {
            let l1 = problem.read_ll(r, &genotype, true, params.read_error_rate);
            let l2 = problem.read_ll(r, &genotype, false, params.read_error_rate);
            let new = if l1 > l2 {
                1
            } else if l2 > l1 {
                2
            } else {
                assignment[r]
            };
            if assignment[r] != new {
                assignment[r] = new;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // Final confidence-gated assignment.
    let mut result = vec![HaplotypeAssignment::Unphased; read_count];
    for &r in &candidates {
        let l1 = problem.read_ll(r, &genotype, true, params.read_error_rate);
        let l2 = problem.read_ll(r, &genotype, false, params.read_error_rate);
        if (l1 - l2).abs() < params.min_phase_confidence {
            continue;
        }
        result[r] = if l1 > l2 {
            HaplotypeAssignment::Hap1
        } else {
            HaplotypeAssignment::Hap2
        };
    }

    (
        GenomeFragment {
            hap1: genotype.iter().map(|g| g.0).collect(),
            hap2: genotype.iter().map(|g| g.1).collect(),
            ref_start: 0,
            length: fragment_len,
        },
        result,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bubble::{Allele, Bubble, BubbleGraph};
    use crate::poa::Consensus;
    use crate::rle::RleString;

    fn make_bubble(start: usize, alleles: Vec<(Vec<u8>, Vec<u32>, bool)>) -> Bubble {
        let ref_allele = alleles.iter().position(|(_, _, is_ref)| *is_ref).unwrap();
        Bubble {
            start,
            len: 1,
            alleles: alleles
                .into_iter()
                .map(|(bases, reads, is_ref)| Allele {
                    bases,
                    weight: reads.len() as f64,
                    reads,
                    is_ref,
                })
                .collect(),
            ref_allele,
        }
    }

    fn make_graph(bubbles: Vec<Bubble>, consensus: &[u8]) -> BubbleGraph {
        let rle = RleString::compress(consensus);
        let nodes = (1..=rle.len() as u32).collect();
        BubbleGraph {
            bubbles,
            consensus: Consensus { rle, nodes },
        }
    }

    /// Two correlated het bubbles over ten reads: reads 0-4 carry the
    /// reference alleles, reads 5-9 the alternates.
    fn het_graph() -> BubbleGraph {
        let b1 = make_bubble(
            1,
            vec![
                (b"C".to_vec(), vec![0, 1, 2, 3, 4], true),
                (b"G".to_vec(), vec![5, 6, 7, 8, 9], false),
            ],
        );
        let b2 = make_bubble(
            3,
            vec![
                (b"T".to_vec(), vec![0, 1, 2, 3, 4], true),
                (b"A".to_vec(), vec![5, 6, 7, 8, 9], false),
            ],
        );
        make_graph(vec![b1, b2], b"ACGTG")
    }

    #[test]
    fn test_even_split_phases_cleanly() {
        let graph = het_graph();
        let (fragment, assignment) =
            phase_bubble_graph(&graph, 10, &PhaserParams::default());
        assert_eq!(fragment.length, 2);
        // Both bubbles are called het.
        assert_ne!(fragment.hap1[0], fragment.hap2[0]);
        assert_ne!(fragment.hap1[1], fragment.hap2[1]);
        // Each read group lands together, the two groups apart, nobody
        // unphased.
        let h1: Vec<usize> = (0..10)
            .filter(|&r| assignment[r] == HaplotypeAssignment::Hap1)
            .collect();
        let h2: Vec<usize> = (0..10)
            .filter(|&r| assignment[r] == HaplotypeAssignment::Hap2)
            .collect();
        assert_eq!(h1.len(), 5);
        assert_eq!(h2.len(), 5);
        assert!(h1.iter().all(|&r| r < 5) || h1.iter().all(|&r| r >= 5));
        // Haplotype alleles are internally consistent with the read split.
        assert_eq!(fragment.hap1[0], fragment.hap1[1]);
    }

    #[test]
    fn test_disjoint_and_complete() {
        let graph = het_graph();
        let (_, assignment) = phase_bubble_graph(&graph, 12, &PhaserParams::default());
        // Reads 10 and 11 observe no bubble: unphased.
        assert_eq!(assignment[10], HaplotypeAssignment::Unphased);
        assert_eq!(assignment[11], HaplotypeAssignment::Unphased);
        let counts = assignment.iter().fold([0usize; 3], |mut acc, a| {
            match a {
                HaplotypeAssignment::Hap1 => acc[0] += 1,
                HaplotypeAssignment::Hap2 => acc[1] += 1,
                HaplotypeAssignment::Unphased => acc[2] += 1,
            }
            acc
        });
        assert_eq!(counts.iter().sum::<usize>(), 12);
        assert_eq!(counts[0], 5);
        assert_eq!(counts[1], 5);
    }

    #[test]
    fn test_no_bubbles_all_unphased() {
        let graph = make_graph(Vec::new(), b"ACGT");
        let (fragment, assignment) = phase_bubble_graph(&graph, 4, &PhaserParams::default());
        assert_eq!(fragment.length, 0);
        assert!(assignment
            .iter()
            .all(|&a| a == HaplotypeAssignment::Unphased));
    }

    #[test]
    fn test_homozygous_site_leaves_reads_unphased() {
        // Every read carries the same alternate allele: the genotype is hom
        // and no read has a likelihood margin between haplotypes.
        let bubble = make_bubble(
            1,
            vec![
                (b"C".to_vec(), vec![], true),
                (b"G".to_vec(), (0..8).collect(), false),
            ],
        );
        let graph = make_graph(vec![bubble], b"ACGT");
        let (fragment, assignment) = phase_bubble_graph(&graph, 8, &PhaserParams::default());
        assert_eq!(fragment.hap1[0], fragment.hap2[0]);
        let alt = graph.bubbles[0]
            .alleles
            .iter()
            .position(|a| !a.is_ref)
            .unwrap();
        assert_eq!(fragment.hap1[0], alt);
        assert!(assignment
            .iter()
            .all(|&a| a == HaplotypeAssignment::Unphased));
    }

    #[test]
    fn test_low_confidence_read_unphased() {
        // Read 10 saw only bubble 1 with a strict threshold above a single
        // site's likelihood margin.
        let b1 = make_bubble(
            1,
            vec![
                (b"C".to_vec(), vec![0, 1, 2, 3, 4, 10], true),
                (b"G".to_vec(), vec![5, 6, 7, 8, 9], false),
            ],
        );
        let b2 = make_bubble(
            3,
            vec![
                (b"T".to_vec(), vec![0, 1, 2, 3, 4], true),
                (b"A".to_vec(), vec![5, 6, 7, 8, 9], false),
            ],
        );
        let graph = make_graph(vec![b1, b2], b"ACGTG");
        let params = PhaserParams {
            min_phase_confidence: 4.0,
            ..PhaserParams::default()
        };
        let (_, assignment) = phase_bubble_graph(&graph, 11, &params);
        // Two-site reads clear 4.0 (two margins of ~2.94 each), the
        // one-site read does not.
        assert_eq!(assignment[10], HaplotypeAssignment::Unphased);
        assert_ne!(assignment[0], HaplotypeAssignment::Unphased);
        assert_ne!(assignment[5], HaplotypeAssignment::Unphased);
    }

    #[test]
    fn test_deterministic() {
        let graph = het_graph();
        let run = || phase_bubble_graph(&graph, 10, &PhaserParams::default());
        let (f1, a1) = run();
        let (f2, a2) = run();
        assert_eq!(f1.hap1, f2.hap1);
        assert_eq!(f1.hap2, f2.hap2);
        assert_eq!(a1, a2);
    }
}

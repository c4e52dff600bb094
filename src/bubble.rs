//! Bubble extraction from the POA.
//!
//! A bubble is a consensus locus where the reads disagree enough to open a
//! candidate variant site: a minority base above the candidate threshold, a
//! heavy delete weight, or a promoted insertion with substantial bypass
//! support. Each bubble enumerates the distinct allele strings observed among
//! the reads traversing it, with the reference path's allele marked.

use crate::params::PoaParams;
use crate::poa::{Consensus, NodeId, Poa};
use crate::reads::ChunkRead;
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone)]
pub struct Allele {
    /// Expanded allele string; empty for a deletion allele.
    pub bases: Vec<u8>,
    /// Indices of supporting reads in the chunk's read vector.
    pub reads: Vec<u32>,
    /// Summed support weight, used as the allele prior.
    pub weight: f64,
    pub is_ref: bool,
}

#[derive(Debug, Clone)]
pub struct Bubble {
    /// First consensus run covered by the bubble.
    pub start: usize,
    /// Number of consensus runs covered.
    pub len: usize,
    pub alleles: Vec<Allele>,
    /// Index of the reference allele in `alleles`.
    pub ref_allele: usize,
}

pub struct BubbleGraph {
    pub bubbles: Vec<Bubble>,
    pub consensus: Consensus,
}

impl BubbleGraph {
    /// Expand the consensus with the chosen allele substituted at each
    /// bubble: the haplotype's new reference string.
    pub fn haplotype_reference(&self, choices: &[usize]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.consensus.rle.expanded_len());
        let mut bubble_at: FxHashMap<usize, usize> = FxHashMap::default();
        for (i, bubble) in self.bubbles.iter().enumerate() {
            bubble_at.insert(bubble.start, i);
        }
        let mut run = 0;
        while run < self.consensus.rle.len() {
            if let Some(&bi) = bubble_at.get(&run) {
                let bubble = &self.bubbles[bi];
                out.extend_from_slice(&bubble.alleles[choices[bi]].bases);
                run += bubble.len;
            } else {
                for _ in 0..self.consensus.rle.run_length(run) {
                    out.push(self.consensus.rle.base(run));
                }
                run += 1;
            }
        }
        out
    }
}

fn reads_at(poa: &Poa, node: NodeId) -> FxHashSet<u32> {
    poa.nodes[node as usize]
        .observations
        .iter()
        .map(|obs| obs.read)
        .collect()
}

fn edge_weight(poa: &Poa, from: NodeId, to: NodeId) -> f64 {
    poa.nodes[from as usize]
        .edges_out
        .iter()
        .map(|&e| &poa.edges[e])
        .find(|edge| edge.to == to)
        .map(|edge| edge.weight)
        .unwrap_or(0.0)
}

/// An insert record at a consensus run is "open" when it is not already
/// represented by a promoted node sitting in the consensus right after the
/// run (that case is the bypass bubble's job).
fn open_insert_records<'a>(
    poa: &'a Poa,
    consensus: &Consensus,
    r: usize,
) -> impl Iterator<Item = &'a crate::poa::InsertRecord> {
    let node = &poa.nodes[consensus.nodes[r] as usize];
    let successor = consensus.nodes.get(r + 1).copied();
    node.inserts.iter().filter(move |record| {
        record.promoted_nodes.is_empty() || successor != record.promoted_nodes.first().copied()
    })
}

/// Is consensus run `r` a candidate variant site?
fn is_variant_run(poa: &Poa, consensus: &Consensus, r: usize, params: &PoaParams) -> bool {
    let node_id = consensus.nodes[r];
    let node = &poa.nodes[node_id as usize];
    let total = node.total_base_weight();
    if total <= 0.0 {
        return false;
    }
    let max_base = node
        .base_weights
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);
    let minority = total - max_base;
    if minority >= params.candidate_variant_weight * total {
        return true;
    }
    if node.delete_weight >= params.candidate_variant_weight * (total + node.delete_weight) {
        return true;
    }
    // Insertions observed after this run that the consensus did not absorb.
    if open_insert_records(poa, consensus, r)
        .any(|record| record.weight >= params.candidate_variant_weight * total)
    {
        return true;
    }
    // A promoted insertion node in the consensus: the alternative is the
    // bypass edge from the consensus predecessor to the consensus successor.
    if !poa.is_backbone(node_id) && r > 0 && r + 1 < consensus.nodes.len() {
        let bypass = edge_weight(poa, consensus.nodes[r - 1], consensus.nodes[r + 1]);
        if bypass >= params.candidate_variant_weight * total {
            return true;
        }
    }
    false
}

/// The reference path's bases between two anchor nodes, when both anchors lie
/// on the backbone; None otherwise.
fn reference_path_bases(poa: &Poa, left: NodeId, right: NodeId) -> Option<Vec<u8>> {
    if !poa.is_backbone(left) || !poa.is_backbone(right) || left >= right {
        return None;
    }
    let mut bases = Vec::new();
    for node in left + 1..right {
        let run = node as usize - 1;
        for _ in 0..poa.ref_rle.run_length(run) {
            bases.push(poa.ref_rle.base(run));
        }
    }
    Some(bases)
}

/// Aggregate `(allele string, read, weight)` sightings into alleles, apply
/// the support threshold, and mark (inserting if necessary) the reference
/// allele.
fn collect_alleles(
    sightings: Vec<(Vec<u8>, u32, f64)>,
    ref_bases: Vec<u8>,
    min_support: f64,
) -> Option<(Vec<Allele>, usize)> {
    let mut alleles: Vec<Allele> = Vec::new();
    for (bases, read, weight) in sightings {
        match alleles.iter_mut().find(|a| a.bases == bases) {
            Some(allele) => {
                allele.reads.push(read);
                allele.weight += weight;
            }
            None => alleles.push(Allele {
                bases,
                reads: vec![read],
                weight,
                is_ref: false,
            }),
        }
    }
    alleles.retain(|a| a.weight >= min_support || a.bases == ref_bases);
    // Deterministic order: heaviest first, then lexicographic.
    alleles.sort_by(|a, b| {
        b.weight
            .partial_cmp(&a.weight)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.bases.cmp(&b.bases))
    });
    let ref_allele = match alleles.iter().position(|a| a.bases == ref_bases) {
        Some(i) => i,
        None => {
            alleles.push(Allele {
                bases: ref_bases,
                reads: Vec::new(),
                weight: 0.0,
                is_ref: false,
            });
            alleles.len() - 1
        }
    };
    alleles[ref_allele].is_ref = true;
    if alleles.len() < 2 {
        return None;
    }
    Some((alleles, ref_allele))
}

/// Single-node allele synthesis from the node's observation weights.
fn synthesise_bubble(
    poa: &Poa,
    consensus: &Consensus,
    r: usize,
    params: &PoaParams,
) -> Option<Bubble> {
    let node_id = consensus.nodes[r];
    let node = &poa.nodes[node_id as usize];

    // Reads that inserted after this run carry the insertion in their
    // allele, so a junction like ref AT vs read AGT becomes A vs AG.
    let mut insert_suffix: FxHashMap<u32, &[u8]> = FxHashMap::default();
    for record in open_insert_records(poa, consensus, r) {
        if record.weight < params.min_allele_support {
            continue;
        }
        for &(read, _, _) in &record.reads {
            insert_suffix.insert(read, record.bases.as_slice());
        }
    }

    let mut sightings: Vec<(Vec<u8>, u32, f64)> = Vec::new();
    for obs in &node.observations {
        let mut bases = Vec::with_capacity(obs.run_length as usize);
        for _ in 0..obs.run_length {
            bases.push(obs.base);
        }
        if let Some(suffix) = insert_suffix.get(&obs.read) {
            bases.extend_from_slice(suffix);
        }
        sightings.push((bases, obs.read, obs.weight));
    }
    for del in &node.delete_observations {
        sightings.push((Vec::new(), del.read, del.weight));
    }
    // A promoted insertion has no delete observations: reads that traverse
    // both consensus neighbours without touching the node support its
    // absence.
    if !poa.is_backbone(node_id) && r > 0 && r + 1 < consensus.nodes.len() {
        let before = reads_at(poa, consensus.nodes[r - 1]);
        let after = reads_at(poa, consensus.nodes[r + 1]);
        let here: FxHashSet<u32> = node.observations.iter().map(|o| o.read).collect();
        let mut bypassing: Vec<u32> = before
            .intersection(&after)
            .filter(|read| !here.contains(read))
            .copied()
            .collect();
        bypassing.sort_unstable();
        for read in bypassing {
            sightings.push((Vec::new(), read, 1.0));
        }
    }

    let ref_bases = if poa.is_backbone(node_id) {
        let mut bases = Vec::with_capacity(node.run_length as usize);
        for _ in 0..node.run_length {
            bases.push(node.base);
        }
        bases
    } else {
        // A promoted insertion: the reference path does not contain it.
        Vec::new()
    };

    let (alleles, ref_allele) = collect_alleles(sightings, ref_bases, params.min_allele_support)?;
    Some(Bubble {
        start: r,
        len: 1,
        alleles,
        ref_allele,
    })
}

/// Read-substring alleles across a run of variant sites anchored at the
/// nearest non-variant consensus runs.
fn read_allele_bubble(
    poa: &Poa,
    consensus: &Consensus,
    reads: &[ChunkRead],
    start: usize,
    end: usize,
    params: &PoaParams,
) -> Option<Bubble> {
    if start == 0 || end >= consensus.nodes.len() {
        return None;
    }
    let left_anchor = consensus.nodes[start - 1];
    let right_anchor = consensus.nodes[end];

    // A read's offsets at the anchors delimit its traversal of the bubble.
    let mut left_offsets: FxHashMap<u32, u32> = FxHashMap::default();
    for obs in &poa.nodes[left_anchor as usize].observations {
        left_offsets.entry(obs.read).or_insert(obs.read_offset);
    }
    let mut sightings: Vec<(Vec<u8>, u32, f64)> = Vec::new();
    for obs in &poa.nodes[right_anchor as usize].observations {
        let Some(&left_off) = left_offsets.get(&obs.read) else {
            continue;
        };
        if obs.read_offset < left_off {
            continue;
        }
        let rle = &reads[obs.read as usize].rle;
        let mut bases = Vec::new();
        for run in left_off + 1..obs.read_offset {
            for _ in 0..rle.run_length(run as usize) {
                bases.push(rle.base(run as usize));
            }
        }
        sightings.push((bases, obs.read, obs.weight));
    }

    let ref_bases = reference_path_bases(poa, left_anchor, right_anchor).unwrap_or_else(|| {
        let mut bases = Vec::new();
        for run in start..end {
            for _ in 0..consensus.rle.run_length(run) {
                bases.push(consensus.rle.base(run));
            }
        }
        bases
    });

    let (alleles, ref_allele) = collect_alleles(sightings, ref_bases, params.min_allele_support)?;
    Some(Bubble {
        start,
        len: end - start,
        alleles,
        ref_allele,
    })
}

/// Scan the consensus for variant sites and build the ordered bubble
/// sequence.
pub fn find_bubbles(
    poa: &Poa,
    consensus: Consensus,
    reads: &[ChunkRead],
    params: &PoaParams,
    use_read_alleles: bool,
) -> BubbleGraph {
    let mut bubbles = Vec::new();
    let n = consensus.rle.len();
    let mut r = 0;
    while r < n {
        if !is_variant_run(poa, &consensus, r, params) {
            r += 1;
            continue;
        }
        if use_read_alleles {
            let mut end = r + 1;
            while end < n && is_variant_run(poa, &consensus, end, params) {
                end += 1;
            }
            if let Some(bubble) = read_allele_bubble(poa, &consensus, reads, r, end, params) {
                bubbles.push(bubble);
            }
            r = end;
        } else {
            if let Some(bubble) = synthesise_bubble(poa, &consensus, r, params) {
                bubbles.push(bubble);
            }
            r += 1;
        }
    }
    BubbleGraph { bubbles, consensus }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::PoaParams;
    use crate::poa::Poa;
    use crate::reads::{AlignedPair, ReadAlignment};
    use crate::rle::RleString;

    fn make_read(name: &str, seq: &[u8]) -> ChunkRead {
        ChunkRead {
            name: name.to_string(),
            rle: RleString::compress(seq),
            forward: true,
            soft_clip_start: 0,
            soft_clip_end: 0,
        }
    }

    fn identity_alignment(len: usize) -> ReadAlignment {
        (0..len)
            .map(|i| AlignedPair {
                read_offset: i as u32,
                ref_offset: i as u32,
                weight: 1.0,
            })
            .collect()
    }

    /// Five reads support each of two SNP alleles at the second position.
    /// `AGGT` compresses to `A G2 T`: its G2 run substitutes the reference C
    /// and the reference G run is deleted (run alignments are one-to-one).
    fn snp_fixture() -> (Poa, Vec<ChunkRead>, Vec<ReadAlignment>) {
        let reference = RleString::compress(b"ACGT");
        let reads: Vec<ChunkRead> = (0..10)
            .map(|i| {
                make_read(
                    &format!("r{}", i),
                    if i < 5 { b"ACGT" } else { b"AGGT" },
                )
            })
            .collect();
        let alignments: Vec<ReadAlignment> = (0..10)
            .map(|i| {
                if i < 5 {
                    identity_alignment(4)
                } else {
                    vec![
                        AlignedPair { read_offset: 0, ref_offset: 0, weight: 1.0 },
                        AlignedPair { read_offset: 1, ref_offset: 1, weight: 1.0 },
                        AlignedPair { read_offset: 2, ref_offset: 3, weight: 1.0 },
                    ]
                }
            })
            .collect();
        let poa = Poa::build(&reference, true, &reads, &alignments, &PoaParams::default());
        (poa, reads, alignments)
    }

    #[test]
    fn test_snp_sites_yield_alleles() {
        let (poa, reads, _) = snp_fixture();
        let params = PoaParams::default();
        let graph = find_bubbles(&poa, poa.consensus(), &reads, &params, false);
        // Single-node synthesis opens one bubble at the substituted C run
        // and one at the reference G run the variant reads delete.
        assert_eq!(graph.bubbles.len(), 2);

        let first = &graph.bubbles[0];
        assert_eq!(first.start, 1);
        assert_eq!(first.alleles.len(), 2);
        let ref_allele = &first.alleles[first.ref_allele];
        assert!(ref_allele.is_ref);
        assert_eq!(ref_allele.bases, b"C".to_vec());
        assert_eq!(ref_allele.reads.len(), 5);
        let alt = &first.alleles[1 - first.ref_allele];
        assert_eq!(alt.bases, b"GG".to_vec());
        assert_eq!(alt.reads.len(), 5);

        let second = &graph.bubbles[1];
        assert_eq!(second.start, 2);
        assert!(second.alleles.iter().any(|a| a.bases == b"G".to_vec()));
        assert!(second.alleles.iter().any(|a| a.bases.is_empty()));
    }

    #[test]
    fn test_unanimous_site_has_no_bubble() {
        let reference = RleString::compress(b"ACGT");
        let reads: Vec<ChunkRead> = (0..10)
            .map(|i| make_read(&format!("r{}", i), b"ACGT"))
            .collect();
        let alignments: Vec<ReadAlignment> = (0..10).map(|_| identity_alignment(4)).collect();
        let poa = Poa::build(&reference, true, &reads, &alignments, &PoaParams::default());
        let params = PoaParams::default();
        let graph = find_bubbles(&poa, poa.consensus(), &reads, &params, false);
        assert!(graph.bubbles.is_empty());
    }

    #[test]
    fn test_weak_minority_below_threshold_ignored() {
        // One read in twenty disagreeing stays below the default 0.2
        // candidate fraction and the 2.0 support floor.
        let reference = RleString::compress(b"ACGT");
        let mut reads: Vec<ChunkRead> = (0..19)
            .map(|i| make_read(&format!("r{}", i), b"ACGT"))
            .collect();
        reads.push(make_read("odd", b"ATGT"));
        let mut alignments: Vec<ReadAlignment> = (0..19).map(|_| identity_alignment(4)).collect();
        alignments.push(identity_alignment(4));
        let poa = Poa::build(&reference, true, &reads, &alignments, &PoaParams::default());
        let params = PoaParams::default();
        let graph = find_bubbles(&poa, poa.consensus(), &reads, &params, false);
        assert!(graph.bubbles.is_empty());
    }

    #[test]
    fn test_read_allele_mode_extracts_substrings() {
        // The two adjacent variant runs merge into one bubble anchored at
        // the flanking A and T; alleles are read substrings between anchors.
        let (poa, reads, _) = snp_fixture();
        let params = PoaParams::default();
        let graph = find_bubbles(&poa, poa.consensus(), &reads, &params, true);
        assert_eq!(graph.bubbles.len(), 1);
        let bubble = &graph.bubbles[0];
        let mut strings: Vec<Vec<u8>> =
            bubble.alleles.iter().map(|a| a.bases.clone()).collect();
        strings.sort();
        assert_eq!(strings, vec![b"CG".to_vec(), b"GG".to_vec()]);
        let ref_allele = &bubble.alleles[bubble.ref_allele];
        assert_eq!(ref_allele.bases, b"CG".to_vec());
    }

    #[test]
    fn test_haplotype_reference_substitutes_alleles() {
        let (poa, reads, _) = snp_fixture();
        let params = PoaParams::default();
        let graph = find_bubbles(&poa, poa.consensus(), &reads, &params, false);
        assert_eq!(graph.bubbles.len(), 2);
        let ref_choice: Vec<usize> = graph.bubbles.iter().map(|b| b.ref_allele).collect();
        let alt_choice: Vec<usize> = graph
            .bubbles
            .iter()
            .map(|b| {
                b.alleles
                    .iter()
                    .position(|a| !a.is_ref)
                    .expect("alt allele present")
            })
            .collect();
        assert_eq!(graph.haplotype_reference(&ref_choice), b"ACGT".to_vec());
        assert_eq!(graph.haplotype_reference(&alt_choice), b"AGGT".to_vec());
    }

    #[test]
    fn test_het_insertion_becomes_junction_bubble() {
        // Half the reads insert a G between the reference A and T. The
        // consensus keeps the direct path (ties prefer no insert), and the
        // junction bubble carries A vs AG.
        let reference = RleString::compress(b"AT");
        let reads: Vec<ChunkRead> = (0..10)
            .map(|i| {
                make_read(
                    &format!("r{}", i),
                    if i < 5 { b"AT" } else { b"AGT" },
                )
            })
            .collect();
        let alignments: Vec<ReadAlignment> = (0..10)
            .map(|i| {
                if i < 5 {
                    identity_alignment(2)
                } else {
                    vec![
                        AlignedPair { read_offset: 0, ref_offset: 0, weight: 1.0 },
                        AlignedPair { read_offset: 2, ref_offset: 1, weight: 1.0 },
                    ]
                }
            })
            .collect();
        let poa = Poa::build(&reference, true, &reads, &alignments, &PoaParams::default());
        assert_eq!(poa.consensus().rle.expand(), b"AT".to_vec());

        let params = PoaParams::default();
        let graph = find_bubbles(&poa, poa.consensus(), &reads, &params, false);
        assert_eq!(graph.bubbles.len(), 1);
        let bubble = &graph.bubbles[0];
        let mut strings: Vec<Vec<u8>> =
            bubble.alleles.iter().map(|a| a.bases.clone()).collect();
        strings.sort();
        assert_eq!(strings, vec![b"A".to_vec(), b"AG".to_vec()]);
        assert_eq!(bubble.alleles[bubble.ref_allele].bases, b"A".to_vec());

        let alt = bubble.alleles.iter().position(|a| !a.is_ref).unwrap();
        assert_eq!(graph.haplotype_reference(&[alt]), b"AGT".to_vec());
    }

    #[test]
    fn test_deletion_allele() {
        // Half the reads delete the C run.
        let reference = RleString::compress(b"ACGT");
        let reads: Vec<ChunkRead> = (0..10)
            .map(|i| {
                make_read(
                    &format!("r{}", i),
                    if i < 5 { b"ACGT" } else { b"AGT" },
                )
            })
            .collect();
        let alignments: Vec<ReadAlignment> = (0..10)
            .map(|i| {
                if i < 5 {
                    identity_alignment(4)
                } else {
                    vec![
                        AlignedPair { read_offset: 0, ref_offset: 0, weight: 1.0 },
                        AlignedPair { read_offset: 1, ref_offset: 2, weight: 1.0 },
                        AlignedPair { read_offset: 2, ref_offset: 3, weight: 1.0 },
                    ]
                }
            })
            .collect();
        let poa = Poa::build(&reference, true, &reads, &alignments, &PoaParams::default());
        let params = PoaParams::default();
        let graph = find_bubbles(&poa, poa.consensus(), &reads, &params, false);
        assert_eq!(graph.bubbles.len(), 1);
        let bubble = &graph.bubbles[0];
        assert!(bubble.alleles.iter().any(|a| a.bases.is_empty()));
        assert!(bubble.alleles.iter().any(|a| a.bases == b"C".to_vec()));
    }
}

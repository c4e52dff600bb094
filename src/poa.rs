//! Partial-order alignment consensus graph.
//!
//! The graph is seeded as a linear chain from the RLE reference substring of
//! a chunk: node 0 is the source, node `i + 1` holds reference run `i`.
//! Aligned reads contribute weighted observations to nodes (bases, run
//! lengths, deletions) and to edges; insertion strings accumulate on the
//! node preceding their landing position and are promoted to real nodes once
//! they carry enough weight. Consensus is a greedy source-to-sink traversal
//! over edge weights.
//!
//! The arena holds nodes and edges by integer index; nothing is deleted
//! during a chunk's lifetime.

use crate::params::PoaParams;
use crate::reads::{AlignedPair, ChunkRead, ReadAlignment};
use crate::rle::{base_index, RleString, BASES};

pub type NodeId = u32;

/// One read's observation at a node.
#[derive(Debug, Clone)]
pub struct BaseObservation {
    pub read: u32,
    pub base: u8,
    pub run_length: u32,
    /// Run index into the read, used to extract read substrings for alleles.
    pub read_offset: u32,
    pub weight: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DeleteObservation {
    pub read: u32,
    pub weight: f64,
}

/// An insertion string observed between this node and `to`.
#[derive(Debug, Clone)]
pub struct InsertRecord {
    /// Expanded inserted bases.
    pub bases: Vec<u8>,
    /// Landing node; None when the insertion trails the final node.
    pub to: Option<NodeId>,
    pub weight: f64,
    /// (read, run offset of the first inserted run, weight)
    pub reads: Vec<(u32, u32, f64)>,
    /// Node chain created for this record by insert promotion; empty while
    /// unpromoted.
    pub promoted_nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy)]
pub struct PoaEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct PoaNode {
    /// Reference (or promoted-insert) base; 0 for the source node.
    pub base: u8,
    pub run_length: u32,
    pub base_weights: [f64; 4],
    pub delete_weight: f64,
    pub observations: Vec<BaseObservation>,
    pub delete_observations: Vec<DeleteObservation>,
    pub inserts: Vec<InsertRecord>,
    /// Indices into the edge arena.
    pub edges_out: Vec<usize>,
}

impl PoaNode {
    fn new(base: u8, run_length: u32) -> Self {
        PoaNode {
            base,
            run_length,
            base_weights: [0.0; 4],
            delete_weight: 0.0,
            observations: Vec::new(),
            delete_observations: Vec::new(),
            inserts: Vec::new(),
            edges_out: Vec::new(),
        }
    }

    pub fn total_base_weight(&self) -> f64 {
        self.base_weights.iter().sum()
    }
}

impl Poa {
    /// Whether a node is part of the seeded reference chain (as opposed to a
    /// promoted insertion).
    pub fn is_backbone(&self, id: NodeId) -> bool {
        (id as usize) < self.backbone_len
    }
}

pub struct Poa {
    pub nodes: Vec<PoaNode>,
    pub edges: Vec<PoaEdge>,
    pub ref_rle: RleString,
    use_rle: bool,
    /// Number of backbone nodes (source + one per reference run).
    backbone_len: usize,
}

/// Consensus string plus the node that emitted each run.
#[derive(Debug, Clone)]
pub struct Consensus {
    pub rle: RleString,
    pub nodes: Vec<NodeId>,
}

impl Poa {
    /// Seed a linear graph from the reference substring.
    pub fn from_reference(ref_rle: &RleString, use_rle: bool) -> Self {
        let n = ref_rle.len();
        let mut nodes = Vec::with_capacity(n + 1);
        nodes.push(PoaNode::new(0, 0));
        for i in 0..n {
            nodes.push(PoaNode::new(ref_rle.base(i), ref_rle.run_length(i)));
        }
        let mut poa = Poa {
            nodes,
            edges: Vec::with_capacity(n),
            ref_rle: ref_rle.clone(),
            use_rle,
            backbone_len: n + 1,
        };
        for i in 0..n as NodeId {
            poa.bump_edge(i, i + 1, 0.0);
        }
        poa
    }

    /// Build the graph from reads: seed, add every alignment, promote
    /// heavy insertions.
    pub fn build(
        ref_rle: &RleString,
        use_rle: bool,
        reads: &[ChunkRead],
        alignments: &[ReadAlignment],
        params: &PoaParams,
    ) -> Self {
        let mut poa = Poa::from_reference(ref_rle, use_rle);
        for (idx, (read, alignment)) in reads.iter().zip(alignments).enumerate() {
            poa.add_alignment(idx as u32, read, alignment);
        }
        poa.promote_inserts(params.min_insert_weight);
        poa
    }

    fn bump_edge(&mut self, from: NodeId, to: NodeId, weight: f64) {
        let existing = self.nodes[from as usize]
            .edges_out
            .iter()
            .copied()
            .find(|&e| self.edges[e].to == to);
        match existing {
            Some(edge_idx) => self.edges[edge_idx].weight += weight,
            None => {
                let edge_idx = self.edges.len();
                self.edges.push(PoaEdge { from, to, weight });
                self.nodes[from as usize].edges_out.push(edge_idx);
            }
        }
    }

    fn record_insert(
        &mut self,
        at: NodeId,
        read_idx: u32,
        read: &RleString,
        runs: std::ops::Range<usize>,
        to: Option<NodeId>,
        weight: f64,
    ) {
        if runs.is_empty() {
            return;
        }
        let first_run = runs.start as u32;
        let mut bases = Vec::new();
        for r in runs {
            for _ in 0..read.run_length(r) {
                bases.push(read.base(r));
            }
        }
        let node = &mut self.nodes[at as usize];
        if let Some(record) = node
            .inserts
            .iter_mut()
            .find(|rec| rec.bases == bases && rec.to == to)
        {
            record.weight += weight;
            record.reads.push((read_idx, first_run, weight));
        } else {
            node.inserts.push(InsertRecord {
                bases,
                to,
                weight,
                reads: vec![(read_idx, first_run, weight)],
                promoted_nodes: Vec::new(),
            });
        }
    }

    /// Walk one read's alignment, updating node and edge tallies.
    pub fn add_alignment(&mut self, read_idx: u32, read: &ChunkRead, alignment: &ReadAlignment) {
        if alignment.is_empty() {
            return;
        }
        let first = alignment[0];
        let last = *alignment.last().unwrap();

        // Unaligned leading read runs surface as an insertion in front of the
        // first matched node.
        if first.read_offset > 0 {
            let at = first.ref_offset; // backbone predecessor of the first matched node
            self.record_insert(
                at,
                read_idx,
                &read.rle,
                0..first.read_offset as usize,
                Some(first.ref_offset + 1),
                first.weight,
            );
        }

        let mut prev: Option<AlignedPair> = None;
        for &pair in alignment {
            let node_id = pair.ref_offset + 1;
            let base = read.rle.base(pair.read_offset as usize);
            let run_length = read.rle.run_length(pair.read_offset as usize);
            {
                let node = &mut self.nodes[node_id as usize];
                if let Some(bi) = base_index(base) {
                    node.base_weights[bi] += pair.weight;
                }
                node.observations.push(BaseObservation {
                    read: read_idx,
                    base,
                    run_length,
                    read_offset: pair.read_offset,
                    weight: pair.weight,
                });
            }

            if let Some(prev_pair) = prev {
                let prev_node = prev_pair.ref_offset + 1;
                // Reference runs skipped between consecutive matches are
                // deletions in this read.
                for deleted in prev_node + 1..node_id {
                    let node = &mut self.nodes[deleted as usize];
                    node.delete_weight += pair.weight;
                    node.delete_observations.push(DeleteObservation {
                        read: read_idx,
                        weight: pair.weight,
                    });
                }
                if pair.read_offset > prev_pair.read_offset + 1 {
                    // Read runs with no reference counterpart: an insertion
                    // recorded on the node preceding the landing node. The
                    // transition weight stays with the insert until (and
                    // unless) it is promoted.
                    self.record_insert(
                        prev_node,
                        read_idx,
                        &read.rle,
                        prev_pair.read_offset as usize + 1..pair.read_offset as usize,
                        Some(node_id),
                        pair.weight,
                    );
                } else {
                    self.bump_edge(prev_node, node_id, pair.weight);
                }
            }
            prev = Some(pair);
        }

        // Trailing unaligned read runs: an insertion after the last matched
        // node, with no landing node.
        if (last.read_offset as usize) + 1 < read.rle.len() {
            self.record_insert(
                last.ref_offset + 1,
                read_idx,
                &read.rle,
                last.read_offset as usize + 1..read.rle.len(),
                None,
                last.weight,
            );
        }
    }

    /// Promote insertion strings that accumulated at least `min_weight` into
    /// real nodes: a chain appended to the arena, wired from the recording
    /// node to the landing node. The record keeps the ids of its chain.
    pub fn promote_inserts(&mut self, min_weight: f64) {
        for node_id in 0..self.backbone_len as NodeId {
            let promotable: Vec<usize> = (0..self.nodes[node_id as usize].inserts.len())
                .filter(|&i| self.nodes[node_id as usize].inserts[i].weight >= min_weight)
                .collect();
            for record_idx in promotable {
                let record = self.nodes[node_id as usize].inserts[record_idx].clone();
                let insert_rle = RleString::new(self.use_rle, &record.bases);
                let mut chain = Vec::with_capacity(insert_rle.len());
                let mut prev = node_id;
                for run in 0..insert_rle.len() {
                    let new_id = self.nodes.len() as NodeId;
                    let mut node =
                        PoaNode::new(insert_rle.base(run), insert_rle.run_length(run));
                    if let Some(bi) = base_index(insert_rle.base(run)) {
                        node.base_weights[bi] = record.weight;
                    }
                    for &(read, first_run, weight) in &record.reads {
                        node.observations.push(BaseObservation {
                            read,
                            base: insert_rle.base(run),
                            run_length: insert_rle.run_length(run),
                            read_offset: first_run + run as u32,
                            weight,
                        });
                    }
                    self.nodes.push(node);
                    self.bump_edge(prev, new_id, record.weight);
                    chain.push(new_id);
                    prev = new_id;
                }
                if let Some(to) = record.to {
                    self.bump_edge(prev, to, record.weight);
                }
                self.nodes[node_id as usize].inserts[record_idx].promoted_nodes = chain;
            }
        }
    }

    /// Greedy consensus: from the source, repeatedly follow the
    /// highest-weighted outgoing edge (ties prefer the nearest backbone
    /// successor), emitting at each node the highest-weighted base. Base
    /// ties prefer the node's own (reference) base, then the
    /// lexicographically smallest. Skipped nodes are deletions.
    pub fn consensus(&self) -> Consensus {
        let mut bases = Vec::new();
        let mut run_lengths = Vec::new();
        let mut node_ids = Vec::new();

        let mut current: NodeId = 0;
        loop {
            let node = &self.nodes[current as usize];
            if node.edges_out.is_empty() {
                break;
            }
            let mut best = &self.edges[node.edges_out[0]];
            for &edge_idx in &node.edges_out[1..] {
                let edge = &self.edges[edge_idx];
                if edge.weight > best.weight || (edge.weight == best.weight && edge.to < best.to) {
                    best = edge;
                }
            }
            current = best.to;
            let next = &self.nodes[current as usize];
            let (base, run_length) = self.emit(next);
            bases.push(base);
            run_lengths.push(run_length);
            node_ids.push(current);
        }

        Consensus {
            rle: RleString::from_runs(bases, run_lengths),
            nodes: node_ids,
        }
    }

    /// Choose the emitted base and run length for one node.
    fn emit(&self, node: &PoaNode) -> (u8, u32) {
        let max_weight = node
            .base_weights
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        let own_index = base_index(node.base);
        let base = if let Some(oi) = own_index.filter(|&oi| node.base_weights[oi] == max_weight) {
            BASES[oi]
        } else {
            BASES[node
                .base_weights
                .iter()
                .position(|&w| w == max_weight)
                .unwrap_or(0)]
        };
        // Unobserved nodes fall back to their seeded base and length, so an
        // empty chunk reproduces the reference substring exactly.
        if max_weight <= 0.0 {
            return (node.base, node.run_length);
        }
        if base == node.base {
            return (base, node.run_length);
        }
        // The emitted base differs from the seeded one: take the weighted
        // modal run length among observations of that base.
        let mut by_length: Vec<(u32, f64)> = Vec::new();
        for obs in node.observations.iter().filter(|o| o.base == base) {
            match by_length.iter_mut().find(|(l, _)| *l == obs.run_length) {
                Some((_, w)) => *w += obs.weight,
                None => by_length.push((obs.run_length, obs.weight)),
            }
        }
        let run_length = by_length
            .iter()
            .fold((node.run_length, f64::NEG_INFINITY), |acc, &(l, w)| {
                if w > acc.1 || (w == acc.1 && l < acc.0) {
                    (l, w)
                } else {
                    acc
                }
            })
            .0;
        (base, run_length)
    }
}

/// Banded pairwise alignment of a read against a target string in run space:
/// the read aligns globally, the target's flanks are free. `diag_offset` is
/// the expected target run index of the read's first run; the band of
/// half-width `band` follows that diagonal.
pub fn banded_align(
    read: &RleString,
    target: &RleString,
    band: usize,
    diag_offset: i64,
    params: &PoaParams,
) -> ReadAlignment {
    let m = read.len();
    let n = target.len();
    if m == 0 || n == 0 {
        return Vec::new();
    }
    let band = band.max(1) as i64;
    let neg = f64::NEG_INFINITY;

    // Row window for read run i.
    let window = |i: i64| -> (usize, usize) {
        let center = diag_offset + i;
        let lo = (center - band).max(0).min(n as i64) as usize;
        let hi = ((center + band).max(0).min(n as i64)) as usize;
        (lo, hi)
    };

    let width = (2 * band + 1) as usize + 1;
    let mut score = vec![neg; (m + 1) * width];
    let mut trace = vec![0u8; (m + 1) * width]; // 0 start, 1 diag, 2 up, 3 left
    let idx = |i: usize, j: usize, lo: usize| i * width + (j - lo);

    // Row 0: free leading target gap.
    let (lo0, hi0) = window(0);
    for j in lo0..=hi0 {
        score[idx(0, j, lo0)] = 0.0;
    }

    for i in 1..=m {
        let (lo, hi) = window(i as i64);
        let (plo, phi) = window(i as i64 - 1);
        let read_base = read.base(i - 1);
        for j in lo..=hi {
            let mut best = neg;
            let mut step = 0u8;
            if j > 0 && j - 1 >= plo && j - 1 <= phi {
                let prev = score[idx(i - 1, j - 1, plo)];
                if prev > neg {
                    let s = if read_base == target.base(j - 1) {
                        params.match_score
                    } else {
                        params.mismatch_score
                    };
                    let cand = prev + s as f64;
                    if cand > best {
                        best = cand;
                        step = 1;
                    }
                }
            }
            if j >= plo && j <= phi {
                let prev = score[idx(i - 1, j, plo)];
                if prev > neg {
                    let cand = prev + params.gap_score as f64;
                    if cand > best {
                        best = cand;
                        step = 2;
                    }
                }
            }
            if j > lo {
                let prev = score[idx(i, j - 1, lo)];
                if prev > neg {
                    let cand = prev + params.gap_score as f64;
                    if cand > best {
                        best = cand;
                        step = 3;
                    }
                }
            }
            score[idx(i, j, lo)] = best;
            trace[idx(i, j, lo)] = step;
        }
    }

    // Free trailing target gap: best cell in the last row.
    let (lo_m, hi_m) = window(m as i64);
    let mut end_j = lo_m;
    let mut end_score = neg;
    for j in lo_m..=hi_m {
        if score[idx(m, j, lo_m)] > end_score {
            end_score = score[idx(m, j, lo_m)];
            end_j = j;
        }
    }
    if end_score <= neg {
        return Vec::new();
    }

    let mut pairs = Vec::new();
    let (mut i, mut j) = (m, end_j);
    while i > 0 {
        let (lo, _) = window(i as i64);
        if j < lo {
            break;
        }
        match trace[idx(i, j, lo)] {
            1 => {
                pairs.push(AlignedPair {
                    read_offset: (i - 1) as u32,
                    ref_offset: (j - 1) as u32,
                    weight: 1.0,
                });
                i -= 1;
                j -= 1;
            }
            2 => i -= 1,
            3 => j -= 1,
            _ => break,
        }
    }
    pairs.reverse();
    pairs
}

/// Iterated construction: build the graph, derive the consensus, re-align
/// every read to it and rebuild, until the consensus is a fixed point or the
/// iteration cap is reached. Returns the final graph together with the
/// alignments it was built from.
pub fn run_poa(
    reads: &[ChunkRead],
    alignments: &[ReadAlignment],
    ref_rle: &RleString,
    use_rle: bool,
    params: &PoaParams,
) -> (Poa, Vec<ReadAlignment>) {
    let mut ref_now = ref_rle.clone();
    let mut alns: Vec<ReadAlignment> = alignments.to_vec();
    let mut poa = Poa::build(&ref_now, use_rle, reads, &alns, params);

    for _ in 1..params.max_realign_iterations {
        let consensus = poa.consensus();
        let expanded = consensus.rle.expand();
        if expanded == ref_now.expand() {
            break;
        }
        let new_ref = RleString::new(use_rle, &expanded);
        alns = reads
            .iter()
            .zip(&alns)
            .map(|(read, old)| {
                let offset = old
                    .first()
                    .map(|p| p.ref_offset as i64 - p.read_offset as i64)
                    .unwrap_or(0);
                banded_align(&read.rle, &new_ref, params.band_width, offset, params)
            })
            .collect();
        ref_now = new_ref;
        poa = Poa::build(&ref_now, use_rle, reads, &alns, params);
    }
    (poa, alns)
}

//! Stitching of overlapping chunk consensuses into per-contig sequences.
//!
//! Successive chunks share a boundary overlap. The two consensuses are
//! aligned over their overlap windows and spliced at the match column
//! nearest the alignment midpoint, so each chunk contributes the region it
//! is authoritative for. In diploid mode the haplotype labelling of each
//! chunk is first reconciled with its predecessor by read-set agreement.

use crate::chunk::Chunk;
use bio::alignment::pairwise::Aligner;
use bio::alignment::AlignmentOperation;
use log::debug;
use rustc_hash::FxHashSet;

/// Splice `left ++ right`, reconciling the overlap window of expected
/// (reference-space) length `overlap`.
fn splice(mut left: Vec<u8>, right: &[u8], overlap: usize) -> Vec<u8> {
    let window = overlap.min(left.len()).min(right.len());
    if window == 0 {
        left.extend_from_slice(right);
        return left;
    }
    let suffix_start = left.len() - window;
    let suffix = &left[suffix_start..];
    let prefix = &right[..window];

    let score = |a: u8, b: u8| if a == b { 1i32 } else { -1i32 };
    let mut aligner = Aligner::with_capacity(suffix.len(), prefix.len(), -2, -1, &score);
    let alignment = aligner.global(suffix, prefix);

    // Walk the traceback; cut at the match column nearest the midpoint.
    let target = alignment.operations.len() / 2;
    let mut xi = 0usize;
    let mut yi = 0usize;
    let mut cut: Option<(usize, usize, usize)> = None; // (distance, x, y)
    for (idx, op) in alignment.operations.iter().enumerate() {
        match op {
            AlignmentOperation::Match => {
                xi += 1;
                yi += 1;
                let distance = idx.abs_diff(target);
                if cut.map_or(true, |(d, _, _)| distance < d) {
                    cut = Some((distance, xi, yi));
                }
            }
            AlignmentOperation::Subst => {
                xi += 1;
                yi += 1;
            }
            AlignmentOperation::Ins => xi += 1,
            AlignmentOperation::Del => yi += 1,
            AlignmentOperation::Xclip(n) => xi += n,
            AlignmentOperation::Yclip(n) => yi += n,
        }
    }
    let (x_cut, y_cut) = match cut {
        Some((_, x, y)) => (x, y),
        // No matching column anywhere in the overlap: cut both windows in
        // the middle.
        None => (window / 2, window / 2),
    };

    left.truncate(suffix_start + x_cut);
    left.extend_from_slice(&right[y_cut..]);
    left
}

/// Reference-space overlap between successive chunks.
fn chunk_overlap(prev: &Chunk, next: &Chunk) -> usize {
    prev.boundary_end.saturating_sub(next.boundary_start)
}

/// Merge the ordered chunk consensuses of one contig. A single chunk is
/// returned unchanged.
pub fn stitch_contig(chunks: &[&Chunk], sequences: &[Vec<u8>]) -> Vec<u8> {
    assert_eq!(chunks.len(), sequences.len());
    let mut merged = sequences[0].clone();
    for k in 1..sequences.len() {
        let overlap = chunk_overlap(chunks[k - 1], chunks[k]);
        debug!(
            "stitching chunk {} onto contig {} (overlap {} bp)",
            chunks[k].index, chunks[k].contig, overlap
        );
        merged = splice(merged, &sequences[k], overlap);
    }
    merged
}

/// One chunk's diploid output as seen by the stitcher.
pub struct DiploidChunkOutput<'a> {
    pub h1: &'a [u8],
    pub h2: &'a [u8],
    pub reads_h1: &'a FxHashSet<String>,
    pub reads_h2: &'a FxHashSet<String>,
}

fn overlap_count(a: &FxHashSet<String>, b: &FxHashSet<String>) -> usize {
    if a.len() > b.len() {
        return overlap_count(b, a);
    }
    a.iter().filter(|name| b.contains(*name)).count()
}

/// Haplotype labels of successive chunks are arbitrary: decide per chunk
/// whether to swap its two streams so that reads shared with the previous
/// chunk stay in the same stream. Ties favour no flip.
pub fn resolve_haplotype_flips(parts: &[DiploidChunkOutput]) -> Vec<bool> {
    let mut flips = Vec::with_capacity(parts.len());
    flips.push(false);
    for k in 1..parts.len() {
        let prev = &parts[k - 1];
        let prev_flipped = flips[k - 1];
        let (prev_h1, prev_h2) = if prev_flipped {
            (prev.reads_h2, prev.reads_h1)
        } else {
            (prev.reads_h1, prev.reads_h2)
        };
        let next = &parts[k];
        let straight =
            overlap_count(prev_h1, next.reads_h1) + overlap_count(prev_h2, next.reads_h2);
        let crossed =
            overlap_count(prev_h1, next.reads_h2) + overlap_count(prev_h2, next.reads_h1);
        flips.push(crossed > straight);
    }
    flips
}

/// Merge the ordered diploid chunk outputs of one contig into the two
/// haplotype sequences.
pub fn stitch_contig_diploid(
    chunks: &[&Chunk],
    parts: &[DiploidChunkOutput],
) -> (Vec<u8>, Vec<u8>) {
    assert_eq!(chunks.len(), parts.len());
    let flips = resolve_haplotype_flips(parts);
    let stream = |first: bool| -> Vec<Vec<u8>> {
        parts
            .iter()
            .zip(&flips)
            .map(|(part, &flip)| {
                let take_h1 = first != flip;
                if take_h1 {
                    part.h1.to_vec()
                } else {
                    part.h2.to_vec()
                }
            })
            .collect()
    };
    let h1 = stitch_contig(chunks, &stream(true));
    let h2 = stitch_contig(chunks, &stream(false));
    (h1, h2)
}

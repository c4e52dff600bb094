//! Coverage capping by random read retention.
//!
//! The retained set is deterministic: the RNG is seeded with the chunk
//! index, so re-running a chunk (or the whole assembly) reproduces the same
//! downsampling decisions.

use crate::reads::{ChunkRead, ReadAlignment};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Aligned reference span of one alignment, in window run units.
fn aligned_ref_len(alignment: &ReadAlignment) -> usize {
    match (alignment.first(), alignment.last()) {
        (Some(first), Some(last)) => (last.ref_offset - first.ref_offset) as usize + 1,
        _ => 0,
    }
}

/// Cap approximate depth at `max_depth` by retaining each read independently
/// with probability `max_depth / depth`. Retained reads stay in
/// `reads`/`alignments`; the rejected partition is returned. `None` means
/// the chunk was already at or below the target and nothing changed.
pub fn downsample(
    max_depth: u64,
    chunk_index: usize,
    window_len: usize,
    reads: &mut Vec<ChunkRead>,
    alignments: &mut Vec<ReadAlignment>,
) -> Option<(Vec<ChunkRead>, Vec<ReadAlignment>)> {
    if max_depth == 0 || window_len == 0 {
        return None;
    }
    let total_aligned: usize = alignments.iter().map(aligned_ref_len).sum();
    let depth = total_aligned as f64 / window_len as f64;
    if depth <= max_depth as f64 {
        return None;
    }

    let keep_probability = max_depth as f64 / depth;
    let mut rng = StdRng::seed_from_u64(chunk_index as u64);

    let mut filtered_reads = Vec::new();
    let mut filtered_alignments = Vec::new();
    let mut discarded_reads = Vec::new();
    let mut discarded_alignments = Vec::new();
    for (read, alignment) in reads.drain(..).zip(alignments.drain(..)) {
        if rng.gen::<f64>() < keep_probability {
            filtered_reads.push(read);
            filtered_alignments.push(alignment);
        } else {
            discarded_reads.push(read);
            discarded_alignments.push(alignment);
        }
    }
    info!(
        "chunk {}: downsampled from {} to {} reads (depth {:.1} > {})",
        chunk_index,
        filtered_reads.len() + discarded_reads.len(),
        filtered_reads.len(),
        depth,
        max_depth
    );
    *reads = filtered_reads;
    *alignments = filtered_alignments;
    Some((discarded_reads, discarded_alignments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reads::AlignedPair;
    use crate::rle::RleString;

    fn make_read(name: &str) -> ChunkRead {
        ChunkRead {
            name: name.to_string(),
            rle: RleString::compress(b"ACGT"),
            forward: true,
            soft_clip_start: 0,
            soft_clip_end: 0,
        }
    }

    fn full_span_alignment(len: u32) -> ReadAlignment {
        (0..len)
            .map(|i| AlignedPair {
                read_offset: i,
                ref_offset: i,
                weight: 1.0,
            })
            .collect()
    }

    #[test]
    fn test_under_target_not_downsampled() {
        let mut reads = vec![make_read("r1"), make_read("r2")];
        let mut alignments = vec![full_span_alignment(100), full_span_alignment(100)];
        assert!(downsample(10, 0, 100, &mut reads, &mut alignments).is_none());
        assert_eq!(reads.len(), 2);
        assert_eq!(alignments.len(), 2);
    }

    #[test]
    fn test_zero_depth_disables() {
        let mut reads: Vec<ChunkRead> = (0..50).map(|i| make_read(&format!("r{}", i))).collect();
        let mut alignments = vec![full_span_alignment(100); 50];
        assert!(downsample(0, 0, 100, &mut reads, &mut alignments).is_none());
        assert_eq!(reads.len(), 50);
    }

    #[test]
    fn test_over_target_partitions_all_reads() {
        let n = 100;
        let mut reads: Vec<ChunkRead> = (0..n).map(|i| make_read(&format!("r{}", i))).collect();
        let mut alignments = vec![full_span_alignment(100); n];
        let (discarded_reads, discarded_alignments) =
            downsample(10, 3, 100, &mut reads, &mut alignments).unwrap();
        assert_eq!(reads.len() + discarded_reads.len(), n);
        assert_eq!(reads.len(), alignments.len());
        assert_eq!(discarded_reads.len(), discarded_alignments.len());
        assert!(!reads.is_empty());
        assert!(!discarded_reads.is_empty());
    }

    #[test]
    fn test_deterministic_for_chunk_index() {
        let build = || {
            let reads: Vec<ChunkRead> = (0..80).map(|i| make_read(&format!("r{}", i))).collect();
            let alignments = vec![full_span_alignment(100); 80];
            (reads, alignments)
        };
        let (mut r1, mut a1) = build();
        let (mut r2, mut a2) = build();
        downsample(5, 7, 100, &mut r1, &mut a1).unwrap();
        downsample(5, 7, 100, &mut r2, &mut a2).unwrap();
        let names1: Vec<&str> = r1.iter().map(|r| r.name.as_str()).collect();
        let names2: Vec<&str> = r2.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names1, names2);

        // A different chunk index yields a different (but still
        // deterministic) retained set in general.
        let (mut r3, mut a3) = build();
        downsample(5, 8, 100, &mut r3, &mut a3).unwrap();
        let names3: Vec<&str> = r3.iter().map(|r| r.name.as_str()).collect();
        assert_ne!(names1, names3);
    }
}

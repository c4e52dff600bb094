//! Materialisation of reads and per-base alignments for one chunk.
//!
//! A read is owned by the chunk whose inner window contains its alignment
//! midpoint; its alignment is truncated to the chunk's padded boundary
//! window. When run-length encoding is active both the read and the
//! alignment are expressed in RLE coordinates.

use crate::chunk::Chunk;
use crate::error::{PolishError, Result};
use crate::params::Params;
use crate::rle::RleString;
use log::debug;
use rust_htslib::bam::record::Cigar;
use rust_htslib::bam::{self, Read};

/// One read materialised for a chunk.
#[derive(Debug, Clone)]
pub struct ChunkRead {
    pub name: String,
    /// Read bases covering the chunk window, RLE-compressed when RLE is on.
    pub rle: RleString,
    /// Forward-strand flag (the stored sequence is always reference
    /// oriented).
    pub forward: bool,
    /// Soft-clip lengths at the original alignment ends, for diagnostics.
    pub soft_clip_start: usize,
    pub soft_clip_end: usize,
}

/// One aligned column: read run index vs window-relative reference run
/// index. Offsets are RLE coordinates when RLE is active.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignedPair {
    pub read_offset: u32,
    pub ref_offset: u32,
    pub weight: f64,
}

pub type ReadAlignment = Vec<AlignedPair>;

/// Raw CIGAR walk result, in expanded coordinates.
#[derive(Debug, Default)]
pub struct CigarWalk {
    /// Matched (read, reference) columns with the reference position inside
    /// the window. Matches and mismatches both count; only matches and
    /// deletions consume reference, only matches, insertions and soft clips
    /// consume query.
    pub pairs: Vec<(usize, usize)>,
    pub aligned_ref_start: usize,
    pub aligned_ref_end: usize,
    pub soft_clip_start: usize,
    pub soft_clip_end: usize,
}

/// Walk a CIGAR from reference position `pos`, collecting matched columns
/// whose reference coordinate falls in `[window_start, window_end)`.
pub fn walk_cigar(cigar: &[Cigar], pos: usize, window_start: usize, window_end: usize) -> CigarWalk {
    let mut walk = CigarWalk {
        aligned_ref_start: pos,
        aligned_ref_end: pos,
        ..CigarWalk::default()
    };
    let mut read_pos = 0usize;
    let mut ref_pos = pos;
    let mut seen_aligned = false;

    for op in cigar {
        match *op {
            Cigar::Match(len) | Cigar::Equal(len) | Cigar::Diff(len) => {
                for _ in 0..len {
                    if ref_pos >= window_start && ref_pos < window_end {
                        walk.pairs.push((read_pos, ref_pos));
                    }
                    read_pos += 1;
                    ref_pos += 1;
                }
                seen_aligned = true;
            }
            Cigar::Ins(len) => {
                read_pos += len as usize;
                seen_aligned = true;
            }
            Cigar::Del(len) | Cigar::RefSkip(len) => {
                ref_pos += len as usize;
                seen_aligned = true;
            }
            Cigar::SoftClip(len) => {
                if seen_aligned {
                    walk.soft_clip_end = len as usize;
                } else {
                    walk.soft_clip_start = len as usize;
                }
                read_pos += len as usize;
            }
            Cigar::HardClip(_) | Cigar::Pad(_) => {}
        }
    }
    walk.aligned_ref_end = ref_pos;
    walk
}

/// Convert one BAM record into a chunk read and alignment, or None when the
/// record does not belong to this chunk.
pub fn read_from_record(
    record: &bam::Record,
    chunk: &Chunk,
    ref_run_map: &[usize],
    params: &Params,
) -> Option<(ChunkRead, ReadAlignment)> {
    convert_record(record, chunk, ref_run_map, params, true)
}

/// Like `read_from_record`, but keeps any record intersecting the window
/// regardless of midpoint ownership. Used for true-reference label tracks,
/// where a single contig-spanning record must surface in every chunk it
/// crosses.
pub fn spanning_read_from_record(
    record: &bam::Record,
    chunk: &Chunk,
    ref_run_map: &[usize],
    params: &Params,
) -> Option<(ChunkRead, ReadAlignment)> {
    convert_record(record, chunk, ref_run_map, params, false)
}

fn convert_record(
    record: &bam::Record,
    chunk: &Chunk,
    ref_run_map: &[usize],
    params: &Params,
    require_midpoint: bool,
) -> Option<(ChunkRead, ReadAlignment)> {
    if record.is_unmapped()
        || record.is_secondary()
        || record.is_supplementary()
        || record.is_duplicate()
        || record.is_quality_check_failed()
    {
        return None;
    }

    let cigar: Vec<Cigar> = record.cigar().iter().copied().collect();
    let pos = record.pos().max(0) as usize;
    let walk = walk_cigar(&cigar, pos, chunk.boundary_start, chunk.boundary_end);
    if walk.pairs.is_empty() {
        return None;
    }

    // Reads spanning chunk boundaries belong to the chunk whose inner window
    // contains the alignment midpoint.
    if require_midpoint {
        let midpoint = (walk.aligned_ref_start + walk.aligned_ref_end) / 2;
        if midpoint < chunk.inner_start || midpoint >= chunk.inner_end {
            return None;
        }
    }

    let seq = record.seq().as_bytes();
    let (first_read, _) = walk.pairs[0];
    let (last_read, _) = *walk.pairs.last().unwrap();

    // With the boundary-at-match policy the read starts and ends at matched
    // columns. Otherwise adjacent unaligned read bases (leading/trailing
    // insertions and soft clips) are carried along and will surface as
    // terminal inserts in the POA.
    let (slice_start, slice_end) = if params.require_match_boundaries {
        (first_read, last_read + 1)
    } else {
        // Only carry unaligned flanks that end inside the window; bases
        // aligned beyond the window belong to the neighbouring chunk.
        let start = if walk.aligned_ref_start >= chunk.boundary_start {
            0
        } else {
            first_read
        };
        let end = if walk.aligned_ref_end <= chunk.boundary_end {
            seq.len()
        } else {
            last_read + 1
        };
        (start, end)
    };

    let trimmed: Vec<u8> = seq[slice_start..slice_end]
        .iter()
        .map(|b| b.to_ascii_uppercase())
        .collect();
    let rle = RleString::new(params.use_run_length_encoding, &trimmed);
    let read_run_map = rle.position_map();

    // Project matched columns into run space. A raw run spans several
    // columns, so successive columns can repeat a run index; an aligned pair
    // must advance both the read run and the reference run to keep the run
    // alignment one-to-one.
    let mut alignment: ReadAlignment = Vec::with_capacity(walk.pairs.len());
    for &(read_raw, ref_raw) in &walk.pairs {
        let read_offset = read_run_map[read_raw - slice_start] as u32;
        let ref_offset = ref_run_map[ref_raw - chunk.boundary_start] as u32;
        match alignment.last() {
            Some(last) if read_offset <= last.read_offset || ref_offset <= last.ref_offset => {}
            _ => alignment.push(AlignedPair {
                read_offset,
                ref_offset,
                weight: 1.0,
            }),
        }
    }

    let read = ChunkRead {
        name: String::from_utf8_lossy(record.qname()).to_string(),
        rle,
        forward: !record.is_reverse(),
        soft_clip_start: walk.soft_clip_start,
        soft_clip_end: walk.soft_clip_end,
    };
    Some((read, alignment))
}

/// Load all reads and alignments for a chunk from an indexed BAM.
pub fn load_chunk_reads(
    bam_path: &str,
    chunk: &Chunk,
    window_ref: &RleString,
    params: &Params,
) -> Result<(Vec<ChunkRead>, Vec<ReadAlignment>)> {
    load_reads(bam_path, chunk, window_ref, params, true)
}

/// Load every record intersecting the chunk window, without the midpoint
/// ownership rule (true-reference label tracks).
pub fn load_spanning_reads(
    bam_path: &str,
    chunk: &Chunk,
    window_ref: &RleString,
    params: &Params,
) -> Result<(Vec<ChunkRead>, Vec<ReadAlignment>)> {
    load_reads(bam_path, chunk, window_ref, params, false)
}

fn load_reads(
    bam_path: &str,
    chunk: &Chunk,
    window_ref: &RleString,
    params: &Params,
    require_midpoint: bool,
) -> Result<(Vec<ChunkRead>, Vec<ReadAlignment>)> {
    let mut reader = bam::IndexedReader::from_path(bam_path).map_err(|e| {
        PolishError::InputUnavailable(format!("alignment file {} is not indexed: {}", bam_path, e))
    })?;
    reader
        .fetch((
            chunk.contig.as_str(),
            chunk.boundary_start as i64,
            chunk.boundary_end as i64,
        ))
        .map_err(|e| {
            PolishError::chunk_failure(
                &chunk.contig,
                chunk.index,
                chunk.boundary_start,
                chunk.boundary_end,
                e,
            )
        })?;

    let ref_run_map = window_ref.position_map();
    let mut reads = Vec::new();
    let mut alignments = Vec::new();
    let mut record = bam::Record::new();
    while let Some(result) = reader.read(&mut record) {
        result.map_err(|e| {
            PolishError::chunk_failure(
                &chunk.contig,
                chunk.index,
                chunk.boundary_start,
                chunk.boundary_end,
                e,
            )
        })?;
        if let Some((read, alignment)) =
            convert_record(&record, chunk, &ref_run_map, params, require_midpoint)
        {
            reads.push(read);
            alignments.push(alignment);
        }
    }
    debug!(
        "chunk {} ({}:{}-{}): {} reads materialised",
        chunk.index,
        chunk.contig,
        chunk.boundary_start,
        chunk.boundary_end,
        reads.len()
    );
    Ok((reads, alignments))
}

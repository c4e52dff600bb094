//! Chunking of the reference coordinate space.
//!
//! A chunk is the unit of work: an inner window `[inner_start, inner_end)`
//! the chunk is authoritative for, padded on both sides by a boundary region
//! shared with its neighbours so that consensuses can be stitched. Inner
//! windows tile each contig (or the requested region) exactly once.

use crate::error::{PolishError, Result};
use log::info;
use rust_htslib::bam::{self, Read};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub contig: String,
    pub contig_len: usize,
    pub boundary_start: usize,
    pub inner_start: usize,
    pub inner_end: usize,
    pub boundary_end: usize,
    pub index: usize,
}

impl Chunk {
    /// Length of the padded window this chunk materialises reads for.
    pub fn boundary_len(&self) -> usize {
        self.boundary_end - self.boundary_start
    }
}

/// Verify a BAM exists and has an index, without keeping a handle open.
pub fn ensure_indexed_bam(bam_path: &str) -> Result<()> {
    if !Path::new(bam_path).exists() {
        return Err(PolishError::InputUnavailable(format!(
            "could not read alignment file {}",
            bam_path
        )));
    }
    bam::IndexedReader::from_path(bam_path).map_err(|e| {
        PolishError::InputUnavailable(format!(
            "alignment file {} is not indexed: {}",
            bam_path, e
        ))
    })?;
    Ok(())
}

pub struct Chunker {
    chunks: Vec<Chunk>,
    contigs: Vec<(String, usize)>,
}

impl Chunker {
    /// Build chunks for all indexed contigs of a BAM, or for a single region
    /// `contig[:start-end]`. The BAM must be indexed; a missing index is
    /// fatal at startup.
    pub fn from_bam(
        bam_path: &str,
        region: Option<&str>,
        chunk_size: usize,
        chunk_boundary: usize,
    ) -> Result<Self> {
        if !Path::new(bam_path).exists() {
            return Err(PolishError::InputUnavailable(format!(
                "could not read alignment file {}",
                bam_path
            )));
        }
        let reader = bam::IndexedReader::from_path(bam_path).map_err(|e| {
            PolishError::InputUnavailable(format!(
                "alignment file {} is not indexed: {}",
                bam_path, e
            ))
        })?;

        let header = reader.header();
        let mut contigs = Vec::with_capacity(header.target_count() as usize);
        for tid in 0..header.target_count() {
            let name = String::from_utf8_lossy(header.tid2name(tid)).to_string();
            let len = header.target_len(tid).unwrap_or(0) as usize;
            contigs.push((name, len));
        }

        let regions = match region {
            Some(r) => {
                let (contig, range) = parse_region(r)?;
                let len = contigs
                    .iter()
                    .find(|(name, _)| *name == contig)
                    .map(|(_, len)| *len)
                    .ok_or_else(|| {
                        PolishError::InputMismatch(format!(
                            "region contig {} is not present in the alignment header",
                            contig
                        ))
                    })?;
                let (start, end) = match range {
                    Some((s, e)) => (s.min(len), e.min(len)),
                    None => (0, len),
                };
                vec![(contig, len, start, end)]
            }
            None => contigs
                .iter()
                .map(|(name, len)| (name.clone(), *len, 0, *len))
                .collect(),
        };

        let chunks = build_chunks(&regions, chunk_size, chunk_boundary);
        if chunks.is_empty() {
            return Err(PolishError::EmptyCoverage("no valid reads".to_string()));
        }
        info!(
            "Set up chunker with chunk size {} and boundary {} (region={}): {} chunks",
            chunk_size,
            chunk_boundary,
            region.unwrap_or("all"),
            chunks.len()
        );
        Ok(Chunker { chunks, contigs })
    }

    pub fn get(&self, index: usize) -> &Chunk {
        &self.chunks[index]
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn contigs(&self) -> &[(String, usize)] {
        &self.contigs
    }
}

/// Emit chunks for `(contig, contig_len, start, end)` regions: inner windows
/// of length `chunk_size` at stride `chunk_size`, padded by `chunk_boundary`
/// on both sides. The first chunk of a region gets no left padding and the
/// last no right padding; middle chunks clamp padding to contig bounds.
pub fn build_chunks(
    regions: &[(String, usize, usize, usize)],
    chunk_size: usize,
    chunk_boundary: usize,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for (contig, contig_len, start, end) in regions {
        if start >= end {
            continue;
        }
        let mut pos = *start;
        while pos < *end {
            let inner_end = (pos + chunk_size).min(*end);
            let first = pos == *start;
            let last = inner_end == *end;
            let boundary_start = if first {
                pos
            } else {
                pos.saturating_sub(chunk_boundary)
            };
            let boundary_end = if last {
                inner_end
            } else {
                (inner_end + chunk_boundary).min(*contig_len)
            };
            chunks.push(Chunk {
                contig: contig.clone(),
                contig_len: *contig_len,
                boundary_start,
                inner_start: pos,
                inner_end,
                boundary_end,
                index: chunks.len(),
            });
            pos = inner_end;
        }
    }
    chunks
}

/// Parse `contig` or `contig:start-end` (end exclusive).
pub fn parse_region(region: &str) -> Result<(String, Option<(usize, usize)>)> {
    match region.rsplit_once(':') {
        None => Ok((region.to_string(), None)),
        Some((contig, range)) => {
            let (start, end) = range.split_once('-').ok_or_else(|| {
                PolishError::InputMismatch(format!(
                    "region format should be contig:start-end, got {}",
                    region
                ))
            })?;
            let start: usize = start.parse().map_err(|_| {
                PolishError::InputMismatch(format!("invalid region start in {}", region))
            })?;
            let end: usize = end.parse().map_err(|_| {
                PolishError::InputMismatch(format!("invalid region end in {}", region))
            })?;
            if start >= end {
                return Err(PolishError::InputMismatch(format!(
                    "region start must be less than end in {}",
                    region
                )));
            }
            Ok((contig.to_string(), Some((start, end))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions(len: usize) -> Vec<(String, usize, usize, usize)> {
        vec![("ctg".to_string(), len, 0, len)]
    }

    #[test]
    fn test_inner_windows_tile_exactly() {
        let chunks = build_chunks(&regions(2500), 1000, 100);
        assert_eq!(chunks.len(), 3);
        let mut covered = 0;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.inner_start, covered);
            covered = c.inner_end;
            assert_eq!(c.index, i);
            assert!(c.boundary_start <= c.inner_start);
            assert!(c.inner_start <= c.inner_end);
            assert!(c.inner_end <= c.boundary_end);
        }
        assert_eq!(covered, 2500);
    }

    #[test]
    fn test_boundary_padding_rules() {
        let chunks = build_chunks(&regions(3000), 1000, 100);
        // First chunk: no left padding.
        assert_eq!(chunks[0].boundary_start, chunks[0].inner_start);
        assert_eq!(chunks[0].boundary_end, 1100);
        // Middle chunk: padded both sides.
        assert_eq!(chunks[1].boundary_start, 900);
        assert_eq!(chunks[1].boundary_end, 2100);
        // Last chunk: no right padding.
        assert_eq!(chunks[2].boundary_start, 1900);
        assert_eq!(chunks[2].boundary_end, chunks[2].inner_end);
        // Neighbour relationship used by the stitcher.
        for pair in chunks.windows(2) {
            assert!(pair[1].boundary_start <= pair[0].inner_end);
            assert_eq!(pair[1].inner_start, pair[0].inner_end);
        }
    }

    #[test]
    fn test_short_contig_single_chunk() {
        let chunks = build_chunks(&regions(500), 1000, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].boundary_start, 0);
        assert_eq!(chunks[0].boundary_end, 500);
    }

    #[test]
    fn test_multiple_contigs_in_order() {
        let regions = vec![
            ("a".to_string(), 1500, 0, 1500),
            ("b".to_string(), 800, 0, 800),
        ];
        let chunks = build_chunks(&regions, 1000, 50);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].contig, "a");
        assert_eq!(chunks[1].contig, "a");
        assert_eq!(chunks[2].contig, "b");
        assert_eq!(chunks[2].index, 2);
    }

    #[test]
    fn test_region_subset_padding_clamps_to_contig() {
        // A region in the middle of a longer contig: first/last chunks of the
        // region get no padding by the first/last rule.
        let regions = vec![("ctg".to_string(), 10_000, 2000, 4000)];
        let chunks = build_chunks(&regions, 1000, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].inner_start, 2000);
        assert_eq!(chunks[0].boundary_start, 2000);
        assert_eq!(chunks[0].boundary_end, 3100);
        assert_eq!(chunks[1].boundary_start, 2900);
        assert_eq!(chunks[1].boundary_end, 4000);
    }

    #[test]
    fn test_parse_region() {
        assert_eq!(parse_region("chr1").unwrap(), ("chr1".to_string(), None));
        assert_eq!(
            parse_region("chr3:2000-3000").unwrap(),
            ("chr3".to_string(), Some((2000, 3000)))
        );
        assert!(parse_region("chr3:3000-2000").is_err());
        assert!(parse_region("chr3:xyz").is_err());
    }
}

//! The polishing pipeline: chunk-parallel dispatch, per-chunk processing
//! (load, downsample, POA, run-length re-estimation, optional phasing), and
//! per-contig stitching of results.
//!
//! Chunks are independent: each worker runs the whole per-chunk pipeline and
//! stores its result by chunk index, so worker completion order (and the
//! optional shuffled dispatch order) never affects the output. The first
//! fatal chunk error aborts the run.

use crate::bubble::find_bubbles;
use crate::chunk::{ensure_indexed_bam, Chunk, Chunker};
use crate::downsample::downsample;
use crate::error::{PolishError, Result};
use crate::fasta;
use crate::features::{
    emit_chunk_features, truth_labels_for_consensus, validate_feature_params,
    DiploidFeatureInput, FeatureKind,
};
use crate::outputs;
use crate::params::Params;
use crate::phase::{phase_bubble_graph, HaplotypeAssignment};
use crate::poa::{banded_align, run_poa, Consensus, Poa};
use crate::reads::{load_chunk_reads, ChunkRead, ReadAlignment};
use crate::repeats::{estimate_repeat_counts, RepeatSubMatrix};
use crate::rle::RleString;
use crate::stitch::{stitch_contig, stitch_contig_diploid, DiploidChunkOutput};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Run-level configuration assembled from the command line.
pub struct PolishConfig {
    pub bam: String,
    pub reference: String,
    pub output_base: String,
    pub region: Option<String>,
    pub diploid: bool,
    pub poa_dot_base: Option<String>,
    pub poa_tsv_base: Option<String>,
    pub repeat_counts_base: Option<String>,
    pub haplotype_reads_base: Option<String>,
    pub haplotype_bam_base: Option<String>,
    pub feature_kind: Option<FeatureKind>,
    pub feature_max_run_length: Option<usize>,
    /// True reference aligned to the assembly, for feature labels. One BAM
    /// in haploid mode, two (hap1, hap2) in diploid mode.
    pub true_reference_bams: Option<Vec<String>>,
}

/// One chunk's polished output.
pub struct ChunkResult {
    pub index: usize,
    pub h1: Vec<u8>,
    pub h2: Option<Vec<u8>>,
    pub reads_h1: FxHashSet<String>,
    pub reads_h2: FxHashSet<String>,
    pub read_count: usize,
}

/// Polish the assembly: the top-level entry point below `main`.
pub fn run_polish(config: &PolishConfig, params: &Params) -> Result<()> {
    params.validate()?;
    validate_feature_params(config.feature_kind, params)?;
    if let Some(truths) = &config.true_reference_bams {
        if config.feature_kind.is_none() {
            warn!("--true-reference-bam is only used for feature labels; no feature type requested");
        }
        let expected = if config.diploid { 2 } else { 1 };
        if truths.len() != expected {
            return Err(PolishError::ParameterInconsistent(format!(
                "--true-reference-bam expects {} comma-separated value(s) in {} mode, got {}",
                expected,
                if config.diploid { "diploid" } else { "haploid" },
                truths.len()
            )));
        }
        for path in truths {
            ensure_indexed_bam(path)?;
        }
    }

    let reference_map = fasta::read_reference_map(&config.reference)?;
    let chunker = Chunker::from_bam(
        &config.bam,
        config.region.as_deref(),
        params.chunk_size,
        params.chunk_boundary,
    )?;
    let matrix = RepeatSubMatrix::from_params(params)?;

    let total = chunker.len();
    let mut order: Vec<usize> = (0..total).collect();
    if params.shuffle_chunks {
        // Evens out stragglers across workers; the result array is indexed
        // by chunk, so the order cannot affect any output.
        let mut rng = StdRng::seed_from_u64(total as u64);
        order.shuffle(&mut rng);
        debug!("shuffled dispatch order of {} chunks", total);
    }

    let completed = AtomicUsize::new(0);
    let chunk_results: Result<Vec<ChunkResult>> = order
        .par_iter()
        .map(|&index| {
            let result = process_chunk(chunker.get(index), config, params, &matrix, &reference_map);
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            let percent = done * 100 / total;
            if percent != (done - 1) * 100 / total {
                info!("Polishing {:2}% complete ({}/{})", percent, done, total);
            }
            result
        })
        .collect();

    let mut by_index: Vec<Option<ChunkResult>> = (0..total).map(|_| None).collect();
    for result in chunk_results? {
        let index = result.index;
        by_index[index] = Some(result);
    }
    let results: Vec<ChunkResult> = by_index
        .into_iter()
        .map(|r| r.expect("every chunk produces exactly one result"))
        .collect();

    if results.iter().map(|r| r.read_count).sum::<usize>() == 0 {
        return Err(PolishError::EmptyCoverage("no valid reads".to_string()));
    }

    // Group chunks into per-contig runs; chunker order is contig order.
    let mut contigs: Vec<(String, Vec<usize>)> = Vec::new();
    for chunk in chunker.chunks() {
        match contigs.last_mut() {
            Some((name, indices)) if *name == chunk.contig => indices.push(chunk.index),
            _ => contigs.push((chunk.contig.clone(), vec![chunk.index])),
        }
    }

    info!(
        "Merging polished sequences from {} chunks across {} contigs",
        total,
        contigs.len()
    );
    let merged: Vec<(String, Vec<u8>, Option<Vec<u8>>)> = contigs
        .par_iter()
        .map(|(name, indices)| {
            let chunk_refs: Vec<&Chunk> = indices.iter().map(|&i| chunker.get(i)).collect();
            if config.diploid {
                let parts: Vec<DiploidChunkOutput> = indices
                    .iter()
                    .map(|&i| DiploidChunkOutput {
                        h1: &results[i].h1,
                        h2: results[i]
                            .h2
                            .as_deref()
                            .expect("diploid chunk result always has h2"),
                        reads_h1: &results[i].reads_h1,
                        reads_h2: &results[i].reads_h2,
                    })
                    .collect();
                let (h1, h2) = stitch_contig_diploid(&chunk_refs, &parts);
                (name.clone(), h1, Some(h2))
            } else {
                let sequences: Vec<Vec<u8>> =
                    indices.iter().map(|&i| results[i].h1.clone()).collect();
                (name.clone(), stitch_contig(&chunk_refs, &sequences), None)
            }
        })
        .collect();

    if config.diploid {
        let path_h1 = format!("{}.h1.fa", config.output_base);
        let path_h2 = format!("{}.h2.fa", config.output_base);
        info!("Writing polished reference (H1) to {}", path_h1);
        info!("Writing polished reference (H2) to {}", path_h2);
        let records_h1: Vec<(String, Vec<u8>)> = merged
            .iter()
            .map(|(name, h1, _)| (name.clone(), h1.clone()))
            .collect();
        let records_h2: Vec<(String, Vec<u8>)> = merged
            .iter()
            .map(|(name, _, h2)| (name.clone(), h2.clone().unwrap()))
            .collect();
        fasta::write_fasta(&path_h1, &records_h1)?;
        fasta::write_fasta(&path_h2, &records_h2)?;
    } else {
        let path = format!("{}.fa", config.output_base);
        info!("Writing polished reference to {}", path);
        let records: Vec<(String, Vec<u8>)> = merged
            .into_iter()
            .map(|(name, h1, _)| (name, h1))
            .collect();
        fasta::write_fasta(&path, &records)?;
    }
    Ok(())
}

/// The per-chunk pipeline (§ loader through phaser); runs on one worker.
fn process_chunk(
    chunk: &Chunk,
    config: &PolishConfig,
    params: &Params,
    matrix: &RepeatSubMatrix,
    reference_map: &FxHashMap<String, Vec<u8>>,
) -> Result<ChunkResult> {
    let full_reference = reference_map.get(&chunk.contig).ok_or_else(|| {
        PolishError::InputMismatch(format!(
            "reference sequence {} missing from reference map; perhaps the alignment and reference are mismatched?",
            chunk.contig
        ))
    })?;
    if chunk.boundary_start > full_reference.len() {
        return Err(PolishError::InputMismatch(format!(
            "reference sequence {} has length {} but chunk {} starts at {}; perhaps the alignment and reference are mismatched?",
            chunk.contig,
            full_reference.len(),
            chunk.index,
            chunk.boundary_start
        )));
    }
    let window_end = chunk.boundary_end.min(full_reference.len());
    let raw_window = &full_reference[chunk.boundary_start..window_end];
    let window_ref = RleString::new(params.use_run_length_encoding, raw_window);

    let (mut reads, mut alignments) = load_chunk_reads(&config.bam, chunk, &window_ref, params)?;
    let read_count_before = reads.len();
    if params.max_depth > 0 {
        if let Some((discarded, _)) = downsample(
            params.max_depth,
            chunk.index,
            window_ref.len(),
            &mut reads,
            &mut alignments,
        ) {
            debug!(
                "chunk {}: discarded {} reads while downsampling",
                chunk.index,
                discarded.len()
            );
        }
    }

    info!(
        "chunk {} ({}:{}-{}): polishing with {} reads",
        chunk.index, chunk.contig, chunk.boundary_start, chunk.boundary_end, reads.len()
    );

    let (poa, final_alignments) = run_poa(
        &reads,
        &alignments,
        &window_ref,
        params.use_run_length_encoding,
        &params.poa,
    );

    if let Some(base) = &config.poa_dot_base {
        outputs::write_poa_dot(base, chunk, &poa)?;
    }
    if let Some(base) = &config.poa_tsv_base {
        outputs::write_poa_tsv(base, chunk, &poa)?;
    }
    let mut consensus = poa.consensus();
    if let Some(base) = &config.repeat_counts_base {
        outputs::write_repeat_counts_tsv(base, chunk, &poa, &consensus)?;
    }

    if !config.diploid {
        if params.use_run_length_encoding {
            estimate_repeat_counts(&poa, &mut consensus, matrix, None);
        }
        if let Some(kind) = config.feature_kind {
            let max_rl = config
                .feature_max_run_length
                .unwrap_or_else(|| kind.default_max_run_length());
            let labels = match config.true_reference_bams.as_deref() {
                Some([truth]) => Some(truth_labels_for_consensus(
                    truth,
                    chunk,
                    &window_ref,
                    &consensus,
                    params,
                )?),
                _ => None,
            };
            emit_chunk_features(
                kind,
                &config.output_base,
                max_rl,
                chunk,
                &poa,
                &consensus,
                &reads,
                labels.as_deref(),
                None,
            )?;
        }
        return Ok(ChunkResult {
            index: chunk.index,
            h1: consensus.rle.expand(),
            h2: None,
            reads_h1: FxHashSet::default(),
            reads_h2: FxHashSet::default(),
            read_count: read_count_before,
        });
    }

    // Diploid branch: bubbles, phasing, one POA per haplotype.
    let graph = find_bubbles(
        &poa,
        consensus,
        &reads,
        &params.poa,
        params.use_read_alleles_in_phasing,
    );
    let (fragment, assignment) = phase_bubble_graph(&graph, reads.len(), &params.phaser);
    let phased_h1 = assignment
        .iter()
        .filter(|&&a| a == HaplotypeAssignment::Hap1)
        .count();
    let phased_h2 = assignment
        .iter()
        .filter(|&&a| a == HaplotypeAssignment::Hap2)
        .count();
    info!(
        "chunk {}: {} bubbles; {} reads in hap1, {} in hap2, {} unphased",
        chunk.index,
        fragment.length,
        phased_h1,
        phased_h2,
        reads.len() - phased_h1 - phased_h2
    );

    let (poa_h1, consensus_h1) = polish_haplotype(
        &graph,
        &fragment.hap1,
        &reads,
        &final_alignments,
        &assignment,
        HaplotypeAssignment::Hap1,
        params,
        matrix,
    );
    let (poa_h2, consensus_h2) = polish_haplotype(
        &graph,
        &fragment.hap2,
        &reads,
        &final_alignments,
        &assignment,
        HaplotypeAssignment::Hap2,
        params,
        matrix,
    );

    let reads_h1: FxHashSet<String> = reads
        .iter()
        .zip(&assignment)
        .filter(|(_, &a)| a == HaplotypeAssignment::Hap1)
        .map(|(r, _)| r.name.clone())
        .collect();
    let reads_h2: FxHashSet<String> = reads
        .iter()
        .zip(&assignment)
        .filter(|(_, &a)| a == HaplotypeAssignment::Hap2)
        .map(|(r, _)| r.name.clone())
        .collect();

    if let Some(base) = &config.haplotype_reads_base {
        outputs::write_haplotype_reads(base, chunk, &reads_h1, &reads_h2)?;
    }
    if let Some(base) = &config.haplotype_bam_base {
        outputs::write_haplotype_bams(base, chunk, &config.bam, &reads_h1, &reads_h2)?;
    }
    if let Some(kind) = config.feature_kind {
        let max_rl = config
            .feature_max_run_length
            .unwrap_or_else(|| kind.default_max_run_length());
        let (labels_h1, labels_h2) = match config.true_reference_bams.as_deref() {
            Some([truth_h1, truth_h2]) => (
                Some(truth_labels_for_consensus(
                    truth_h1,
                    chunk,
                    &window_ref,
                    &consensus_h1,
                    params,
                )?),
                Some(truth_labels_for_consensus(
                    truth_h2,
                    chunk,
                    &window_ref,
                    &consensus_h2,
                    params,
                )?),
            ),
            _ => (None, None),
        };
        emit_chunk_features(
            kind,
            &config.output_base,
            max_rl,
            chunk,
            &poa,
            &graph.consensus,
            &reads,
            None,
            Some(DiploidFeatureInput {
                poas: [(&poa_h1, &consensus_h1), (&poa_h2, &consensus_h2)],
                assignment: &assignment,
                labels: [labels_h1.as_deref(), labels_h2.as_deref()],
            }),
        )?;
    }

    Ok(ChunkResult {
        index: chunk.index,
        h1: consensus_h1.rle.expand(),
        h2: Some(consensus_h2.rle.expand()),
        reads_h1,
        reads_h2,
        read_count: read_count_before,
    })
}

/// Re-polish one haplotype: its reads (plus unphased reads) are re-aligned
/// to the haplotype's substituted reference and a fresh POA is built, then
/// run lengths are re-estimated from exactly that read set.
#[allow(clippy::too_many_arguments)]
fn polish_haplotype(
    graph: &crate::bubble::BubbleGraph,
    choices: &[usize],
    reads: &[ChunkRead],
    alignments: &[ReadAlignment],
    assignment: &[HaplotypeAssignment],
    own: HaplotypeAssignment,
    params: &Params,
    matrix: &RepeatSubMatrix,
) -> (Poa, Consensus) {
    let hap_raw = graph.haplotype_reference(choices);
    let hap_ref = RleString::new(params.use_run_length_encoding, &hap_raw);

    // The other haplotype's reads keep their slot (so observation read
    // indices stay chunk-global) but contribute no alignment.
    let hap_alignments: Vec<ReadAlignment> = (0..reads.len())
        .map(|r| {
            if assignment[r] != own && assignment[r] != HaplotypeAssignment::Unphased {
                return Vec::new();
            }
            let offset = alignments[r]
                .first()
                .map(|p| p.ref_offset as i64 - p.read_offset as i64)
                .unwrap_or(0);
            banded_align(
                &reads[r].rle,
                &hap_ref,
                params.poa.band_width,
                offset,
                &params.poa,
            )
        })
        .collect();

    let poa = Poa::build(
        &hap_ref,
        params.use_run_length_encoding,
        reads,
        &hap_alignments,
        &params.poa,
    );
    let mut consensus = poa.consensus();
    if params.use_run_length_encoding {
        estimate_repeat_counts(&poa, &mut consensus, matrix, None);
    }
    (poa, consensus)
}

//! Per-chunk feature tensors for an external ML consumer.
//!
//! Each feature type is its own variant with its own emitter over the chunk's
//! POA(s) and read assignments. Features are written as TSV next to the
//! other per-chunk side channels. The simple-weight type describes raw base
//! weights and requires run-length encoding to be off; every other type
//! describes run-length-resolved weights and requires it on.

use crate::chunk::Chunk;
use crate::error::{PolishError, Result};
use crate::outputs::chunk_file_name;
use crate::params::Params;
use crate::phase::HaplotypeAssignment;
use crate::poa::{banded_align, Consensus, Poa};
use crate::reads::{load_spanning_reads, ChunkRead};
use crate::rle::{RleString, BASES};
use std::fs::File;
use std::io::{BufWriter, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    SimpleWeight,
    SplitRleWeight,
    ChannelRleWeight,
    DiploidRleWeight,
}

impl FeatureKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "simpleweight" | "simple" => Ok(FeatureKind::SimpleWeight),
            "rleweight" | "splitrleweight" | "split" => Ok(FeatureKind::SplitRleWeight),
            "channelrleweight" | "channel" => Ok(FeatureKind::ChannelRleWeight),
            "diploidrleweight" | "diploid" => Ok(FeatureKind::DiploidRleWeight),
            other => Err(PolishError::ParameterInconsistent(format!(
                "unrecognized feature type: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FeatureKind::SimpleWeight => "simpleWeight",
            FeatureKind::SplitRleWeight => "splitRleWeight",
            FeatureKind::ChannelRleWeight => "channelRleWeight",
            FeatureKind::DiploidRleWeight => "diploidRleWeight",
        }
    }

    pub fn default_max_run_length(&self) -> usize {
        match self {
            FeatureKind::SimpleWeight => 0,
            FeatureKind::SplitRleWeight => 10,
            FeatureKind::ChannelRleWeight => 6,
            FeatureKind::DiploidRleWeight => 10,
        }
    }
}

/// Feature types constrain the RLE setting; violations are fatal before any
/// chunk is dispatched.
pub fn validate_feature_params(kind: Option<FeatureKind>, params: &Params) -> Result<()> {
    match kind {
        Some(FeatureKind::SimpleWeight) if params.use_run_length_encoding => {
            Err(PolishError::ParameterInconsistent(
                "feature type simpleWeight requires useRunLengthEncoding=false".to_string(),
            ))
        }
        Some(kind) if kind != FeatureKind::SimpleWeight && !params.use_run_length_encoding => {
            Err(PolishError::ParameterInconsistent(format!(
                "feature type {} requires useRunLengthEncoding=true",
                kind.name()
            )))
        }
        _ => Ok(()),
    }
}

fn open_writer(path: &str) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| {
        PolishError::InputUnavailable(format!("could not open {} for writing: {}", path, e))
    })?;
    Ok(BufWriter::new(file))
}

/// Truth label for one consensus position: the base and run length the true
/// reference carries there, or None where the truth alignment has no
/// counterpart.
pub type TruthLabel = Option<(u8, u32)>;

/// Derive per-position truth labels by aligning the chunk's true-reference
/// record(s) to the polished consensus. The truth BAM holds the true
/// sequence aligned to the assembly, so the records spanning this chunk are
/// loaded without the midpoint ownership rule and banded-aligned to the
/// consensus; the first label wins where records overlap.
pub fn truth_labels_for_consensus(
    truth_bam: &str,
    chunk: &Chunk,
    window_ref: &RleString,
    consensus: &Consensus,
    params: &Params,
) -> Result<Vec<TruthLabel>> {
    let (truth_reads, truth_alignments) =
        load_spanning_reads(truth_bam, chunk, window_ref, params)?;
    let mut labels: Vec<TruthLabel> = vec![None; consensus.rle.len()];
    for (read, alignment) in truth_reads.iter().zip(&truth_alignments) {
        let offset = alignment
            .first()
            .map(|p| p.ref_offset as i64 - p.read_offset as i64)
            .unwrap_or(0);
        let to_consensus = banded_align(
            &read.rle,
            &consensus.rle,
            params.poa.band_width,
            offset,
            &params.poa,
        );
        for pair in to_consensus {
            let slot = &mut labels[pair.ref_offset as usize];
            if slot.is_none() {
                *slot = Some((
                    read.rle.base(pair.read_offset as usize),
                    read.rle.run_length(pair.read_offset as usize),
                ));
            }
        }
    }
    Ok(labels)
}

fn label_header(labels: Option<&[TruthLabel]>) -> &'static str {
    if labels.is_some() {
        "\tlabelBase\tlabelRunLength"
    } else {
        ""
    }
}

fn label_columns(labels: Option<&[TruthLabel]>, run: usize) -> String {
    match labels {
        None => String::new(),
        Some(labels) => match labels.get(run).copied().flatten() {
            Some((base, run_length)) => format!("\t{}\t{}", base as char, run_length),
            None => "\t.\t0".to_string(),
        },
    }
}

/// Per-node weights split by strand and clamped run length.
fn split_weights(
    poa: &Poa,
    consensus: &Consensus,
    reads: &[ChunkRead],
    run: usize,
    max_run_length: usize,
) -> Vec<[[f64; 4]; 2]> {
    let node = &poa.nodes[consensus.nodes[run] as usize];
    let mut weights = vec![[[0.0f64; 4]; 2]; max_run_length + 1];
    for obs in &node.observations {
        let Some(bi) = crate::rle::base_index(obs.base) else {
            continue;
        };
        let rl = (obs.run_length as usize).min(max_run_length);
        let strand = if reads[obs.read as usize].forward { 0 } else { 1 };
        weights[rl][strand][bi] += obs.weight;
    }
    weights
}

fn emit_simple_weight(
    writer: &mut impl Write,
    poa: &Poa,
    consensus: &Consensus,
    labels: Option<&[TruthLabel]>,
) -> std::io::Result<()> {
    writeln!(
        writer,
        "position\tbase\tweight_A\tweight_C\tweight_G\tweight_T\tweight_delete\tweight_insert{}",
        label_header(labels)
    )?;
    for run in 0..consensus.rle.len() {
        let node = &poa.nodes[consensus.nodes[run] as usize];
        let insert_weight: f64 = node.inserts.iter().map(|i| i.weight).sum();
        writeln!(
            writer,
            "{}\t{}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}{}",
            run,
            consensus.rle.base(run) as char,
            node.base_weights[0],
            node.base_weights[1],
            node.base_weights[2],
            node.base_weights[3],
            node.delete_weight,
            insert_weight,
            label_columns(labels, run)
        )?;
    }
    Ok(())
}

fn emit_split_rle_weight(
    writer: &mut impl Write,
    poa: &Poa,
    consensus: &Consensus,
    reads: &[ChunkRead],
    max_run_length: usize,
    labels: Option<&[TruthLabel]>,
) -> std::io::Result<()> {
    writeln!(
        writer,
        "position\tbase\trunLength\tfwd_A\tfwd_C\tfwd_G\tfwd_T\trev_A\trev_C\trev_G\trev_T\tdelete{}",
        label_header(labels)
    )?;
    for run in 0..consensus.rle.len() {
        let node = &poa.nodes[consensus.nodes[run] as usize];
        let weights = split_weights(poa, consensus, reads, run, max_run_length);
        for (rl, by_strand) in weights.iter().enumerate() {
            writeln!(
                writer,
                "{}\t{}\t{}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}{}",
                run,
                consensus.rle.base(run) as char,
                rl,
                by_strand[0][0],
                by_strand[0][1],
                by_strand[0][2],
                by_strand[0][3],
                by_strand[1][0],
                by_strand[1][1],
                by_strand[1][2],
                by_strand[1][3],
                if rl == 0 { node.delete_weight } else { 0.0 },
                label_columns(labels, run)
            )?;
        }
    }
    Ok(())
}

fn emit_channel_rle_weight(
    writer: &mut impl Write,
    poa: &Poa,
    consensus: &Consensus,
    reads: &[ChunkRead],
    max_run_length: usize,
    labels: Option<&[TruthLabel]>,
) -> std::io::Result<()> {
    writeln!(
        writer,
        "position\tbase\tchannel\tstrand\tweightedRunLength\ttotalWeight{}",
        label_header(labels)
    )?;
    for run in 0..consensus.rle.len() {
        let node = &poa.nodes[consensus.nodes[run] as usize];
        let mut sums = [[0.0f64; 2]; 4]; // weighted run length per base/strand
        let mut totals = [[0.0f64; 2]; 4];
        for obs in &node.observations {
            let Some(bi) = crate::rle::base_index(obs.base) else {
                continue;
            };
            let strand = if reads[obs.read as usize].forward { 0 } else { 1 };
            let rl = (obs.run_length as usize).min(max_run_length);
            sums[bi][strand] += obs.weight * rl as f64;
            totals[bi][strand] += obs.weight;
        }
        for (bi, base) in BASES.iter().enumerate() {
            for (strand, strand_label) in ["fwd", "rev"].iter().enumerate() {
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{}\t{:.3}\t{:.3}{}",
                    run,
                    consensus.rle.base(run) as char,
                    *base as char,
                    strand_label,
                    sums[bi][strand],
                    totals[bi][strand],
                    label_columns(labels, run)
                )?;
            }
        }
    }
    Ok(())
}

fn emit_diploid_rle_weight(
    writer: &mut impl Write,
    poas: [(&Poa, &Consensus); 2],
    assignment: &[HaplotypeAssignment],
    max_run_length: usize,
    labels: [Option<&[TruthLabel]>; 2],
) -> std::io::Result<()> {
    let any_labels = labels.iter().any(|l| l.is_some());
    writeln!(
        writer,
        "hap\tposition\tbase\trunLength\town_A\town_C\town_G\town_T\tunphased_A\tunphased_C\tunphased_G\tunphased_T{}",
        if any_labels { "\tlabelBase\tlabelRunLength" } else { "" }
    )?;
    for (hap, (poa, consensus)) in poas.iter().enumerate() {
        let hap_labels = if any_labels {
            // Both columns are present whenever either haplotype has a
            // truth track; a missing track reads as unlabelled.
            Some(labels[hap].unwrap_or(&[]))
        } else {
            None
        };
        for run in 0..consensus.rle.len() {
            let node = &poa.nodes[consensus.nodes[run] as usize];
            let mut own = vec![[0.0f64; 4]; max_run_length + 1];
            let mut unphased = vec![[0.0f64; 4]; max_run_length + 1];
            for obs in &node.observations {
                let Some(bi) = crate::rle::base_index(obs.base) else {
                    continue;
                };
                let rl = (obs.run_length as usize).min(max_run_length);
                match assignment.get(obs.read as usize) {
                    Some(HaplotypeAssignment::Unphased) | None => unphased[rl][bi] += obs.weight,
                    _ => own[rl][bi] += obs.weight,
                }
            }
            for rl in 0..=max_run_length {
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}{}",
                    hap + 1,
                    run,
                    consensus.rle.base(run) as char,
                    rl,
                    own[rl][0],
                    own[rl][1],
                    own[rl][2],
                    own[rl][3],
                    unphased[rl][0],
                    unphased[rl][1],
                    unphased[rl][2],
                    unphased[rl][3],
                    label_columns(hap_labels, run)
                )?;
            }
        }
    }
    Ok(())
}

/// Diploid feature emission input: both haplotype POAs, the read
/// assignment, and the optional per-haplotype truth-label tracks.
pub struct DiploidFeatureInput<'a> {
    pub poas: [(&'a Poa, &'a Consensus); 2],
    pub assignment: &'a [HaplotypeAssignment],
    pub labels: [Option<&'a [TruthLabel]>; 2],
}

/// Emit one chunk's features. Haploid runs (and non-diploid feature types)
/// consume the primary POA; the diploid type consumes both haplotype POAs
/// and the read assignment. Truth labels, when available, append label
/// columns.
#[allow(clippy::too_many_arguments)]
pub fn emit_chunk_features(
    kind: FeatureKind,
    base: &str,
    max_run_length: usize,
    chunk: &Chunk,
    poa: &Poa,
    consensus: &Consensus,
    reads: &[ChunkRead],
    labels: Option<&[TruthLabel]>,
    diploid: Option<DiploidFeatureInput>,
) -> Result<()> {
    let path = chunk_file_name(base, &format!("features.{}", kind.name()), chunk, "tsv");
    let mut writer = open_writer(&path)?;
    let io_result = match (kind, diploid) {
        (FeatureKind::SimpleWeight, _) => emit_simple_weight(&mut writer, poa, consensus, labels),
        (FeatureKind::SplitRleWeight, _) => {
            emit_split_rle_weight(&mut writer, poa, consensus, reads, max_run_length, labels)
        }
        (FeatureKind::ChannelRleWeight, _) => {
            emit_channel_rle_weight(&mut writer, poa, consensus, reads, max_run_length, labels)
        }
        (FeatureKind::DiploidRleWeight, Some(input)) => emit_diploid_rle_weight(
            &mut writer,
            input.poas,
            input.assignment,
            max_run_length,
            input.labels,
        ),
        // Diploid features without phasing output degrade to the split form.
        (FeatureKind::DiploidRleWeight, None) => {
            emit_split_rle_weight(&mut writer, poa, consensus, reads, max_run_length, labels)
        }
    };
    io_result.map_err(|e| {
        PolishError::InputUnavailable(format!("could not write features to {}: {}", path, e))
    })?;
    writer.flush().map_err(|e| {
        PolishError::InputUnavailable(format!("could not write features to {}: {}", path, e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!(
            FeatureKind::parse("simpleWeight").unwrap(),
            FeatureKind::SimpleWeight
        );
        assert_eq!(
            FeatureKind::parse("split").unwrap(),
            FeatureKind::SplitRleWeight
        );
        assert_eq!(
            FeatureKind::parse("rleWeight").unwrap(),
            FeatureKind::SplitRleWeight
        );
        assert_eq!(
            FeatureKind::parse("channel").unwrap(),
            FeatureKind::ChannelRleWeight
        );
        assert!(FeatureKind::parse("bogus").is_err());
    }

    #[test]
    fn test_diploid_maps_to_its_own_variant() {
        // diploidRleWeight is a distinct variant, not an alias of
        // channelRleWeight.
        assert_eq!(
            FeatureKind::parse("diploidRleWeight").unwrap(),
            FeatureKind::DiploidRleWeight
        );
        assert_ne!(
            FeatureKind::parse("diploidRleWeight").unwrap(),
            FeatureKind::ChannelRleWeight
        );
    }

    #[test]
    fn test_rle_consistency_checks() {
        let mut params = Params::default();
        params.use_run_length_encoding = true;
        // simpleWeight needs RLE off.
        assert!(validate_feature_params(Some(FeatureKind::SimpleWeight), &params).is_err());
        assert!(validate_feature_params(Some(FeatureKind::SplitRleWeight), &params).is_ok());

        params.use_run_length_encoding = false;
        assert!(validate_feature_params(Some(FeatureKind::SimpleWeight), &params).is_ok());
        assert!(validate_feature_params(Some(FeatureKind::SplitRleWeight), &params).is_err());
        assert!(validate_feature_params(Some(FeatureKind::DiploidRleWeight), &params).is_err());

        // No features requested: nothing to check.
        assert!(validate_feature_params(None, &params).is_ok());
    }

    #[test]
    fn test_default_max_run_lengths() {
        assert_eq!(FeatureKind::SplitRleWeight.default_max_run_length(), 10);
        assert_eq!(FeatureKind::ChannelRleWeight.default_max_run_length(), 6);
        assert_eq!(FeatureKind::DiploidRleWeight.default_max_run_length(), 10);
    }

    #[test]
    fn test_label_columns_formatting() {
        // No truth track: no columns at all.
        assert_eq!(label_header(None), "");
        assert_eq!(label_columns(None, 0), "");

        let labels: Vec<TruthLabel> = vec![Some((b'A', 4)), None];
        assert_eq!(label_header(Some(&labels)), "\tlabelBase\tlabelRunLength");
        assert_eq!(label_columns(Some(&labels), 0), "\tA\t4");
        // Positions the truth alignment does not cover stay unlabelled.
        assert_eq!(label_columns(Some(&labels), 1), "\t.\t0");
        // As do positions past the end of the track.
        assert_eq!(label_columns(Some(&labels), 7), "\t.\t0");
    }
}

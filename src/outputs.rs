//! Optional per-chunk side outputs: POA dumps (DOT, TSV), repeat-count
//! tables, per-haplotype read lists and re-emitted alignment files.
//!
//! Every side channel shares one naming scheme:
//! `<base>.<kind>.C<chunkIdx>.<contig>-<boundaryStart>-<boundaryEnd>.<ext>`.

use crate::chunk::Chunk;
use crate::error::{PolishError, Result};
use crate::poa::{Consensus, Poa};
use log::info;
use rust_htslib::bam::{self, Read};
use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::{BufWriter, Write};

pub fn chunk_file_name(base: &str, kind: &str, chunk: &Chunk, ext: &str) -> String {
    format!(
        "{}.{}.C{:05}.{}-{}-{}.{}",
        base, kind, chunk.index, chunk.contig, chunk.boundary_start, chunk.boundary_end, ext
    )
}

fn create(path: &str) -> Result<BufWriter<File>> {
    let file = File::create(path).map_err(|e| {
        PolishError::InputUnavailable(format!("could not open {} for writing: {}", path, e))
    })?;
    Ok(BufWriter::new(file))
}

fn io_err(path: &str, e: std::io::Error) -> PolishError {
    PolishError::InputUnavailable(format!("could not write {}: {}", path, e))
}

/// DOT rendering of the POA graph: nodes labelled with base, run length and
/// weights; edges labelled with their traversal weight.
pub fn write_poa_dot(base: &str, chunk: &Chunk, poa: &Poa) -> Result<()> {
    let path = chunk_file_name(base, "poa", chunk, "dot");
    let mut writer = create(&path)?;
    let write = |writer: &mut BufWriter<File>| -> std::io::Result<()> {
        writeln!(writer, "digraph poa {{")?;
        writeln!(writer, "  rankdir=LR;")?;
        for (id, node) in poa.nodes.iter().enumerate() {
            if id == 0 {
                writeln!(writer, "  n0 [label=\"source\", shape=point];")?;
                continue;
            }
            let shape = if poa.is_backbone(id as u32) {
                "box"
            } else {
                "ellipse"
            };
            writeln!(
                writer,
                "  n{} [label=\"{}{} w={:.1} d={:.1}\", shape={}];",
                id,
                node.base as char,
                node.run_length,
                node.total_base_weight(),
                node.delete_weight,
                shape
            )?;
        }
        for edge in &poa.edges {
            writeln!(
                writer,
                "  n{} -> n{} [label=\"{:.1}\"];",
                edge.from, edge.to, edge.weight
            )?;
        }
        for (id, node) in poa.nodes.iter().enumerate() {
            for insert in &node.inserts {
                writeln!(
                    writer,
                    "  // unpromoted insert after n{}: {} (w={:.1})",
                    id,
                    String::from_utf8_lossy(&insert.bases),
                    insert.weight
                )?;
            }
        }
        writeln!(writer, "}}")
    };
    write(&mut writer).map_err(|e| io_err(&path, e))?;
    writer.flush().map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// Tabular POA dump: one row per node with its weights.
pub fn write_poa_tsv(base: &str, chunk: &Chunk, poa: &Poa) -> Result<()> {
    let path = chunk_file_name(base, "poa", chunk, "tsv");
    let mut writer = create(&path)?;
    let write = |writer: &mut BufWriter<File>| -> std::io::Result<()> {
        writeln!(
            writer,
            "node\tbackbone\tbase\trunLength\tweight_A\tweight_C\tweight_G\tweight_T\tweight_delete\tinserts"
        )?;
        for (id, node) in poa.nodes.iter().enumerate().skip(1) {
            let insert_summary: Vec<String> = node
                .inserts
                .iter()
                .map(|i| format!("{}:{:.1}", String::from_utf8_lossy(&i.bases), i.weight))
                .collect();
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{:.3}\t{}",
                id,
                poa.is_backbone(id as u32),
                node.base as char,
                node.run_length,
                node.base_weights[0],
                node.base_weights[1],
                node.base_weights[2],
                node.base_weights[3],
                node.delete_weight,
                if insert_summary.is_empty() {
                    ".".to_string()
                } else {
                    insert_summary.join(",")
                }
            )?;
        }
        Ok(())
    };
    write(&mut writer).map_err(|e| io_err(&path, e))?;
    writer.flush().map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// Observed run-length histogram per consensus position.
pub fn write_repeat_counts_tsv(
    base: &str,
    chunk: &Chunk,
    poa: &Poa,
    consensus: &Consensus,
) -> Result<()> {
    let path = chunk_file_name(base, "repeatCount", chunk, "tsv");
    let mut writer = create(&path)?;
    let write = |writer: &mut BufWriter<File>| -> std::io::Result<()> {
        writeln!(writer, "position\tbase\tobservedRunLength\tweight")?;
        for run in 0..consensus.rle.len() {
            let node = &poa.nodes[consensus.nodes[run] as usize];
            let base = consensus.rle.base(run);
            let mut histogram: Vec<(u32, f64)> = Vec::new();
            for obs in node.observations.iter().filter(|o| o.base == base) {
                match histogram.iter_mut().find(|(l, _)| *l == obs.run_length) {
                    Some((_, w)) => *w += obs.weight,
                    None => histogram.push((obs.run_length, obs.weight)),
                }
            }
            histogram.sort_by_key(|&(l, _)| l);
            for (length, weight) in histogram {
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{:.3}",
                    run, base as char, length, weight
                )?;
            }
        }
        Ok(())
    };
    write(&mut writer).map_err(|e| io_err(&path, e))?;
    writer.flush().map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// Read-name lists per haplotype.
pub fn write_haplotype_reads(
    base: &str,
    chunk: &Chunk,
    reads_h1: &FxHashSet<String>,
    reads_h2: &FxHashSet<String>,
) -> Result<()> {
    for (hap, set) in [("h1", reads_h1), ("h2", reads_h2)] {
        let path = chunk_file_name(base, &format!("haplotypeReads.{}", hap), chunk, "txt");
        let mut writer = create(&path)?;
        let mut names: Vec<&String> = set.iter().collect();
        names.sort();
        for name in names {
            writeln!(writer, "{}", name).map_err(|e| io_err(&path, e))?;
        }
        writer.flush().map_err(|e| io_err(&path, e))?;
    }
    Ok(())
}

/// Re-emit the chunk's alignment records split by haplotype assignment.
pub fn write_haplotype_bams(
    base: &str,
    chunk: &Chunk,
    bam_path: &str,
    reads_h1: &FxHashSet<String>,
    reads_h2: &FxHashSet<String>,
) -> Result<()> {
    let mut reader = bam::IndexedReader::from_path(bam_path)?;
    let header = bam::Header::from_template(reader.header());
    let path_h1 = chunk_file_name(base, "haplotype.h1", chunk, "bam");
    let path_h2 = chunk_file_name(base, "haplotype.h2", chunk, "bam");
    let mut writer_h1 = bam::Writer::from_path(&path_h1, &header, bam::Format::Bam)?;
    let mut writer_h2 = bam::Writer::from_path(&path_h2, &header, bam::Format::Bam)?;

    reader.fetch((
        chunk.contig.as_str(),
        chunk.boundary_start as i64,
        chunk.boundary_end as i64,
    ))?;
    let mut record = bam::Record::new();
    let mut written = (0usize, 0usize);
    while let Some(result) = reader.read(&mut record) {
        result?;
        let name = String::from_utf8_lossy(record.qname()).to_string();
        if reads_h1.contains(&name) {
            writer_h1.write(&record)?;
            written.0 += 1;
        } else if reads_h2.contains(&name) {
            writer_h2.write(&record)?;
            written.1 += 1;
        }
    }
    info!(
        "chunk {}: wrote {} h1 and {} h2 records to {} / {}",
        chunk.index, written.0, written.1, path_h1, path_h2
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::PoaParams;
    use crate::poa::Poa;
    use crate::reads::{AlignedPair, ChunkRead};
    use crate::rle::RleString;

    fn test_chunk() -> Chunk {
        Chunk {
            contig: "ctg".to_string(),
            contig_len: 100,
            boundary_start: 0,
            inner_start: 0,
            inner_end: 100,
            boundary_end: 100,
            index: 3,
        }
    }

    fn small_poa() -> Poa {
        let reference = RleString::compress(b"AACG");
        let reads = vec![ChunkRead {
            name: "r0".to_string(),
            rle: RleString::compress(b"AACG"),
            forward: true,
            soft_clip_start: 0,
            soft_clip_end: 0,
        }];
        let alignments = vec![(0..3)
            .map(|i| AlignedPair {
                read_offset: i,
                ref_offset: i,
                weight: 1.0,
            })
            .collect::<Vec<_>>()];
        Poa::build(&reference, true, &reads, &alignments, &PoaParams::default())
    }

    #[test]
    fn test_chunk_file_name_scheme() {
        let chunk = test_chunk();
        assert_eq!(
            chunk_file_name("out", "poa", &chunk, "dot"),
            "out.poa.C00003.ctg-0-100.dot"
        );
    }

    #[test]
    fn test_dot_and_tsv_dumps() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("out");
        let base = base.to_str().unwrap();
        let chunk = test_chunk();
        let poa = small_poa();
        write_poa_dot(base, &chunk, &poa).unwrap();
        write_poa_tsv(base, &chunk, &poa).unwrap();

        let dot = std::fs::read_to_string(chunk_file_name(base, "poa", &chunk, "dot")).unwrap();
        assert!(dot.starts_with("digraph poa {"));
        assert!(dot.contains("n1"));
        assert!(dot.contains("->"));

        let tsv = std::fs::read_to_string(chunk_file_name(base, "poa", &chunk, "tsv")).unwrap();
        assert!(tsv.starts_with("node\tbackbone"));
        // Three reference runs: A2 C G.
        assert_eq!(tsv.lines().count(), 4);
    }

    #[test]
    fn test_repeat_count_dump() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("out");
        let base = base.to_str().unwrap();
        let chunk = test_chunk();
        let poa = small_poa();
        let consensus = poa.consensus();
        write_repeat_counts_tsv(base, &chunk, &poa, &consensus).unwrap();
        let tsv =
            std::fs::read_to_string(chunk_file_name(base, "repeatCount", &chunk, "tsv")).unwrap();
        assert!(tsv.contains("observedRunLength"));
        assert!(tsv.contains("A\t2\t1.000"));
    }

    #[test]
    fn test_haplotype_read_lists() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("out");
        let base = base.to_str().unwrap();
        let chunk = test_chunk();
        let h1: FxHashSet<String> = ["b".to_string(), "a".to_string()].into_iter().collect();
        let h2: FxHashSet<String> = ["c".to_string()].into_iter().collect();
        write_haplotype_reads(base, &chunk, &h1, &h2).unwrap();
        let list1 = std::fs::read_to_string(chunk_file_name(
            base,
            "haplotypeReads.h1",
            &chunk,
            "txt",
        ))
        .unwrap();
        assert_eq!(list1, "a\nb\n");
        let list2 = std::fs::read_to_string(chunk_file_name(
            base,
            "haplotypeReads.h2",
            &chunk,
            "txt",
        ))
        .unwrap();
        assert_eq!(list2, "c\n");
    }
}

//! Reference FASTA loading and polished-output writing.
//!
//! Contig names are canonicalised to the first whitespace-delimited token of
//! the header before insertion: assemblies often carry metadata after the
//! accession (`>contig001 length=1000 date=...`) while the alignment only
//! knows the accession.

use crate::error::{PolishError, Result};
use bio::io::fasta;
use log::{debug, info};
use rustc_hash::FxHashMap;
use std::path::Path;

/// Load a reference FASTA into a name -> sequence map. Sequences are
/// upper-cased so soft-masked regions compare equal to read bases.
pub fn read_reference_map(path: &str) -> Result<FxHashMap<String, Vec<u8>>> {
    info!("Parsing reference sequences from {}", path);
    if !Path::new(path).exists() {
        return Err(PolishError::InputUnavailable(format!(
            "could not read reference file {}",
            path
        )));
    }
    let reader = fasta::Reader::from_file(path).map_err(|e| {
        PolishError::InputUnavailable(format!("could not read reference file {}: {}", path, e))
    })?;

    let mut map: FxHashMap<String, Vec<u8>> = FxHashMap::default();
    for record in reader.records() {
        let record = record.map_err(|e| {
            PolishError::InputUnavailable(format!("malformed FASTA record in {}: {}", path, e))
        })?;
        // bio's record id is already the first whitespace-delimited token.
        let name = record.id().to_string();
        let seq: Vec<u8> = record.seq().iter().map(|b| b.to_ascii_uppercase()).collect();
        debug!("  reference contig {} ({} bp)", name, seq.len());
        if map.insert(name.clone(), seq).is_some() {
            return Err(PolishError::InputMismatch(format!(
                "duplicate reference contig name {} after header tokenisation",
                name
            )));
        }
    }
    if map.is_empty() {
        return Err(PolishError::InputMismatch(format!(
            "no sequences found in reference file {}",
            path
        )));
    }
    Ok(map)
}

/// Write polished contigs in input order.
pub fn write_fasta(path: &str, records: &[(String, Vec<u8>)]) -> Result<()> {
    let mut writer = fasta::Writer::to_file(path).map_err(|e| {
        PolishError::InputUnavailable(format!("could not open {} for writing: {}", path, e))
    })?;
    for (name, seq) in records {
        writer.write(name, None, seq).map_err(|e| {
            PolishError::InputUnavailable(format!("could not write {}: {}", path, e))
        })?;
    }
    Ok(())
}

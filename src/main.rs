use burnish::error::PolishError;
use burnish::features::FeatureKind;
use burnish::params::Params;
use burnish::pipeline::{run_polish, PolishConfig};
use clap::Parser;
use log::{error, info, LevelFilter};
use rayon::ThreadPoolBuilder;
use std::num::NonZeroUsize;
use std::time::Instant;

/// Polishes the reference FASTA using read alignments, optionally phasing
/// the reads into two haplotypes and emitting one polished assembly per
/// haplotype.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Indexed alignment of reads to the assembly (BAM).
    #[clap(value_parser)]
    alignment: String,

    /// The assembly (or reference) to polish, in FASTA format.
    #[clap(value_parser)]
    reference: String,

    /// JSON parameter document.
    #[clap(value_parser)]
    params: String,

    /// Base name for output files.
    #[clap(short = 'o', long, default_value = "output")]
    output_base: String,

    /// Restrict polishing to a region. Format: chr or chr:start-end
    /// (chr3:2000-3000).
    #[clap(short = 'r', long)]
    region: Option<String>,

    /// Override the downsampling depth set in the parameter document.
    #[clap(short = 'p', long)]
    depth: Option<u64>,

    /// Perform diploid phasing and emit two polished assemblies.
    #[clap(short = '2', long)]
    diploid: bool,

    /// Number of worker threads.
    #[clap(short = 't', long, default_value_t = NonZeroUsize::new(1).unwrap())]
    threads: NonZeroUsize,

    /// Log level (error, warn, info, debug, trace).
    #[clap(short = 'a', long, default_value = "info")]
    log_level: String,

    /// Output base for per-chunk POA DOT dumps.
    #[clap(short = 'd', long)]
    output_poa_dot: Option<String>,

    /// Output base for per-chunk POA TSV dumps.
    #[clap(short = 'j', long)]
    output_poa_tsv: Option<String>,

    /// Output base for per-chunk repeat-count tables.
    #[clap(short = 'i', long)]
    output_repeat_counts: Option<String>,

    /// Output base for per-haplotype read lists (diploid mode).
    #[clap(short = 'n', long)]
    output_haplotype_reads: Option<String>,

    /// Output base for per-haplotype alignment files (diploid mode).
    #[clap(short = 'm', long)]
    output_haplotype_bam: Option<String>,

    /// Emit per-chunk feature tensors of the given type
    /// (simpleWeight, splitRleWeight, channelRleWeight, diploidRleWeight).
    #[clap(short = 'F', long)]
    feature_type: Option<String>,

    /// Max run length for run-length-split feature types.
    #[clap(short = 'L', long)]
    feature_max_run_length: Option<usize>,

    /// True reference aligned to the assembly; adds label columns to
    /// emitted features. With --diploid this takes two comma-separated
    /// values, one per haplotype.
    #[clap(short = 'u', long)]
    true_reference_bam: Option<String>,
}

fn run(args: Args) -> Result<(), PolishError> {
    ThreadPoolBuilder::new()
        .num_threads(args.threads.into())
        .build_global()
        .map_err(|e| PolishError::ParameterInconsistent(format!("thread pool: {}", e)))?;

    info!("Parsing model parameters from {}", args.params);
    let mut params = Params::from_file(&args.params)?;
    if let Some(depth) = args.depth {
        info!(
            "Overriding maxDepth parameter from {} to {}",
            params.max_depth, depth
        );
        params.max_depth = depth;
    }

    let feature_kind = args
        .feature_type
        .as_deref()
        .map(FeatureKind::parse)
        .transpose()?;

    let config = PolishConfig {
        bam: args.alignment,
        reference: args.reference,
        output_base: args.output_base,
        region: args.region,
        diploid: args.diploid,
        poa_dot_base: args.output_poa_dot,
        poa_tsv_base: args.output_poa_tsv,
        repeat_counts_base: args.output_repeat_counts,
        haplotype_reads_base: args.output_haplotype_reads,
        haplotype_bam_base: args.output_haplotype_bam,
        feature_kind,
        feature_max_run_length: args.feature_max_run_length,
        true_reference_bams: args
            .true_reference_bam
            .map(|value| value.split(',').map(|part| part.trim().to_string()).collect()),
    };

    let start = Instant::now();
    run_polish(&config, &params)?;
    info!("Finished polishing in {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

fn main() {
    let args = Args::parse();
    let level = args
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    env_logger::Builder::new().filter_level(level).init();

    if let Err(e) = run(args) {
        error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use bkc::codec::unpack_2bit;
use bkc::error::InputError;
use bkc::{
    apply_allow_list, run_ingestion, AnchorDict, CbcAllowList, Counter, CountingMode,
    ExportFilteredInput, InputFormat, LeaderFilter, OutputFormat, Params, ReadStore,
    ReadStoreBuilder, ShardSet, Technology,
};

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Single,
    Pair,
}

#[derive(Clone, Copy, ValueEnum)]
enum TechnologyArg {
    #[value(name = "10x", alias = "10X")]
    TenX,
    Visium,
}

#[derive(Clone, Copy, ValueEnum)]
enum InputFormatArg {
    Fasta,
    Fastq,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormatArg {
    Bkc,
    Splash,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFilteredArg {
    None,
    First,
    Second,
    Both,
}

/// BKC: counter of k-mers or k-mer pairs in barcoded reads
#[derive(Parser)]
#[command(name = "bkc", version)]
struct Args {
    /// Count single k-mers or pairs of k-mers
    #[arg(long = "mode", value_enum, default_value = "pair")]
    mode: ModeArg,

    /// Leader k-mer length
    #[arg(long = "leader_len", default_value_t = 8)]
    leader_len: usize,

    /// Follower k-mer length
    #[arg(long = "follower_len", default_value_t = 27)]
    follower_len: usize,

    /// Gap between leader and follower
    #[arg(long = "gap_len", default_value_t = 0)]
    gap_len: usize,

    /// CBC length in bases
    #[arg(long = "cbc_len", default_value_t = 16)]
    cbc_len: usize,

    /// UMI length in bases
    #[arg(long = "umi_len", default_value_t = 12)]
    umi_len: usize,

    /// Tolerance on the CBC+UMI read length
    #[arg(long = "soft_cbc_umi_len_limit", default_value_t = 0)]
    soft_cbc_umi_len_limit: usize,

    /// Number of worker threads [0: auto]
    #[arg(long = "n_threads", default_value_t = 0)]
    n_threads: usize,

    /// Number of output shards
    #[arg(long = "n_splits", default_value_t = 4)]
    n_splits: usize,

    /// Output block compression level [0: uncompressed]
    #[arg(long = "zstd_level", default_value_t = 3)]
    zstd_level: i32,

    /// Saturation value for counts
    #[arg(long = "max_count", default_value_t = 65_535)]
    max_count: u64,

    /// Sample id stamped into every output record
    #[arg(long = "sample_id", default_value_t = 0)]
    sample_id: u64,

    /// Canonical k-mers; only valid in single mode
    #[arg(long = "canonical")]
    canonical: bool,

    /// Filter out leaders containing a poly-ACGT run of this length [0: off]
    #[arg(long = "poly_ACGT_len", default_value_t = 0)]
    poly_acgt_len: usize,

    /// File with artifact substrings; leaders containing one are filtered
    #[arg(long = "artifacts")]
    artifacts: Option<PathBuf>,

    /// Filter out leaders containing Illumina adapters
    #[arg(long = "apply_filter_illumina_adapters")]
    apply_filter_illumina_adapters: bool,

    /// File with predefined CBCs
    #[arg(long = "predefined_cbc")]
    predefined_cbc: Option<PathBuf>,

    /// Sequencing technology of the predefined CBC list
    #[arg(long = "technology", value_enum, default_value = "10x")]
    technology: TechnologyArg,

    /// Apply 1-substitution CBC correction against the allow-list
    #[arg(long = "apply_cbc_correction")]
    apply_cbc_correction: bool,

    /// Drop (instead of abort on) CBC+UMI reads of unexpected length
    #[arg(long = "allow_strange_cbc_umi_reads")]
    allow_strange_cbc_umi_reads: bool,

    /// File with `<cbc_umi_file>,<reads_file>` lines
    #[arg(long = "input_name")]
    input_name: PathBuf,

    /// Input file format
    #[arg(long = "input_format", value_enum, default_value = "fastq")]
    input_format: InputFormatArg,

    /// Output file prefix
    #[arg(long = "output_name", default_value = "bkc_out")]
    output_name: String,

    /// Output format
    #[arg(long = "output_format", value_enum, default_value = "bkc")]
    output_format: OutputFormatArg,

    /// Verbosity level (0-2)
    #[arg(long = "verbose", default_value_t = 0)]
    verbose: usize,

    /// File with accepted anchors (one k-mer per line, or TSV with an
    /// `anchor` column)
    #[arg(short = 'd')]
    anchor_dict: Option<PathBuf>,

    /// Path of the per-CBC log file
    #[arg(long = "log_name")]
    log_name: Option<PathBuf>,

    /// Directory for filtered input files
    #[arg(long = "filtered_input_path")]
    filtered_input_path: Option<PathBuf>,

    /// Which reads of accepted pairs to export
    #[arg(long = "export_filtered_input_mode", value_enum, default_value = "none")]
    export_filtered_input_mode: ExportFilteredArg,
}

impl Args {
    fn into_params(self) -> Result<Params> {
        let input_pairs = read_input_list(&self.input_name)?;
        Ok(Params {
            mode: match self.mode {
                ModeArg::Single => CountingMode::Single,
                ModeArg::Pair => CountingMode::Pair,
            },
            canonical: self.canonical,
            leader_len: self.leader_len,
            gap_len: self.gap_len,
            follower_len: self.follower_len,
            cbc_len: self.cbc_len,
            umi_len: self.umi_len,
            soft_cbc_umi_len_limit: self.soft_cbc_umi_len_limit,
            allow_strange_cbc_umi_reads: self.allow_strange_cbc_umi_reads,
            n_threads: self.n_threads,
            n_splits: self.n_splits,
            zstd_level: self.zstd_level,
            max_count: self.max_count,
            sample_id: self.sample_id,
            poly_acgt_len: self.poly_acgt_len,
            artifacts_path: self.artifacts,
            apply_filter_illumina_adapters: self.apply_filter_illumina_adapters,
            predefined_cbc_path: self.predefined_cbc,
            technology: match self.technology {
                TechnologyArg::TenX => Technology::TenX,
                TechnologyArg::Visium => Technology::Visium,
            },
            apply_cbc_correction: self.apply_cbc_correction,
            input_pairs,
            input_format: match self.input_format {
                InputFormatArg::Fasta => InputFormat::Fasta,
                InputFormatArg::Fastq => InputFormat::Fastq,
            },
            anchor_dict_path: self.anchor_dict,
            output_name: self.output_name,
            output_format: match self.output_format {
                OutputFormatArg::Bkc => OutputFormat::Bkc,
                OutputFormatArg::Splash => OutputFormat::Splash,
            },
            verbosity: self.verbose,
            log_name: self.log_name,
            filtered_input_path: self.filtered_input_path,
            export_filtered_input: match self.export_filtered_input_mode {
                ExportFilteredArg::None => ExportFilteredInput::None,
                ExportFilteredArg::First => ExportFilteredInput::First,
                ExportFilteredArg::Second => ExportFilteredInput::Second,
                ExportFilteredArg::Both => ExportFilteredInput::Both,
            },
            ..Params::default()
        })
    }
}

/// Parses the input-name file: one `<cbc_umi_file>,<reads_file>` per line.
fn read_input_list(path: &PathBuf) -> Result<Vec<(PathBuf, PathBuf)>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut pairs = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (cbc_umi, reads) = line
            .split_once(',')
            .ok_or_else(|| InputError::MalformedInputLine(line.to_string()))?;
        pairs.push((PathBuf::from(cbc_umi), PathBuf::from(reads)));
    }
    Ok(pairs)
}

fn init_logging(verbosity: usize) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    // stderr stays reserved for error diagnostics
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .target(env_logger::Target::Stdout)
        .init();
}

/// Writes one TSV line per kept CBC: decoded barcode and read count.
fn write_cbc_log(path: &PathBuf, store: &ReadStore, cbc_len: usize) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for &cbc in store.cbcs() {
        writeln!(
            writer,
            "{}\t{}",
            unpack_2bit(cbc, cbc_len),
            store.reads_of(cbc).len()
        )?;
    }
    writer.flush()?;
    Ok(())
}

fn run(params: &Params) -> Result<()> {
    params.validate()?;

    let dict = params
        .anchor_dict_path
        .as_ref()
        .map(|path| AnchorDict::from_path(path, params.leader_len))
        .transpose()?;

    let allow_list = params
        .predefined_cbc_path
        .as_ref()
        .map(|path| {
            CbcAllowList::from_path(path, params.technology, params.cbc_len).map(Arc::new)
        })
        .transpose()?;

    let mut filter = LeaderFilter::new(params.leader_len, params.poly_acgt_len);
    if let Some(path) = &params.artifacts_path {
        filter.load_artifacts(path)?;
    }
    if params.apply_filter_illumina_adapters {
        filter.add_illumina_adapters();
    }

    // phase 1: ingestion
    let builder = Arc::new(ReadStoreBuilder::new(params.input_pairs.len()));
    let ingest_stats = run_ingestion(params, &builder, allow_list.as_ref())?;

    // the builder is exclusively ours again once the loaders have joined
    let builder = Arc::try_unwrap(builder)
        .ok()
        .expect("loader threads still hold the read store");

    let store = match (&allow_list, params.apply_cbc_correction) {
        (Some(list), true) => {
            let mut rewire_stats = None;
            let store = builder.freeze_with(|index| {
                rewire_stats = Some(apply_allow_list(index, list, true));
            });
            let stats = rewire_stats.unwrap();
            log::info!(
                "CBC correction: {} corrected, {} dropped ({} reads)",
                stats.corrected_cbcs,
                stats.dropped_cbcs,
                stats.dropped_reads
            );
            store
        }
        _ => builder.freeze(),
    };

    log::info!(
        "read store frozen: {} CBCs, {} reads indexed",
        store.n_cbcs(),
        store.n_indexed_reads()
    );
    if ingest_stats.total_dropped() > 0 {
        log::info!("dropped during ingestion: {} reads", ingest_stats.total_dropped());
    }

    if let Some(path) = &params.log_name {
        write_cbc_log(path, &store, params.cbc_len)?;
    }

    // phase 2: counting
    let shards = ShardSet::create(params)?;
    let count_stats = Counter::new(params, &store, dict.as_ref(), &filter).run(&shards)?;
    shards.finish()?;

    log::debug!(
        "leaders rejected: {} not in dictionary, {} filtered",
        count_stats
            .leaders_not_accepted
            .load(std::sync::atomic::Ordering::Relaxed),
        count_stats
            .leaders_filtered
            .load(std::sync::atomic::Ordering::Relaxed)
    );

    Ok(())
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // help and version requests are not failures
            if e.use_stderr() {
                eprintln!("{e}");
                std::process::exit(1);
            }
            e.print().ok();
            return;
        }
    };

    init_logging(args.verbose);

    let params = match args.into_params() {
        Ok(params) => params,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&params) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

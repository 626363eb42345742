//! cellsnv - per-cell and bulk allele counting at candidate SNVs
//!
//! cellsnv fetches every candidate SNV from one or more indexed BAM/SAM/CRAM
//! files and reports per-group allele counts as MatrixMarket sparse matrices
//! plus VCF summaries.
//!
//! # Usage
//!
//! ```bash
//! # Single-cell mode: one BAM, a barcode whitelist, a candidate VCF
//! cellsnv -s sample.bam -b barcodes.tsv -R snvs.vcf -O out/ -p 8
//!
//! # Bulk mode: multiple BAMs with matching sample IDs
//! cellsnv -s a.bam,b.bam -I sampleA,sampleB -R snvs.vcf -O out/ --UMItag None
//!
//! # Add genotype likelihoods and gzip the VCF outputs
//! cellsnv -s sample.bam -b barcodes.tsv -R snvs.vcf -O out/ --genotype --gzip
//! ```

extern crate cellsnv_lib;

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use cellsnv_lib::config::{self, Grouping, Settings};
use cellsnv_lib::errors::is_broken_pipe;
use cellsnv_lib::groups::SampleGroups;
use cellsnv_lib::{driver, snv};
use env_logger::Env;
use log::*;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "cellsnv", author, about)]
/// Per-cell and bulk allele counting at candidate SNVs
struct Args {
    /// Indexed BAM/SAM/CRAM file(s), comma separated.
    #[structopt(short = "s", long = "samFile")]
    sam_file: Option<String>,

    /// A file listing input alignment files, one per line.
    #[structopt(short = "S", long = "samFileList", parse(from_os_str))]
    sam_file_list: Option<PathBuf>,

    /// Output directory for the VCFs and sparse matrices.
    #[structopt(short = "O", long = "outDir", parse(from_os_str))]
    out_dir: PathBuf,

    /// A VCF file listing all candidate SNVs to fetch.
    #[structopt(short = "R", long = "regionsVCF", parse(from_os_str))]
    regions_vcf: Option<PathBuf>,

    /// Chromosomes to pileup when no regions VCF is given, comma separated.
    #[structopt(long = "chrom")]
    chrom: Option<String>,

    /// A plain file listing all effective cell barcodes, one per line.
    #[structopt(short = "b", long = "barcodeFile", parse(from_os_str))]
    barcode_file: Option<PathBuf>,

    /// A file listing sample IDs, one per line.
    #[structopt(short = "i", long = "sampleList", parse(from_os_str))]
    sample_list: Option<PathBuf>,

    /// Comma separated sample IDs.
    #[structopt(short = "I", long = "sampleIDs")]
    sample_ids: Option<String>,

    /// Number of worker threads.
    #[structopt(short = "p", long = "nproc", default_value = "1")]
    nproc: usize,

    /// Tag for cell barcodes; turn off with None.
    #[structopt(long = "cellTAG", default_value = "CB")]
    cell_tag: String,

    /// Tag for UMIs: UR, Auto or None. Auto uses UR when barcodes are given,
    /// otherwise plain read counts.
    #[structopt(long = "UMItag", default_value = "UR")]
    umi_tag: String,

    /// Minimum aggregated count to keep an SNV.
    #[structopt(long = "minCOUNT", default_value = "20")]
    min_count: u32,

    /// Minimum minor allele frequency to keep an SNV.
    #[structopt(long = "minMAF", default_value = "0.0")]
    min_maf: f64,

    /// Keep doublet genotype likelihoods, i.e. dosages 0.5 and 1.5.
    #[structopt(long = "doubleGL")]
    double_gl: bool,

    /// Minimum mapped length for read filtering.
    #[structopt(long = "minLEN", default_value = "30")]
    min_len: u32,

    /// Minimum MAPQ for read filtering.
    #[structopt(long = "minMAPQ", default_value = "20")]
    min_mapq: u8,

    /// Maximum FLAG for read filtering.
    #[structopt(long = "maxFLAG", default_value = "255")]
    max_flag: u16,

    /// Do genotyping in addition to counting.
    #[structopt(long)]
    genotype: bool,

    /// Gzip the final VCF outputs.
    #[structopt(long)]
    gzip: bool,
}

fn read_lines(path: &PathBuf) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    Ok(content
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect())
}

/// Cross-validate the raw arguments into immutable settings plus the
/// sample-group roster.
fn build_settings(args: &Args) -> Result<(Settings, SampleGroups)> {
    let inputs: Vec<PathBuf> = match (&args.sam_file, &args.sam_file_list) {
        (Some(_), Some(_)) => {
            bail!("should not specify -s/--samFile and -S/--samFileList at the same time")
        }
        (Some(list), None) => list
            .split(',')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect(),
        (None, Some(file)) => read_lines(file)?.into_iter().map(PathBuf::from).collect(),
        (None, None) => bail!("should specify -s/--samFile or -S/--samFileList"),
    };
    if inputs.is_empty() {
        bail!("no input alignment files given");
    }
    for input in &inputs {
        if !input.exists() {
            bail!("'{}' does not exist", input.display());
        }
    }

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed to create '{}'", args.out_dir.display()))?;

    let cell_tag = config::normalize_tag(&args.cell_tag);
    let have_sids = args.sample_list.is_some() || args.sample_ids.is_some();

    let (grouping, roster) = if let Some(barcode_file) = &args.barcode_file {
        if have_sids {
            bail!("should not specify barcodes and sample IDs at the same time");
        }
        let tag = cell_tag
            .ok_or_else(|| anyhow::anyhow!("a barcode file requires an effective --cellTAG"))?;
        config::tag_bytes(&tag)?;
        let roster = SampleGroups::from_barcode_file(barcode_file)
            .with_context(|| format!("failed to load '{}'", barcode_file.display()))?;
        info!("loaded {} cell barcodes", roster.len());
        (Grouping::CellBarcodes { tag }, roster)
    } else {
        let ids = match (&args.sample_list, &args.sample_ids) {
            (Some(_), Some(_)) => {
                bail!("should not specify -i/--sampleList and -I/--sampleIDs at the same time")
            }
            (Some(file), None) => read_lines(file)?,
            (None, Some(csv)) => csv
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect(),
            (None, None) => bail!("should specify a barcode file or sample IDs"),
        };
        if ids.len() != inputs.len() {
            bail!(
                "number of sample IDs ({}) does not match number of input files ({})",
                ids.len(),
                inputs.len()
            );
        }
        let roster = SampleGroups::from_names(ids)?;
        (Grouping::SampleIds, roster)
    };

    let barcodes = matches!(grouping, Grouping::CellBarcodes { .. });
    let umi_tag = config::resolve_umi_tag(&args.umi_tag, barcodes);
    if let Some(tag) = &umi_tag {
        config::tag_bytes(tag)?;
    }

    let settings = Settings {
        inputs,
        out_dir: args.out_dir.clone(),
        grouping,
        umi_tag,
        threads: args.nproc,
        min_count: args.min_count,
        min_maf: args.min_maf,
        double_gl: args.double_gl,
        min_len: args.min_len,
        min_mapq: args.min_mapq,
        max_flag: args.max_flag,
        genotype: args.genotype,
        gzip: args.gzip,
    };
    Ok((settings, roster))
}

fn run(args: Args) -> Result<()> {
    let (settings, roster) = build_settings(&args)?;

    let regions = match &args.regions_vcf {
        Some(path) => path,
        None if args.chrom.is_some() => {
            bail!("whole-chromosome pileup without a regions VCF is not implemented")
        }
        None => bail!("should specify -R/--regionsVCF"),
    };
    info!("loading candidate SNVs from '{}'", regions.display());
    let snvs = snv::load_snvs(regions)
        .with_context(|| format!("failed to load SNVs from '{}'", regions.display()))?;
    info!("loaded {} candidate SNVs", snvs.len());

    driver::run(&settings, &roster, &snvs)
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let start = Instant::now();
    info!("cellsnv v{} starting", env!("CARGO_PKG_VERSION"));

    let code = match run(Args::from_args()) {
        Ok(()) => 0,
        Err(err) => {
            if is_broken_pipe(&err) {
                0
            } else {
                error!("{:#}", err);
                1
            }
        }
    };
    info!("finished in {:.2} seconds", start.elapsed().as_secs_f64());
    std::process::exit(code);
}

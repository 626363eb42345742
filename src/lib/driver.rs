//! Partitioning, dispatch and the final merge.
//!
//! The SNV list is split into contiguous slices of `ceil(N / threads)`;
//! each slice is pileuped by one worker into private shard files. After all
//! workers finish, the driver stitches the shards into the final outputs in
//! worker order, which makes the result deterministic for a fixed thread
//! count.

use std::io::Write;

use anyhow::{anyhow, bail, Context, Result};
use log::{error, info, warn};
use rayon::prelude::*;

use crate::config::{
    Settings, OUT_MTX_AD, OUT_MTX_DP, OUT_MTX_OTH, OUT_SAMPLES, OUT_VCF_BASE, OUT_VCF_CELLS,
};
use crate::groups::SampleGroups;
use crate::output::{
    self, merge_mtx, merge_vcf, rewrite_mtx, OutFile, MTX_HEADER, VCF_BASE_HEADER,
};
use crate::snv::Snv;
use crate::worker::{Worker, WorkerOutputs, WorkerSummary};

/// Validate and normalize a requested thread count.
pub fn determine_allowed_cpus(desired: usize) -> Result<usize> {
    if desired == 0 {
        bail!("must select > 0 threads");
    }
    if desired > num_cpus::get() {
        warn!(
            "specified more threads than are available, using {}",
            desired
        );
    }
    Ok(desired)
}

/// The final output targets of one run.
struct FinalOutputs {
    mtx_ad: OutFile,
    mtx_dp: OutFile,
    mtx_oth: OutFile,
    vcf_base: OutFile,
    vcf_cells: Option<OutFile>,
    samples: OutFile,
}

impl FinalOutputs {
    fn new(settings: &Settings) -> Self {
        let dir = settings.out_dir.as_path();
        FinalOutputs {
            mtx_ad: OutFile::new(dir, OUT_MTX_AD, false),
            mtx_dp: OutFile::new(dir, OUT_MTX_DP, false),
            mtx_oth: OutFile::new(dir, OUT_MTX_OTH, false),
            vcf_base: OutFile::new(dir, OUT_VCF_BASE, settings.gzip),
            vcf_cells: settings
                .genotype
                .then(|| OutFile::new(dir, OUT_VCF_CELLS, settings.gzip)),
            samples: OutFile::new(dir, OUT_SAMPLES, false),
        }
    }

    /// Write the fixed headers before any worker starts.
    fn write_headers(&self, roster: &SampleGroups) -> Result<()> {
        self.mtx_ad.write_text(MTX_HEADER)?;
        self.mtx_dp.write_text(MTX_HEADER)?;
        self.mtx_oth.write_text(MTX_HEADER)?;

        let mut samples = String::new();
        for name in roster.names() {
            samples.push_str(name);
            samples.push('\n');
        }
        self.samples.write_text(&samples)?;

        self.vcf_base.write_text(VCF_BASE_HEADER)?;
        if let Some(cells) = &self.vcf_cells {
            let mut header = output::vcf_cells_meta();
            header.push_str("#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT");
            for name in roster.names() {
                header.push('\t');
                header.push_str(name);
            }
            header.push('\n');
            cells.write_text(&header)?;
        }
        Ok(())
    }
}

/// Run the full pileup: headers, dispatch, merge.
pub fn run(settings: &Settings, roster: &SampleGroups, snvs: &[Snv]) -> Result<()> {
    if snvs.is_empty() {
        bail!("the SNV list is empty");
    }
    if roster.is_empty() {
        bail!("the sample-group roster is empty");
    }

    let finals = FinalOutputs::new(settings);
    finals.write_headers(roster)?;

    let threads = determine_allowed_cpus(settings.threads)?;
    let chunk = (snvs.len() + threads - 1) / threads;
    let slices: Vec<&[Snv]> = snvs.chunks(chunk).collect();
    info!(
        "pileup of {} SNVs across {} groups on {} worker(s)",
        snvs.len(),
        roster.len(),
        slices.len()
    );

    if slices.len() == 1 {
        run_single(settings, roster, snvs, &finals)
    } else {
        run_partitioned(settings, roster, &slices, &finals)
    }
}

/// Single-threaded fast path: the worker appends straight to the final
/// files and the matrix headers are patched in place afterwards.
fn run_single(
    settings: &Settings,
    roster: &SampleGroups,
    snvs: &[Snv],
    finals: &FinalOutputs,
) -> Result<()> {
    let outputs = WorkerOutputs {
        mtx_ad: finals.mtx_ad.clone(),
        mtx_dp: finals.mtx_dp.clone(),
        mtx_oth: finals.mtx_oth.clone(),
        vcf_base: finals.vcf_base.clone(),
        vcf_cells: finals.vcf_cells.clone(),
    };
    let summary = Worker::new(0, settings, roster)?
        .run(snvs, &outputs, true)
        .context("worker 0 failed")?;

    rewrite_mtx(&finals.mtx_ad, summary.ns, roster.len(), summary.nr_ad)?;
    rewrite_mtx(&finals.mtx_dp, summary.ns, roster.len(), summary.nr_dp)?;
    rewrite_mtx(&finals.mtx_oth, summary.ns, roster.len(), summary.nr_oth)?;
    info!("{} of {} SNVs written", summary.ns, snvs.len());
    Ok(())
}

/// Partitioned path: one worker per slice, temporary shards, ordered merge.
fn run_partitioned(
    settings: &Settings,
    roster: &SampleGroups,
    slices: &[&[Snv]],
    finals: &FinalOutputs,
) -> Result<()> {
    let shard_outputs: Vec<WorkerOutputs> = (0..slices.len())
        .map(|k| WorkerOutputs {
            mtx_ad: finals.mtx_ad.shard(k),
            mtx_dp: finals.mtx_dp.shard(k),
            mtx_oth: finals.mtx_oth.shard(k),
            vcf_base: finals.vcf_base.shard(k),
            vcf_cells: finals.vcf_cells.as_ref().map(|f| f.shard(k)),
        })
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(slices.len())
        .build()
        .context("failed to build the worker thread pool")?;
    let results: Vec<Result<WorkerSummary>> = pool.install(|| {
        slices
            .par_iter()
            .zip(shard_outputs.par_iter())
            .enumerate()
            .map(|(k, (slice, outputs))| {
                Worker::new(k, settings, roster)?
                    .run(slice, outputs, false)
                    .with_context(|| format!("worker {} failed", k))
            })
            .collect()
    });

    let merge_result = (|| -> Result<()> {
        let mut summaries = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    error!("{:#}", err);
                    bail!("aborting merge: a worker failed");
                }
            }
        }
        merge(&summaries, &shard_outputs, finals, roster.len())
    })();

    // Shards are temporary on the success and failure paths alike.
    for outputs in &shard_outputs {
        output::remove_shards(&outputs.files());
    }
    merge_result
}

fn merge(
    summaries: &[WorkerSummary],
    shards: &[WorkerOutputs],
    finals: &FinalOutputs,
    cols: usize,
) -> Result<()> {
    let ns: u64 = summaries.iter().map(|s| s.ns).sum();
    let nr_ad: u64 = summaries.iter().map(|s| s.nr_ad).sum();
    let nr_dp: u64 = summaries.iter().map(|s| s.nr_dp).sum();
    let nr_oth: u64 = summaries.iter().map(|s| s.nr_oth).sum();

    let merge_one = |target: &OutFile, nnz: u64, pick: &dyn Fn(&WorkerOutputs) -> OutFile| -> Result<()> {
        let mut out = target.append()?;
        writeln!(out, "{}\t{}\t{}", ns, cols, nnz)?;
        let files: Vec<OutFile> = shards.iter().map(pick).collect();
        let (rows, records) = merge_mtx(out.as_mut(), &files)?;
        if rows != ns || records != nnz {
            return Err(anyhow!(
                "merged '{}' holds {} rows / {} records, expected {} / {}",
                target.path().display(),
                rows,
                records,
                ns,
                nnz
            ));
        }
        out.flush()?;
        Ok(())
    };

    merge_one(&finals.mtx_ad, nr_ad, &|o| o.mtx_ad.clone())?;
    merge_one(&finals.mtx_dp, nr_dp, &|o| o.mtx_dp.clone())?;
    merge_one(&finals.mtx_oth, nr_oth, &|o| o.mtx_oth.clone())?;

    {
        let mut out = finals.vcf_base.append()?;
        let files: Vec<OutFile> = shards.iter().map(|o| o.vcf_base.clone()).collect();
        merge_vcf(out.as_mut(), &files)?;
        out.flush()?;
    }
    if let Some(cells) = &finals.vcf_cells {
        let mut out = cells.append()?;
        let files: Vec<OutFile> = shards
            .iter()
            .filter_map(|o| o.vcf_cells.clone())
            .collect();
        merge_vcf(out.as_mut(), &files)?;
        out.flush()?;
    }

    info!("merged {} shard sets, {} SNVs written", shards.len(), ns);
    Ok(())
}

//! Per-thread pileup over a contiguous slice of the SNV list.

use std::io::Write;

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info};
use rust_htslib::bam;

use crate::config::{tag_bytes, Settings};
use crate::genotype::{genotype_string, phred_scaled};
use crate::groups::SampleGroups;
use crate::output::OutFile;
use crate::pileup::{resolve_read, PushOutcome, ReadFilters, Resolution, SnvPileup, SnvVerdict};
use crate::session::AlignmentSession;
use crate::snv::{idx_to_base, Snv};

/// The worker's output targets: three matrix files, the aggregate VCF and,
/// when genotyping, the per-group VCF. These are either temporary shards or,
/// in the single-threaded fast path, the final files themselves.
pub struct WorkerOutputs {
    pub mtx_ad: OutFile,
    pub mtx_dp: OutFile,
    pub mtx_oth: OutFile,
    pub vcf_base: OutFile,
    pub vcf_cells: Option<OutFile>,
}

impl WorkerOutputs {
    /// All files in this set, for cleanup.
    pub fn files(&self) -> Vec<OutFile> {
        let mut files = vec![
            self.mtx_ad.clone(),
            self.mtx_dp.clone(),
            self.mtx_oth.clone(),
            self.vcf_base.clone(),
        ];
        if let Some(cells) = &self.vcf_cells {
            files.push(cells.clone());
        }
        files
    }
}

/// Counters a worker reports back for the merge step.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerSummary {
    /// SNVs emitted (matrix rows produced by this worker).
    pub ns: u64,
    pub nr_ad: u64,
    pub nr_dp: u64,
    pub nr_oth: u64,
}

struct ShardWriters {
    mtx_ad: Box<dyn Write>,
    mtx_dp: Box<dyn Write>,
    mtx_oth: Box<dyn Write>,
    vcf_base: Box<dyn Write>,
    vcf_cells: Option<Box<dyn Write>>,
}

/// One pileup worker. Owns its alignment sessions, its reusable pileup
/// state and its shard files; nothing here is shared with other workers.
pub struct Worker<'a> {
    index: usize,
    settings: &'a Settings,
    roster: &'a SampleGroups,
    sessions: Vec<AlignmentSession>,
    filters: ReadFilters,
    mplp: SnvPileup,
    record: bam::Record,
    line: String,
}

impl<'a> Worker<'a> {
    /// Open one session per input file and allocate the pileup state.
    pub fn new(index: usize, settings: &'a Settings, roster: &'a SampleGroups) -> Result<Self> {
        let sessions = settings
            .inputs
            .iter()
            .map(|path| AlignmentSession::open(path))
            .collect::<Result<Vec<_>, _>>()?;
        let filters = ReadFilters {
            min_mapq: settings.min_mapq,
            max_flag: settings.max_flag,
            min_len: settings.min_len,
            cell_tag: settings.cell_tag().map(tag_bytes).transpose()?,
            umi_tag: settings.umi_tag.as_deref().map(tag_bytes).transpose()?,
        };
        Ok(Worker {
            index,
            settings,
            roster,
            sessions,
            filters,
            mplp: SnvPileup::new(roster),
            record: bam::Record::new(),
            line: String::with_capacity(256),
        })
    }

    /// Pileup every SNV of the slice in order, streaming emitted SNVs to
    /// the shard files. `append` is set on the single-threaded fast path
    /// where the targets already carry their headers.
    pub fn run(mut self, snvs: &[Snv], outputs: &WorkerOutputs, append: bool) -> Result<WorkerSummary> {
        let open = |file: &OutFile| {
            if append {
                file.append()
            } else {
                file.create()
            }
        };
        let mut writers = ShardWriters {
            mtx_ad: open(&outputs.mtx_ad)?,
            mtx_dp: open(&outputs.mtx_dp)?,
            mtx_oth: open(&outputs.mtx_oth)?,
            vcf_base: open(&outputs.vcf_base)?,
            vcf_cells: outputs.vcf_cells.as_ref().map(open).transpose()?,
        };

        let mut summary = WorkerSummary::default();
        let progress_step = (snvs.len() / 10).max(1);
        for (n, snv) in snvs.iter().enumerate() {
            if n > 0 && n % progress_step == 0 {
                info!(
                    "[worker {}] {:.0}% of {} SNVs processed",
                    self.index,
                    n as f64 * 100.0 / snvs.len() as f64,
                    snvs.len()
                );
            }
            let emitted = self
                .pileup_snv(snv, &mut writers, &mut summary)
                .with_context(|| format!("failed to pileup {}:{}", snv.chrom, snv.pos + 1))?;
            if emitted {
                summary.ns += 1;
            }
            self.mplp.reset();
        }

        writers.mtx_ad.flush()?;
        writers.mtx_dp.flush()?;
        writers.mtx_oth.flush()?;
        writers.vcf_base.flush()?;
        if let Some(cells) = &mut writers.vcf_cells {
            cells.flush()?;
        }
        debug!(
            "[worker {}] done: {} of {} SNVs emitted",
            self.index,
            summary.ns,
            snvs.len()
        );
        Ok(summary)
    }

    /// The per-SNV procedure: fetch covering reads from every session, run
    /// them through the resolver, aggregate, finalize, emit.
    ///
    /// Returns whether the SNV produced output. An unknown contig or a
    /// failed region fetch rejects the SNV; record-level read errors and
    /// CIGAR overruns abort the worker.
    fn pileup_snv(
        &mut self,
        snv: &Snv,
        writers: &mut ShardWriters,
        summary: &mut WorkerSummary,
    ) -> Result<bool> {
        self.mplp.init_alleles(snv);

        let mut pushed: u64 = 0;
        for sid in 0..self.sessions.len() {
            let session = &mut self.sessions[sid];
            let tid = match session.tid_of(&snv.chrom) {
                Some(tid) => tid,
                None => {
                    debug!(
                        "contig '{}' not in '{}', skipping SNV",
                        snv.chrom,
                        session.path().display()
                    );
                    return Ok(false);
                }
            };
            if session.fetch(tid, snv.pos, snv.pos + 1).is_err() {
                debug!(
                    "fetch failed at {}:{} in '{}', skipping SNV",
                    snv.chrom,
                    snv.pos + 1,
                    session.path().display()
                );
                return Ok(false);
            }
            while let Some(res) = self.sessions[sid].read_into(&mut self.record) {
                res?;
                match resolve_read(snv.pos, &self.record, &self.filters)? {
                    Resolution::Resolved(probe) => {
                        match self.mplp.push(&probe, sid, self.settings, self.roster) {
                            PushOutcome::Pushed => pushed += 1,
                            PushOutcome::UnknownCell => {}
                        }
                    }
                    Resolution::MissingTag | Resolution::Filtered => {}
                }
            }
        }

        if pushed < u64::from(self.settings.min_count) {
            return Ok(false);
        }
        let (ref_idx, alt_idx) = match self.mplp.stat(self.settings)? {
            SnvVerdict::Rejected => return Ok(false),
            SnvVerdict::Emit { ref_idx, alt_idx } => (ref_idx, alt_idx),
        };

        summary.nr_ad += u64::from(self.mplp.nr_ad);
        summary.nr_dp += u64::from(self.mplp.nr_dp);
        summary.nr_oth += u64::from(self.mplp.nr_oth);
        self.emit(snv, ref_idx, alt_idx, writers)?;
        Ok(true)
    }

    fn emit(
        &mut self,
        snv: &Snv,
        ref_idx: usize,
        alt_idx: usize,
        writers: &mut ShardWriters,
    ) -> Result<()> {
        // Sparse columns: one line per group with a nonzero value, then an
        // empty line closing this SNV's block. The merge step relies on the
        // empty line to assign row numbers.
        for (gid, plp) in self.mplp.groups().iter().enumerate() {
            if plp.ad > 0 {
                writeln!(writers.mtx_ad, "{}\t{}", gid + 1, plp.ad)?;
            }
            if plp.dp > 0 {
                writeln!(writers.mtx_dp, "{}\t{}", gid + 1, plp.dp)?;
            }
            if plp.oth > 0 {
                writeln!(writers.mtx_oth, "{}\t{}", gid + 1, plp.oth)?;
            }
        }
        writeln!(writers.mtx_ad)?;
        writeln!(writers.mtx_dp)?;
        writeln!(writers.mtx_oth)?;

        use std::fmt::Write as _;
        self.line.clear();
        write!(
            self.line,
            "{}\t{}\t.\t{}\t{}\t.\tPASS\tAD={};DP={};OTH={}",
            snv.chrom,
            snv.pos + 1,
            idx_to_base(ref_idx),
            idx_to_base(alt_idx),
            self.mplp.ad,
            self.mplp.dp,
            self.mplp.oth
        )?;
        writeln!(writers.vcf_base, "{}", self.line)?;

        if let Some(cells) = &mut writers.vcf_cells {
            write!(cells, "{}\tGT:AD:DP:OTH:PL:ALL", self.line)?;
            for plp in self.mplp.groups() {
                if plp.tc == 0 {
                    write!(cells, "\t.:.:.:.:.:.")?;
                    continue;
                }
                let gl = &plp.gl[..plp.ngl];
                write!(
                    cells,
                    "\t{}:{}:{}:{}:{}:{}",
                    genotype_string(gl),
                    plp.ad,
                    plp.dp,
                    plp.oth,
                    phred_scaled(gl).iter().join(","),
                    plp.base_counts.iter().join(",")
                )?;
            }
            writeln!(cells)?;
        }
        Ok(())
    }
}

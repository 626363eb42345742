//! Multi-group pileup state for one SNV.

use rustc_hash::FxHashMap;

use crate::config::Settings;
use crate::errors::CellsnvError;
use crate::genotype::{self, CAP_QUAL, FLOOR_QUAL};
use crate::groups::SampleGroups;
use crate::pileup::plp::GroupPileup;
use crate::pileup::resolver::ReadProbe;
use crate::snv::{Snv, N_IDX};

/// Interning pool for UMI strings: one owned copy per distinct UMI per SNV,
/// shared by all groups. Cleared on reset, keeping bucket capacity.
#[derive(Debug, Default)]
struct UmiPool {
    ids: FxHashMap<Box<str>, u32>,
}

impl UmiPool {
    #[inline]
    fn intern(&mut self, umi: &str) -> u32 {
        if let Some(&id) = self.ids.get(umi) {
            return id;
        }
        let id = self.ids.len() as u32;
        self.ids.insert(umi.into(), id);
        id
    }

    fn clear(&mut self) {
        self.ids.clear();
    }
}

/// Where a resolved read ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Counted into a group (or deliberately discarded as a later read of an
    /// already-seen UMI, which still satisfies the caller's coverage gate).
    Pushed,
    /// The read's barcode is not in the roster; dropped silently.
    UnknownCell,
}

/// Decision produced by [`SnvPileup::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnvVerdict {
    /// The SNV failed the coverage or allele-frequency filter; emit nothing.
    Rejected,
    /// The SNV passed; emit with these effective alleles.
    Emit { ref_idx: usize, alt_idx: usize },
}

/// Pileup aggregator across all sample groups for one SNV.
///
/// The group set is fixed for the lifetime of a worker; only dynamic
/// contents are reset between SNVs.
pub struct SnvPileup {
    groups: Vec<GroupPileup>,
    /// Base counts summed across all groups.
    pub bc: [u32; 5],
    /// Total read count across all groups and bases.
    pub tc: u32,
    /// Alleles supplied by the SNV; filled from inference when unknown.
    pub ref_idx: Option<usize>,
    pub alt_idx: Option<usize>,
    /// Alleles inferred from `bc` (argmax and runner-up).
    pub inf_rid: usize,
    pub inf_aid: usize,
    pub ad: u32,
    pub dp: u32,
    pub oth: u32,
    /// Number of groups with a nonzero AD/DP/OTH, for sparse nnz accounting.
    pub nr_ad: u32,
    pub nr_dp: u32,
    pub nr_oth: u32,
    umi_pool: UmiPool,
}

/// Infer reference and alternate alleles from summed base counts: the
/// largest count wins the reference, the runner-up the alternate, lower
/// base index breaking ties. N is a candidate only when no A/C/G/T was
/// observed at all.
pub fn infer_allele(bc: &[u32; 5]) -> (usize, usize) {
    if bc[..4].iter().all(|&c| c == 0) {
        return (N_IDX, N_IDX);
    }
    let (mut k1, mut k2) = if bc[1] > bc[0] { (1, 0) } else { (0, 1) };
    for i in 2..4 {
        if bc[i] > bc[k1] {
            k2 = k1;
            k1 = i;
        } else if bc[i] > bc[k2] {
            k2 = i;
        }
    }
    (k1, k2)
}

impl SnvPileup {
    /// Allocate per-group state for the whole roster.
    pub fn new(roster: &SampleGroups) -> Self {
        SnvPileup {
            groups: (0..roster.len()).map(|_| GroupPileup::new()).collect(),
            bc: [0; 5],
            tc: 0,
            ref_idx: None,
            alt_idx: None,
            inf_rid: N_IDX,
            inf_aid: N_IDX,
            ad: 0,
            dp: 0,
            oth: 0,
            nr_ad: 0,
            nr_dp: 0,
            nr_oth: 0,
            umi_pool: UmiPool::default(),
        }
    }

    /// Seed the supplied alleles from the SNV before pushing reads.
    pub fn init_alleles(&mut self, snv: &Snv) {
        self.ref_idx = snv.ref_idx;
        self.alt_idx = snv.alt_idx;
    }

    #[inline]
    pub fn groups(&self) -> &[GroupPileup] {
        &self.groups
    }

    /// Route one resolved read to its group and record it.
    ///
    /// `sid` is the index of the alignment file the read came from; it names
    /// the group in sample-ID mode. In barcode mode, reads whose barcode is
    /// not in the roster are dropped without error.
    pub fn push(
        &mut self,
        probe: &ReadProbe<'_>,
        sid: usize,
        settings: &Settings,
        roster: &SampleGroups,
    ) -> PushOutcome {
        let gid = if settings.use_barcodes() {
            match probe.cell_barcode.and_then(|cb| roster.index_of(cb)) {
                Some(gid) => gid,
                None => return PushOutcome::UnknownCell,
            }
        } else {
            sid
        };

        match probe.umi {
            Some(umi) if settings.use_umi() => {
                let umi_id = self.umi_pool.intern(umi);
                self.groups[gid].record_umi(umi_id, probe.base_idx, probe.base_qual);
            }
            _ => self.groups[gid].record(probe.base_idx, probe.base_qual),
        }
        PushOutcome::Pushed
    }

    /// Finalize after all reads were pushed: totals, coverage and MAF
    /// filters, allele inference, derived per-group fields and, when
    /// enabled, genotype likelihoods.
    pub fn stat(&mut self, settings: &Settings) -> Result<SnvVerdict, CellsnvError> {
        for plp in &mut self.groups {
            for j in 0..5 {
                plp.tc += plp.base_counts[j];
                self.bc[j] += plp.base_counts[j];
            }
        }
        self.tc = self.bc.iter().sum();
        if self.tc < settings.min_count {
            return Ok(SnvVerdict::Rejected);
        }

        let (rid, aid) = infer_allele(&self.bc);
        self.inf_rid = rid;
        self.inf_aid = aid;
        if self.ref_idx.is_none() || self.alt_idx.is_none() {
            self.ref_idx = Some(rid);
            self.alt_idx = Some(aid);
        }
        let ref_idx = self.ref_idx.unwrap_or(rid);
        let alt_idx = self.alt_idx.unwrap_or(aid);

        if f64::from(self.bc[alt_idx]) < f64::from(self.tc) * settings.min_maf {
            return Ok(SnvVerdict::Rejected);
        }

        self.ad = self.bc[alt_idx];
        self.dp = self.bc[ref_idx] + self.ad;
        self.oth = self.tc - self.dp;

        for plp in &mut self.groups {
            plp.ad = plp.base_counts[alt_idx];
            if plp.ad > 0 {
                self.nr_ad += 1;
            }
            plp.dp = plp.base_counts[ref_idx] + plp.ad;
            if plp.dp > 0 {
                self.nr_dp += 1;
            }
            plp.oth = plp.tc - plp.dp;
            if plp.oth > 0 {
                self.nr_oth += 1;
            }

            if settings.genotype {
                for j in 0..5 {
                    for &qual in &plp.quality_lists[j] {
                        let vec = genotype::qual_vector(f64::from(qual), CAP_QUAL, FLOOR_QUAL);
                        for k in 0..4 {
                            plp.quality_matrix[j][k] += vec[k];
                        }
                    }
                }
                let (gl, ngl) = genotype::qual_matrix_to_geno(
                    &plp.quality_matrix,
                    &plp.base_counts,
                    ref_idx,
                    alt_idx,
                    settings.double_gl,
                )?;
                plp.gl = gl;
                plp.ngl = ngl;
            }
        }

        Ok(SnvVerdict::Emit { ref_idx, alt_idx })
    }

    /// Reset every group and aggregate field; must run between SNVs.
    pub fn reset(&mut self) {
        for plp in &mut self.groups {
            plp.reset();
        }
        self.bc = [0; 5];
        self.tc = 0;
        self.ref_idx = None;
        self.alt_idx = None;
        self.inf_rid = N_IDX;
        self.inf_aid = N_IDX;
        self.ad = 0;
        self.dp = 0;
        self.oth = 0;
        self.nr_ad = 0;
        self.nr_dp = 0;
        self.nr_oth = 0;
        self.umi_pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Grouping;
    use std::path::PathBuf;

    fn settings(min_count: u32, min_maf: f64, umi: bool) -> Settings {
        Settings {
            inputs: vec![PathBuf::from("in.bam")],
            out_dir: PathBuf::from("out"),
            grouping: Grouping::CellBarcodes {
                tag: "CB".to_string(),
            },
            umi_tag: umi.then(|| "UR".to_string()),
            threads: 1,
            min_count,
            min_maf,
            double_gl: false,
            min_len: 30,
            min_mapq: 20,
            max_flag: 255,
            genotype: false,
            gzip: false,
        }
    }

    fn roster() -> SampleGroups {
        SampleGroups::from_names(vec!["A".to_string(), "B".to_string()]).unwrap()
    }

    fn probe(cb: &'static str, umi: Option<&'static str>, base_idx: usize) -> ReadProbe<'static> {
        ReadProbe {
            cell_barcode: Some(cb),
            umi,
            query_offset: 0,
            base_idx,
            base_qual: 30,
            aligned_len: 50,
        }
    }

    #[test]
    fn infer_allele_matches_reference_vectors() {
        assert_eq!(infer_allele(&[0, 0, 0, 0, 0]), (4, 4));
        assert_eq!(infer_allele(&[10, 0, 5, 0, 0]), (0, 2));
        assert_eq!(infer_allele(&[5, 5, 0, 0, 0]), (0, 1));
        assert_eq!(infer_allele(&[0, 0, 5, 5, 0]), (2, 3));
        // N only competes when A/C/G/T are silent.
        assert_eq!(infer_allele(&[0, 0, 0, 0, 9]), (4, 4));
        assert_eq!(infer_allele(&[1, 0, 0, 0, 9]), (0, 1));
    }

    #[test]
    fn pushing_a_umi_twice_is_idempotent() {
        let settings = settings(1, 0.0, true);
        let roster = roster();
        let mut mplp = SnvPileup::new(&roster);

        let once = probe("A", Some("u1"), 0);
        assert_eq!(mplp.push(&once, 0, &settings, &roster), PushOutcome::Pushed);
        assert_eq!(mplp.push(&once, 0, &settings, &roster), PushOutcome::Pushed);
        assert_eq!(mplp.groups[0].base_counts[0], 1);

        // Same UMI string in another group is an independent observation.
        let other = probe("B", Some("u1"), 2);
        mplp.push(&other, 0, &settings, &roster);
        assert_eq!(mplp.groups[1].base_counts[2], 1);
    }

    #[test]
    fn unknown_barcodes_are_dropped_silently() {
        let settings = settings(1, 0.0, false);
        let roster = roster();
        let mut mplp = SnvPileup::new(&roster);
        assert_eq!(
            mplp.push(&probe("ZZZ", None, 0), 0, &settings, &roster),
            PushOutcome::UnknownCell
        );
        assert_eq!(mplp.groups[0].base_counts, [0; 5]);
    }

    #[test]
    fn stat_balances_mass_across_groups() {
        let settings = settings(1, 0.0, false);
        let roster = roster();
        let mut mplp = SnvPileup::new(&roster);
        mplp.init_alleles(&Snv {
            chrom: "chr1".to_string(),
            pos: 99,
            ref_idx: Some(0),
            alt_idx: Some(1),
        });

        // Cell A: two A reads. Cell B: one C and one A.
        mplp.push(&probe("A", None, 0), 0, &settings, &roster);
        mplp.push(&probe("A", None, 0), 0, &settings, &roster);
        mplp.push(&probe("B", None, 1), 0, &settings, &roster);
        mplp.push(&probe("B", None, 0), 0, &settings, &roster);

        let verdict = mplp.stat(&settings).unwrap();
        assert_eq!(
            verdict,
            SnvVerdict::Emit {
                ref_idx: 0,
                alt_idx: 1
            }
        );
        assert_eq!((mplp.ad, mplp.dp, mplp.oth), (1, 4, 0));
        assert_eq!(mplp.tc, mplp.bc.iter().sum::<u32>());
        let group_dp: u32 = mplp.groups.iter().map(|p| p.dp).sum();
        assert_eq!(group_dp, mplp.dp);
        assert_eq!((mplp.nr_ad, mplp.nr_dp, mplp.nr_oth), (1, 2, 0));
    }

    #[test]
    fn low_coverage_and_low_maf_reject() {
        let roster = roster();

        let settings1 = settings(5, 0.0, false);
        let mut mplp = SnvPileup::new(&roster);
        mplp.push(&probe("A", None, 0), 0, &settings1, &roster);
        assert_eq!(mplp.stat(&settings1).unwrap(), SnvVerdict::Rejected);

        // bc = [100, 0, 1, 0, 0] with min_maf 0.05: alt support 1 < 5.05.
        let settings2 = settings(1, 0.05, false);
        let mut mplp = SnvPileup::new(&roster);
        mplp.init_alleles(&Snv {
            chrom: "chr1".to_string(),
            pos: 0,
            ref_idx: Some(0),
            alt_idx: Some(2),
        });
        for _ in 0..100 {
            mplp.push(&probe("A", None, 0), 0, &settings2, &roster);
        }
        mplp.push(&probe("B", None, 2), 0, &settings2, &roster);
        assert_eq!(mplp.stat(&settings2).unwrap(), SnvVerdict::Rejected);
    }

    #[test]
    fn unknown_alleles_are_inferred() {
        let settings = settings(1, 0.0, false);
        let roster = roster();
        let mut mplp = SnvPileup::new(&roster);

        for _ in 0..8 {
            mplp.push(&probe("A", None, 0), 0, &settings, &roster);
        }
        for _ in 0..4 {
            mplp.push(&probe("B", None, 2), 0, &settings, &roster);
        }
        let verdict = mplp.stat(&settings).unwrap();
        assert_eq!(
            verdict,
            SnvVerdict::Emit {
                ref_idx: 0,
                alt_idx: 2
            }
        );
        assert_eq!((mplp.inf_rid, mplp.inf_aid), (0, 2));
        assert_eq!((mplp.ad, mplp.dp, mplp.oth), (4, 12, 0));
    }

    #[test]
    fn reset_restores_the_initial_state() {
        let settings = settings(1, 0.0, true);
        let roster = roster();
        let mut mplp = SnvPileup::new(&roster);
        mplp.init_alleles(&Snv {
            chrom: "chr1".to_string(),
            pos: 9,
            ref_idx: Some(0),
            alt_idx: Some(1),
        });
        mplp.push(&probe("A", Some("u1"), 0), 0, &settings, &roster);
        mplp.stat(&settings).unwrap();

        mplp.reset();
        assert_eq!(mplp.bc, [0; 5]);
        assert_eq!(mplp.tc, 0);
        assert_eq!(mplp.ref_idx, None);
        assert_eq!((mplp.nr_ad, mplp.nr_dp, mplp.nr_oth), (0, 0, 0));
        assert!(mplp.groups.iter().all(|p| p.umi_count() == 0));

        // The pool restarts, so the same UMI counts again.
        mplp.push(&probe("A", Some("u1"), 0), 0, &settings, &roster);
        assert_eq!(mplp.groups[0].base_counts[0], 1);
    }

    #[test]
    fn relaxing_filters_never_loses_reads() {
        let roster = roster();
        let strict = settings(4, 0.3, false);
        let relaxed = settings(1, 0.0, false);

        let feed = |mplp: &mut SnvPileup, s: &Settings| {
            for _ in 0..3 {
                mplp.push(&probe("A", None, 0), 0, s, &roster);
            }
            mplp.push(&probe("B", None, 2), 0, s, &roster);
        };

        let mut a = SnvPileup::new(&roster);
        feed(&mut a, &strict);
        let strict_verdict = a.stat(&strict).unwrap();

        let mut b = SnvPileup::new(&roster);
        feed(&mut b, &relaxed);
        let relaxed_verdict = b.stat(&relaxed).unwrap();

        // 1 alt of 4 reads: 0.25 < 0.3 rejects under strict, passes relaxed.
        assert_eq!(strict_verdict, SnvVerdict::Rejected);
        assert!(matches!(relaxed_verdict, SnvVerdict::Emit { .. }));
    }
}

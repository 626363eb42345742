//! Immutable run configuration.
//!
//! All settings are resolved once at startup and then shared by reference
//! with every worker. Nothing in here is mutated after construction, so the
//! hot path needs no synchronization.

use std::path::PathBuf;

use crate::errors::CellsnvError;

/// Default aux tag holding the cell barcode.
pub const DEFAULT_CELL_TAG: &str = "CB";
/// Default aux tag holding the UMI.
pub const DEFAULT_UMI_TAG: &str = "UR";

/// Fixed output file names inside the output directory.
pub const OUT_MTX_AD: &str = "cellSNP.tag.AD.mtx";
pub const OUT_MTX_DP: &str = "cellSNP.tag.DP.mtx";
pub const OUT_MTX_OTH: &str = "cellSNP.tag.OTH.mtx";
pub const OUT_VCF_BASE: &str = "cellSNP.base.vcf";
pub const OUT_VCF_CELLS: &str = "cellSNP.cells.vcf";
pub const OUT_SAMPLES: &str = "cellSNP.samples.tsv";

/// How reads are routed to sample groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grouping {
    /// Single-cell mode: route by the barcode stored in `tag`.
    CellBarcodes { tag: String },
    /// Bulk mode: route by input-file index, one group per file.
    SampleIds,
}

/// Resolved, immutable settings for one run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Input alignment files, in group order for sample-ID mode.
    pub inputs: Vec<PathBuf>,
    /// Directory receiving all outputs.
    pub out_dir: PathBuf,
    pub grouping: Grouping,
    /// UMI aux tag; `None` disables UMI deduplication (plain read counts).
    pub umi_tag: Option<String>,
    pub threads: usize,
    /// Minimum aggregated count across all groups for an SNV to be kept.
    pub min_count: u32,
    /// Minimum minor allele frequency for an SNV to be kept.
    pub min_maf: f64,
    /// Also emit the heterozygous dosage likelihoods 0.5 and 1.5.
    pub double_gl: bool,
    /// Minimum aligned (M/=/X) length for a read to be counted.
    pub min_len: u32,
    pub min_mapq: u8,
    /// Reads with a FLAG above this are dropped.
    pub max_flag: u16,
    /// Compute genotype likelihoods and write the per-group VCF.
    pub genotype: bool,
    /// Transparently gzip the final VCF outputs.
    pub gzip: bool,
}

impl Settings {
    #[inline]
    pub fn use_barcodes(&self) -> bool {
        matches!(self.grouping, Grouping::CellBarcodes { .. })
    }

    #[inline]
    pub fn use_umi(&self) -> bool {
        self.umi_tag.is_some()
    }

    #[inline]
    pub fn cell_tag(&self) -> Option<&str> {
        match &self.grouping {
            Grouping::CellBarcodes { tag } => Some(tag),
            Grouping::SampleIds => None,
        }
    }
}

/// Map a user-supplied tag to its effective value; `None`/`none` disables.
pub fn normalize_tag(tag: &str) -> Option<String> {
    match tag {
        "None" | "none" => None,
        other => Some(other.to_string()),
    }
}

/// Resolve the `Auto` UMI-tag mode: UMIs are only meaningful with barcodes.
pub fn resolve_umi_tag(tag: &str, barcodes: bool) -> Option<String> {
    match tag {
        "Auto" => {
            if barcodes {
                Some(DEFAULT_UMI_TAG.to_string())
            } else {
                None
            }
        }
        other => normalize_tag(other),
    }
}

/// Validate that an aux tag is exactly two bytes, as BAM requires.
pub fn tag_bytes(tag: &str) -> Result<[u8; 2], CellsnvError> {
    let bytes = tag.as_bytes();
    if bytes.len() != 2 {
        return Err(CellsnvError::Config(format!(
            "aux tag '{}' must be exactly two characters",
            tag
        )));
    }
    Ok([bytes[0], bytes[1]])
}

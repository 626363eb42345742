//! cellsnv: per-cell and bulk allele counting at candidate SNVs.
//!
//! cellsnv pileups a list of candidate single-nucleotide variants across one
//! or more indexed BAM/SAM/CRAM files and reports, per sample group (a cell
//! barcode or a bulk sample ID), the read support for the reference allele,
//! the alternate allele and all other bases. Results are streamed to
//! MatrixMarket sparse matrices and VCF files; genotype likelihoods are
//! optional.
//!
//! # Modules
//!
//! The main modules are:
//! - [`config`]: immutable run settings shared read-only across workers
//! - [`snv`]: the SNV record, the five-letter base alphabet and list loading
//! - [`groups`]: the ordered sample-group roster (barcodes or sample IDs)
//! - [`session`]: an open indexed alignment file with region fetching
//! - [`pileup`]: read resolution and per-SNV aggregation
//! - [`genotype`]: genotype-likelihood numerics and VCF field formatting
//! - [`output`]: output files, shard lifecycle and the merge protocols
//! - [`worker`]: per-thread pileup over a contiguous SNV slice
//! - [`driver`]: partitioning, dispatch and final merge

pub mod config;
pub mod driver;
pub mod errors;
pub mod genotype;
pub mod groups;
pub mod output;
pub mod pileup;
pub mod session;
pub mod snv;
pub mod worker;

//! Read resolution and per-SNV pileup aggregation.

pub mod mplp;
pub mod plp;
pub mod resolver;

pub use mplp::{infer_allele, PushOutcome, SnvPileup, SnvVerdict};
pub use plp::GroupPileup;
pub use resolver::{resolve_read, ReadFilters, ReadProbe, Resolution};

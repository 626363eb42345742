//! Error types shared across the pileup engine.

use std::io;
use std::path::PathBuf;

use anyhow::Error;
use thiserror::Error;

/// Errors that abort a run or a worker.
///
/// Read-level rejections (missing tags, failed filters) are not errors; they
/// are modelled as [`crate::pileup::resolver::Resolution`] outcomes and
/// silently skipped.
#[derive(Debug, Error)]
pub enum CellsnvError {
    /// Invalid option combination or unusable input metadata.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An input or output file could not be opened.
    #[error("failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An output file could not be written.
    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An alignment file or its index could not be opened or read.
    #[error("alignment error on '{path}': {source}")]
    Alignment {
        path: PathBuf,
        #[source]
        source: rust_htslib::errors::Error,
    },

    /// A record's CIGAR ended before the target position. The region
    /// iterator guarantees overlap, so this indicates a corrupt record.
    #[error("read '{qname}' does not span position {pos} despite covering it")]
    CigarOverrun { qname: String, pos: i64 },

    /// Genotype-likelihood computation produced a non-finite value.
    #[error("genotype likelihood failure: {0}")]
    Numeric(String),
}

/// Returns `true` if the error originated from a broken pipe.
#[inline]
pub fn is_broken_pipe(err: &Error) -> bool {
    err.root_cause()
        .downcast_ref::<io::Error>()
        .map(|io_err| io_err.kind() == io::ErrorKind::BrokenPipe)
        .unwrap_or(false)
}

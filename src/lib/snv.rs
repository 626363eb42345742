//! Candidate SNVs and the five-letter base alphabet.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;

use crate::errors::CellsnvError;

/// The fixed base alphabet; counts and matrices are indexed in this order.
pub const BASES: [char; 5] = ['A', 'C', 'G', 'T', 'N'];

/// Index of N in [`BASES`].
pub const N_IDX: usize = 4;

/// Map an ASCII base to its alphabet index. Anything that is not a single
/// unambiguous base (including `.`) is `None`, meaning "infer from data".
#[inline]
pub fn base_to_idx(base: u8) -> Option<usize> {
    match base {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        b'N' | b'n' => Some(4),
        _ => None,
    }
}

/// Map an alphabet index back to its base character.
#[inline]
pub fn idx_to_base(idx: usize) -> char {
    BASES[idx]
}

/// Map the BAM 4-bit base code (A=1, C=2, G=4, T=8) to the alphabet index.
/// Ambiguity codes collapse to N.
#[inline]
pub fn nt16_to_idx(code: u8) -> usize {
    match code {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => 4,
    }
}

/// One candidate variant. Positions are 0-based internally; `ref_idx` and
/// `alt_idx` are `None` when the input did not pin the allele.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snv {
    pub chrom: String,
    pub pos: i64,
    pub ref_idx: Option<usize>,
    pub alt_idx: Option<usize>,
}

fn open_text(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).map_err(|source| CellsnvError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader: Box<dyn Read> = if path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
    {
        Box::new(MultiGzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(Box::new(BufReader::with_capacity(256 * 1024, reader)))
}

fn parse_allele(field: &str) -> Option<usize> {
    let bytes = field.as_bytes();
    if bytes.len() == 1 {
        base_to_idx(bytes[0])
    } else {
        None
    }
}

/// Load candidate SNVs from a (possibly gzipped) VCF-style text file.
///
/// Header lines start with `#`. Each data line contributes
/// `(CHROM, POS, REF, ALT)`; POS is converted from 1-based to 0-based.
/// A REF or ALT that is not a single base is stored as unknown and inferred
/// during pileup. A line whose REF and ALT are the same known base is
/// rejected as a configuration error.
pub fn load_snvs<P: AsRef<Path>>(path: P) -> Result<Vec<Snv>> {
    let path = path.as_ref();
    let reader = open_text(path)?;
    let mut snvs = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read '{}'", path.display()))?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split('\t');
        let chrom = fields
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow!("missing CHROM on line {} of '{}'", lineno + 1, path.display()))?;
        let pos_field = fields
            .next()
            .ok_or_else(|| anyhow!("missing POS on line {} of '{}'", lineno + 1, path.display()))?;
        let pos: i64 = pos_field.parse().map_err(|_| {
            anyhow!(
                "invalid POS '{}' on line {} of '{}'",
                pos_field,
                lineno + 1,
                path.display()
            )
        })?;
        if pos < 1 {
            return Err(anyhow!(
                "POS must be 1-based and positive on line {} of '{}'",
                lineno + 1,
                path.display()
            ));
        }
        let _id = fields.next();
        let ref_idx = fields.next().and_then(parse_allele);
        let alt_idx = fields.next().and_then(parse_allele);
        if let (Some(r), Some(a)) = (ref_idx, alt_idx) {
            if r == a {
                return Err(CellsnvError::Config(format!(
                    "REF equals ALT ('{}') at {}:{}",
                    idx_to_base(r),
                    chrom,
                    pos
                ))
                .into());
            }
        }
        snvs.push(Snv {
            chrom: chrom.to_string(),
            pos: pos - 1,
            ref_idx,
            alt_idx,
        });
    }

    Ok(snvs)
}

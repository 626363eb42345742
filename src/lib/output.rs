//! Output files, shard lifecycle and the merge protocols.
//!
//! Matrix shards carry no row numbers: each emitted SNV contributes its
//! nonzero `col\tvalue` lines followed by one empty line. The merger assigns
//! globally monotonic 1-based row indices by counting those empty lines,
//! which keeps renumbering independent of the column payload.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::errors::CellsnvError;

/// MatrixMarket preamble shared by the three matrices.
pub const MTX_HEADER: &str = "%%MatrixMarket matrix coordinate integer general\n%\n";

/// Minimal header of the aggregate VCF.
pub const VCF_BASE_HEADER: &str = "##fileformat=VCFv4.2\n\
    #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n";

/// Full meta block of the per-group VCF, without the column line.
pub fn vcf_cells_meta() -> String {
    let mut meta = String::with_capacity(2048);
    meta.push_str("##fileformat=VCFv4.2\n");
    meta.push_str(&format!("##source=cellsnv_v{}\n", env!("CARGO_PKG_VERSION")));
    meta.push_str("##FILTER=<ID=PASS,Description=\"All filters passed\">\n");
    meta.push_str("##FILTER=<ID=.,Description=\"Filter info not available\">\n");
    meta.push_str("##INFO=<ID=DP,Number=1,Type=Integer,Description=\"total counts for ALT and REF\">\n");
    meta.push_str("##INFO=<ID=AD,Number=1,Type=Integer,Description=\"total counts for ALT\">\n");
    meta.push_str("##INFO=<ID=OTH,Number=1,Type=Integer,Description=\"total counts for other bases from REF and ALT\">\n");
    meta.push_str("##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n");
    meta.push_str("##FORMAT=<ID=PL,Number=G,Type=Integer,Description=\"List of Phred-scaled genotype likelihoods\">\n");
    meta.push_str("##FORMAT=<ID=DP,Number=1,Type=Integer,Description=\"total counts for ALT and REF\">\n");
    meta.push_str("##FORMAT=<ID=AD,Number=1,Type=Integer,Description=\"total counts for ALT\">\n");
    meta.push_str("##FORMAT=<ID=OTH,Number=1,Type=Integer,Description=\"total counts for other bases from REF and ALT\">\n");
    meta.push_str("##FORMAT=<ID=ALL,Number=5,Type=Integer,Description=\"total counts for all bases in order of A,C,G,T,N\">\n");
    for contig in (1..=22)
        .map(|c| c.to_string())
        .chain(["X".to_string(), "Y".to_string()])
    {
        meta.push_str(&format!("##contig=<ID={}>\n", contig));
    }
    meta
}

/// One output target: a path plus whether writes go through gzip.
///
/// The gzip wrapper is transparent: readers detect it from the same flag,
/// and gzipped targets gain a `.gz` suffix at construction.
#[derive(Debug, Clone)]
pub struct OutFile {
    path: PathBuf,
    gzip: bool,
}

impl OutFile {
    pub fn new(dir: &Path, name: &str, gzip: bool) -> Self {
        let file_name = if gzip {
            format!("{}.gz", name)
        } else {
            name.to_string()
        };
        OutFile {
            path: dir.join(file_name),
            gzip,
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The temporary shard target for worker `k`: `<final>.<k>`, never
    /// compressed.
    pub fn shard(&self, k: usize) -> OutFile {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", k));
        OutFile {
            path: PathBuf::from(name),
            gzip: false,
        }
    }

    fn wrap_writer(&self, file: File) -> Box<dyn Write> {
        let buffered = BufWriter::with_capacity(256 * 1024, file);
        if self.gzip {
            Box::new(GzEncoder::new(buffered, Compression::default()))
        } else {
            Box::new(buffered)
        }
    }

    /// Open for writing, truncating any previous content.
    pub fn create(&self) -> Result<Box<dyn Write>, CellsnvError> {
        let file = File::create(&self.path).map_err(|source| CellsnvError::Open {
            path: self.path.clone(),
            source,
        })?;
        Ok(self.wrap_writer(file))
    }

    /// Open for appending. On a gzipped target this starts a new gzip
    /// member, which transparent decoders read as one stream.
    pub fn append(&self) -> Result<Box<dyn Write>, CellsnvError> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|source| CellsnvError::Open {
                path: self.path.clone(),
                source,
            })?;
        Ok(self.wrap_writer(file))
    }

    /// Open for buffered line reading, decoding gzip when applicable.
    pub fn reader(&self) -> Result<Box<dyn BufRead>, CellsnvError> {
        let file = File::open(&self.path).map_err(|source| CellsnvError::Open {
            path: self.path.clone(),
            source,
        })?;
        let raw: Box<dyn Read> = if self.gzip {
            Box::new(MultiGzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(Box::new(BufReader::with_capacity(256 * 1024, raw)))
    }

    /// Write a fixed header, truncating the file.
    pub fn write_text(&self, content: &str) -> Result<(), CellsnvError> {
        let mut writer = self.create()?;
        writer
            .write_all(content.as_bytes())
            .map_err(|source| CellsnvError::Write {
                path: self.path.clone(),
                source,
            })
    }

    pub fn remove(&self) -> std::io::Result<()> {
        fs::remove_file(&self.path)
    }
}

/// Append matrix shards to `out`, assigning global 1-based row indices.
///
/// Returns `(rows, records)` as recounted from the shard contents so the
/// caller can cross-check against the workers' own counters.
pub fn merge_mtx(out: &mut dyn Write, shards: &[OutFile]) -> Result<(u64, u64)> {
    let mut row: u64 = 1;
    let mut records: u64 = 0;
    for shard in shards {
        let reader = shard
            .reader()
            .with_context(|| format!("failed to read shard '{}'", shard.path().display()))?;
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                row += 1;
            } else {
                writeln!(out, "{}\t{}", row, line)?;
                records += 1;
            }
        }
    }
    Ok((row - 1, records))
}

/// Append VCF shards to `out` as raw bytes.
pub fn merge_vcf(out: &mut dyn Write, shards: &[OutFile]) -> Result<()> {
    for shard in shards {
        let mut reader = shard
            .reader()
            .with_context(|| format!("failed to read shard '{}'", shard.path().display()))?;
        std::io::copy(&mut reader, out)?;
    }
    Ok(())
}

/// Patch a matrix written by the single-threaded fast path: re-read the `%`
/// preamble, inject the totals line, renumber the shard-format remainder and
/// atomically replace the original.
pub fn rewrite_mtx(target: &OutFile, rows: u64, cols: usize, records: u64) -> Result<()> {
    let staging = target.shard(0);
    {
        let reader = target.reader()?;
        let mut writer = staging.create()?;

        let mut row: u64 = 1;
        let mut seen_records: u64 = 0;
        let mut in_preamble = true;
        for line in reader.lines() {
            let line = line?;
            if in_preamble && line.starts_with('%') {
                writeln!(writer, "{}", line)?;
                continue;
            }
            if in_preamble {
                in_preamble = false;
                writeln!(writer, "{}\t{}\t{}", rows, cols, records)?;
            }
            if line.is_empty() {
                row += 1;
            } else {
                writeln!(writer, "{}\t{}", row, line)?;
                seen_records += 1;
            }
        }
        if in_preamble {
            writeln!(writer, "{}\t{}\t{}", rows, cols, records)?;
        }
        if row - 1 != rows || seen_records != records {
            return Err(anyhow!(
                "matrix '{}' holds {} rows / {} records, expected {} / {}",
                target.path().display(),
                row - 1,
                seen_records,
                rows,
                records
            ));
        }
        writer.flush()?;
    }
    fs::rename(staging.path(), target.path())
        .with_context(|| format!("failed to replace '{}'", target.path().display()))?;
    Ok(())
}

/// Best-effort removal of temporary shard files.
pub fn remove_shards(shards: &[OutFile]) {
    for shard in shards {
        if let Err(err) = shard.remove() {
            log::warn!(
                "failed to remove temporary file '{}': {}",
                shard.path().display(),
                err
            );
        }
    }
}

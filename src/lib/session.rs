//! An open indexed alignment file.

use std::path::{Path, PathBuf};

use rust_htslib::bam::{self, Read};

use crate::errors::CellsnvError;

/// Owns one indexed BAM/SAM/CRAM reader plus a copy of its header for
/// chromosome-name lookup. Sessions are opened once per worker and closed
/// when the worker drops them.
pub struct AlignmentSession {
    path: PathBuf,
    reader: bam::IndexedReader,
    header: bam::HeaderView,
}

impl AlignmentSession {
    /// Open the file and its index. A missing or stale index surfaces here.
    pub fn open(path: &Path) -> Result<Self, CellsnvError> {
        let reader =
            bam::IndexedReader::from_path(path).map_err(|source| CellsnvError::Alignment {
                path: path.to_path_buf(),
                source,
            })?;
        let header = reader.header().to_owned();
        Ok(AlignmentSession {
            path: path.to_path_buf(),
            reader,
            header,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Numeric target id for a chromosome name, if the header knows it.
    #[inline]
    pub fn tid_of(&self, chrom: &str) -> Option<u32> {
        self.header.tid(chrom.as_bytes())
    }

    /// Position the region iterator over `[start, end)` on `tid`.
    pub fn fetch(&mut self, tid: u32, start: i64, end: i64) -> Result<(), CellsnvError> {
        self.reader
            .fetch((tid, start, end))
            .map_err(|source| CellsnvError::Alignment {
                path: self.path.clone(),
                source,
            })
    }

    /// Pull the next record of the current region into `record`.
    #[inline]
    pub fn read_into(&mut self, record: &mut bam::Record) -> Option<Result<(), CellsnvError>> {
        self.reader.read(record).map(|res| {
            res.map_err(|source| CellsnvError::Alignment {
                path: self.path.clone(),
                source,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::{self, header::HeaderRecord};

    #[test]
    fn unknown_contigs_and_missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let bam_path = dir.path().join("empty.bam");

        let mut header = bam::header::Header::new();
        let mut chr = HeaderRecord::new(b"SQ");
        chr.push_tag(b"SN", &"chr1");
        chr.push_tag(b"LN", &1000.to_string());
        header.push_record(&chr);
        let writer =
            bam::Writer::from_path(&bam_path, &header, bam::Format::Bam).expect("opened bam");
        drop(writer);
        bam::index::build(&bam_path, None, bam::index::Type::Bai, 1).unwrap();

        let session = AlignmentSession::open(&bam_path).unwrap();
        assert_eq!(session.tid_of("chr1"), Some(0));
        assert_eq!(session.tid_of("chrMT"), None);

        assert!(AlignmentSession::open(&dir.path().join("absent.bam")).is_err());
    }
}

//! The sample-group roster: output matrix columns in insertion order.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::Result;
use flate2::read::MultiGzDecoder;
use rustc_hash::FxHashMap;

use crate::errors::CellsnvError;

/// Fixed, insertion-ordered set of sample groups (cells or bulk libraries).
///
/// Lookup is by name via a pre-sized hash index; iteration order is the
/// roster order, which defines the column order of every output.
#[derive(Debug, Clone)]
pub struct SampleGroups {
    names: Vec<String>,
    index: FxHashMap<String, usize>,
}

impl SampleGroups {
    /// Build a roster from names in their final order. Duplicates would make
    /// matrix columns ambiguous and are rejected.
    pub fn from_names(names: Vec<String>) -> Result<Self, CellsnvError> {
        let mut index = FxHashMap::with_capacity_and_hasher(names.len(), Default::default());
        for (i, name) in names.iter().enumerate() {
            if index.insert(name.clone(), i).is_some() {
                return Err(CellsnvError::Config(format!(
                    "duplicate sample group '{}'",
                    name
                )));
            }
        }
        Ok(SampleGroups { names, index })
    }

    /// Load cell barcodes from a (possibly gzipped) file, one per line,
    /// and sort them lexicographically.
    pub fn from_barcode_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
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
        let reader = BufReader::with_capacity(256 * 1024, reader);

        let mut names = Vec::with_capacity(1024);
        for line in reader.lines() {
            let line = line?;
            let barcode = line.trim();
            if !barcode.is_empty() {
                names.push(barcode.to_string());
            }
        }
        names.sort_unstable();
        Ok(Self::from_names(names)?)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Roster position of a group name, if present.
    #[inline]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    #[inline]
    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    /// All group names in roster order.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

//! Resolve one alignment record against one target reference position.
//!
//! This is the only place reference-coordinate arithmetic happens; everything
//! downstream works on the resolved [`ReadProbe`].

use rust_htslib::bam::record::{Aux, Cigar, Record};

use crate::errors::CellsnvError;
use crate::snv::nt16_to_idx;

/// Read-level filters, lifted out of [`crate::config::Settings`] once per
/// worker so the hot loop only touches plain fields.
#[derive(Debug, Clone, Copy)]
pub struct ReadFilters {
    pub min_mapq: u8,
    pub max_flag: u16,
    pub min_len: u32,
    /// Required cell-barcode tag, if barcodes are in use.
    pub cell_tag: Option<[u8; 2]>,
    /// Required UMI tag, if UMIs are in use.
    pub umi_tag: Option<[u8; 2]>,
}

/// The aligned base of one record at the target position.
///
/// The string fields alias the record's aux data and must not outlive it;
/// the aggregator copies the UMI into its own pool at push time.
#[derive(Debug)]
pub struct ReadProbe<'a> {
    pub cell_barcode: Option<&'a str>,
    pub umi: Option<&'a str>,
    pub query_offset: usize,
    pub base_idx: usize,
    pub base_qual: u8,
    pub aligned_len: u32,
}

/// Outcome of resolving a record. Hard failures (corrupt CIGAR) travel as
/// errors instead; they are fatal to the worker.
#[derive(Debug)]
pub enum Resolution<'a> {
    Resolved(ReadProbe<'a>),
    /// A required aux tag is absent; the record is malformed for this run.
    MissingTag,
    /// The record failed a policy filter or does not align over the target
    /// base (deletion or reference skip).
    Filtered,
}

fn aux_str<'a>(record: &'a Record, tag: &[u8; 2]) -> Option<&'a str> {
    match record.aux(tag) {
        Ok(Aux::String(s)) => Some(s),
        _ => None,
    }
}

#[inline]
fn encoded_base_at(record: &Record, offset: usize) -> u8 {
    let encoded = record.seq().encoded;
    (encoded[offset / 2] >> (((!offset) & 1) << 2)) & 0b1111
}

/// Walk the record's CIGAR to the target position and extract the aligned
/// base, applying the read-level filters on the way.
///
/// The region iterator guarantees `record.pos() <= pos`; a record violating
/// that, or whose CIGAR ends before reaching `pos`, is corrupt and aborts
/// the worker.
pub fn resolve_read<'a>(
    pos: i64,
    record: &'a Record,
    filters: &ReadFilters,
) -> Result<Resolution<'a>, CellsnvError> {
    // Tag presence first: it is the cheapest reject in runs without UMIs
    // or barcodes, and malformed records must not count as filtered.
    let umi = match filters.umi_tag {
        Some(tag) => match aux_str(record, &tag) {
            Some(u) => Some(u),
            None => return Ok(Resolution::MissingTag),
        },
        None => None,
    };
    let cell_barcode = match filters.cell_tag {
        Some(tag) => match aux_str(record, &tag) {
            Some(cb) => Some(cb),
            None => return Ok(Resolution::MissingTag),
        },
        None => None,
    };

    if record.mapq() < filters.min_mapq {
        return Ok(Resolution::Filtered);
    }
    if record.flags() > filters.max_flag {
        return Ok(Resolution::Filtered);
    }

    let overrun = || CellsnvError::CigarOverrun {
        qname: String::from_utf8_lossy(record.qname()).into_owned(),
        pos,
    };
    if record.pos() > pos {
        return Err(overrun());
    }

    let mut ref_x = record.pos();
    let mut query_y: usize = 0;
    let mut aligned_len: u32 = 0;
    // (query offset of the covering op, reference offset into it)
    let mut hit: Option<(usize, usize)> = None;

    let cigar = record.cigar();
    for op in cigar.iter() {
        match *op {
            Cigar::Match(l) | Cigar::Equal(l) | Cigar::Diff(l) => {
                let (px, py) = (ref_x, query_y);
                ref_x += i64::from(l);
                query_y += l as usize;
                aligned_len += l;
                if hit.is_none() && ref_x > pos {
                    hit = Some((py, (pos - px) as usize));
                }
            }
            Cigar::Del(l) | Cigar::RefSkip(l) => {
                ref_x += i64::from(l);
                if hit.is_none() && ref_x > pos {
                    // The target base is deleted or skipped in this read.
                    return Ok(Resolution::Filtered);
                }
            }
            Cigar::Ins(l) | Cigar::SoftClip(l) => {
                query_y += l as usize;
            }
            Cigar::HardClip(_) | Cigar::Pad(_) => {}
        }
    }

    let (py, within) = hit.ok_or_else(overrun)?;
    let query_offset = py + within;
    if query_offset >= record.seq_len() {
        return Err(overrun());
    }

    if aligned_len < filters.min_len {
        return Ok(Resolution::Filtered);
    }

    Ok(Resolution::Resolved(ReadProbe {
        cell_barcode,
        umi,
        query_offset,
        base_idx: nt16_to_idx(encoded_base_at(record, query_offset)),
        base_qual: record.qual()[query_offset],
        aligned_len,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_htslib::bam::record::CigarString;

    fn filters() -> ReadFilters {
        ReadFilters {
            min_mapq: 20,
            max_flag: 255,
            min_len: 30,
            cell_tag: None,
            umi_tag: None,
        }
    }

    fn record(pos: i64, cigar: Vec<Cigar>, seq: &[u8]) -> Record {
        let cigar = CigarString(cigar);
        let qual = vec![30u8; seq.len()];
        let mut rec = Record::new();
        rec.set(b"read1", Some(&cigar), seq, &qual);
        rec.set_pos(pos);
        rec.set_mapq(60);
        rec.set_flags(0);
        rec
    }

    fn probe_of(res: Resolution<'_>) -> ReadProbe<'_> {
        match res {
            Resolution::Resolved(p) => p,
            other => panic!("expected a resolved probe, got {:?}", other),
        }
    }

    #[test]
    fn plain_match_resolves_to_the_offset_base() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGT";
        let rec = record(100, vec![Cigar::Match(32)], seq);
        let probe = probe_of(resolve_read(105, &rec, &filters()).unwrap());
        assert_eq!(probe.query_offset, 5);
        assert_eq!(probe.base_idx, 1); // C
        assert_eq!(probe.base_qual, 30);
        assert_eq!(probe.aligned_len, 32);
    }

    #[test]
    fn leading_soft_clips_shift_the_query() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGTACGTACGT";
        let rec = record(100, vec![Cigar::SoftClip(5), Cigar::Match(35)], seq);
        let probe = probe_of(resolve_read(100, &rec, &filters()).unwrap());
        assert_eq!(probe.query_offset, 5);
        assert_eq!(probe.base_idx, 1); // C at query index 5
    }

    #[test]
    fn insertions_advance_only_the_query() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGTACGT";
        // 10M 4I 22M: reference position 115 sits 5 bases into the second block.
        let rec = record(
            100,
            vec![Cigar::Match(10), Cigar::Ins(4), Cigar::Match(22)],
            seq,
        );
        let probe = probe_of(resolve_read(115, &rec, &filters()).unwrap());
        assert_eq!(probe.query_offset, 10 + 4 + 5);
    }

    #[test]
    fn deletions_and_refskips_reject_the_read() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGT";
        let rec = record(
            100,
            vec![Cigar::Match(16), Cigar::Del(10), Cigar::Match(16)],
            seq,
        );
        assert!(matches!(
            resolve_read(120, &rec, &filters()).unwrap(),
            Resolution::Filtered
        ));
        let rec = record(
            100,
            vec![Cigar::Match(16), Cigar::RefSkip(100), Cigar::Match(16)],
            seq,
        );
        assert!(matches!(
            resolve_read(150, &rec, &filters()).unwrap(),
            Resolution::Filtered
        ));
        // Positions beyond the deletion still resolve.
        let rec = record(
            100,
            vec![Cigar::Match(16), Cigar::Del(10), Cigar::Match(16)],
            seq,
        );
        let probe = probe_of(resolve_read(126, &rec, &filters()).unwrap());
        assert_eq!(probe.query_offset, 16);
    }

    #[test]
    fn aligned_length_counts_only_match_ops() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGT";
        // 16M + 16S: aligned length 16 < min_len 30.
        let rec = record(100, vec![Cigar::Match(16), Cigar::SoftClip(16)], seq);
        assert!(matches!(
            resolve_read(105, &rec, &filters()).unwrap(),
            Resolution::Filtered
        ));
    }

    #[test]
    fn mapq_and_flag_filters_apply_before_the_walk() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGT";
        let mut rec = record(100, vec![Cigar::Match(32)], seq);
        rec.set_mapq(5);
        assert!(matches!(
            resolve_read(105, &rec, &filters()).unwrap(),
            Resolution::Filtered
        ));

        let mut rec = record(100, vec![Cigar::Match(32)], seq);
        rec.set_flags(1024);
        assert!(matches!(
            resolve_read(105, &rec, &filters()).unwrap(),
            Resolution::Filtered
        ));
    }

    #[test]
    fn missing_required_tags_are_malformed() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGT";
        let rec = record(100, vec![Cigar::Match(32)], seq);
        let mut f = filters();
        f.umi_tag = Some(*b"UR");
        assert!(matches!(
            resolve_read(105, &rec, &f).unwrap(),
            Resolution::MissingTag
        ));

        let mut rec = record(100, vec![Cigar::Match(32)], seq);
        rec.push_aux(b"UR", Aux::String("AACCGG")).unwrap();
        f.cell_tag = Some(*b"CB");
        assert!(matches!(
            resolve_read(105, &rec, &f).unwrap(),
            Resolution::MissingTag
        ));

        rec.push_aux(b"CB", Aux::String("BARCODE")).unwrap();
        let probe = probe_of(resolve_read(105, &rec, &f).unwrap());
        assert_eq!(probe.umi, Some("AACCGG"));
        assert_eq!(probe.cell_barcode, Some("BARCODE"));
    }

    #[test]
    fn cigar_ending_before_the_target_is_fatal() {
        let seq = b"ACGTACGTACGTACGTACGTACGTACGTACGT";
        let rec = record(100, vec![Cigar::Match(32)], seq);
        assert!(resolve_read(200, &rec, &filters()).is_err());
        // A record starting past the target violates the iterator contract.
        let rec = record(300, vec![Cigar::Match(32)], seq);
        assert!(resolve_read(200, &rec, &filters()).is_err());
    }
}

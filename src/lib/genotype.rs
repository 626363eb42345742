//! Genotype-likelihood numerics.
//!
//! A read's base quality maps to an error probability `e`; the likelihood of
//! observing that base under an alt-allele dosage `d` (out of ploidy 2) is
//! `f*(1-e) + (1-f)*e/3` for a matching base and the mirror for the other
//! allele, with `f = d/2`. Summing the per-read log terms per base row gives
//! the 5x4 quality matrix that [`qual_matrix_to_geno`] folds into
//! log-likelihoods for the candidate dosages.

use crate::errors::CellsnvError;

/// Qualities above this carry no extra weight.
pub const CAP_QUAL: f64 = 45.0;
/// Lower bound applied to the quality value before conversion, keeping every
/// mixture probability strictly positive.
pub const FLOOR_QUAL: f64 = 0.25;

/// Per-read log-probability terms for one base quality.
///
/// Index 0: the observed base matches both alleles (dosage 0 for ref reads,
/// dosage 2 for alt reads). Index 1: the observed base matches neither.
/// Index 2: heterozygous mixture (dosage 1). Index 3: quarter mixture used
/// by the doublet dosages 0.5 and 1.5.
#[inline]
pub fn qual_vector(qual: f64, cap_qual: f64, min_qual: f64) -> [f64; 4] {
    let q = qual.min(cap_qual).max(min_qual);
    let e = 10f64.powf(-q / 10.0);
    [
        (1.0 - e).ln(),
        (e / 3.0).ln(),
        (0.5 - e / 3.0).ln(),
        (0.75 - 2.0 * e / 3.0).ln(),
    ]
}

/// Fold a per-group quality matrix into genotype log-likelihoods.
///
/// Returns the likelihood vector and its length: dosages `[0, 1, 2]`, or
/// `[0, 0.5, 1, 1.5, 2]` when `double_gl` is set. The three-quarter mixture
/// of a doublet dosage is constant per read (`ln 1/4`), so those terms come
/// from the raw base counts rather than the matrix.
pub fn qual_matrix_to_geno(
    qmat: &[[f64; 4]; 5],
    bc: &[u32; 5],
    ref_idx: usize,
    alt_idx: usize,
    double_gl: bool,
) -> Result<([f64; 5], usize), CellsnvError> {
    let quarter = 0.25f64.ln();
    let hom_ref = qmat[ref_idx][0] + qmat[alt_idx][1];
    let het = qmat[ref_idx][2] + qmat[alt_idx][2];
    let hom_alt = qmat[ref_idx][1] + qmat[alt_idx][0];

    let mut gl = [0.0f64; 5];
    let ngl = if double_gl {
        let dose_half = qmat[ref_idx][3] + f64::from(bc[alt_idx]) * quarter;
        let dose_three_half = f64::from(bc[ref_idx]) * quarter + qmat[alt_idx][3];
        gl[..5].copy_from_slice(&[hom_ref, dose_half, het, dose_three_half, hom_alt]);
        5
    } else {
        gl[..3].copy_from_slice(&[hom_ref, het, hom_alt]);
        3
    };

    if gl[..ngl].iter().any(|v| !v.is_finite()) {
        return Err(CellsnvError::Numeric(format!(
            "non-finite genotype likelihood for ref={} alt={}",
            ref_idx, alt_idx
        )));
    }
    Ok((gl, ngl))
}

const GT_THREE: [&str; 3] = ["0/0", "1/0", "1/1"];
const GT_FIVE: [&str; 5] = ["0/0", "0.5", "1/0", "1.5", "1/1"];

/// The genotype call: the dosage with the highest likelihood, earlier dosage
/// winning ties.
pub fn genotype_string(gl: &[f64]) -> &'static str {
    let mut best = 0;
    for (i, v) in gl.iter().enumerate() {
        if *v > gl[best] {
            best = i;
        }
    }
    match gl.len() {
        5 => GT_FIVE[best],
        _ => GT_THREE[best],
    }
}

/// Phred-scale log-likelihoods relative to the best genotype.
pub fn phred_scaled(gl: &[f64]) -> Vec<i64> {
    let max = gl.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    gl.iter()
        .map(|v| ((max - v) * 10.0 / std::f64::consts::LN_10).round() as i64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulate(qmat: &mut [[f64; 4]; 5], base: usize, qual: f64) {
        let vec = qual_vector(qual, CAP_QUAL, FLOOR_QUAL);
        for k in 0..4 {
            qmat[base][k] += vec[k];
        }
    }

    #[test]
    fn qual_vector_is_clamped() {
        assert_eq!(qual_vector(90.0, CAP_QUAL, FLOOR_QUAL), qual_vector(45.0, CAP_QUAL, FLOOR_QUAL));
        assert_eq!(qual_vector(0.0, CAP_QUAL, FLOOR_QUAL), qual_vector(0.25, CAP_QUAL, FLOOR_QUAL));
    }

    #[test]
    fn qual_vector_terms_are_ordered() {
        let v = qual_vector(30.0, CAP_QUAL, FLOOR_QUAL);
        // For a good base: match > quarter mixture > het mixture > mismatch.
        assert!(v[0] > v[3] && v[3] > v[2] && v[2] > v[1]);
    }

    #[test]
    fn hom_ref_reads_call_hom_ref() {
        let mut qmat = [[0.0; 4]; 5];
        let mut bc = [0u32; 5];
        for _ in 0..10 {
            accumulate(&mut qmat, 0, 30.0);
            bc[0] += 1;
        }
        let (gl, ngl) = qual_matrix_to_geno(&qmat, &bc, 0, 2, false).unwrap();
        assert_eq!(ngl, 3);
        assert_eq!(genotype_string(&gl[..ngl]), "0/0");
        let pl = phred_scaled(&gl[..ngl]);
        assert_eq!(pl[0], 0);
        assert!(pl[1] > 0 && pl[2] > pl[1]);
    }

    #[test]
    fn balanced_reads_call_het() {
        let mut qmat = [[0.0; 4]; 5];
        let mut bc = [0u32; 5];
        for _ in 0..8 {
            accumulate(&mut qmat, 0, 30.0);
            accumulate(&mut qmat, 2, 30.0);
            bc[0] += 1;
            bc[2] += 1;
        }
        let (gl, ngl) = qual_matrix_to_geno(&qmat, &bc, 0, 2, false).unwrap();
        assert_eq!(genotype_string(&gl[..ngl]), "1/0");
    }

    #[test]
    fn double_gl_adds_doublet_dosages() {
        let mut qmat = [[0.0; 4]; 5];
        let mut bc = [0u32; 5];
        for _ in 0..6 {
            accumulate(&mut qmat, 1, 30.0);
            bc[1] += 1;
        }
        for _ in 0..2 {
            accumulate(&mut qmat, 3, 30.0);
            bc[3] += 1;
        }
        let (gl, ngl) = qual_matrix_to_geno(&qmat, &bc, 1, 3, true).unwrap();
        assert_eq!(ngl, 5);
        // A 3:1 ref:alt split fits dosage 0.5 better than 0 or 1.
        assert_eq!(genotype_string(&gl[..ngl]), "0.5");
    }
}

/// Compute the inner product of two equal-length vectors.
///
/// Accumulates in f64 so that scores for 512-dim embeddings are stable
/// enough to compare against a threshold. Callers check lengths; extra
/// components of the longer slice are ignored.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum::<f64>() as f32
}

/// Scale `v` in place to unit L2 norm. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v
        .iter()
        .map(|&x| x as f64 * x as f64)
        .sum::<f64>()
        .sqrt();
    if norm == 0.0 {
        return;
    }
    let s = (1.0 / norm) as f32;
    for x in v.iter_mut() {
        *x *= s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_unit() {
        let d = inner_product(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]);
        assert!((d - 1.0).abs() < 1e-6, "identical: got {d}");
    }

    #[test]
    fn test_orthogonal() {
        let d = inner_product(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert_eq!(d, 0.0);
    }

    #[test]
    fn test_opposite() {
        let d = inner_product(&[1.0, 0.0, 0.0], &[-1.0, 0.0, 0.0]);
        assert!((d + 1.0).abs() < 1e-6, "opposite: got {d}");
    }

    #[test]
    fn test_raw_not_cosine() {
        // Not normalized: the score scales with magnitude.
        let d = inner_product(&[2.0, 0.0], &[3.0, 0.0]);
        assert!((d - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize() {
        let mut v = [3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector() {
        let mut v = [0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, [0.0, 0.0, 0.0]);
    }
}

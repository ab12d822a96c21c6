//! Small dense-vector helpers shared by the builder and the query path.

pub const NORM_EPSILON: f32 = 1e-4;

/// Scales `v` to unit length in place and returns the original norm.
/// A zero vector stays zero.
pub fn l2_normalize(v: &mut [f32]) -> f32 {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    norm
}

pub fn normalized(mut v: Vec<f32>) -> Vec<f32> {
    l2_normalize(&mut v);
    v
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn is_normalized(v: &[f32]) -> bool {
    (dot(v, v) - 1.0).abs() <= NORM_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let mut v = vec![3.0, 4.0, 0.0];
        assert!((l2_normalize(&mut v) - 5.0).abs() < 1e-6);
        let once = v.clone();
        l2_normalize(&mut v);
        for (a, b) in once.iter().zip(&v) {
            assert!((a - b).abs() < 1e-6);
        }
        assert!(is_normalized(&v));
    }

    #[test]
    fn zero_vector_stays_zero() {
        let mut v = vec![0.0; 4];
        assert_eq!(l2_normalize(&mut v), 0.0);
        assert!(v.iter().all(|x| *x == 0.0));
        assert!(!is_normalized(&v));
    }
}

//! Numeric helpers shared by the item models and integration passes.

pub const EPSILON: f64 = 1e-10;

#[inline]
pub fn logsumexp(arr: &[f64]) -> f64 {
    if arr.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max_val = arr.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val.is_infinite() {
        return max_val;
    }
    let sum: f64 = arr.iter().map(|x| (x - max_val).exp()).sum();
    max_val + sum.ln()
}

#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let exp_x = x.exp();
        exp_x / (1.0 + exp_x)
    }
}

#[inline]
pub fn log_sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        -(-x).exp().ln_1p()
    } else {
        x - x.exp().ln_1p()
    }
}

/// Number of cells in a packed lower triangle of an `n x n` matrix.
#[inline]
pub fn tri_len(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Packed lower-triangle offset of `(r1, r2)`; argument order does not matter.
#[inline]
pub fn tri_index(r1: usize, r2: usize) -> usize {
    let (lo, hi) = if r1 <= r2 { (r1, r2) } else { (r2, r1) };
    hi * (hi + 1) / 2 + lo
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn logsumexp_matches_direct_sum() {
        let xs = [-1.0, 0.5, 2.0];
        let direct: f64 = xs.iter().map(|x: &f64| x.exp()).sum::<f64>().ln();
        assert_relative_eq!(logsumexp(&xs), direct, epsilon = 1e-12);
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
        assert_eq!(logsumexp(&[f64::NEG_INFINITY; 3]), f64::NEG_INFINITY);
    }

    #[test]
    fn log_sigmoid_is_stable() {
        assert_relative_eq!(log_sigmoid(0.0), 0.5f64.ln(), epsilon = 1e-14);
        assert_relative_eq!(log_sigmoid(-800.0), -800.0, epsilon = 1e-9);
        assert_relative_eq!(sigmoid(3.0) + sigmoid(-3.0), 1.0, epsilon = 1e-14);
    }

    #[test]
    fn triangle_indexing() {
        assert_eq!(tri_len(3), 6);
        assert_eq!(tri_index(0, 0), 0);
        assert_eq!(tri_index(0, 1), 1);
        assert_eq!(tri_index(1, 1), 2);
        assert_eq!(tri_index(2, 0), 3);
        assert_eq!(tri_index(2, 2), 5);
    }
}

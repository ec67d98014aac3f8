use faer::{Mat, MatRef};

use crate::error::{FugwError, Result};

////////////////////
// Util functions //
////////////////////

/// Numerically stable log-sum-exp over an iterator
///
/// An empty iterator yields `-inf`. NaN values propagate into the result.
///
/// ### Params
///
/// * `values` - The values to reduce.
///
/// ### Returns
///
/// `log(Σ exp(x))`
pub fn log_sum_exp<I>(values: I) -> f64
where
    I: Iterator<Item = f64> + Clone,
{
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    let sum: f64 = values.map(|x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Calculates the columns means of a matrix
///
/// ### Params
///
/// * `mat` - The matrix for which to calculate the column-wise means
///
/// ### Returns
///
/// Vector of the column means.
pub fn col_means(mat: MatRef<f64>) -> Vec<f64> {
    let n_rows = mat.nrows();
    if n_rows == 0 {
        return vec![0.0; mat.ncols()];
    }
    let inv_n = 1.0 / n_rows as f64;

    (0..mat.ncols())
        .map(|j| (0..n_rows).map(|i| mat[(i, j)]).sum::<f64>() * inv_n)
        .collect()
}

/// Largest absolute value of a slice (0 for an empty slice)
pub fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0_f64, |acc, &x| acc.max(x.abs()))
}

/// Largest absolute element-wise difference between two slices
pub fn max_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0_f64, |acc, (&x, &y)| acc.max((x - y).abs()))
}

/// Centre, zero-pad and scale a geometry embedding
///
/// Column means are removed so the inner products form a translation
/// invariant Gram matrix. The result is padded with zero columns up to `rank`
/// and scaled by the largest row norm, which bounds every inner product to
/// `[-1, 1]`.
///
/// ### Params
///
/// * `embedding` - Embedding with rows = points and columns = rank.
/// * `rank` - Output rank. Must be `>= embedding.ncols()`.
///
/// ### Returns
///
/// The normalised `n x rank` embedding.
pub fn normalise_embedding(embedding: MatRef<f64>, rank: usize) -> Mat<f64> {
    assert!(
        rank >= embedding.ncols(),
        "Target rank {} is smaller than the embedding rank {}",
        rank,
        embedding.ncols()
    );

    let n = embedding.nrows();
    let r = embedding.ncols();
    let means = col_means(embedding);

    let mut centred = Mat::from_fn(n, rank, |i, j| {
        if j < r {
            embedding[(i, j)] - means[j]
        } else {
            0.0
        }
    });

    let max_norm = (0..n)
        .map(|i| (0..r).map(|j| centred[(i, j)].powi(2)).sum::<f64>().sqrt())
        .fold(0.0_f64, f64::max);

    if max_norm > 0.0 && max_norm.is_finite() {
        let inv = 1.0 / max_norm;
        for j in 0..r {
            for i in 0..n {
                centred[(i, j)] *= inv;
            }
        }
    }

    centred
}

/// Row-wise Khatri-Rao product of a matrix with itself
///
/// Row `i` of the output is `vec(x_i x_iᵀ)`, so that
/// `(x_i · x_k)² = κ_i · κ_k`.
///
/// ### Params
///
/// * `mat` - Matrix with rows = points and columns = rank.
///
/// ### Returns
///
/// The `n x rank²` matrix.
pub fn khatri_rao_rows(mat: MatRef<f64>) -> Mat<f64> {
    let r = mat.ncols();
    Mat::from_fn(mat.nrows(), r * r, |i, c| mat[(i, c / r)] * mat[(i, c % r)])
}

/// Validate and normalise optional point weights
///
/// ### Params
///
/// * `weights` - Optional user supplied weights. `None` gives uniform weights.
/// * `n` - Number of points in the domain.
/// * `name` - Parameter name for the error message.
///
/// ### Returns
///
/// Weights summing to 1.
pub fn normalise_weights(weights: Option<&[f64]>, n: usize, name: &'static str) -> Result<Vec<f64>> {
    match weights {
        None => Ok(vec![1.0 / n as f64; n]),
        Some(w) => {
            if w.len() != n {
                return Err(FugwError::DimensionMismatch {
                    what: name,
                    expected: n,
                    found: w.len(),
                });
            }
            if w.iter().any(|&x| !x.is_finite() || x <= 0.0) {
                return Err(FugwError::invalid_parameter(
                    name,
                    "weights must be finite and strictly positive",
                ));
            }
            let total: f64 = w.iter().sum();
            Ok(w.iter().map(|&x| x / total).collect())
        }
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use faer::mat;

    #[test]
    fn test_log_sum_exp() {
        let vals = [1.0_f64, 2.0, 3.0];
        let expected = (1.0_f64.exp() + 2.0_f64.exp() + 3.0_f64.exp()).ln();
        assert_relative_eq!(log_sum_exp(vals.iter().copied()), expected, epsilon = 1e-12);

        // no overflow for large values
        let big = [1000.0_f64, 1000.0];
        assert_relative_eq!(
            log_sum_exp(big.iter().copied()),
            1000.0 + 2.0_f64.ln(),
            epsilon = 1e-9
        );

        let empty: [f64; 0] = [];
        assert_eq!(log_sum_exp(empty.iter().copied()), f64::NEG_INFINITY);
    }

    #[test]
    fn test_log_sum_exp_propagates_nan() {
        let vals = [1.0_f64, f64::NAN];
        assert!(log_sum_exp(vals.iter().copied()).is_nan());
    }

    #[test]
    fn test_normalise_embedding() {
        let embd = mat![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let normed = normalise_embedding(embd.as_ref(), 3);

        assert_eq!(normed.nrows(), 3);
        assert_eq!(normed.ncols(), 3);

        // centred
        for j in 0..3 {
            let s: f64 = (0..3).map(|i| normed[(i, j)]).sum();
            assert_relative_eq!(s, 0.0, epsilon = 1e-12);
        }
        // padding column stays zero
        for i in 0..3 {
            assert_eq!(normed[(i, 2)], 0.0);
        }
        // largest row norm is one
        let max_norm = (0..3)
            .map(|i| (0..3).map(|j| normed[(i, j)].powi(2)).sum::<f64>().sqrt())
            .fold(0.0_f64, f64::max);
        assert_relative_eq!(max_norm, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_khatri_rao_rows() {
        let x = mat![[1.0, 2.0], [3.0, -1.0]];
        let k = khatri_rao_rows(x.as_ref());

        let dot = |a: usize, b: usize| (0..2).map(|c| x[(a, c)] * x[(b, c)]).sum::<f64>();
        let kdot = |a: usize, b: usize| (0..4).map(|c| k[(a, c)] * k[(b, c)]).sum::<f64>();

        assert_relative_eq!(kdot(0, 1), dot(0, 1).powi(2), epsilon = 1e-12);
        assert_relative_eq!(kdot(0, 0), dot(0, 0).powi(2), epsilon = 1e-12);
    }

    #[test]
    fn test_normalise_weights() {
        let uniform = normalise_weights(None, 4, "w").unwrap();
        assert_eq!(uniform, vec![0.25; 4]);

        let w = normalise_weights(Some(&[1.0, 3.0]), 2, "w").unwrap();
        assert_relative_eq!(w[0], 0.25);
        assert_relative_eq!(w[1], 0.75);

        assert!(matches!(
            normalise_weights(Some(&[1.0]), 2, "w"),
            Err(FugwError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            normalise_weights(Some(&[1.0, -1.0]), 2, "w"),
            Err(FugwError::InvalidParameter { .. })
        ));
    }
}

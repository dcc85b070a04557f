//! Numeric helpers over 1-D score vectors.
//!
//! All of these tolerate rows where every entry is `-inf` (a fully banned
//! vocabulary) without producing NaN.

use std::cmp::Ordering;

use ndarray::{Array1, ArrayView1};

/// Log-sum-exp of the values. `-inf` when every value is `-inf`.
pub fn log_sum_exp(values: ArrayView1<'_, f32>) -> f32 {
    let max_val = values.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    if max_val == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = values.iter().map(|&x| (x - max_val).exp()).sum();
    max_val + sum.ln()
}

pub fn log_softmax_1d(logits: ArrayView1<'_, f32>) -> Array1<f32> {
    let lse = log_sum_exp(logits);
    if lse == f32::NEG_INFINITY {
        return Array1::from_elem(logits.len(), f32::NEG_INFINITY);
    }
    logits.mapv(|x| x - lse)
}

/// Softmax. A fully banned row maps to all zeros.
pub fn softmax_1d(logits: ArrayView1<'_, f32>) -> Array1<f32> {
    let max_val = logits.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    if max_val == f32::NEG_INFINITY {
        return Array1::zeros(logits.len());
    }
    let exps = logits.mapv(|x| (x - max_val).exp());
    let sum = exps.sum();
    exps / sum
}

/// Index of the largest value; the first index wins on ties.
pub fn argmax(values: ArrayView1<'_, f32>) -> usize {
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v > best {
            best = v;
            best_idx = idx;
        }
    }
    best_idx
}

/// Highest score first. A total order: NaN ranks with `-inf`, and the two
/// zeros are equal.
pub fn cmp_scores_desc(a: f32, b: f32) -> Ordering {
    score_key(b).total_cmp(&score_key(a))
}

fn score_key(x: f32) -> f32 {
    if x.is_nan() { f32::NEG_INFINITY } else { x + 0.0 }
}

/// Descending order by value, ties by ascending index.
pub fn cmp_desc_then_index(a: (usize, f32), b: (usize, f32)) -> Ordering {
    cmp_scores_desc(a.1, b.1).then_with(|| a.0.cmp(&b.0))
}

/// The `k` highest entries as `(index, value)`, highest first.
pub fn top_k(values: ArrayView1<'_, f32>, k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = values.iter().copied().enumerate().collect();
    indexed.sort_by(|&a, &b| cmp_desc_then_index(a, b));
    indexed.truncate(k);
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_log_softmax_normalizes() {
        let logits = array![1.0f32, 2.0, 3.0];
        let lp = log_softmax_1d(logits.view());
        let total: f32 = lp.iter().map(|x| x.exp()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-5);
        assert!(lp[2] > lp[1] && lp[1] > lp[0]);
    }

    #[test]
    fn test_fully_banned_row_has_no_nan() {
        let logits = array![f32::NEG_INFINITY, f32::NEG_INFINITY];
        assert!(log_softmax_1d(logits.view()).iter().all(|x| *x == f32::NEG_INFINITY));
        assert!(softmax_1d(logits.view()).iter().all(|x| *x == 0.0));
        assert_eq!(log_sum_exp(logits.view()), f32::NEG_INFINITY);
        assert_eq!(argmax(logits.view()), 0);
    }

    #[test]
    fn test_argmax_first_index_wins() {
        let values = array![1.0f32, 5.0, 5.0, 2.0];
        assert_eq!(argmax(values.view()), 1);
    }

    #[test]
    fn test_top_k_ties_by_index() {
        let values = array![0.5f32, 0.9, 0.9, 0.1];
        let top = top_k(values.view(), 3);
        assert_eq!(top.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2, 0]);
    }

    #[test]
    fn test_top_k_orders_nan_with_neg_infinity() {
        let values = array![f32::NAN, 0.0, -0.0, f32::NEG_INFINITY, 1.0];
        let top = top_k(values.view(), 5);
        assert_eq!(top.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![4, 1, 2, 0, 3]);
        assert_eq!(cmp_scores_desc(f32::NAN, f32::NEG_INFINITY), Ordering::Equal);
        assert_eq!(cmp_scores_desc(-1.0, f32::NAN), Ordering::Less);
    }

    #[test]
    fn test_log_sum_exp_matches_naive() {
        let values = array![0.1f32, -0.3, 2.0];
        let naive = values.iter().map(|x| x.exp()).sum::<f32>().ln();
        assert_abs_diff_eq!(log_sum_exp(values.view()), naive, epsilon = 1e-5);
    }
}

//! Cost functions used to score discriminator outputs and feature statistics.

use crate::activator::sigmoid;

/// Sigmoid cross-entropy between raw `logits` and `expected` labels, summed
/// over all components.
pub fn sigmoid_ce(expected: &[f64], logits: &[f64]) -> f64 {
    assert_eq!(expected.len(), logits.len());
    expected
        .iter()
        .zip(logits)
        .map(|(&t, &x)| x.max(0.0) - x * t + (-x.abs()).exp().ln_1p())
        .sum()
}

/// Gradient of `sigmoid_ce` with respect to the logits.
pub fn sigmoid_ce_gradient(expected: &[f64], logits: &[f64]) -> Vec<f64> {
    assert_eq!(expected.len(), logits.len());
    expected
        .iter()
        .zip(logits)
        .map(|(&t, &x)| sigmoid(x) - t)
        .collect()
}

/// Computes the mean squared error between `actual` and `expected`.
pub fn mean_squared(expected: &[f64], actual: &[f64]) -> f64 {
    assert_eq!(actual.len(), expected.len());
    let mut error = 0.0;
    for (&a, e) in actual.iter().zip(expected) {
        error += (a - e) * (a - e);
    }
    error / (actual.len() as f64)
}

/// Gradient of `mean_squared` with respect to `actual`.
pub fn mean_squared_gradient(expected: &[f64], actual: &[f64]) -> Vec<f64> {
    assert_eq!(actual.len(), expected.len());
    let n = actual.len() as f64;
    actual
        .iter()
        .zip(expected)
        .map(|(a, e)| 2.0 * (a - e) / n)
        .collect()
}

/// A trait that provides easy access to the last element of a slice.
pub trait Back<T> {
    fn back(&self) -> &T;
}

impl<T> Back<T> for [T] {
    #[inline(always)]
    fn back(&self) -> &T {
        &self[self.len() - 1]
    }
}

/// Computes a numerically stable softmax of `x`.
pub fn softmax(x: &[f64]) -> Vec<f64> {
    let max = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = x.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Back-propagates `upstream` through a softmax whose output was `probs`.
pub fn softmax_backward(probs: &[f64], upstream: &[f64]) -> Vec<f64> {
    assert_eq!(probs.len(), upstream.len());
    let dot: f64 = probs.iter().zip(upstream).map(|(p, u)| p * u).sum();
    probs
        .iter()
        .zip(upstream)
        .map(|(p, u)| p * (u - dot))
        .collect()
}

/// Computes `x - log(sum(exp(x)))`.
pub fn log_softmax(x: &[f64]) -> Vec<f64> {
    let max = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let log_sum = x.iter().map(|v| (v - max).exp()).sum::<f64>().ln() + max;
    x.iter().map(|v| v - log_sum).collect()
}

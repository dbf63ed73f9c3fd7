use crate::utils::{softmax, softmax_backward};

use serde_derive::{Deserialize, Serialize};

/// Deterministic maps from arbitrary vectors onto probability-like vectors.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Squash {
    /// Squares each component and normalizes onto the simplex.
    Quadratic,
    /// Applies tanh, scales by the given factor and takes a softmax.
    ScaledTanh(f64),
    /// A plain softmax.
    Softmax,
}

impl Default for Squash {
    fn default() -> Self {
        Squash::ScaledTanh(4.0)
    }
}

impl Squash {
    pub fn apply(&self, input: &[f64]) -> Vec<f64> {
        match *self {
            Squash::Quadratic => {
                let total: f64 = input.iter().map(|x| x * x).sum();
                if total == 0.0 {
                    let n = input.len() as f64;
                    return vec![1.0 / n; input.len()];
                }
                input.iter().map(|x| x * x / total).collect()
            }
            Squash::ScaledTanh(scale) => {
                let scaled: Vec<f64> = input.iter().map(|x| scale * x.tanh()).collect();
                softmax(&scaled)
            }
            Squash::Softmax => softmax(input),
        }
    }

    /// Back-propagates `upstream` through a previous call to `apply`.
    pub fn backward(&self, input: &[f64], output: &[f64], upstream: &[f64]) -> Vec<f64> {
        match *self {
            Squash::Quadratic => {
                let total: f64 = input.iter().map(|x| x * x).sum();
                if total == 0.0 {
                    return vec![0.0; input.len()];
                }
                let dot: f64 = output.iter().zip(upstream).map(|(y, g)| y * g).sum();
                input
                    .iter()
                    .zip(upstream)
                    .map(|(x, g)| 2.0 * x / total * (g - dot))
                    .collect()
            }
            Squash::ScaledTanh(scale) => softmax_backward(output, upstream)
                .into_iter()
                .zip(input)
                .map(|(d, x)| {
                    let t = x.tanh();
                    d * scale * (1.0 - t * t)
                })
                .collect(),
            Squash::Softmax => softmax_backward(output, upstream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{assert_close, numeric_gradient};
    use approx::assert_abs_diff_eq;

    #[test]
    fn outputs_are_distributions() {
        let x = [0.5, -2.0, 1.5, 0.0];
        for squash in &[Squash::Quadratic, Squash::ScaledTanh(4.0), Squash::Softmax] {
            let y = squash.apply(&x);
            assert_abs_diff_eq!(y.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
            assert!(y.iter().all(|p| *p >= 0.0));
        }
    }

    #[test]
    fn quadratic_of_zero_is_uniform() {
        assert_eq!(Squash::Quadratic.apply(&[0.0, 0.0]), vec![0.5, 0.5]);
    }

    #[test]
    fn gradient_check() {
        let x = vec![0.5, -2.0, 1.5];
        let weights = [0.3, -1.0, 2.0];
        for squash in &[Squash::Quadratic, Squash::ScaledTanh(4.0), Squash::Softmax] {
            let y = squash.apply(&x);
            let analytic = squash.backward(&x, &y, &weights);
            for k in 0..x.len() {
                let numeric = numeric_gradient(|eps| {
                    let mut x = x.clone();
                    x[k] += eps;
                    squash.apply(&x).iter().zip(&weights).map(|(a, b)| a * b).sum()
                });
                assert_close(analytic[k], numeric);
            }
        }
    }
}

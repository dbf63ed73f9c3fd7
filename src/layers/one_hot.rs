use crate::sampling::choose_index;
use crate::utils::{softmax, softmax_backward};

use rand::RngCore;

/// A stochastic draw made by the one-hot layer.
#[derive(Clone, Debug, PartialEq)]
pub struct OneHotSample {
    /// The chosen index.
    pub index: usize,
    /// The softmax probabilities the index was drawn from.
    pub probs: Vec<f64>,
    /// Zero everywhere except at `index`, where it is `1 / probs[index]`.
    pub mask: Vec<f64>,
}

impl OneHotSample {
    /// Applies softmax to `logits` and draws an index from the result.
    pub fn draw(logits: &[f64], rng: &mut dyn RngCore) -> Self {
        let probs = softmax(logits);
        let index = choose_index(&probs, rng);
        let mut mask = vec![0.0; probs.len()];
        mask[index] = 1.0 / probs[index];
        OneHotSample { index, probs, mask }
    }

    /// The layer output: the mask times the probabilities, which is one at
    /// the chosen index and zero elsewhere.
    pub fn output(&self) -> Vec<f64> {
        self.mask.iter().zip(&self.probs).map(|(m, p)| m * p).collect()
    }

    /// Back-propagates `upstream` through the mask and the softmax.
    ///
    /// Only the chosen coordinate carries gradient, rescaled by `1/p`, so the
    /// expected gradient over draws matches that of the probabilities.
    pub fn backward(&self, upstream: &[f64]) -> Vec<f64> {
        let masked: Vec<f64> = self.mask.iter().zip(upstream).map(|(m, u)| m * u).collect();
        softmax_backward(&self.probs, &masked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn exactly_one_hot() {
        let mut rng = StdRng::seed_from_u64(5);
        let logits = [0.1, 2.0, -1.0, 0.5];
        for _ in 0..100 {
            let s = OneHotSample::draw(&logits, &mut rng);
            let nonzero: Vec<usize> = (0..s.mask.len()).filter(|&i| s.mask[i] != 0.0).collect();
            assert_eq!(nonzero, vec![s.index]);
            assert_abs_diff_eq!(s.mask[s.index], 1.0 / s.probs[s.index], epsilon = 1e-12);
            let out = s.output();
            assert_abs_diff_eq!(out[s.index], 1.0, epsilon = 1e-12);
            assert_eq!(out.iter().filter(|x| **x != 0.0).count(), 1);
        }
    }

    #[test]
    fn frequencies_converge() {
        let mut rng = StdRng::seed_from_u64(9);
        let logits = [0.0, 1.0, 2.0];
        let probs = softmax(&logits);
        let trials = 30_000;
        let mut counts = [0usize; 3];
        for _ in 0..trials {
            counts[OneHotSample::draw(&logits, &mut rng).index] += 1;
        }
        for (c, p) in counts.iter().zip(&probs) {
            assert_abs_diff_eq!(*c as f64 / trials as f64, *p, epsilon = 0.015);
        }
    }

    #[test]
    fn expected_gradient_is_unbiased() {
        // Averaged over draws, the gradient through the sampled coordinate
        // equals the gradient of sum(upstream * probs).
        let mut rng = StdRng::seed_from_u64(21);
        let logits = [0.3, -0.4, 0.8];
        let upstream = [1.0, -2.0, 0.5];
        let probs = softmax(&logits);
        let exact = softmax_backward(&probs, &upstream);
        let trials = 40_000;
        let mut mean = vec![0.0; 3];
        for _ in 0..trials {
            let g = OneHotSample::draw(&logits, &mut rng).backward(&upstream);
            for (m, x) in mean.iter_mut().zip(g) {
                *m += x / trials as f64;
            }
        }
        for (m, e) in mean.iter().zip(exact) {
            assert_abs_diff_eq!(*m, e, epsilon = 0.03);
        }
    }
}

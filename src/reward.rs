//! Reward and cost shaping for sequence generators.

use crate::utils::{softmax, softmax_backward};

/// Sums rewards backwards through time.
///
/// The result at `t` is `rewards[t] + discount * result[t + 1]`, and the last
/// entry equals the last reward. A `discount` of exactly zero is treated as
/// one, which disables discounting.
pub fn discounted_rewards(rewards: &[f64], discount: f64) -> Vec<f64> {
    let discount = if discount == 0.0 { 1.0 } else { discount };
    let mut res = vec![0.0; rewards.len()];
    let mut cumulative = 0.0;
    for (r, out) in rewards.iter().zip(res.iter_mut()).rev() {
        cumulative = r + discount * cumulative;
        *out = cumulative;
    }
    res
}

/// Builds the score-function signal for one sampled sequence.
///
/// `sampled[t]` is the symbol drawn at timestep `t` out of `alphabet`. Each
/// returned vector is zero except at the sampled symbol, where it carries
/// `scale * cumulative[t]`. Feeding these vectors back through the
/// log-probabilities that produced the samples yields the policy gradient.
pub fn policy_signal(sampled: &[usize], alphabet: usize, cumulative: &[f64], scale: f64) -> Vec<Vec<f64>> {
    assert_eq!(sampled.len(), cumulative.len());
    sampled
        .iter()
        .zip(cumulative)
        .map(|(&idx, c)| {
            assert!(idx < alphabet);
            let mut v = vec![0.0; alphabet];
            v[idx] = scale * c;
            v
        })
        .collect()
}

/// Turns one stop logit per timestep into a distribution over which timestep
/// ends the sequence.
pub fn length_mask(stop_logits: &[f64]) -> Vec<f64> {
    if stop_logits.is_empty() {
        return Vec::new();
    }
    softmax(stop_logits)
}

/// Back-propagates `upstream`, the gradient on a mask from `length_mask`,
/// to the stop logits.
pub fn length_mask_backward(mask: &[f64], upstream: &[f64]) -> Vec<f64> {
    softmax_backward(mask, upstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn undiscounted_sums_suffixes() {
        assert_eq!(discounted_rewards(&[1.0, 2.0, 3.0], 1.0), vec![6.0, 5.0, 3.0]);
        assert!(discounted_rewards(&[], 0.5).is_empty());
    }

    #[test]
    fn zero_discount_means_none() {
        let rewards = [0.25, -1.0, 0.5, 2.0];
        assert_eq!(discounted_rewards(&rewards, 0.0), discounted_rewards(&rewards, 1.0));
    }

    #[test]
    fn signal_only_at_sampled_symbols() {
        let s = policy_signal(&[2, 0], 3, &[1.5, 0.5], -1.0);
        assert_eq!(s, vec![vec![0.0, 0.0, -1.5], vec![-0.5, 0.0, 0.0]]);
    }

    #[test]
    fn mask_backward_matches_finite_differences() {
        let logits = [0.3, -1.2, 0.8, 0.1];
        let weights = [1.0, -2.0, 0.5, 3.0];
        let cost = |l: &[f64]| -> f64 { length_mask(l).iter().zip(&weights).map(|(m, w)| m * w).sum() };
        let analytic = length_mask_backward(&length_mask(&logits), &weights);
        for k in 0..logits.len() {
            let numeric = crate::testutil::numeric_gradient(|eps| {
                let mut l = logits.to_vec();
                l[k] += eps;
                cost(&l)
            });
            crate::testutil::assert_close(analytic[k], numeric);
        }
    }

    proptest! {
        #[test]
        fn discounting_recurrence(
            rewards in prop::collection::vec(-10.0f64..10.0, 1..20),
            discount in 0.0f64..=1.0,
        ) {
            let res = discounted_rewards(&rewards, discount);
            let d = if discount == 0.0 { 1.0 } else { discount };
            let last = rewards.len() - 1;
            prop_assert_eq!(res[last], rewards[last]);
            for t in 0..last {
                prop_assert!((res[t] - (rewards[t] + d * res[t + 1])).abs() < 1e-9);
            }
        }

        #[test]
        fn mask_is_a_distribution(logits in prop::collection::vec(-20.0f64..20.0, 1..30)) {
            let mask = length_mask(&logits);
            prop_assert!(mask.iter().all(|m| *m >= 0.0));
            assert_abs_diff_eq!(mask.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        }
    }
}

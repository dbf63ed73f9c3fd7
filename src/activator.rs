//! Activation function types.

use serde_derive::{Deserialize, Serialize};

/// [Activation function](https://en.wikipedia.org/wiki/Activation_function)
/// types.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Activator {
    /// The identity function, for layers that emit raw logits.
    Identity,
    /// Rectified Linear Unit
    ReLU,
    /// Leaky Rectified Linear Unit
    ///
    /// Takes an `alpha` value to use for negative inputs.
    LeakyReLU(f64),
    /// Sigmoid function
    Sigmoid,
    /// Hyperbolic tan function
    TanH,
}

impl Activator {
    /// Evaluates `f(x)` for the selected the activation function.
    pub fn f(&self, x: f64) -> f64 {
        match *self {
            Activator::Identity => x,
            Activator::ReLU => {
                if x > 0.0 {
                    x
                } else {
                    0.0
                }
            }
            Activator::LeakyReLU(alpha) => {
                if x > 0.0 {
                    x
                } else {
                    alpha * x
                }
            }
            Activator::Sigmoid => sigmoid(x),
            Activator::TanH => x.tanh(),
        }
    }

    /// Evaluates the derivative `f'(x)`, where `x = f^{-1}(y)`.
    ///
    /// Note that this function takes in the *output* of the activation
    /// function, rather than the input. This is an optimization that means we
    /// don't have to store the intermediate results before activation.
    pub fn fprime(&self, y: f64) -> f64 {
        match *self {
            Activator::Identity => 1.0,
            Activator::ReLU => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activator::LeakyReLU(alpha) => {
                if y > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activator::Sigmoid => y * (1.0 - y),
            Activator::TanH => 1.0 - y * y,
        }
    }
}

/// The logistic function.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn derivative_from_output() {
        let eps = 1e-6;
        for &act in &[
            Activator::Identity,
            Activator::LeakyReLU(0.1),
            Activator::Sigmoid,
            Activator::TanH,
        ] {
            for &x in &[-1.5, -0.2, 0.3, 2.0] {
                let numeric = (act.f(x + eps) - act.f(x - eps)) / (2.0 * eps);
                assert_abs_diff_eq!(act.fprime(act.f(x)), numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn sigmoid_is_stable() {
        assert_abs_diff_eq!(sigmoid(-800.0), 0.0);
        assert_abs_diff_eq!(sigmoid(800.0), 1.0);
        assert_abs_diff_eq!(sigmoid(0.0), 0.5);
    }
}

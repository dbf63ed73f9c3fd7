//! Finite-difference helpers shared by the gradient checks.

const EPSILON: f64 = 1e-5;
const TOLERANCE: f64 = 1e-4;

/// Estimates the derivative of `f` at zero offset with a central difference.
pub fn numeric_gradient<F: FnMut(f64) -> f64>(mut f: F) -> f64 {
    (f(EPSILON) - f(-EPSILON)) / (2.0 * EPSILON)
}

/// Panics unless `analytic` and `numeric` agree within a mixed
/// absolute/relative tolerance.
pub fn assert_close(analytic: f64, numeric: f64) {
    let diff = (analytic - numeric).abs();
    let scale = analytic.abs().max(numeric.abs()).max(1.0);
    assert!(
        diff / scale < TOLERANCE,
        "gradients differ: analytic {} vs numeric {}",
        analytic,
        numeric
    );
}

use crate::error::{Error, Result};
use crate::param::{Gradient, Param};

use ndarray::linalg::{general_mat_mul, general_mat_vec_mul};
use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

/// A weight matrix whose entries live in a trainable `Param`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mat {
    rows: usize,
    cols: usize,
    data: Param, // row-major array
}

impl Mat {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Mat {
            rows,
            cols,
            data: Param::zeros(rows * cols),
        }
    }

    /// Creates a matrix of normally distributed entries.
    pub fn random(rows: usize, cols: usize, stddev: f64, rng: &mut dyn RngCore) -> Self {
        Mat {
            rows,
            cols,
            data: Param::random(rows * cols, stddev, rng),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn param(&self) -> &Param {
        &self.data
    }

    pub fn param_mut(&mut self) -> &mut Param {
        &mut self.data
    }

    /// Checks that the stored data fills exactly `rows * cols` entries, as
    /// it may not after loading.
    pub fn validate(&self) -> Result<()> {
        match self.rows.checked_mul(self.cols) {
            Some(n) if n == self.data.len() => Ok(()),
            _ => Err(Error::Invalid(format!(
                "{}x{} matrix holds {} values",
                self.rows,
                self.cols,
                self.data.len()
            ))),
        }
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data.data[row * self.cols + col] = value;
    }

    fn view(&self) -> ArrayView2<f64> {
        ArrayView2::from_shape((self.rows, self.cols), &self.data.data)
            .expect("matrix data matches its shape")
    }

    /// Computes `y += A x`.
    pub fn gemv(&self, x: &[f64], y: &mut [f64]) {
        assert_eq!(x.len(), self.cols);
        assert_eq!(y.len(), self.rows);
        let x = ArrayView1::from(x);
        let mut y = ArrayViewMut1::from(y);
        general_mat_vec_mul(1.0, &self.view(), &x, 1.0, &mut y);
    }

    /// Computes `y += A^T x`.
    pub fn gemv_t(&self, x: &[f64], y: &mut [f64]) {
        assert_eq!(x.len(), self.rows);
        assert_eq!(y.len(), self.cols);
        let x = ArrayView1::from(x);
        let mut y = ArrayViewMut1::from(y);
        general_mat_vec_mul(1.0, &self.view().t(), &x, 1.0, &mut y);
    }

    /// Accumulates the outer product `x y^T` into this matrix's gradient.
    pub fn ger(&self, x: &[f64], y: &[f64], grad: &mut Gradient) {
        assert_eq!(x.len(), self.rows);
        assert_eq!(y.len(), self.cols);
        let (rows, cols) = (self.rows, self.cols);
        if let Some(acc) = grad.get_mut(&self.data) {
            let mut acc = ArrayViewMut2::from_shape((rows, cols), acc)
                .expect("gradient matches matrix shape");
            let x = ArrayView1::from(x).insert_axis(Axis(1));
            let y = ArrayView1::from(y).insert_axis(Axis(0));
            general_mat_mul(1.0, &x, &y, 1.0, &mut acc);
        }
    }
}

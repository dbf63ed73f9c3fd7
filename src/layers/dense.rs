use crate::activator::Activator;
use crate::error::{Error, Result};
use crate::matrix::Mat;
use crate::param::{Gradient, Param};

use itertools::multizip;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

/// A wrapper for a fully connected layer of a neural network
///
/// This performs efficient network updates by storing the weights for every
/// neuron as a single Matrix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dense {
    /// The activation function to be used for every neuron in the layer.
    activator: Activator,
    /// The network weights, with each neuron's weights stored as a row.
    weights: Mat,
    biases: Param,
}

impl Dense {
    /// Initializes a new, untrained layer.
    ///
    /// Arguments:
    ///
    ///  * `activator` - the activation function to be used for this layer's
    ///                  output.
    ///  * `inputs` - the number of inputs to this layer.
    ///  * `outputs` - the number of outputs from this layer.
    ///  * `rng` - the source of the initial weights.
    pub fn new(activator: Activator, inputs: usize, outputs: usize, rng: &mut dyn RngCore) -> Self {
        let stddev = 1.0 / (inputs.max(1) as f64).sqrt();
        Dense {
            activator,
            weights: Mat::random(outputs, inputs, stddev, rng),
            biases: Param::zeros(outputs),
        }
    }

    /// Initializes a square linear layer to `scale` times the identity, with
    /// zero biases.
    pub fn identity(size: usize, scale: f64) -> Self {
        let mut weights = Mat::zeros(size, size);
        for i in 0..size {
            weights.set(i, i, scale);
        }
        Dense {
            activator: Activator::Identity,
            weights,
            biases: Param::zeros(size),
        }
    }

    pub fn input_len(&self) -> usize {
        self.weights.cols()
    }

    pub fn output_len(&self) -> usize {
        self.weights.rows()
    }

    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;
        if self.biases.len() != self.weights.rows() {
            return Err(Error::Invalid(format!(
                "dense layer has {} outputs but {} biases",
                self.weights.rows(),
                self.biases.len()
            )));
        }
        Ok(())
    }

    pub fn biases(&self) -> &Param {
        &self.biases
    }

    pub fn biases_mut(&mut self) -> &mut Param {
        &mut self.biases
    }

    pub fn forward(&self, inputs: &[f64]) -> Vec<f64> {
        let mut outputs = self.biases.data.clone();
        self.weights.gemv(inputs, &mut outputs);
        for y in outputs.iter_mut() {
            *y = self.activator.f(*y);
        }
        outputs
    }

    /// Feeds the provided `output_errors` backwards through the layer,
    /// returning the errors on `inputs`.
    pub fn backward(
        &self,
        inputs: &[f64],
        outputs: &[f64],
        output_errors: &[f64],
        grad: &mut Gradient,
    ) -> Vec<f64> {
        assert_eq!(inputs.len(), self.input_len());
        assert_eq!(outputs.len(), self.output_len());
        assert_eq!(output_errors.len(), self.output_len());
        let mut derivative = vec![0.0; self.output_len()];
        for (y, e, d) in multizip((outputs.iter(), output_errors.iter(), derivative.iter_mut())) {
            *d = e * self.activator.fprime(*y);
        }
        let mut input_errors = vec![0.0; self.input_len()];
        self.weights.gemv_t(&derivative, &mut input_errors);
        self.weights.ger(&derivative, inputs, grad);
        grad.accumulate(&self.biases, &derivative);
        input_errors
    }

    pub fn parameters(&self) -> Vec<&Param> {
        vec![self.weights.param(), &self.biases]
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Param> {
        vec![self.weights.param_mut(), &mut self.biases]
    }
}

//! Feed-forward layers and the networks built from them.

mod dense;
mod one_hot;
mod squash;

pub use self::dense::Dense;
pub use self::one_hot::OneHotSample;
pub use self::squash::Squash;

use crate::error::{Error, Result};
use crate::param::{Gradient, Param};
use crate::utils::{log_softmax, softmax, softmax_backward, Back};

use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

/// A single feed-forward stage of a `Network`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Layer {
    Dense(Dense),
    Softmax,
    /// Emits log-probabilities, for generators trained with policy gradients.
    LogSoftmax,
    /// Samples a one-hot vector from the softmax of its input.
    OneHot,
    Squash(Squash),
}

/// Whatever a layer has to remember beyond its input and output.
#[derive(Clone, Debug)]
enum Aux {
    None,
    Sample(OneHotSample),
}

impl Layer {
    fn forward(&self, input: &[f64], rng: &mut dyn RngCore) -> (Vec<f64>, Aux) {
        match self {
            Layer::Dense(d) => (d.forward(input), Aux::None),
            Layer::Softmax => (softmax(input), Aux::None),
            Layer::LogSoftmax => (log_softmax(input), Aux::None),
            Layer::OneHot => {
                if input.is_empty() {
                    return (Vec::new(), Aux::None);
                }
                let sample = OneHotSample::draw(input, rng);
                (sample.output(), Aux::Sample(sample))
            }
            Layer::Squash(s) => (s.apply(input), Aux::None),
        }
    }

    fn backward(
        &self,
        input: &[f64],
        output: &[f64],
        aux: &Aux,
        upstream: &[f64],
        grad: &mut Gradient,
    ) -> Vec<f64> {
        match (self, aux) {
            (Layer::Dense(d), _) => d.backward(input, output, upstream, grad),
            (Layer::Softmax, _) => softmax_backward(output, upstream),
            (Layer::LogSoftmax, _) => {
                let total: f64 = upstream.iter().sum();
                output
                    .iter()
                    .zip(upstream)
                    .map(|(y, u)| u - y.exp() * total)
                    .collect()
            }
            (Layer::OneHot, Aux::Sample(sample)) => sample.backward(upstream),
            (Layer::OneHot, Aux::None) => Vec::new(),
            (Layer::Squash(s), _) => s.backward(input, output, upstream),
        }
    }

    fn parameters(&self) -> Vec<&Param> {
        match self {
            Layer::Dense(d) => d.parameters(),
            _ => Vec::new(),
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        match self {
            Layer::Dense(d) => d.parameters_mut(),
            _ => Vec::new(),
        }
    }
}

impl From<Dense> for Layer {
    fn from(d: Dense) -> Self {
        Layer::Dense(d)
    }
}

/// A feed-forward neural network.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Network {
    layers: Vec<Layer>,
}

/// The activations recorded while feeding one input through a `Network`.
#[derive(Clone, Debug)]
pub struct NetworkTrace {
    activations: Vec<Vec<f64>>,
    aux: Vec<Aux>,
}

impl NetworkTrace {
    /// Returns the network's output layer.
    pub fn output(&self) -> &[f64] {
        self.activations.back()
    }

    pub fn into_output(mut self) -> Vec<f64> {
        self.activations.pop().unwrap_or_default()
    }
}

impl Network {
    pub fn new(layers: Vec<Layer>) -> Self {
        Network { layers }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    fn dense_layers(&self) -> impl Iterator<Item = &Dense> {
        self.layers.iter().filter_map(|l| match l {
            Layer::Dense(d) => Some(d),
            _ => None,
        })
    }

    /// The input length the first dense layer expects. Networks without
    /// dense layers accept any length.
    pub fn input_len(&self) -> Option<usize> {
        self.dense_layers().next().map(Dense::input_len)
    }

    pub fn output_len(&self) -> Option<usize> {
        self.dense_layers().last().map(Dense::output_len)
    }

    /// Checks that every dense layer is well formed and that each one
    /// consumes what the previous one produces. Only dense layers change
    /// vector lengths.
    pub fn validate(&self) -> Result<()> {
        let mut width: Option<usize> = None;
        for (i, d) in self.dense_layers().enumerate() {
            d.validate()?;
            if let Some(w) = width {
                if w != d.input_len() {
                    return Err(Error::Invalid(format!(
                        "dense layer {} takes {} inputs but receives {}",
                        i,
                        d.input_len(),
                        w
                    )));
                }
            }
            width = Some(d.output_len());
        }
        Ok(())
    }

    /// Feeds the provided `input` through the network, returning the activated
    /// values for each layer.
    pub fn apply(&self, input: &[f64], rng: &mut dyn RngCore) -> NetworkTrace {
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        let mut aux = Vec::with_capacity(self.layers.len());
        activations.push(input.to_vec());
        for layer in &self.layers {
            let (output, a) = layer.forward(activations.back(), rng);
            activations.push(output);
            aux.push(a);
        }
        NetworkTrace { activations, aux }
    }

    /// Feeds the provided `input` through the network, returning the output
    /// layer.
    pub fn run(&self, input: &[f64], rng: &mut dyn RngCore) -> Vec<f64> {
        self.apply(input, rng).into_output()
    }

    /// Feeds `upstream`, the gradient on the output layer, back through the
    /// network. Accumulates parameter gradients into `grad` and returns the
    /// gradient on the network input.
    pub fn propagate(&self, trace: &NetworkTrace, upstream: &[f64], grad: &mut Gradient) -> Vec<f64> {
        assert_eq!(upstream.len(), trace.output().len());
        let mut errors = upstream.to_vec();
        for (i, layer) in self.layers.iter().enumerate().rev() {
            errors = layer.backward(
                &trace.activations[i],
                &trace.activations[i + 1],
                &trace.aux[i],
                &errors,
                grad,
            );
        }
        errors
    }

    pub fn parameters(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.parameters_mut()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activator::Activator;
    use crate::testutil::{assert_close, numeric_gradient};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn network(rng: &mut StdRng) -> Network {
        Network::new(vec![
            Dense::new(Activator::TanH, 3, 4, rng).into(),
            Dense::new(Activator::Identity, 4, 3, rng).into(),
            Layer::LogSoftmax,
        ])
    }

    #[test]
    fn gradient_check() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut net = network(&mut rng);
        let input = vec![0.2, -0.7, 1.1];
        let weights = vec![0.5, -1.5, 1.0];
        let cost = |n: &Network, x: &[f64], rng: &mut StdRng| -> f64 {
            n.run(x, rng).iter().zip(&weights).map(|(a, b)| a * b).sum()
        };

        let trace = net.apply(&input, &mut rng);
        let mut grad = Gradient::new(net.parameters());
        let input_grad = net.propagate(&trace, &weights, &mut grad);
        for k in 0..input.len() {
            let numeric = numeric_gradient(|eps| {
                let mut x = input.clone();
                x[k] += eps;
                cost(&net, &x, &mut rng)
            });
            assert_close(input_grad[k], numeric);
        }

        let ids: Vec<_> = net.parameters().iter().map(|p| p.id()).collect();
        for (p, id) in ids.iter().enumerate() {
            let analytic = grad.get(*id).unwrap().to_vec();
            for (j, a) in analytic.iter().enumerate() {
                let numeric = numeric_gradient(|eps| {
                    net.parameters_mut()[p].data[j] += eps;
                    let c = cost(&net, &input, &mut rng);
                    net.parameters_mut()[p].data[j] -= eps;
                    c
                });
                assert_close(*a, numeric);
            }
        }
    }

    #[test]
    fn one_hot_network_output() {
        let mut rng = StdRng::seed_from_u64(2);
        let net = Network::new(vec![Dense::new(Activator::Identity, 2, 5, &mut rng).into(), Layer::OneHot]);
        let out = net.run(&[1.0, -1.0], &mut rng);
        assert_eq!(out.len(), 5);
        assert_eq!(out.iter().filter(|x| **x != 0.0).count(), 1);
    }

    #[test]
    fn validates_layer_chaining() {
        let mut rng = StdRng::seed_from_u64(9);
        let net = network(&mut rng);
        assert!(net.validate().is_ok());
        assert_eq!((net.input_len(), net.output_len()), (Some(3), Some(3)));

        let broken = Network::new(vec![
            Dense::new(Activator::TanH, 3, 4, &mut rng).into(),
            Layer::Softmax,
            Dense::new(Activator::Identity, 5, 2, &mut rng).into(),
        ]);
        match broken.validate() {
            Err(Error::Invalid(msg)) => assert!(msg.contains("receives 4")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(Network::default().input_len(), None);
    }

    #[test]
    fn frozen_parameters_receive_nothing() {
        let mut rng = StdRng::seed_from_u64(8);
        let net = network(&mut rng);
        let trace = net.apply(&[1.0, 0.0, 0.0], &mut rng);
        let mut grad = Gradient::default();
        let input_grad = net.propagate(&trace, &[1.0, 0.0, 0.0], &mut grad);
        assert!(grad.is_empty());
        assert_eq!(input_grad.len(), 3);
    }
}

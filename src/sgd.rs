//! Minibatch gradient descent for anything that can produce gradients.

use crate::gan::Costs;
use crate::param::{Gradient, Param, ParamId};

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::info;

/// Makes a model trainable using gradient descent.
pub trait Gradienter {
    /// Training sample format.
    type Sample;

    /// Computes the gradient for one minibatch.
    fn gradient(&mut self, batch: &[Self::Sample]) -> Gradient;

    /// Returns every parameter a gradient may refer to.
    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    /// Measures the model on a minibatch, for monitoring.
    fn costs(&mut self, batch: &[Self::Sample]) -> Costs;
}

/// Rewrites a gradient before it is applied, e.g. to adapt per-component
/// step sizes.
pub trait Transformer {
    fn transform(&mut self, grad: Gradient) -> Gradient;
}

/// Divides each component by a running root mean square of its history.
#[derive(Clone, Debug)]
pub struct RmsProp {
    /// Weight kept by the running average at each step.
    pub resiliency: f64,
    pub damping: f64,
    rolling: BTreeMap<ParamId, Vec<f64>>,
}

impl RmsProp {
    pub fn new(resiliency: f64) -> Self {
        RmsProp {
            resiliency,
            damping: 1e-8,
            rolling: BTreeMap::new(),
        }
    }
}

impl Default for RmsProp {
    fn default() -> Self {
        RmsProp::new(0.9)
    }
}

impl Transformer for RmsProp {
    fn transform(&mut self, mut grad: Gradient) -> Gradient {
        for (id, g) in grad.iter_mut() {
            let resiliency = self.resiliency;
            let rolling = self
                .rolling
                .entry(id)
                .or_insert_with(|| g.iter().map(|x| x * x).collect());
            assert_eq!(rolling.len(), g.len());
            for (r, x) in rolling.iter_mut().zip(g.iter_mut()) {
                *r = resiliency * *r + (1.0 - resiliency) * *x * *x;
                *x /= r.sqrt() + self.damping;
            }
        }
        grad
    }
}

/// Bias-corrected moment estimates, as in Adam.
#[derive(Clone, Debug)]
pub struct Adam {
    pub decay1: f64,
    pub decay2: f64,
    pub damping: f64,
    t: i32,
    moments: BTreeMap<ParamId, (Vec<f64>, Vec<f64>)>,
}

impl Adam {
    pub fn new(decay1: f64, decay2: f64, damping: f64) -> Self {
        Adam {
            decay1,
            decay2,
            damping,
            t: 0,
            moments: BTreeMap::new(),
        }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Adam::new(0.9, 0.999, 1e-8)
    }
}

impl Transformer for Adam {
    fn transform(&mut self, mut grad: Gradient) -> Gradient {
        self.t += 1;
        let correction1 = 1.0 - self.decay1.powi(self.t);
        let correction2 = 1.0 - self.decay2.powi(self.t);
        for (id, g) in grad.iter_mut() {
            let (m, v) = self
                .moments
                .entry(id)
                .or_insert_with(|| (vec![0.0; g.len()], vec![0.0; g.len()]));
            assert_eq!(m.len(), g.len());
            for ((m, v), x) in m.iter_mut().zip(v.iter_mut()).zip(g.iter_mut()) {
                *m = self.decay1 * *m + (1.0 - self.decay1) * *x;
                *v = self.decay2 * *v + (1.0 - self.decay2) * *x * *x;
                *x = (*m / correction1) / ((*v / correction2).sqrt() + self.damping);
            }
        }
        grad
    }
}

/// A builder for training models with minibatch gradient descent.
#[derive(Debug)]
pub struct Trainer<G: Gradienter> {
    gradienter: G,
    step_size: f64,
    batch_size: usize,
    logging: Logging,
    stop_condition: StopCondition,
}

impl<G: Gradienter> Trainer<G>
where
    G::Sample: Clone,
{
    /// Creates a new Trainer instance.
    ///
    /// The trainer is initialized with some default values. These defaults are:
    ///
    /// * A step size of 0.001.
    /// * Minibatches of 64 samples.
    /// * Stops after 1000 minibatches.
    /// * Logs on training completion.
    pub fn new(gradienter: G) -> Self {
        Trainer {
            gradienter,
            step_size: 1e-3,
            batch_size: 64,
            logging: Logging::Completion,
            stop_condition: StopCondition::Iterations(1000),
        }
    }

    /// Sets the step size to use during gradient descent.
    pub fn step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        self.batch_size = batch_size;
        self
    }

    /// Sets the type of logging to be emitted during training.
    pub fn logging(mut self, logging: Logging) -> Self {
        self.logging = logging;
        self
    }

    /// Sets the condition to finish training.
    pub fn stop_condition<C>(mut self, condition: C) -> Self
    where
        C: Into<StopCondition>,
    {
        self.stop_condition = condition.into();
        self
    }

    /// Trains on `samples`, reshuffled every epoch, and returns the trained
    /// model.
    pub fn train<R: Rng>(mut self, samples: &[G::Sample], rng: &mut R) -> G {
        assert!(!samples.is_empty(), "cannot train on an empty sample set");
        let start_time = Instant::now();
        let mut order: Vec<usize> = (0..samples.len()).collect();
        let mut iteration = 0;
        let mut epoch = 0;
        'outer: loop {
            order.shuffle(rng);
            for chunk in order.chunks(self.batch_size) {
                let batch: Vec<G::Sample> = chunk.iter().map(|&i| samples[i].clone()).collect();
                let grad = self.gradienter.gradient(&batch);
                grad.step(self.gradienter.parameters_mut(), self.step_size);
                iteration += 1;

                if self.logging.due(iteration) {
                    let costs = self.gradienter.costs(&batch);
                    info!(iteration, real = costs.real, generated = costs.generated, "trained minibatch");
                }
                if self.stop_condition.should_stop(iteration, epoch, start_time) {
                    break 'outer;
                }
            }
            epoch += 1;
            if self.stop_condition.should_stop(iteration, epoch, start_time) {
                break;
            }
        }
        self.logging.completion(iteration, epoch, start_time);
        self.gradienter
    }
}

/// Logging frequency to use during training
#[derive(Copy, Clone, Debug)]
pub enum Logging {
    /// No logs will be emitted
    Silent,
    /// A summary will be emitted at completion
    Completion,
    /// Costs will be emitted after every `n` minibatches
    Iterations(usize),
}

impl Logging {
    fn due(&self, iteration: usize) -> bool {
        match *self {
            Logging::Iterations(freq) => freq > 0 && iteration % freq == 0,
            _ => false,
        }
    }

    /// Performs logging at the end of training.
    fn completion(&self, iterations: usize, epochs: usize, start_time: Instant) {
        if let Logging::Silent = self {
            return;
        }
        info!(
            iterations,
            epochs,
            seconds = start_time.elapsed().as_secs_f64(),
            "training complete"
        );
    }
}

/// When to stop training
#[derive(Copy, Clone, Debug)]
pub enum StopCondition {
    /// Stops after the provided number of minibatches
    Iterations(usize),
    /// Stops after the provided number of passes over the samples
    Epochs(usize),
    /// Stops after the provided duration
    Duration(Duration),
}

impl From<Duration> for StopCondition {
    fn from(duration: Duration) -> StopCondition {
        StopCondition::Duration(duration)
    }
}

impl StopCondition {
    /// Returns true if training is complete.
    fn should_stop(&self, iteration: usize, epoch: usize, start_time: Instant) -> bool {
        match *self {
            StopCondition::Iterations(iterations) => iteration >= iterations,
            StopCondition::Epochs(epochs) => epoch >= epochs,
            StopCondition::Duration(duration) => start_time.elapsed() > duration,
        }
    }
}

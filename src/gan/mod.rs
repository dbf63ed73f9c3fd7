//! Adversarial trainers.
//!
//! Every trainer produces, per call, a gradient that updates either the
//! discriminator or the generator, never both. Which one is decided by a
//! `Schedule` owned by the trainer, so the caller can drive training with a
//! plain minibatch loop.

mod feature_matching;
mod length;
mod policy;
mod recurrent;
mod vector;

pub use self::feature_matching::FeatureMatching;
pub use self::length::LengthGan;
pub use self::policy::PolicyGradient;
pub use self::recurrent::Recurrent;
pub use self::vector::Vector;

use crate::cost::{sigmoid_ce, sigmoid_ce_gradient};
use crate::error::{Error, Result};
use crate::param::{Gradient, Param};
use crate::sgd::Transformer;

use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// The half of the adversarial game a training step updates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Discriminator,
    Generator,
}

/// Alternates between discriminator and generator updates at a fixed ratio.
///
/// Within every window of `gen_iterations + disc_iterations` consecutive
/// calls the first `disc_iterations` train the discriminator and the rest
/// train the generator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    gen_iterations: usize,
    disc_iterations: usize,
    iter_idx: usize,
}

impl Schedule {
    pub fn new(gen_iterations: usize, disc_iterations: usize) -> Self {
        assert!(
            gen_iterations.checked_add(disc_iterations).map_or(false, |n| n > 0),
            "a schedule needs at least one iteration and at most usize::MAX"
        );
        Schedule {
            gen_iterations,
            disc_iterations,
            iter_idx: 0,
        }
    }

    pub fn gen_iterations(&self) -> usize {
        self.gen_iterations
    }

    pub fn disc_iterations(&self) -> usize {
        self.disc_iterations
    }

    /// The number of phases handed out so far.
    pub fn iterations(&self) -> usize {
        self.iter_idx
    }

    /// Returns the phase for the current call and advances.
    pub fn next_phase(&mut self) -> Phase {
        let period = self
            .gen_iterations
            .checked_add(self.disc_iterations)
            .filter(|&n| n > 0)
            .unwrap_or(1);
        let sub_idx = self.iter_idx % period;
        // Restarting the cycle after usize::MAX calls shifts the pattern once.
        self.iter_idx = self.iter_idx.checked_add(1).unwrap_or(0);
        if sub_idx < self.disc_iterations {
            Phase::Discriminator
        } else {
            Phase::Generator
        }
    }

    fn validate(&self) -> Result<()> {
        match self.gen_iterations.checked_add(self.disc_iterations) {
            Some(0) => Err(Error::Invalid("schedule has no iterations".to_string())),
            None => Err(Error::Invalid(format!(
                "schedule of {} + {} iterations overflows",
                self.gen_iterations, self.disc_iterations
            ))),
            Some(_) => Ok(()),
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::new(1, 1)
    }
}

/// Discriminator cross-entropy on real and on generated samples.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Costs {
    pub real: f64,
    pub generated: f64,
}

/// Optional gradient transforms applied to each phase's gradient before it
/// is merged.
#[derive(Default)]
struct Transforms {
    gen: Option<Box<dyn Transformer>>,
    disc: Option<Box<dyn Transformer>>,
}

impl Transforms {
    fn apply(&mut self, phase: Phase, grad: Gradient) -> Gradient {
        let trans = match phase {
            Phase::Generator => &mut self.gen,
            Phase::Discriminator => &mut self.disc,
        };
        match trans {
            Some(t) => t.transform(grad),
            None => grad,
        }
    }
}

impl fmt::Debug for Transforms {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Transforms")
            .field("gen", &self.gen.is_some())
            .field("disc", &self.disc.is_some())
            .finish()
    }
}

/// Merges one phase's gradient into zeroed accumulators for every generator
/// and discriminator parameter.
fn merge_phases(gen: Vec<&Param>, disc: Vec<&Param>, active: Gradient) -> Gradient {
    let mut res = Gradient::new(gen.into_iter().chain(disc));
    res.merge(active);
    res
}

fn check_random_size(random_size: usize) -> Result<()> {
    if random_size == 0 {
        return Err(Error::Invalid("random input size must be positive".to_string()));
    }
    Ok(())
}

/// Asserts that a generated batch has exactly the real batch's shape.
fn assert_same_lengths(real: &[Vec<Vec<f64>>], generated: &[Vec<Vec<f64>>]) {
    assert_eq!(real.len(), generated.len(), "batch size mismatch");
    for (r, g) in real.iter().zip(generated) {
        assert_eq!(r.len(), g.len(), "sequence length mismatch");
    }
}

fn lengths(batch: &[Vec<Vec<f64>>]) -> Vec<usize> {
    batch.iter().map(|s| s.len()).collect()
}

/// Cross-entropy gradient for every timestep logit in a batch of sequences,
/// multiplied by `scale`.
fn seq_ce_upstream(outputs: &[Vec<Vec<f64>>], target: f64, scale: f64) -> Vec<Vec<Vec<f64>>> {
    outputs
        .iter()
        .map(|seq| seq.iter().map(|x| vec_ce_upstream(x, target, scale)).collect())
        .collect()
}

fn vec_ce_upstream(logits: &[f64], target: f64, scale: f64) -> Vec<f64> {
    let expected = vec![target; logits.len()];
    sigmoid_ce_gradient(&expected, logits)
        .into_iter()
        .map(|g| g * scale)
        .collect()
}

fn vec_ce(logits: &[f64], target: f64) -> f64 {
    sigmoid_ce(&vec![target; logits.len()], logits)
}

/// Mean over sequences of the cross-entropy summed over each sequence.
fn mean_seq_ce(outputs: &[Vec<Vec<f64>>], target: f64) -> f64 {
    if outputs.is_empty() {
        return 0.0;
    }
    let total: f64 = outputs
        .iter()
        .flat_map(|seq| seq.iter())
        .map(|x| vec_ce(x, target))
        .sum();
    total / outputs.len() as f64
}

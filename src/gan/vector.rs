use super::{check_random_size, merge_phases, vec_ce, vec_ce_upstream, Costs, Phase, Schedule, Transforms};
use crate::error::Result;
use crate::layers::Network;
use crate::param::{Gradient, Param};
use crate::rnn::check_len;
use crate::sampling::noise;
use crate::sgd::{Gradienter, Transformer};

use rand::rngs::StdRng;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

/// A GAN over fixed-size vectors.
///
/// The generator maps `random_size` normal values to a sample and the
/// discriminator maps a sample to a single raw logit, positive for "real".
#[derive(Debug)]
pub struct Vector<R = StdRng> {
    generator: Network,
    discriminator: Network,
    random_size: usize,
    schedule: Schedule,
    transforms: Transforms,
    rng: R,
}

#[derive(Serialize, Deserialize)]
struct Saved {
    generator: Network,
    discriminator: Network,
    random_size: usize,
    schedule: Schedule,
}

impl<R: Rng> Vector<R> {
    pub fn new(generator: Network, discriminator: Network, random_size: usize, rng: R) -> Self {
        assert!(random_size > 0, "random input size must be positive");
        Vector {
            generator,
            discriminator,
            random_size,
            schedule: Schedule::default(),
            transforms: Transforms::default(),
            rng,
        }
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Transforms every generator gradient before it is returned.
    pub fn gen_transformer<T: Transformer + 'static>(mut self, t: T) -> Self {
        self.transforms.gen = Some(Box::new(t));
        self
    }

    /// Transforms every discriminator gradient before it is returned.
    pub fn disc_transformer<T: Transformer + 'static>(mut self, t: T) -> Self {
        self.transforms.disc = Some(Box::new(t));
        self
    }

    pub fn generator(&self) -> &Network {
        &self.generator
    }

    pub fn generator_mut(&mut self) -> &mut Network {
        &mut self.generator
    }

    pub fn discriminator(&self) -> &Network {
        &self.discriminator
    }

    pub fn discriminator_mut(&mut self) -> &mut Network {
        &mut self.discriminator
    }

    pub fn random_size(&self) -> usize {
        self.random_size
    }

    /// Draws one synthetic sample.
    pub fn generate(&mut self) -> Vec<f64> {
        let z = noise(self.random_size, &mut self.rng);
        self.generator.run(&z, &mut self.rng)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let saved = Saved {
            generator: self.generator.clone(),
            discriminator: self.discriminator.clone(),
            random_size: self.random_size,
            schedule: self.schedule,
        };
        Ok(serde_json::to_vec(&saved)?)
    }

    /// Restores a model written by `serialize`. Gradient transforms are not
    /// persisted.
    pub fn deserialize(data: &[u8], rng: R) -> Result<Self> {
        let saved: Saved = serde_json::from_slice(data)?;
        check_random_size(saved.random_size)?;
        saved.schedule.validate()?;
        saved.generator.validate()?;
        saved.discriminator.validate()?;
        check_len("generator input", saved.generator.input_len(), Some(saved.random_size))?;
        check_len(
            "discriminator input",
            saved.discriminator.input_len(),
            saved.generator.output_len(),
        )?;
        Ok(Vector {
            generator: saved.generator,
            discriminator: saved.discriminator,
            random_size: saved.random_size,
            schedule: saved.schedule,
            transforms: Transforms::default(),
            rng,
        })
    }

    fn discriminator_gradient(&mut self, batch: &[Vec<f64>]) -> Gradient {
        let mut grad = Gradient::new(self.discriminator.parameters());
        for sample in batch {
            let trace = self.discriminator.apply(sample, &mut self.rng);
            let up = vec_ce_upstream(trace.output(), 1.0, 1.0);
            self.discriminator.propagate(&trace, &up, &mut grad);

            let z = noise(self.random_size, &mut self.rng);
            let fake = self.generator.run(&z, &mut self.rng);
            let trace = self.discriminator.apply(&fake, &mut self.rng);
            let up = vec_ce_upstream(trace.output(), 0.0, 1.0);
            self.discriminator.propagate(&trace, &up, &mut grad);
        }
        grad
    }

    fn generator_gradient(&mut self, n: usize) -> Gradient {
        let mut grad = Gradient::new(self.generator.parameters());
        for _ in 0..n {
            let z = noise(self.random_size, &mut self.rng);
            let gen_trace = self.generator.apply(&z, &mut self.rng);
            let disc_trace = self.discriminator.apply(gen_trace.output(), &mut self.rng);
            // Ascend the discriminator's cost on generated samples.
            let up = vec_ce_upstream(disc_trace.output(), 0.0, -1.0);
            let d_sample = self.discriminator.propagate(&disc_trace, &up, &mut grad);
            self.generator.propagate(&gen_trace, &d_sample, &mut grad);
        }
        grad
    }
}

impl<R: Rng> Gradienter for Vector<R> {
    type Sample = Vec<f64>;

    fn gradient(&mut self, batch: &[Vec<f64>]) -> Gradient {
        let phase = self.schedule.next_phase();
        debug!(?phase, batch = batch.len(), "vector gan step");
        let grad = match phase {
            Phase::Discriminator => self.discriminator_gradient(batch),
            Phase::Generator => self.generator_gradient(batch.len()),
        };
        let grad = self.transforms.apply(phase, grad);
        merge_phases(self.generator.parameters(), self.discriminator.parameters(), grad)
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut res = self.generator.parameters_mut();
        res.extend(self.discriminator.parameters_mut());
        res
    }

    fn costs(&mut self, batch: &[Vec<f64>]) -> Costs {
        if batch.is_empty() {
            return Costs::default();
        }
        let n = batch.len() as f64;
        let mut costs = Costs::default();
        for sample in batch {
            let logits = self.discriminator.run(sample, &mut self.rng);
            costs.real += vec_ce(&logits, 1.0) / n;
            let fake = self.generate();
            let logits = self.discriminator.run(&fake, &mut self.rng);
            costs.generated += vec_ce(&logits, 0.0) / n;
        }
        costs
    }
}

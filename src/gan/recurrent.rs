use super::{
    assert_same_lengths, check_random_size, lengths, mean_seq_ce, merge_phases, seq_ce_upstream, Costs, Phase,
    Schedule, Transforms,
};
use crate::error::Result;
use crate::param::{Gradient, Param};
use crate::rnn::{apply_seqs, check_len, Block, Runner, SavedBlock};
use crate::sampling::{noise, noise_sequences};
use crate::sgd::{Gradienter, Transformer};

use rand::rngs::StdRng;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// A GAN made of recurrent networks.
///
/// The generator turns a sequence of random vectors into a synthetic
/// sequence of the same length. The discriminator is `features` followed by
/// `classify`, which emits one raw logit per timestep; costs are summed over
/// every timestep of every sequence.
pub struct Recurrent<R = StdRng> {
    generator: Box<dyn Block>,
    features: Box<dyn Block>,
    classify: Box<dyn Block>,
    random_size: usize,
    schedule: Schedule,
    transforms: Transforms,
    rng: R,
}

#[derive(Serialize, Deserialize)]
struct Saved {
    generator: SavedBlock,
    features: SavedBlock,
    classify: SavedBlock,
    random_size: usize,
    schedule: Schedule,
}

impl<R> fmt::Debug for Recurrent<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Recurrent")
            .field("random_size", &self.random_size)
            .field("schedule", &self.schedule)
            .field("transforms", &self.transforms)
            .finish()
    }
}

impl<R: Rng> Recurrent<R> {
    pub fn new(
        generator: Box<dyn Block>,
        features: Box<dyn Block>,
        classify: Box<dyn Block>,
        random_size: usize,
        rng: R,
    ) -> Self {
        assert!(random_size > 0, "random input size must be positive");
        Recurrent {
            generator,
            features,
            classify,
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

    pub fn gen_transformer<T: Transformer + 'static>(mut self, t: T) -> Self {
        self.transforms.gen = Some(Box::new(t));
        self
    }

    pub fn disc_transformer<T: Transformer + 'static>(mut self, t: T) -> Self {
        self.transforms.disc = Some(Box::new(t));
        self
    }

    pub fn generator(&self) -> &dyn Block {
        &*self.generator
    }

    /// Generates one sequence of `len` timesteps.
    pub fn generate(&mut self, len: usize) -> Vec<Vec<f64>> {
        let mut runner = Runner::new(&*self.generator);
        let mut res = Vec::with_capacity(len);
        for _ in 0..len {
            let z = noise(self.random_size, &mut self.rng);
            res.push(runner.step(&z, &mut self.rng));
        }
        res
    }

    /// Fails with `Error::NotSerializable` if any block cannot be saved.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let saved = Saved {
            generator: self.generator.save()?,
            features: self.features.save()?,
            classify: self.classify.save()?,
            random_size: self.random_size,
            schedule: self.schedule,
        };
        Ok(serde_json::to_vec(&saved)?)
    }

    pub fn deserialize(data: &[u8], rng: R) -> Result<Self> {
        let saved: Saved = serde_json::from_slice(data)?;
        check_random_size(saved.random_size)?;
        saved.schedule.validate()?;
        check_len("generator input", saved.generator.input_len(), Some(saved.random_size))?;
        check_len("feature input", saved.features.input_len(), saved.generator.output_len())?;
        check_len("classifier input", saved.classify.input_len(), saved.features.output_len())?;
        Ok(Recurrent {
            generator: saved.generator.restore()?,
            features: saved.features.restore()?,
            classify: saved.classify.restore()?,
            random_size: saved.random_size,
            schedule: saved.schedule,
            transforms: Transforms::default(),
            rng,
        })
    }

    fn discriminator_params(&self) -> Vec<&Param> {
        let mut res = self.features.parameters();
        res.extend(self.classify.parameters());
        res
    }

    /// Back-propagates classification gradients on `inputs` through the
    /// whole discriminator, returning the gradient on `inputs`.
    fn classify_gradient(
        &mut self,
        inputs: &[Vec<Vec<f64>>],
        target: f64,
        scale: f64,
        grad: &mut Gradient,
    ) -> Vec<Vec<Vec<f64>>> {
        let feature_res = apply_seqs(&*self.features, inputs, &mut self.rng);
        let class_res = apply_seqs(&*self.classify, feature_res.outputs(), &mut self.rng);
        let up = seq_ce_upstream(class_res.outputs(), target, scale);
        let d_features = class_res.propagate_gradient(&up, grad);
        feature_res.propagate_gradient(&d_features, grad)
    }

    fn classify(&mut self, inputs: &[Vec<Vec<f64>>]) -> Vec<Vec<Vec<f64>>> {
        let feature_res = apply_seqs(&*self.features, inputs, &mut self.rng);
        let class_res = apply_seqs(&*self.classify, feature_res.outputs(), &mut self.rng);
        class_res.outputs().to_vec()
    }

    fn generate_batch(&mut self, lens: &[usize]) -> Vec<Vec<Vec<f64>>> {
        let gen_in = noise_sequences(lens, self.random_size, &mut self.rng);
        apply_seqs(&*self.generator, &gen_in, &mut self.rng).outputs().to_vec()
    }
}

impl<R: Rng> Gradienter for Recurrent<R> {
    type Sample = Vec<Vec<f64>>;

    fn gradient(&mut self, batch: &[Vec<Vec<f64>>]) -> Gradient {
        let phase = self.schedule.next_phase();
        debug!(?phase, batch = batch.len(), "recurrent gan step");
        let lens = lengths(batch);
        let grad = match phase {
            Phase::Discriminator => {
                let generated = self.generate_batch(&lens);
                assert_same_lengths(batch, &generated);
                let mut grad = Gradient::new(self.discriminator_params());
                self.classify_gradient(batch, 1.0, 1.0, &mut grad);
                self.classify_gradient(&generated, 0.0, 1.0, &mut grad);
                grad
            }
            Phase::Generator => {
                let mut grad = Gradient::new(self.generator.parameters());
                let gen_in = noise_sequences(&lens, self.random_size, &mut self.rng);
                let gen_res = apply_seqs(&*self.generator, &gen_in, &mut self.rng);
                assert_same_lengths(batch, gen_res.outputs());

                let feature_res = apply_seqs(&*self.features, gen_res.outputs(), &mut self.rng);
                let class_res = apply_seqs(&*self.classify, feature_res.outputs(), &mut self.rng);
                let up = seq_ce_upstream(class_res.outputs(), 0.0, -1.0);
                let d_features = class_res.propagate_gradient(&up, &mut grad);
                let d_generated = feature_res.propagate_gradient(&d_features, &mut grad);
                gen_res.propagate_gradient(&d_generated, &mut grad);
                grad
            }
        };
        let grad = self.transforms.apply(phase, grad);
        merge_phases(self.generator.parameters(), self.discriminator_params(), grad)
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut res = self.generator.parameters_mut();
        res.extend(self.features.parameters_mut());
        res.extend(self.classify.parameters_mut());
        res
    }

    fn costs(&mut self, batch: &[Vec<Vec<f64>>]) -> Costs {
        let real = self.classify(batch);
        let generated = self.generate_batch(&lengths(batch));
        let fake = self.classify(&generated);
        Costs {
            real: mean_seq_ce(&real, 1.0),
            generated: mean_seq_ce(&fake, 0.0),
        }
    }
}

use super::{check_random_size, merge_phases, vec_ce, vec_ce_upstream, Costs, Phase, Schedule, Transforms};
use crate::cost::{mean_squared, mean_squared_gradient};
use crate::error::{Error, Result};
use crate::layers::Network;
use crate::param::{Gradient, Param};
use crate::rnn::check_len;
use crate::sampling::noise;
use crate::sgd::{Gradienter, Transformer};

use rand::rngs::StdRng;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

/// A vector GAN whose generator matches discriminator features.
///
/// The discriminator is `features` followed by `classify`. Rather than trying
/// to fool `classify`, the generator minimizes the squared distance between
/// the mean feature vector of a generated batch and that of the real batch.
#[derive(Debug)]
pub struct FeatureMatching<R = StdRng> {
    generator: Network,
    features: Network,
    classify: Network,
    random_size: usize,
    disc_scale: f64,
    schedule: Schedule,
    transforms: Transforms,
    rng: R,
}

#[derive(Serialize, Deserialize)]
struct Saved {
    generator: Network,
    features: Network,
    classify: Network,
    random_size: usize,
    disc_scale: f64,
    schedule: Schedule,
}

impl<R: Rng> FeatureMatching<R> {
    pub fn new(generator: Network, features: Network, classify: Network, random_size: usize, rng: R) -> Self {
        assert!(random_size > 0, "random input size must be positive");
        FeatureMatching {
            generator,
            features,
            classify,
            random_size,
            disc_scale: 0.1,
            schedule: Schedule::default(),
            transforms: Transforms::default(),
            rng,
        }
    }

    /// Scales the discriminator's cross-entropy gradient. Defaults to 0.1.
    pub fn disc_scale(mut self, scale: f64) -> Self {
        self.disc_scale = scale;
        self
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

    pub fn generator(&self) -> &Network {
        &self.generator
    }

    pub fn generate(&mut self) -> Vec<f64> {
        let z = noise(self.random_size, &mut self.rng);
        self.generator.run(&z, &mut self.rng)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let saved = Saved {
            generator: self.generator.clone(),
            features: self.features.clone(),
            classify: self.classify.clone(),
            random_size: self.random_size,
            disc_scale: self.disc_scale,
            schedule: self.schedule,
        };
        Ok(serde_json::to_vec(&saved)?)
    }

    pub fn deserialize(data: &[u8], rng: R) -> Result<Self> {
        let saved: Saved = serde_json::from_slice(data)?;
        check_random_size(saved.random_size)?;
        saved.schedule.validate()?;
        if !saved.disc_scale.is_finite() {
            return Err(Error::Invalid("discriminator scale must be finite".to_string()));
        }
        for net in &[&saved.generator, &saved.features, &saved.classify] {
            net.validate()?;
        }
        check_len("generator input", saved.generator.input_len(), Some(saved.random_size))?;
        check_len("feature input", saved.features.input_len(), saved.generator.output_len())?;
        check_len("classifier input", saved.classify.input_len(), saved.features.output_len())?;
        Ok(FeatureMatching {
            generator: saved.generator,
            features: saved.features,
            classify: saved.classify,
            random_size: saved.random_size,
            disc_scale: saved.disc_scale,
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

    fn classify_gradient(&mut self, sample: &[f64], target: f64, grad: &mut Gradient) {
        let feature_trace = self.features.apply(sample, &mut self.rng);
        let class_trace = self.classify.apply(feature_trace.output(), &mut self.rng);
        let up = vec_ce_upstream(class_trace.output(), target, self.disc_scale);
        let d_features = self.classify.propagate(&class_trace, &up, grad);
        self.features.propagate(&feature_trace, &d_features, grad);
    }

    fn discriminator_gradient(&mut self, batch: &[Vec<f64>]) -> Gradient {
        let mut grad = Gradient::new(self.discriminator_params());
        for sample in batch {
            self.classify_gradient(sample, 1.0, &mut grad);
            let fake = self.generate();
            self.classify_gradient(&fake, 0.0, &mut grad);
        }
        grad
    }

    fn generator_gradient(&mut self, batch: &[Vec<f64>]) -> Gradient {
        let mut grad = Gradient::new(self.generator.parameters());
        if batch.is_empty() {
            return grad;
        }
        let n = batch.len() as f64;
        let real_features: Vec<Vec<f64>> = batch
            .iter()
            .map(|s| self.features.run(s, &mut self.rng))
            .collect();
        let real_mean = mean(&real_features);

        let mut traces = Vec::with_capacity(batch.len());
        for _ in batch {
            let z = noise(self.random_size, &mut self.rng);
            let gen_trace = self.generator.apply(&z, &mut self.rng);
            let feature_trace = self.features.apply(gen_trace.output(), &mut self.rng);
            traces.push((gen_trace, feature_trace));
        }
        let gen_features: Vec<Vec<f64>> = traces.iter().map(|(_, f)| f.output().to_vec()).collect();
        let gen_mean = mean(&gen_features);
        debug!(cost = mean_squared(&real_mean, &gen_mean), "feature matching cost");

        let d_mean: Vec<f64> = mean_squared_gradient(&real_mean, &gen_mean)
            .into_iter()
            .map(|g| g / n)
            .collect();
        for (gen_trace, feature_trace) in &traces {
            let d_sample = self.features.propagate(feature_trace, &d_mean, &mut grad);
            self.generator.propagate(gen_trace, &d_sample, &mut grad);
        }
        grad
    }
}

fn mean(vectors: &[Vec<f64>]) -> Vec<f64> {
    let mut res = vec![0.0; vectors.first().map_or(0, |v| v.len())];
    for v in vectors {
        for (r, x) in res.iter_mut().zip(v) {
            *r += x;
        }
    }
    let n = vectors.len().max(1) as f64;
    res.iter_mut().for_each(|r| *r /= n);
    res
}

impl<R: Rng> Gradienter for FeatureMatching<R> {
    type Sample = Vec<f64>;

    fn gradient(&mut self, batch: &[Vec<f64>]) -> Gradient {
        let phase = self.schedule.next_phase();
        debug!(?phase, batch = batch.len(), "feature matching step");
        let grad = match phase {
            Phase::Discriminator => self.discriminator_gradient(batch),
            Phase::Generator => self.generator_gradient(batch),
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

    fn costs(&mut self, batch: &[Vec<f64>]) -> Costs {
        if batch.is_empty() {
            return Costs::default();
        }
        let n = batch.len() as f64;
        let mut costs = Costs::default();
        for sample in batch {
            let f = self.features.run(sample, &mut self.rng);
            costs.real += vec_ce(&self.classify.run(&f, &mut self.rng), 1.0) / n;
            let fake = self.generate();
            let f = self.features.run(&fake, &mut self.rng);
            costs.generated += vec_ce(&self.classify.run(&f, &mut self.rng), 0.0) / n;
        }
        costs
    }
}

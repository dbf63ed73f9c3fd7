use super::{check_random_size, merge_phases, vec_ce, vec_ce_upstream, Costs, Phase, Schedule, Transforms};
use crate::error::{Error, Result};
use crate::param::{Gradient, Param};
use crate::reward::{length_mask, length_mask_backward};
use crate::rnn::{apply_seqs, check_len, zero_upstream, Block, Runner, SavedBlock, SeqResult};
use crate::sampling::{choose_index, noise, noise_sequences};
use crate::sgd::{Gradienter, Transformer};
use crate::utils::{softmax, softmax_backward};

use rand::rngs::StdRng;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// A sequence GAN whose generator decides where its sequences end.
///
/// At every timestep the generator emits `alphabet` content logits followed
/// by one stop logit. Generated sequences always run for `max_len` steps; the
/// softmax of their stop logits over time is a distribution over which step
/// is the true end, and it weights the discriminator's cost at each step.
/// Real sequences are scored only at their final timestep.
pub struct LengthGan<R = StdRng> {
    generator: Box<dyn Block>,
    discriminator: Box<dyn Block>,
    alphabet: usize,
    max_len: usize,
    random_size: usize,
    schedule: Schedule,
    transforms: Transforms,
    rng: R,
}

#[derive(Serialize, Deserialize)]
struct Saved {
    generator: SavedBlock,
    discriminator: SavedBlock,
    alphabet: usize,
    max_len: usize,
    random_size: usize,
    schedule: Schedule,
}

/// A generated batch split into content distributions and end masks.
struct Generated<'a> {
    res: SeqResult<'a>,
    contents: Vec<Vec<Vec<f64>>>,
    masks: Vec<Vec<f64>>,
}

impl<R> fmt::Debug for LengthGan<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LengthGan")
            .field("alphabet", &self.alphabet)
            .field("max_len", &self.max_len)
            .field("random_size", &self.random_size)
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl<R: Rng> LengthGan<R> {
    pub fn new(
        generator: Box<dyn Block>,
        discriminator: Box<dyn Block>,
        alphabet: usize,
        max_len: usize,
        random_size: usize,
        rng: R,
    ) -> Self {
        assert!(alphabet > 0 && max_len > 0 && random_size > 0);
        LengthGan {
            generator,
            discriminator,
            alphabet,
            max_len,
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

    pub fn alphabet(&self) -> usize {
        self.alphabet
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Samples a sequence of symbols, cut at an end step drawn from the
    /// generator's stop distribution.
    pub fn generate(&mut self) -> Vec<usize> {
        let mut runner = Runner::new(&*self.generator);
        let mut symbols = Vec::with_capacity(self.max_len);
        let mut stops = Vec::with_capacity(self.max_len);
        for _ in 0..self.max_len {
            let z = noise(self.random_size, &mut self.rng);
            let raw = runner.step(&z, &mut self.rng);
            assert_eq!(raw.len(), self.alphabet + 1);
            let probs = softmax(&raw[..self.alphabet]);
            symbols.push(choose_index(&probs, &mut self.rng));
            stops.push(raw[self.alphabet]);
        }
        let end = choose_index(&length_mask(&stops), &mut self.rng);
        symbols.truncate(end + 1);
        symbols
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let saved = Saved {
            generator: self.generator.save()?,
            discriminator: self.discriminator.save()?,
            alphabet: self.alphabet,
            max_len: self.max_len,
            random_size: self.random_size,
            schedule: self.schedule,
        };
        Ok(serde_json::to_vec(&saved)?)
    }

    pub fn deserialize(data: &[u8], rng: R) -> Result<Self> {
        let saved: Saved = serde_json::from_slice(data)?;
        check_random_size(saved.random_size)?;
        saved.schedule.validate()?;
        if saved.alphabet == 0 {
            return Err(Error::Invalid("alphabet must not be empty".to_string()));
        }
        if saved.max_len == 0 {
            return Err(Error::Invalid("maximum length must be positive".to_string()));
        }
        check_len("generator input", saved.generator.input_len(), Some(saved.random_size))?;
        check_len(
            "generator output",
            saved.alphabet.checked_add(1),
            saved.generator.output_len(),
        )?;
        check_len("discriminator input", Some(saved.alphabet), saved.discriminator.input_len())?;
        Ok(LengthGan {
            generator: saved.generator.restore()?,
            discriminator: saved.discriminator.restore()?,
            alphabet: saved.alphabet,
            max_len: saved.max_len,
            random_size: saved.random_size,
            schedule: saved.schedule,
            transforms: Transforms::default(),
            rng,
        })
    }

    fn check_batch(&self, batch: &[Vec<Vec<f64>>]) {
        for seq in batch {
            assert!(!seq.is_empty(), "real sequences must not be empty");
            assert!(
                seq.len() <= self.max_len,
                "real sequence of length {} exceeds maximum {}",
                seq.len(),
                self.max_len
            );
        }
    }

    fn run_generator<'a>(generator: &'a dyn Block, alphabet: usize, inputs: &[Vec<Vec<f64>>], rng: &mut R) -> Generated<'a> {
        let res = apply_seqs(generator, inputs, rng);
        let mut contents = Vec::with_capacity(inputs.len());
        let mut masks = Vec::with_capacity(inputs.len());
        for seq in res.outputs() {
            let mut content = Vec::with_capacity(seq.len());
            let mut stops = Vec::with_capacity(seq.len());
            for raw in seq {
                assert_eq!(raw.len(), alphabet + 1, "generator must emit alphabet + 1 values");
                content.push(softmax(&raw[..alphabet]));
                stops.push(raw[alphabet]);
            }
            contents.push(content);
            masks.push(length_mask(&stops));
        }
        Generated { res, contents, masks }
    }

    /// Gradient on the discriminator output for a real batch: the target is
    /// only applied at each sequence's final step.
    fn real_upstream(outputs: &[Vec<Vec<f64>>]) -> Vec<Vec<Vec<f64>>> {
        let mut up = zero_upstream(outputs);
        for (u, seq) in up.iter_mut().zip(outputs) {
            if let (Some(last_up), Some(last)) = (u.last_mut(), seq.last()) {
                *last_up = vec_ce_upstream(last, 1.0, 1.0);
            }
        }
        up
    }

    fn discriminator_gradient(&mut self, batch: &[Vec<Vec<f64>>]) -> Gradient {
        let mut grad = Gradient::new(self.discriminator.parameters());
        let real_res = apply_seqs(&*self.discriminator, batch, &mut self.rng);
        real_res.propagate_gradient(&Self::real_upstream(real_res.outputs()), &mut grad);

        let gen_in = noise_sequences(&vec![self.max_len; batch.len()], self.random_size, &mut self.rng);
        let generated = Self::run_generator(&*self.generator, self.alphabet, &gen_in, &mut self.rng);
        let fake_res = apply_seqs(&*self.discriminator, &generated.contents, &mut self.rng);
        let up: Vec<Vec<Vec<f64>>> = fake_res
            .outputs()
            .iter()
            .zip(&generated.masks)
            .map(|(seq, mask)| {
                seq.iter()
                    .zip(mask)
                    .map(|(d, m)| vec_ce_upstream(d, 0.0, *m))
                    .collect()
            })
            .collect();
        fake_res.propagate_gradient(&up, &mut grad);
        grad
    }

    fn generator_gradient(&mut self, n: usize) -> Gradient {
        let mut grad = Gradient::new(self.generator.parameters());
        let gen_in = noise_sequences(&vec![self.max_len; n], self.random_size, &mut self.rng);
        let generated = Self::run_generator(&*self.generator, self.alphabet, &gen_in, &mut self.rng);
        let fake_res = apply_seqs(&*self.discriminator, &generated.contents, &mut self.rng);

        // The generator ascends sum_t mask[t] * CE(0, d[t]).
        let mut d_logits = Vec::with_capacity(n);
        let mut d_masks = Vec::with_capacity(n);
        for (seq, mask) in fake_res.outputs().iter().zip(&generated.masks) {
            d_logits.push(
                seq.iter()
                    .zip(mask)
                    .map(|(d, m)| vec_ce_upstream(d, 0.0, -m))
                    .collect::<Vec<_>>(),
            );
            d_masks.push(seq.iter().map(|d| -vec_ce(d, 0.0)).collect::<Vec<_>>());
        }
        let d_contents = fake_res.propagate_gradient(&d_logits, &mut grad);

        let mut d_raw = Vec::with_capacity(n);
        for ((content, d_content), (mask, d_mask)) in generated
            .contents
            .iter()
            .zip(&d_contents)
            .zip(generated.masks.iter().zip(&d_masks))
        {
            let d_stops = length_mask_backward(mask, d_mask);
            let seq: Vec<Vec<f64>> = content
                .iter()
                .zip(d_content)
                .zip(d_stops)
                .map(|((c, dc), ds)| {
                    let mut v = softmax_backward(c, dc);
                    v.push(ds);
                    v
                })
                .collect();
            d_raw.push(seq);
        }
        generated.res.propagate_gradient(&d_raw, &mut grad);
        grad
    }
}

impl<R: Rng> Gradienter for LengthGan<R> {
    type Sample = Vec<Vec<f64>>;

    fn gradient(&mut self, batch: &[Vec<Vec<f64>>]) -> Gradient {
        self.check_batch(batch);
        let phase = self.schedule.next_phase();
        debug!(?phase, batch = batch.len(), "length gan step");
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

    fn costs(&mut self, batch: &[Vec<Vec<f64>>]) -> Costs {
        self.check_batch(batch);
        if batch.is_empty() {
            return Costs::default();
        }
        let n = batch.len() as f64;
        let real: f64 = apply_seqs(&*self.discriminator, batch, &mut self.rng)
            .outputs()
            .iter()
            .filter_map(|seq| seq.last())
            .map(|d| vec_ce(d, 1.0))
            .sum();

        let gen_in = noise_sequences(&vec![self.max_len; batch.len()], self.random_size, &mut self.rng);
        let generated = Self::run_generator(&*self.generator, self.alphabet, &gen_in, &mut self.rng);
        let fake_res = apply_seqs(&*self.discriminator, &generated.contents, &mut self.rng);
        let fake: f64 = fake_res
            .outputs()
            .iter()
            .zip(&generated.masks)
            .map(|(seq, mask)| seq.iter().zip(mask).map(|(d, m)| m * vec_ce(d, 0.0)).sum::<f64>())
            .sum();
        Costs {
            real: real / n,
            generated: fake / n,
        }
    }
}

use super::{
    assert_same_lengths, check_random_size, lengths, mean_seq_ce, merge_phases, seq_ce_upstream, Costs, Phase,
    Schedule, Transforms,
};
use crate::activator::sigmoid;
use crate::error::{Error, Result};
use crate::param::{Gradient, Param};
use crate::reward::{discounted_rewards, policy_signal};
use crate::rnn::{apply_seqs, check_len, Block, Runner, SavedBlock, SeqResult};
use crate::sampling::{choose_index, noise, noise_sequences, one_hot};
use crate::sgd::{Gradienter, Transformer};

use rand::rngs::StdRng;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// A sequence GAN over a discrete alphabet, trained with policy gradients.
///
/// The generator emits log-probabilities over `alphabet` symbols at each
/// timestep. Concrete symbols are sampled from them and scored by the
/// discriminator; the sigmoid of each timestep's score is that step's reward.
/// Discounted future rewards then weight the log-probability of each sampled
/// symbol, which makes the discrete draws trainable.
pub struct PolicyGradient<R = StdRng> {
    generator: Box<dyn Block>,
    discriminator: Box<dyn Block>,
    alphabet: usize,
    random_size: usize,
    discount: f64,
    advantage_scale: f64,
    schedule: Schedule,
    transforms: Transforms,
    rng: R,
}

#[derive(Serialize, Deserialize)]
struct Saved {
    generator: SavedBlock,
    discriminator: SavedBlock,
    alphabet: usize,
    random_size: usize,
    discount: f64,
    advantage_scale: f64,
    schedule: Schedule,
}

/// Symbols drawn from the generator for one batch.
struct Sampled<'a> {
    res: SeqResult<'a>,
    symbols: Vec<Vec<usize>>,
    one_hots: Vec<Vec<Vec<f64>>>,
}

impl<R> fmt::Debug for PolicyGradient<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PolicyGradient")
            .field("alphabet", &self.alphabet)
            .field("random_size", &self.random_size)
            .field("discount", &self.discount)
            .field("advantage_scale", &self.advantage_scale)
            .field("schedule", &self.schedule)
            .finish()
    }
}

fn valid_discount(discount: f64) -> bool {
    (0.0..=1.0).contains(&discount)
}

impl<R: Rng> PolicyGradient<R> {
    pub fn new(
        generator: Box<dyn Block>,
        discriminator: Box<dyn Block>,
        alphabet: usize,
        random_size: usize,
        rng: R,
    ) -> Self {
        assert!(alphabet > 0 && random_size > 0);
        PolicyGradient {
            generator,
            discriminator,
            alphabet,
            random_size,
            discount: 1.0,
            advantage_scale: -1.0,
            schedule: Schedule::default(),
            transforms: Transforms::default(),
            rng,
        }
    }

    /// Sets the per-step reward discount. Zero means no discounting, the same
    /// as the default of one.
    pub fn discount(mut self, discount: f64) -> Self {
        assert!(valid_discount(discount), "discount must be within [0, 1]");
        self.discount = discount;
        self
    }

    /// Sets the factor applied to cumulative rewards before they are fed back
    /// through the log-probabilities. The default of -1 makes gradient
    /// descent raise the probability of rewarded symbols.
    pub fn advantage_scale(mut self, scale: f64) -> Self {
        self.advantage_scale = scale;
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

    /// Samples `len` symbols from the generator.
    pub fn generate(&mut self, len: usize) -> Vec<usize> {
        let mut runner = Runner::new(&*self.generator);
        let mut res = Vec::with_capacity(len);
        for _ in 0..len {
            let z = noise(self.random_size, &mut self.rng);
            let log_probs = runner.step(&z, &mut self.rng);
            let probs: Vec<f64> = log_probs.iter().map(|x| x.exp()).collect();
            res.push(choose_index(&probs, &mut self.rng));
        }
        res
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let saved = Saved {
            generator: self.generator.save()?,
            discriminator: self.discriminator.save()?,
            alphabet: self.alphabet,
            random_size: self.random_size,
            discount: self.discount,
            advantage_scale: self.advantage_scale,
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
        if !valid_discount(saved.discount) {
            return Err(Error::Invalid(format!("discount {} outside [0, 1]", saved.discount)));
        }
        if !saved.advantage_scale.is_finite() {
            return Err(Error::Invalid("advantage scale must be finite".to_string()));
        }
        check_len("generator input", saved.generator.input_len(), Some(saved.random_size))?;
        check_len("generator output", Some(saved.alphabet), saved.generator.output_len())?;
        check_len("discriminator input", Some(saved.alphabet), saved.discriminator.input_len())?;
        check_len("discriminator output", Some(1), saved.discriminator.output_len())?;
        Ok(PolicyGradient {
            generator: saved.generator.restore()?,
            discriminator: saved.discriminator.restore()?,
            alphabet: saved.alphabet,
            random_size: saved.random_size,
            discount: saved.discount,
            advantage_scale: saved.advantage_scale,
            schedule: saved.schedule,
            transforms: Transforms::default(),
            rng,
        })
    }

    fn sample<'a>(
        generator: &'a dyn Block,
        alphabet: usize,
        random_size: usize,
        lens: &[usize],
        rng: &mut R,
    ) -> Sampled<'a> {
        let gen_in = noise_sequences(lens, random_size, rng);
        let res = apply_seqs(generator, &gen_in, rng);
        let mut symbols = Vec::with_capacity(lens.len());
        let mut one_hots = Vec::with_capacity(lens.len());
        for seq in res.outputs() {
            let mut s = Vec::with_capacity(seq.len());
            let mut v = Vec::with_capacity(seq.len());
            for log_probs in seq {
                assert_eq!(log_probs.len(), alphabet, "generator must emit one log-probability per symbol");
                let probs: Vec<f64> = log_probs.iter().map(|x| x.exp()).collect();
                let idx = choose_index(&probs, rng);
                s.push(idx);
                v.push(one_hot(idx, alphabet));
            }
            symbols.push(s);
            one_hots.push(v);
        }
        Sampled { res, symbols, one_hots }
    }

    fn discriminator_gradient(&mut self, batch: &[Vec<Vec<f64>>]) -> Gradient {
        let sampled = Self::sample(
            &*self.generator,
            self.alphabet,
            self.random_size,
            &lengths(batch),
            &mut self.rng,
        );
        assert_same_lengths(batch, &sampled.one_hots);

        let mut grad = Gradient::new(self.discriminator.parameters());
        let real_res = apply_seqs(&*self.discriminator, batch, &mut self.rng);
        real_res.propagate_gradient(&seq_ce_upstream(real_res.outputs(), 1.0, 1.0), &mut grad);
        let fake_res = apply_seqs(&*self.discriminator, &sampled.one_hots, &mut self.rng);
        fake_res.propagate_gradient(&seq_ce_upstream(fake_res.outputs(), 0.0, 1.0), &mut grad);
        grad
    }

    fn generator_gradient(&mut self, batch: &[Vec<Vec<f64>>]) -> Gradient {
        let sampled = Self::sample(
            &*self.generator,
            self.alphabet,
            self.random_size,
            &lengths(batch),
            &mut self.rng,
        );
        assert_same_lengths(batch, &sampled.one_hots);

        let (alphabet, discount, scale) = (self.alphabet, self.discount, self.advantage_scale);
        let scores = apply_seqs(&*self.discriminator, &sampled.one_hots, &mut self.rng);
        let signal: Vec<Vec<Vec<f64>>> = scores
            .outputs()
            .iter()
            .zip(&sampled.symbols)
            .map(|(seq, symbols)| {
                let rewards: Vec<f64> = seq
                    .iter()
                    .map(|d| {
                        assert_eq!(d.len(), 1, "discriminator must emit one logit per timestep");
                        sigmoid(d[0])
                    })
                    .collect();
                let cumulative = discounted_rewards(&rewards, discount);
                policy_signal(symbols, alphabet, &cumulative, scale)
            })
            .collect();

        let mut grad = Gradient::new(self.generator.parameters());
        sampled.res.propagate_gradient(&signal, &mut grad);
        grad
    }
}

impl<R: Rng> Gradienter for PolicyGradient<R> {
    type Sample = Vec<Vec<f64>>;

    fn gradient(&mut self, batch: &[Vec<Vec<f64>>]) -> Gradient {
        let phase = self.schedule.next_phase();
        debug!(?phase, batch = batch.len(), "policy gradient step");
        let grad = match phase {
            Phase::Discriminator => self.discriminator_gradient(batch),
            Phase::Generator => self.generator_gradient(batch),
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
        let real = apply_seqs(&*self.discriminator, batch, &mut self.rng).outputs().to_vec();
        let one_hots = Self::sample(
            &*self.generator,
            self.alphabet,
            self.random_size,
            &lengths(batch),
            &mut self.rng,
        )
        .one_hots;
        let fake = apply_seqs(&*self.discriminator, &one_hots, &mut self.rng).outputs().to_vec();
        Costs {
            real: mean_seq_ce(&real, 1.0),
            generated: mean_seq_ce(&fake, 0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activator::Activator;
    use crate::layers::{Dense, Layer, Network};
    use crate::rnn::{Lstm, NetworkBlock, StackedBlock};
    use crate::testutil::{assert_close, numeric_gradient};
    use rand::SeedableRng;

    const ALPHABET: usize = 3;

    fn generator(rng: &mut StdRng) -> NetworkBlock {
        NetworkBlock::new(Network::new(vec![
            Dense::new(Activator::TanH, 2, 4, rng).into(),
            Dense::new(Activator::Identity, 4, ALPHABET, rng).into(),
            Layer::LogSoftmax,
        ]))
    }

    fn model(seed: u64) -> PolicyGradient {
        let mut rng = StdRng::seed_from_u64(seed);
        let gen = generator(&mut rng);
        let disc = StackedBlock::new(vec![
            Box::new(Lstm::new(ALPHABET, 3, &mut rng)),
            Box::new(NetworkBlock::new(Network::new(vec![
                Dense::new(Activator::Identity, 3, 1, &mut rng).into(),
            ]))),
        ]);
        PolicyGradient::new(Box::new(gen), Box::new(disc), ALPHABET, 2, rng)
    }

    fn batch() -> Vec<Vec<Vec<f64>>> {
        vec![
            vec![one_hot(0, ALPHABET), one_hot(1, ALPHABET), one_hot(2, ALPHABET)],
            vec![one_hot(2, ALPHABET)],
        ]
    }

    #[test]
    fn generator_gradient_is_reinforce() {
        let mut gan = model(1).schedule(Schedule::new(1, 0)).discount(0.5);
        let real = batch();
        gan.rng = StdRng::seed_from_u64(30);

        // Replay the draws the generator step will make.
        let mut probe = StdRng::seed_from_u64(30);
        let zs = noise_sequences(&lengths(&real), 2, &mut probe);
        let mut symbols = Vec::new();
        for seq in &zs {
            let mut runner = Runner::new(&*gan.generator);
            let mut s = Vec::new();
            for z in seq {
                let log_probs = runner.step(z, &mut probe);
                let probs: Vec<f64> = log_probs.iter().map(|x| x.exp()).collect();
                s.push(choose_index(&probs, &mut probe));
            }
            symbols.push(s);
        }
        let one_hots: Vec<Vec<Vec<f64>>> = symbols
            .iter()
            .map(|s| s.iter().map(|&i| one_hot(i, ALPHABET)).collect())
            .collect();
        let weights: Vec<Vec<f64>> = apply_seqs(&*gan.discriminator, &one_hots, &mut probe)
            .outputs()
            .iter()
            .map(|seq| discounted_rewards(&seq.iter().map(|d| sigmoid(d[0])).collect::<Vec<_>>(), 0.5))
            .collect();

        let grad = gan.gradient(&real);
        let analytic: Vec<Vec<f64>> = gan
            .generator
            .parameters()
            .iter()
            .map(|p| grad.get(p.id()).unwrap().to_vec())
            .collect();

        // Surrogate: -sum_t cumulative[t] * log p_t(sampled[t]).
        let surrogate = |gan: &PolicyGradient| -> f64 {
            let mut rng = StdRng::seed_from_u64(0);
            let res = apply_seqs(&*gan.generator, &zs, &mut rng);
            let mut total = 0.0;
            for ((seq, s), w) in res.outputs().iter().zip(&symbols).zip(&weights) {
                for ((log_probs, &i), c) in seq.iter().zip(s).zip(w) {
                    total -= c * log_probs[i];
                }
            }
            total
        };
        for (p, param_grad) in analytic.iter().enumerate() {
            for (j, a) in param_grad.iter().enumerate() {
                let numeric = numeric_gradient(|eps| {
                    gan.generator.parameters_mut()[p].data[j] += eps;
                    let c = surrogate(&gan);
                    gan.generator.parameters_mut()[p].data[j] -= eps;
                    c
                });
                assert_close(*a, numeric);
            }
        }
    }

    #[test]
    fn zero_discount_matches_one() {
        let real = batch();
        let mut a = model(2).schedule(Schedule::new(1, 0)).discount(0.0);
        let mut b = model(2).schedule(Schedule::new(1, 0)).discount(1.0);
        let ga = a.gradient(&real);
        let gb = b.gradient(&real);
        for (pa, pb) in a.generator.parameters().iter().zip(b.generator.parameters()) {
            assert_eq!(ga.get(pa.id()).unwrap(), gb.get(pb.id()).unwrap());
        }
    }

    #[test]
    fn discriminator_step_leaves_generator() {
        let mut gan = model(3);
        let grad = gan.gradient(&batch());
        for p in gan.generator.parameters() {
            assert!(grad.get(p.id()).unwrap().iter().all(|x| *x == 0.0));
        }
        assert!(gan
            .discriminator
            .parameters()
            .iter()
            .any(|p| grad.get(p.id()).unwrap().iter().any(|x| *x != 0.0)));
    }

    #[test]
    fn samples_valid_symbols() {
        let mut gan = model(4);
        let s = gan.generate(10);
        assert_eq!(s.len(), 10);
        assert!(s.iter().all(|&c| c < ALPHABET));
        let costs = gan.costs(&batch());
        assert!(costs.real > 0.0 && costs.generated > 0.0);
    }

    #[test]
    fn discriminator_must_emit_one_logit() {
        let mut rng = StdRng::seed_from_u64(6);
        let gen = generator(&mut rng);
        let disc = NetworkBlock::new(Network::new(vec![
            Dense::new(Activator::Identity, ALPHABET, 2, &mut rng).into(),
        ]));
        let gan = PolicyGradient::new(Box::new(gen), Box::new(disc), ALPHABET, 2, rng);
        match PolicyGradient::deserialize(&gan.serialize().unwrap(), StdRng::seed_from_u64(0)) {
            Err(Error::Invalid(msg)) => assert!(msg.contains("discriminator output")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn round_trips_configuration() {
        let gan = model(5).discount(0.75).advantage_scale(-2.0);
        let data = gan.serialize().unwrap();
        let restored = PolicyGradient::deserialize(&data, StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(restored.discount, 0.75);
        assert_eq!(restored.advantage_scale, -2.0);

        let text = String::from_utf8(data).unwrap().replace("\"discount\":0.75", "\"discount\":1.5");
        match PolicyGradient::deserialize(text.as_bytes(), StdRng::seed_from_u64(0)) {
            Err(Error::Invalid(_)) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}

use super::{Block, BlockGrad, BlockResult, SavedBlock, State};
use crate::error::{Error, Result};
use crate::layers::Dense;
use crate::param::{Gradient, Param};

use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

/// Diagonal of the initial state transition.
pub const IDENTITY_SCALE: f64 = 0.8;

/// Standard deviation of the initial per-symbol embeddings.
pub const EMBEDDING_INIT: f64 = 0.01;

/// A recurrent cell whose output is its state.
///
/// Every step computes one candidate `tanh(W s + b + e_i)` per input symbol
/// `i` and mixes the candidates by the input vector's mass on each symbol, so
/// softened probability vectors flow through it just like one-hot ones.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpBlock {
    state_trans: Dense,
    input_weights: Vec<Param>,
    init_state: Param,
}

impl ExpBlock {
    pub fn new(input_size: usize, state_size: usize, rng: &mut dyn RngCore) -> Self {
        ExpBlock {
            state_trans: Dense::identity(state_size, IDENTITY_SCALE),
            input_weights: (0..input_size)
                .map(|_| Param::random(state_size, EMBEDDING_INIT, rng))
                .collect(),
            init_state: Param::zeros(state_size),
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_weights.len()
    }

    pub fn state_size(&self) -> usize {
        self.init_state.len()
    }

    pub fn validate(&self) -> Result<()> {
        self.state_trans.validate()?;
        let n = self.state_size();
        if self.state_trans.input_len() != n || self.state_trans.output_len() != n {
            return Err(Error::Invalid(format!(
                "state transition is {}x{} for a state of size {}",
                self.state_trans.output_len(),
                self.state_trans.input_len(),
                n
            )));
        }
        if let Some(i) = self.input_weights.iter().position(|w| w.len() != n) {
            return Err(Error::Invalid(format!(
                "embedding {} has length {}, expected {}",
                i,
                self.input_weights[i].len(),
                n
            )));
        }
        Ok(())
    }
}

struct Cache {
    prev: Vec<f64>,
    pre: Vec<f64>,
    probs: Vec<f64>,
    candidates: Vec<Vec<f64>>,
}

struct ExpResult<'a> {
    block: &'a ExpBlock,
    caches: Vec<Cache>,
    outputs: Vec<Vec<f64>>,
    states: Vec<State>,
}

impl Block for ExpBlock {
    fn start_state(&self) -> State {
        State::Vector(self.init_state.data.clone())
    }

    fn apply_block<'a>(
        &'a self,
        states: Vec<State>,
        inputs: &[Vec<f64>],
        _: &mut dyn RngCore,
    ) -> Box<dyn BlockResult + 'a> {
        assert_eq!(states.len(), inputs.len());
        let mut caches = Vec::with_capacity(inputs.len());
        let mut outputs = Vec::with_capacity(inputs.len());
        for (state, probs) in states.into_iter().zip(inputs) {
            assert_eq!(probs.len(), self.input_size());
            let prev = state.into_vector();
            let pre = self.state_trans.forward(&prev);
            let candidates: Vec<Vec<f64>> = self
                .input_weights
                .iter()
                .map(|e| pre.iter().zip(&e.data).map(|(x, w)| (x + w).tanh()).collect())
                .collect();
            let mut out = vec![0.0; self.state_size()];
            for (p, cand) in probs.iter().zip(&candidates) {
                for (o, c) in out.iter_mut().zip(cand) {
                    *o += p * c;
                }
            }
            outputs.push(out);
            caches.push(Cache {
                prev,
                pre,
                probs: probs.clone(),
                candidates,
            });
        }
        let states = outputs.iter().cloned().map(State::Vector).collect();
        Box::new(ExpResult {
            block: self,
            caches,
            outputs,
            states,
        })
    }

    fn propagate_start(&self, upstream: Vec<State>, grad: &mut Gradient) {
        for state in upstream {
            grad.accumulate(&self.init_state, &state.into_vector());
        }
    }

    fn parameters(&self) -> Vec<&Param> {
        let mut res = vec![&self.init_state];
        res.extend(self.input_weights.iter());
        res.extend(self.state_trans.parameters());
        res
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut res = vec![&mut self.init_state];
        res.extend(self.input_weights.iter_mut());
        res.extend(self.state_trans.parameters_mut());
        res
    }

    fn save(&self) -> Result<SavedBlock> {
        Ok(SavedBlock::Exp(self.clone()))
    }
}

impl<'a> BlockResult for ExpResult<'a> {
    fn outputs(&self) -> &[Vec<f64>] {
        &self.outputs
    }

    fn states(&self) -> &[State] {
        &self.states
    }

    fn propagate_gradient(
        &self,
        upstream: &[Vec<f64>],
        state_upstream: Vec<Option<State>>,
        grad: &mut Gradient,
    ) -> BlockGrad {
        let mut inputs = Vec::with_capacity(self.caches.len());
        let mut states = Vec::with_capacity(self.caches.len());
        for ((cache, up), state_up) in self.caches.iter().zip(upstream).zip(state_upstream) {
            // The output and the next state are the same vector.
            let mut d_out = up.clone();
            if let Some(s) = state_up {
                for (d, s) in d_out.iter_mut().zip(s.into_vector()) {
                    *d += s;
                }
            }

            let mut d_probs = Vec::with_capacity(cache.probs.len());
            let mut d_pre = vec![0.0; d_out.len()];
            for ((p, cand), weights) in cache.probs.iter().zip(&cache.candidates).zip(&self.block.input_weights) {
                d_probs.push(d_out.iter().zip(cand).map(|(d, c)| d * c).sum());
                let d_total: Vec<f64> = d_out
                    .iter()
                    .zip(cand)
                    .map(|(d, c)| d * p * (1.0 - c * c))
                    .collect();
                grad.accumulate(weights, &d_total);
                for (a, d) in d_pre.iter_mut().zip(&d_total) {
                    *a += d;
                }
            }

            let d_prev = self.block.state_trans.backward(&cache.prev, &cache.pre, &d_pre, grad);
            inputs.push(d_probs);
            states.push(State::Vector(d_prev));
        }
        BlockGrad { inputs, states }
    }
}

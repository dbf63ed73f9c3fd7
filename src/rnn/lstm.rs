use super::{Block, BlockGrad, BlockResult, SavedBlock, State};
use crate::activator::{sigmoid, Activator};
use crate::error::{Error, Result};
use crate::layers::Dense;
use crate::param::{Gradient, Param};

use itertools::izip;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

/// A long short-term memory block.
///
/// All four gates come from one dense layer over the concatenated input and
/// previous hidden state, laid out as `[input | forget | output | cell]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lstm {
    input_size: usize,
    hidden_size: usize,
    gates: Dense,
}

impl Lstm {
    pub fn new(input_size: usize, hidden_size: usize, rng: &mut dyn RngCore) -> Self {
        let mut gates = Dense::new(Activator::Identity, input_size + hidden_size, 4 * hidden_size, rng);
        // Open the forget gate so early gradients survive long sequences.
        for b in &mut gates.biases_mut().data[hidden_size..2 * hidden_size] {
            *b = 1.0;
        }
        Lstm {
            input_size,
            hidden_size,
            gates,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn validate(&self) -> Result<()> {
        self.gates.validate()?;
        let inputs = self.input_size.checked_add(self.hidden_size);
        let outputs = self.hidden_size.checked_mul(4);
        if inputs != Some(self.gates.input_len()) || outputs != Some(self.gates.output_len()) {
            return Err(Error::Invalid(format!(
                "lstm with {} inputs and {} hidden units has {}x{} gates",
                self.input_size,
                self.hidden_size,
                self.gates.output_len(),
                self.gates.input_len()
            )));
        }
        Ok(())
    }
}

struct Cache {
    joined: Vec<f64>,
    pre: Vec<f64>,
    input: Vec<f64>,
    forget: Vec<f64>,
    output: Vec<f64>,
    candidate: Vec<f64>,
    prev_cell: Vec<f64>,
    cell_tanh: Vec<f64>,
}

struct LstmResult<'a> {
    block: &'a Lstm,
    caches: Vec<Cache>,
    outputs: Vec<Vec<f64>>,
    states: Vec<State>,
}

impl Block for Lstm {
    fn start_state(&self) -> State {
        State::Lstm {
            hidden: vec![0.0; self.hidden_size],
            cell: vec![0.0; self.hidden_size],
        }
    }

    fn apply_block<'a>(
        &'a self,
        states: Vec<State>,
        inputs: &[Vec<f64>],
        _: &mut dyn RngCore,
    ) -> Box<dyn BlockResult + 'a> {
        assert_eq!(states.len(), inputs.len());
        let h = self.hidden_size;
        let mut caches = Vec::with_capacity(inputs.len());
        let mut outputs = Vec::with_capacity(inputs.len());
        let mut out_states = Vec::with_capacity(inputs.len());
        for (state, x) in states.into_iter().zip(inputs) {
            assert_eq!(x.len(), self.input_size);
            let (hidden, prev_cell) = match state {
                State::Lstm { hidden, cell } => (hidden, cell),
                other => panic!("expected LSTM state, got {:?}", other),
            };
            let mut joined = x.clone();
            joined.extend_from_slice(&hidden);
            let pre = self.gates.forward(&joined);
            let input: Vec<f64> = pre[..h].iter().map(|&v| sigmoid(v)).collect();
            let forget: Vec<f64> = pre[h..2 * h].iter().map(|&v| sigmoid(v)).collect();
            let output: Vec<f64> = pre[2 * h..3 * h].iter().map(|&v| sigmoid(v)).collect();
            let candidate: Vec<f64> = pre[3 * h..].iter().map(|v| v.tanh()).collect();
            let cell: Vec<f64> = izip!(&forget, &prev_cell, &input, &candidate)
                .map(|(f, c, i, g)| f * c + i * g)
                .collect();
            let cell_tanh: Vec<f64> = cell.iter().map(|c| c.tanh()).collect();
            let new_hidden: Vec<f64> = output.iter().zip(&cell_tanh).map(|(o, t)| o * t).collect();

            outputs.push(new_hidden.clone());
            out_states.push(State::Lstm {
                hidden: new_hidden,
                cell,
            });
            caches.push(Cache {
                joined,
                pre,
                input,
                forget,
                output,
                candidate,
                prev_cell,
                cell_tanh,
            });
        }
        Box::new(LstmResult {
            block: self,
            caches,
            outputs,
            states: out_states,
        })
    }

    fn propagate_start(&self, _: Vec<State>, _: &mut Gradient) {}

    fn parameters(&self) -> Vec<&Param> {
        self.gates.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.gates.parameters_mut()
    }

    fn save(&self) -> Result<SavedBlock> {
        Ok(SavedBlock::Lstm(self.clone()))
    }
}

impl<'a> BlockResult for LstmResult<'a> {
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
        let h = self.block.hidden_size;
        let n = self.block.input_size;
        let mut inputs = Vec::with_capacity(self.caches.len());
        let mut states = Vec::with_capacity(self.caches.len());
        for (cache, up, state_up) in izip!(&self.caches, upstream, state_upstream) {
            let mut d_hidden = up.clone();
            let mut d_cell = vec![0.0; h];
            match state_up {
                Some(State::Lstm { hidden, cell }) => {
                    for (d, s) in d_hidden.iter_mut().zip(hidden) {
                        *d += s;
                    }
                    d_cell = cell;
                }
                Some(other) => panic!("expected LSTM state gradient, got {:?}", other),
                None => {}
            }

            let mut d_pre = vec![0.0; 4 * h];
            let mut d_prev_cell = vec![0.0; h];
            for j in 0..h {
                let (i, f, o, g) = (cache.input[j], cache.forget[j], cache.output[j], cache.candidate[j]);
                let t = cache.cell_tanh[j];
                let d_out = d_hidden[j] * t;
                let dc = d_cell[j] + d_hidden[j] * o * (1.0 - t * t);
                d_pre[j] = dc * g * i * (1.0 - i);
                d_pre[h + j] = dc * cache.prev_cell[j] * f * (1.0 - f);
                d_pre[2 * h + j] = d_out * o * (1.0 - o);
                d_pre[3 * h + j] = dc * i * (1.0 - g * g);
                d_prev_cell[j] = dc * f;
            }

            let d_joined = self.block.gates.backward(&cache.joined, &cache.pre, &d_pre, grad);
            inputs.push(d_joined[..n].to_vec());
            states.push(State::Lstm {
                hidden: d_joined[n..].to_vec(),
                cell: d_prev_cell,
            });
        }
        BlockGrad { inputs, states }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rnn::check::full_check;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn gradient_check() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut block = Lstm::new(3, 2, &mut rng);
        let inputs = crate::sampling::noise_sequences(&[3, 2], 3, &mut rng);
        full_check(&mut block, &inputs, &mut rng);
    }

    #[test]
    fn gate_shape_must_match_sizes() {
        let mut rng = StdRng::seed_from_u64(14);
        let mut block = Lstm::new(3, 2, &mut rng);
        assert!(block.validate().is_ok());
        block.hidden_size = 3;
        assert!(block.validate().is_err());
    }

    #[test]
    fn forget_bias_starts_open() {
        let mut rng = StdRng::seed_from_u64(0);
        let block = Lstm::new(2, 3, &mut rng);
        let biases = &block.gates.biases().data;
        assert_eq!(&biases[3..6], &[1.0, 1.0, 1.0]);
        assert_eq!(&biases[..3], &[0.0, 0.0, 0.0]);
    }
}

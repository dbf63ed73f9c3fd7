use super::{Block, BlockGrad, BlockResult, SavedBlock, State};
use crate::error::Result;
use crate::param::{Gradient, Param};

use rand::RngCore;

/// Feeds each block's output into the next block within one timestep.
pub struct StackedBlock {
    blocks: Vec<Box<dyn Block>>,
}

impl StackedBlock {
    pub fn new(blocks: Vec<Box<dyn Block>>) -> Self {
        assert!(!blocks.is_empty(), "a stack needs at least one block");
        StackedBlock { blocks }
    }
}

/// Splits a batch of stacked states into one batch per layer.
fn unstack(states: Vec<State>, depth: usize) -> Vec<Vec<State>> {
    let mut layers: Vec<Vec<State>> = (0..depth).map(|_| Vec::with_capacity(states.len())).collect();
    for state in states {
        let parts = state.into_stacked();
        assert_eq!(parts.len(), depth);
        for (layer, part) in layers.iter_mut().zip(parts) {
            layer.push(part);
        }
    }
    layers
}

/// The inverse of `unstack`.
fn restack(layers: Vec<Vec<State>>, batch: usize) -> Vec<State> {
    let mut states: Vec<Vec<State>> = (0..batch).map(|_| Vec::with_capacity(layers.len())).collect();
    for layer in layers {
        for (state, part) in states.iter_mut().zip(layer) {
            state.push(part);
        }
    }
    states.into_iter().map(State::Stacked).collect()
}

struct StackedResult<'a> {
    results: Vec<Box<dyn BlockResult + 'a>>,
    outputs: Vec<Vec<f64>>,
    states: Vec<State>,
}

impl Block for StackedBlock {
    fn start_state(&self) -> State {
        State::Stacked(self.blocks.iter().map(|b| b.start_state()).collect())
    }

    fn apply_block<'a>(
        &'a self,
        states: Vec<State>,
        inputs: &[Vec<f64>],
        rng: &mut dyn RngCore,
    ) -> Box<dyn BlockResult + 'a> {
        let batch = inputs.len();
        let layer_states = unstack(states, self.blocks.len());
        let mut results: Vec<Box<dyn BlockResult + 'a>> = Vec::with_capacity(self.blocks.len());
        let mut out_layers = Vec::with_capacity(self.blocks.len());
        for (block, s) in self.blocks.iter().zip(layer_states) {
            let result = match results.last() {
                Some(prev) => block.apply_block(s, prev.outputs(), rng),
                None => block.apply_block(s, inputs, rng),
            };
            out_layers.push(result.states().to_vec());
            results.push(result);
        }
        let outputs = results.last().map(|r| r.outputs().to_vec()).unwrap_or_default();
        Box::new(StackedResult {
            results,
            outputs,
            states: restack(out_layers, batch),
        })
    }

    fn propagate_start(&self, upstream: Vec<State>, grad: &mut Gradient) {
        let layers = unstack(upstream, self.blocks.len());
        for (block, layer) in self.blocks.iter().zip(layers) {
            block.propagate_start(layer, grad);
        }
    }

    fn parameters(&self) -> Vec<&Param> {
        self.blocks.iter().flat_map(|b| b.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.blocks.iter_mut().flat_map(|b| b.parameters_mut()).collect()
    }

    fn save(&self) -> Result<SavedBlock> {
        let saved = self.blocks.iter().map(|b| b.save()).collect::<Result<Vec<_>>>()?;
        Ok(SavedBlock::Stacked(saved))
    }
}

impl<'a> BlockResult for StackedResult<'a> {
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
        let depth = self.results.len();
        let batch = upstream.len();
        let mut layer_state_up: Vec<Vec<Option<State>>> = (0..depth).map(|_| Vec::with_capacity(batch)).collect();
        for state in state_upstream {
            match state {
                Some(s) => {
                    let parts = s.into_stacked();
                    assert_eq!(parts.len(), depth);
                    for (layer, part) in layer_state_up.iter_mut().zip(parts) {
                        layer.push(Some(part));
                    }
                }
                None => {
                    for layer in layer_state_up.iter_mut() {
                        layer.push(None);
                    }
                }
            }
        }

        let mut up = upstream.to_vec();
        let mut down_layers = Vec::with_capacity(depth);
        for (result, state_up) in self.results.iter().zip(layer_state_up).rev() {
            let down = result.propagate_gradient(&up, state_up, grad);
            up = down.inputs;
            down_layers.push(down.states);
        }
        down_layers.reverse();
        BlockGrad {
            inputs: up,
            states: restack(down_layers, batch),
        }
    }
}

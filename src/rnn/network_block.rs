use super::{Block, BlockGrad, BlockResult, SavedBlock, State};
use crate::error::Result;
use crate::layers::{Network, NetworkTrace};
use crate::param::{Gradient, Param};

use rand::RngCore;

/// Applies a feed-forward network independently at every timestep.
#[derive(Clone, Debug)]
pub struct NetworkBlock {
    network: Network,
}

impl NetworkBlock {
    pub fn new(network: Network) -> Self {
        NetworkBlock { network }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}

struct NetworkBlockResult<'a> {
    network: &'a Network,
    traces: Vec<NetworkTrace>,
    outputs: Vec<Vec<f64>>,
    states: Vec<State>,
}

impl Block for NetworkBlock {
    fn start_state(&self) -> State {
        State::Empty
    }

    fn apply_block<'a>(
        &'a self,
        states: Vec<State>,
        inputs: &[Vec<f64>],
        rng: &mut dyn RngCore,
    ) -> Box<dyn BlockResult + 'a> {
        assert_eq!(states.len(), inputs.len());
        let traces: Vec<NetworkTrace> = inputs.iter().map(|x| self.network.apply(x, rng)).collect();
        let outputs = traces.iter().map(|t| t.output().to_vec()).collect();
        Box::new(NetworkBlockResult {
            network: &self.network,
            traces,
            outputs,
            states,
        })
    }

    fn propagate_start(&self, _: Vec<State>, _: &mut Gradient) {}

    fn parameters(&self) -> Vec<&Param> {
        self.network.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.network.parameters_mut()
    }

    fn save(&self) -> Result<SavedBlock> {
        Ok(SavedBlock::Network(self.network.clone()))
    }
}

impl<'a> BlockResult for NetworkBlockResult<'a> {
    fn outputs(&self) -> &[Vec<f64>] {
        &self.outputs
    }

    fn states(&self) -> &[State] {
        &self.states
    }

    fn propagate_gradient(&self, upstream: &[Vec<f64>], _: Vec<Option<State>>, grad: &mut Gradient) -> BlockGrad {
        let inputs = self
            .traces
            .iter()
            .zip(upstream)
            .map(|(trace, u)| self.network.propagate(trace, u, grad))
            .collect();
        BlockGrad {
            inputs,
            states: vec![State::Empty; self.traces.len()],
        }
    }
}

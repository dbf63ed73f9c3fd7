//! Recurrent blocks and the machinery that runs them over sequences.
//!
//! A `Block` maps a batch of `(state, input)` pairs to a batch of outputs and
//! fresh states. States are values: each one is produced by a step and
//! consumed by the next step (or by back-propagation) exactly once. Gradients
//! with respect to states use the same `State` shape as the states they
//! describe.

mod exp;
mod feedback;
mod lstm;
mod network_block;
mod stacked;

pub use self::exp::ExpBlock;
pub use self::feedback::FeedbackBlock;
pub use self::lstm::Lstm;
pub use self::network_block::NetworkBlock;
pub use self::stacked::StackedBlock;

use crate::error::{Error, Result};
use crate::layers::Network;
use crate::param::{Gradient, Param};

use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use std::mem;

/// The hidden memory a block threads between timesteps.
#[derive(Clone, Debug, PartialEq)]
pub enum State {
    /// For blocks without memory.
    Empty,
    Vector(Vec<f64>),
    Lstm { hidden: Vec<f64>, cell: Vec<f64> },
    Feedback { inner: Box<State>, feedback: Vec<f64> },
    Stacked(Vec<State>),
}

impl State {
    fn into_vector(self) -> Vec<f64> {
        match self {
            State::Vector(v) => v,
            other => panic!("expected vector state, got {:?}", other),
        }
    }

    fn into_stacked(self) -> Vec<State> {
        match self {
            State::Stacked(v) => v,
            other => panic!("expected stacked state, got {:?}", other),
        }
    }
}

/// The gradients a block step sends back to its inputs and incoming states.
#[derive(Clone, Debug)]
pub struct BlockGrad {
    pub inputs: Vec<Vec<f64>>,
    pub states: Vec<State>,
}

/// The result of applying a block to one timestep of a batch.
pub trait BlockResult {
    fn outputs(&self) -> &[Vec<f64>];

    fn states(&self) -> &[State];

    /// Back-propagates through this step.
    ///
    /// `upstream` holds the gradient on each output and `state_upstream` the
    /// gradient on each output state, or `None` where the state was never
    /// consumed (the last timestep of a sequence).
    fn propagate_gradient(
        &self,
        upstream: &[Vec<f64>],
        state_upstream: Vec<Option<State>>,
        grad: &mut Gradient,
    ) -> BlockGrad;
}

/// A recurrent building block.
pub trait Block {
    /// Returns the state every sequence starts from.
    fn start_state(&self) -> State;

    /// Applies the block to a batch of states and inputs.
    fn apply_block<'a>(
        &'a self,
        states: Vec<State>,
        inputs: &[Vec<f64>],
        rng: &mut dyn RngCore,
    ) -> Box<dyn BlockResult + 'a>;

    /// Accumulates the gradients on a batch of start states into the
    /// parameters that produced them.
    fn propagate_start(&self, upstream: Vec<State>, grad: &mut Gradient);

    /// Returns the trainable parameters, which may be none.
    fn parameters(&self) -> Vec<&Param>;

    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    /// Captures the block in a serializable form.
    fn save(&self) -> Result<SavedBlock> {
        Err(Error::NotSerializable(std::any::type_name::<Self>()))
    }
}

/// The persisted form of the built-in blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SavedBlock {
    Network(Network),
    Lstm(Lstm),
    Stacked(Vec<SavedBlock>),
    Feedback {
        block: Box<SavedBlock>,
        init_feedback: Param,
    },
    Exp(ExpBlock),
}

impl SavedBlock {
    /// Checks the internal shapes of a loaded block, recursively.
    pub fn validate(&self) -> Result<()> {
        match self {
            SavedBlock::Network(n) => n.validate(),
            SavedBlock::Lstm(l) => l.validate(),
            SavedBlock::Exp(e) => e.validate(),
            SavedBlock::Stacked(blocks) => {
                if blocks.is_empty() {
                    return Err(Error::Invalid("stacked block is empty".to_string()));
                }
                for b in blocks {
                    b.validate()?;
                }
                for (i, pair) in blocks.windows(2).enumerate() {
                    check_len(
                        &format!("stacked block {}", i + 1),
                        pair[1].input_len(),
                        pair[0].output_len(),
                    )?;
                }
                Ok(())
            }
            SavedBlock::Feedback {
                block,
                init_feedback,
            } => {
                block.validate()?;
                check_len("initial feedback", block.output_len(), Some(init_feedback.len()))?;
                match block.input_len() {
                    Some(n) if n < init_feedback.len() => Err(Error::Invalid(format!(
                        "feedback of length {} does not fit an input of length {}",
                        init_feedback.len(),
                        n
                    ))),
                    _ => Ok(()),
                }
            }
        }
    }

    /// The input length the block expects, where it is fixed.
    pub fn input_len(&self) -> Option<usize> {
        match self {
            SavedBlock::Network(n) => n.input_len(),
            SavedBlock::Lstm(l) => Some(l.input_size()),
            SavedBlock::Exp(e) => Some(e.input_size()),
            SavedBlock::Stacked(blocks) => blocks.first().and_then(SavedBlock::input_len),
            SavedBlock::Feedback {
                block,
                init_feedback,
            } => block
                .input_len()
                .and_then(|n| n.checked_sub(init_feedback.len())),
        }
    }

    /// The output length the block produces, where it is fixed.
    pub fn output_len(&self) -> Option<usize> {
        match self {
            SavedBlock::Network(n) => n.output_len(),
            SavedBlock::Lstm(l) => Some(l.hidden_size()),
            SavedBlock::Exp(e) => Some(e.state_size()),
            SavedBlock::Stacked(blocks) => blocks.last().and_then(SavedBlock::output_len),
            SavedBlock::Feedback { block, .. } => block.output_len(),
        }
    }

    /// Validates the block and builds it.
    pub fn restore(self) -> Result<Box<dyn Block>> {
        self.validate()?;
        Ok(self.into_block())
    }

    pub fn into_block(self) -> Box<dyn Block> {
        match self {
            SavedBlock::Network(n) => Box::new(NetworkBlock::new(n)),
            SavedBlock::Lstm(l) => Box::new(l),
            SavedBlock::Stacked(blocks) => Box::new(StackedBlock::new(
                blocks.into_iter().map(SavedBlock::into_block).collect(),
            )),
            SavedBlock::Feedback {
                block,
                init_feedback,
            } => Box::new(FeedbackBlock::with_init_feedback(
                block.into_block(),
                init_feedback,
            )),
            SavedBlock::Exp(e) => Box::new(e),
        }
    }
}

/// Fails unless two lengths agree, treating an unknown length as a match.
pub(crate) fn check_len(what: &str, expected: Option<usize>, found: Option<usize>) -> Result<()> {
    match (expected, found) {
        (Some(e), Some(f)) if e != f => Err(Error::Invalid(format!(
            "{}: expected length {}, found {}",
            what, e, f
        ))),
        _ => Ok(()),
    }
}

struct Step<'a> {
    /// Indices of the sequences still running at this timestep.
    active: Vec<usize>,
    result: Box<dyn BlockResult + 'a>,
}

/// A block applied to a batch of variable-length sequences.
pub struct SeqResult<'a> {
    block: &'a dyn Block,
    lengths: Vec<usize>,
    steps: Vec<Step<'a>>,
    outputs: Vec<Vec<Vec<f64>>>,
}

/// Runs `block` over every sequence in `inputs`, timestep by timestep.
pub fn apply_seqs<'a>(
    block: &'a dyn Block,
    inputs: &[Vec<Vec<f64>>],
    rng: &mut dyn RngCore,
) -> SeqResult<'a> {
    let lengths: Vec<usize> = inputs.iter().map(|s| s.len()).collect();
    let max_len = lengths.iter().cloned().max().unwrap_or(0);
    let mut states: Vec<State> = inputs.iter().map(|_| block.start_state()).collect();
    let mut outputs: Vec<Vec<Vec<f64>>> = lengths.iter().map(|&l| Vec::with_capacity(l)).collect();
    let mut steps = Vec::with_capacity(max_len);

    for t in 0..max_len {
        let active: Vec<usize> = (0..inputs.len()).filter(|&i| lengths[i] > t).collect();
        let step_states = active
            .iter()
            .map(|&i| mem::replace(&mut states[i], State::Empty))
            .collect();
        let step_inputs: Vec<Vec<f64>> = active.iter().map(|&i| inputs[i][t].clone()).collect();
        let result = block.apply_block(step_states, &step_inputs, rng);
        for (k, &i) in active.iter().enumerate() {
            outputs[i].push(result.outputs()[k].clone());
            states[i] = result.states()[k].clone();
        }
        steps.push(Step { active, result });
    }

    SeqResult {
        block,
        lengths,
        steps,
        outputs,
    }
}

impl<'a> SeqResult<'a> {
    pub fn outputs(&self) -> &[Vec<Vec<f64>>] {
        &self.outputs
    }

    /// Back-propagates through time.
    ///
    /// `upstream[i][t]` is the gradient on output `t` of sequence `i`. Returns
    /// the gradient on every input in the same layout.
    pub fn propagate_gradient(&self, upstream: &[Vec<Vec<f64>>], grad: &mut Gradient) -> Vec<Vec<Vec<f64>>> {
        assert_eq!(upstream.len(), self.lengths.len());
        for (u, &l) in upstream.iter().zip(&self.lengths) {
            assert_eq!(u.len(), l, "upstream sequence length mismatch");
        }

        let mut input_grads: Vec<Vec<Vec<f64>>> =
            self.lengths.iter().map(|&l| vec![Vec::new(); l]).collect();
        let mut state_grads: Vec<Option<State>> = vec![None; self.lengths.len()];
        for (t, step) in self.steps.iter().enumerate().rev() {
            let up: Vec<Vec<f64>> = step.active.iter().map(|&i| upstream[i][t].clone()).collect();
            let state_up = step.active.iter().map(|&i| state_grads[i].take()).collect();
            let down = step.result.propagate_gradient(&up, state_up, grad);
            for ((&i, g), s) in step.active.iter().zip(down.inputs).zip(down.states) {
                input_grads[i][t] = g;
                state_grads[i] = Some(s);
            }
        }

        let start_grads: Vec<State> = state_grads.into_iter().flatten().collect();
        if !start_grads.is_empty() {
            self.block.propagate_start(start_grads, grad);
        }
        input_grads
    }
}

/// Zero gradients shaped like a batch of sequence outputs.
pub fn zero_upstream(outputs: &[Vec<Vec<f64>>]) -> Vec<Vec<Vec<f64>>> {
    outputs
        .iter()
        .map(|seq| seq.iter().map(|v| vec![0.0; v.len()]).collect())
        .collect()
}

/// Steps a block through time one input at a time, for generation.
pub struct Runner<'a> {
    block: &'a dyn Block,
    state: Option<State>,
}

impl<'a> Runner<'a> {
    pub fn new(block: &'a dyn Block) -> Self {
        Runner { block, state: None }
    }

    /// Feeds the next timestep's input and returns the block output.
    pub fn step(&mut self, input: &[f64], rng: &mut dyn RngCore) -> Vec<f64> {
        let state = match self.state.take() {
            Some(s) => s,
            None => self.block.start_state(),
        };
        let result = self.block.apply_block(vec![state], &[input.to_vec()], rng);
        self.state = Some(result.states()[0].clone());
        result.outputs()[0].clone()
    }

    /// Forgets all state so the next step starts a new sequence.
    pub fn reset(&mut self) {
        self.state = None;
    }
}

#[cfg(test)]
pub(crate) mod check {
    //! Gradient checking for whole-sequence block applications.

    use super::*;
    use crate::testutil::{assert_close, numeric_gradient};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cost(block: &dyn Block, inputs: &[Vec<Vec<f64>>], weights: &[Vec<Vec<f64>>]) -> f64 {
        let mut rng = StdRng::seed_from_u64(0);
        let res = apply_seqs(block, inputs, &mut rng);
        let mut total = 0.0;
        for (seq, wseq) in res.outputs().iter().zip(weights) {
            for (out, w) in seq.iter().zip(wseq) {
                total += out.iter().zip(w).map(|(a, b)| a * b).sum::<f64>();
            }
        }
        total
    }

    /// Compares propagated gradients against finite differences for every
    /// parameter entry and every input component, for a weighted sum of all
    /// outputs.
    pub fn full_check(block: &mut dyn Block, inputs: &[Vec<Vec<f64>>], rng: &mut StdRng) {
        let weights: Vec<Vec<Vec<f64>>> = {
            let mut out_rng = StdRng::seed_from_u64(0);
            let res = apply_seqs(block, inputs, &mut out_rng);
            res.outputs()
                .iter()
                .map(|seq| {
                    seq.iter()
                        .map(|v| crate::sampling::noise(v.len(), &mut *rng))
                        .collect()
                })
                .collect()
        };

        let (input_grads, param_grads) = {
            let mut out_rng = StdRng::seed_from_u64(0);
            let res = apply_seqs(block, inputs, &mut out_rng);
            let mut grad = Gradient::new(block.parameters());
            let input_grads = res.propagate_gradient(&weights, &mut grad);
            let param_grads: Vec<Vec<f64>> = block
                .parameters()
                .iter()
                .map(|p| grad.get(p.id()).map(|g| g.to_vec()).unwrap_or_default())
                .collect();
            (input_grads, param_grads)
        };

        for (p, analytic) in param_grads.iter().enumerate() {
            for (j, a) in analytic.iter().enumerate() {
                let numeric = numeric_gradient(|eps| {
                    block.parameters_mut()[p].data[j] += eps;
                    let c = cost(&*block, inputs, &weights);
                    block.parameters_mut()[p].data[j] -= eps;
                    c
                });
                assert_close(*a, numeric);
            }
        }

        for (i, seq) in inputs.iter().enumerate() {
            for (t, v) in seq.iter().enumerate() {
                for k in 0..v.len() {
                    let numeric = numeric_gradient(|eps| {
                        let mut perturbed = inputs.to_vec();
                        perturbed[i][t][k] += eps;
                        cost(&*block, &perturbed, &weights)
                    });
                    assert_close(input_grads[i][t][k], numeric);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activator::Activator;
    use crate::layers::Dense;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_seqs(lengths: &[usize], size: usize, rng: &mut StdRng) -> Vec<Vec<Vec<f64>>> {
        crate::sampling::noise_sequences(lengths, size, rng)
    }

    #[test]
    fn variable_lengths() {
        let mut rng = StdRng::seed_from_u64(1);
        let block = Lstm::new(2, 3, &mut rng);
        let inputs = random_seqs(&[3, 0, 1], 2, &mut rng);
        let res = apply_seqs(&block, &inputs, &mut rng);
        let lens: Vec<usize> = res.outputs().iter().map(|s| s.len()).collect();
        assert_eq!(lens, vec![3, 0, 1]);
        let mut grad = Gradient::new(block.parameters());
        let input_grads = res.propagate_gradient(&zero_upstream(res.outputs()), &mut grad);
        assert_eq!(input_grads[0].len(), 3);
        assert_eq!(input_grads[0][2].len(), 2);
    }

    #[test]
    fn runner_matches_sequence_application() {
        let mut rng = StdRng::seed_from_u64(2);
        let block = Lstm::new(2, 2, &mut rng);
        let inputs = random_seqs(&[4], 2, &mut rng);
        let expected = apply_seqs(&block, &inputs, &mut rng).outputs()[0].clone();
        let mut runner = Runner::new(&block);
        for (x, e) in inputs[0].iter().zip(&expected) {
            assert_eq!(&runner.step(x, &mut rng), e);
        }
    }

    #[test]
    fn reset_runner_starts_over() {
        let mut rng = StdRng::seed_from_u64(5);
        let block = Lstm::new(2, 2, &mut rng);
        let x = [0.5, -0.5];
        let mut runner = Runner::new(&block);
        let first = runner.step(&x, &mut rng);
        assert_ne!(runner.step(&x, &mut rng), first);
        runner.reset();
        assert_eq!(runner.step(&x, &mut rng), first);
    }

    #[test]
    fn saved_blocks_round_trip() {
        let mut rng = StdRng::seed_from_u64(3);
        let block = FeedbackBlock::new(
            Box::new(StackedBlock::new(vec![
                Box::new(Lstm::new(3, 4, &mut rng)),
                Box::new(NetworkBlock::new(Network::new(vec![
                    Dense::new(Activator::Identity, 4, 2, &mut rng).into(),
                ]))),
            ])),
            2,
        );
        let data = serde_json::to_vec(&block.save().unwrap()).unwrap();
        let saved: SavedBlock = serde_json::from_slice(&data).unwrap();
        let restored = saved.restore().unwrap();

        let inputs = random_seqs(&[3], 1, &mut rng);
        let a = apply_seqs(&block, &inputs, &mut rng).outputs().to_vec();
        let b = apply_seqs(&*restored, &inputs, &mut rng).outputs().to_vec();
        assert_eq!(a, b);
        assert_eq!(block.parameters().len(), restored.parameters().len());
    }

    fn feedback_lstm(rng: &mut StdRng) -> SavedBlock {
        FeedbackBlock::new(Box::new(Lstm::new(5, 2, rng)), 2).save().unwrap()
    }

    #[test]
    fn restore_checks_shapes() {
        let mut rng = StdRng::seed_from_u64(4);
        let saved = feedback_lstm(&mut rng);
        assert_eq!((saved.input_len(), saved.output_len()), (Some(3), Some(2)));
        assert!(saved.restore().is_ok());

        let mut saved = feedback_lstm(&mut rng);
        if let SavedBlock::Feedback { init_feedback, .. } = &mut saved {
            init_feedback.data.push(0.0);
        }
        match saved.restore() {
            Err(Error::Invalid(msg)) => assert!(msg.contains("initial feedback")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }

        let stack = SavedBlock::Stacked(vec![
            SavedBlock::Lstm(Lstm::new(3, 4, &mut rng)),
            SavedBlock::Lstm(Lstm::new(3, 2, &mut rng)),
        ]);
        assert!(stack.restore().is_err());
        assert!(SavedBlock::Stacked(Vec::new()).restore().is_err());
    }

    struct Opaque(NetworkBlock);

    impl Block for Opaque {
        fn start_state(&self) -> State {
            State::Empty
        }

        fn apply_block<'a>(
            &'a self,
            states: Vec<State>,
            inputs: &[Vec<f64>],
            rng: &mut dyn RngCore,
        ) -> Box<dyn BlockResult + 'a> {
            self.0.apply_block(states, inputs, rng)
        }

        fn propagate_start(&self, _: Vec<State>, _: &mut Gradient) {}

        fn parameters(&self) -> Vec<&Param> {
            Vec::new()
        }

        fn parameters_mut(&mut self) -> Vec<&mut Param> {
            Vec::new()
        }
    }

    #[test]
    fn unsaveable_blocks_fail_at_save_time() {
        let block = FeedbackBlock::new(Box::new(Opaque(NetworkBlock::new(Network::default()))), 1);
        match block.save() {
            Err(Error::NotSerializable(name)) => assert!(name.contains("Opaque")),
            other => panic!("unexpected {:?}", other),
        }
    }
}

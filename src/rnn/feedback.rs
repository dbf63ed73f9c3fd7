use super::{Block, BlockGrad, BlockResult, SavedBlock, State};
use crate::error::Result;
use crate::param::{Gradient, Param};

use rand::RngCore;

/// Feeds a block's output back into its input at the next timestep.
///
/// If the wrapped block outputs `v` at time `t` and the external input at
/// time `t+1` is `u`, the wrapped block receives the concatenation `(u, v)`.
/// At the first timestep `v` is the learned `init_feedback` vector.
pub struct FeedbackBlock {
    block: Box<dyn Block>,
    init_feedback: Param,
}

impl FeedbackBlock {
    /// Wraps `block`, whose outputs have length `out_size`, with a zeroed
    /// initial feedback vector.
    pub fn new(block: Box<dyn Block>, out_size: usize) -> Self {
        FeedbackBlock::with_init_feedback(block, Param::zeros(out_size))
    }

    pub fn with_init_feedback(block: Box<dyn Block>, init_feedback: Param) -> Self {
        FeedbackBlock {
            block,
            init_feedback,
        }
    }

    pub fn init_feedback(&self) -> &Param {
        &self.init_feedback
    }

    pub fn init_feedback_mut(&mut self) -> &mut Param {
        &mut self.init_feedback
    }
}

struct FeedbackResult<'a> {
    internal: Box<dyn BlockResult + 'a>,
    /// Length of each external input, where the feedback part begins.
    input_lens: Vec<usize>,
    states: Vec<State>,
}

impl Block for FeedbackBlock {
    fn start_state(&self) -> State {
        State::Feedback {
            inner: Box::new(self.block.start_state()),
            feedback: self.init_feedback.data.clone(),
        }
    }

    fn apply_block<'a>(
        &'a self,
        states: Vec<State>,
        inputs: &[Vec<f64>],
        rng: &mut dyn RngCore,
    ) -> Box<dyn BlockResult + 'a> {
        assert_eq!(states.len(), inputs.len());
        let mut joined = Vec::with_capacity(inputs.len());
        let mut internal_states = Vec::with_capacity(inputs.len());
        for (state, input) in states.into_iter().zip(inputs) {
            match state {
                State::Feedback { inner, feedback } => {
                    let mut v = input.clone();
                    v.extend_from_slice(&feedback);
                    joined.push(v);
                    internal_states.push(*inner);
                }
                other => panic!("expected feedback state, got {:?}", other),
            }
        }

        let internal = self.block.apply_block(internal_states, &joined, rng);
        let states = internal
            .states()
            .iter()
            .zip(internal.outputs())
            .map(|(s, out)| State::Feedback {
                inner: Box::new(s.clone()),
                feedback: out.clone(),
            })
            .collect();

        Box::new(FeedbackResult {
            internal,
            input_lens: inputs.iter().map(|x| x.len()).collect(),
            states,
        })
    }

    fn propagate_start(&self, upstream: Vec<State>, grad: &mut Gradient) {
        let mut internal = Vec::with_capacity(upstream.len());
        for state in upstream {
            match state {
                State::Feedback { inner, feedback } => {
                    grad.accumulate(&self.init_feedback, &feedback);
                    internal.push(*inner);
                }
                other => panic!("expected feedback state gradient, got {:?}", other),
            }
        }
        self.block.propagate_start(internal, grad);
    }

    fn parameters(&self) -> Vec<&Param> {
        let mut res = vec![&self.init_feedback];
        res.extend(self.block.parameters());
        res
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        let mut res = vec![&mut self.init_feedback];
        res.extend(self.block.parameters_mut());
        res
    }

    fn save(&self) -> Result<SavedBlock> {
        Ok(SavedBlock::Feedback {
            block: Box::new(self.block.save()?),
            init_feedback: self.init_feedback.clone(),
        })
    }
}

impl<'a> BlockResult for FeedbackResult<'a> {
    fn outputs(&self) -> &[Vec<f64>] {
        self.internal.outputs()
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
        // The output is read twice: as this step's output and as the next
        // step's feedback input. Both gradients are summed before entering
        // the wrapped block.
        let mut internal_upstream = upstream.to_vec();
        let mut internal_state_upstream = Vec::with_capacity(upstream.len());
        for (up, state_up) in internal_upstream.iter_mut().zip(state_upstream) {
            match state_up {
                Some(State::Feedback { inner, feedback }) => {
                    for (u, f) in up.iter_mut().zip(feedback) {
                        *u += f;
                    }
                    internal_state_upstream.push(Some(*inner));
                }
                Some(other) => panic!("expected feedback state gradient, got {:?}", other),
                None => internal_state_upstream.push(None),
            }
        }

        let down = self
            .internal
            .propagate_gradient(&internal_upstream, internal_state_upstream, grad);

        let mut inputs = Vec::with_capacity(upstream.len());
        let mut states = Vec::with_capacity(upstream.len());
        for ((mut joined, inner), &n) in down.inputs.into_iter().zip(down.states).zip(&self.input_lens) {
            let feedback = joined.split_off(n);
            inputs.push(joined);
            states.push(State::Feedback {
                inner: Box::new(inner),
                feedback,
            });
        }
        BlockGrad { inputs, states }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rnn::check::full_check;
    use crate::rnn::{apply_seqs, Lstm};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_block(rng: &mut StdRng) -> FeedbackBlock {
        let inner = Lstm::new(6, 2, rng);
        let mut block = FeedbackBlock::new(Box::new(inner), 2);
        block.init_feedback_mut().data = crate::sampling::noise(2, rng);
        block
    }

    #[test]
    fn gradient_check() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut block = random_block(&mut rng);
        let inputs = crate::sampling::noise_sequences(&[3, 2, 1], 4, &mut rng);
        full_check(&mut block, &inputs, &mut rng);
    }

    #[test]
    fn first_step_sees_initial_feedback() {
        let mut rng = StdRng::seed_from_u64(19);
        let block = random_block(&mut rng);
        match block.start_state() {
            State::Feedback { feedback, .. } => assert_eq!(feedback, block.init_feedback().data),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn output_feeds_next_step() {
        let mut rng = StdRng::seed_from_u64(23);
        let block = random_block(&mut rng);
        let inputs = crate::sampling::noise_sequences(&[2], 4, &mut rng);
        let res = apply_seqs(&block, &inputs, &mut rng);
        let first = res.outputs()[0][0].clone();

        let step = block.apply_block(vec![block.start_state()], &inputs[0][..1], &mut rng);
        match &step.states()[0] {
            State::Feedback { feedback, .. } => assert_eq!(feedback, &first),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn initial_feedback_is_trainable() {
        let mut rng = StdRng::seed_from_u64(29);
        let block = random_block(&mut rng);
        assert_eq!(block.parameters()[0].id(), block.init_feedback().id());
        let inputs = crate::sampling::noise_sequences(&[2], 4, &mut rng);
        let res = apply_seqs(&block, &inputs, &mut rng);
        let upstream: Vec<Vec<Vec<f64>>> = vec![vec![vec![1.0, 1.0]; 2]];
        let mut grad = crate::param::Gradient::new(vec![block.init_feedback()]);
        res.propagate_gradient(&upstream, &mut grad);
        let g = grad.get(block.init_feedback().id()).unwrap();
        assert!(g.iter().any(|x| *x != 0.0));
    }
}

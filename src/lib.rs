//! Adversarial training for small feed-forward and recurrent networks.
//!
//! Each GAN in `gan` is a `sgd::Gradienter`: every call to `gradient`
//! advances its schedule by one iteration and returns a gradient covering
//! both networks, of which only the active network's half is nonzero.

pub mod activator;
pub mod cost;
pub mod error;
pub mod gan;
pub mod layers;
pub mod matrix;
pub mod param;
pub mod reward;
pub mod rnn;
pub mod sampling;
pub mod sgd;

mod utils;

#[cfg(test)]
mod testutil;

pub use crate::error::{Error, Result};

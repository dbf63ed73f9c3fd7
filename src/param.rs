//! Trainable parameters and the gradient maps accumulated for them.


use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// A stable handle identifying one `Param` for the lifetime of the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamId(usize);

impl ParamId {
    fn fresh() -> Self {
        ParamId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A mutable vector of trainable values owned by exactly one block.
///
/// Cloning a parameter yields a new, distinct parameter.
#[derive(Debug)]
pub struct Param {
    id: ParamId,
    pub data: Vec<f64>,
}

impl Param {
    pub fn new(data: Vec<f64>) -> Self {
        Param {
            id: ParamId::fresh(),
            data,
        }
    }

    pub fn zeros(len: usize) -> Self {
        Param::new(vec![0.0; len])
    }

    /// Creates a parameter of normally distributed values with the given
    /// standard deviation.
    pub fn random(len: usize, stddev: f64, rng: &mut dyn RngCore) -> Self {
        Param::new(
            (0..len)
                .map(|_| rng.sample::<f64, _>(StandardNormal) * stddev)
                .collect(),
        )
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Clone for Param {
    fn clone(&self) -> Self {
        Param::new(self.data.clone())
    }
}

impl Serialize for Param {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Param {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<f64>::deserialize(deserializer).map(Param::new)
    }
}

/// Gradient accumulators keyed by parameter identity.
///
/// Only parameters passed at construction are tracked; contributions for any
/// other parameter are dropped, which is how a block's parameters are held
/// fixed while gradients flow through it.
#[derive(Clone, Debug, Default)]
pub struct Gradient {
    accumulators: BTreeMap<ParamId, Vec<f64>>,
}

impl Gradient {
    /// Returns zeroed accumulators for each of `params`.
    pub fn new<'a, I>(params: I) -> Self
    where
        I: IntoIterator<Item = &'a Param>,
    {
        let accumulators = params
            .into_iter()
            .map(|p| (p.id(), vec![0.0; p.len()]))
            .collect();
        Gradient { accumulators }
    }

    pub fn len(&self) -> usize {
        self.accumulators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulators.is_empty()
    }

    pub fn contains(&self, id: ParamId) -> bool {
        self.accumulators.contains_key(&id)
    }

    pub fn get(&self, id: ParamId) -> Option<&[f64]> {
        self.accumulators.get(&id).map(|v| v.as_slice())
    }

    /// Returns the accumulator for `param` if it is tracked.
    pub fn get_mut(&mut self, param: &Param) -> Option<&mut [f64]> {
        match self.accumulators.get_mut(&param.id()) {
            Some(acc) => {
                assert_eq!(acc.len(), param.len());
                Some(acc.as_mut_slice())
            }
            None => None,
        }
    }

    /// Adds `delta` into the accumulator for `param`, if it is tracked.
    pub fn accumulate(&mut self, param: &Param, delta: &[f64]) {
        assert_eq!(delta.len(), param.len());
        if let Some(acc) = self.get_mut(param) {
            for (a, d) in acc.iter_mut().zip(delta) {
                *a += d;
            }
        }
    }

    /// Adds every accumulator in `other` into this gradient.
    pub fn merge(&mut self, other: Gradient) {
        for (id, delta) in other.accumulators {
            match self.accumulators.entry(id) {
                btree_map::Entry::Vacant(e) => {
                    e.insert(delta);
                }
                btree_map::Entry::Occupied(mut e) => {
                    let acc = e.get_mut();
                    assert_eq!(acc.len(), delta.len());
                    for (a, d) in acc.iter_mut().zip(delta) {
                        *a += d;
                    }
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamId, &[f64])> {
        self.accumulators.iter().map(|(&id, v)| (id, v.as_slice()))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ParamId, &mut Vec<f64>)> {
        self.accumulators.iter_mut().map(|(&id, v)| (id, v))
    }

    /// Takes one gradient descent step of size `step_size` on every tracked
    /// parameter in `params`.
    pub fn step<'a, I>(&self, params: I, step_size: f64)
    where
        I: IntoIterator<Item = &'a mut Param>,
    {
        for param in params {
            if let Some(g) = self.accumulators.get(&param.id) {
                assert_eq!(g.len(), param.len());
                for (p, g) in param.data.iter_mut().zip(g) {
                    *p -= step_size * g;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_is_additive() {
        let p = Param::zeros(3);
        let mut g = Gradient::new(vec![&p]);
        g.accumulate(&p, &[1.0, 2.0, 3.0]);
        g.accumulate(&p, &[1.0, 1.0, 1.0]);
        assert_eq!(g.get(p.id()).unwrap(), &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn untracked_params_are_ignored() {
        let tracked = Param::zeros(2);
        let frozen = Param::zeros(2);
        let mut g = Gradient::new(vec![&tracked]);
        g.accumulate(&frozen, &[5.0, 5.0]);
        assert!(!g.contains(frozen.id()));
        assert_eq!(g.len(), 1);
    }

    #[test]
    #[should_panic]
    fn length_mismatch_panics() {
        let p = Param::zeros(2);
        let mut g = Gradient::new(vec![&p]);
        g.accumulate(&p, &[1.0]);
    }

    #[test]
    fn merge_adds_shared_keys() {
        let a = Param::zeros(1);
        let b = Param::zeros(1);
        let mut g1 = Gradient::new(vec![&a]);
        g1.accumulate(&a, &[1.0]);
        let mut g2 = Gradient::new(vec![&a, &b]);
        g2.accumulate(&a, &[2.0]);
        g2.accumulate(&b, &[3.0]);
        g1.merge(g2);
        assert_eq!(g1.get(a.id()).unwrap(), &[3.0]);
        assert_eq!(g1.get(b.id()).unwrap(), &[3.0]);
    }

    #[test]
    fn clones_are_distinct() {
        let p = Param::new(vec![1.0]);
        let q = p.clone();
        assert_ne!(p.id(), q.id());
        assert_eq!(p.data, q.data);
    }

    #[test]
    fn step_descends() {
        let mut p = Param::new(vec![1.0, 1.0]);
        let mut g = Gradient::new(vec![&p]);
        g.accumulate(&p, &[1.0, -2.0]);
        g.step(vec![&mut p], 0.5);
        assert_eq!(p.data, vec![0.5, 2.0]);
    }
}

//! Random draws shared by the layers and trainers.

use crate::layers::Squash;

use rand::{Rng, RngCore};
use rand_distr::StandardNormal;

/// Draws an index from the categorical distribution `probs`.
///
/// A uniform value is drawn and each probability is subtracted from it in
/// order; the first index at which the remainder goes negative is chosen.
/// Rounding leftovers fall on the last index.
pub fn choose_index(probs: &[f64], rng: &mut dyn RngCore) -> usize {
    assert!(!probs.is_empty());
    let mut n: f64 = rng.gen();
    for (i, p) in probs.iter().enumerate() {
        n -= p;
        if n < 0.0 {
            return i;
        }
    }
    probs.len() - 1
}

/// Returns a vector of `len` standard normal values.
pub fn noise(len: usize, rng: &mut dyn RngCore) -> Vec<f64> {
    (0..len).map(|_| rng.sample(StandardNormal)).collect()
}

/// Returns one noise sequence per entry of `lengths`.
pub fn noise_sequences(lengths: &[usize], size: usize, rng: &mut dyn RngCore) -> Vec<Vec<Vec<f64>>> {
    lengths
        .iter()
        .map(|&len| (0..len).map(|_| noise(size, rng)).collect())
        .collect()
}

pub fn one_hot(index: usize, len: usize) -> Vec<f64> {
    assert!(index < len);
    let mut v = vec![0.0; len];
    v[index] = 1.0;
    v
}

/// Encodes `symbol` as a noisy near-one-hot vector.
///
/// The symbol's coordinate is set to 5 and every other coordinate to a
/// normal draw shifted by -5; `squash` then maps the result onto a
/// probability-like vector. Real samples encoded this way carry label noise
/// so that the discriminator cannot tell them apart by exact one-hotness.
pub fn soften_symbol(symbol: usize, alphabet: usize, squash: Squash, rng: &mut dyn RngCore) -> Vec<f64> {
    assert!(symbol < alphabet);
    let raw: Vec<f64> = (0..alphabet)
        .map(|i| {
            if i == symbol {
                5.0
            } else {
                rng.sample::<f64, _>(StandardNormal) - 5.0
            }
        })
        .collect();
    squash.apply(&raw)
}

/// Encodes a sequence of symbols with `soften_symbol`.
pub fn soften_sequence(symbols: &[usize], alphabet: usize, squash: Squash, rng: &mut dyn RngCore) -> Vec<Vec<f64>> {
    symbols
        .iter()
        .map(|&s| soften_symbol(s, alphabet, squash, rng))
        .collect()
}

/// Encodes the bytes of `text` with `soften_symbol` over a 256 symbol
/// alphabet.
pub fn soften_text(text: &str, squash: Squash, rng: &mut dyn RngCore) -> Vec<Vec<f64>> {
    let symbols: Vec<usize> = text.bytes().map(usize::from).collect();
    soften_sequence(&symbols, 256, squash, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn choose_index_matches_distribution() {
        let mut rng = StdRng::seed_from_u64(7);
        let probs = [0.1, 0.6, 0.3];
        let trials = 20_000;
        let mut counts = [0usize; 3];
        for _ in 0..trials {
            counts[choose_index(&probs, &mut rng)] += 1;
        }
        for (c, p) in counts.iter().zip(&probs) {
            assert_abs_diff_eq!(*c as f64 / trials as f64, *p, epsilon = 0.02);
        }
    }

    #[test]
    fn choose_index_never_picks_zero_mass() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            assert_eq!(choose_index(&[0.0, 1.0, 0.0], &mut rng), 1);
        }
    }

    #[test]
    fn softened_symbols_favor_the_symbol() {
        let mut rng = StdRng::seed_from_u64(3);
        let v = soften_symbol(2, 5, Squash::Quadratic, &mut rng);
        assert_abs_diff_eq!(v.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        for squash in &[Squash::ScaledTanh(4.0), Squash::Softmax] {
            let v = soften_symbol(2, 5, *squash, &mut rng);
            assert_abs_diff_eq!(v.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
            let best = v
                .iter()
                .enumerate()
                .fold(0, |b, (i, x)| if *x > v[b] { i } else { b });
            assert_eq!(best, 2);
        }
    }

    fn argmax(v: &[f64]) -> usize {
        v.iter()
            .enumerate()
            .fold(0, |b, (i, x)| if *x > v[b] { i } else { b })
    }

    #[test]
    fn softened_text_encodes_bytes() {
        let mut rng = StdRng::seed_from_u64(5);
        let seq = soften_text("hi!", Squash::Softmax, &mut rng);
        assert_eq!(seq.len(), 3);
        let symbols: Vec<usize> = seq.iter().map(|v| argmax(v)).collect();
        assert_eq!(symbols, vec![104, 105, 33]);
        assert!(seq.iter().all(|v| v.len() == 256));

        let seq = soften_sequence(&[0, 3], 4, Squash::Softmax, &mut rng);
        assert_eq!(seq.iter().map(|v| argmax(v)).collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn noise_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let seqs = noise_sequences(&[3, 0, 1], 4, &mut rng);
        assert_eq!(seqs.len(), 3);
        assert_eq!(seqs[0].len(), 3);
        assert!(seqs[1].is_empty());
        assert_eq!(seqs[2][0].len(), 4);
    }
}

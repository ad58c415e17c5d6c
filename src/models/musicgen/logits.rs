//! Logit post-processing for the decoder: classifier-free guidance and
//! seeded top-k sampling.

use half::f16;
use ndarray::{s, Array, Array2, Axis, Ix3, IxDyn};
use ort::tensor::ArrayExtensions;
use ort::value::DynValue;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand_chacha::ChaCha8Rng;

use crate::error::{DaemonError, Result};

/// Guidance scale fixed by the MusicGen recipe.
pub const GUIDANCE_SCALE: f32 = 3.0;

/// Top-k cutoff for sampling.
pub const TOP_K: usize = 250;

/// Sampling temperature. 1.0 leaves the distribution untouched.
pub const TEMPERATURE: f32 = 1.0;

/// One decode step's logits, shape `(batch, vocab)`.
///
/// The decoder runs a 2x batch (conditional rows first, unconditional rows
/// second), so `batch` here is `2 * codebooks` before guidance and
/// `codebooks` after.
pub struct Logits(Array2<f32>);

impl Logits {
    /// Extracts logits from the decoder output tensor, accepting f32 or f16.
    ///
    /// The raw shape is `(batch, decoder_seq_len, vocab)`; the sequence
    /// length of an incremental decode step is always 1 and is squeezed out.
    pub fn from_output(value: &DynValue) -> Result<Self> {
        let (shape, data): (Vec<usize>, Vec<f32>) =
            if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
                (shape.iter().map(|&d| d as usize).collect(), data.to_vec())
            } else if let Ok((shape, data)) = value.try_extract_tensor::<f16>() {
                (
                    shape.iter().map(|&d| d as usize).collect(),
                    data.iter().map(|&v| f32::from(v)).collect(),
                )
            } else {
                return Err(DaemonError::inference("logits must be f32 or f16"));
            };

        let array = Array::from_shape_vec(IxDyn(&shape), data)
            .map_err(|e| DaemonError::inference(format!("bad logits buffer: {e}")))?
            .into_dimensionality::<Ix3>()
            .map_err(|e| DaemonError::inference(format!("expected 3-d logits: {e}")))?;

        Ok(Self(array.remove_axis(Axis(1))))
    }

    #[cfg(test)]
    fn from_array(array: Array2<f32>) -> Self {
        Self(array)
    }

    /// Combines the conditional and unconditional halves of the batch:
    /// `guided = uncond + scale * (cond - uncond)`.
    ///
    /// # Panics
    ///
    /// Panics if the batch dimension is odd.
    pub fn guided(self, scale: f32) -> Self {
        let batch = self.0.dim().0;
        assert!(batch % 2 == 0, "guidance needs an even batch, got {batch}");

        let half = batch / 2;
        let cond = self.0.slice(s![..half, ..]);
        let uncond = self.0.slice(s![half.., ..]);
        Self((cond.into_owned() - uncond) * scale + uncond)
    }

    /// Samples one token per batch row with top-k truncation.
    ///
    /// Logits are tempered, softmaxed, truncated to the `k` most probable
    /// entries, and sampled through the provided seeded generator, so one
    /// seed fixes the whole token sequence.
    pub fn sample_top_k(&self, k: usize, temperature: f32, rng: &mut ChaCha8Rng) -> Vec<i64> {
        let tempered = if temperature != 1.0 && temperature > 0.0 {
            self.0.mapv(|v| v / temperature)
        } else {
            self.0.clone()
        };
        let probs = tempered.softmax(Axis(1));

        let mut sampled = Vec::with_capacity(probs.dim().0);
        for row in probs.axis_iter(Axis(0)) {
            let k = k.min(row.len());
            let mut ranked: Vec<(i64, f32)> = row
                .iter()
                .enumerate()
                .map(|(idx, &p)| (idx as i64, p))
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
            ranked.truncate(k);

            let weights = WeightedIndex::new(ranked.iter().map(|&(_, p)| p.max(f32::MIN_POSITIVE)))
                .expect("top-k probabilities are positive");
            sampled.push(ranked[weights.sample(rng)].0);
        }
        sampled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn guidance_halves_the_batch() {
        let logits = Logits::from_array(array![[10.0, -1.0, 3.0], [-1.0, 1.0, 11.0]]);
        let guided = logits.guided(3.0);
        assert_eq!(guided.0.dim(), (1, 3));
        // uncond + 3 * (cond - uncond): -1 + 3*11 = 32
        assert!((guided.0[[0, 0]] - 32.0).abs() < 1e-5);
    }

    #[test]
    fn scale_one_returns_conditional() {
        let logits = Logits::from_array(array![[2.0, 4.0], [1.0, 1.0]]);
        let guided = logits.guided(1.0);
        assert!((guided.0[[0, 0]] - 2.0).abs() < 1e-5);
        assert!((guided.0[[0, 1]] - 4.0).abs() < 1e-5);
    }

    #[test]
    fn sampling_is_seed_deterministic() {
        let rows = array![[0.1, 0.9, 0.4, 0.2], [0.7, 0.1, 0.6, 0.3]];

        let mut rng_a = ChaCha8Rng::seed_from_u64(7);
        let a = Logits::from_array(rows.clone()).sample_top_k(3, 1.0, &mut rng_a);

        let mut rng_b = ChaCha8Rng::seed_from_u64(7);
        let b = Logits::from_array(rows).sample_top_k(3, 1.0, &mut rng_b);

        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn top_one_is_argmax() {
        let logits = Logits::from_array(array![[0.0, 5.0, 1.0], [9.0, 0.0, 0.0]]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(logits.sample_top_k(1, 1.0, &mut rng), vec![1, 0]);
    }

    #[test]
    fn sampled_ids_stay_in_vocab() {
        let logits = Logits::from_array(Array2::zeros((4, 16)));
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for id in logits.sample_top_k(250, 1.0, &mut rng) {
            assert!((0..16).contains(&id));
        }
    }
}

//! Autoregressive decoder loop with KV caching.
//!
//! The exported model splits into two sessions over the same weights: a
//! first-step session that also computes the encoder-attention caches, and a
//! with-past session that consumes and refreshes the self-attention caches.
//! Each step runs a doubled batch (conditional + unconditional rows) so
//! classifier-free guidance needs a single forward pass.

use std::borrow::Cow;
use std::path::Path;

use half::f16;
use ort::session::{Session, SessionInputValue};
use ort::value::{DynValue, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{DaemonError, Result};
use crate::models::loader::load_session;
use crate::types::{CancelFlag, ModelConfig};

use super::delay_pattern::DelayPattern;
use super::logits::{Logits, GUIDANCE_SCALE, TEMPERATURE, TOP_K};

/// Batch rows per step: 4 codebooks, doubled for guidance.
const BATCH: usize = 8;

pub struct MusicGenDecoder {
    first_step: Session,
    with_past: Session,
    config: ModelConfig,
}

impl std::fmt::Debug for MusicGenDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MusicGenDecoder").finish_non_exhaustive()
    }
}

/// Past key/value tensors threaded through with-past steps.
///
/// Entries are stored in input order: for each layer, decoder key, decoder
/// value, encoder key, encoder value. Encoder entries are computed once by
/// the first step and never change; decoder entries are refreshed from the
/// `present.*` outputs of every step.
struct KvCache {
    entries: Vec<(String, DynValue)>,
    layers: usize,
}

impl KvCache {
    fn from_first_step(
        mut take_output: impl FnMut(&str) -> Option<DynValue>,
        layers: usize,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(layers * 4);
        for layer in 0..layers {
            for slot in ["decoder.key", "decoder.value", "encoder.key", "encoder.value"] {
                let value = take_output(&format!("present.{layer}.{slot}")).ok_or_else(|| {
                    DaemonError::inference(format!("missing present.{layer}.{slot} output"))
                })?;
                entries.push((format!("past_key_values.{layer}.{slot}"), value));
            }
        }
        Ok(Self { entries, layers })
    }

    fn refresh(&mut self, mut take_output: impl FnMut(&str) -> Option<DynValue>) -> Result<()> {
        for layer in 0..self.layers {
            for (offset, slot) in ["decoder.key", "decoder.value"].iter().enumerate() {
                let value = take_output(&format!("present.{layer}.{slot}")).ok_or_else(|| {
                    DaemonError::inference(format!("missing present.{layer}.{slot} output"))
                })?;
                self.entries[layer * 4 + offset].1 = value;
            }
        }
        Ok(())
    }

    fn session_inputs(&self) -> impl Iterator<Item = (Cow<'_, str>, SessionInputValue<'_>)> {
        self.entries
            .iter()
            .map(|(name, value)| (Cow::from(name.as_str()), SessionInputValue::from(value.view())))
    }
}

impl MusicGenDecoder {
    /// Loads `decoder_model.onnx` and `decoder_with_past_model.onnx`.
    pub fn load(
        model_dir: &Path,
        providers: &[ort::execution_providers::ExecutionProviderDispatch],
        threads: Option<u32>,
        config: ModelConfig,
    ) -> Result<Self> {
        let first_step = load_session(&model_dir.join("decoder_model.onnx"), providers, threads)?;
        let with_past = load_session(
            &model_dir.join("decoder_with_past_model.onnx"),
            providers,
            threads,
        )?;
        Ok(Self {
            first_step,
            with_past,
            config,
        })
    }

    /// Generates exactly `frames_wanted` aligned codebook frames.
    ///
    /// `on_frame(done, total)` fires once per aligned frame. The cancel flag
    /// is polled between steps; in-flight session calls are never
    /// interrupted.
    pub fn generate_frames(
        &mut self,
        encoder_hidden_states: DynValue,
        encoder_attention_mask: DynValue,
        frames_wanted: usize,
        seed: u64,
        cancel: &CancelFlag,
        on_frame: &dyn Fn(usize, usize),
    ) -> Result<Vec<[i64; 4]>> {
        let layers = self.config.num_hidden_layers as usize;
        let pad = self.config.pad_token_id;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut buffer = DelayPattern::<4>::new();
        let mut frames: Vec<[i64; 4]> = Vec::with_capacity(frames_wanted);

        // Unconditional rows get zeroed embeddings and a zeroed mask.
        let hidden_states = duplicate_with_zeros(&encoder_hidden_states)?;
        let attention_mask = duplicate_with_zeros_i64(&encoder_attention_mask)?;

        let first_input_ids = Tensor::from_array(([BATCH, 1], vec![pad; BATCH]))
            .map_err(|e| DaemonError::inference(format!("cannot build input_ids: {e}")))?;

        let mut outputs = self
            .first_step
            .run(ort::inputs![
                "encoder_attention_mask" => attention_mask.view(),
                "encoder_hidden_states" => hidden_states.view(),
                "input_ids" => first_input_ids,
            ])
            .map_err(|e| DaemonError::inference(format!("first decoder step failed: {e}")))?;

        let logits = outputs
            .remove("logits")
            .ok_or_else(|| DaemonError::inference("decoder returned no logits"))?;
        buffer.push(
            Logits::from_output(&logits)?
                .guided(GUIDANCE_SCALE)
                .sample_top_k(TOP_K, TEMPERATURE, &mut rng),
        );
        let mut kv_cache = KvCache::from_first_step(|name| outputs.remove(name), layers)?;
        drop(outputs);

        // Three extra warm-up columns cover the delay stagger before the
        // first aligned frame appears.
        let max_columns = frames_wanted + 4;
        while frames.len() < frames_wanted && buffer.len() < max_columns {
            if cancel.is_set() {
                return Err(DaemonError::cancelled());
            }

            let [a, b, c, d] = buffer.next_inputs(pad);
            let input_ids = Tensor::from_array(([BATCH, 1], vec![a, b, c, d, a, b, c, d]))
                .map_err(|e| DaemonError::inference(format!("cannot build input_ids: {e}")))?;

            let mut step_inputs: Vec<(Cow<str>, SessionInputValue)> = vec![
                (
                    Cow::from("input_ids"),
                    SessionInputValue::from(input_ids.view()),
                ),
                (
                    Cow::from("encoder_attention_mask"),
                    SessionInputValue::from(attention_mask.view()),
                ),
            ];
            step_inputs.extend(kv_cache.session_inputs());

            let mut outputs = self
                .with_past
                .run(step_inputs)
                .map_err(|e| DaemonError::inference(format!("decoder step failed: {e}")))?;

            let logits = outputs
                .remove("logits")
                .ok_or_else(|| DaemonError::inference("decoder returned no logits"))?;
            buffer.push(
                Logits::from_output(&logits)?
                    .guided(GUIDANCE_SCALE)
                    .sample_top_k(TOP_K, TEMPERATURE, &mut rng),
            );
            kv_cache.refresh(|name| outputs.remove(name))?;

            if let Some(frame) = buffer.aligned_frame() {
                frames.push(frame);
                on_frame(frames.len(), frames_wanted);
            }
        }

        Ok(frames)
    }
}

/// Doubles a float tensor along the batch axis, zero-filling the second
/// half. The zeros are the unconditional branch for guidance.
fn duplicate_with_zeros(tensor: &DynValue) -> Result<DynValue> {
    if let Ok(doubled) = duplicate_with_zeros_as::<f16>(tensor) {
        return Ok(doubled);
    }
    duplicate_with_zeros_as::<f32>(tensor)
}

fn duplicate_with_zeros_as<T>(tensor: &DynValue) -> Result<DynValue>
where
    T: ort::tensor::PrimitiveTensorElementType + Clone + Default + std::fmt::Debug + 'static,
{
    let (shape, data) = tensor
        .try_extract_tensor::<T>()
        .map_err(|e| DaemonError::inference(format!("cannot extract tensor: {e}")))?;

    let mut doubled_shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    doubled_shape[0] *= 2;

    let mut doubled = data.to_vec();
    doubled.resize(data.len() * 2, T::default());

    Ok(Tensor::from_array((doubled_shape, doubled))
        .map_err(|e| DaemonError::inference(format!("cannot build doubled tensor: {e}")))?
        .into_dyn())
}

fn duplicate_with_zeros_i64(tensor: &DynValue) -> Result<DynValue> {
    let (shape, data) = tensor
        .try_extract_tensor::<i64>()
        .map_err(|e| DaemonError::inference(format!("cannot extract i64 tensor: {e}")))?;

    let mut doubled_shape: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    doubled_shape[0] *= 2;

    let mut doubled = data.to_vec();
    doubled.resize(data.len() * 2, 0);

    Ok(Tensor::from_array((doubled_shape, doubled))
        .map_err(|e| DaemonError::inference(format!("cannot build doubled mask: {e}")))?
        .into_dyn())
}

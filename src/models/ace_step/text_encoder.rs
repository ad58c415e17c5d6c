//! UMT5 prompt encoder for the diffusion back-end.
//!
//! Encodes the prompt into 768-dimensional hidden states. Runs once per
//! generation; the conditional and unconditional (empty prompt) encodings
//! both come from here.

use std::path::Path;

use ndarray::{Array2, Array3};
use ort::session::Session;
use tokenizers::Tokenizer;

use crate::error::{DaemonError, Result};
use crate::models::loader::load_session;

use super::tensors::{i64_tensor, to_array3};

/// Prompt tokens beyond this are truncated.
pub const MAX_TOKENS: usize = 512;

pub struct Umt5TextEncoder {
    tokenizer: Tokenizer,
    session: Session,
}

impl std::fmt::Debug for Umt5TextEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Umt5TextEncoder").finish_non_exhaustive()
    }
}

impl Umt5TextEncoder {
    /// Loads `tokenizer.json` and `text_encoder.onnx`.
    pub fn load(
        model_dir: &Path,
        providers: &[ort::execution_providers::ExecutionProviderDispatch],
        threads: Option<u32>,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| DaemonError::model_load_failed(format!("cannot load tokenizer: {e}")))?;
        let session = load_session(&model_dir.join("text_encoder.onnx"), providers, threads)?;
        Ok(Self { tokenizer, session })
    }

    /// Encodes a prompt. Returns hidden states `(1, seq, 768)` and the
    /// attention mask `(1, seq)`.
    pub fn encode(&mut self, prompt: &str) -> Result<(Array3<f32>, Array2<i64>)> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| DaemonError::inference(format!("tokenization failed: {e}")))?;

        let len = encoding.get_ids().len().min(MAX_TOKENS);
        let ids: Vec<i64> = encoding.get_ids()[..len].iter().map(|&t| t as i64).collect();
        let mask: Vec<i64> = encoding.get_attention_mask()[..len]
            .iter()
            .map(|&m| m as i64)
            .collect();

        let input_ids = i64_tensor(vec![1, len], ids, "input_ids")?;
        let attention = i64_tensor(vec![1, len], mask.clone(), "attention_mask")?;

        let mut outputs = self
            .session
            .run(ort::inputs![input_ids, attention])
            .map_err(|e| DaemonError::inference(format!("UMT5 encoder failed: {e}")))?;

        // single-output model; take whatever it is named
        let key = outputs
            .keys()
            .next()
            .map(|k| k.to_string())
            .ok_or_else(|| DaemonError::inference("UMT5 encoder produced no outputs"))?;
        let hidden = outputs
            .remove(&key)
            .ok_or_else(|| DaemonError::inference("cannot take UMT5 encoder output"))?;

        let hidden_states = to_array3(&hidden, "text hidden states")?;
        let attention_mask = Array2::from_shape_vec((1, len), mask)
            .map_err(|e| DaemonError::inference(format!("cannot build attention mask: {e}")))?;
        Ok((hidden_states, attention_mask))
    }
}
